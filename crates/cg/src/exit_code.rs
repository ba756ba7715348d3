use std::{io, process::ExitStatus};

use thiserror::Error;

/// Ways a child can fail to succeed, as seen by the exit-code mapping.
#[derive(Debug, Error)]
pub enum ChildError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("child exited with {0}")]
    Exited(ExitStatus),
}

/// Terminal result of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failure { code: i32 },
}

impl ExitOutcome {
    pub fn from_code(code: i32) -> Self {
        if code == 0 {
            ExitOutcome::Success
        } else {
            ExitOutcome::Failure { code }
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ExitOutcome::Success => 0,
            ExitOutcome::Failure { code } => code,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ExitOutcome::Success)
    }
}

/// Maps a spawn/wait failure to a conventional exit code.
///
/// `None` is 0. Command not found is 127, permission denied on exec is 126, other path
/// resolution failures are 127, a child that exited keeps its own exit code, and everything
/// else (including death by signal) is 1.
pub fn exit_code_from_error(err: Option<&ChildError>) -> i32 {
    match err {
        None => 0,
        Some(ChildError::Spawn { source, .. }) => spawn_error_code(source),
        Some(ChildError::Exited(status)) => status_code(*status),
    }
}

fn spawn_error_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::NotFound => 127,
        io::ErrorKind::PermissionDenied => 126,
        _ if is_path_resolution_error(err) => 127,
        _ => 1,
    }
}

#[cfg(unix)]
fn is_path_resolution_error(err: &io::Error) -> bool {
    use nix::errno::Errno;

    let Some(code) = err.raw_os_error() else {
        return false;
    };
    [Errno::ENOENT, Errno::ENOTDIR, Errno::ENAMETOOLONG, Errno::ELOOP]
        .iter()
        .any(|errno| *errno as i32 == code)
}

#[cfg(not(unix))]
fn is_path_resolution_error(_err: &io::Error) -> bool {
    false
}

/// A child that ran keeps its own exit code. One killed by a signal has none and counts as a
/// generic failure; the `Finished with signal` line reports the signal itself.
pub(crate) fn status_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// The signal that killed the child, if it died from one.
#[cfg(unix)]
pub(crate) fn terminating_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
pub(crate) fn terminating_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_error(source: io::Error) -> ChildError {
        ChildError::Spawn {
            program: "nosuchcmd".to_string(),
            source,
        }
    }

    #[test]
    fn no_error_is_zero() {
        assert_eq!(exit_code_from_error(None), 0);
    }

    #[test]
    fn spawn_errors_map_to_shell_conventions() {
        let not_found = spawn_error(io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(exit_code_from_error(Some(&not_found)), 127);

        let denied = spawn_error(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(exit_code_from_error(Some(&denied)), 126);

        let generic = spawn_error(io::Error::other("something broke"));
        assert_eq!(exit_code_from_error(Some(&generic)), 1);
    }

    #[cfg(unix)]
    #[test]
    fn path_resolution_errnos_are_not_found() {
        let not_dir = spawn_error(io::Error::from_raw_os_error(nix::errno::Errno::ENOTDIR as i32));
        assert_eq!(exit_code_from_error(Some(&not_dir)), 127);

        let eacces = spawn_error(io::Error::from_raw_os_error(nix::errno::Errno::EACCES as i32));
        assert_eq!(exit_code_from_error(Some(&eacces)), 126);
    }

    #[cfg(unix)]
    #[test]
    fn exited_children_keep_their_code() {
        use std::os::unix::process::ExitStatusExt;

        let exited = ChildError::Exited(ExitStatus::from_raw(42 << 8));
        assert_eq!(exit_code_from_error(Some(&exited)), 42);

        let killed = ExitStatus::from_raw(9);
        assert_eq!(terminating_signal(killed), Some(9));
        assert_eq!(exit_code_from_error(Some(&ChildError::Exited(killed))), 1);
    }

    #[test]
    fn outcome_from_code() {
        assert_eq!(ExitOutcome::from_code(0), ExitOutcome::Success);
        assert_eq!(ExitOutcome::from_code(3), ExitOutcome::Failure { code: 3 });
        assert_eq!(ExitOutcome::Failure { code: 3 }.code(), 3);
        assert!(ExitOutcome::Success.is_success());
    }
}
