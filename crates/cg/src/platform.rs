//! Process-group creation and signal relay.
//!
//! On Unix the child leads its own process group and SIGINT/SIGTERM received by the supervisor
//! are forwarded to that whole group. Other platforms get no process group and the relay only
//! logs; signalling the child there is left to the console.

use std::io;

use tokio::{process::Command, sync::oneshot, task::JoinHandle};
use tracing::debug;

/// Places the child in a new process group whose id equals its pid.
#[cfg(unix)]
pub(crate) fn configure_process_group(command: &mut Command) {
    command.process_group(0);
}

#[cfg(not(unix))]
pub(crate) fn configure_process_group(_command: &mut Command) {}

/// Forwards termination signals to the child's process group until stopped.
#[derive(Debug)]
pub(crate) struct SignalRelay {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SignalRelay {
    #[cfg(unix)]
    pub(crate) fn start(pgid: u32) -> io::Result<Self> {
        use nix::sys::signal::Signal;
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let (stop, mut stopped) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                let sig = tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    Some(()) = interrupt.recv() => Signal::SIGINT,
                    Some(()) = terminate.recv() => Signal::SIGTERM,
                    else => break,
                };
                kill_group(pgid, sig);
            }
        });

        Ok(Self { stop, task })
    }

    #[cfg(not(unix))]
    pub(crate) fn start(pgid: u32) -> io::Result<Self> {
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = stopped.await;
            debug!(pgid, "signal relay unsupported on this platform");
        });
        Ok(Self { stop, task })
    }

    /// Unsubscribes; no signal is relayed once this returns.
    pub(crate) async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(err) = self.task.await {
            debug!(%err, "signal relay task ended abnormally");
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32, sig: nix::sys::signal::Signal) {
    use nix::{sys::signal::killpg, unistd::Pid};

    let Ok(raw) = i32::try_from(pgid) else {
        tracing::warn!(pgid, "process group id out of range");
        return;
    };
    match killpg(Pid::from_raw(raw), sig) {
        Ok(()) => debug!(pgid, signal = ?sig, "relayed signal to child process group"),
        Err(errno) => tracing::warn!(pgid, signal = ?sig, %errno, "failed to relay signal"),
    }
}
