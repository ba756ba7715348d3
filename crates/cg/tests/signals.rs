#![cfg(unix)]

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use cg::{ExitOutcome, RunConfig, Runner};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tempfile::TempDir;

// SIGTERM is sent to this whole test process, so the tests here take turns.
static SIGNAL_LOCK: Mutex<()> = Mutex::new(());

const TRAP_SCRIPT: &str = r#"trap 'echo "caught TERM" >&2; exit 7' TERM; echo before; : > "$1"; while :; do sleep 0.1; done"#;

/// Runs the trapping script and sends SIGTERM to the supervisor once the trap is installed.
async fn terminate_once_ready(buffered: bool) -> (ExitOutcome, String) {
    let dir = TempDir::new().unwrap();
    let ready = dir.path().join("ready");
    let ready_arg = ready.to_string_lossy().into_owned();
    let config = RunConfig::builder()
        .command(["sh", "-c", TRAP_SCRIPT, "sh", ready_arg.as_str()])
        .buffered(buffered)
        .build()
        .unwrap();
    let runner = Runner::with_prefix(config, Vec::new(), Arc::new(|| "T ".to_string()));

    let terminate = async {
        while !ready.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        kill(Pid::this(), Signal::SIGTERM).unwrap();
    };
    let (result, ()) = tokio::time::timeout(Duration::from_secs(20), async {
        tokio::join!(runner.run(), terminate)
    })
    .await
    .expect("child reacts to the relayed signal");

    let outcome = result.unwrap();
    let out = String::from_utf8(runner.into_output().unwrap()).unwrap();
    (outcome, out)
}

#[tokio::test]
async fn sigterm_is_relayed_to_the_child() {
    let _turn = SIGNAL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let (outcome, out) = terminate_once_ready(false).await;

    assert_eq!(outcome, ExitOutcome::Failure { code: 7 });
    assert!(out.contains("T O: before\n"), "{out}");
    assert!(out.contains("T E: caught TERM\n"), "{out}");
    assert!(out.ends_with("T I: Finished with exitcode 7\n"), "{out}");
}

#[tokio::test]
async fn buffered_output_is_flushed_after_relayed_sigterm() {
    let _turn = SIGNAL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let (outcome, out) = terminate_once_ready(true).await;

    assert_eq!(outcome, ExitOutcome::Failure { code: 7 });
    let stdout_section = out
        .find("T I: --- stdout ---\nT O: before\n")
        .unwrap_or_else(|| panic!("stdout section missing:\n{out}"));
    let stderr_section = out
        .find("T I: --- stderr ---\nT E: caught TERM\n")
        .unwrap_or_else(|| panic!("stderr section missing:\n{out}"));
    assert!(stdout_section < stderr_section, "{out}");
    assert!(out.ends_with("T I: Finished with exitcode 7\n"), "{out}");
}
