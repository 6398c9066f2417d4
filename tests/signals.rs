#![cfg(unix)]

use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use closer::{Closer, CloserOptions, Context, Signal};

const WAIT: Duration = Duration::from_secs(5);
const RELEASE_MODE: &str = "CLOSER_RELEASE_MODE";
const SURVIVED: &str = "survived SIGUSR2";

fn raise(signal: libc::c_int) {
    let rc = unsafe { libc::kill(libc::getpid(), signal) };
    assert_eq!(rc, 0, "failed to signal own process");
}

fn count_runs(closer: &Closer, callbacks: usize) -> Arc<AtomicUsize> {
    let runs = Arc::new(AtomicUsize::new(0));
    for _ in 0..callbacks {
        let runs = Arc::clone(&runs);
        closer.add(move |_| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    runs
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_signal_triggers_closer() {
    let options = CloserOptions::new().with_signals([Signal::Interrupt, Signal::Terminate]);
    let (ctx, closer) = Closer::with_options(Context::background(), options).unwrap();
    let runs = count_runs(&closer, 2);

    raise(libc::SIGTERM);

    tokio::time::timeout(WAIT, closer.finished())
        .await
        .expect("SIGTERM should trigger the closer");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(ctx.is_cancelled(), "signal cancels the derived context");
    assert!(closer.err().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn signal_racing_other_triggers_runs_once() {
    // keeps SIGUSR1 subscribed after the racing closer lets go of it
    let (keeper_ctx, _keeper) = Closer::with_options(
        Context::background(),
        CloserOptions::new().with_signals([Signal::User1]),
    )
    .unwrap();

    let (base, cancel) = Context::background().with_cancel();
    let options = CloserOptions::new().with_signals([Signal::User1]);
    let (derived, closer) = Closer::with_options(base, options).unwrap();
    let runs = count_runs(&closer, 5);

    let racer = closer.clone();
    let explicit = tokio::spawn(async move { racer.close_all().await });
    raise(libc::SIGUSR1);
    cancel.cancel();

    tokio::time::timeout(WAIT, explicit)
        .await
        .expect("close_all should return")
        .unwrap();
    tokio::time::timeout(WAIT, closer.finished())
        .await
        .expect("closer should finish");
    tokio::time::timeout(WAIT, keeper_ctx.cancelled())
        .await
        .expect("SIGUSR1 should reach the other listener");

    assert_eq!(runs.load(Ordering::SeqCst), 5);
    assert!(derived.is_cancelled(), "base cancellation reaches the derived context");
}

/// Runs in a child process: after the closer lets go of SIGUSR2, raising it must run the
/// default action and kill the process before it reports surviving.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "spawned as a child process by released_signal_restores_default_action"]
async fn release_then_raise_sigusr2() {
    let Some(mode) = std::env::var_os(RELEASE_MODE) else {
        return;
    };

    let (base, cancel) = Context::background().with_cancel();
    let options = CloserOptions::new().with_signals([Signal::User2]);
    let (_, closer) = Closer::with_options(base, options).unwrap();
    let runs = count_runs(&closer, 1);

    if mode == "cancel" {
        cancel.cancel();
    } else {
        closer.close_all().await;
    }
    tokio::time::timeout(WAIT, closer.finished())
        .await
        .expect("closer should finish");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    drop(closer);

    println!("closer finished");
    raise(libc::SIGUSR2);
    tokio::time::sleep(Duration::from_secs(2)).await;
    println!("{SURVIVED}");
}

#[test]
fn released_signal_restores_default_action() {
    let exe = std::env::current_exe().unwrap();
    for mode in ["close", "cancel"] {
        let output = Command::new(&exe)
            .args(["release_then_raise_sigusr2", "--exact", "--ignored", "--nocapture"])
            .env(RELEASE_MODE, mode)
            .output()
            .unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);

        assert!(
            stdout.contains("closer finished"),
            "{mode}: child did not reach the raise:\n{stdout}"
        );
        assert!(
            !stdout.contains(SURVIVED),
            "{mode}: SIGUSR2 was swallowed after the closer finished"
        );
        assert!(
            !output.status.success(),
            "{mode}: child exited cleanly ({:?}, signal {:?})",
            output.status.code(),
            output.status.signal()
        );
    }
}
