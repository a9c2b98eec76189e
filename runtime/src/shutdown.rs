//! Shutdown signalling shared by the background tasks.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};

/// Resolve once shutdown is requested or the sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *shutdown.borrow_and_update();
        if stopped || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Await `tasks` until `deadline`, aborting the ones still running.
///
/// Returns the number of aborted tasks.
pub(crate) async fn join_until(
    tasks: impl IntoIterator<Item = JoinHandle<()>>,
    deadline: Instant,
) -> usize {
    let mut aborted = 0;
    for mut task in tasks {
        match timeout_at(deadline, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(error = %err, "Background task failed");
            }
            Err(_) => {
                task.abort();
                aborted += 1;
            }
        }
    }
    aborted
}

/// Deadline `grace` from now.
pub(crate) fn deadline_after(grace: Duration) -> Instant {
    Instant::now() + grace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_when_flag_is_set() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        wait_for_shutdown(&mut rx).await;
    }

    #[tokio::test]
    async fn resolves_when_sender_is_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        wait_for_shutdown(&mut rx).await;
    }

    #[tokio::test]
    async fn slow_tasks_are_aborted_at_the_deadline() {
        let quick = tokio::spawn(async {});
        let slow = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let aborted = join_until([quick, slow], deadline_after(Duration::from_millis(50))).await;
        assert_eq!(aborted, 1);
    }
}
