use eyre::WrapErr;
use tokio::task::JoinHandle;

#[derive(Clone, Default)]
pub struct Graceful {
    cancel: tokio_util::sync::CancellationToken,
    tracker: tokio_util::task::TaskTracker,
}

impl Graceful {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[track_caller]
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Waits for ctrl-c, then cancels every tracked task and waits for
    /// them to drain, giving up after a bounded number of checks.
    pub async fn shutdown(&self) -> eyre::Result<()> {
        tokio::signal::ctrl_c()
            .await
            .wrap_err_with(|| "failed to get ctrl-c signal handler")?;

        tracing::info!("Received ctrl-c signal, shutting down.");
        tracing::debug!("Pending tasks: {}", self.tracker.len());

        self.cancel.cancel();
        self.tracker.close();

        let mut count = 0;
        loop {
            tokio::select! {
                _ = self.tracker.wait() => {
                    tracing::info!("All tasks have exited.");
                    break;
                }
                _ = tokio::time::sleep(std::time::Duration::from_secs(3)) => {
                    count += 1;
                    if count > 10 {
                        eprintln!("Timeout expired, {} pending tasks. Exiting...", self.tracker.len());
                        break;
                    }
                    tracing::debug!("Pending tasks: {}", self.tracker.len());
                }
            }
        }

        Ok(())
    }
}
