use std::future::Future;

use tokio::task::JoinHandle;
use tracing::warn;

/// Fire-and-forget: run `future` on the runtime and only log its failure.
///
/// The handle is returned for tests; callers normally drop it.
pub fn spawn_detached<F>(label: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = future.await {
            warn!(task = label, error = %e, "Detached task failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failure_does_not_reach_the_caller() {
        let handle = spawn_detached("boom", async { Err(anyhow::anyhow!("boom")) });
        assert!(handle.await.is_ok());
    }
}
