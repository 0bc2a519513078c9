//! Shutdown coordination for a dispatcher stack.

use std::time::Duration;

use crate::dispatcher::Dispatcher;

/// How a shutdown finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every accepted request settled before the deadline.
    Graceful,
    /// The deadline passed (or close failed) and outstanding work was destroyed.
    Forced,
}

/// Close `dispatcher`, destroying it if it has not drained within `grace`.
pub async fn shutdown(dispatcher: &dyn Dispatcher, grace: Duration) -> ShutdownOutcome {
    let stats = dispatcher.stats();
    tracing::info!(
        dispatcher = %dispatcher.id(),
        outstanding = stats.size,
        grace_ms = grace.as_millis() as u64,
        "Shutting down"
    );

    match tokio::time::timeout(grace, dispatcher.close()).await {
        Ok(Ok(())) => {
            tracing::info!(dispatcher = %dispatcher.id(), "Shutdown complete");
            ShutdownOutcome::Graceful
        }
        Ok(Err(err)) => {
            tracing::warn!(dispatcher = %dispatcher.id(), error = %err, "Close failed, destroying");
            dispatcher.destroy(None).await;
            ShutdownOutcome::Forced
        }
        Err(_) => {
            tracing::warn!(
                dispatcher = %dispatcher.id(),
                outstanding = dispatcher.stats().size,
                "Grace period elapsed, destroying"
            );
            dispatcher.destroy(None).await;
            ShutdownOutcome::Forced
        }
    }
}
