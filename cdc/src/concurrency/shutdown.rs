use tokio::sync::watch;

/// Receiver side of the shutdown channel.
///
/// A change notification means shutdown was requested.
pub type ShutdownRx = watch::Receiver<()>;

/// Sending side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    pub fn wrap(tx: watch::Sender<()>) -> Self {
        Self(tx)
    }

    /// Notifies every subscriber. Fails only when no subscriber is left.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    /// Returns a receiver which observes shutdown requests made after this call.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Outcome of an operation that can be interrupted by shutdown.
///
/// `I` carries whatever was produced before the interruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult<T, I> {
    Ok(T),
    Shutdown(I),
}

impl<T, I> ShutdownResult<T, I> {
    pub fn should_shutdown(&self) -> bool {
        matches!(self, ShutdownResult::Shutdown(_))
    }
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx::wrap(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_shutdown() {
        let (shutdown_tx, _) = create_shutdown_channel();
        let mut first = shutdown_tx.subscribe();
        let mut second = shutdown_tx.subscribe();

        assert!(!first.has_changed().unwrap());
        shutdown_tx.shutdown().unwrap();

        first.changed().await.unwrap();
        second.changed().await.unwrap();
    }

    #[test]
    fn shutdown_without_subscribers_fails() {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        drop(shutdown_rx);

        assert!(shutdown_tx.shutdown().is_err());
    }
}
