//! Shutdown coordination between the serving call and its listeners.

use tokio::sync::watch;

/// Broadcasts a one-shot shutdown signal to every listener and connection.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// The receiving side of [`Shutdown`].
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Completes once shutdown has been triggered, immediately if it already was.
    pub async fn recv(&mut self) {
        // A dropped sender means the serving call is gone, which is a shutdown too.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}
