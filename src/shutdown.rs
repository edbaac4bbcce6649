use tokio::sync::{broadcast, watch};

pub type ShutdownSender = broadcast::Sender<()>;
pub type ShutdownReceiver = broadcast::Receiver<()>;

/// One-shot stop broadcast. Once triggered it stays triggered; every
/// [`StopListener`] observes it, including ones subscribed afterwards.
#[derive(Debug)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
}

/// Receiving side of a [`StopSignal`]. Dropping the signal counts as a stop.
#[derive(Debug, Clone)]
pub struct StopListener {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    #[must_use]
    pub fn new() -> (Self, StopListener) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, StopListener { rx })
    }

    pub fn trigger(&self) {
        self.tx.send_modify(|stopped| *stopped = true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopListener {
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the signal fires or its owner goes away.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
