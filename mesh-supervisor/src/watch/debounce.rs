//! Single-timer debounce feeding a capacity-1 rebuild channel

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Collapses bursts of pokes into one rebuild signal, sent `delay` after the last poke.
///
/// A signal still waiting in the channel is never duplicated.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    tx: mpsc::Sender<()>,
    timer: Option<JoinHandle<()>>,
}

impl Debouncer {
    /// Debouncer with its own rebuild channel
    pub fn new(delay: Duration) -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self::with_sender(delay, tx), rx)
    }

    /// Debouncer sending into an existing channel
    pub fn with_sender(delay: Duration, tx: mpsc::Sender<()>) -> Self {
        Self {
            delay,
            tx,
            timer: None,
        }
    }

    /// (Re)start the timer
    pub fn poke(&mut self) {
        self.cancel();
        let tx = self.tx.clone();
        let delay = self.delay;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.try_send(());
        }));
    }

    /// Drop a pending timer without signalling
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
