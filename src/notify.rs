//! A stop signal from a controlling handle to a background task.
//!
//! The signal fires when [`Trigger::fire`] is called or when the [`Trigger`] is dropped,
//! so a background task never outlives the handle that controls it.

use tokio::sync::watch;

/// The controlling half. Held by whoever owns the background task.
#[derive(Debug)]
pub(crate) struct Trigger(Option<watch::Receiver<()>>);

impl Trigger {
    pub(crate) fn fire(&mut self) {
        if self.0.take().is_some() {
            tracing::trace!("stop signal fired");
        }
    }
}

/// The observing half. Held by the background task.
#[derive(Debug)]
pub(crate) struct Signal(watch::Sender<()>);

impl Signal {
    /// Resolves once the trigger has fired. Resolves immediately if it already has.
    pub(crate) async fn fired(&self) {
        self.0.closed().await;
    }
}

pub(crate) fn channel() -> (Trigger, Signal) {
    let (tx, rx) = watch::channel(());
    (Trigger(Some(rx)), Signal(tx))
}
