use tokio::sync::{mpsc, Mutex};

/// Single-subscriber notification slot.
///
/// `subscribe` replaces any previous subscriber; the old receiver simply stops
/// getting values. Notifications without a subscriber are dropped.
pub struct Listener<T> {
  slot: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

impl<T> Default for Listener<T> {
  fn default() -> Self {
    Self { slot: Mutex::new(None) }
  }
}

impl<T> Listener<T> {
  pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
    let (tx, rx) = mpsc::unbounded_channel();
    *self.slot.lock().await = Some(tx);
    rx
  }

  pub async fn notify(&self, value: T) {
    let mut slot = self.slot.lock().await;
    if let Some(tx) = slot.as_ref() {
      if tx.send(value).is_err() {
        *slot = None;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn resubscribe_replaces_previous_receiver() {
    let listener = Listener::default();
    let mut first = listener.subscribe().await;
    listener.notify(1).await;
    let mut second = listener.subscribe().await;
    listener.notify(2).await;

    assert_eq!(first.recv().await, Some(1));
    assert_eq!(first.recv().await, None);
    assert_eq!(second.recv().await, Some(2));
  }
}
