use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Quiet period for search boxes.
pub const SEARCH_DELAY: Duration = Duration::from_millis(500);

/// Latest value wins once input has been quiet for `delay`.
///
/// Values pushed with [`Debouncer::push`] come out of the receiver returned
/// by [`Debouncer::new`]. Dropping the debouncer drops a pending value and
/// closes the receiver.
#[derive(Debug)]
pub struct Debouncer<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Debouncer<T> {
    pub fn new(delay: Duration) -> (Self, mpsc::Receiver<T>) {
        let (tx, mut rx) = watch::channel(None::<T>);
        let (out_tx, out_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            // Each outer turn waits for the first push of a burst
            while rx.changed().await.is_ok() {
                loop {
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(delay) => break,
                    }
                }
                let value = rx.borrow_and_update().clone();
                if let Some(value) = value {
                    if out_tx.send(value).await.is_err() {
                        return;
                    }
                }
            }
        });

        (Debouncer { tx }, out_rx)
    }

    pub fn push(&self, value: T) {
        self.tx.send_replace(Some(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bursts_collapse_to_the_last_value() {
        let (debouncer, mut out) = Debouncer::new(SEARCH_DELAY);
        debouncer.push("t".to_string());
        tokio::time::sleep(Duration::from_millis(100)).await;
        debouncer.push("ta".to_string());
        tokio::time::sleep(Duration::from_millis(100)).await;
        debouncer.push("tas".to_string());

        assert_eq!(out.recv().await.as_deref(), Some("tas"));
        assert!(out.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_each_emit() {
        let (debouncer, mut out) = Debouncer::new(Duration::from_millis(50));
        debouncer.push(1);
        assert_eq!(out.recv().await, Some(1));
        debouncer.push(2);
        assert_eq!(out.recv().await, Some(2));

        drop(debouncer);
        assert_eq!(out.recv().await, None);
    }
}
