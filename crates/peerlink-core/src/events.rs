//! Fan-out of session and transfer events to subscribers.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

/// Set of event subscribers; disconnected receivers are pruned on emit
pub(crate) struct Subscribers<T> {
    senders: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> Subscribers<T> {
    pub(crate) fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = unbounded();
        self.senders.lock().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: T) {
        self.senders
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl<T> std::fmt::Debug for Subscribers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.senders.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_all_and_prunes() {
        let subs = Subscribers::new();
        let a = subs.subscribe();
        let b = subs.subscribe();
        subs.emit(1u32);
        assert_eq!(a.try_recv(), Ok(1));
        assert_eq!(b.try_recv(), Ok(1));

        drop(b);
        subs.emit(2);
        assert_eq!(a.try_recv(), Ok(2));
        assert_eq!(subs.senders.lock().len(), 1);
    }
}
