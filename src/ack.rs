// Probe correlation: sequence numbers and outstanding ack handlers
//
// Every probe carries a fresh sequence number; the registry maps it to a
// handler fired when the matching ack arrives. Expired entries are reaped
// without firing so a late ack is silently discarded.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// What to do when the ack for a registered sequence number arrives
pub enum AckHandler {
    /// Complete a one-shot wait (used by the direct probe)
    Notify(oneshot::Sender<()>),

    /// Run a callback (used by indirect-probe relays)
    Callback(Box<dyn FnOnce() + Send>),
}

/// Tracks outstanding probes by sequence number.
///
/// Invocation is single-shot: the handler is removed under the lock before
/// it fires, so no ack is ever delivered twice.
pub struct AckRegistry {
    sequence: AtomicU32,
    handlers: Arc<Mutex<HashMap<u32, AckHandler>>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Allocate the next sequence number. Wraparound is tolerated because
    /// entries are short-lived.
    pub fn next_seqno(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Current value of the sequence counter
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Register a handler for `seqno`. After `timeout` the entry is reaped
    /// without firing; the prober observes the missing ack on its own.
    pub fn register(&self, seqno: u32, handler: AckHandler, timeout: Duration) {
        self.handlers.lock().insert(seqno, handler);

        let handlers = Arc::clone(&self.handlers);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            handlers.lock().remove(&seqno);
        });
    }

    /// Fire and remove the handler for `seqno`. Unknown sequence numbers
    /// are a no-op.
    pub fn invoke(&self, seqno: u32) {
        let handler = self.handlers.lock().remove(&seqno);
        match handler {
            Some(AckHandler::Notify(tx)) => {
                let _ = tx.send(());
            }
            Some(AckHandler::Callback(callback)) => callback(),
            None => tracing::trace!(seqno, "ack with no outstanding handler"),
        }
    }

    /// Whether a handler is outstanding for `seqno`
    pub fn contains(&self, seqno: u32) -> bool {
        self.handlers.lock().contains_key(&seqno)
    }

    /// Drop all outstanding handlers without firing them
    pub fn clear(&self) {
        self.handlers.lock().clear();
    }
}

impl Default for AckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn next_seqno_counts_from_one() {
        let registry = AckRegistry::new();
        assert_eq!(registry.next_seqno(), 1);
        assert_eq!(registry.next_seqno(), 2);
        assert_eq!(registry.sequence(), 2);
    }

    #[tokio::test]
    async fn expired_entry_is_reaped_without_firing() {
        let registry = AckRegistry::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        registry.register(
            0,
            AckHandler::Callback(Box::new(move || flag.store(true, Ordering::SeqCst))),
            Duration::from_millis(10),
        );
        assert!(registry.contains(0));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!registry.contains(0));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn invoke_fires_callback_once() {
        let registry = AckRegistry::new();

        // unknown seqno is a no-op
        registry.invoke(0);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        registry.register(
            0,
            AckHandler::Callback(Box::new(move || flag.store(true, Ordering::SeqCst))),
            Duration::from_millis(10),
        );

        registry.invoke(0);
        assert!(fired.load(Ordering::SeqCst));
        assert!(!registry.contains(0));
    }

    #[tokio::test]
    async fn invoke_completes_notify_channel() {
        let registry = AckRegistry::new();
        let (tx, rx) = oneshot::channel();
        registry.register(0, AckHandler::Notify(tx), Duration::from_millis(10));

        registry.invoke(0);
        assert!(rx.await.is_ok());
        assert!(!registry.contains(0));
    }

    #[tokio::test]
    async fn clear_drops_handlers_without_firing() {
        let registry = AckRegistry::new();
        let (tx, rx) = oneshot::channel();
        registry.register(7, AckHandler::Notify(tx), Duration::from_secs(10));

        registry.clear();
        assert!(!registry.contains(7));
        assert!(rx.await.is_err());
    }
}
