// Gossip dissemination queue
//
// Accepted state declarations are piggybacked on outgoing datagrams until
// each has been transmitted `retransmit_mult * ceil(log10(n + 1))` times.
// Messages with the fewest transmits are drained first so fresh news spreads
// before old news is retired.

use crate::message::Message;
use parking_lot::Mutex;

struct QueuedBroadcast {
    /// Subject of the declaration; a newer declaration about the same
    /// member invalidates the queued one
    name: String,
    message: Message,
    transmits: u32,
}

/// Retransmit-limited broadcast queue
pub struct BroadcastQueue {
    retransmit_mult: u32,
    queue: Mutex<Vec<QueuedBroadcast>>,
}

impl BroadcastQueue {
    pub fn new(retransmit_mult: u32) -> Self {
        Self {
            retransmit_mult,
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a declaration about `name`, replacing any pending
    /// declaration about the same member.
    pub fn queue(&self, name: &str, message: Message) {
        let mut queue = self.queue.lock();
        queue.retain(|entry| entry.name != name);
        queue.push(QueuedBroadcast {
            name: name.to_string(),
            message,
            transmits: 0,
        });
    }

    /// Drain up to `max` messages for one outgoing datagram. `n` is the
    /// current cluster size, which scales the retransmit limit. Entries
    /// reaching their limit are retired after this transmission.
    pub fn pop(&self, n: usize, max: usize) -> Vec<Message> {
        let mut queue = self.queue.lock();
        if queue.is_empty() || max == 0 {
            return Vec::new();
        }

        let limit = retransmit_limit(self.retransmit_mult, n);
        queue.sort_by_key(|entry| entry.transmits);

        let mut drained = Vec::with_capacity(max.min(queue.len()));
        for entry in queue.iter_mut().take(max) {
            entry.transmits += 1;
            drained.push(entry.message.clone());
        }
        queue.retain(|entry| entry.transmits < limit);
        drained
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// Number of times a broadcast is transmitted before it is retired.
pub fn retransmit_limit(retransmit_mult: u32, n: usize) -> u32 {
    let scale = ((n + 1) as f64).log10().ceil() as u32;
    retransmit_mult * scale
}
