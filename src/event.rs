// Membership event notification
//
// Subscribers receive snapshot copies of the affected member through bounded
// channels. A slow subscriber loses events rather than stalling the state
// machine.

use crate::node::Member;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// A change in the membership view
#[derive(Debug, Clone)]
pub enum MemberEvent {
    /// A previously unknown member was added
    Join(Member),

    /// A member was declared dead or left gracefully
    Leave(Member),

    /// An existing member changed state or metadata
    Update(Member),
}

/// Fan-out hub for membership notifications.
///
/// Each call to one of the `subscribe_*` methods opens an independent bounded
/// channel; publishing walks the subscriber list and drops the event for any
/// channel that is full.
pub struct EventBus {
    buffer: usize,
    join: Mutex<Vec<mpsc::Sender<Member>>>,
    leave: Mutex<Vec<mpsc::Sender<Member>>>,
    update: Mutex<Vec<mpsc::Sender<Member>>>,
    all: Mutex<Vec<mpsc::Sender<MemberEvent>>>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer,
            join: Mutex::new(Vec::new()),
            leave: Mutex::new(Vec::new()),
            update: Mutex::new(Vec::new()),
            all: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to join notifications
    pub fn subscribe_join(&self) -> mpsc::Receiver<Member> {
        Self::subscribe(&self.join, self.buffer)
    }

    /// Subscribe to leave notifications
    pub fn subscribe_leave(&self) -> mpsc::Receiver<Member> {
        Self::subscribe(&self.leave, self.buffer)
    }

    /// Subscribe to update notifications
    pub fn subscribe_update(&self) -> mpsc::Receiver<Member> {
        Self::subscribe(&self.update, self.buffer)
    }

    /// Subscribe to all three notification kinds on one channel
    pub fn subscribe_all(&self) -> mpsc::Receiver<MemberEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.all.lock().push(tx);
        rx
    }

    pub(crate) fn publish_join(&self, member: &Member) {
        Self::publish(&self.join, member);
        self.publish_event(MemberEvent::Join(member.clone()));
    }

    pub(crate) fn publish_leave(&self, member: &Member) {
        Self::publish(&self.leave, member);
        self.publish_event(MemberEvent::Leave(member.clone()));
    }

    pub(crate) fn publish_update(&self, member: &Member) {
        Self::publish(&self.update, member);
        self.publish_event(MemberEvent::Update(member.clone()));
    }

    /// Drop all subscriber channels, closing the receiving ends.
    pub(crate) fn close(&self) {
        self.join.lock().clear();
        self.leave.lock().clear();
        self.update.lock().clear();
        self.all.lock().clear();
    }

    fn publish_event(&self, event: MemberEvent) {
        let mut subscribers = self.all.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn subscribe(list: &Mutex<Vec<mpsc::Sender<Member>>>, buffer: usize) -> mpsc::Receiver<Member> {
        let (tx, rx) = mpsc::channel(buffer);
        list.lock().push(tx);
        rx
    }

    fn publish(list: &Mutex<Vec<mpsc::Sender<Member>>>, member: &Member) {
        let mut subscribers = list.lock();
        subscribers.retain(|tx| match tx.try_send(member.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(member = %member.name, "dropping event for slow subscriber");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}
