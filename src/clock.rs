// Lamport's logical clock, the substrate every other component stamps its
// events with. The three rules: advance before a local event, advance before
// a send, and on receive jump past both the local value and the received one.
// The counter is atomic so the protocol session, the workload loop and the
// transport tasks can all observe it without coordination.

use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

pub type Timestamp = u64;

#[derive(Debug, Default)]
pub struct LamportClock(AtomicU64);

impl LamportClock {
    pub fn new(initial: Timestamp) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Advance for a local event, returning the new value.
    pub fn tick(&self) -> Timestamp {
        self.0.fetch_add(1, SeqCst) + 1
    }

    /// Advance before sending a message. Identical to `tick`; the name keeps
    /// call sites honest about which rule they are applying.
    pub fn send_event(&self) -> Timestamp {
        self.tick()
    }

    /// Merge with the timestamp carried by a received message: the clock
    /// becomes `max(local, received) + 1`.
    pub fn receive_event(&self, received: Timestamp) -> Timestamp {
        match self
            .0
            .fetch_update(SeqCst, SeqCst, |t| Some(t.max(received) + 1))
        {
            Ok(previous) => previous.max(received) + 1,
            Err(_) => unreachable!(),
        }
    }

    /// Observe without advancing.
    pub fn get(&self) -> Timestamp {
        self.0.load(SeqCst)
    }
}
