//! Protocol events and the queues that carry them from interrupt context
//! to the poll loop.
//!
//! Producers (the transport framers and the response timer) hold a clone of
//! the `Arc<dyn EventQueue>` handed to the engine. The engine is the only
//! consumer.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Events consumed by [`crate::engine::Engine::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The transport finished its start-up gap and is ready to receive
    Ready,
    /// A complete frame is buffered in the transport
    FrameReceived,
    /// The received frame should be handed to its function handler
    Execute,
    /// The transport has shifted out the last byte of a request
    FrameSent,
    /// The response turnaround timer expired
    Timeout,
}

/// Event queue contract shared by the port layer and the engine
pub trait EventQueue: Send + Sync {
    /// Prepares the queue for use. Returns `false` if it cannot be created.
    fn init(&self) -> bool;
    /// Stores an event. Returns `false` if the event was dropped.
    fn post(&self, event: Event) -> bool;
    /// Removes the oldest pending event, if any.
    fn try_get(&self) -> Option<Event>;
}

pub const FIFO_DEFAULT_CAPACITY: usize = 16;

/// Bounded FIFO queue
#[derive(Debug)]
pub struct FifoQueue {
    events: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl FifoQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl Default for FifoQueue {
    fn default() -> Self {
        Self::new(FIFO_DEFAULT_CAPACITY)
    }
}

impl EventQueue for FifoQueue {
    fn init(&self) -> bool {
        if self.capacity == 0 {
            return false;
        }
        self.events.lock().clear();
        true
    }

    fn post(&self, event: Event) -> bool {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            return false;
        }
        events.push_back(event);
        true
    }

    fn try_get(&self) -> Option<Event> {
        self.events.lock().pop_front()
    }
}

/// Queue holding at most one pending event. A newer post replaces an
/// event that has not been consumed yet.
#[derive(Debug, Default)]
pub struct SingleSlotQueue {
    slot: Mutex<Option<Event>>,
}

impl SingleSlotQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventQueue for SingleSlotQueue {
    fn init(&self) -> bool {
        *self.slot.lock() = None;
        true
    }

    fn post(&self, event: Event) -> bool {
        *self.slot.lock() = Some(event);
        true
    }

    fn try_get(&self) -> Option<Event> {
        self.slot.lock().take()
    }
}
