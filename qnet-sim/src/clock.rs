//! Simulated time and the pending-event timeline.

use qnet_core::{EventQueue, EventToken, Message, Scheduler, Time};

use crate::SimulationError;

/// Maximum number of events that can be pending at once.
pub const MAX_EVENT_QUEUE_SIZE: usize = 1_000_000;

/// Timeline of a run.
///
/// Wraps the kernel's event queue so the engine can bound its size and
/// refuse to move time backwards. Time starts at zero and only moves
/// forward; it is independent of wall-clock time.
#[derive(Debug, Default)]
pub struct SimulationClock {
    queue: EventQueue,
    delivered: u64,
}

impl SimulationClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes the next event due at or before `horizon`.
    ///
    /// # Errors
    ///
    /// - `SimulationError::InvalidEventScheduling` - If the next event lies in the past
    pub fn next_until(&mut self, horizon: Time) -> Result<Option<Message>, SimulationError> {
        let Some(due) = self.queue.peek_time() else {
            return Ok(None);
        };
        if due > horizon {
            return Ok(None);
        }
        let now = self.queue.now();
        if due < now {
            return Err(SimulationError::InvalidEventScheduling {
                reason: format!("event due at {due} behind clock at {now}"),
            });
        }
        let Some((_, message)) = self.queue.pop() else {
            return Ok(None);
        };
        self.delivered += 1;
        Ok(Some(message))
    }

    /// Fails once too many events are pending.
    ///
    /// # Errors
    ///
    /// - `SimulationError::EventQueueOverflow` - Event queue is full
    pub fn check_capacity(&self) -> Result<(), SimulationError> {
        if self.queue.len() > MAX_EVENT_QUEUE_SIZE {
            return Err(SimulationError::EventQueueOverflow {
                count: self.queue.len(),
            });
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn cancelled(&self) -> u64 {
        self.queue.cancelled()
    }

    pub fn next_due(&self) -> Option<Time> {
        self.queue.peek_time()
    }
}

impl Scheduler for SimulationClock {
    fn now(&self) -> Time {
        self.queue.now()
    }

    fn schedule(&mut self, message: Message, delay: Time) -> qnet_core::Result<EventToken> {
        self.queue.schedule(message, delay)
    }

    fn cancel(&mut self, token: EventToken) -> bool {
        self.queue.cancel(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qnet_core::{Address, Event, NodeId};

    fn message(node: usize) -> Message {
        let address = Address::input(NodeId(node));
        Message::new(Event::Start, address, address, 0.0)
    }

    #[test]
    fn test_events_stop_at_horizon() {
        let mut clock = SimulationClock::new();
        clock.schedule(message(0), 1.0).unwrap();
        clock.schedule(message(1), 3.0).unwrap();

        assert!(clock.next_until(2.0).unwrap().is_some());
        assert_eq!(clock.now(), 1.0);
        assert!(clock.next_until(2.0).unwrap().is_none());
        assert_eq!(clock.pending(), 1);
        assert_eq!(clock.delivered(), 1);
    }

    #[test]
    fn test_cancelled_events_are_skipped() {
        let mut clock = SimulationClock::new();
        let token = clock.schedule(message(0), 1.0).unwrap();
        clock.schedule(message(1), 2.0).unwrap();
        assert!(clock.cancel(token));

        let next = clock.next_until(5.0).unwrap().unwrap();
        assert_eq!(next.destination.node, NodeId(1));
        assert_eq!(clock.cancelled(), 1);
    }
}
