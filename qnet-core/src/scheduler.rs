//! Cancellable event timeline.
//!
//! Events are ordered by time, then by scheduling sequence, so events at the
//! same instant are delivered FIFO. Scheduling hands back an [`EventToken`]
//! that is consumed by [`Scheduler::cancel`]; the token is neither `Copy`
//! nor `Clone`, so a second cancel of the same event cannot be expressed.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::{KernelError, Result};
use crate::event::Message;
use crate::Time;

/// Key for ordering events in the queue.
#[derive(Debug, Clone, Copy)]
pub struct EventKey {
    /// When this event should be processed.
    pub time: Time,
    /// Sequence number for deterministic FIFO ordering.
    pub sequence: u64,
}

impl PartialEq for EventKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EventKey {}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.time.total_cmp(&other.time) {
            Ordering::Equal => self.sequence.cmp(&other.sequence),
            ord => ord,
        }
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Proof of a scheduled event, redeemable once for cancellation.
#[derive(Debug, PartialEq, Eq)]
pub struct EventToken {
    key: EventKey,
}

impl EventToken {
    /// Time at which the event is due.
    pub fn due(&self) -> Time {
        self.key.time
    }
}

/// Timeline abstraction used by stations.
pub trait Scheduler {
    /// Current simulated time.
    fn now(&self) -> Time;

    /// Schedules `message` for delivery after `delay`.
    ///
    /// # Errors
    ///
    /// - `KernelError::NegativeDelay` - If `delay` is negative or not a number
    fn schedule(&mut self, message: Message, delay: Time) -> Result<EventToken>;

    /// Cancels a scheduled event. Returns `false` if it was already delivered.
    fn cancel(&mut self, token: EventToken) -> bool;
}

/// BTreeMap-backed event queue.
#[derive(Debug, Default)]
pub struct EventQueue {
    now: Time,
    sequence: u64,
    queue: BTreeMap<EventKey, Message>,
    cancelled: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Removes the earliest event and advances time to it.
    pub fn pop(&mut self) -> Option<(Time, Message)> {
        let (key, message) = self.queue.pop_first()?;
        self.now = key.time;
        Some((key.time, message))
    }

    /// Time of the earliest pending event.
    pub fn peek_time(&self) -> Option<Time> {
        self.queue.first_key_value().map(|(k, _)| k.time)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of successful cancellations.
    pub fn cancelled(&self) -> u64 {
        self.cancelled
    }
}

impl Scheduler for EventQueue {
    fn now(&self) -> Time {
        self.now
    }

    fn schedule(&mut self, message: Message, delay: Time) -> Result<EventToken> {
        if delay.is_nan() || delay < 0.0 {
            return Err(KernelError::NegativeDelay { delay });
        }
        let key = EventKey {
            time: self.now + delay,
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.queue.insert(key, message);
        Ok(EventToken { key })
    }

    fn cancel(&mut self, token: EventToken) -> bool {
        let removed = self.queue.remove(&token.key).is_some();
        if removed {
            self.cancelled += 1;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Address, Event};
    use crate::job::NodeId;

    fn message(event: Event) -> Message {
        let here = Address::input(NodeId(0));
        Message::new(event, here, here, 0.0)
    }

    #[test]
    fn test_same_time_events_are_fifo() {
        let mut queue = EventQueue::new();
        queue.schedule(message(Event::Start), 1.0).unwrap();
        queue.schedule(message(Event::PsCompletion), 1.0).unwrap();
        queue.schedule(message(Event::Start), 0.5).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|(t, m)| (t, m.event.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![(0.5, "Start"), (1.0, "Start"), (1.0, "PsCompletion")]
        );
    }

    #[test]
    fn test_cancelled_event_is_never_delivered() {
        let mut queue = EventQueue::new();
        let token = queue.schedule(message(Event::PsCompletion), 2.0).unwrap();
        queue.schedule(message(Event::Start), 3.0).unwrap();

        assert_eq!(token.due(), 2.0);
        assert!(queue.cancel(token));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().1.event, Event::Start);
        assert_eq!(queue.cancelled(), 1);
    }

    #[test]
    fn test_negative_delay_rejected() {
        let mut queue = EventQueue::new();
        let result = queue.schedule(message(Event::Start), -0.1);
        assert!(matches!(result, Err(KernelError::NegativeDelay { .. })));
    }

    #[test]
    fn test_delay_is_relative_to_current_time() {
        let mut queue = EventQueue::new();
        queue.schedule(message(Event::Start), 4.0).unwrap();
        queue.pop();
        let token = queue.schedule(message(Event::Start), 1.5).unwrap();
        assert_eq!(token.due(), 5.5);
    }
}
