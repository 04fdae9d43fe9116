//! Compartment event queues.
//!
//! Queue capacity is the sum of the estimated sizes of queued events, not the
//! number of events. That sum is the currency of back-pressure: the
//! compartment compares it against its lock/unlock watermarks.

use crate::task::Task;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Scheduling priority of an event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    Normal,
    Low,
}

/// A queued task with its estimated size.
#[derive(Debug)]
pub struct Event {
    pub task: Task,
    pub size: usize,
    pub priority: Priority,
}

impl Event {
    pub fn new(task: Task, size: usize) -> Self {
        Self {
            task,
            size,
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Queue of pending compartment events.
pub trait CompartmentQueue: Send {
    /// Add an event, growing the capacity by its size.
    fn offer(&mut self, event: Event);

    /// Remove the next event. `first_in_batch` is set for the first poll of
    /// each processing iteration.
    fn poll(&mut self, first_in_batch: bool) -> Option<Event>;

    /// Sum of the sizes of queued events.
    fn capacity(&self) -> usize;

    /// Number of queued events.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plain FIFO queue.
#[derive(Debug, Default)]
pub struct SimpleCompartmentQueue {
    events: VecDeque<Event>,
    capacity: usize,
}

impl SimpleCompartmentQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CompartmentQueue for SimpleCompartmentQueue {
    fn offer(&mut self, event: Event) {
        self.capacity += event.size;
        self.events.push_back(event);
    }

    fn poll(&mut self, _first_in_batch: bool) -> Option<Event> {
        let event = self.events.pop_front()?;
        debug_assert!(self.capacity >= event.size, "queue capacity underflow");
        self.capacity = self.capacity.saturating_sub(event.size);
        Some(event)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.events.len()
    }
}

/// Two-level queue that demotes explicitly low-priority events.
///
/// Normal events are served first, except that the first poll of a batch
/// takes one low-priority event when available so low-priority work keeps
/// moving under sustained load.
#[derive(Debug, Default)]
pub struct PriorityCompartmentQueue {
    normal: VecDeque<Event>,
    low: VecDeque<Event>,
    capacity: usize,
}

impl PriorityCompartmentQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CompartmentQueue for PriorityCompartmentQueue {
    fn offer(&mut self, event: Event) {
        self.capacity += event.size;
        match event.priority {
            Priority::Normal => self.normal.push_back(event),
            Priority::Low => self.low.push_back(event),
        }
    }

    fn poll(&mut self, first_in_batch: bool) -> Option<Event> {
        let event = if first_in_batch && !self.low.is_empty() {
            self.low.pop_front()
        } else {
            self.normal.pop_front().or_else(|| self.low.pop_front())
        }?;
        debug_assert!(self.capacity >= event.size, "queue capacity underflow");
        self.capacity = self.capacity.saturating_sub(event.size);
        Some(event)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.normal.len() + self.low.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(size: usize, priority: Priority) -> Event {
        Event::new(Task::run(|| {}), size).with_priority(priority)
    }

    #[test]
    fn test_simple_queue_tracks_capacity() {
        let mut queue = SimpleCompartmentQueue::new();
        queue.offer(event(3, Priority::Normal));
        queue.offer(event(5, Priority::Normal));
        assert_eq!(queue.capacity(), 8);
        assert_eq!(queue.len(), 2);

        let first = queue.poll(true).unwrap();
        assert_eq!(first.size, 3);
        assert_eq!(queue.capacity(), 5);

        queue.poll(false).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 0);
        assert!(queue.poll(false).is_none());
    }

    #[test]
    fn test_priority_queue_serves_normal_first() {
        let mut queue = PriorityCompartmentQueue::new();
        queue.offer(event(1, Priority::Low));
        queue.offer(event(2, Priority::Normal));
        queue.offer(event(3, Priority::Normal));

        assert_eq!(queue.poll(false).unwrap().size, 2);
        assert_eq!(queue.poll(false).unwrap().size, 3);
        assert_eq!(queue.poll(false).unwrap().size, 1);
        assert_eq!(queue.capacity(), 0);
    }

    #[test]
    fn test_priority_queue_first_in_batch_takes_low() {
        let mut queue = PriorityCompartmentQueue::new();
        queue.offer(event(2, Priority::Normal));
        queue.offer(event(1, Priority::Low));

        assert_eq!(queue.poll(true).unwrap().priority, Priority::Low);
        assert_eq!(queue.poll(false).unwrap().priority, Priority::Normal);
    }
}
