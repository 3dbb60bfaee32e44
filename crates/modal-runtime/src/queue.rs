//! Lock-free excitation handoff from the network loop to the control loop
//!
//! A single-producer single-consumer ring buffer. The producer never
//! blocks: a push into a full queue is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rtrb::{Consumer, Producer, RingBuffer};

use modal_core::PokeEvent;

/// Push/drop counters shared by both ends of a queue
#[derive(Debug, Default)]
pub struct QueueCounters {
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl QueueCounters {
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producing end of a bounded queue
pub struct QueueSender<T> {
    producer: Producer<T>,
    counters: Arc<QueueCounters>,
}

impl<T> QueueSender<T> {
    /// Enqueue without blocking; returns false if the item was dropped
    pub fn try_push(&mut self, item: T) -> bool {
        match self.producer.push(item) {
            Ok(()) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.producer.buffer().capacity()
    }

    /// Items waiting to be consumed
    pub fn pending(&self) -> usize {
        self.capacity() - self.producer.slots()
    }

    pub fn counters(&self) -> &Arc<QueueCounters> {
        &self.counters
    }
}

/// Consuming end of a bounded queue
pub struct QueueReceiver<T> {
    consumer: Consumer<T>,
    counters: Arc<QueueCounters>,
}

impl<T> QueueReceiver<T> {
    pub fn pop(&mut self) -> Option<T> {
        self.consumer.pop().ok()
    }

    pub fn len(&self) -> usize {
        self.consumer.slots()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    pub fn counters(&self) -> &Arc<QueueCounters> {
        &self.counters
    }
}

/// Create a bounded queue holding at most `capacity` items
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    let counters = Arc::new(QueueCounters::default());
    (
        QueueSender {
            producer,
            counters: counters.clone(),
        },
        QueueReceiver { consumer, counters },
    )
}

pub type ExcitationSender = QueueSender<PokeEvent>;
pub type ExcitationReceiver = QueueReceiver<PokeEvent>;

#[cfg(test)]
mod tests {
    use super::*;
    use modal_core::NodeId;
    use proptest::prelude::*;

    #[test]
    fn test_fifo() {
        let (mut tx, mut rx) = bounded::<PokeEvent>(4);
        tx.try_push(PokeEvent::new(NodeId(1), 0.1));
        tx.try_push(PokeEvent::new(NodeId(2), 0.2));

        assert_eq!(rx.len(), 2);
        assert_eq!(rx.pop().unwrap().source, NodeId(1));
        assert_eq!(rx.pop().unwrap().source, NodeId(2));
        assert!(rx.pop().is_none());
        assert!(rx.is_empty());
    }

    #[test]
    fn test_full_queue_drops() {
        let (mut tx, mut rx) = bounded::<u8>(2);
        assert!(tx.try_push(1));
        assert!(tx.try_push(2));
        assert!(!tx.try_push(3));
        assert_eq!(tx.capacity(), 2);
        assert_eq!(tx.pending(), 2);
        assert_eq!(rx.pop(), Some(1));
        assert_eq!(rx.counters().dropped(), 1);
    }

    proptest! {
        #[test]
        fn prop_overflow_drops_exactly_the_excess(capacity in 1usize..32, pushes in 0usize..100) {
            let (mut tx, mut rx) = bounded::<PokeEvent>(capacity);
            let accepted = (0..pushes)
                .filter(|_| tx.try_push(PokeEvent::new(NodeId(0), 1.0)))
                .count();

            prop_assert_eq!(accepted, pushes.min(capacity));
            prop_assert_eq!(tx.counters().dropped() as usize, pushes.saturating_sub(capacity));

            let mut drained = 0;
            while rx.pop().is_some() {
                drained += 1;
            }
            prop_assert_eq!(drained, accepted);
        }
    }
}
