//! Sequenced chain and mempool notifications.
//!
//! Every event gets a strictly increasing sequence number. Subscribers
//! receive events over a channel; a bounded log of recent events lets a
//! consumer that fell behind resume from the last sequence it processed.

use crate::types::*;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

/// Why an entry left the mempool without being confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Displaced by a fee-bumping replacement
    Replaced { by: Hash },
    /// Conflicts with a transaction confirmed in a connected block
    Conflict { block: Hash },
    /// Lowest fee rate when the pool exceeded its limits
    SizeLimit,
    /// No longer valid against the chain after a reorganization
    Reorg,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionReason::Replaced { by } => write!(f, "replaced by {}", hex::encode(by)),
            EvictionReason::Conflict { block } => write!(f, "conflict with block {}", hex::encode(block)),
            EvictionReason::SizeLimit => write!(f, "size limit"),
            EvictionReason::Reorg => write!(f, "invalid after reorg"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    ChainTipChanged {
        old_tip: Hash,
        new_tip: Hash,
        height: Height,
    },
    BlockConnected {
        hash: Hash,
        height: Height,
        block: Arc<Block>,
        delta: Arc<UtxoDelta>,
    },
    /// `delta` is the delta that was reverted
    BlockDisconnected {
        hash: Hash,
        height: Height,
        block: Arc<Block>,
        delta: Arc<UtxoDelta>,
    },
    TransactionAccepted {
        txid: Hash,
        tx: Arc<Transaction>,
        fee: Amount,
        fee_rate: FeeRate,
    },
    TransactionEvicted {
        txid: Hash,
        tx: Arc<Transaction>,
        reason: EvictionReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedEvent {
    pub sequence: u64,
    pub event: ChainEvent,
}

#[derive(Debug)]
struct BusInner {
    next_sequence: u64,
    subscribers: Vec<Sender<SequencedEvent>>,
    log: VecDeque<SequencedEvent>,
    capacity: usize,
}

#[derive(Debug)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    /// Bus keeping the last `capacity` events for replay.
    pub fn new(capacity: usize) -> Self {
        EventBus {
            inner: Mutex::new(BusInner {
                next_sequence: 1,
                subscribers: Vec::new(),
                log: VecDeque::with_capacity(capacity.min(4096)),
                capacity,
            }),
        }
    }

    pub fn subscribe(&self) -> Receiver<SequencedEvent> {
        let (tx, rx) = channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    /// Assign the next sequence number and deliver to every live subscriber.
    pub fn publish(&self, event: ChainEvent) -> u64 {
        let mut inner = self.inner.lock();
        let sequenced = SequencedEvent { sequence: inner.next_sequence, event };
        inner.next_sequence += 1;

        inner.subscribers.retain(|s| s.send(sequenced.clone()).is_ok());
        if inner.capacity > 0 {
            if inner.log.len() == inner.capacity {
                inner.log.pop_front();
            }
            inner.log.push_back(sequenced.clone());
        }
        sequenced.sequence
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = ChainEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Sequence number of the most recent event, 0 if none.
    pub fn last_sequence(&self) -> u64 {
        self.inner.lock().next_sequence - 1
    }

    /// Events with sequence > `after`. `None` when some of them already
    /// fell out of the log.
    pub fn replay_from(&self, after: u64) -> Option<Vec<SequencedEvent>> {
        let inner = self.inner.lock();
        let oldest = inner.log.front().map(|e| e.sequence).unwrap_or(inner.next_sequence);
        if after + 1 < oldest {
            return None;
        }
        Some(inner.log.iter().filter(|e| e.sequence > after).cloned().collect())
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tip(n: u8) -> ChainEvent {
        ChainEvent::ChainTipChanged { old_tip: [n; 32], new_tip: [n + 1; 32], height: n as Height }
    }

    #[test]
    fn test_sequence_strictly_increases() {
        let bus = EventBus::new(16);
        let rx = bus.subscribe();
        assert_eq!(bus.publish(tip(0)), 1);
        assert_eq!(bus.publish(tip(1)), 2);
        let received: Vec<u64> = rx.try_iter().map(|e| e.sequence).collect();
        assert_eq!(received, vec![1, 2]);
        assert_eq!(bus.last_sequence(), 2);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new(4);
        let rx = bus.subscribe();
        let _kept = bus.subscribe();
        drop(rx);
        bus.publish(tip(0));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_replay_window() {
        let bus = EventBus::new(3);
        for n in 0..5 {
            bus.publish(tip(n));
        }
        // log holds 3, 4, 5
        let replay = bus.replay_from(2).unwrap();
        assert_eq!(replay.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(bus.replay_from(5).unwrap(), vec![]);
        assert!(bus.replay_from(1).is_none());
    }
}
