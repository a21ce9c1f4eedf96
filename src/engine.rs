//! Discrete-event engine.
//!
//! Absolute time is the ASN (Absolute Slot Number). Events are totally
//! ordered by `(asn, intra-slot order, insertion order)` and dispatched one
//! at a time; this ordering is the only synchronisation mechanism in the
//! simulator. An event's kind doubles as its unique tag: scheduling a kind
//! that is already pending replaces the pending entry, except for an entry
//! at the current ASN, which is about to run and cannot be cancelled.

use std::collections::{BTreeMap, HashMap};

use crate::address::{MacAddr, MoteId};

/// Strict priority of events inside one slot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum SlotOrder {
    StartOfSlot,
    /// Per-mote stack tasks (TSCH slot execution, timers, application).
    Stack,
    /// Connectivity resolution; runs strictly after all stack tasks.
    Propagate,
    EndOfSlot,
}

/// Everything that can be scheduled. The variant (with its ids) is the
/// unique tag used for replacement and cancellation.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum EventKind {
    /// Connectivity self-schedules this at every ASN.
    Propagate,
    EndOfSimulation,
    /// TSCH wakes up at its next active slot.
    TschActiveSlot { mote: MoteId },
    /// Unsynced mote listening for an EB on a random channel.
    TschListenForEb { mote: MoteId },
    TschKeepAlive { mote: MoteId },
    AppSendPacket { mote: MoteId },
    RplSendDao { mote: MoteId },
    SecJoinRetransmit { mote: MoteId },
    SixPTimeout { mote: MoteId, peer: MacAddr, initiator: bool },
    MsfHousekeeping { mote: MoteId },
}

type EventKey = (u64, SlotOrder, u64);

/// The event queue. `pop` advances the current ASN; it never goes back.
pub struct Engine {
    asn: u64,
    next_seq: u64,
    queue: BTreeMap<EventKey, EventKind>,
    index: HashMap<EventKind, Vec<EventKey>>,
    stopped: bool,
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            asn: 0,
            next_seq: 0,
            queue: BTreeMap::new(),
            index: HashMap::new(),
            stopped: false,
        }
    }

    pub fn asn(&self) -> u64 {
        self.asn
    }

    /// Place an event at a future ASN, replacing any pending event of the
    /// same kind. An entry already scheduled at the current ASN stays.
    pub fn schedule(&mut self, asn: u64, order: SlotOrder, kind: EventKind) {
        assert!(asn > self.asn, "cannot schedule {:?} at ASN {} (current {})", kind, asn, self.asn);

        if let Some(keys) = self.index.get_mut(&kind) {
            keys.retain(|key| {
                if key.0 == self.asn {
                    true
                } else {
                    self.queue.remove(key);
                    false
                }
            });
        }

        let key = (asn, order, self.next_seq);
        self.next_seq += 1;
        self.index.entry(kind.clone()).or_default().push(key);
        self.queue.insert(key, kind);
    }

    /// Cancel all future events of this kind. An event scheduled at the
    /// current ASN is about to run; removing it is a no-op.
    pub fn cancel(&mut self, kind: &EventKind) {
        if let Some(keys) = self.index.get_mut(kind) {
            keys.retain(|key| {
                if key.0 == self.asn {
                    true
                } else {
                    self.queue.remove(key);
                    false
                }
            });
            if keys.is_empty() {
                self.index.remove(kind);
            }
        }
    }

    /// ASN of the next pending event.
    pub fn peek_asn(&self) -> Option<u64> {
        self.queue.keys().next().map(|key| key.0)
    }

    /// Pop the next event and advance the current ASN to its slot.
    pub fn pop(&mut self) -> Option<(u64, EventKind)> {
        let (&key, _) = self.queue.iter().next()?;
        let kind = self.queue.remove(&key).expect("key just observed");
        if let Some(keys) = self.index.get_mut(&kind) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                self.index.remove(&kind);
            }
        }
        assert!(key.0 >= self.asn, "ASN regression");
        self.asn = key.0;
        Some((key.0, kind))
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[cfg(test)]
    fn pending(&self, kind: &EventKind) -> usize {
        self.index.get(kind).map_or(0, |keys| keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_asn_then_slot_order() {
        let mut engine = Engine::new();
        engine.schedule(2, SlotOrder::Propagate, EventKind::Propagate);
        engine.schedule(2, SlotOrder::Stack, EventKind::TschActiveSlot { mote: 1 });
        engine.schedule(1, SlotOrder::Stack, EventKind::TschActiveSlot { mote: 0 });

        assert_eq!(engine.pop(), Some((1, EventKind::TschActiveSlot { mote: 0 })));
        assert_eq!(engine.asn(), 1);
        assert_eq!(engine.pop(), Some((2, EventKind::TschActiveSlot { mote: 1 })));
        assert_eq!(engine.pop(), Some((2, EventKind::Propagate)));
        assert_eq!(engine.pop(), None);
    }

    #[test]
    fn insertion_order_breaks_ties() {
        let mut engine = Engine::new();
        engine.schedule(5, SlotOrder::Stack, EventKind::AppSendPacket { mote: 3 });
        engine.schedule(5, SlotOrder::Stack, EventKind::AppSendPacket { mote: 1 });
        assert_eq!(engine.pop(), Some((5, EventKind::AppSendPacket { mote: 3 })));
        assert_eq!(engine.pop(), Some((5, EventKind::AppSendPacket { mote: 1 })));
    }

    #[test]
    fn schedule_replaces_pending_event_of_same_kind() {
        let mut engine = Engine::new();
        engine.schedule(10, SlotOrder::Stack, EventKind::RplSendDao { mote: 2 });
        engine.schedule(20, SlotOrder::Stack, EventKind::RplSendDao { mote: 2 });
        assert_eq!(engine.pending(&EventKind::RplSendDao { mote: 2 }), 1);
        assert_eq!(engine.pop(), Some((20, EventKind::RplSendDao { mote: 2 })));
        assert_eq!(engine.pop(), None);
    }

    #[test]
    fn cancel_removes_future_events() {
        let mut engine = Engine::new();
        engine.schedule(4, SlotOrder::Stack, EventKind::TschKeepAlive { mote: 0 });
        engine.cancel(&EventKind::TschKeepAlive { mote: 0 });
        assert_eq!(engine.pop(), None);
        // cancelling an absent kind is a no-op
        engine.cancel(&EventKind::TschKeepAlive { mote: 0 });
    }

    #[test]
    fn entry_at_current_asn_survives_replacement() {
        let mut engine = Engine::new();
        engine.schedule(1, SlotOrder::Stack, EventKind::TschActiveSlot { mote: 0 });
        engine.schedule(1, SlotOrder::Propagate, EventKind::Propagate);
        // move to ASN 1 by popping the first event
        assert_eq!(engine.pop(), Some((1, EventKind::TschActiveSlot { mote: 0 })));
        // propagate is pending at the current ASN; rescheduling may not
        // cancel it
        engine.schedule(2, SlotOrder::Propagate, EventKind::Propagate);
        assert_eq!(engine.pending(&EventKind::Propagate), 2);
        assert_eq!(engine.pop(), Some((1, EventKind::Propagate)));
        assert_eq!(engine.pop(), Some((2, EventKind::Propagate)));
    }

    #[test]
    #[should_panic(expected = "cannot schedule")]
    fn scheduling_in_the_past_is_fatal() {
        let mut engine = Engine::new();
        engine.schedule(3, SlotOrder::Stack, EventKind::AppSendPacket { mote: 0 });
        engine.pop();
        engine.schedule(3, SlotOrder::Stack, EventKind::AppSendPacket { mote: 1 });
    }
}
