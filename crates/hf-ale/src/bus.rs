//! State Bus
//!
//! Ingress for game-state signals. The game side owns a cloneable
//! [`StateBusHandle`]; the audio thread owns the [`StateBusReceiver`] and
//! drains it once per callback.
//!
//! When the ring is full, signals are coalesced per kind: the overflow slot
//! of a kind always holds the newest value, so "current state" survives a
//! producer that outruns the consumer. Spilled signals are replayed in
//! arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::signals::{GameSnapshot, HealthHysteresis, SignalKind, StateSignal};

/// Newest spilled signal per kind with its arrival sequence
type OverflowSlots = [Option<(StateSignal, u64)>; SignalKind::COUNT];

/// Signals that did not fit into the ring
struct Overflow {
    slots: OverflowSlots,
    next_seq: u64,
}

impl Overflow {
    fn new() -> Self {
        Self {
            slots: [None; SignalKind::COUNT],
            next_seq: 0,
        }
    }

    #[inline]
    fn is_pending(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }

    /// Store `signal` as the newest arrival. Returns whether it replaced one.
    fn store(&mut self, signal: StateSignal) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots[signal.kind().index()]
            .replace((signal, seq))
            .is_some()
    }

    /// Take every slot, oldest arrival first
    fn take_ordered(&mut self) -> OverflowSlots {
        let mut taken = std::mem::replace(&mut self.slots, [None; SignalKind::COUNT]);
        taken.sort_unstable_by_key(|slot| slot.map_or(u64::MAX, |(_, seq)| seq));
        taken
    }
}

/// Shared between all handle clones and the receiver
struct BusShared {
    /// Signal producer (protected by Mutex for multi-producer access)
    signal_tx: Mutex<Producer<StateSignal>>,
    overflow: Mutex<Overflow>,
    /// Signals replaced in the overflow slots since the last drain
    coalesced: AtomicU32,
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLE (game thread)
// ═══════════════════════════════════════════════════════════════════════════════

/// Thread-safe signal sender
#[derive(Clone)]
pub struct StateBusHandle {
    shared: Arc<BusShared>,
}

impl StateBusHandle {
    /// Send a signal. Never blocks on the audio thread and never fails:
    /// a full ring coalesces into the per-kind overflow slot.
    pub fn send(&self, signal: StateSignal) {
        let mut overflow = self.shared.overflow.lock();

        // Once anything has spilled, later signals stay behind it
        if overflow.is_pending() {
            if overflow.store(signal) {
                self.shared.coalesced.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let mut tx = self.shared.signal_tx.lock();
        if tx.push(signal).is_err() {
            log::warn!("Signal queue full, coalescing {}", signal.kind().name());
            overflow.store(signal);
        }
    }

    /// Free slots in the ring
    pub fn available(&self) -> usize {
        self.shared.signal_tx.lock().slots()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECEIVER (audio thread)
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusUpdate {
    /// Snapshot changed during this drain
    pub changed: bool,
    /// RoundEnded signals received (stinger intents)
    pub round_end_count: u32,
    /// Signals folded into the snapshot
    pub accepted: u32,
    /// Consecutive duplicates dropped
    pub debounced: u32,
    /// Signals replaced by a newer one of the same kind on overflow
    pub coalesced: u32,
}

/// Audio-thread side of the bus
pub struct StateBusReceiver {
    shared: Arc<BusShared>,
    signal_rx: Consumer<StateSignal>,
    hysteresis: HealthHysteresis,
    snapshot: GameSnapshot,
    /// Bumped whenever the snapshot changes
    epoch: u64,
    /// Last accepted signal per kind with the epoch after it was applied
    last_accepted: [Option<(StateSignal, u64)>; SignalKind::COUNT],
}

impl StateBusReceiver {
    /// Pop every pending signal and fold it into the snapshot
    pub fn drain(&mut self) -> BusUpdate {
        let mut update = BusUpdate::default();

        // Ring entries are always older than every overflow entry
        while let Ok(signal) = self.signal_rx.pop() {
            self.accept(signal, &mut update);
        }

        let shared = Arc::clone(&self.shared);
        if let Some(mut overflow) = shared.overflow.try_lock() {
            // Nothing can be pushed while the lock is held
            while let Ok(signal) = self.signal_rx.pop() {
                self.accept(signal, &mut update);
            }
            for (signal, _) in overflow.take_ordered().into_iter().flatten() {
                self.accept(signal, &mut update);
            }
        }

        update.coalesced = self.shared.coalesced.swap(0, Ordering::Relaxed);
        if update.coalesced > 0 {
            log::debug!("{} signals coalesced on overflow", update.coalesced);
        }

        update
    }

    fn accept(&mut self, signal: StateSignal, update: &mut BusUpdate) {
        if let Err(e) = signal.validate() {
            log::warn!("Dropping signal: {}", e);
            return;
        }

        let kind = signal.kind();

        if kind == SignalKind::RoundEnded {
            update.round_end_count += 1;
            update.accepted += 1;
            return;
        }

        let duplicate = matches!(
            self.last_accepted[kind.index()],
            Some((last, epoch)) if epoch == self.epoch && last.same_as(&signal)
        );
        if duplicate {
            update.debounced += 1;
            log::trace!("Debounced duplicate {}", kind.name());
            return;
        }

        if self.snapshot.apply(&signal, &self.hysteresis) {
            self.epoch += 1;
            update.changed = true;
        }
        self.last_accepted[kind.index()] = Some((signal, self.epoch));
        update.accepted += 1;
    }

    /// Latest snapshot
    pub fn snapshot(&self) -> &GameSnapshot {
        &self.snapshot
    }

    /// Replace the snapshot and forget debounce history
    pub fn reset(&mut self, snapshot: GameSnapshot) {
        self.snapshot = snapshot;
        self.epoch += 1;
        self.last_accepted = [None; SignalKind::COUNT];
    }

    pub fn hysteresis(&self) -> HealthHysteresis {
        self.hysteresis
    }

    pub fn set_hysteresis(&mut self, hysteresis: HealthHysteresis) {
        self.hysteresis = hysteresis;
    }
}

/// Create a connected handle/receiver pair
pub fn state_bus(
    capacity: usize,
    hysteresis: HealthHysteresis,
) -> (StateBusHandle, StateBusReceiver) {
    let (signal_tx, signal_rx) = RingBuffer::new(capacity.max(1));

    let shared = Arc::new(BusShared {
        signal_tx: Mutex::new(signal_tx),
        overflow: Mutex::new(Overflow::new()),
        coalesced: AtomicU32::new(0),
    });

    let handle = StateBusHandle {
        shared: Arc::clone(&shared),
    };

    let receiver = StateBusReceiver {
        shared,
        signal_rx,
        hysteresis,
        snapshot: GameSnapshot::default(),
        epoch: 0,
        last_accepted: [None; SignalKind::COUNT],
    };

    (handle, receiver)
}
