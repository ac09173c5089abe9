//! Packed per-interaction state.
//!
//! One `AtomicU64` holds the lifecycle flags in the high bits and the
//! accumulated demand in the low 48 bits. Every transition is a CAS loop that
//! returns the state observed before it, so callers can tell whether they won
//! a race. Once TERMINATED is set the only change left is clearing
//! REASSEMBLING.

use std::sync::atomic::{AtomicU64, Ordering};

use rsmux_frame::MAX_REQUEST_N;

const SUBSCRIBED: u64 = 1 << 63;
const TERMINATED: u64 = 1 << 62;
const FIRST_FRAME_SENT: u64 = 1 << 61;
const READY_TO_SEND_FIRST_FRAME: u64 = 1 << 60;
const OUTBOUND_TERMINATED: u64 = 1 << 59;
const INBOUND_TERMINATED: u64 = 1 << 58;
const REASSEMBLING: u64 = 1 << 57;

const DEMAND_MASK: u64 = (1 << 48) - 1;

/// Demand value meaning "no limit".
pub(crate) const UNBOUNDED: u64 = DEMAND_MASK;

/// Snapshot of a state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct State(u64);

impl State {
    pub(crate) fn is_subscribed(self) -> bool {
        self.0 & SUBSCRIBED != 0
    }

    pub(crate) fn is_terminated(self) -> bool {
        self.0 & TERMINATED != 0
    }

    pub(crate) fn is_first_frame_sent(self) -> bool {
        self.0 & FIRST_FRAME_SENT != 0
    }

    pub(crate) fn is_ready_to_send_first_frame(self) -> bool {
        self.0 & READY_TO_SEND_FIRST_FRAME != 0
    }

    pub(crate) fn is_outbound_terminated(self) -> bool {
        self.0 & OUTBOUND_TERMINATED != 0
    }

    pub(crate) fn is_inbound_terminated(self) -> bool {
        self.0 & INBOUND_TERMINATED != 0
    }

    pub(crate) fn is_reassembling(self) -> bool {
        self.0 & REASSEMBLING != 0
    }

    /// Accumulated demand; `UNBOUNDED` once any request reached the limit.
    pub(crate) fn demand(self) -> u64 {
        self.0 & DEMAND_MASK
    }

    pub(crate) fn is_unbounded(self) -> bool {
        self.demand() == UNBOUNDED
    }

    fn with(self, flag: u64) -> Self {
        Self(self.0 | flag)
    }

    fn without(self, flag: u64) -> Self {
        Self(self.0 & !flag)
    }

    fn with_demand(self, demand: u64) -> Self {
        Self((self.0 & !DEMAND_MASK) | demand.min(UNBOUNDED))
    }
}

/// Add `n` to a demand counter, saturating at `UNBOUNDED`.
///
/// Any single request of `MAX_REQUEST_N` or more means unbounded.
pub(crate) fn add_demand(current: u64, n: u64) -> u64 {
    if n >= u64::from(MAX_REQUEST_N) || current == UNBOUNDED {
        UNBOUNDED
    } else {
        current.saturating_add(n).min(UNBOUNDED)
    }
}

/// Atomic state word shared by the threads touching one interaction.
#[derive(Debug, Default)]
pub(crate) struct StateWord(AtomicU64);

impl StateWord {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub(crate) fn load(&self) -> State {
        State(self.0.load(Ordering::Acquire))
    }

    /// Apply `f` until the CAS succeeds; `None` from `f` leaves the word
    /// untouched. Returns the state seen before the update.
    fn update(&self, f: impl Fn(State) -> Option<State>) -> State {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let Some(next) = f(State(current)) else {
                return State(current);
            };
            match self.0.compare_exchange_weak(
                current,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return State(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Only the first call changes the word.
    pub(crate) fn mark_subscribed(&self) -> State {
        self.update(|s| (!s.is_subscribed() && !s.is_terminated()).then(|| s.with(SUBSCRIBED)))
    }

    pub(crate) fn add_request_n(&self, n: u64) -> State {
        self.update(|s| {
            (!s.is_terminated() && n > 0 && !s.is_unbounded())
                .then(|| s.with_demand(add_demand(s.demand(), n)))
        })
    }

    pub(crate) fn mark_ready_to_send_first_frame(&self) -> State {
        self.update(|s| {
            (!s.is_terminated() && !s.is_ready_to_send_first_frame())
                .then(|| s.with(READY_TO_SEND_FIRST_FRAME))
        })
    }

    pub(crate) fn mark_first_frame_sent(&self) -> State {
        self.update(|s| (!s.is_terminated()).then(|| s.with(FIRST_FRAME_SENT)))
    }

    /// Terminal transition: the caller that sees a non-terminated previous
    /// state owns the terminal side effects.
    pub(crate) fn mark_terminated(&self) -> State {
        self.update(|s| {
            (!s.is_terminated())
                .then(|| s.with(TERMINATED | INBOUND_TERMINATED | OUTBOUND_TERMINATED))
        })
    }

    /// Close the inbound direction; sets TERMINATED when outbound is closed
    /// too.
    pub(crate) fn mark_inbound_terminated(&self) -> State {
        self.update(|s| {
            if s.is_terminated() || s.is_inbound_terminated() {
                return None;
            }
            let next = s.with(INBOUND_TERMINATED);
            Some(if s.is_outbound_terminated() {
                next.with(TERMINATED)
            } else {
                next
            })
        })
    }

    /// Close the outbound direction; sets TERMINATED when inbound is closed
    /// too.
    pub(crate) fn mark_outbound_terminated(&self) -> State {
        self.update(|s| {
            if s.is_terminated() || s.is_outbound_terminated() {
                return None;
            }
            let next = s.with(OUTBOUND_TERMINATED);
            Some(if s.is_inbound_terminated() {
                next.with(TERMINATED)
            } else {
                next
            })
        })
    }

    pub(crate) fn mark_reassembling(&self) -> State {
        self.update(|s| (!s.is_terminated() && !s.is_reassembling()).then(|| s.with(REASSEMBLING)))
    }

    pub(crate) fn mark_reassembled(&self) -> State {
        self.update(|s| s.is_reassembling().then(|| s.without(REASSEMBLING)))
    }
}
