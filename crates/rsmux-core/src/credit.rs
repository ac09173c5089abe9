//! Outbound credit granted by the peer through REQUEST_N.

use std::sync::{Condvar, Mutex};

use crate::state::{add_demand, UNBOUNDED};
use crate::sync::{lock, wait};

#[derive(Debug, Default)]
struct CreditState {
    available: u64,
    closed: bool,
}

/// Counter a producer blocks on until the peer grants demand.
#[derive(Debug, Default)]
pub(crate) struct Credit {
    state: Mutex<CreditState>,
    changed: Condvar,
}

impl Credit {
    pub(crate) fn new(initial: u64) -> Self {
        Self {
            state: Mutex::new(CreditState {
                available: add_demand(0, initial),
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Grant `n` more elements.
    pub(crate) fn add(&self, n: u64) {
        let mut state = lock(&self.state);
        state.available = add_demand(state.available, n);
        self.changed.notify_all();
    }

    /// Take one unit, blocking until one is available. Returns `false` once
    /// the credit is closed.
    pub(crate) fn acquire(&self) -> bool {
        let mut state = lock(&self.state);
        while state.available == 0 && !state.closed {
            state = wait(&self.changed, state);
        }
        if state.closed {
            return false;
        }
        if state.available != UNBOUNDED {
            state.available -= 1;
        }
        true
    }

    /// Wake every blocked producer; later `acquire` calls fail.
    pub(crate) fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        self.changed.notify_all();
    }

    pub(crate) fn available(&self) -> u64 {
        lock(&self.state).available
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn acquire_consumes_credit() {
        let credit = Credit::new(2);
        assert!(credit.acquire());
        assert!(credit.acquire());
        assert_eq!(credit.available(), 0);
    }

    #[test]
    fn unbounded_credit_never_runs_out() {
        let credit = Credit::new(u64::from(rsmux_frame::MAX_REQUEST_N));
        for _ in 0..10 {
            assert!(credit.acquire());
        }
        assert_eq!(credit.available(), UNBOUNDED);
    }

    #[test]
    fn blocked_producer_wakes_on_grant() {
        let credit = Arc::new(Credit::new(0));
        let producer = {
            let credit = Arc::clone(&credit);
            thread::spawn(move || credit.acquire())
        };
        thread::sleep(Duration::from_millis(20));
        credit.add(1);
        assert!(producer.join().unwrap());
    }

    #[test]
    fn close_releases_blocked_producer() {
        let credit = Arc::new(Credit::new(0));
        let producer = {
            let credit = Arc::clone(&credit);
            thread::spawn(move || credit.acquire())
        };
        thread::sleep(Duration::from_millis(20));
        credit.close();
        assert!(!producer.join().unwrap());
        credit.add(5);
        assert!(!credit.acquire());
    }
}
