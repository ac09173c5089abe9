//! Lease-based admission control.
//!
//! A responder grants the requester a number of requests valid for a time
//! window (LEASE frame). The requester side queues interactions until a
//! lease allows them; the responder side rejects requests that arrive
//! without allowance.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{MuxError, Result};
use crate::sync::lock;

/// One lease issued by a responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub allowed_requests: u32,
    pub ttl: Duration,
    pub metadata: Option<Bytes>,
}

impl LeaseGrant {
    pub fn new(allowed_requests: u32, ttl: Duration) -> Self {
        Self {
            allowed_requests,
            ttl,
            metadata: None,
        }
    }
}

/// Source of leases for the responder side; typically an iterator that
/// sleeps between grants. Runs on a dedicated thread.
pub type LeaseSource = Box<dyn Iterator<Item = LeaseGrant> + Send>;

/// A lease in effect.
#[derive(Debug, Clone)]
pub struct Lease {
    allowed_requests: u32,
    remaining_requests: u32,
    ttl: Duration,
    issued_at: Instant,
    metadata: Option<Bytes>,
}

impl Lease {
    pub fn new(grant: LeaseGrant) -> Self {
        Self::issued_at(grant, Instant::now())
    }

    fn issued_at(grant: LeaseGrant, issued_at: Instant) -> Self {
        Self {
            allowed_requests: grant.allowed_requests,
            remaining_requests: grant.allowed_requests,
            ttl: grant.ttl,
            issued_at,
            metadata: grant.metadata,
        }
    }

    pub fn allowed_requests(&self) -> u32 {
        self.allowed_requests
    }

    pub fn remaining_requests(&self) -> u32 {
        self.remaining_requests
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.ttl
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    /// Live and with allowance left.
    pub fn is_valid(&self, now: Instant) -> bool {
        self.remaining_requests > 0 && !self.is_expired(now)
    }

    fn try_use(&mut self, now: Instant) -> std::result::Result<(), &'static str> {
        if self.is_expired(now) {
            return Err("lease expired");
        }
        if self.remaining_requests == 0 {
            return Err("lease exhausted");
        }
        self.remaining_requests -= 1;
        Ok(())
    }
}

fn missing_reason(lease: Option<&Lease>, now: Instant) -> &'static str {
    match lease {
        None => "no lease received",
        Some(lease) if lease.is_expired(now) => "lease expired",
        Some(_) => "lease exhausted",
    }
}

/// Interaction waiting for permission to send its first frame.
pub trait LeasePermitHandler: Send + Sync {
    /// Permission granted. Returns `false` if the interaction no longer
    /// needs it, in which case the allowance is not consumed.
    fn handle_permit(&self) -> bool;

    /// The interaction will never get a permit.
    fn handle_permit_error(&self, error: MuxError);
}

struct RequesterLeaseState {
    lease: Option<Lease>,
    /// Bumped with every lease received; a refund only applies to the lease
    /// it was reserved from.
    generation: u64,
    pending: VecDeque<Arc<dyn LeasePermitHandler>>,
    disposed: Option<String>,
}

/// Requester side: gates first frames on the leases received from the peer.
pub struct RequesterLeaseTracker {
    state: Mutex<RequesterLeaseState>,
    max_pending_requests: usize,
}

impl RequesterLeaseTracker {
    pub fn new(max_pending_requests: usize) -> Self {
        Self {
            state: Mutex::new(RequesterLeaseState {
                lease: None,
                generation: 0,
                pending: VecDeque::new(),
                disposed: None,
            }),
            max_pending_requests,
        }
    }

    /// Grant immediately if the current lease allows it and nothing is
    /// queued ahead; otherwise queue, or reject when the queue is full.
    ///
    /// Handlers are always called without the tracker lock held, so they may
    /// call back into the tracker.
    pub fn issue(&self, handler: Arc<dyn LeasePermitHandler>) {
        let now = Instant::now();
        let mut state = lock(&self.state);

        if let Some(reason) = &state.disposed {
            let error = MuxError::ConnectionClosed(reason.clone());
            drop(state);
            handler.handle_permit_error(error);
            return;
        }

        if state.pending.is_empty() {
            let generation = state.generation;
            if let Some(lease) = state.lease.as_mut().filter(|lease| lease.is_valid(now)) {
                lease.remaining_requests -= 1;
                drop(state);
                if !self.permit(handler, generation) {
                    self.release_pending();
                }
                return;
            }
        }

        if state.pending.len() >= self.max_pending_requests {
            let reason = missing_reason(state.lease.as_ref(), now);
            drop(state);
            tracing::debug!(reason, "request rejected without lease");
            handler.handle_permit_error(MuxError::MissingLease(reason.to_string()));
            return;
        }

        state.pending.push_back(handler);
    }

    /// Install a lease received from the peer and release queued
    /// interactions in order while it has allowance.
    pub fn handle_lease(&self, grant: LeaseGrant) {
        {
            let mut state = lock(&self.state);
            if state.disposed.is_some() {
                return;
            }
            tracing::debug!(
                allowed = grant.allowed_requests,
                ttl_ms = grant.ttl.as_millis() as u64,
                queued = state.pending.len(),
                "lease received"
            );
            state.lease = Some(Lease::issued_at(grant, Instant::now()));
            state.generation += 1;
        }
        self.release_pending();
    }

    /// Hand out allowance reserved under the lock. A refused permit gives
    /// its request back to the lease it came from.
    fn permit(&self, handler: Arc<dyn LeasePermitHandler>, generation: u64) -> bool {
        if handler.handle_permit() {
            return true;
        }
        let mut state = lock(&self.state);
        if state.generation == generation {
            if let Some(lease) = state.lease.as_mut() {
                lease.remaining_requests += 1;
            }
        }
        false
    }

    fn release_pending(&self) {
        while let Some((handler, generation)) = self.next_permitted() {
            self.permit(handler, generation);
        }
    }

    /// Pop the oldest queued interaction and reserve one request for it.
    fn next_permitted(&self) -> Option<(Arc<dyn LeasePermitHandler>, u64)> {
        let now = Instant::now();
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.disposed.is_some() || state.pending.is_empty() {
            return None;
        }
        let lease = state.lease.as_mut().filter(|lease| lease.is_valid(now))?;
        let handler = state.pending.pop_front()?;
        lease.remaining_requests -= 1;
        Some((handler, state.generation))
    }

    /// Fail every queued interaction; later `issue` calls fail immediately.
    pub fn dispose(&self, reason: &str) {
        let pending: Vec<_> = {
            let mut state = lock(&self.state);
            if state.disposed.is_some() {
                return;
            }
            state.disposed = Some(reason.to_string());
            state.pending.drain(..).collect()
        };
        for handler in pending {
            handler.handle_permit_error(MuxError::ConnectionClosed(reason.to_string()));
        }
    }

    /// Requests the current lease still allows (0 if none or expired).
    pub fn available_requests(&self) -> u32 {
        let state = lock(&self.state);
        state
            .lease
            .as_ref()
            .filter(|lease| !lease.is_expired(Instant::now()))
            .map_or(0, Lease::remaining_requests)
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }
}

impl fmt::Debug for RequesterLeaseTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("RequesterLeaseTracker")
            .field("lease", &state.lease)
            .field("pending", &state.pending.len())
            .field("max_pending_requests", &self.max_pending_requests)
            .finish()
    }
}

/// Responder side: consumes allowance from the leases this side issued.
#[derive(Debug, Default)]
pub struct ResponderLeaseTracker {
    lease: Mutex<Option<Lease>>,
}

impl ResponderLeaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one request from the current lease.
    pub fn use_lease(&self) -> Result<()> {
        let now = Instant::now();
        let mut lease = lock(&self.lease);
        match lease.as_mut() {
            Some(lease) => lease.try_use(now),
            None => Err(missing_reason(None, now)),
        }
        .map_err(|reason| MuxError::MissingLease(reason.to_string()))
    }

    /// Replace the current lease.
    pub fn issue(&self, grant: LeaseGrant) -> Lease {
        let lease = Lease::new(grant);
        *lock(&self.lease) = Some(lease.clone());
        lease
    }
}
