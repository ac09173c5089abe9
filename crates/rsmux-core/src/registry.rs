//! Stream id allocation and the id → interaction map.

use std::collections::HashMap;
use std::sync::Mutex;

use rsmux_frame::MAX_STREAM_ID;

use crate::error::{MuxError, Result};
use crate::sync::lock;

/// Which half of the connection this side is. Clients use odd stream ids,
/// servers even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Whether `stream_id` belongs to streams this side initiates.
    pub fn owns(self, stream_id: u32) -> bool {
        match self {
            Role::Client => stream_id % 2 == 1,
            Role::Server => stream_id != 0 && stream_id % 2 == 0,
        }
    }
}

/// Hands out stream ids: steps of two from the role's first id, wrapping
/// past `MAX_STREAM_ID`, never 0 and never an id still in use.
///
/// Not synchronized; callers hold the registry lock.
#[derive(Debug)]
pub(crate) struct StreamIdSupplier {
    counter: i64,
}

impl StreamIdSupplier {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            counter: match role {
                Role::Client => -1,
                Role::Server => 0,
            },
        }
    }

    #[cfg(test)]
    fn starting_after(counter: i64) -> Self {
        Self { counter }
    }

    pub(crate) fn next_id<T>(&mut self, active: &HashMap<u32, T>) -> u32 {
        loop {
            self.counter += 2;
            let id = (self.counter & i64::from(MAX_STREAM_ID)) as u32;
            if id != 0 && !active.contains_key(&id) {
                return id;
            }
        }
    }

    /// Whether `stream_id` was already handed out (before wrapping).
    pub(crate) fn is_before_or_current(&self, stream_id: u32) -> bool {
        stream_id > 0 && self.counter >= i64::from(stream_id)
    }
}

/// Registry entries compare by identity, not value.
pub(crate) trait StreamEntry: Clone {
    fn same_as(&self, other: &Self) -> bool;
}

struct RegistryState<H> {
    streams: HashMap<u32, H>,
    ids: Option<StreamIdSupplier>,
    closed: bool,
}

/// Active streams of one direction (initiated here, or accepted from the
/// peer) behind one lock.
pub(crate) struct StreamRegistry<H> {
    state: Mutex<RegistryState<H>>,
}

impl<H: StreamEntry> StreamRegistry<H> {
    /// Registry for streams this side starts; it allocates their ids.
    pub(crate) fn initiator(role: Role) -> Self {
        Self::with_ids(Some(StreamIdSupplier::new(role)))
    }

    /// Registry for streams the peer starts; ids come from the peer.
    pub(crate) fn acceptor() -> Self {
        Self::with_ids(None)
    }

    fn with_ids(ids: Option<StreamIdSupplier>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                streams: HashMap::new(),
                ids,
                closed: false,
            }),
        }
    }

    /// Allocate an id and register `handler` under it atomically.
    pub(crate) fn add_and_get_next_id(&self, handler: H) -> Result<u32> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.closed {
            return Err(MuxError::ConnectionClosed("connection is closed".into()));
        }
        let Some(ids) = state.ids.as_mut() else {
            return Err(MuxError::IdAllocation(
                "streams accepted from the peer carry the peer's ids".into(),
            ));
        };
        let id = ids.next_id(&state.streams);
        state.streams.insert(id, handler);
        Ok(id)
    }

    /// Allocate an id for an interaction that never receives frames
    /// (fire-and-forget).
    pub(crate) fn next_id(&self) -> Result<u32> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.closed {
            return Err(MuxError::ConnectionClosed("connection is closed".into()));
        }
        match state.ids.as_mut() {
            Some(ids) => Ok(ids.next_id(&state.streams)),
            None => Err(MuxError::IdAllocation(
                "streams accepted from the peer carry the peer's ids".into(),
            )),
        }
    }

    /// Register a handler under a peer-chosen id. Returns `false` if the id is
    /// taken or the registry is closed; the existing entry is kept.
    pub(crate) fn register(&self, stream_id: u32, handler: H) -> bool {
        let mut state = lock(&self.state);
        if state.closed || state.streams.contains_key(&stream_id) {
            return false;
        }
        state.streams.insert(stream_id, handler);
        true
    }

    pub(crate) fn lookup(&self, stream_id: u32) -> Option<H> {
        lock(&self.state).streams.get(&stream_id).cloned()
    }

    /// Remove `stream_id` only if it still maps to `handler`.
    pub(crate) fn remove(&self, stream_id: u32, handler: &H) -> bool {
        let mut state = lock(&self.state);
        match state.streams.get(&stream_id) {
            Some(current) if current.same_as(handler) => {
                state.streams.remove(&stream_id);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_before_or_current(&self, stream_id: u32) -> bool {
        lock(&self.state)
            .ids
            .as_ref()
            .is_some_and(|ids| ids.is_before_or_current(stream_id))
    }

    /// Close the registry and hand back every active stream.
    pub(crate) fn drain(&self) -> Vec<(u32, H)> {
        let mut state = lock(&self.state);
        state.closed = true;
        state.streams.drain().collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state).streams.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, stream_id: u32) -> bool {
        lock(&self.state).streams.contains_key(&stream_id)
    }
}
