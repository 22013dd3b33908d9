//! Resource Pool with Reservations
//!
//! Holds shared resources (typically accepted connections) and hands out
//! exclusive [`Reservation`]s on them. Each entry is free, reserved or
//! closed; closed is terminal. Closed entries stay in the pool until the
//! next periodic purge.
//!
//! The pool always contains a sentinel entry. [`ResourcePool::reserve_next`]
//! walks the entries round robin, so every full pass lands on the sentinel
//! once; a caller seeing the sentinel knows it has been all the way round
//! and can back off. The sentinel is always reservable, which also means
//! `reserve_next` never blocks.

use crate::PoolConfig;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::debug;

/// Something the pool can own and close
pub trait Resource: Send + Sync + 'static {
    /// Release the underlying resource. The pool calls this at most once.
    fn close(&self);
}

/// Observer of pool membership changes.
///
/// Callbacks run on the thread that added or closed the resource, never
/// while the pool's lock is held.
pub trait PoolListener<R>: Send + Sync {
    fn resource_added(&self, _resource: &Arc<R>) {}
    fn resource_closed(&self, _resource: &Arc<R>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Free,
    Reserved,
    Closed,
}

struct Entry<R> {
    resource: Arc<R>,
    state: Mutex<EntryState>,
}

impl<R> Entry<R> {
    fn try_reserve(&self) -> bool {
        let mut state = self.state.lock();
        if *state == EntryState::Free {
            *state = EntryState::Reserved;
            true
        } else {
            false
        }
    }

    fn is_closed(&self) -> bool {
        *self.state.lock() == EntryState::Closed
    }
}

enum Slot<R> {
    Sentinel,
    Entry(Arc<Entry<R>>),
}

struct PoolState<R> {
    slots: Vec<Slot<R>>,
    next_index: usize,
    attempts_since_purge: usize,
    /// Bumped whenever an entry is freed, added or closed
    generation: u64,
    closed: bool,
}

struct PoolShared<R> {
    state: Mutex<PoolState<R>>,
    changed: Condvar,
    listeners: Mutex<Vec<Arc<dyn PoolListener<R>>>>,
    config: PoolConfig,
}

impl<R: Resource> PoolShared<R> {
    fn bump_generation(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        self.changed.notify_all();
    }

    fn listeners(&self) -> Vec<Arc<dyn PoolListener<R>>> {
        self.listeners.lock().clone()
    }

    fn free_entry(&self, entry: &Entry<R>) {
        {
            let mut state = entry.state.lock();
            if *state != EntryState::Reserved {
                return;
            }
            *state = EntryState::Free;
        }
        self.bump_generation();
    }

    /// Mark closed, close the resource, then tell listeners. Idempotent.
    fn close_entry(&self, entry: &Entry<R>) {
        {
            let mut state = entry.state.lock();
            if *state == EntryState::Closed {
                return;
            }
            *state = EntryState::Closed;
        }

        entry.resource.close();

        for listener in self.listeners() {
            listener.resource_closed(&entry.resource);
        }
        self.bump_generation();
    }
}

/// Pool of reservable resources
pub struct ResourcePool<R: Resource> {
    shared: Arc<PoolShared<R>>,
}

impl<R: Resource> Clone for ResourcePool<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: Resource> std::fmt::Debug for ResourcePool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool").finish_non_exhaustive()
    }
}

impl<R: Resource> Default for ResourcePool<R> {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

impl<R: Resource> ResourcePool<R> {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    slots: vec![Slot::Sentinel],
                    next_index: 0,
                    attempts_since_purge: 0,
                    generation: 0,
                    closed: false,
                }),
                changed: Condvar::new(),
                listeners: Mutex::new(Vec::new()),
                config: config.clone(),
            }),
        }
    }

    /// Add a resource to the pool.
    ///
    /// The returned handle closes the resource independently of any
    /// reservation. Adding to a closed pool closes the resource at once.
    pub fn add(&self, resource: R) -> ResourceHandle<R> {
        let entry = Arc::new(Entry {
            resource: Arc::new(resource),
            state: Mutex::new(EntryState::Free),
        });

        let accepted = {
            let mut state = self.shared.state.lock();
            if state.closed {
                false
            } else {
                state.slots.push(Slot::Entry(Arc::clone(&entry)));
                state.generation = state.generation.wrapping_add(1);
                self.shared.changed.notify_all();
                true
            }
        };

        if accepted {
            for listener in self.shared.listeners() {
                listener.resource_added(&entry.resource);
            }
        } else {
            debug!("Resource added to closed pool, closing it");
            self.shared.close_entry(&entry);
        }

        ResourceHandle {
            shared: Arc::clone(&self.shared),
            entry,
        }
    }

    /// Reserve the next free entry in round-robin order.
    ///
    /// Returns the sentinel reservation when the walk reaches it. Never
    /// blocks.
    pub fn reserve_next(&self) -> Reservation<R> {
        let mut state = self.shared.state.lock();

        state.attempts_since_purge += 1;
        if state.attempts_since_purge >= self.shared.config.purge_frequency {
            state.attempts_since_purge = 0;
            Self::purge(&mut state);
        }

        let len = state.slots.len();
        for _ in 0..len {
            let index = state.next_index % len;
            state.next_index = (index + 1) % len;

            match &state.slots[index] {
                Slot::Sentinel => break,
                Slot::Entry(entry) => {
                    if entry.try_reserve() {
                        return Reservation::new(&self.shared, Some(Arc::clone(entry)));
                    }
                }
            }
        }

        Reservation::new(&self.shared, None)
    }

    /// Reserve every live resource in the pool.
    ///
    /// Resources reserved by someone else are waited for, with each wait
    /// bounded by the configured reserve wait. Entries that close meanwhile
    /// are skipped. The sentinel is never included.
    pub fn reserve_all(&self) -> Vec<Reservation<R>> {
        let mut pending: Vec<Arc<Entry<R>>> = {
            let mut state = self.shared.state.lock();
            Self::purge(&mut state);
            state
                .slots
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Entry(entry) => Some(Arc::clone(entry)),
                    Slot::Sentinel => None,
                })
                .collect()
        };

        let mut reserved = Vec::with_capacity(pending.len());
        let wait = self.shared.config.reserve_wait();

        loop {
            let generation = self.shared.state.lock().generation;

            pending.retain(|entry| {
                if entry.try_reserve() {
                    reserved.push(Reservation::new(&self.shared, Some(Arc::clone(entry))));
                    false
                } else {
                    !entry.is_closed()
                }
            });

            if pending.is_empty() {
                return reserved;
            }

            let mut state = self.shared.state.lock();
            if state.generation == generation {
                self.shared.changed.wait_for(&mut state, wait);
            }
        }
    }

    /// Close every resource in the pool. Idempotent.
    pub fn close(&self) {
        let entries: Vec<Arc<Entry<R>>> = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state
                .slots
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Entry(entry) => Some(Arc::clone(entry)),
                    Slot::Sentinel => None,
                })
                .collect()
        };

        debug!(resources = entries.len(), "Closing resource pool");
        for entry in entries {
            self.shared.close_entry(&entry);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of entries that have not been closed
    pub fn count_active(&self) -> usize {
        let state = self.shared.state.lock();
        state
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Entry(entry) if !entry.is_closed()))
            .count()
    }

    pub fn add_listener(&self, listener: Arc<dyn PoolListener<R>>) {
        self.shared.listeners.lock().push(listener);
    }

    fn purge(state: &mut PoolState<R>) {
        let before = state.slots.len();
        state.slots.retain(|slot| match slot {
            Slot::Sentinel => true,
            Slot::Entry(entry) => !entry.is_closed(),
        });

        let purged = before - state.slots.len();
        if purged > 0 {
            debug!(purged, "Purged closed pool entries");
            if state.next_index >= state.slots.len() {
                state.next_index = 0;
            }
        }
    }
}

/// Handle returned by [`ResourcePool::add`]
pub struct ResourceHandle<R: Resource> {
    shared: Arc<PoolShared<R>>,
    entry: Arc<Entry<R>>,
}

impl<R: Resource> ResourceHandle<R> {
    pub fn resource(&self) -> &Arc<R> {
        &self.entry.resource
    }

    pub fn is_closed(&self) -> bool {
        self.entry.is_closed()
    }

    /// Close the resource whether or not it is reserved
    pub fn close(&self) {
        self.shared.close_entry(&self.entry);
    }
}

/// Exclusive claim on one pool entry, or on the sentinel.
///
/// Dropping a reservation frees it.
pub struct Reservation<R: Resource> {
    shared: Arc<PoolShared<R>>,
    entry: Option<Arc<Entry<R>>>,
    released: bool,
}

impl<R: Resource> Reservation<R> {
    fn new(shared: &Arc<PoolShared<R>>, entry: Option<Arc<Entry<R>>>) -> Self {
        Self {
            shared: Arc::clone(shared),
            entry,
            released: false,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.entry.is_none()
    }

    /// The reserved resource; `None` for the sentinel
    pub fn resource(&self) -> Option<&Arc<R>> {
        self.entry.as_ref().map(|entry| &entry.resource)
    }

    pub fn is_closed(&self) -> bool {
        self.entry.as_ref().map_or(false, |entry| entry.is_closed())
    }

    /// Return the entry to the pool
    pub fn free(mut self) {
        self.release();
    }

    /// Close the reserved resource. Closing the sentinel does nothing.
    pub fn close(mut self) {
        if let Some(entry) = &self.entry {
            self.shared.close_entry(entry);
        }
        self.released = true;
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(entry) = &self.entry {
            self.shared.free_entry(entry);
        }
    }
}

impl<R: Resource> Drop for Reservation<R> {
    fn drop(&mut self) {
        self.release();
    }
}
