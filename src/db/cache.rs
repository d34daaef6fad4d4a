// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Implementation of the [`HandleCache`].

use std::sync::Arc;

use log::debug;

use super::{Error, Opener};

/// The largest permitted cache capacity.
pub const MAX_CAPACITY: usize = 255;

/// A cache of open map handles, kept in least-recently-used order.
///
/// A handle returned by [`HandleCache::open`] is "in use" until it is
/// given back with [`HandleCache::close`]; only idle handles are
/// eligible for eviction. At most one slot refers to a given
/// (domain, map) pair, so opening a pair that is already in use fails
/// with [`Error::InUse`].
///
/// A capacity of zero disables caching: every `open` goes straight to
/// the [`Opener`] and every `close` simply drops the handle.
#[derive(Debug)]
pub struct HandleCache<O: Opener> {
    opener: O,
    capacity: usize,
    slots: Vec<Slot<O::Handle>>,
}

#[derive(Debug)]
struct Slot<H> {
    domain: String,
    map: String,
    handle: Arc<H>,
    in_use: bool,
    must_close: bool,
}

impl<O: Opener> HandleCache<O> {
    /// Creates a new cache. `capacity` is clamped to
    /// [`MAX_CAPACITY`].
    pub fn new(opener: O, capacity: usize) -> Self {
        let capacity = capacity.min(MAX_CAPACITY);
        Self {
            opener,
            capacity,
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Returns the underlying [`Opener`].
    pub fn opener(&self) -> &O {
        &self.opener
    }

    /// Returns the cache's capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raises the cache's capacity (clamped to [`MAX_CAPACITY`]). The
    /// capacity is never lowered, since that would require closing
    /// handles that may be in use.
    pub fn grow(&mut self, capacity: usize) {
        let capacity = capacity.min(MAX_CAPACITY);
        if capacity > self.capacity {
            self.capacity = capacity;
        }
    }

    /// Sets the cache's capacity outright (clamped to [`MAX_CAPACITY`]).
    /// Idle handles beyond the new capacity are closed, least recently
    /// used first; handles in use are closed when they are given back.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.min(MAX_CAPACITY);
        let mut live = self.slots.iter().filter(|slot| !slot.must_close).count();
        let mut index = self.slots.len();
        while live > self.capacity && index > 0 {
            index -= 1;
            let slot = &mut self.slots[index];
            if slot.must_close {
                continue;
            }
            if slot.in_use {
                slot.must_close = true;
            } else {
                self.slots.remove(index);
            }
            live -= 1;
        }
    }

    /// Returns the (domain, map) pairs with open handles, most recently
    /// used first.
    pub fn cached(&self) -> impl Iterator<Item = (&str, &str)> {
        self.slots
            .iter()
            .map(|slot| (slot.domain.as_str(), slot.map.as_str()))
    }

    /// Opens a map, reusing a cached handle if one is idle.
    pub fn open(&mut self, domain: &str, map: &str) -> Result<Arc<O::Handle>, Error> {
        if map.starts_with('.') || map.contains('/') {
            return Err(Error::InvalidMapName);
        }
        if self.capacity == 0 {
            return self.opener.open(domain, map).map(Arc::new);
        }

        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.domain == domain && slot.map == map)
        {
            let slot = &mut self.slots[index];
            if slot.in_use {
                debug!("{}/{} is already open and in use", domain, map);
                return Err(Error::InUse);
            }
            slot.in_use = true;
            slot.must_close = false;
            let handle = slot.handle.clone();
            self.promote(index);
            return Ok(handle);
        }

        if self.slots.len() < self.capacity {
            let handle = Arc::new(self.opener.open(domain, map)?);
            self.slots.insert(0, Slot::new(domain, map, handle.clone()));
            return Ok(handle);
        }

        // Every slot is full. The replacement is opened before the
        // victim is evicted, so a failed open leaves the cache intact.
        let victim = self
            .slots
            .iter()
            .rposition(|slot| !slot.in_use)
            .ok_or(Error::CacheFull)?;
        let handle = Arc::new(self.opener.open(domain, map)?);
        let evicted = self.slots.remove(victim);
        debug!("Evicted {}/{} from the map cache", evicted.domain, evicted.map);
        self.slots.insert(0, Slot::new(domain, map, handle.clone()));
        Ok(handle)
    }

    /// Gives back a handle obtained from [`HandleCache::open`].
    ///
    /// The handle stays cached unless [`HandleCache::close_all`] was
    /// called while it was in use, in which case it is closed now.
    pub fn close(&mut self, handle: &Arc<O::Handle>) -> Result<(), Error> {
        let index = self
            .slots
            .iter()
            .position(|slot| Arc::ptr_eq(&slot.handle, handle));
        match index {
            Some(index) if self.slots[index].must_close => {
                self.slots.remove(index);
                Ok(())
            }
            Some(index) => {
                self.slots[index].in_use = false;
                Ok(())
            }
            None if self.capacity == 0 => Ok(()),
            None => Err(Error::UnknownHandle),
        }
    }

    /// Closes every idle handle. Handles in use are flagged to be closed
    /// when they are given back.
    pub fn close_all(&mut self) {
        self.slots.retain_mut(|slot| {
            if slot.in_use {
                slot.must_close = true;
            }
            slot.in_use
        });
    }

    fn promote(&mut self, index: usize) {
        self.slots[..=index].rotate_right(1);
    }
}

impl<H> Slot<H> {
    fn new(domain: &str, map: &str, handle: Arc<H>) -> Self {
        Self {
            domain: domain.to_owned(),
            map: map.to_owned(),
            handle,
            in_use: true,
            must_close: false,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
