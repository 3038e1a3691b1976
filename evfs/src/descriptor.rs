// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Generation-tagged handle table. Wraps a [`slab::Slab`] with a
//! per-slot generation counter so a handle minted before a slot was
//! freed and reused is rejected rather than silently resolving to
//! whatever now occupies that slot. Each table also stamps every handle
//! it mints with a caller-chosen 16-bit tag, so a handle from the wrong
//! table is rejected outright instead of coincidentally resolving to an
//! unrelated live slot with the same numeric key.

use evfs_err::{Error, Result};
use slab::Slab;

pub type RawHandle = u64;

fn pack(tag: u16, key: usize, generation: u16) -> RawHandle {
    ((tag as u64) << 48) | ((generation as u64) << 32) | key as u64
}

fn unpack(handle: RawHandle) -> (u16, usize, u16) {
    (
        (handle >> 48) as u16,
        (handle & 0xFFFF_FFFF) as usize,
        ((handle >> 32) & 0xFFFF) as u16,
    )
}

pub struct HandleTable<T> {
    tag: u16,
    slab: Slab<T>,
    generations: Vec<u16>,
}

impl<T> HandleTable<T> {
    pub fn new(tag: u16) -> Self {
        Self {
            tag,
            slab: Slab::new(),
            generations: Vec::new(),
        }
    }

    fn check(&self, handle: RawHandle) -> Result<usize> {
        let (tag, key, generation) = unpack(handle);
        if tag != self.tag || self.generations.get(key) != Some(&generation) {
            return Err(Error::InvalidArgument);
        }
        Ok(key)
    }

    pub fn insert(&mut self, value: T) -> RawHandle {
        let key = self.slab.insert(value);
        if self.generations.len() <= key {
            self.generations.resize(key + 1, 0);
        }
        pack(self.tag, key, self.generations[key])
    }

    pub fn get(&self, handle: RawHandle) -> Result<&T> {
        let key = self.check(handle)?;
        self.slab.get(key).ok_or(Error::InvalidArgument)
    }

    pub fn get_mut(&mut self, handle: RawHandle) -> Result<&mut T> {
        let key = self.check(handle)?;
        self.slab.get_mut(key).ok_or(Error::InvalidArgument)
    }

    pub fn remove(&mut self, handle: RawHandle) -> Result<T> {
        let key = self.check(handle)?;
        let value = self.slab.try_remove(key).ok_or(Error::InvalidArgument)?;
        self.generations[key] = self.generations[key].wrapping_add(1);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    /// Removes and returns every live value, bumping each slot's
    /// generation so any handle still outstanding for it is rejected.
    /// Used when tearing down a table wholesale (e.g. volume close).
    pub fn drain(&mut self) -> Vec<T> {
        let values = self.slab.drain().collect();
        for generation in &mut self.generations {
            *generation = generation.wrapping_add(1);
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let mut table: HandleTable<u32> = HandleTable::new(1);
        let a = table.insert(1);
        table.remove(a).unwrap();
        let b = table.insert(2);
        assert!(table.get(a).is_err());
        assert_eq!(*table.get(b).unwrap(), 2);
    }

    #[test]
    fn unknown_handle_is_rejected() {
        let table: HandleTable<u32> = HandleTable::new(1);
        assert!(table.get(42).is_err());
    }

    #[test]
    fn handle_from_a_differently_tagged_table_is_rejected() {
        let mut a: HandleTable<u32> = HandleTable::new(1);
        let b: HandleTable<u32> = HandleTable::new(2);
        let handle = a.insert(7);
        assert!(b.get(handle).is_err());
    }
}
