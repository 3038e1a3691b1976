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

//! Entries layer: logical entries as chains of views, with reference
//! counting, truncate, byte-range I/O and the name index.
//!
//! Every size passed around inside this module is the *raw* on-disk
//! `data_seg_size`, i.e. it includes the 32-byte name prefix. Callers
//! that deal in user-visible sizes (the descriptor layer) add or
//! subtract [`NAME_SLOT_SIZE`] at the boundary.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use evfs_err::{Error, Result};
use evfs_storage::BlockDevice;
use log::{debug, trace, warn};

use crate::view::{transfer_size_to_cluster_count, View, ViewPool};

/// Bytes of every entry's payload reserved for its name.
pub const NAME_SLOT_SIZE: u32 = 32;

pub type EntryId = u32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestMode {
    Normal,
    Open,
    Busy,
    Mandatory,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum EntryState {
    Normal,
    Busy,
    CloseWait,
}

struct EntryInner<D: BlockDevice + 'static> {
    elements: Vec<View<D>>,
    name: Option<String>,
    state: EntryState,
    refcount: u32,
    io_refcount: u32,
    hard_remove_on_detach: bool,
}

pub struct Entry<D: BlockDevice + 'static> {
    pub id: EntryId,
    head: View<D>,
    inner: Mutex<EntryInner<D>>,
}

impl<D: BlockDevice + 'static> Entry<D> {
    pub fn name(&self) -> Option<String> {
        self.inner.lock().unwrap().name.clone()
    }

    pub fn raw_size(&self) -> Result<u32> {
        self.head.element_size()
    }

    pub fn user_size(&self) -> Result<u32> {
        Ok(self.raw_size()?.saturating_sub(NAME_SLOT_SIZE))
    }

    fn element_count(&self) -> usize {
        self.inner.lock().unwrap().elements.len()
    }

    /// Every cluster id backing this entry, head first.
    pub fn cluster_ids(&self) -> Vec<u32> {
        let inner = self.inner.lock().unwrap();
        let mut ids = Vec::with_capacity(1 + inner.elements.len());
        ids.push(self.head.cluster_id());
        ids.extend(inner.elements.iter().map(|v| v.cluster_id()));
        ids
    }
}

struct Table<D: BlockDevice + 'static> {
    entries: BTreeMap<EntryId, Arc<Entry<D>>>,
    names: HashMap<String, EntryId>,
}

/// Owns every live entry and the indices (by id, by name) used to find
/// them. One mutex, per the locking discipline: callers never hold it
/// across a disk operation, only while mutating the indices or an
/// entry's own state.
pub struct EntryTable<D: BlockDevice + 'static> {
    pool: Arc<ViewPool<D>>,
    table: Mutex<Table<D>>,
}

fn decode_name(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

fn encode_name(name: &str) -> [u8; NAME_SLOT_SIZE as usize] {
    let mut buf = [0u8; NAME_SLOT_SIZE as usize];
    let bytes = name.as_bytes();
    let len = bytes.len().min(buf.len());
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

impl<D: BlockDevice + 'static> EntryTable<D> {
    /// Rebuilds every chain found live in `busy`, the result of a
    /// mount-time `scan_busy_clusters`. Corruption (a chain whose
    /// `next_cluster_id` doesn't lead to a matching wild element) is
    /// isolated to the affected entry: it is force-torn-down and its
    /// clusters returned to idle, while every other entry loads normally.
    pub fn load(pool: Arc<ViewPool<D>>, busy: Vec<(u32, crate::cluster::ClusterHeader)>) -> Result<Self> {
        let mut heads: Vec<(u32, crate::cluster::ClusterHeader)> = Vec::new();
        let mut wild: HashMap<u32, crate::cluster::ClusterHeader> = HashMap::new();
        for (id, header) in busy {
            if header.is_head() {
                heads.push((id, header));
            } else {
                wild.insert(id, header);
            }
        }

        let mut entries = BTreeMap::new();
        let mut names = HashMap::new();

        for (head_id, head_header) in heads {
            let head_view = pool.view(head_id);
            let mut elements = Vec::new();
            let mut cursor = head_header.next_cluster_id.get();
            let mut corrupt = false;
            while cursor != 0 {
                match wild.remove(&cursor) {
                    Some(header) => {
                        let next = header.next_cluster_id.get();
                        elements.push(pool.view(cursor));
                        cursor = next;
                    }
                    None => {
                        warn!(
                            "evfs entries: chain from head {head_id} references missing cluster {cursor}, hard-removing"
                        );
                        corrupt = true;
                        break;
                    }
                }
            }

            if corrupt {
                head_view.zero_header()?;
                let mut ids: Vec<u32> = elements.iter().map(|v| v.cluster_id()).collect();
                for view in &elements {
                    view.zero_header()?;
                }
                ids.push(head_id);
                pool.release(&ids);
                continue;
            }

            let name_bytes = head_view.read(0, NAME_SLOT_SIZE)?;
            let name = decode_name(&name_bytes);
            if let Some(name) = &name {
                names.insert(name.clone(), head_id);
            }
            entries.insert(
                head_id,
                Arc::new(Entry {
                    id: head_id,
                    head: head_view,
                    inner: Mutex::new(EntryInner {
                        elements,
                        name,
                        state: EntryState::Normal,
                        refcount: 0,
                        io_refcount: 0,
                        hard_remove_on_detach: false,
                    }),
                }),
            );
        }

        // Unclaimed wild elements belong to no head; free them.
        if !wild.is_empty() {
            let mut ids = Vec::with_capacity(wild.len());
            for (id, _) in wild {
                pool.view(id).zero_header()?;
                ids.push(id);
            }
            pool.release(&ids);
        }

        Ok(Self {
            pool,
            table: Mutex::new(Table { entries, names }),
        })
    }

    pub fn create_entry(&self, name: Option<&str>) -> Result<EntryId> {
        let mut table = self.table.lock().unwrap();
        if let Some(name) = name {
            if table.names.contains_key(name) {
                return Err(Error::AlreadyExists);
            }
        }

        let ids = self.pool.acquire(1).map_err(|err| match err {
            Error::NoSpace => Error::NoSpace,
            other => other,
        })?;
        let head_id = ids[0];
        let head_view = self.pool.view(head_id);

        let raw_size = NAME_SLOT_SIZE;
        head_view.set_head(raw_size)?;
        if let Some(name) = name {
            head_view.write(0, &encode_name(name))?;
        } else {
            head_view.write(0, &[0u8; NAME_SLOT_SIZE as usize])?;
        }

        let entry = Arc::new(Entry {
            id: head_id,
            head: head_view,
            inner: Mutex::new(EntryInner {
                elements: Vec::new(),
                name: name.map(|s| s.to_string()),
                state: EntryState::Normal,
                refcount: 0,
                io_refcount: 0,
                hard_remove_on_detach: false,
            }),
        });

        table.entries.insert(head_id, entry);
        if let Some(name) = name {
            table.names.insert(name.to_string(), head_id);
        }
        trace!("evfs entries: created entry {head_id}");
        Ok(head_id)
    }

    fn apply_mode(inner: &mut EntryInner<D>, mode: RequestMode) -> Result<()> {
        match mode {
            RequestMode::Normal => {
                if inner.state != EntryState::Normal {
                    return Err(Error::BadState);
                }
                inner.refcount += 1;
                inner.io_refcount += 1;
            }
            RequestMode::Open => {
                inner.refcount += 1;
            }
            RequestMode::Busy => {
                if inner.state != EntryState::Normal {
                    return Err(Error::BadState);
                }
                if inner.io_refcount != 0 {
                    return Err(Error::Busy);
                }
                inner.refcount += 1;
                inner.state = EntryState::Busy;
            }
            RequestMode::Mandatory => {
                if inner.io_refcount == 0 {
                    inner.refcount = 0;
                }
            }
        }
        Ok(())
    }

    /// Fetches the entry without touching its refcounts. Used when the
    /// caller already holds a reference by some other means (e.g. a
    /// descriptor that is about to release its own `Open` reference).
    pub fn find(&self, id: EntryId) -> Result<Arc<Entry<D>>> {
        let table = self.table.lock().unwrap();
        table.entries.get(&id).cloned().ok_or(Error::NotFound)
    }

    pub fn lookup(&self, id: EntryId, mode: RequestMode) -> Result<Arc<Entry<D>>> {
        let table = self.table.lock().unwrap();
        let entry = table.entries.get(&id).cloned().ok_or(Error::NotFound)?;
        drop(table);
        let mut inner = entry.inner.lock().unwrap();
        Self::apply_mode(&mut inner, mode)?;
        drop(inner);
        Ok(entry)
    }

    pub fn lookup_by_key(&self, key: &str, mode: RequestMode) -> Result<Arc<Entry<D>>> {
        let table = self.table.lock().unwrap();
        let id = *table.names.get(key).ok_or(Error::NotFound)?;
        let entry = table.entries.get(&id).cloned().ok_or(Error::NotFound)?;
        drop(table);
        let mut inner = entry.inner.lock().unwrap();
        Self::apply_mode(&mut inner, mode)?;
        drop(inner);
        Ok(entry)
    }

    /// Reverses the refcount/io_refcount increments a prior `lookup`
    /// performed with `mode`, then detaches the entry if its refcount has
    /// dropped to zero while it's marked for removal.
    pub fn dereference(&self, entry: &Arc<Entry<D>>, mode: RequestMode) -> Result<()> {
        let should_detach;
        {
            let mut inner = entry.inner.lock().unwrap();
            match mode {
                RequestMode::Normal => {
                    inner.refcount = inner.refcount.saturating_sub(1);
                    inner.io_refcount = inner.io_refcount.saturating_sub(1);
                }
                RequestMode::Open => {
                    inner.refcount = inner.refcount.saturating_sub(1);
                }
                RequestMode::Busy => {
                    inner.refcount = inner.refcount.saturating_sub(1);
                    if inner.state == EntryState::Busy {
                        inner.state = EntryState::Normal;
                    }
                }
                RequestMode::Mandatory => {}
            }
            should_detach = inner.refcount == 0 && inner.state == EntryState::CloseWait;
        }
        if should_detach {
            self.detach(entry)?;
        }
        Ok(())
    }

    fn detach(&self, entry: &Arc<Entry<D>>) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        table.entries.remove(&entry.id);
        let inner = entry.inner.lock().unwrap();
        if let Some(name) = &inner.name {
            table.names.remove(name);
        }
        let hard = inner.hard_remove_on_detach;
        if hard {
            let mut ids: Vec<u32> = inner.elements.iter().map(|v| v.cluster_id()).collect();
            entry.head.zero_header()?;
            for view in &inner.elements {
                view.zero_header()?;
            }
            ids.push(entry.id);
            drop(inner);
            drop(table);
            self.pool.release(&ids);
        } else {
            drop(inner);
            drop(table);
        }
        debug!("evfs entries: detached entry {} (hard={hard})", entry.id);
        Ok(())
    }

    /// Begins removal of `entry`: marks it `CloseWait` (and, if `hard`,
    /// flags it for header rewrite at final detach). The caller must hold
    /// a `Busy` reference obtained just before this call; that reference
    /// is released here, letting any other outstanding holders keep the
    /// entry alive until they finish.
    pub fn begin_erase(&self, entry: &Arc<Entry<D>>, hard: bool) -> Result<()> {
        {
            let mut inner = entry.inner.lock().unwrap();
            inner.state = EntryState::CloseWait;
            inner.hard_remove_on_detach |= hard;
        }
        self.dereference(entry, RequestMode::Busy)
    }

    fn max_userdata(&self) -> u32 {
        self.pool.cache().cluster_size() - crate::cluster::CLUSTER_HEADER_SIZE
    }

    /// Truncates to a raw (name-inclusive) `data_seg_size` of `raw_size`.
    /// Must be called with a `Busy` reference already held on `entry`.
    pub fn truncate_raw(&self, entry: &Arc<Entry<D>>, raw_size: u32) -> Result<()> {
        let cluster_size = self.pool.cache().cluster_size();
        let need = transfer_size_to_cluster_count(cluster_size, raw_size as u64);
        let elem_need = need - 1;

        let mut inner = entry.inner.lock().unwrap();
        let current_raw = entry.head.element_size()?;
        if raw_size == current_raw {
            return Ok(());
        }

        let current_count = inner.elements.len() as u32;
        if elem_need == current_count {
            entry.head.set_head(raw_size)?;
            return Ok(());
        }

        if elem_need < current_count {
            let keep = elem_need as usize;
            let freed: Vec<View<D>> = inner.elements.split_off(keep);
            for view in &freed {
                view.zero_header()?;
            }
            let freed_ids: Vec<u32> = freed.iter().map(|v| v.cluster_id()).collect();
            match inner.elements.last() {
                Some(last) => last.set_next(0)?,
                None => entry.head.set_next(0)?,
            }
            entry.head.set_head(raw_size)?;
            drop(inner);
            self.pool.release(&freed_ids);
            return Ok(());
        }

        // Grow: resize the head first so a crash mid-grow still reports
        // the larger size the caller asked for, matching the source's
        // ordering, then batch-acquire the new elements.
        entry.head.set_head(raw_size)?;
        let grow_by = elem_need - current_count;
        let new_ids = match self.pool.acquire(grow_by) {
            Ok(ids) => ids,
            Err(err) => {
                entry.head.set_head(current_raw)?;
                return Err(err);
            }
        };

        let head_id = entry.id;
        let mut prev_id = inner.elements.last().map(|v| v.cluster_id());
        for id in &new_ids {
            let view = self.pool.view(*id);
            view.init_as_element(head_id)?;
            match prev_id {
                Some(prev) => self.pool.view(prev).set_next(*id)?,
                None => entry.head.set_next(*id)?,
            }
            prev_id = Some(*id);
            inner.elements.push(view);
        }
        Ok(())
    }

    /// Extends `entry` up to the point that `offset + size` (user-visible
    /// bytes) fits, but never shrinks it. Called by the descriptor layer
    /// before a write.
    pub fn lock_elements(&self, entry: &Arc<Entry<D>>, offset: u32, size: u32) -> Result<()> {
        let current_user = entry.user_size()?;
        let required = offset.checked_add(size).ok_or(Error::InvalidArgument)?;
        if required > current_user {
            self.truncate_raw(entry, required + NAME_SLOT_SIZE)?;
        }
        Ok(())
    }

    pub fn read_data(&self, entry: &Arc<Entry<D>>, offset: u32, length: u32) -> Result<Vec<u8>> {
        let user_size = entry.user_size()?;
        let avail = user_size.saturating_sub(offset.min(user_size));
        let length = length.min(avail);
        if length == 0 {
            return Ok(Vec::new());
        }

        let capacity = self.max_userdata();
        let real_off = offset + NAME_SLOT_SIZE;
        let mut view_idx = (real_off / capacity) as usize;
        let mut inner_off = real_off % capacity;
        let mut remaining = length;
        let mut out = Vec::with_capacity(length as usize);

        let inner = entry.inner.lock().unwrap();
        while remaining > 0 {
            let view = if view_idx == 0 {
                &entry.head
            } else {
                inner
                    .elements
                    .get(view_idx - 1)
                    .ok_or(Error::BadState)?
            };
            let take = remaining.min(capacity - inner_off);
            out.extend_from_slice(&view.read(inner_off, take)?);
            remaining -= take;
            view_idx += 1;
            inner_off = 0;
        }
        Ok(out)
    }

    pub fn write_data(&self, entry: &Arc<Entry<D>>, offset: u32, data: &[u8]) -> Result<usize> {
        let capacity = self.max_userdata();
        let real_off = offset + NAME_SLOT_SIZE;
        let mut view_idx = (real_off / capacity) as usize;
        let mut inner_off = real_off % capacity;
        let mut remaining = data.len() as u32;
        let mut cursor = 0usize;

        let inner = entry.inner.lock().unwrap();
        while remaining > 0 {
            let view = if view_idx == 0 {
                &entry.head
            } else {
                match inner.elements.get(view_idx - 1) {
                    Some(view) => view,
                    None => return Err(Error::NoSpace),
                }
            };
            let take = remaining.min(capacity - inner_off);
            view.write(inner_off, &data[cursor..cursor + take as usize])?;
            cursor += take as usize;
            remaining -= take;
            view_idx += 1;
            inner_off = 0;
        }
        Ok(cursor)
    }

    /// Snapshot of every `Normal`-state entry, for the iterator facade.
    pub fn iterate(&self) -> Vec<(EntryId, Option<String>, u32)> {
        let table = self.table.lock().unwrap();
        let mut out = Vec::new();
        for entry in table.entries.values() {
            let inner = entry.inner.lock().unwrap();
            if inner.state != EntryState::Normal {
                continue;
            }
            let size = entry.head.element_size().unwrap_or(0).saturating_sub(NAME_SLOT_SIZE);
            out.push((entry.id, inner.name.clone(), size));
        }
        out
    }

    pub fn stat(&self) -> (u32, u32) {
        let table = self.table.lock().unwrap();
        let usable = self.pool.usable_cluster_count();
        let busy: u32 = table
            .entries
            .values()
            .map(|e| 1 + e.element_count() as u32)
            .sum();
        (usable.saturating_sub(busy), busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::cluster::Volume;
    use evfs_storage::MemBlockDevice;

    fn fresh_table(cluster_size: u32, cluster_count: u32) -> EntryTable<MemBlockDevice> {
        let dev = MemBlockDevice::new(cluster_size as u64 * cluster_count as u64);
        let volume = Volume::create(dev, cluster_size, cluster_count).unwrap();
        let usable = volume.usable_cluster_count();
        let cache = Arc::new(Cache::new(volume, 4).unwrap());
        let busy = ViewPool::scan_busy_clusters(&cache, usable).unwrap();
        let pool = Arc::new(ViewPool::new(
            cache,
            usable,
            &busy.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
        ));
        EntryTable::load(pool, busy).unwrap()
    }

    #[test]
    fn create_then_lookup_by_key_round_trips() {
        let table = fresh_table(128, 16);
        let id = table.create_entry(Some("alpha")).unwrap();
        let entry = table.lookup_by_key("alpha", RequestMode::Normal).unwrap();
        assert_eq!(entry.id, id);
        table.dereference(&entry, RequestMode::Normal).unwrap();
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let table = fresh_table(128, 16);
        table.create_entry(Some("dup")).unwrap();
        assert!(matches!(
            table.create_entry(Some("dup")),
            Err(Error::AlreadyExists)
        ));
    }

    #[test]
    fn write_then_read_round_trips_across_clusters() {
        let table = fresh_table(128, 32);
        let id = table.create_entry(Some("big")).unwrap();
        let entry = table.lookup(id, RequestMode::Busy).unwrap();
        table.lock_elements(&entry, 0, 400).unwrap();
        let payload: Vec<u8> = (0..400u32).map(|i| (i % 251) as u8).collect();
        let written = table.write_data(&entry, 0, &payload).unwrap();
        assert_eq!(written, 400);
        table.dereference(&entry, RequestMode::Busy).unwrap();

        let entry = table.lookup(id, RequestMode::Normal).unwrap();
        let read_back = table.read_data(&entry, 0, 400).unwrap();
        assert_eq!(read_back, payload);
        table.dereference(&entry, RequestMode::Normal).unwrap();
    }

    #[test]
    fn busy_mode_conflicts_with_inflight_io() {
        let table = fresh_table(128, 16);
        let id = table.create_entry(Some("contested")).unwrap();
        let normal = table.lookup(id, RequestMode::Normal).unwrap();
        assert!(matches!(
            table.lookup(id, RequestMode::Busy),
            Err(Error::Busy)
        ));
        table.dereference(&normal, RequestMode::Normal).unwrap();
    }

    #[test]
    fn hard_delete_frees_chain_and_forgets_name() {
        let table = fresh_table(128, 32);
        let id = table.create_entry(Some("gone")).unwrap();
        let entry = table.lookup(id, RequestMode::Busy).unwrap();
        table.lock_elements(&entry, 0, 300).unwrap();
        table.dereference(&entry, RequestMode::Busy).unwrap();

        let entry = table.lookup(id, RequestMode::Busy).unwrap();
        table.begin_erase(&entry, true).unwrap();

        assert!(matches!(
            table.lookup_by_key("gone", RequestMode::Open),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn soft_delete_retains_chain_on_disk() {
        let table = fresh_table(128, 32);
        let id = table.create_entry(Some("kept")).unwrap();
        let entry = table.lookup(id, RequestMode::Busy).unwrap();
        table.lock_elements(&entry, 0, 5).unwrap();
        table.write_data(&entry, 0, b"stays").unwrap();
        table.dereference(&entry, RequestMode::Busy).unwrap();

        let entry = table.lookup(id, RequestMode::Busy).unwrap();
        let head_id = entry.head.cluster_id();
        table.begin_erase(&entry, false).unwrap();

        assert!(matches!(
            table.lookup_by_key("kept", RequestMode::Open),
            Err(Error::NotFound)
        ));
        let view = table.pool.view(head_id);
        assert!(view.is_head().unwrap());
        assert_eq!(view.read(32, 5).unwrap(), b"stays");
    }

    #[test]
    fn shrink_then_grow_truncate_preserves_head_bytes() {
        let table = fresh_table(128, 32);
        let id = table.create_entry(Some("t")).unwrap();
        let entry = table.lookup(id, RequestMode::Busy).unwrap();
        table.lock_elements(&entry, 0, 300).unwrap();
        table.write_data(&entry, 0, b"hello").unwrap();
        table.truncate_raw(&entry, 10 + NAME_SLOT_SIZE).unwrap();
        assert_eq!(entry.user_size().unwrap(), 10);
        table.truncate_raw(&entry, 300 + NAME_SLOT_SIZE).unwrap();
        let read_back = table.read_data(&entry, 0, 5).unwrap();
        assert_eq!(read_back, b"hello");
        table.dereference(&entry, RequestMode::Busy).unwrap();
    }
}
