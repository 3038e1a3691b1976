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

//! Embedded virtual file system: a single-file, block-structured, cached
//! object store. [`Evfs`] is the whole public surface; everything below
//! it (cluster/volume, cache, view, entries) is an implementation detail
//! reached only through this facade.

pub mod cache;
pub mod cluster;
mod descriptor;
pub mod entries;
pub mod view;

use std::path::Path;
use std::sync::{Arc, Mutex};

use evfs_err::{Error, Result};
use evfs_storage::{BlockDevice, FileBlockDevice, MemBlockDevice};
use log::info;

use cache::Cache;
use cluster::Volume;
use descriptor::{HandleTable, RawHandle};
use entries::{EntryId, EntryTable, RequestMode, NAME_SLOT_SIZE};
use view::ViewPool;

/// Handle-table tags. Every handle minted by a table is stamped with its
/// tag, so a handle from the wrong table is rejected outright rather than
/// risking a coincidental hit on an unrelated live slot.
const DESCRIPTOR_TAG: u16 = 0x4664; // "Fd"
/// `'retI'` truncated to 16 bits: the source's iterator magic constant.
const ITERATOR_TAG: u16 = 0x7449;

pub type Handle = RawHandle;

#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub cluster_count: u32,
    pub cluster_size: u32,
    pub idle: u32,
    pub busy: u32,
    pub entries: u32,
}

struct OpenDescriptor {
    entry_id: EntryId,
    offset: u32,
}

struct Iterator_ {
    items: Vec<(EntryId, Option<String>, u32)>,
    cursor: usize,
}

pub struct EntryMeta {
    pub entry_id: EntryId,
    pub key: Option<String>,
    pub size: u32,
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > (NAME_SLOT_SIZE - 1) as usize {
        return Err(Error::InvalidArgument);
    }
    let legal = key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.');
    if !legal {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

/// A mounted volume: the single entry point hosting programs use.
pub struct Evfs<D: BlockDevice + 'static> {
    pool: Arc<ViewPool<D>>,
    entries: EntryTable<D>,
    handles: Mutex<HandleTable<OpenDescriptor>>,
    iterators: Mutex<HandleTable<Iterator_>>,
}

impl Evfs<FileBlockDevice> {
    /// Creates a new volume at `path` and mounts it. `EEXIST` if a file
    /// is already there.
    pub fn create<P: AsRef<Path>>(
        path: P,
        cluster_size: u32,
        cluster_count: u32,
        cache_count: u32,
    ) -> Result<Self> {
        let device = FileBlockDevice::create(path)?;
        let volume = Volume::create(device, cluster_size, cluster_count)?;
        Self::mount_fresh(volume, cache_count)
    }

    /// Mounts an existing volume at `path`.
    pub fn open<P: AsRef<Path>>(path: P, cache_count: u32) -> Result<Self> {
        let device = FileBlockDevice::open(path)?;
        let volume = Volume::open(device)?;
        Self::mount_existing(volume, cache_count)
    }
}

impl Evfs<MemBlockDevice> {
    /// In-memory volume, for hosts (and tests) that don't need a real file.
    pub fn create_in_memory(
        cluster_size: u32,
        cluster_count: u32,
        cache_count: u32,
    ) -> Result<Self> {
        let device = MemBlockDevice::new(cluster_size as u64 * cluster_count as u64);
        let volume = Volume::create(device, cluster_size, cluster_count)?;
        Self::mount_fresh(volume, cache_count)
    }
}

impl<D: BlockDevice + 'static> Evfs<D> {
    fn mount_fresh(volume: Volume<D>, cache_count: u32) -> Result<Self> {
        let usable = volume.usable_cluster_count();
        let cache = Arc::new(Cache::new(volume, cache_count)?);
        let pool = Arc::new(ViewPool::new(cache, usable, &[]));
        let entries = EntryTable::load(pool.clone(), Vec::new())?;
        info!("evfs: created volume with {usable} usable clusters");
        Ok(Self {
            pool,
            entries,
            handles: Mutex::new(HandleTable::new(DESCRIPTOR_TAG)),
            iterators: Mutex::new(HandleTable::new(ITERATOR_TAG)),
        })
    }

    fn mount_existing(volume: Volume<D>, cache_count: u32) -> Result<Self> {
        let usable = volume.usable_cluster_count();
        let cache = Arc::new(Cache::new(volume, cache_count)?);
        let busy = ViewPool::scan_busy_clusters(&cache, usable)?;
        let busy_ids: Vec<u32> = busy.iter().map(|(id, _)| *id).collect();
        let pool = Arc::new(ViewPool::new(cache, usable, &busy_ids));
        let entries = EntryTable::load(pool.clone(), busy)?;
        info!("evfs: mounted volume with {usable} usable clusters");
        Ok(Self {
            pool,
            entries,
            handles: Mutex::new(HandleTable::new(DESCRIPTOR_TAG)),
            iterators: Mutex::new(HandleTable::new(ITERATOR_TAG)),
        })
    }

    /// Closes every outstanding descriptor and iterator, flushes, and
    /// drops every component.
    pub fn close(self) -> Result<()> {
        let descriptors = self.handles.lock().unwrap().drain();
        for descriptor in descriptors {
            if let Ok(entry) = self.entries.find(descriptor.entry_id) {
                self.entries.dereference(&entry, RequestMode::Open)?;
            }
        }
        self.iterators.lock().unwrap().drain();
        self.pool.cache().flush(false);
        Ok(())
    }

    pub fn create_entry(&self, key: Option<&str>) -> Result<Handle> {
        if let Some(key) = key {
            validate_key(key)?;
        }
        let entry_id = self.entries.create_entry(key)?;
        self.open_entry(entry_id)
    }

    pub fn open_entry(&self, entry_id: EntryId) -> Result<Handle> {
        let entry = self.entries.lookup(entry_id, RequestMode::Open)?;
        let mut handles = self.handles.lock().unwrap();
        Ok(handles.insert(OpenDescriptor {
            entry_id: entry.id,
            offset: 0,
        }))
    }

    pub fn open_entry_by_key(&self, key: &str) -> Result<Handle> {
        validate_key(key)?;
        let entry = self.entries.lookup_by_key(key, RequestMode::Open)?;
        let mut handles = self.handles.lock().unwrap();
        Ok(handles.insert(OpenDescriptor {
            entry_id: entry.id,
            offset: 0,
        }))
    }

    /// Closes the handle, releasing its logical reference on the entry.
    pub fn close_entry(&self, handle: Handle) -> Result<()> {
        let entry_id = {
            let mut handles = self.handles.lock().unwrap();
            handles.remove(handle)?.entry_id
        };
        let entry = self.entries.find(entry_id)?;
        self.entries.dereference(&entry, RequestMode::Open)
    }

    fn entry_id_of(&self, handle: Handle) -> Result<EntryId> {
        Ok(self.handles.lock().unwrap().get(handle)?.entry_id)
    }

    pub fn write_entry(&self, handle: Handle, buf: &[u8]) -> Result<usize> {
        let offset = {
            let handles = self.handles.lock().unwrap();
            handles.get(handle)?.offset
        };
        let entry_id = self.entry_id_of(handle)?;
        let entry = self.entries.lookup(entry_id, RequestMode::Busy)?;
        let result = (|| {
            self.entries.lock_elements(&entry, offset, buf.len() as u32)?;
            self.entries.write_data(&entry, offset, buf)
        })();
        self.entries.dereference(&entry, RequestMode::Busy)?;
        let written = result?;
        let mut handles = self.handles.lock().unwrap();
        handles.get_mut(handle)?.offset += written as u32;
        Ok(written)
    }

    pub fn read_entry(&self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        let offset = {
            let handles = self.handles.lock().unwrap();
            handles.get(handle)?.offset
        };
        let entry_id = self.entry_id_of(handle)?;
        let entry = self.entries.lookup(entry_id, RequestMode::Normal)?;
        let result = self.entries.read_data(&entry, offset, buf.len() as u32);
        self.entries.dereference(&entry, RequestMode::Normal)?;
        let data = result?;
        buf[..data.len()].copy_from_slice(&data);
        let mut handles = self.handles.lock().unwrap();
        handles.get_mut(handle)?.offset += data.len() as u32;
        Ok(data.len())
    }

    pub fn seek(&self, handle: Handle, offset: u32) -> Result<()> {
        let mut handles = self.handles.lock().unwrap();
        handles.get_mut(handle)?.offset = offset;
        Ok(())
    }

    pub fn truncate(&self, handle: Handle, size: u32) -> Result<()> {
        let entry_id = self.entry_id_of(handle)?;
        let entry = self.entries.lookup(entry_id, RequestMode::Busy)?;
        let result = self.entries.truncate_raw(&entry, size + NAME_SLOT_SIZE);
        self.entries.dereference(&entry, RequestMode::Busy)?;
        result
    }

    pub fn flush(&self, handle: Handle) -> Result<()> {
        let entry_id = self.entry_id_of(handle)?;
        let entry = self.entries.find(entry_id)?;
        for cluster_id in entry.cluster_ids() {
            self.pool.cache().flush_block(cluster_id, false);
        }
        Ok(())
    }

    pub fn erase(&self, handle: Handle) -> Result<()> {
        let entry_id = self.entry_id_of(handle)?;
        let entry = self.entries.lookup(entry_id, RequestMode::Busy)?;
        self.entries.begin_erase(&entry, true)
    }

    pub fn erase_by_name(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let entry = self.entries.lookup_by_key(key, RequestMode::Busy)?;
        self.entries.begin_erase(&entry, true)
    }

    pub fn entry_len(&self, handle: Handle) -> Result<u32> {
        let entry_id = self.entry_id_of(handle)?;
        let entry = self.entries.lookup(entry_id, RequestMode::Open)?;
        let size = entry.user_size();
        self.entries.dereference(&entry, RequestMode::Open)?;
        size
    }

    pub fn iterate_entries(&self, iter: Option<Handle>) -> Result<(Handle, Option<EntryMeta>)> {
        let mut iterators = self.iterators.lock().unwrap();
        let handle = match iter {
            Some(handle) => handle,
            None => {
                let items = self.entries.iterate();
                iterators.insert(Iterator_ { items, cursor: 0 })
            }
        };
        let state = iterators.get_mut(handle)?;
        let item = state.items.get(state.cursor).cloned().map(|(entry_id, key, size)| {
            state.cursor += 1;
            EntryMeta { entry_id, key, size }
        });
        Ok((handle, item))
    }

    pub fn release_iterator(&self, iter: Handle) -> Result<()> {
        let mut iterators = self.iterators.lock().unwrap();
        iterators.remove(iter)?;
        Ok(())
    }

    pub fn query_stat(&self) -> Stat {
        let (idle, busy) = self.entries.stat();
        Stat {
            cluster_count: self.pool.usable_cluster_count() + 1,
            cluster_size: self.pool.cache().cluster_size(),
            idle,
            busy,
            entries: self.entries.iterate().len() as u32,
        }
    }

    pub fn cache_hit_rate(&self) -> f32 {
        self.pool.cache().hit_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_close_then_reopen_round_trips() {
        let evfs = Evfs::create_in_memory(128, 64, 8).unwrap();
        let h = evfs.create_entry(Some("alpha")).unwrap();
        evfs.write_entry(h, b"hello").unwrap();
        evfs.close_entry(h).unwrap();

        let h2 = evfs.open_entry_by_key("alpha").unwrap();
        evfs.seek(h2, 0).unwrap();
        let mut buf = [0u8; 5];
        let n = evfs.read_entry(h2, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(evfs.entry_len(h2).unwrap(), 5);
    }

    #[test]
    fn create_entry_rejects_illegal_key() {
        let evfs = Evfs::create_in_memory(128, 16, 4).unwrap();
        assert!(matches!(
            evfs.create_entry(Some("has space")),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            evfs.create_entry(Some("")),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn erase_by_name_then_reopen_is_not_found() {
        let evfs = Evfs::create_in_memory(128, 32, 4).unwrap();
        let h = evfs.create_entry(Some("gone")).unwrap();
        evfs.write_entry(h, b"payload").unwrap();
        evfs.close_entry(h).unwrap();
        evfs.erase_by_name("gone").unwrap();
        assert!(matches!(
            evfs.open_entry_by_key("gone"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn iterate_entries_lists_every_normal_entry() {
        let evfs = Evfs::create_in_memory(128, 32, 4).unwrap();
        let h1 = evfs.create_entry(Some("one")).unwrap();
        let h2 = evfs.create_entry(Some("two")).unwrap();
        evfs.close_entry(h1).unwrap();
        evfs.close_entry(h2).unwrap();

        let mut seen = Vec::new();
        let (mut iter, mut item) = evfs.iterate_entries(None).unwrap();
        while let Some(meta) = item {
            seen.push(meta.key.unwrap());
            let next = evfs.iterate_entries(Some(iter)).unwrap();
            iter = next.0;
            item = next.1;
        }
        evfs.release_iterator(iter).unwrap();
        seen.sort();
        assert_eq!(seen, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn query_stat_reports_cluster_accounting() {
        let evfs = Evfs::create_in_memory(128, 16, 4).unwrap();
        let stat = evfs.query_stat();
        assert_eq!(stat.cluster_count, 16);
        assert_eq!(stat.cluster_size, 128);
        assert_eq!(stat.idle + stat.busy, 15);
    }
}
