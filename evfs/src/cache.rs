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

//! Write-back LRU cache over cluster ids, backed by a single background
//! I/O thread that merges cached and direct requests into one FIFO queue.
//!
//! The block map (lru/dirty/idle lists, the `cluster_id -> block` index)
//! is touched only by the background thread, so it needs no lock of its
//! own; the one thing genuinely shared across threads is the task queue,
//! guarded by a `Mutex` + `Condvar` pair, matching the locking discipline
//! the core specifies for the cache.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use evfs_err::{Error, Result};
use evfs_storage::BlockDevice;
use log::{debug, trace, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::cluster::{ClusterHeader, Volume, CLUSTER_HEADER_SIZE};

const MAX_PENDING_TASKS: usize = 160;
const THREAD_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Same schedule a well-known in-memory store uses for its own background
/// snapshotting: a few large batches flush quickly, a handful of writes
/// eventually flush even if nothing else happens.
const AUTOFLUSH_RULES: [(u64, Duration); 3] = [
    (10_000, Duration::from_secs(60)),
    (10, Duration::from_secs(300)),
    (1, Duration::from_secs(900)),
];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BlockState {
    Idle,
    Clean,
    Dirty,
}

const NIL: usize = usize::MAX;

struct Block {
    cluster_id: u32,
    state: BlockState,
    data: Vec<u8>,
    prev: usize,
    next: usize,
    dirty_prev: usize,
    dirty_next: usize,
}

#[derive(Default)]
struct BlockList {
    head: usize,
    tail: usize,
    count: u32,
}

impl BlockList {
    fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            count: 0,
        }
    }
}

/// Arena of cache blocks plus the three intrusive lists (idle, lru, dirty)
/// threaded through them via arena indices, per the core's guidance to
/// replace pointer-linked nodes with an arena + index rather than owning
/// pointers.
struct BlockArena {
    blocks: Vec<Block>,
    idle: BlockList,
    lru: BlockList,
    dirty: BlockList,
    lru_index: BTreeMap<u32, usize>,
}

impl BlockArena {
    fn new() -> Self {
        Self {
            blocks: Vec::new(),
            idle: BlockList::new(),
            lru: BlockList::new(),
            dirty: BlockList::new(),
            lru_index: BTreeMap::new(),
        }
    }

    fn push_idle(&mut self, idx: usize) {
        let block = &mut self.blocks[idx];
        block.cluster_id = 0;
        block.state = BlockState::Idle;
        block.prev = self.idle.tail;
        block.next = NIL;
        if self.idle.tail != NIL {
            self.blocks[self.idle.tail].next = idx;
        } else {
            self.idle.head = idx;
        }
        self.idle.tail = idx;
        self.idle.count += 1;
    }

    fn pop_idle(&mut self) -> Option<usize> {
        if self.idle.head == NIL {
            return None;
        }
        let idx = self.idle.head;
        self.idle.head = self.blocks[idx].next;
        if self.idle.head != NIL {
            self.blocks[self.idle.head].prev = NIL;
        } else {
            self.idle.tail = NIL;
        }
        self.idle.count -= 1;
        Some(idx)
    }

    fn push_lru_tail(&mut self, idx: usize) {
        let block = &mut self.blocks[idx];
        block.prev = self.lru.tail;
        block.next = NIL;
        if self.lru.tail != NIL {
            self.blocks[self.lru.tail].next = idx;
        } else {
            self.lru.head = idx;
        }
        self.lru.tail = idx;
        self.lru.count += 1;
        self.lru_index.insert(self.blocks[idx].cluster_id, idx);
    }

    fn unlink_lru(&mut self, idx: usize) {
        let (prev, next) = (self.blocks[idx].prev, self.blocks[idx].next);
        if prev != NIL {
            self.blocks[prev].next = next;
        } else {
            self.lru.head = next;
        }
        if next != NIL {
            self.blocks[next].prev = prev;
        } else {
            self.lru.tail = prev;
        }
        self.lru.count -= 1;
        self.lru_index.remove(&self.blocks[idx].cluster_id);
    }

    fn pop_lru_front(&mut self) -> Option<usize> {
        if self.lru.head == NIL {
            return None;
        }
        let idx = self.lru.head;
        self.unlink_lru(idx);
        Some(idx)
    }

    fn move_lru_to_tail(&mut self, idx: usize) {
        self.unlink_lru(idx);
        self.push_lru_tail(idx);
    }

    fn push_dirty(&mut self, idx: usize) {
        if self.blocks[idx].state == BlockState::Dirty {
            return;
        }
        self.blocks[idx].state = BlockState::Dirty;
        let block = &mut self.blocks[idx];
        block.dirty_prev = self.dirty.tail;
        block.dirty_next = NIL;
        if self.dirty.tail != NIL {
            self.blocks[self.dirty.tail].dirty_next = idx;
        } else {
            self.dirty.head = idx;
        }
        self.dirty.tail = idx;
        self.dirty.count += 1;
    }

    fn remove_dirty(&mut self, idx: usize) {
        if self.blocks[idx].state != BlockState::Dirty {
            return;
        }
        let (prev, next) = (self.blocks[idx].dirty_prev, self.blocks[idx].dirty_next);
        if prev != NIL {
            self.blocks[prev].dirty_next = next;
        } else {
            self.dirty.head = next;
        }
        if next != NIL {
            self.blocks[next].dirty_prev = prev;
        } else {
            self.dirty.tail = prev;
        }
        self.dirty.count -= 1;
        self.blocks[idx].state = BlockState::Clean;
    }

    fn search_lru(&self, cluster_id: u32) -> Option<usize> {
        self.lru_index.get(&cluster_id).copied()
    }

    fn add_idle_blocks(&mut self, count: u32, cluster_size: u32) -> u32 {
        let mut added = 0;
        for _ in 0..count {
            let idx = self.blocks.len();
            self.blocks.push(Block {
                cluster_id: 0,
                state: BlockState::Idle,
                data: vec![0u8; cluster_size as usize],
                prev: NIL,
                next: NIL,
                dirty_prev: NIL,
                dirty_next: NIL,
            });
            self.push_idle(idx);
            added += 1;
        }
        added
    }
}

struct CacheState<D: BlockDevice> {
    volume: Volume<D>,
    arena: BlockArena,
    cache_enabled: bool,
    writes_since_flush: u64,
    last_flush: Instant,
}

impl<D: BlockDevice> CacheState<D> {
    fn flush_block_if_dirty(&mut self, idx: usize) -> Result<()> {
        if self.arena.blocks[idx].state == BlockState::Dirty {
            let cluster_id = self.arena.blocks[idx].cluster_id;
            self.volume
                .write_cluster(cluster_id, &self.arena.blocks[idx].data)?;
            self.arena.remove_dirty(idx);
        }
        Ok(())
    }

    fn flush_all(&mut self) {
        let mut cursor = self.arena.dirty.head;
        while cursor != NIL {
            let next = self.arena.blocks[cursor].dirty_next;
            if let Err(err) = self.flush_block_if_dirty(cursor) {
                warn!("evfs cache: autoflush of cluster failed: {err}");
            }
            cursor = next;
        }
    }

    fn flush_one(&mut self, cluster_id: u32) -> Result<()> {
        if let Some(idx) = self.arena.search_lru(cluster_id) {
            self.flush_block_if_dirty(idx)?;
        }
        Ok(())
    }

    fn maybe_autoflush(&mut self) {
        let elapsed = self.last_flush.elapsed();
        let due = AUTOFLUSH_RULES
            .iter()
            .any(|(writes, period)| self.writes_since_flush >= *writes && elapsed >= *period);
        if due {
            trace!(
                "evfs cache: autoflush firing after {} writes, {:?} elapsed",
                self.writes_since_flush,
                elapsed
            );
            self.flush_all();
            self.writes_since_flush = 0;
            self.last_flush = Instant::now();
        }
    }

    fn read_harddisk(&self, cluster_id: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        let mut cluster = vec![0u8; self.volume.cluster_size() as usize];
        self.volume.read_cluster(cluster_id, &mut cluster)?;
        Ok(cluster[offset as usize..offset as usize + length as usize].to_vec())
    }

    fn write_harddisk(&self, cluster_id: u32, offset: u32, data: &[u8]) -> Result<()> {
        let mut cluster = vec![0u8; self.volume.cluster_size() as usize];
        self.volume.read_cluster(cluster_id, &mut cluster)?;
        cluster[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        self.volume.write_cluster(cluster_id, &cluster)
    }

    fn read(&mut self, cluster_id: u32, offset: u32, length: u32, stats: &Stats) -> Result<Vec<u8>> {
        if !self.cache_enabled {
            return self.read_harddisk(cluster_id, offset, length);
        }

        if let Some(idx) = self.arena.search_lru(cluster_id) {
            self.arena.move_lru_to_tail(idx);
            stats.hit.fetch_add(1, Ordering::Relaxed);
            let block = &self.arena.blocks[idx];
            return Ok(block.data[offset as usize..offset as usize + length as usize].to_vec());
        }
        stats.miss.fetch_add(1, Ordering::Relaxed);

        if let Some(idx) = self.arena.pop_idle() {
            self.volume
                .read_cluster(cluster_id, &mut self.arena.blocks[idx].data)?;
            self.arena.blocks[idx].cluster_id = cluster_id;
            self.arena.blocks[idx].state = BlockState::Clean;
            self.arena.push_lru_tail(idx);
            let block = &self.arena.blocks[idx];
            return Ok(block.data[offset as usize..offset as usize + length as usize].to_vec());
        }

        let idx = self.arena.pop_lru_front().ok_or(Error::OutOfMemory)?;
        self.flush_block_if_dirty(idx)?;
        self.volume
            .read_cluster(cluster_id, &mut self.arena.blocks[idx].data)?;
        self.arena.blocks[idx].cluster_id = cluster_id;
        self.arena.blocks[idx].state = BlockState::Clean;
        self.arena.push_lru_tail(idx);
        let block = &self.arena.blocks[idx];
        Ok(block.data[offset as usize..offset as usize + length as usize].to_vec())
    }

    fn write(&mut self, cluster_id: u32, offset: u32, data: &[u8], stats: &Stats) -> Result<()> {
        if !self.cache_enabled {
            return self.write_harddisk(cluster_id, offset, data);
        }

        if let Some(idx) = self.arena.search_lru(cluster_id) {
            self.arena.move_lru_to_tail(idx);
            stats.hit.fetch_add(1, Ordering::Relaxed);
            let block = &mut self.arena.blocks[idx];
            block.data[offset as usize..offset as usize + data.len()].copy_from_slice(data);
            self.arena.push_dirty(idx);
            self.writes_since_flush += 1;
            return Ok(());
        }
        stats.miss.fetch_add(1, Ordering::Relaxed);

        if let Some(idx) = self.arena.pop_idle() {
            self.volume
                .read_cluster(cluster_id, &mut self.arena.blocks[idx].data)?;
            self.arena.blocks[idx].cluster_id = cluster_id;
            self.arena.blocks[idx].data[offset as usize..offset as usize + data.len()]
                .copy_from_slice(data);
            self.arena.push_lru_tail(idx);
            self.arena.push_dirty(idx);
            self.writes_since_flush += 1;
            return Ok(());
        }

        let idx = self.arena.pop_lru_front().ok_or(Error::OutOfMemory)?;
        self.flush_block_if_dirty(idx)?;
        self.volume
            .read_cluster(cluster_id, &mut self.arena.blocks[idx].data)?;
        self.arena.blocks[idx].cluster_id = cluster_id;
        self.arena.blocks[idx].data[offset as usize..offset as usize + data.len()]
            .copy_from_slice(data);
        self.arena.push_lru_tail(idx);
        self.arena.push_dirty(idx);
        self.writes_since_flush += 1;
        Ok(())
    }
}

#[derive(Default)]
struct Stats {
    hit: AtomicU64,
    miss: AtomicU64,
}

enum CacheOp {
    Read { cluster_id: u32, offset: u32, length: u32 },
    ReadDirect { cluster_id: u32 },
    ReadHeadDirect { cluster_id: u32 },
    Write { cluster_id: u32, offset: u32, data: Vec<u8> },
    WriteDirect { cluster_id: u32, data: Vec<u8> },
    FlushAll,
    FlushBlock { cluster_id: u32 },
    AddBlocks { count: u32 },
    Expand,
    Close,
}

enum CacheReply {
    Bytes(Vec<u8>),
    Expanded(u32, u32),
    Unit,
}

struct CacheTask {
    op: CacheOp,
    reply: Option<SyncSender<Result<CacheReply>>>,
}

struct TaskQueue {
    tasks: Mutex<std::collections::VecDeque<CacheTask>>,
    signal: Condvar,
    stopped: Mutex<bool>,
}

impl TaskQueue {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(std::collections::VecDeque::new()),
            signal: Condvar::new(),
            stopped: Mutex::new(false),
        }
    }

    fn push(&self, task: CacheTask) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if *self.stopped.lock().unwrap() {
            return Err(Error::NotReady);
        }
        if tasks.len() >= MAX_PENDING_TASKS {
            return Err(Error::OutOfMemory);
        }
        tasks.push_back(task);
        drop(tasks);
        self.signal.notify_one();
        Ok(())
    }
}

/// Bounded write-back LRU cache over cluster ids, served by one background
/// thread. Generic over the backing store so tests can run entirely
/// in-memory.
pub struct Cache<D: BlockDevice + 'static> {
    queue: Arc<TaskQueue>,
    stats: Arc<Stats>,
    cluster_size: u32,
    worker: Option<JoinHandle<()>>,
}

impl<D: BlockDevice + 'static> Cache<D> {
    /// `cache_cluster_count == 0` disables the cache: every call bypasses
    /// to disk, and this is success, not an error.
    pub fn new(volume: Volume<D>, cache_cluster_count: u32) -> Result<Self> {
        let cluster_size = volume.cluster_size();
        let mut arena = BlockArena::new();
        if cache_cluster_count > 0 {
            let added = arena.add_idle_blocks(cache_cluster_count, cluster_size);
            if added == 0 {
                return Err(Error::OutOfMemory);
            }
        }

        let state = CacheState {
            volume,
            arena,
            cache_enabled: cache_cluster_count > 0,
            writes_since_flush: 0,
            last_flush: Instant::now(),
        };

        let queue = Arc::new(TaskQueue::new());
        let stats = Arc::new(Stats::default());

        let worker_queue = queue.clone();
        let worker_stats = stats.clone();
        let worker = std::thread::spawn(move || run_worker(state, worker_queue, worker_stats));

        Ok(Self {
            queue,
            stats,
            cluster_size,
            worker: Some(worker),
        })
    }

    fn submit(&self, op: CacheOp, no_wait: bool) -> Result<CacheReply> {
        if no_wait {
            self.queue.push(CacheTask { op, reply: None })?;
            return Ok(CacheReply::Unit);
        }
        let (tx, rx) = sync_channel(1);
        self.queue.push(CacheTask {
            op,
            reply: Some(tx),
        })?;
        rx.recv().map_err(|_| Error::NotReady)?
    }

    pub fn read(&self, cluster_id: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        if cluster_id == 0 || offset + length > self.cluster_size {
            return Err(Error::InvalidArgument);
        }
        match self.submit(
            CacheOp::Read {
                cluster_id,
                offset,
                length,
            },
            false,
        )? {
            CacheReply::Bytes(data) => Ok(data),
            _ => unreachable!(),
        }
    }

    pub fn read_head(&self, cluster_id: u32) -> Result<ClusterHeader> {
        let bytes = self.read(cluster_id, 0, CLUSTER_HEADER_SIZE)?;
        ClusterHeader::read_from_bytes(&bytes).map_err(|_| Error::BadState)
    }

    pub fn read_userdata(&self, cluster_id: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        if offset + length > self.cluster_size - CLUSTER_HEADER_SIZE {
            return Err(Error::InvalidArgument);
        }
        self.read(cluster_id, offset + CLUSTER_HEADER_SIZE, length)
    }

    pub fn read_directly(&self, cluster_id: u32) -> Result<Vec<u8>> {
        if cluster_id == 0 {
            return Err(Error::InvalidArgument);
        }
        match self.submit(CacheOp::ReadDirect { cluster_id }, false)? {
            CacheReply::Bytes(data) => Ok(data),
            _ => unreachable!(),
        }
    }

    pub fn read_head_directly(&self, cluster_id: u32) -> Result<ClusterHeader> {
        if cluster_id == 0 {
            return Err(Error::InvalidArgument);
        }
        match self.submit(CacheOp::ReadHeadDirect { cluster_id }, false)? {
            CacheReply::Bytes(data) => {
                ClusterHeader::read_from_bytes(&data).map_err(|_| Error::BadState)
            }
            _ => unreachable!(),
        }
    }

    pub fn write(&self, cluster_id: u32, offset: u32, data: &[u8]) -> Result<()> {
        if cluster_id == 0 || offset + data.len() as u32 > self.cluster_size {
            return Err(Error::InvalidArgument);
        }
        self.submit(
            CacheOp::Write {
                cluster_id,
                offset,
                data: data.to_vec(),
            },
            false,
        )?;
        Ok(())
    }

    pub fn write_head(&self, cluster_id: u32, header: &ClusterHeader) -> Result<()> {
        self.write(cluster_id, 0, header.as_bytes())
    }

    pub fn write_userdata(&self, cluster_id: u32, offset: u32, data: &[u8]) -> Result<()> {
        if offset + data.len() as u32 > self.cluster_size - CLUSTER_HEADER_SIZE {
            return Err(Error::InvalidArgument);
        }
        self.write(cluster_id, offset + CLUSTER_HEADER_SIZE, data)
    }

    pub fn write_directly(&self, cluster_id: u32, data: &[u8]) -> Result<()> {
        if cluster_id == 0 {
            return Err(Error::InvalidArgument);
        }
        self.submit(
            CacheOp::WriteDirect {
                cluster_id,
                data: data.to_vec(),
            },
            false,
        )?;
        Ok(())
    }

    pub fn flush(&self, no_wait: bool) {
        let _ = self.submit(CacheOp::FlushAll, no_wait);
    }

    pub fn flush_block(&self, cluster_id: u32, no_wait: bool) {
        let _ = self.submit(CacheOp::FlushBlock { cluster_id }, no_wait);
    }

    pub fn add_block(&self, count: u32) -> Result<()> {
        self.submit(CacheOp::AddBlocks { count }, false)?;
        Ok(())
    }

    /// Runs `Volume::expand` on the background thread, since the volume is
    /// only ever touched there. Returns the first new cluster id and the
    /// number of clusters added in this batch.
    pub fn expand(&self) -> Result<(u32, u32)> {
        match self.submit(CacheOp::Expand, false)? {
            CacheReply::Expanded(first, count) => Ok((first, count)),
            _ => unreachable!(),
        }
    }

    pub fn hit_rate(&self) -> f32 {
        let hit = self.stats.hit.load(Ordering::Relaxed);
        let miss = self.stats.miss.load(Ordering::Relaxed);
        if hit + miss == 0 {
            return 0.0;
        }
        hit as f32 / (hit + miss) as f32
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }
}

impl<D: BlockDevice + 'static> Drop for Cache<D> {
    fn drop(&mut self) {
        let _ = self.submit(CacheOp::Close, false);
        *self.queue.stopped.lock().unwrap() = true;
        self.queue.signal.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker<D: BlockDevice + 'static>(
    mut state: CacheState<D>,
    queue: Arc<TaskQueue>,
    stats: Arc<Stats>,
) {
    loop {
        let task = {
            let mut tasks = queue.tasks.lock().unwrap();
            loop {
                if let Some(task) = tasks.pop_front() {
                    break Some(task);
                }
                if *queue.stopped.lock().unwrap() {
                    break None;
                }
                let (guard, timeout) = queue
                    .signal
                    .wait_timeout(tasks, THREAD_WAIT_TIMEOUT)
                    .unwrap();
                tasks = guard;
                if timeout.timed_out() && tasks.is_empty() {
                    drop(tasks);
                    state.maybe_autoflush();
                    tasks = queue.tasks.lock().unwrap();
                }
            }
        };

        let Some(task) = task else {
            break;
        };

        execute(&mut state, &stats, task);
        state.maybe_autoflush();
    }

    // Drain whatever is left after shutdown was requested, per the core's
    // "forcibly complete pending tasks" shutdown contract.
    loop {
        let task = queue.tasks.lock().unwrap().pop_front();
        match task {
            Some(task) => execute(&mut state, &stats, task),
            None => break,
        }
    }
}

fn execute<D: BlockDevice + 'static>(state: &mut CacheState<D>, stats: &Stats, task: CacheTask) {
    let result: Result<CacheReply> = match task.op {
        CacheOp::Read {
            cluster_id,
            offset,
            length,
        } => state
            .read(cluster_id, offset, length, stats)
            .map(CacheReply::Bytes),
        CacheOp::ReadDirect { cluster_id } => {
            let mut buf = vec![0u8; state.volume.cluster_size() as usize];
            state
                .volume
                .read_cluster(cluster_id, &mut buf)
                .map(|_| CacheReply::Bytes(buf))
        }
        CacheOp::ReadHeadDirect { cluster_id } => state
            .volume
            .read_cluster_head(cluster_id)
            .map(|h| CacheReply::Bytes(h.as_bytes().to_vec())),
        CacheOp::Write {
            cluster_id,
            offset,
            data,
        } => state
            .write(cluster_id, offset, &data, stats)
            .map(|_| CacheReply::Unit),
        CacheOp::WriteDirect { cluster_id, data } => {
            state.volume.write_cluster(cluster_id, &data).map(|_| CacheReply::Unit)
        }
        CacheOp::FlushAll => {
            state.flush_all();
            Ok(CacheReply::Unit)
        }
        CacheOp::FlushBlock { cluster_id } => state.flush_one(cluster_id).map(|_| CacheReply::Unit),
        CacheOp::AddBlocks { count } => {
            let cluster_size = state.volume.cluster_size();
            let added = state.arena.add_idle_blocks(count, cluster_size);
            if added == 0 {
                Err(Error::OutOfMemory)
            } else {
                state.cache_enabled = true;
                Ok(CacheReply::Unit)
            }
        }
        CacheOp::Expand => {
            let batch = state.volume.expand_cluster_count();
            state
                .volume
                .expand()
                .map(|first| CacheReply::Expanded(first, batch))
        }
        CacheOp::Close => {
            state.flush_all();
            let _ = state.volume.close();
            Ok(CacheReply::Unit)
        }
    };

    if let Some(reply) = task.reply {
        debug!("evfs cache: task completed, ok={}", result.is_ok());
        let _ = reply.send(result);
    }
}
