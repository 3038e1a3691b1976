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

//! Cluster / Volume layer: raw, whole-cluster I/O over a single backing
//! file plus the superblock and volume-expansion logic. This is the only
//! layer that issues reads/writes to a [`BlockDevice`]; everything above it
//! (the cache) addresses clusters by id.

use evfs_err::{Error, Result};
use evfs_storage::BlockDevice;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const MINIMUM_CLUSTER_SIZE: u32 = 32;
pub const MAXIMUM_CLUSTER_SIZE: u32 = 4096;
pub const MAXIMUM_FILE_SIZE: u64 = 1 << 30; // 1 GiB
pub const EVFS_MAGIC: u32 = 0x7366_7645; // "Evfs" ('sfvE' little-endian)

/// Size in bytes of the 12-byte cluster header that precedes every cluster's
/// user data.
pub const CLUSTER_HEADER_SIZE: u32 = 12;

const HEAD_FLAG: u32 = 0x8000_0000;
const SIZE_MASK: u32 = 0x7FFF_FFFF;
/// `data_seg_size` masked value meaning "allocated placeholder, no user
/// data" (all 31 low bits set, i.e. -1 once masked).
pub const PLACEHOLDER_SIZE: u32 = SIZE_MASK;

/// Superblock, stored verbatim in cluster 1. Only the first 16 bytes carry
/// meaning; the remainder of the cluster is reserved and zero-filled.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct SuperblockHeader {
    magic: U32,
    cluster_size: U32,
    cluster_count: U32,
    expand_cluster_count: U32,
}

const SUPERBLOCK_HEADER_SIZE: usize = core::mem::size_of::<SuperblockHeader>();

/// The 12-byte header every cluster (including elements and heads) carries.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ClusterHeader {
    pub data_seg_size: U32,
    pub next_cluster_id: U32,
    pub head_cluster_id: U32,
}

impl ClusterHeader {
    pub fn zeroed() -> Self {
        Self {
            data_seg_size: U32::new(0),
            next_cluster_id: U32::new(0),
            head_cluster_id: U32::new(0),
        }
    }

    pub fn is_head(&self) -> bool {
        self.data_seg_size.get() & HEAD_FLAG != 0
    }

    /// Low 31 bits of `data_seg_size`, regardless of the head flag.
    pub fn masked_size(&self) -> u32 {
        self.data_seg_size.get() & SIZE_MASK
    }

    pub fn is_placeholder(&self) -> bool {
        self.masked_size() == PLACEHOLDER_SIZE
    }

    /// The heuristic `evfs_cluster_looks_like_busy` from the original: a
    /// cluster with any `data_seg_size` set, or a recorded head-cluster
    /// back-pointer, is assumed to belong to a live entry.
    pub fn looks_like_busy(&self) -> bool {
        self.data_seg_size.get() != 0 || self.head_cluster_id.get() > 0
    }

    pub fn set_head_size(&mut self, size: u32) {
        self.data_seg_size = U32::new((size & SIZE_MASK) | HEAD_FLAG);
    }

    pub fn set_element_size(&mut self, size: u32) {
        self.data_seg_size = U32::new(size & SIZE_MASK);
    }
}

fn is_power_of_two(value: u32) -> bool {
    value != 0 && value & (value - 1) == 0
}

pub fn cluster_size_legal(size: u32) -> bool {
    (MINIMUM_CLUSTER_SIZE..=MAXIMUM_CLUSTER_SIZE).contains(&size) && is_power_of_two(size)
}

/// Single backing file, fixed-size clusters, superblock, raw cluster I/O,
/// and volume expansion.
pub struct Volume<D: BlockDevice> {
    device: D,
    cluster_size: u32,
    cluster_count: u32,
    expand_cluster_count: u32,
}

impl<D: BlockDevice> Volume<D> {
    pub fn create(device: D, cluster_size: u32, cluster_count: u32) -> Result<Self> {
        if !cluster_size_legal(cluster_size) {
            return Err(Error::InvalidArgument);
        }
        let total = (cluster_count as u64).saturating_mul(cluster_size as u64);
        if cluster_count == 0 || total > MAXIMUM_FILE_SIZE {
            return Err(Error::InvalidArgument);
        }

        device.set_len(total)?;

        let expand_cluster_count = cluster_count.max(1);
        let volume = Self {
            device,
            cluster_size,
            cluster_count,
            expand_cluster_count,
        };
        volume.write_superblock()?;
        Ok(volume)
    }

    pub fn open(device: D) -> Result<Self> {
        let mut header_bytes = [0u8; SUPERBLOCK_HEADER_SIZE];
        device.read_at(0, &mut header_bytes)?;
        let header =
            SuperblockHeader::read_from_bytes(&header_bytes).map_err(|_| Error::BadState)?;

        if header.magic.get() != EVFS_MAGIC {
            return Err(Error::BadState);
        }
        let cluster_size = header.cluster_size.get();
        let cluster_count = header.cluster_count.get();
        let expand_cluster_count = header.expand_cluster_count.get();
        if !cluster_size_legal(cluster_size) || cluster_count == 0 {
            return Err(Error::BadState);
        }

        let expected_len = cluster_size as u64 * cluster_count as u64;
        if device.len()? != expected_len {
            return Err(Error::BadState);
        }

        Ok(Self {
            device,
            cluster_size,
            cluster_count,
            expand_cluster_count,
        })
    }

    pub fn close(&self) -> Result<()> {
        // Idempotent: syncing a file we may have already synced is harmless.
        self.device.sync()
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    /// Total addressable clusters, excluding the superblock at cluster 1.
    pub fn usable_cluster_count(&self) -> u32 {
        self.cluster_count - 1
    }

    pub fn max_pre_userseg(&self) -> u32 {
        self.cluster_size - CLUSTER_HEADER_SIZE
    }

    pub fn expand_cluster_count(&self) -> u32 {
        self.expand_cluster_count
    }

    fn check_id(&self, id: u32) -> Result<()> {
        if id == 0 || id > self.cluster_count {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    fn offset_of(&self, id: u32) -> u64 {
        (id as u64 - 1) * self.cluster_size as u64
    }

    fn write_superblock(&self) -> Result<()> {
        let header = SuperblockHeader {
            magic: U32::new(EVFS_MAGIC),
            cluster_size: U32::new(self.cluster_size),
            cluster_count: U32::new(self.cluster_count),
            expand_cluster_count: U32::new(self.expand_cluster_count),
        };
        let mut buf = vec![0u8; self.cluster_size as usize];
        buf[..SUPERBLOCK_HEADER_SIZE].copy_from_slice(header.as_bytes());
        self.device.write_at(0, &buf)
    }

    pub fn read_cluster(&self, id: u32, buf: &mut [u8]) -> Result<()> {
        self.check_id(id)?;
        if buf.len() != self.cluster_size as usize {
            return Err(Error::InvalidArgument);
        }
        self.device.read_at(self.offset_of(id), buf)
    }

    pub fn write_cluster(&self, id: u32, buf: &[u8]) -> Result<()> {
        self.check_id(id)?;
        if buf.len() != self.cluster_size as usize {
            return Err(Error::InvalidArgument);
        }
        self.device.write_at(self.offset_of(id), buf)
    }

    pub fn read_cluster_head(&self, id: u32) -> Result<ClusterHeader> {
        self.check_id(id)?;
        let mut bytes = [0u8; CLUSTER_HEADER_SIZE as usize];
        self.device.read_at(self.offset_of(id), &mut bytes)?;
        ClusterHeader::read_from_bytes(&bytes).map_err(|_| Error::BadState)
    }

    /// Append `expand_cluster_count` uninitialized clusters and return the
    /// id of the first new one.
    pub fn expand(&mut self) -> Result<u32> {
        let new_count = self
            .cluster_count
            .checked_add(self.expand_cluster_count)
            .ok_or(Error::NoSpace)?;
        let new_total = new_count as u64 * self.cluster_size as u64;
        if new_total > MAXIMUM_FILE_SIZE {
            return Err(Error::NoSpace);
        }

        self.device.set_len(new_total)?;
        let first_new = self.cluster_count + 1;
        self.cluster_count = new_count;
        self.write_superblock()?;
        Ok(first_new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evfs_storage::MemBlockDevice;

    fn mem(cluster_size: u32, cluster_count: u32) -> MemBlockDevice {
        MemBlockDevice::new(cluster_size as u64 * cluster_count as u64)
    }

    #[test]
    fn rejects_illegal_cluster_size() {
        let dev = mem(100, 4);
        assert!(Volume::create(dev, 100, 4).is_err());
    }

    #[test]
    fn rejects_oversized_volume() {
        let dev = MemBlockDevice::new(1);
        assert!(Volume::create(dev, 4096, 1 << 20).is_err());
    }

    #[test]
    fn create_reserves_cluster_one_for_the_superblock() {
        let dev = mem(128, 16);
        let volume = Volume::create(dev, 128, 16).unwrap();
        assert_eq!(volume.usable_cluster_count(), 15);
    }

    #[test]
    fn expand_grows_cluster_count() {
        let dev = mem(128, 4);
        let mut volume = Volume::create(dev, 128, 4).unwrap();
        let first_new = volume.expand().unwrap();
        assert_eq!(first_new, 5);
        assert_eq!(volume.usable_cluster_count(), 7);
    }

    #[test]
    fn cluster_header_round_trip() {
        let dev = mem(64, 4);
        let volume = Volume::create(dev, 64, 4).unwrap();
        let mut header = ClusterHeader::zeroed();
        header.set_head_size(40);
        let mut buf = vec![0u8; 64];
        buf[..12].copy_from_slice(header.as_bytes());
        volume.write_cluster(2, &buf).unwrap();

        let read_back = volume.read_cluster_head(2).unwrap();
        assert!(read_back.is_head());
        assert_eq!(read_back.masked_size(), 40);
    }
}
