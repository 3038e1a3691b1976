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

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use evfs_err::{Error, Result};

/// Abstract backing store for the cluster/volume layer. EVFS's core never
/// opens, reads, writes or syncs a file itself outside of this seam.
pub trait BlockDevice: Send + Sync {
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;
    fn write_at(&self, offset: u64, buffer: &[u8]) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn set_len(&self, len: u64) -> Result<()>;
    fn sync(&self) -> Result<()>;
}

/// `std::fs::File`-backed device, the production implementation.
pub struct FileBlockDevice {
    file: File,
}

impl FileBlockDevice {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buffer, offset)
            .map_err(|_| Error::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)))
    }

    fn write_at(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.file.write_all_at(buffer, offset)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory device used by the core's own test suite, and available to
/// downstream hosts that want to exercise EVFS without a real file.
pub struct MemBlockDevice {
    data: Mutex<Vec<u8>>,
}

impl MemBlockDevice {
    pub fn new(len: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; len as usize]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        let end = offset
            .checked_add(buffer.len())
            .ok_or(Error::InvalidArgument)?;
        if end > data.len() {
            return Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        buffer.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let offset = offset as usize;
        let end = offset
            .checked_add(buffer.len())
            .ok_or(Error::InvalidArgument)?;
        if end > data.len() {
            return Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        data[offset..end].copy_from_slice(buffer);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.data.lock().unwrap().resize(len as usize, 0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips() {
        let dev = MemBlockDevice::new(128);
        dev.write_at(4, b"hello").unwrap();
        let mut buf = [0u8; 5];
        dev.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let dev = MemBlockDevice::new(8);
        let mut buf = [0u8; 4];
        assert!(dev.read_at(6, &mut buf).is_err());
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        {
            let dev = FileBlockDevice::create(&path).unwrap();
            dev.set_len(64).unwrap();
            dev.write_at(0, b"abcd").unwrap();
        }
        let dev = FileBlockDevice::open(&path).unwrap();
        let mut buf = [0u8; 4];
        dev.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }
}
