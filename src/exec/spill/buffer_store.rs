// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::error::{EngineError, EngineResult};
use crate::exec::spill::SpillStorageConfig;
use crate::exec::spill::block_manager::{BLOCK_HEADER_LEN, read_block, write_block};
use crate::exec::spill::dir_manager::DirManager;
use crate::vanilla_logging::{debug, warn};

/// Counters of one buffer store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStoreStats {
    pub files_written: u64,
    pub files_read: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub bytes_on_disk: u64,
}

/// Secondary storage for buffers evicted from the pool.
///
/// Each spilled buffer becomes one file; the file lives exactly as long as
/// its `SpillHandle`.
#[derive(Debug)]
pub struct BufferStore {
    dir_manager: DirManager,
    next_id: AtomicU64,
    pid: u32,
    files_written: AtomicU64,
    files_read: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

impl BufferStore {
    pub fn new(config: SpillStorageConfig) -> EngineResult<Arc<Self>> {
        let dir_manager = DirManager::new(config.local_dirs, config.dir_max_bytes)?;
        Ok(Arc::new(Self {
            dir_manager,
            next_id: AtomicU64::new(0),
            pid: std::process::id(),
            files_written: AtomicU64::new(0),
            files_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        }))
    }

    /// Persist `payload` into a fresh spill file.
    pub fn store(self: &Arc<Self>, payload: &[u8]) -> EngineResult<SpillHandle> {
        let file_bytes = payload.len() as u64 + u64::from(BLOCK_HEADER_LEN);
        self.dir_manager.reserve(file_bytes)?;
        let (path, file) = match self.create_block_file() {
            Ok(created) => created,
            Err(err) => {
                self.dir_manager.unreserve(file_bytes);
                return Err(err);
            }
        };
        let mut writer = BufWriter::new(file);
        if let Err(err) = write_block(&mut writer, payload) {
            drop(writer);
            remove_quietly(&path);
            self.dir_manager.unreserve(file_bytes);
            return Err(EngineError::storage(
                format!("write spill file {}", path.display()),
                err,
            ));
        }
        self.files_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        debug!(
            "spilled buffer: path={} bytes={}",
            path.display(),
            payload.len()
        );
        Ok(SpillHandle {
            path,
            payload_len: payload.len(),
            file_bytes,
            store: Arc::clone(self),
        })
    }

    /// Read a spilled payload back into `out`.
    pub fn load(&self, handle: &SpillHandle, out: &mut Vec<u8>) -> EngineResult<()> {
        let file = File::open(&handle.path).map_err(|e| {
            EngineError::storage(format!("open spill file {}", handle.path.display()), e)
        })?;
        let header = read_block(&mut BufReader::new(file), out)?;
        if header.payload_len != handle.payload_len as u64 {
            return Err(EngineError::StorageFormat(format!(
                "spill file {} holds {} bytes, expected {}",
                handle.path.display(),
                header.payload_len,
                handle.payload_len
            )));
        }
        self.files_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read
            .fetch_add(handle.payload_len as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> BufferStoreStats {
        BufferStoreStats {
            files_written: self.files_written.load(Ordering::Relaxed),
            files_read: self.files_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_on_disk: self.dir_manager.used_bytes(),
        }
    }

    fn create_block_file(&self) -> EngineResult<(PathBuf, File)> {
        let mut attempts = 0;
        loop {
            let id = self.next_id.fetch_add(1, Ordering::AcqRel);
            let path = self
                .dir_manager
                .next_dir()
                .join(format!("buffer_{:x}_{:x}.spill", self.pid, id));
            match OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path)
            {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempts < 3 => {
                    attempts += 1;
                }
                Err(err) => {
                    return Err(EngineError::storage(
                        format!("create spill file {}", path.display()),
                        err,
                    ));
                }
            }
        }
    }
}

/// Ownership of one spill file; dropping it deletes the file.
#[derive(Debug)]
pub struct SpillHandle {
    path: PathBuf,
    payload_len: usize,
    file_bytes: u64,
    store: Arc<BufferStore>,
}

impl SpillHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.payload_len
    }

    pub fn is_empty(&self) -> bool {
        self.payload_len == 0
    }
}

impl Drop for SpillHandle {
    fn drop(&mut self) {
        remove_quietly(&self.path);
        self.store.dir_manager.unreserve(self.file_bytes);
    }
}

fn remove_quietly(path: &Path) {
    if let Err(err) = std::fs::remove_file(path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!("remove spill file {} failed: {}", path.display(), err);
    }
}
