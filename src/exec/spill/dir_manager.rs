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
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::common::error::{EngineError, EngineResult};

/// Round-robin selection over the configured spill directories, plus the
/// byte quota shared by all of them.
#[derive(Debug)]
pub struct DirManager {
    dirs: Vec<PathBuf>,
    next_dir: AtomicUsize,
    dir_max_bytes: u64,
    used_bytes: AtomicU64,
}

impl DirManager {
    pub fn new(dirs: Vec<PathBuf>, dir_max_bytes: u64) -> EngineResult<Self> {
        if dirs.is_empty() {
            return Err(EngineError::graph("spill.local_dirs is empty"));
        }
        for dir in &dirs {
            ensure_dir(dir)?;
        }
        Ok(Self {
            dirs,
            next_dir: AtomicUsize::new(0),
            dir_max_bytes,
            used_bytes: AtomicU64::new(0),
        })
    }

    pub fn next_dir(&self) -> &Path {
        let idx = self.next_dir.fetch_add(1, Ordering::AcqRel);
        &self.dirs[idx % self.dirs.len()]
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Reserve quota for a new spill file. 0 means unlimited.
    pub fn reserve(&self, bytes: u64) -> EngineResult<()> {
        if self.dir_max_bytes == 0 {
            self.used_bytes.fetch_add(bytes, Ordering::AcqRel);
            return Ok(());
        }
        let mut current = self.used_bytes.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.dir_max_bytes {
                return Err(EngineError::storage(
                    "reserve spill space",
                    std::io::Error::new(
                        std::io::ErrorKind::StorageFull,
                        format!(
                            "spill quota exhausted: used={} requested={} max={}",
                            current, bytes, self.dir_max_bytes
                        ),
                    ),
                ));
            }
            match self.used_bytes.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn unreserve(&self, bytes: u64) {
        self.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }
}

fn ensure_dir(path: &Path) -> EngineResult<()> {
    if path.as_os_str().is_empty() {
        return Err(EngineError::graph("spill.local_dirs contains empty path"));
    }
    std::fs::create_dir_all(path).map_err(|e| {
        EngineError::storage(format!("create spill directory {}", path.display()), e)
    })
}
