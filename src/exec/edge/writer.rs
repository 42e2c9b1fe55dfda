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
//! Write side of edges.
//!
//! Responsibilities:
//! - Tracks open writers per output port so completion can be checked.
//! - `RecordWriter` frames records into pool buffers and delivers sealed chunks to every destination.
//! - `KeyValueWriter` stages key/value records, sorts them per partition and seals one run per partition.
//!
//! A writer dropped without `close` closes itself; if the run was cancelled
//! its buffered data is discarded instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::common::error::{EngineError, EngineResult};
use crate::exec::edge::channel::InputChannel;
use crate::exec::edge::chunk::{
    ChunkBuilder, KV_HEADER_LEN, SealedChunk, SortedRun, kv_header, record_header,
};
use crate::exec::graph::{EdgeKind, ShuffleContract};
use crate::runtime::buffer_pool::{Buffer, BufferPool};
use crate::vanilla_logging::{debug, warn};

struct OutputPhase {
    open_writers: usize,
    completed: bool,
}

/// Write-side state of one output port.
pub(crate) struct OutputPort {
    label: String,
    kind: EdgeKind,
    contract: Option<Arc<dyn ShuffleContract>>,
    destinations: Vec<Arc<InputChannel>>,
    phase: Mutex<OutputPhase>,
}

impl OutputPort {
    pub(crate) fn new(
        label: String,
        kind: EdgeKind,
        contract: Option<Arc<dyn ShuffleContract>>,
        destinations: Vec<Arc<InputChannel>>,
    ) -> Self {
        Self {
            label,
            kind,
            contract,
            destinations,
            phase: Mutex::new(OutputPhase {
                open_writers: 0,
                completed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputPhase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn kind(&self) -> EdgeKind {
        self.kind
    }

    pub(crate) fn contract(&self) -> Option<&Arc<dyn ShuffleContract>> {
        self.contract.as_ref()
    }

    pub(crate) fn destinations(&self) -> &[Arc<InputChannel>] {
        &self.destinations
    }

    pub(crate) fn lease(self: &Arc<Self>) -> EngineResult<WriterLease> {
        let mut phase = self.lock();
        if phase.completed {
            return Err(EngineError::graph(format!(
                "output {} was already completed",
                self.label
            )));
        }
        phase.open_writers += 1;
        Ok(WriterLease {
            output: Arc::clone(self),
        })
    }

    /// Mark the write side finished and propagate to destination inputs.
    pub(crate) fn complete(&self) -> EngineResult<()> {
        let mut phase = self.lock();
        if phase.completed {
            return Ok(());
        }
        if phase.open_writers > 0 {
            return Err(EngineError::graph(format!(
                "output {} completed with {} writers still open",
                self.label, phase.open_writers
            )));
        }
        phase.completed = true;
        drop(phase);
        for destination in &self.destinations {
            destination.upstream_completed();
        }
        Ok(())
    }

    pub(crate) fn fail(&self, message: &str) {
        self.lock().completed = true;
        for destination in &self.destinations {
            destination.fail(message);
        }
    }
}

/// Registration of one open writer; dropping it unregisters.
pub(crate) struct WriterLease {
    output: Arc<OutputPort>,
}

impl WriterLease {
    fn output(&self) -> &OutputPort {
        &self.output
    }
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        let mut phase = self.output.lock();
        phase.open_writers = phase.open_writers.saturating_sub(1);
    }
}

fn check_writable(closed: bool, cancel: &AtomicBool, label: &str) -> EngineResult<()> {
    if closed {
        return Err(EngineError::graph(format!(
            "write to output {label} after close"
        )));
    }
    if cancel.load(Ordering::Acquire) {
        return Err(EngineError::cancelled(format!("write to {label} cancelled")));
    }
    Ok(())
}

/// Writer of a payload-free edge. Only its lifetime matters.
pub struct SignalWriter {
    _lease: WriterLease,
}

impl SignalWriter {
    pub(crate) fn new(lease: WriterLease) -> Self {
        Self { _lease: lease }
    }

    pub fn close(self) -> EngineResult<()> {
        Ok(())
    }
}

/// Writer of one-to-one and broadcast edges.
pub struct RecordWriter {
    lease: WriterLease,
    builder: ChunkBuilder,
    sealed: Vec<Arc<SealedChunk>>,
    cancel: Arc<AtomicBool>,
    records: u64,
    chunks: u64,
    bytes: u64,
    closed: bool,
}

impl RecordWriter {
    pub(crate) fn new(lease: WriterLease, pool: BufferPool, cancel: Arc<AtomicBool>) -> Self {
        Self {
            lease,
            builder: ChunkBuilder::new(pool),
            sealed: Vec::new(),
            cancel,
            records: 0,
            chunks: 0,
            bytes: 0,
            closed: false,
        }
    }

    pub fn write(&mut self, record: &[u8]) -> EngineResult<()> {
        check_writable(self.closed, &self.cancel, self.lease.output().label())?;
        let header = record_header(record.len())?;
        self.builder.append(&[&header, record], &mut self.sealed)?;
        self.records += 1;
        if !self.sealed.is_empty() {
            self.deliver()?;
        }
        Ok(())
    }

    /// Seal buffered records and hand them to the edge.
    pub fn close(mut self) -> EngineResult<()> {
        self.finish()
    }

    fn deliver(&mut self) -> EngineResult<()> {
        let sealed = std::mem::take(&mut self.sealed);
        for destination in self.lease.output().destinations() {
            destination.push_chunks(&sealed)?;
        }
        self.chunks += sealed.len() as u64;
        self.bytes += sealed.iter().map(|c| c.len() as u64).sum::<u64>();
        Ok(())
    }

    fn finish(&mut self) -> EngineResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.cancel.load(Ordering::Acquire) {
            self.discard();
            return Err(EngineError::cancelled(format!(
                "write to {} cancelled",
                self.lease.output().label()
            )));
        }
        self.sealed.extend(self.builder.finish());
        self.deliver()?;
        debug!(
            "record writer closed: output={} records={} chunks={} bytes={}",
            self.lease.output().label(),
            self.records,
            self.chunks,
            self.bytes
        );
        Ok(())
    }

    fn discard(&mut self) {
        self.builder.discard();
        self.sealed.clear();
    }
}

impl Drop for RecordWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if self.cancel.load(Ordering::Acquire) {
            self.closed = true;
            self.discard();
            return;
        }
        if let Err(err) = self.finish() {
            warn!(
                "record writer for {} failed to close on drop: {}",
                self.lease.output().label(),
                err
            );
        }
    }
}

struct StagedEntry {
    partition: usize,
    offset: usize,
    len: usize,
    key_len: usize,
}

impl StagedEntry {
    fn key<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.offset + KV_HEADER_LEN;
        &data[start..start + self.key_len]
    }

    fn frame<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.offset..self.offset + self.len]
    }
}

/// Writer of scatter-gather edges.
pub struct KeyValueWriter {
    lease: WriterLease,
    pool: BufferPool,
    contract: Arc<dyn ShuffleContract>,
    partition_count: usize,
    staging: Option<Buffer>,
    staging_size: usize,
    entries: Vec<StagedEntry>,
    cancel: Arc<AtomicBool>,
    records: u64,
    runs: u64,
    closed: bool,
}

impl KeyValueWriter {
    pub(crate) fn new(
        lease: WriterLease,
        pool: BufferPool,
        contract: Arc<dyn ShuffleContract>,
        partition_count: usize,
        sort_buffer_bytes: usize,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let staging_size = sort_buffer_bytes.min(pool.budget() / 2).max(KV_HEADER_LEN);
        Self {
            lease,
            pool,
            contract,
            partition_count: partition_count.max(1),
            staging: None,
            staging_size,
            entries: Vec::new(),
            cancel,
            records: 0,
            runs: 0,
            closed: false,
        }
    }

    pub fn write(&mut self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        check_writable(self.closed, &self.cancel, self.lease.output().label())?;
        let header = kv_header(key.len(), value.len())?;
        let frame_len = KV_HEADER_LEN + key.len() + value.len();
        let partition = self.contract.partition(key, self.partition_count);
        self.records += 1;

        if frame_len > self.staging_size {
            self.flush()?;
            let mut run = Vec::new();
            let mut builder = ChunkBuilder::new(self.pool.clone());
            builder.append(&[&header, key, value], &mut run)?;
            run.extend(builder.finish());
            return self.deliver(vec![(partition, run)]);
        }

        let fits = self
            .staging
            .as_ref()
            .is_some_and(|staging| staging.remaining() >= frame_len);
        if !fits {
            if self.staging.is_some() {
                self.flush()?;
            } else {
                self.staging = Some(self.pool.acquire(self.staging_size)?);
            }
        }
        let Some(staging) = self.staging.as_mut() else {
            return Err(EngineError::internal("scatter-gather staging buffer missing"));
        };
        let offset = staging.len();
        staging.append(&header);
        staging.append(key);
        staging.append(value);
        self.entries.push(StagedEntry {
            partition,
            offset,
            len: frame_len,
            key_len: key.len(),
        });
        Ok(())
    }

    /// Flush staged records as sorted runs and hand them to the edge.
    pub fn close(mut self) -> EngineResult<()> {
        self.finish()
    }

    /// Sort staged entries by (partition, key) and seal one run per partition.
    fn flush(&mut self) -> EngineResult<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let Some(staging) = self.staging.as_ref() else {
            return Err(EngineError::internal("scatter-gather staging buffer missing"));
        };
        let data = staging.as_slice();
        let contract = &self.contract;
        self.entries.sort_by(|a, b| {
            a.partition
                .cmp(&b.partition)
                .then_with(|| contract.compare_keys(a.key(data), b.key(data)))
        });

        let mut runs = Vec::new();
        let mut builder = ChunkBuilder::new(self.pool.clone());
        let mut idx = 0;
        while idx < self.entries.len() {
            let partition = self.entries[idx].partition;
            let mut run: SortedRun = Vec::new();
            while idx < self.entries.len() && self.entries[idx].partition == partition {
                if self.cancel.load(Ordering::Acquire) {
                    return Err(EngineError::cancelled(format!(
                        "write to {} cancelled",
                        self.lease.output().label()
                    )));
                }
                builder.append(&[self.entries[idx].frame(data)], &mut run)?;
                idx += 1;
            }
            run.extend(builder.finish());
            runs.push((partition, run));
        }
        self.entries.clear();
        if let Some(staging) = self.staging.as_mut() {
            staging.clear();
        }
        self.deliver(runs)
    }

    fn deliver(&mut self, runs: Vec<(usize, SortedRun)>) -> EngineResult<()> {
        for destination in self.lease.output().destinations() {
            destination.push_runs(&runs)?;
        }
        self.runs += runs.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> EngineResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.cancel.load(Ordering::Acquire) {
            self.discard();
            return Err(EngineError::cancelled(format!(
                "write to {} cancelled",
                self.lease.output().label()
            )));
        }
        let flushed = self.flush();
        self.staging = None;
        flushed?;
        debug!(
            "key/value writer closed: output={} records={} runs={}",
            self.lease.output().label(),
            self.records,
            self.runs
        );
        Ok(())
    }

    fn discard(&mut self) {
        self.entries.clear();
        self.staging = None;
    }
}

impl Drop for KeyValueWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if self.cancel.load(Ordering::Acquire) {
            self.closed = true;
            self.discard();
            return;
        }
        if let Err(err) = self.finish() {
            warn!(
                "key/value writer for {} failed to close on drop: {}",
                self.lease.output().label(),
                err
            );
        }
    }
}
