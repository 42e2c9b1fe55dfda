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
//! Read side of edges.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::error::{EngineError, EngineResult};
use crate::exec::edge::channel::InputChannel;
use crate::exec::edge::chunk::{ChunkData, SealedChunk, parse_record};
use crate::exec::edge::merge::{GroupBuffer, PartitionMerger};
use crate::runtime::buffer_pool::BufferPool;

enum RecordSource {
    /// One-to-one: chunks are taken from the shared queue.
    Queue,
    /// Broadcast: every chunk is replayed, `next` is the replay position.
    Replay { next: usize },
}

/// Reader of one-to-one and broadcast inputs.
pub struct RecordReader {
    channel: Arc<InputChannel>,
    pool: BufferPool,
    cancel: Arc<AtomicBool>,
    source: RecordSource,
    current: Option<ChunkData>,
    offset: usize,
}

impl RecordReader {
    pub(crate) fn queue(channel: Arc<InputChannel>, pool: BufferPool, cancel: Arc<AtomicBool>) -> Self {
        Self::new(channel, pool, cancel, RecordSource::Queue)
    }

    pub(crate) fn replay(channel: Arc<InputChannel>, pool: BufferPool, cancel: Arc<AtomicBool>) -> Self {
        Self::new(channel, pool, cancel, RecordSource::Replay { next: 0 })
    }

    fn new(
        channel: Arc<InputChannel>,
        pool: BufferPool,
        cancel: Arc<AtomicBool>,
        source: RecordSource,
    ) -> Self {
        Self {
            channel,
            pool,
            cancel,
            source,
            current: None,
            offset: 0,
        }
    }

    /// Next record, blocking while the queue is empty and writers are still open.
    pub fn next(&mut self) -> EngineResult<Option<&[u8]>> {
        let Some(range) = self.advance()? else {
            return Ok(None);
        };
        Ok(self.current.as_ref().map(|data| &data.as_slice()[range]))
    }

    fn advance(&mut self) -> EngineResult<Option<Range<usize>>> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(EngineError::cancelled(format!(
                "read from {} cancelled",
                self.channel.label()
            )));
        }
        loop {
            if let Some(data) = &self.current
                && self.offset < data.len()
            {
                let range = parse_record(data.as_slice(), self.offset)?;
                self.offset = range.end;
                return Ok(Some(range));
            }
            self.current = None;
            let Some(chunk) = self.next_chunk()? else {
                return Ok(None);
            };
            self.current = Some(chunk.load(&self.pool)?);
            self.offset = 0;
        }
    }

    fn next_chunk(&mut self) -> EngineResult<Option<Arc<SealedChunk>>> {
        match &mut self.source {
            RecordSource::Queue => self.channel.take_chunk(&self.cancel),
            RecordSource::Replay { next } => {
                let chunk = self.channel.retained_chunk(*next, &self.cancel)?;
                if chunk.is_some() {
                    *next += 1;
                }
                Ok(chunk)
            }
        }
    }
}

/// Reader of one scatter-gather partition.
///
/// Readers of the same partition share one merge; each group goes to exactly
/// one of them, whole. The group's values sit in pool buffers owned by this
/// reader until it moves to the next group.
pub struct GroupReader {
    channel: Arc<InputChannel>,
    merger: Arc<Mutex<PartitionMerger>>,
    cancel: Arc<AtomicBool>,
    group: GroupBuffer,
    in_group: bool,
}

impl GroupReader {
    pub(crate) fn new(
        channel: Arc<InputChannel>,
        merger: Arc<Mutex<PartitionMerger>>,
        group: GroupBuffer,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            channel,
            merger,
            cancel,
            group,
            in_group: false,
        }
    }

    /// Move to the next group; false once the partition is exhausted.
    pub fn next_group(&mut self) -> EngineResult<bool> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(EngineError::cancelled(format!(
                "read from {} cancelled",
                self.channel.label()
            )));
        }
        self.channel.check_readable()?;
        let mut merger = self.merger.lock().unwrap_or_else(|e| e.into_inner());
        self.in_group = merger.next_group(&mut self.group, &self.cancel)?;
        drop(merger);
        if !self.in_group {
            self.group.clear();
        }
        Ok(self.in_group)
    }

    /// Key of the current group; empty before the first group.
    pub fn key(&self) -> &[u8] {
        self.group.key()
    }

    /// Next value of the current group; fails if a spilled value cannot be restored.
    pub fn next_value(&mut self) -> EngineResult<Option<&[u8]>> {
        if !self.in_group {
            return Ok(None);
        }
        self.group.next_value()
    }
}
