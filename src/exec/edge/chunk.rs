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
//! Sealed edge chunks and the record framing stored inside them.
//!
//! Responsibilities:
//! - Seals a filled pool buffer into an immutable chunk shared by every destination that holds it.
//! - Lets the pool evict an idle chunk to the buffer store and brings it back for readers.
//! - Encodes length-prefixed records and key/value records, one framing per chunk.

use std::ops::Range;
use std::sync::{Arc, Mutex, Weak};

use crate::common::error::{EngineError, EngineResult};
use crate::runtime::buffer_pool::{Buffer, BufferPool, EvictOutcome, Evictable, SpilledBuffer};

pub(crate) const RECORD_HEADER_LEN: usize = 4;
pub(crate) const KV_HEADER_LEN: usize = 8;

enum ChunkSlot {
    Resident(Arc<Buffer>),
    Spilled(Arc<SpilledBuffer>),
}

/// Immutable run of framed records.
///
/// Readers of a resident chunk share its buffer; a spilled chunk is restored
/// into a buffer owned by the reader and stays spilled for everybody else.
pub(crate) struct SealedChunk {
    slot: Mutex<ChunkSlot>,
    len: usize,
}

impl std::fmt::Debug for SealedChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedChunk").field("len", &self.len).finish_non_exhaustive()
    }
}

impl SealedChunk {
    pub(crate) fn seal(buffer: Buffer, pool: &BufferPool) -> Arc<Self> {
        let chunk = Arc::new(Self {
            len: buffer.len(),
            slot: Mutex::new(ChunkSlot::Resident(Arc::new(buffer))),
        });
        let weak: Weak<dyn Evictable> = Arc::downgrade(&chunk) as Weak<dyn Evictable>;
        pool.register_evictable(weak);
        chunk
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Bytes of this chunk, restoring them from the buffer store if needed.
    pub(crate) fn load(&self, pool: &BufferPool) -> EngineResult<ChunkData> {
        let spilled = {
            let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            match &*slot {
                ChunkSlot::Resident(buffer) => return Ok(ChunkData::Shared(Arc::clone(buffer))),
                ChunkSlot::Spilled(spilled) => Arc::clone(spilled),
            }
        };
        Ok(ChunkData::Restored(pool.restore(&spilled)?))
    }

    #[cfg(test)]
    pub(crate) fn is_spilled(&self) -> bool {
        matches!(
            &*self.slot.lock().unwrap_or_else(|e| e.into_inner()),
            ChunkSlot::Spilled(_)
        )
    }
}

impl Evictable for SealedChunk {
    /// Readers clone the buffer only under the slot lock, so a count of one
    /// here means nobody is reading. A failed spill leaves the chunk resident.
    fn try_evict(&self, pool: &BufferPool) -> EngineResult<EvictOutcome> {
        let Ok(mut slot) = self.slot.try_lock() else {
            return Ok(EvictOutcome::Busy);
        };
        let spilled = match &*slot {
            ChunkSlot::Resident(buffer) if Arc::strong_count(buffer) == 1 => pool.spill(buffer)?,
            ChunkSlot::Resident(_) => return Ok(EvictOutcome::Busy),
            ChunkSlot::Spilled(_) => return Ok(EvictOutcome::Gone),
        };
        let bytes = spilled.capacity();
        // Dropping the resident buffer returns its bytes to the pool.
        *slot = ChunkSlot::Spilled(Arc::new(spilled));
        Ok(EvictOutcome::Evicted(bytes))
    }
}

/// Readable bytes of one chunk.
pub(crate) enum ChunkData {
    Shared(Arc<Buffer>),
    Restored(Buffer),
}

impl ChunkData {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            ChunkData::Shared(buffer) => buffer.as_slice(),
            ChunkData::Restored(buffer) => buffer.as_slice(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.as_slice().len()
    }
}

/// Sequence of sealed chunks holding key/value records sorted by key.
pub(crate) type SortedRun = Vec<Arc<SealedChunk>>;

/// Fills pool buffers with framed entries and seals them when full.
pub(crate) struct ChunkBuilder {
    pool: BufferPool,
    current: Option<Buffer>,
}

impl ChunkBuilder {
    pub(crate) fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            current: None,
        }
    }

    /// Append one entry made of `parts`; an entry never spans two chunks.
    pub(crate) fn append(
        &mut self,
        parts: &[&[u8]],
        sealed: &mut Vec<Arc<SealedChunk>>,
    ) -> EngineResult<()> {
        let need = parts.iter().map(|p| p.len()).sum::<usize>();
        let fits = self
            .current
            .as_ref()
            .is_some_and(|buffer| buffer.remaining() >= need);
        if !fits {
            if let Some(full) = self.current.take()
                && !full.is_empty()
            {
                sealed.push(SealedChunk::seal(full, &self.pool));
            }
            let size = need.max(self.pool.buffer_size());
            self.current = Some(self.pool.acquire(size)?);
        }
        if let Some(buffer) = self.current.as_mut() {
            for part in parts {
                buffer.append(part);
            }
        }
        Ok(())
    }

    /// Seal whatever is buffered.
    pub(crate) fn finish(&mut self) -> Option<Arc<SealedChunk>> {
        match self.current.take() {
            Some(buffer) if !buffer.is_empty() => Some(SealedChunk::seal(buffer, &self.pool)),
            _ => None,
        }
    }

    /// Drop buffered bytes without sealing them.
    pub(crate) fn discard(&mut self) {
        self.current = None;
    }
}

pub(crate) fn record_header(len: usize) -> EngineResult<[u8; RECORD_HEADER_LEN]> {
    Ok(frame_len(len, "record")?.to_le_bytes())
}

pub(crate) fn kv_header(key_len: usize, value_len: usize) -> EngineResult<[u8; KV_HEADER_LEN]> {
    let mut header = [0u8; KV_HEADER_LEN];
    header[..4].copy_from_slice(&frame_len(key_len, "key")?.to_le_bytes());
    header[4..].copy_from_slice(&frame_len(value_len, "value")?.to_le_bytes());
    Ok(header)
}

fn frame_len(len: usize, what: &str) -> EngineResult<u32> {
    u32::try_from(len).map_err(|_| {
        EngineError::serialization(
            "edge record framing",
            format!("{what} of {len} bytes exceeds the 4 GiB frame limit"),
        )
    })
}

fn read_u32(data: &[u8], at: usize) -> Option<usize> {
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
}

/// Payload range of the length-prefixed record starting at `offset`.
pub(crate) fn parse_record(data: &[u8], offset: usize) -> EngineResult<Range<usize>> {
    let len = read_u32(data, offset).ok_or_else(|| truncated(offset, data.len()))?;
    let start = offset + RECORD_HEADER_LEN;
    let end = start + len;
    if end > data.len() {
        return Err(truncated(offset, data.len()));
    }
    Ok(start..end)
}

/// Key and value ranges of the key/value record starting at `offset`.
pub(crate) fn parse_kv(data: &[u8], offset: usize) -> EngineResult<(Range<usize>, Range<usize>)> {
    let key_len = read_u32(data, offset).ok_or_else(|| truncated(offset, data.len()))?;
    let value_len = read_u32(data, offset + 4).ok_or_else(|| truncated(offset, data.len()))?;
    let key_start = offset + KV_HEADER_LEN;
    let value_start = key_start + key_len;
    let end = value_start + value_len;
    if end > data.len() {
        return Err(truncated(offset, data.len()));
    }
    Ok((key_start..value_start, value_start..end))
}

fn truncated(offset: usize, len: usize) -> EngineError {
    EngineError::serialization(
        "edge chunk",
        format!("record at offset {offset} runs past the chunk end ({len} bytes)"),
    )
}
