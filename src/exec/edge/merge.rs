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
//! K-way merge of sorted runs for scatter-gather partitions.
//!
//! Responsibilities:
//! - Streams key/value records from sorted runs, one resident chunk per run at a time.
//! - Merges runs into key order with ties resolved by run position, so the merge is stable.
//! - Pre-merges consecutive runs in stages when a partition has more runs than the threshold.
//! - Hands out whole groups (maximal equal-key runs) to readers, staged in pool buffers.

use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::error::{EngineError, EngineResult};
use crate::exec::edge::chunk::{
    ChunkBuilder, ChunkData, SealedChunk, SortedRun, kv_header, parse_kv, parse_record,
    record_header,
};
use crate::exec::graph::ShuffleContract;
use crate::runtime::buffer_pool::BufferPool;
use crate::vanilla_logging::debug;

struct RunCursor {
    chunks: VecDeque<Arc<SealedChunk>>,
    data: Option<ChunkData>,
    offset: usize,
    head: Option<(Range<usize>, Range<usize>)>,
}

impl RunCursor {
    fn new(run: SortedRun) -> Self {
        Self {
            chunks: run.into(),
            data: None,
            offset: 0,
            head: None,
        }
    }

    /// Move to the next record; false once the run is exhausted.
    fn advance(&mut self, pool: &BufferPool) -> EngineResult<bool> {
        loop {
            if let Some(data) = &self.data
                && self.offset < data.len()
            {
                let (key, value) = parse_kv(data.as_slice(), self.offset)?;
                self.offset = value.end;
                self.head = Some((key, value));
                return Ok(true);
            }
            self.head = None;
            self.data = None;
            let Some(chunk) = self.chunks.pop_front() else {
                return Ok(false);
            };
            self.data = Some(chunk.load(pool)?);
            self.offset = 0;
        }
    }

    fn key(&self) -> &[u8] {
        match (&self.data, &self.head) {
            (Some(data), Some((key, _))) => &data.as_slice()[key.clone()],
            _ => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match (&self.data, &self.head) {
            (Some(data), Some((_, value))) => &data.as_slice()[value.clone()],
            _ => &[],
        }
    }
}

/// Binary min-heap of run cursors ordered by (key, run position).
struct KWayMerge {
    contract: Arc<dyn ShuffleContract>,
    cursors: Vec<RunCursor>,
    heap: Vec<usize>,
}

impl KWayMerge {
    fn open(
        runs: Vec<SortedRun>,
        contract: Arc<dyn ShuffleContract>,
        pool: &BufferPool,
    ) -> EngineResult<Self> {
        let mut merge = Self {
            contract,
            cursors: runs.into_iter().map(RunCursor::new).collect(),
            heap: Vec::new(),
        };
        for idx in 0..merge.cursors.len() {
            if merge.cursors[idx].advance(pool)? {
                merge.heap.push(idx);
                merge.sift_up(merge.heap.len() - 1);
            }
        }
        Ok(merge)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        match self
            .contract
            .compare_keys(self.cursors[a].key(), self.cursors[b].key())
        {
            CmpOrdering::Less => true,
            CmpOrdering::Greater => false,
            CmpOrdering::Equal => a < b,
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(self.heap[pos], self.heap[parent]) {
                break;
            }
            self.heap.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.less(self.heap[left], self.heap[smallest]) {
                smallest = left;
            }
            if right < len && self.less(self.heap[right], self.heap[smallest]) {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.heap.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn top(&self) -> Option<&RunCursor> {
        self.heap.first().map(|idx| &self.cursors[*idx])
    }

    /// Advance the cursor at the top of the heap and restore heap order.
    fn pop_advance(&mut self, pool: &BufferPool) -> EngineResult<()> {
        let Some(&idx) = self.heap.first() else {
            return Ok(());
        };
        if !self.cursors[idx].advance(pool)? {
            let last = self.heap.len() - 1;
            self.heap.swap(0, last);
            self.heap.pop();
        }
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Ok(())
    }

    /// Stage the next group into `out`; false when every run is exhausted.
    fn next_group(&mut self, pool: &BufferPool, out: &mut GroupBuffer) -> EngineResult<bool> {
        out.clear();
        let Some(top) = self.top() else {
            return Ok(false);
        };
        out.key.extend_from_slice(top.key());
        loop {
            let Some(top) = self.top() else {
                break;
            };
            if self.contract.compare_keys(top.key(), &out.key) != CmpOrdering::Equal {
                break;
            }
            out.push_value(top.value())?;
            self.pop_advance(pool)?;
        }
        out.seal();
        Ok(true)
    }

    /// Drain every record into freshly sealed chunks.
    fn write_run(&mut self, pool: &BufferPool, cancel: &AtomicBool) -> EngineResult<SortedRun> {
        let mut builder = ChunkBuilder::new(pool.clone());
        let mut sealed = Vec::new();
        while let Some(top) = self.top() {
            if cancel.load(Ordering::Acquire) {
                return Err(EngineError::cancelled("scatter-gather merge cancelled"));
            }
            let header = kv_header(top.key().len(), top.value().len())?;
            builder.append(&[&header, top.key(), top.value()], &mut sealed)?;
            self.pop_advance(pool)?;
        }
        sealed.extend(builder.finish());
        Ok(sealed)
    }
}

/// One group taken out of the merge, owned by a reader.
///
/// Values are framed into pool buffers like any edge data, so a group larger
/// than the budget spills instead of growing outside it. They are read back
/// once, in merge order, and each chunk is released as soon as it is read.
pub(crate) struct GroupBuffer {
    pool: BufferPool,
    key: Vec<u8>,
    builder: ChunkBuilder,
    sealed: Vec<Arc<SealedChunk>>,
    unread: VecDeque<Arc<SealedChunk>>,
    current: Option<ChunkData>,
    offset: usize,
    values: usize,
}

impl GroupBuffer {
    pub(crate) fn new(pool: BufferPool) -> Self {
        Self {
            builder: ChunkBuilder::new(pool.clone()),
            pool,
            key: Vec::new(),
            sealed: Vec::new(),
            unread: VecDeque::new(),
            current: None,
            offset: 0,
            values: 0,
        }
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    #[cfg(test)]
    pub(crate) fn value_count(&self) -> usize {
        self.values
    }

    /// Next value of the group, restoring spilled chunks as needed.
    pub(crate) fn next_value(&mut self) -> EngineResult<Option<&[u8]>> {
        let Some(range) = self.advance()? else {
            return Ok(None);
        };
        Ok(self.current.as_ref().map(|data| &data.as_slice()[range]))
    }

    /// Drop the group and every pool buffer it holds.
    pub(crate) fn clear(&mut self) {
        self.key.clear();
        self.builder.discard();
        self.sealed.clear();
        self.unread.clear();
        self.current = None;
        self.offset = 0;
        self.values = 0;
    }

    fn push_value(&mut self, value: &[u8]) -> EngineResult<()> {
        let header = record_header(value.len())?;
        self.builder.append(&[&header, value], &mut self.sealed)?;
        self.values += 1;
        Ok(())
    }

    fn seal(&mut self) {
        self.sealed.extend(self.builder.finish());
        self.unread = std::mem::take(&mut self.sealed).into();
    }

    fn advance(&mut self) -> EngineResult<Option<Range<usize>>> {
        loop {
            if let Some(data) = &self.current
                && self.offset < data.len()
            {
                let range = parse_record(data.as_slice(), self.offset)?;
                self.offset = range.end;
                return Ok(Some(range));
            }
            self.current = None;
            let Some(chunk) = self.unread.pop_front() else {
                return Ok(None);
            };
            self.current = Some(chunk.load(&self.pool)?);
            self.offset = 0;
        }
    }
}

/// Merge state of one partition, shared by every reader of that partition.
pub(crate) struct PartitionMerger {
    pending: Option<Vec<SortedRun>>,
    merge: Option<KWayMerge>,
    contract: Arc<dyn ShuffleContract>,
    pool: BufferPool,
    merge_threshold: usize,
    merge_width: usize,
    label: String,
}

impl PartitionMerger {
    pub(crate) fn new(
        runs: Vec<SortedRun>,
        contract: Arc<dyn ShuffleContract>,
        pool: BufferPool,
        merge_threshold: usize,
        merge_width: usize,
        label: String,
    ) -> Self {
        Self {
            pending: Some(runs),
            merge: None,
            contract,
            pool,
            merge_threshold: merge_threshold.max(2),
            merge_width: merge_width.max(2),
            label,
        }
    }

    pub(crate) fn next_group(
        &mut self,
        out: &mut GroupBuffer,
        cancel: &AtomicBool,
    ) -> EngineResult<bool> {
        if let Some(runs) = self.pending.take() {
            let runs = cascade(
                runs,
                &self.contract,
                &self.pool,
                self.merge_threshold,
                self.merge_width,
                cancel,
            )?;
            debug!(
                "scatter-gather merge opened: input={} runs={}",
                self.label,
                runs.len()
            );
            self.merge = Some(KWayMerge::open(runs, Arc::clone(&self.contract), &self.pool)?);
        }
        match self.merge.as_mut() {
            Some(merge) => merge.next_group(&self.pool, out),
            None => Ok(false),
        }
    }
}

/// Merge consecutive runs in passes of `width` until at most `threshold` remain.
fn cascade(
    mut runs: Vec<SortedRun>,
    contract: &Arc<dyn ShuffleContract>,
    pool: &BufferPool,
    threshold: usize,
    width: usize,
    cancel: &AtomicBool,
) -> EngineResult<Vec<SortedRun>> {
    let mut stage = 0;
    while runs.len() > threshold {
        stage += 1;
        let before = runs.len();
        let mut merged = Vec::with_capacity(before.div_ceil(width));
        let mut remaining = runs.into_iter();
        loop {
            let group = remaining.by_ref().take(width).collect::<Vec<_>>();
            match group.len() {
                0 => break,
                1 => merged.extend(group),
                _ => {
                    let mut merge = KWayMerge::open(group, Arc::clone(contract), pool)?;
                    merged.push(merge.write_run(pool, cancel)?);
                }
            }
        }
        debug!(
            "cascading merge stage {}: {} runs -> {} runs (width {})",
            stage,
            before,
            merged.len(),
            width
        );
        runs = merged;
    }
    Ok(runs)
}
