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
//! Per-input-port edge state.
//!
//! Every edge entering one input port delivers into the same channel, so
//! fan-in needs no extra bookkeeping. The channel owns the delivered chunks
//! and the input's `Open -> Draining -> Complete | Failed` state machine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::common::error::{EngineError, EngineResult};
use crate::exec::edge::InputState;
use crate::exec::edge::chunk::{SealedChunk, SortedRun};
use crate::exec::edge::merge::PartitionMerger;
use crate::exec::graph::{EdgeKind, ShuffleContract};
use crate::runtime::buffer_pool::BufferPool;
use crate::vanilla_logging::debug;

enum Phase {
    Open,
    Draining,
    Complete,
    Failed(String),
}

struct ChannelState {
    phase: Phase,
    open_upstream: usize,
    /// One-to-one chunks, each taken by exactly one reader.
    queue: VecDeque<Arc<SealedChunk>>,
    /// Broadcast chunks, replayed by every reader.
    retained: Vec<Arc<SealedChunk>>,
    /// Scatter-gather runs per partition until the partition's merger takes them.
    runs: Vec<Vec<SortedRun>>,
    mergers: Vec<Option<Arc<Mutex<PartitionMerger>>>>,
}

impl ChannelState {
    fn release_data(&mut self) {
        self.queue.clear();
        self.retained.clear();
        for runs in &mut self.runs {
            runs.clear();
        }
        for merger in &mut self.mergers {
            *merger = None;
        }
    }
}

pub(crate) struct MergeSettings {
    pub(crate) threshold: usize,
    pub(crate) width: usize,
}

pub(crate) struct InputChannel {
    label: String,
    kind: EdgeKind,
    contract: Option<Arc<dyn ShuffleContract>>,
    partition_count: usize,
    poll: Duration,
    state: Mutex<ChannelState>,
    cv: Condvar,
}

impl InputChannel {
    pub(crate) fn new(
        label: String,
        kind: EdgeKind,
        contract: Option<Arc<dyn ShuffleContract>>,
        partition_count: usize,
        upstream_outputs: usize,
        poll: Duration,
    ) -> Self {
        let partitions = if kind == EdgeKind::ScatterGather {
            partition_count
        } else {
            0
        };
        Self {
            label,
            kind,
            contract,
            partition_count: partitions,
            poll,
            state: Mutex::new(ChannelState {
                phase: if upstream_outputs == 0 {
                    Phase::Draining
                } else {
                    Phase::Open
                },
                open_upstream: upstream_outputs,
                queue: VecDeque::new(),
                retained: Vec::new(),
                runs: (0..partitions).map(|_| Vec::new()).collect(),
                mergers: (0..partitions).map(|_| None).collect(),
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn kind(&self) -> EdgeKind {
        self.kind
    }

    pub(crate) fn partition_count(&self) -> usize {
        self.partition_count
    }

    pub(crate) fn state(&self) -> InputState {
        match self.lock().phase {
            Phase::Open => InputState::Open,
            Phase::Draining => InputState::Draining,
            Phase::Complete => InputState::Complete,
            Phase::Failed(_) => InputState::Failed,
        }
    }

    fn edge_failed(&self, message: &str) -> EngineError {
        EngineError::EdgeFailed {
            port: self.label.clone(),
            message: message.to_string(),
        }
    }

    /// Deliver sealed record chunks from a writer.
    pub(crate) fn push_chunks(&self, chunks: &[Arc<SealedChunk>]) -> EngineResult<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut st = self.lock();
        match &st.phase {
            Phase::Open => {}
            Phase::Failed(message) => return Err(self.edge_failed(message)),
            _ => {
                return Err(EngineError::graph(format!(
                    "input {} received data after its writers completed",
                    self.label
                )));
            }
        }
        match self.kind {
            EdgeKind::OneToOne => st.queue.extend(chunks.iter().cloned()),
            EdgeKind::Broadcast => st.retained.extend(chunks.iter().cloned()),
            other => {
                return Err(EngineError::internal(format!(
                    "record chunks delivered to {other} input {}",
                    self.label
                )));
            }
        }
        drop(st);
        self.cv.notify_all();
        Ok(())
    }

    /// Deliver one sorted run per partition (`runs[i]` belongs to partition `i`).
    pub(crate) fn push_runs(&self, runs: &[(usize, SortedRun)]) -> EngineResult<()> {
        let mut st = self.lock();
        match &st.phase {
            Phase::Open => {}
            Phase::Failed(message) => return Err(self.edge_failed(message)),
            _ => {
                return Err(EngineError::graph(format!(
                    "input {} received data after its writers completed",
                    self.label
                )));
            }
        }
        for (partition, run) in runs {
            let slot = st.runs.get_mut(*partition).ok_or_else(|| {
                EngineError::internal(format!(
                    "partition {} out of range for input {}",
                    partition, self.label
                ))
            })?;
            slot.push(run.clone());
        }
        Ok(())
    }

    /// One upstream output finished; the last one moves the input to draining.
    pub(crate) fn upstream_completed(&self) {
        let mut st = self.lock();
        st.open_upstream = st.open_upstream.saturating_sub(1);
        if st.open_upstream == 0 && matches!(st.phase, Phase::Open) {
            st.phase = Phase::Draining;
            debug!(
                "edge input draining: port={} kind={} chunks={} broadcast={}",
                self.label,
                self.kind,
                st.queue.len(),
                st.retained.len()
            );
        }
        drop(st);
        self.cv.notify_all();
    }

    pub(crate) fn is_ready(&self) -> bool {
        !matches!(self.lock().phase, Phase::Open)
    }

    /// Reject readers once the input is finished or failed.
    pub(crate) fn check_readable(&self) -> EngineResult<()> {
        match &self.lock().phase {
            Phase::Open | Phase::Draining => Ok(()),
            Phase::Failed(message) => Err(self.edge_failed(message)),
            Phase::Complete => Err(EngineError::graph(format!(
                "input {} was already completed",
                self.label
            ))),
        }
    }

    pub(crate) fn complete(&self) -> EngineResult<()> {
        let mut st = self.lock();
        match st.phase {
            Phase::Draining => {
                st.phase = Phase::Complete;
                st.release_data();
            }
            Phase::Complete | Phase::Failed(_) => {}
            Phase::Open => {
                return Err(EngineError::graph(format!(
                    "input {} completed before its upstream outputs",
                    self.label
                )));
            }
        }
        drop(st);
        self.cv.notify_all();
        Ok(())
    }

    pub(crate) fn fail(&self, message: &str) {
        let mut st = self.lock();
        if !matches!(st.phase, Phase::Complete | Phase::Failed(_)) {
            st.phase = Phase::Failed(message.to_string());
        }
        st.release_data();
        drop(st);
        self.cv.notify_all();
    }

    /// Drop every retained chunk; readers still open see the input as failed.
    pub(crate) fn close(&self) {
        let mut st = self.lock();
        match st.phase {
            Phase::Open => st.phase = Phase::Failed("edge driver closed".to_string()),
            Phase::Draining => st.phase = Phase::Complete,
            _ => {}
        }
        st.release_data();
        drop(st);
        self.cv.notify_all();
    }

    /// Wait until the predicate yields a value, the write side ends, or the input fails.
    fn wait_for<T>(
        &self,
        cancel: &AtomicBool,
        mut poll: impl FnMut(&mut ChannelState) -> Option<T>,
    ) -> EngineResult<Option<T>> {
        let mut st = self.lock();
        loop {
            if let Phase::Failed(message) = &st.phase {
                return Err(self.edge_failed(message));
            }
            if let Some(value) = poll(&mut *st) {
                return Ok(Some(value));
            }
            if !matches!(st.phase, Phase::Open) {
                return Ok(None);
            }
            if cancel.load(Ordering::Acquire) {
                return Err(EngineError::cancelled(format!(
                    "read from {} cancelled",
                    self.label
                )));
            }
            let (guard, _) = self
                .cv
                .wait_timeout(st, self.poll)
                .unwrap_or_else(|e| e.into_inner());
            st = guard;
        }
    }

    /// Take the next one-to-one chunk; `None` once writers are done and the queue is empty.
    pub(crate) fn take_chunk(&self, cancel: &AtomicBool) -> EngineResult<Option<Arc<SealedChunk>>> {
        self.wait_for(cancel, |st| st.queue.pop_front())
    }

    /// Broadcast chunk at `index` of the retained sequence.
    pub(crate) fn retained_chunk(
        &self,
        index: usize,
        cancel: &AtomicBool,
    ) -> EngineResult<Option<Arc<SealedChunk>>> {
        self.wait_for(cancel, |st| st.retained.get(index).cloned())
    }

    /// Shared merger of one partition, created once the write side is done.
    pub(crate) fn merger(
        &self,
        partition: usize,
        pool: &BufferPool,
        settings: &MergeSettings,
        cancel: &AtomicBool,
    ) -> EngineResult<Arc<Mutex<PartitionMerger>>> {
        let contract = self.contract.clone().ok_or_else(|| {
            EngineError::internal(format!("input {} has no shuffle contract", self.label))
        })?;
        let mut st = self.lock();
        loop {
            match &st.phase {
                Phase::Failed(message) => return Err(self.edge_failed(message)),
                Phase::Complete => {
                    return Err(EngineError::graph(format!(
                        "input {} was already completed",
                        self.label
                    )));
                }
                Phase::Draining => break,
                Phase::Open => {}
            }
            if cancel.load(Ordering::Acquire) {
                return Err(EngineError::cancelled(format!(
                    "read from {} cancelled",
                    self.label
                )));
            }
            let (guard, _) = self
                .cv
                .wait_timeout(st, self.poll)
                .unwrap_or_else(|e| e.into_inner());
            st = guard;
        }
        if partition >= st.mergers.len() {
            return Err(EngineError::graph(format!(
                "partition {} out of range for input {} with {} partitions",
                partition,
                self.label,
                st.mergers.len()
            )));
        }
        if let Some(merger) = &st.mergers[partition] {
            return Ok(Arc::clone(merger));
        }
        let runs = std::mem::take(&mut st.runs[partition]);
        let merger = Arc::new(Mutex::new(PartitionMerger::new(
            runs,
            contract,
            pool.clone(),
            settings.threshold,
            settings.width,
            format!("{}[{}]", self.label, partition),
        )));
        st.mergers[partition] = Some(Arc::clone(&merger));
        Ok(merger)
    }
}
