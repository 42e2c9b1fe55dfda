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
//! Edge driver: owns every edge of one execution.
//!
//! Responsibilities:
//! - Hands out writers per output port and readers per input port, typed by edge kind.
//! - Applies one-to-one, broadcast and scatter-gather semantics on top of pool buffers.
//! - Tracks write-side and read-side completion and failure per port.
//!
//! Key exported interfaces:
//! - Types: `EdgeDriver`, `ShuffleConfig`, `InputState`, `OutputHandle`, `InputHandle`,
//!   `RecordWriter`, `KeyValueWriter`, `RecordReader`, `GroupReader`.
//!
//! Data is owned per input port: all edges entering one input share one
//! channel, and an output port delivers each sealed chunk to every input it
//! feeds. Edge locks are local to a port, never global.

mod channel;
mod chunk;
mod merge;
mod reader;
mod writer;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::common::config;
use crate::common::error::{EngineError, EngineResult};
use crate::common::ids::PortId;
use crate::exec::graph::{EdgeKind, GraphMirror, PortDirection};
use crate::runtime::buffer_pool::BufferPool;
use crate::vanilla_logging::{debug, warn};

use channel::{InputChannel, MergeSettings};
use merge::GroupBuffer;
use writer::OutputPort;

pub use reader::{GroupReader, RecordReader};
pub use writer::{KeyValueWriter, RecordWriter, SignalWriter};

/// Pool buffers each scatter-gather partition needs to make progress: a
/// two-way merge, the merge output and the reader's group.
pub(crate) const MIN_POOL_BUFFERS_PER_PARTITION: usize = 4;

#[derive(Clone, Debug)]
pub struct ShuffleConfig {
    /// Partitions of every scatter-gather edge; readers must use the same count.
    pub partition_count: usize,
    /// More runs than this in one partition triggers a cascading merge.
    pub merge_threshold: usize,
    /// Fraction of the threshold merged per cascading step.
    pub merge_factor: f64,
    /// Staging buffer size of one key/value writer.
    pub sort_buffer_bytes: usize,
}

impl ShuffleConfig {
    pub fn from_app_config() -> Self {
        Self {
            partition_count: config::shuffle_partition_count(),
            merge_threshold: config::shuffle_merge_threshold(),
            merge_factor: config::shuffle_merge_factor(),
            sort_buffer_bytes: config::shuffle_sort_buffer_bytes(),
        }
    }

    /// Runs merged together in one cascading step.
    pub fn merge_width(&self) -> usize {
        let width = (self.merge_threshold as f64 * self.merge_factor).ceil();
        if width.is_finite() && width >= 2.0 {
            width as usize
        } else {
            2
        }
    }

    /// Merge threshold and width that fit a pool of `pool_buffers` standard buffers.
    ///
    /// Every open run pins one buffer and all partitions may merge at once, so
    /// each partition gets an equal share of the pool and opens at most half
    /// of it as runs. The rest is left for merge output and group staging.
    pub(crate) fn merge_limits(&self, pool_buffers: usize) -> (usize, usize) {
        let share = pool_buffers / self.partition_count.max(1);
        let open_runs = (share / 2).max(2);
        (
            self.merge_threshold.max(2).min(open_runs),
            self.merge_width().min(open_runs),
        )
    }
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            partition_count: 1,
            merge_threshold: 64,
            merge_factor: 0.5,
            sort_buffer_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Observable state of an input port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputState {
    /// Some upstream output has not completed yet.
    Open,
    /// All upstream outputs completed; readers may drain.
    Draining,
    /// Read side finished and its data released.
    Complete,
    Failed,
}

/// Write handle returned for an output port.
pub enum OutputHandle {
    Nothing(SignalWriter),
    Records(RecordWriter),
    KeyValues(KeyValueWriter),
}

impl OutputHandle {
    pub fn kind(&self) -> EdgeKind {
        match self {
            OutputHandle::Nothing(_) => EdgeKind::Nothing,
            OutputHandle::Records(_) => EdgeKind::OneToOne,
            OutputHandle::KeyValues(_) => EdgeKind::ScatterGather,
        }
    }

    pub fn into_records(self) -> EngineResult<RecordWriter> {
        match self {
            OutputHandle::Records(writer) => Ok(writer),
            other => Err(EngineError::graph(format!(
                "output is a {} port, not a record port",
                other.kind()
            ))),
        }
    }

    pub fn into_key_values(self) -> EngineResult<KeyValueWriter> {
        match self {
            OutputHandle::KeyValues(writer) => Ok(writer),
            other => Err(EngineError::graph(format!(
                "output is a {} port, not a scatter-gather port",
                other.kind()
            ))),
        }
    }

    pub fn close(self) -> EngineResult<()> {
        match self {
            OutputHandle::Nothing(writer) => writer.close(),
            OutputHandle::Records(writer) => writer.close(),
            OutputHandle::KeyValues(writer) => writer.close(),
        }
    }
}

/// Read handle returned for an input port.
pub enum InputHandle {
    Nothing,
    Records(RecordReader),
    Groups(GroupReader),
}

impl InputHandle {
    pub fn into_records(self) -> EngineResult<RecordReader> {
        match self {
            InputHandle::Records(reader) => Ok(reader),
            InputHandle::Nothing => Err(EngineError::graph("input carries no records")),
            InputHandle::Groups(_) => Err(EngineError::graph(
                "input is a scatter-gather port; read it by groups",
            )),
        }
    }

    pub fn into_groups(self) -> EngineResult<GroupReader> {
        match self {
            InputHandle::Groups(reader) => Ok(reader),
            _ => Err(EngineError::graph("input is not a scatter-gather port")),
        }
    }
}

pub struct EdgeDriver {
    mirror: Arc<GraphMirror>,
    pool: BufferPool,
    config: ShuffleConfig,
    cancel: Arc<AtomicBool>,
    inputs: Vec<Option<Arc<InputChannel>>>,
    outputs: Vec<Option<Arc<OutputPort>>>,
    merge: MergeSettings,
}

impl EdgeDriver {
    pub fn new(
        mirror: Arc<GraphMirror>,
        pool: BufferPool,
        config: ShuffleConfig,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let poll = Duration::from_millis(config::acquire_poll_ms().max(1));
        Self::with_poll(mirror, pool, config, cancel, poll)
    }

    pub fn with_poll(
        mirror: Arc<GraphMirror>,
        pool: BufferPool,
        config: ShuffleConfig,
        cancel: Arc<AtomicBool>,
        poll: Duration,
    ) -> Self {
        let port_count = mirror.ports().len();
        let partition_count = config.partition_count.max(1);
        let mut inputs: Vec<Option<Arc<InputChannel>>> = vec![None; port_count];
        for port in mirror.ports() {
            if port.direction != PortDirection::Input {
                continue;
            }
            let Some(kind) = mirror.kind(port.id) else {
                continue;
            };
            let upstream_outputs = mirror.peers(port.id).len();
            inputs[port.id.index()] = Some(Arc::new(InputChannel::new(
                mirror.port_label(port.id),
                kind,
                mirror.shuffle(port.id).cloned(),
                partition_count,
                upstream_outputs,
                poll,
            )));
        }
        let mut outputs: Vec<Option<Arc<OutputPort>>> = vec![None; port_count];
        for port in mirror.ports() {
            if port.direction != PortDirection::Output {
                continue;
            }
            let Some(kind) = mirror.kind(port.id) else {
                continue;
            };
            let destinations = mirror
                .peers(port.id)
                .iter()
                .filter_map(|peer| inputs[peer.index()].clone())
                .collect::<Vec<_>>();
            outputs[port.id.index()] = Some(Arc::new(OutputPort::new(
                mirror.port_label(port.id),
                kind,
                mirror.shuffle(port.id).cloned(),
                destinations,
            )));
        }
        let pool_buffers = pool.budget() / pool.buffer_size().max(1);
        let (threshold, width) = config.merge_limits(pool_buffers);
        if threshold < config.merge_threshold || width < config.merge_width() {
            debug!(
                "scatter-gather merge capped by the buffer pool: buffers={} partitions={} threshold={}->{} width={}->{}",
                pool_buffers,
                partition_count,
                config.merge_threshold,
                threshold,
                config.merge_width(),
                width
            );
        }
        Self {
            mirror,
            pool,
            config,
            cancel,
            inputs,
            outputs,
            merge: MergeSettings { threshold, width },
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn partition_count(&self) -> usize {
        self.config.partition_count.max(1)
    }

    fn output(&self, port: PortId) -> EngineResult<&Arc<OutputPort>> {
        self.outputs
            .get(port.index())
            .and_then(|o| o.as_ref())
            .ok_or_else(|| {
                EngineError::graph(format!(
                    "port {} is not a connected output",
                    self.mirror.port_label(port)
                ))
            })
    }

    fn input(&self, port: PortId) -> EngineResult<&Arc<InputChannel>> {
        self.inputs
            .get(port.index())
            .and_then(|i| i.as_ref())
            .ok_or_else(|| {
                EngineError::graph(format!(
                    "port {} is not a connected input",
                    self.mirror.port_label(port)
                ))
            })
    }

    /// Open a writer on an output port. Any number of writers may be open at once.
    pub fn acquire_output(&self, port: PortId) -> EngineResult<OutputHandle> {
        let output = self.output(port)?;
        let lease = output.lease()?;
        let handle = match output.kind() {
            EdgeKind::Nothing => OutputHandle::Nothing(SignalWriter::new(lease)),
            EdgeKind::OneToOne | EdgeKind::Broadcast => OutputHandle::Records(RecordWriter::new(
                lease,
                self.pool.clone(),
                Arc::clone(&self.cancel),
            )),
            EdgeKind::ScatterGather => {
                let contract = output.contract().cloned().ok_or_else(|| {
                    EngineError::internal(format!(
                        "scatter-gather output {} has no shuffle contract",
                        output.label()
                    ))
                })?;
                OutputHandle::KeyValues(KeyValueWriter::new(
                    lease,
                    self.pool.clone(),
                    contract,
                    self.partition_count(),
                    self.config.sort_buffer_bytes,
                    Arc::clone(&self.cancel),
                ))
            }
        };
        Ok(handle)
    }

    /// Open a reader on partition `partition_index` of `partition_count`.
    ///
    /// One-to-one readers ignore the partition arguments: every reader drains
    /// the same queue. Broadcast readers all see the full data.
    pub fn acquire_input(
        &self,
        port: PortId,
        partition_index: usize,
        partition_count: usize,
    ) -> EngineResult<InputHandle> {
        let channel = self.input(port)?;
        if partition_index >= partition_count {
            return Err(EngineError::graph(format!(
                "partition {} out of range 0..{} for input {}",
                partition_index,
                partition_count,
                channel.label()
            )));
        }
        channel.check_readable()?;
        let handle = match channel.kind() {
            EdgeKind::Nothing => InputHandle::Nothing,
            EdgeKind::OneToOne => InputHandle::Records(RecordReader::queue(
                Arc::clone(channel),
                self.pool.clone(),
                Arc::clone(&self.cancel),
            )),
            EdgeKind::Broadcast => InputHandle::Records(RecordReader::replay(
                Arc::clone(channel),
                self.pool.clone(),
                Arc::clone(&self.cancel),
            )),
            EdgeKind::ScatterGather => {
                if partition_count != channel.partition_count() {
                    return Err(EngineError::graph(format!(
                        "input {} has {} partitions but was read as {} partitions",
                        channel.label(),
                        channel.partition_count(),
                        partition_count
                    )));
                }
                let merger = channel.merger(partition_index, &self.pool, &self.merge, &self.cancel)?;
                let group = GroupBuffer::new(self.pool.clone());
                InputHandle::Groups(GroupReader::new(
                    Arc::clone(channel),
                    merger,
                    group,
                    Arc::clone(&self.cancel),
                ))
            }
        };
        Ok(handle)
    }

    /// Finish the write side of an output; fails while writers are still open.
    pub fn complete_output(&self, port: PortId) -> EngineResult<()> {
        match self.outputs.get(port.index()) {
            Some(Some(output)) => output.complete(),
            // Unconnected outputs have nobody to notify.
            Some(None) => Ok(()),
            None => Err(EngineError::graph(format!("unknown port {port}"))),
        }
    }

    /// Finish the read side of an input and release its retained data.
    pub fn complete_input(&self, port: PortId) -> EngineResult<()> {
        match self.inputs.get(port.index()) {
            Some(Some(channel)) => channel.complete(),
            Some(None) => Ok(()),
            None => Err(EngineError::graph(format!("unknown port {port}"))),
        }
    }

    /// Mark an input, or every input an output feeds, as failed.
    pub fn fail(&self, port: PortId, message: &str) {
        if let Some(Some(output)) = self.outputs.get(port.index()) {
            warn!("edge output failed: port={} reason={}", output.label(), message);
            output.fail(message);
        }
        if let Some(Some(channel)) = self.inputs.get(port.index()) {
            channel.fail(message);
        }
    }

    /// Write side of the input is complete.
    pub fn is_input_ready(&self, port: PortId) -> bool {
        match self.inputs.get(port.index()) {
            Some(Some(channel)) => channel.is_ready(),
            _ => true,
        }
    }

    pub fn input_state(&self, port: PortId) -> Option<InputState> {
        self.inputs
            .get(port.index())
            .and_then(|i| i.as_ref())
            .map(|channel| channel.state())
    }

    /// Release every retained chunk. Called once at the end of an execution.
    pub fn close_all(&self) {
        for channel in self.inputs.iter().flatten() {
            channel.close();
        }
    }
}
