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
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::error::{EngineError, EngineResult};
use crate::common::ids::VertexId;
use crate::exec::edge::{EdgeDriver, InputHandle, OutputHandle};
use crate::exec::graph::{GraphMirror, PortDirection};
use crate::exec::vertex::TaskInfo;

fn acquire_input(
    mirror: &GraphMirror,
    edges: &EdgeDriver,
    vertex: VertexId,
    name: &str,
    partition_index: usize,
    partition_count: usize,
) -> EngineResult<InputHandle> {
    let port = mirror.resolve_port(vertex, name, PortDirection::Input)?;
    edges.acquire_input(port, partition_index, partition_count)
}

fn acquire_output(
    mirror: &GraphMirror,
    edges: &EdgeDriver,
    vertex: VertexId,
    name: &str,
) -> EngineResult<OutputHandle> {
    let port = mirror.resolve_port(vertex, name, PortDirection::Output)?;
    edges.acquire_output(port)
}

fn check_cancelled(cancel: &AtomicBool, label: &str) -> EngineResult<()> {
    if cancel.load(Ordering::Acquire) {
        return Err(EngineError::cancelled(format!("vertex {label} cancelled")));
    }
    Ok(())
}

/// What a processor sees during `initialize`.
pub struct VertexContext<'a> {
    vertex: VertexId,
    label: &'a str,
    mirror: &'a GraphMirror,
    edges: &'a EdgeDriver,
    cancel: &'a AtomicBool,
}

impl<'a> VertexContext<'a> {
    pub(crate) fn new(
        vertex: VertexId,
        label: &'a str,
        mirror: &'a GraphMirror,
        edges: &'a EdgeDriver,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            vertex,
            label,
            mirror,
            edges,
            cancel,
        }
    }

    pub fn vertex_id(&self) -> VertexId {
        self.vertex
    }

    pub fn label(&self) -> &str {
        self.label
    }

    /// Partition count of scatter-gather inputs; schedule this many tasks to read them.
    pub fn partition_count(&self) -> usize {
        self.edges.partition_count()
    }

    /// Open an input during initialization, typically to drain a broadcast input.
    pub fn acquire_input(
        &self,
        name: &str,
        partition_index: usize,
        partition_count: usize,
    ) -> EngineResult<InputHandle> {
        acquire_input(
            self.mirror,
            self.edges,
            self.vertex,
            name,
            partition_index,
            partition_count,
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn check_cancelled(&self) -> EngineResult<()> {
        check_cancelled(self.cancel, self.label)
    }
}

/// What a task processor sees while it runs.
pub struct TaskContext {
    vertex: VertexId,
    label: Arc<str>,
    task_index: usize,
    task_count: usize,
    info: TaskInfo,
    mirror: Arc<GraphMirror>,
    edges: Arc<EdgeDriver>,
    cancel: Arc<AtomicBool>,
}

impl TaskContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        vertex: VertexId,
        label: Arc<str>,
        task_index: usize,
        task_count: usize,
        info: TaskInfo,
        mirror: Arc<GraphMirror>,
        edges: Arc<EdgeDriver>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            vertex,
            label,
            task_index,
            task_count,
            info,
            mirror,
            edges,
            cancel,
        }
    }

    pub fn vertex_id(&self) -> VertexId {
        self.vertex
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn task_index(&self) -> usize {
        self.task_index
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    pub fn task_info(&self) -> &TaskInfo {
        &self.info
    }

    pub fn partition_count(&self) -> usize {
        self.edges.partition_count()
    }

    pub fn acquire_output(&self, name: &str) -> EngineResult<OutputHandle> {
        acquire_output(&self.mirror, &self.edges, self.vertex, name)
    }

    pub fn acquire_input(
        &self,
        name: &str,
        partition_index: usize,
        partition_count: usize,
    ) -> EngineResult<InputHandle> {
        acquire_input(
            &self.mirror,
            &self.edges,
            self.vertex,
            name,
            partition_index,
            partition_count,
        )
    }

    /// Input partition matching this task: index = task index, count = task count.
    pub fn acquire_partition_input(&self, name: &str) -> EngineResult<InputHandle> {
        self.acquire_input(name, self.task_index, self.task_count)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn check_cancelled(&self) -> EngineResult<()> {
        check_cancelled(&self.cancel, &self.label)
    }
}
