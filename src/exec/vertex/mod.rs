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
//! Vertex processor contract and per-vertex execution.
//!
//! Responsibilities:
//! - Defines the traits a vertex implementation provides: factory, processor, task processor.
//! - Defines task schedules with opaque per-task hints.
//! - Runs one vertex: initialize, bounded concurrent tasks, port completion.

mod context;
pub(crate) mod executor;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::common::error::EngineResult;

pub use context::{TaskContext, VertexContext};

/// Creates a fresh processor for each execution of a vertex.
pub trait VertexProcessorFactory: Send + Sync + fmt::Debug {
    fn create(&self) -> EngineResult<Box<dyn VertexProcessor>>;
}

pub trait VertexProcessor: Send {
    /// Decide the vertex's tasks. Broadcast inputs may be drained here.
    ///
    /// `None` or an empty schedule means the vertex has no task to run.
    fn initialize(&mut self, ctx: &mut VertexContext<'_>) -> EngineResult<Option<TaskSchedule>>;

    fn create_task_processor(&self) -> EngineResult<Box<dyn TaskProcessor>>;
}

pub trait TaskProcessor: Send {
    fn run(&mut self, ctx: &mut TaskContext) -> EngineResult<()>;
}

/// Descriptor of one task: its position and an optional opaque hint.
#[derive(Clone, Default)]
pub struct TaskInfo {
    hint: Option<Arc<dyn Any + Send + Sync>>,
}

impl TaskInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hint<T: Any + Send + Sync>(hint: T) -> Self {
        Self {
            hint: Some(Arc::new(hint)),
        }
    }

    pub fn hint<T: Any>(&self) -> Option<&T> {
        self.hint.as_deref().and_then(|h| h.downcast_ref::<T>())
    }

    pub fn has_hint(&self) -> bool {
        self.hint.is_some()
    }
}

impl fmt::Debug for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInfo")
            .field("has_hint", &self.hint.is_some())
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
pub struct TaskSchedule {
    tasks: Vec<TaskInfo>,
}

impl TaskSchedule {
    pub fn new(tasks: Vec<TaskInfo>) -> Self {
        Self { tasks }
    }

    /// `count` tasks without hints.
    pub fn with_count(count: usize) -> Self {
        Self {
            tasks: (0..count).map(|_| TaskInfo::new()).collect(),
        }
    }

    pub fn push(&mut self, task: TaskInfo) {
        self.tasks.push(task);
    }

    pub fn tasks(&self) -> &[TaskInfo] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn into_tasks(self) -> Vec<TaskInfo> {
        self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_downcast_by_type() {
        let info = TaskInfo::with_hint(42usize);
        assert_eq!(info.hint::<usize>(), Some(&42));
        assert!(info.hint::<String>().is_none());
        assert!(!TaskInfo::new().has_hint());
    }

    #[test]
    fn schedule_counts_tasks() {
        let mut schedule = TaskSchedule::with_count(2);
        schedule.push(TaskInfo::with_hint("split-3".to_string()));
        assert_eq!(schedule.len(), 3);
        assert_eq!(
            schedule.tasks()[2].hint::<String>().map(String::as_str),
            Some("split-3")
        );
        assert!(TaskSchedule::default().is_empty());
    }
}
