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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use vanilla_dag::vanilla_logging;
use vanilla_dag::{
    BufferPoolConfig, EngineConfig, EngineResult, ShuffleConfig, SpillStorageConfig, TaskContext,
    TaskProcessor, TaskSchedule, VertexContext, VertexProcessor, VertexProcessorFactory,
};

type InitFn = dyn Fn(&mut VertexContext<'_>) -> EngineResult<Option<TaskSchedule>> + Send + Sync;
type TaskFn = dyn Fn(&mut TaskContext) -> EngineResult<()> + Send + Sync;

/// Vertex built from closures: `init` decides the schedule, `task` is run by every task.
pub struct FnVertex {
    init: Arc<InitFn>,
    task: Arc<TaskFn>,
}

impl fmt::Debug for FnVertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnVertex")
    }
}

impl VertexProcessorFactory for FnVertex {
    fn create(&self) -> EngineResult<Box<dyn VertexProcessor>> {
        Ok(Box::new(FnProcessor {
            init: Arc::clone(&self.init),
            task: Arc::clone(&self.task),
        }))
    }
}

struct FnProcessor {
    init: Arc<InitFn>,
    task: Arc<TaskFn>,
}

impl VertexProcessor for FnProcessor {
    fn initialize(&mut self, ctx: &mut VertexContext<'_>) -> EngineResult<Option<TaskSchedule>> {
        (self.init)(ctx)
    }

    fn create_task_processor(&self) -> EngineResult<Box<dyn TaskProcessor>> {
        Ok(Box::new(FnTask {
            task: Arc::clone(&self.task),
        }))
    }
}

struct FnTask {
    task: Arc<TaskFn>,
}

impl TaskProcessor for FnTask {
    fn run(&mut self, ctx: &mut TaskContext) -> EngineResult<()> {
        (self.task)(ctx)
    }
}

/// Vertex running `tasks` copies of `task`.
pub fn tasks<F>(tasks: usize, task: F) -> Arc<dyn VertexProcessorFactory>
where
    F: Fn(&mut TaskContext) -> EngineResult<()> + Send + Sync + 'static,
{
    with_init(move |_ctx| Ok(Some(TaskSchedule::with_count(tasks))), task)
}

pub fn with_init<I, F>(init: I, task: F) -> Arc<dyn VertexProcessorFactory>
where
    I: Fn(&mut VertexContext<'_>) -> EngineResult<Option<TaskSchedule>> + Send + Sync + 'static,
    F: Fn(&mut TaskContext) -> EngineResult<()> + Send + Sync + 'static,
{
    Arc::new(FnVertex {
        init: Arc::new(init),
        task: Arc::new(task),
    })
}

/// Thread-safe sink shared between a test and its vertices.
pub type Collected<T> = Arc<Mutex<Vec<T>>>;

pub fn collected<T>() -> Collected<T> {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn take<T: Clone>(c: &Collected<T>) -> Vec<T> {
    c.lock().unwrap().clone()
}

/// Small engine config so tests exercise blocking and chunking.
pub fn engine_config(budget_bytes: usize, buffer_size_bytes: usize) -> EngineConfig {
    vanilla_logging::init_with_level("warn");
    EngineConfig {
        worker_threads: 4,
        task_concurrency: 4,
        max_running_vertices: None,
        pool: BufferPoolConfig {
            budget_bytes,
            buffer_size_bytes,
            free_list_capacity: 8,
            acquire_poll: Duration::from_millis(5),
        },
        spill: None,
        shuffle: ShuffleConfig {
            partition_count: 1,
            ..ShuffleConfig::default()
        },
    }
}

/// Config with spill storage in a fresh temp dir; keep the dir alive for the test.
pub fn spilling_config(budget_bytes: usize, buffer_size_bytes: usize) -> (EngineConfig, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = engine_config(budget_bytes, buffer_size_bytes);
    config.spill = Some(SpillStorageConfig {
        local_dirs: vec![dir.path().to_path_buf()],
        dir_max_bytes: 1 << 30,
    });
    (config, dir)
}
