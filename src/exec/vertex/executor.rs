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
//! Per-vertex execution state.
//!
//! A `VertexExecutor` is owned by the coordinator thread. It only submits jobs
//! to the worker pool; results come back as `VertexEvent`s on a channel, so
//! executor state is never shared across threads.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Sender;

use threadpool::ThreadPool;

use crate::common::error::{EngineError, EngineResult};
use crate::common::ids::VertexId;
use crate::exec::edge::EdgeDriver;
use crate::exec::graph::GraphMirror;
use crate::exec::vertex::{TaskContext, TaskInfo, VertexContext, VertexProcessor};
use crate::vanilla_logging::{debug, info, warn};

/// Result of a job that ran on a worker thread.
pub(crate) enum VertexEvent {
    Initialized {
        vertex: VertexId,
        result: EngineResult<(Box<dyn VertexProcessor>, Vec<TaskInfo>)>,
    },
    TaskFinished {
        vertex: VertexId,
        task_index: usize,
        result: EngineResult<()>,
    },
}

/// Collaborators cloned into every job.
#[derive(Clone)]
pub(crate) struct JobEnv {
    pub(crate) mirror: Arc<GraphMirror>,
    pub(crate) edges: Arc<EdgeDriver>,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) events: Sender<VertexEvent>,
}

impl JobEnv {
    fn send(&self, event: VertexEvent) {
        if self.events.send(event).is_err() {
            debug!("vertex event dropped: coordinator is gone");
        }
    }
}

/// Run `f`, turning a panic into `EngineError::Internal`.
pub(crate) fn guarded<T>(what: &str, f: impl FnOnce() -> EngineResult<T>) -> EngineResult<T> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Err(EngineError::internal(format!("panic in {what}: {msg}")))
    })
}

pub(crate) struct VertexExecutor {
    vertex: VertexId,
    label: Arc<str>,
    concurrency: usize,
    processor: Option<Box<dyn VertexProcessor>>,
    pending: VecDeque<(usize, TaskInfo)>,
    task_count: usize,
    running: usize,
    finished: usize,
}

impl VertexExecutor {
    pub(crate) fn new(vertex: VertexId, label: impl Into<Arc<str>>, concurrency: usize) -> Self {
        Self {
            vertex,
            label: label.into(),
            concurrency: concurrency.max(1),
            processor: None,
            pending: VecDeque::new(),
            task_count: 0,
            running: 0,
            finished: 0,
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn tasks_finished(&self) -> usize {
        self.finished
    }

    /// Submit the create + initialize job. Exactly one `Initialized` event follows.
    pub(crate) fn start(&self, workers: &ThreadPool, env: &JobEnv) {
        let vertex = self.vertex;
        let label = Arc::clone(&self.label);
        let env = env.clone();
        debug!("vertex initializing: {}", label);
        workers.execute(move || {
            let result = guarded("vertex initialization", || {
                let mut processor = env.mirror.vertex(vertex).factory.create()?;
                let mut ctx =
                    VertexContext::new(vertex, &label, &env.mirror, &env.edges, &env.cancel);
                let schedule = processor.initialize(&mut ctx)?;
                let tasks = schedule.map(|s| s.into_tasks()).unwrap_or_default();
                Ok((processor, tasks))
            });
            env.send(VertexEvent::Initialized { vertex, result });
        });
    }

    pub(crate) fn on_initialized(&mut self, processor: Box<dyn VertexProcessor>, tasks: Vec<TaskInfo>) {
        self.task_count = tasks.len();
        self.pending = tasks.into_iter().enumerate().collect();
        self.processor = Some(processor);
        info!(
            "vertex initialized: {} tasks={} concurrency={}",
            self.label, self.task_count, self.concurrency
        );
    }

    /// Submit pending tasks up to the concurrency bound. Returns how many were submitted.
    pub(crate) fn submit_tasks(&mut self, workers: &ThreadPool, env: &JobEnv) -> EngineResult<usize> {
        let mut submitted = 0;
        while self.running < self.concurrency {
            let Some((task_index, info)) = self.pending.pop_front() else {
                break;
            };
            let processor = self.processor.as_ref().ok_or_else(|| {
                EngineError::internal(format!("vertex {} has tasks but no processor", self.label))
            })?;
            let mut task = guarded("task creation", || processor.create_task_processor())?;
            let mut ctx = TaskContext::new(
                self.vertex,
                Arc::clone(&self.label),
                task_index,
                self.task_count,
                info,
                Arc::clone(&env.mirror),
                Arc::clone(&env.edges),
                Arc::clone(&env.cancel),
            );
            let vertex = self.vertex;
            let job_env = env.clone();
            workers.execute(move || {
                let result = guarded("task execution", || task.run(&mut ctx));
                // Handles owned by the task close before the coordinator hears about it.
                drop(task);
                drop(ctx);
                job_env.send(VertexEvent::TaskFinished {
                    vertex,
                    task_index,
                    result,
                });
            });
            self.running += 1;
            submitted += 1;
        }
        Ok(submitted)
    }

    pub(crate) fn on_task_finished(&mut self, task_index: usize) {
        self.running = self.running.saturating_sub(1);
        self.finished += 1;
        debug!(
            "task finished: {} task={} finished={}/{}",
            self.label, task_index, self.finished, self.task_count
        );
    }

    /// Initialized, every task submitted and finished.
    pub(crate) fn is_done(&self) -> bool {
        self.processor.is_some() && self.pending.is_empty() && self.running == 0
    }

    /// Complete every output port, then every input port.
    pub(crate) fn complete_ports(&self, mirror: &GraphMirror, edges: &EdgeDriver) -> EngineResult<()> {
        let desc = mirror.vertex(self.vertex);
        for port in &desc.outputs {
            edges.complete_output(*port)?;
        }
        for port in &desc.inputs {
            edges.complete_input(*port)?;
        }
        Ok(())
    }

    /// Fail every output of this vertex so downstream readers stop waiting.
    pub(crate) fn fail_outputs(&self, mirror: &GraphMirror, edges: &EdgeDriver, message: &str) {
        for port in &mirror.vertex(self.vertex).outputs {
            edges.fail(*port, message);
        }
        if self.running > 0 {
            warn!(
                "vertex {} failed with {} task(s) still running",
                self.label, self.running
            );
        }
    }
}
