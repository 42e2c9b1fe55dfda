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
//! Whole-graph execution.
//!
//! Responsibilities:
//! - Builds the per-execution runtime: mirror, buffer pool, optional spill store, edge driver, workers.
//! - Coordinates vertex lifecycles on the calling thread; all processor code runs on the workers.
//! - Stops the graph on the first failure and reports it labelled with the failing vertex.
//! - Fails the graph when every running job waits on a buffer pool that can no longer move.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use threadpool::ThreadPool;

use crate::common::config;
use crate::common::error::{EngineError, EngineResult};
use crate::common::ids::VertexId;
use crate::exec::edge::{EdgeDriver, MIN_POOL_BUFFERS_PER_PARTITION, ShuffleConfig};
use crate::exec::graph::{GraphDescription, GraphMirror};
use crate::exec::scheduler::{BasicVertexScheduler, VertexScheduler};
use crate::exec::spill::{BufferStore, BufferStoreStats, SpillStorageConfig};
use crate::exec::vertex::executor::{JobEnv, VertexEvent, VertexExecutor};
use crate::runtime::buffer_pool::{BufferPool, BufferPoolConfig, BufferPoolStats, PoolWaiters};
use crate::vanilla_logging::{debug, error, info, warn};

/// Everything one execution needs to size its runtime.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub worker_threads: usize,
    /// Default per-vertex task concurrency; `MaxConcurrency` attributes lower it.
    pub task_concurrency: usize,
    /// Vertices allowed in `Running` at once; `None` = unbounded.
    pub max_running_vertices: Option<usize>,
    pub pool: BufferPoolConfig,
    /// Spill storage; `None` disables spilling.
    pub spill: Option<SpillStorageConfig>,
    pub shuffle: ShuffleConfig,
}

impl EngineConfig {
    pub fn from_app_config() -> Self {
        Self {
            worker_threads: config::worker_threads(),
            task_concurrency: config::task_concurrency(),
            max_running_vertices: config::max_running_vertices(),
            pool: BufferPoolConfig::from_app_config(),
            spill: SpillStorageConfig::from_app_config(),
            shuffle: ShuffleConfig::from_app_config(),
        }
    }

    /// Reject pools that cannot hold a scatter-gather merge for every partition.
    pub fn validate(&self) -> EngineResult<()> {
        let pool = &self.pool;
        if pool.buffer_size_bytes == 0 || pool.buffer_size_bytes > pool.budget_bytes {
            return Err(EngineError::graph(format!(
                "buffer pool budget of {} bytes cannot hold {}-byte buffers",
                pool.budget_bytes, pool.buffer_size_bytes
            )));
        }
        let buffers = pool.budget_bytes / pool.buffer_size_bytes;
        let partitions = self.shuffle.partition_count.max(1);
        if buffers / partitions < MIN_POOL_BUFFERS_PER_PARTITION {
            return Err(EngineError::graph(format!(
                "buffer pool holds {} buffers, fewer than {} for each of {} partitions",
                buffers, MIN_POOL_BUFFERS_PER_PARTITION, partitions
            )));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            worker_threads: threads,
            task_concurrency: threads,
            max_running_vertices: None,
            pool: BufferPoolConfig::default(),
            spill: None,
            shuffle: ShuffleConfig::default(),
        }
    }
}

/// Coordinator polls without pool progress before a full stall fails the graph.
const STALL_POLLS: u32 = 20;

/// Watches for a pool that every running job is parked on while nothing is
/// granted or released. No job inside the graph can unblock such a pool.
struct StallWatch {
    window: Duration,
    progress: u64,
    since: Option<Instant>,
}

impl StallWatch {
    fn new(poll: Duration) -> Self {
        Self {
            window: poll * STALL_POLLS,
            progress: 0,
            since: None,
        }
    }

    /// Request size of the head waiter once a full stall has outlasted the window.
    fn observe(&mut self, waiters: PoolWaiters, active_jobs: usize, now: Instant) -> Option<usize> {
        let all_parked = active_jobs > 0 && waiters.parked >= active_jobs;
        if !all_parked || waiters.progress != self.progress {
            self.progress = waiters.progress;
            self.since = all_parked.then_some(now);
            return None;
        }
        let since = *self.since.get_or_insert(now);
        if now.duration_since(since) >= self.window {
            waiters.head_request
        } else {
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionSummary {
    pub vertices_completed: usize,
    pub tasks_run: usize,
    pub elapsed: Duration,
    pub pool: BufferPoolStats,
    pub spill: Option<BufferStoreStats>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VertexPhase {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Coordinator-side bookkeeping for one `run`.
struct RunState {
    phases: Vec<VertexPhase>,
    executors: Vec<Option<VertexExecutor>>,
    running_vertices: usize,
    in_flight: usize,
    completed: usize,
    tasks_run: usize,
    failure: Option<EngineError>,
}

impl RunState {
    fn new(vertex_count: usize) -> Self {
        Self {
            phases: vec![VertexPhase::Pending; vertex_count],
            executors: (0..vertex_count).map(|_| None).collect(),
            running_vertices: 0,
            in_flight: 0,
            completed: 0,
            tasks_run: 0,
            failure: None,
        }
    }

    fn leave_running(&mut self, vertex: VertexId, phase: VertexPhase) {
        let slot = &mut self.phases[vertex.index()];
        if *slot == VertexPhase::Running {
            self.running_vertices -= 1;
        }
        *slot = phase;
    }
}

/// Runs one graph once.
pub struct GraphExecutor {
    mirror: Arc<GraphMirror>,
    pool: BufferPool,
    store: Option<Arc<BufferStore>>,
    edges: Arc<EdgeDriver>,
    cancel: Arc<AtomicBool>,
    workers: ThreadPool,
    scheduler: Box<dyn VertexScheduler>,
    config: EngineConfig,
}

impl GraphExecutor {
    pub fn new(graph: GraphDescription, config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let mirror = Arc::new(GraphMirror::new(graph)?);
        let store = match config.spill.clone() {
            Some(spill) => Some(BufferStore::new(spill)?),
            None => None,
        };
        let pool = BufferPool::new(config.pool.clone(), store.clone());
        let cancel = Arc::new(AtomicBool::new(false));
        let poll = config.pool.acquire_poll.max(Duration::from_millis(1));
        let edges = Arc::new(EdgeDriver::with_poll(
            Arc::clone(&mirror),
            pool.clone(),
            config.shuffle.clone(),
            Arc::clone(&cancel),
            poll,
        ));
        let workers = ThreadPool::with_name("vanilla-worker".to_string(), config.worker_threads.max(1));
        let scheduler = Box::new(BasicVertexScheduler::new(&mirror));
        Ok(Self {
            mirror,
            pool,
            store,
            edges,
            cancel,
            workers,
            scheduler,
            config,
        })
    }

    /// Replace the readiness policy; build it from `mirror()`.
    pub fn with_scheduler(mut self, scheduler: Box<dyn VertexScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn mirror(&self) -> &Arc<GraphMirror> {
        &self.mirror
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Flag that stops the execution when set; tasks observe it at their next check.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn run(mut self) -> EngineResult<ExecutionSummary> {
        let started = Instant::now();
        let (tx, rx) = mpsc::channel();
        let env = JobEnv {
            mirror: Arc::clone(&self.mirror),
            edges: Arc::clone(&self.edges),
            cancel: Arc::clone(&self.cancel),
            events: tx,
        };
        let vertex_count = self.mirror.vertex_count();
        let mut st = RunState::new(vertex_count);
        let poll = self.config.pool.acquire_poll.max(Duration::from_millis(1));
        let mut stall = StallWatch::new(poll);
        info!(
            "graph execution started: vertices={} workers={} budget={}",
            vertex_count,
            self.workers.max_count(),
            self.pool.budget()
        );

        loop {
            if st.failure.is_none() && self.cancel.load(Ordering::Acquire) {
                self.fail(&mut st, None, EngineError::cancelled("execution cancelled"));
            }
            if st.failure.is_none() {
                self.launch_ready(&mut st, &env);
            }
            if st.in_flight == 0 {
                break;
            }
            let event = match rx.recv_timeout(poll) {
                Ok(event) => event,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if st.failure.is_none() {
                        self.check_stall(&mut st, &mut stall);
                    }
                    continue;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    self.fail(&mut st, None, EngineError::internal("vertex event channel closed"));
                    break;
                }
            };
            st.in_flight -= 1;
            self.handle_event(&mut st, &env, event);
        }
        drop(env);

        self.edges.close_all();
        // Processors may still own buffers.
        st.executors.clear();
        let elapsed = started.elapsed();

        if let Some(err) = st.failure {
            error!(
                "graph execution failed after {:?}: {} (outstanding_bytes={})",
                elapsed,
                err,
                self.pool.outstanding_bytes()
            );
            return Err(err);
        }
        if st.completed != vertex_count || self.scheduler.has_pending() {
            return Err(EngineError::internal(format!(
                "{} of {} vertices never became ready",
                vertex_count - st.completed,
                vertex_count
            )));
        }
        let summary = ExecutionSummary {
            vertices_completed: st.completed,
            tasks_run: st.tasks_run,
            elapsed,
            pool: self.pool.stats(),
            spill: self.store.as_ref().map(|s| s.stats()),
        };
        info!(
            "graph execution finished: vertices={} tasks={} elapsed={:?} peak_bytes={} spills={}",
            summary.vertices_completed,
            summary.tasks_run,
            summary.elapsed,
            summary.pool.peak_bytes,
            summary.pool.spills
        );
        Ok(summary)
    }

    /// Running jobs that could still release pool bytes. Queued jobs that an
    /// idle worker is about to pick up count as progress.
    fn active_jobs(&self) -> usize {
        let active = self.workers.active_count();
        if self.workers.queued_count() > 0 && active < self.workers.max_count() {
            0
        } else {
            active
        }
    }

    fn check_stall(&mut self, st: &mut RunState, stall: &mut StallWatch) {
        let waiters = self.pool.waiters();
        let Some(requested) = stall.observe(waiters, self.active_jobs(), Instant::now()) else {
            return;
        };
        warn!(
            "buffer pool stalled: parked={} head_request={} outstanding={} budget={} spill={}",
            waiters.parked,
            requested,
            self.pool.outstanding_bytes(),
            self.pool.budget(),
            self.store.is_some()
        );
        let budget = self.pool.budget();
        self.fail(st, None, EngineError::BudgetExceeded { requested, budget });
    }

    fn launch_ready(&mut self, st: &mut RunState, env: &JobEnv) {
        while self
            .config
            .max_running_vertices
            .is_none_or(|max| st.running_vertices < max.max(1))
        {
            let Some(vertex) = self.scheduler.next_ready() else {
                break;
            };
            if st.phases[vertex.index()] != VertexPhase::Pending {
                warn!("scheduler released vertex {} twice", vertex);
                continue;
            }
            let concurrency = match self.mirror.max_concurrency(vertex) {
                Some(max) => max.min(self.config.task_concurrency.max(1)),
                None => self.config.task_concurrency.max(1),
            };
            let exec = VertexExecutor::new(vertex, self.mirror.vertex_label(vertex), concurrency);
            exec.start(&self.workers, env);
            st.executors[vertex.index()] = Some(exec);
            st.phases[vertex.index()] = VertexPhase::Running;
            st.running_vertices += 1;
            st.in_flight += 1;
        }
    }

    fn handle_event(&mut self, st: &mut RunState, env: &JobEnv, event: VertexEvent) {
        match event {
            VertexEvent::Initialized { vertex, result } => match result {
                Ok((processor, tasks)) => {
                    if st.failure.is_some() {
                        st.leave_running(vertex, VertexPhase::Failed);
                        return;
                    }
                    if let Some(exec) = st.executors[vertex.index()].as_mut() {
                        exec.on_initialized(processor, tasks);
                    }
                    self.advance(st, env, vertex);
                }
                Err(err) => self.fail(st, Some(vertex), err),
            },
            VertexEvent::TaskFinished {
                vertex,
                task_index,
                result,
            } => {
                st.tasks_run += 1;
                if let Some(exec) = st.executors[vertex.index()].as_mut() {
                    exec.on_task_finished(task_index);
                }
                match result {
                    Ok(()) if st.failure.is_none() => self.advance(st, env, vertex),
                    Ok(()) => {}
                    Err(err) => self.fail(st, Some(vertex), err),
                }
            }
        }
    }

    /// Submit more tasks of `vertex`, completing it when nothing is left.
    fn advance(&mut self, st: &mut RunState, env: &JobEnv, vertex: VertexId) {
        let Some(mut exec) = st.executors[vertex.index()].take() else {
            return;
        };
        match exec.submit_tasks(&self.workers, env) {
            Ok(submitted) => st.in_flight += submitted,
            Err(err) => {
                st.executors[vertex.index()] = Some(exec);
                self.fail(st, Some(vertex), err);
                return;
            }
        }
        if !exec.is_done() {
            st.executors[vertex.index()] = Some(exec);
            return;
        }
        match exec.complete_ports(&self.mirror, &self.edges) {
            Ok(()) => {
                info!(
                    "vertex completed: {} tasks={}",
                    exec.label(),
                    exec.tasks_finished()
                );
                st.leave_running(vertex, VertexPhase::Completed);
                st.completed += 1;
                self.scheduler.on_completed(vertex);
            }
            Err(err) => {
                st.executors[vertex.index()] = Some(exec);
                self.fail(st, Some(vertex), err);
            }
        }
    }

    /// Record a failure. The first one cancels the execution; later ones are logged.
    fn fail(&mut self, st: &mut RunState, vertex: Option<VertexId>, err: EngineError) {
        let label = vertex.map(|v| self.mirror.vertex_label(v));
        if let Some(v) = vertex {
            st.leave_running(v, VertexPhase::Failed);
        }
        if st.failure.is_some() {
            if !err.is_cancelled() {
                warn!(
                    "additional failure in {}: {}",
                    label.as_deref().unwrap_or("graph"),
                    err
                );
            } else {
                debug!("{} stopped: {}", label.as_deref().unwrap_or("graph"), err);
            }
            return;
        }
        error!("{} failed: {}", label.as_deref().unwrap_or("graph"), err);
        self.cancel.store(true, Ordering::Release);
        let reason = match &label {
            Some(label) => format!("vertex {label} failed"),
            None => format!("execution stopped: {err}"),
        };
        self.pool.cancel(reason.clone());
        if let Some(v) = vertex {
            match st.executors[v.index()].as_ref() {
                Some(exec) => exec.fail_outputs(&self.mirror, &self.edges, &reason),
                None => {
                    for port in &self.mirror.vertex(v).outputs {
                        self.edges.fail(*port, &reason);
                    }
                }
            }
        }
        st.failure = Some(match label {
            Some(label) => err.in_vertex(label),
            None => err,
        });
    }
}

/// Reusable entry point: one `GraphExecutor` per `execute` call.
#[derive(Clone, Debug, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn from_app_config() -> Self {
        Self::new(EngineConfig::from_app_config())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn execute(&self, graph: GraphDescription) -> EngineResult<ExecutionSummary> {
        GraphExecutor::new(graph, self.config.clone())?.run()
    }
}
