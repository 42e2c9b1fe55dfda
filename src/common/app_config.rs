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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::exec::edge::MIN_POOL_BUFFERS_PER_PARTITION;

static CONFIG: OnceLock<VanillaConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static VanillaConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = VanillaConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config is not initialized"))
}

pub fn init_from_env_or_default() -> Result<&'static VanillaConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = VanillaConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config is not initialized"))
}

pub fn config() -> Result<&'static VanillaConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("VANILLA_CONFIG")
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    let candidates = [PathBuf::from("vanilla.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $VANILLA_CONFIG or create ./vanilla.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct VanillaConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "vanilla_dag=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub buffer_pool: BufferPoolSection,

    #[serde(default)]
    pub spill: SpillSection,

    #[serde(default)]
    pub shuffle: ShuffleSection,
}

impl VanillaConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        Self::parse(&s).with_context(|| format!("parse toml: {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let cfg: VanillaConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Filter expression handed to the tracing subscriber.
    pub fn effective_log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(&self.log_level)
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_pool.budget_bytes == 0 {
            return Err(anyhow!("buffer_pool.budget_bytes must be positive"));
        }
        if self.buffer_pool.buffer_size_bytes == 0 {
            return Err(anyhow!("buffer_pool.buffer_size_bytes must be positive"));
        }
        if self.buffer_pool.buffer_size_bytes > self.buffer_pool.budget_bytes {
            return Err(anyhow!(
                "buffer_pool.buffer_size_bytes ({}) exceeds buffer_pool.budget_bytes ({})",
                self.buffer_pool.buffer_size_bytes,
                self.buffer_pool.budget_bytes
            ));
        }
        let buffers = self.buffer_pool.budget_bytes / self.buffer_pool.buffer_size_bytes;
        if buffers < MIN_POOL_BUFFERS_PER_PARTITION {
            return Err(anyhow!(
                "buffer_pool holds {} buffers; at least {} are needed to merge scatter-gather runs",
                buffers,
                MIN_POOL_BUFFERS_PER_PARTITION
            ));
        }
        // 0 resolves to the worker count at runtime and is sized there.
        let partitions = self.shuffle.partition_count;
        if partitions > 0 && buffers / partitions < MIN_POOL_BUFFERS_PER_PARTITION {
            return Err(anyhow!(
                "buffer_pool holds {} buffers, fewer than {} per partition for shuffle.partition_count = {}",
                buffers,
                MIN_POOL_BUFFERS_PER_PARTITION,
                partitions
            ));
        }
        if self.shuffle.merge_threshold < 2 {
            return Err(anyhow!("shuffle.merge_threshold must be at least 2"));
        }
        if !(self.shuffle.merge_factor > 0.0 && self.shuffle.merge_factor <= 1.0) {
            return Err(anyhow!("shuffle.merge_factor must be in (0, 1]"));
        }
        Ok(())
    }
}

impl Default for VanillaConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            runtime: RuntimeConfig::default(),
            buffer_pool: BufferPoolSection::default(),
            spill: SpillSection::default(),
            shuffle: ShuffleSection::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub worker_threads: usize,
    #[serde(default)]
    pub max_running_vertices: usize,
    #[serde(default)]
    pub task_concurrency: usize,
    #[serde(default = "default_acquire_poll_ms")]
    pub acquire_poll_ms: u64,
}

fn default_acquire_poll_ms() -> u64 {
    50
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            max_running_vertices: 0,
            task_concurrency: 0,
            acquire_poll_ms: default_acquire_poll_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Get the actual number of worker threads.
    /// Returns CPU cores if configured as 0.
    pub fn actual_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    pub fn actual_task_concurrency(&self) -> usize {
        if self.task_concurrency > 0 {
            self.task_concurrency
        } else {
            self.actual_worker_threads()
        }
    }

    /// `None` means no limit on concurrently running vertices.
    pub fn actual_max_running_vertices(&self) -> Option<usize> {
        (self.max_running_vertices > 0).then_some(self.max_running_vertices)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BufferPoolSection {
    #[serde(default = "default_budget_bytes")]
    pub budget_bytes: usize,
    #[serde(default = "default_buffer_size_bytes")]
    pub buffer_size_bytes: usize,
    #[serde(default = "default_free_list_capacity")]
    pub free_list_capacity: usize,
}

fn default_budget_bytes() -> usize {
    256 * 1024 * 1024
}
fn default_buffer_size_bytes() -> usize {
    256 * 1024
}
fn default_free_list_capacity() -> usize {
    16
}

impl Default for BufferPoolSection {
    fn default() -> Self {
        Self {
            budget_bytes: default_budget_bytes(),
            buffer_size_bytes: default_buffer_size_bytes(),
            free_list_capacity: default_free_list_capacity(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SpillSection {
    #[serde(default = "default_spill_enable")]
    pub enable: bool,
    #[serde(default)]
    pub local_dirs: Vec<String>,
    #[serde(default)]
    pub dir_max_bytes: u64,
}

fn default_spill_enable() -> bool {
    true
}

impl Default for SpillSection {
    fn default() -> Self {
        Self {
            enable: default_spill_enable(),
            local_dirs: Vec::new(),
            dir_max_bytes: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ShuffleSection {
    /// Partitions per scatter-gather edge; 0 = worker thread count.
    #[serde(default)]
    pub partition_count: usize,
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: usize,
    #[serde(default = "default_merge_factor")]
    pub merge_factor: f64,
    #[serde(default = "default_sort_buffer_bytes")]
    pub sort_buffer_bytes: usize,
}

fn default_merge_threshold() -> usize {
    64
}
fn default_merge_factor() -> f64 {
    0.5
}
fn default_sort_buffer_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for ShuffleSection {
    fn default() -> Self {
        Self {
            partition_count: 0,
            merge_threshold: default_merge_threshold(),
            merge_factor: default_merge_factor(),
            sort_buffer_bytes: default_sort_buffer_bytes(),
        }
    }
}
