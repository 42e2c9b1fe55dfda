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
use crate::vanilla_config::config as vanilla_app_config;

pub(crate) fn worker_threads() -> usize {
    vanilla_app_config()
        .ok()
        .map(|c| c.runtime.actual_worker_threads())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn task_concurrency() -> usize {
    vanilla_app_config()
        .ok()
        .map(|c| c.runtime.actual_task_concurrency())
        .unwrap_or_else(worker_threads)
}

pub(crate) fn max_running_vertices() -> Option<usize> {
    vanilla_app_config()
        .ok()
        .and_then(|c| c.runtime.actual_max_running_vertices())
}

pub(crate) fn acquire_poll_ms() -> u64 {
    vanilla_app_config()
        .ok()
        .map(|c| c.runtime.acquire_poll_ms)
        .unwrap_or(50)
}

pub(crate) fn buffer_pool_budget_bytes() -> usize {
    vanilla_app_config()
        .ok()
        .map(|c| c.buffer_pool.budget_bytes)
        .unwrap_or(256 * 1024 * 1024)
}

pub(crate) fn buffer_size_bytes() -> usize {
    vanilla_app_config()
        .ok()
        .map(|c| c.buffer_pool.buffer_size_bytes)
        .unwrap_or(256 * 1024)
}

pub(crate) fn buffer_free_list_capacity() -> usize {
    vanilla_app_config()
        .ok()
        .map(|c| c.buffer_pool.free_list_capacity)
        .unwrap_or(16)
}

pub(crate) fn spill_enable() -> bool {
    vanilla_app_config()
        .ok()
        .map(|c| c.spill.enable)
        .unwrap_or(true)
}

pub(crate) fn spill_local_dirs() -> Vec<String> {
    let configured = vanilla_app_config()
        .ok()
        .map(|c| c.spill.local_dirs.clone())
        .unwrap_or_default();
    if configured.is_empty() {
        let mut default_dir = std::env::temp_dir();
        default_dir.push("vanilla-spill");
        vec![default_dir.to_string_lossy().into_owned()]
    } else {
        configured
    }
}

pub(crate) fn spill_dir_max_bytes() -> u64 {
    vanilla_app_config()
        .ok()
        .map(|c| c.spill.dir_max_bytes)
        .unwrap_or(0)
}

pub(crate) fn shuffle_partition_count() -> usize {
    vanilla_app_config()
        .ok()
        .map(|c| c.shuffle.partition_count)
        .filter(|n| *n > 0)
        .unwrap_or_else(worker_threads)
}

pub(crate) fn shuffle_merge_threshold() -> usize {
    vanilla_app_config()
        .ok()
        .map(|c| c.shuffle.merge_threshold)
        .unwrap_or(64)
}

pub(crate) fn shuffle_merge_factor() -> f64 {
    vanilla_app_config()
        .ok()
        .map(|c| c.shuffle.merge_factor)
        .unwrap_or(0.5)
}

pub(crate) fn shuffle_sort_buffer_bytes() -> usize {
    vanilla_app_config()
        .ok()
        .map(|c| c.shuffle.sort_buffer_bytes)
        .unwrap_or(4 * 1024 * 1024)
}
