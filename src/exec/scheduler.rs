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
//! Vertex readiness.
//!
//! A vertex becomes ready once every vertex feeding it has completed.

use std::collections::VecDeque;

use crate::common::ids::VertexId;
use crate::exec::graph::GraphMirror;

/// Decides which vertex the graph executor starts next.
pub trait VertexScheduler: Send {
    /// Next vertex whose upstream vertices have all completed.
    fn next_ready(&mut self) -> Option<VertexId>;

    fn on_completed(&mut self, vertex: VertexId);

    /// Some vertex has not completed yet.
    fn has_pending(&self) -> bool;
}

/// FIFO readiness over upstream completion counts.
#[derive(Debug)]
pub struct BasicVertexScheduler {
    remaining_upstream: Vec<usize>,
    downstream: Vec<Vec<VertexId>>,
    completed: Vec<bool>,
    ready: VecDeque<VertexId>,
    not_completed: usize,
}

impl BasicVertexScheduler {
    pub fn new(mirror: &GraphMirror) -> Self {
        let count = mirror.vertex_count();
        let mut remaining_upstream = Vec::with_capacity(count);
        let mut downstream = Vec::with_capacity(count);
        let mut ready = VecDeque::new();
        for vertex in mirror.vertices() {
            let upstream = mirror.upstream_vertices(vertex.id).len();
            remaining_upstream.push(upstream);
            downstream.push(mirror.downstream_vertices(vertex.id).to_vec());
            if upstream == 0 {
                ready.push_back(vertex.id);
            }
        }
        Self {
            remaining_upstream,
            downstream,
            completed: vec![false; count],
            ready,
            not_completed: count,
        }
    }
}

impl VertexScheduler for BasicVertexScheduler {
    fn next_ready(&mut self) -> Option<VertexId> {
        self.ready.pop_front()
    }

    fn on_completed(&mut self, vertex: VertexId) {
        let idx = vertex.index();
        if idx >= self.completed.len() || self.completed[idx] {
            return;
        }
        self.completed[idx] = true;
        self.not_completed -= 1;
        for next in &self.downstream[idx] {
            let remaining = &mut self.remaining_upstream[next.index()];
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.ready.push_back(*next);
            }
        }
    }

    fn has_pending(&self) -> bool {
        self.not_completed > 0
    }
}
