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
//! Static graph description consumed by the engine.
//!
//! Responsibilities:
//! - Defines vertices, named ports, edges and the closed set of edge kinds.
//! - Defines the shuffle contract (key hash and key order) used by scatter-gather edges.
//! - Builds descriptions through `GraphBuilder`, which rejects inconsistent graphs up front.
//!
//! Key exported interfaces:
//! - Types: `EdgeKind`, `ShuffleContract`, `BytesShuffleContract`, `VertexAttribute`,
//!   `GraphDescription`, `GraphBuilder`, `GraphMirror`.

pub mod mirror;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use twox_hash::XxHash64;

use crate::common::error::{EngineError, EngineResult};
use crate::common::ids::{EdgeId, PortId, VertexId};
use crate::exec::vertex::VertexProcessorFactory;

pub use mirror::GraphMirror;

/// Communication pattern of an edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// No payload; the edge only orders its two vertices.
    Nothing,
    /// Unordered record stream, every record delivered once.
    OneToOne,
    /// Every reader sees everything written.
    Broadcast,
    /// Records partitioned by key, grouped and sorted per partition.
    ScatterGather,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EdgeKind::Nothing => "nothing",
            EdgeKind::OneToOne => "one-to-one",
            EdgeKind::Broadcast => "broadcast",
            EdgeKind::ScatterGather => "scatter-gather",
        };
        f.write_str(name)
    }
}

/// Key contract of a scatter-gather edge, over serialized key bytes.
///
/// Keys that compare `Equal` must hash to the same value, otherwise one
/// group could be split across partitions.
pub trait ShuffleContract: Send + Sync + fmt::Debug {
    fn hash_key(&self, key: &[u8]) -> u64;

    fn compare_keys(&self, left: &[u8], right: &[u8]) -> Ordering;

    fn partition(&self, key: &[u8], partition_count: usize) -> usize {
        (self.hash_key(key) % partition_count.max(1) as u64) as usize
    }
}

/// Byte-wise key order with xxHash64 partitioning.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesShuffleContract;

impl ShuffleContract for BytesShuffleContract {
    fn hash_key(&self, key: &[u8]) -> u64 {
        XxHash64::oneshot(0, key)
    }

    fn compare_keys(&self, left: &[u8], right: &[u8]) -> Ordering {
        left.cmp(right)
    }
}

/// Typed per-vertex metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VertexAttribute {
    /// Human-readable label used in logs and errors instead of the vertex name.
    Label(String),
    /// Upper bound on concurrently running tasks of this vertex.
    MaxConcurrency(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Clone, Debug)]
pub struct PortDesc {
    pub id: PortId,
    pub vertex: VertexId,
    pub name: String,
    pub direction: PortDirection,
}

#[derive(Clone)]
pub struct VertexDesc {
    pub id: VertexId,
    pub name: String,
    pub factory: Arc<dyn VertexProcessorFactory>,
    pub inputs: Vec<PortId>,
    pub outputs: Vec<PortId>,
    pub attributes: Vec<VertexAttribute>,
}

impl fmt::Debug for VertexDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VertexDesc")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("attributes", &self.attributes)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct EdgeDesc {
    pub id: EdgeId,
    pub source: PortId,
    pub destination: PortId,
    pub kind: EdgeKind,
    pub shuffle: Option<Arc<dyn ShuffleContract>>,
}

/// Immutable graph handed to the engine.
#[derive(Clone, Debug, Default)]
pub struct GraphDescription {
    pub(crate) vertices: Vec<VertexDesc>,
    pub(crate) ports: Vec<PortDesc>,
    pub(crate) edges: Vec<EdgeDesc>,
}

impl GraphDescription {
    pub fn vertices(&self) -> &[VertexDesc] {
        &self.vertices
    }

    pub fn ports(&self) -> &[PortDesc] {
        &self.ports
    }

    pub fn edges(&self) -> &[EdgeDesc] {
        &self.edges
    }
}

/// Incremental construction of a `GraphDescription`.
#[derive(Default)]
pub struct GraphBuilder {
    graph: GraphDescription,
    edge_pairs: HashSet<(PortId, PortId)>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn VertexProcessorFactory>,
    ) -> VertexId {
        let id = VertexId::from_index(self.graph.vertices.len());
        self.graph.vertices.push(VertexDesc {
            id,
            name: name.into(),
            factory,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: Vec::new(),
        });
        id
    }

    pub fn add_attribute(&mut self, vertex: VertexId, attribute: VertexAttribute) -> EngineResult<()> {
        let desc = self
            .graph
            .vertices
            .get_mut(vertex.index())
            .ok_or_else(|| EngineError::graph(format!("unknown vertex {vertex}")))?;
        desc.attributes.push(attribute);
        Ok(())
    }

    pub fn add_input(&mut self, vertex: VertexId, name: impl Into<String>) -> EngineResult<PortId> {
        self.add_port(vertex, name.into(), PortDirection::Input)
    }

    pub fn add_output(&mut self, vertex: VertexId, name: impl Into<String>) -> EngineResult<PortId> {
        self.add_port(vertex, name.into(), PortDirection::Output)
    }

    /// Connect an output port to an input port with a payload-free or record edge.
    pub fn connect(&mut self, source: PortId, destination: PortId, kind: EdgeKind) -> EngineResult<EdgeId> {
        if kind == EdgeKind::ScatterGather {
            return Err(EngineError::graph(format!(
                "edge {source} -> {destination}: scatter-gather edges need a shuffle contract"
            )));
        }
        self.push_edge(source, destination, kind, None)
    }

    /// Connect with a scatter-gather edge partitioned and ordered by `contract`.
    pub fn connect_shuffle(
        &mut self,
        source: PortId,
        destination: PortId,
        contract: Arc<dyn ShuffleContract>,
    ) -> EngineResult<EdgeId> {
        self.push_edge(source, destination, EdgeKind::ScatterGather, Some(contract))
    }

    pub fn build(self) -> EngineResult<GraphDescription> {
        mirror::validate(&self.graph)?;
        Ok(self.graph)
    }

    fn add_port(&mut self, vertex: VertexId, name: String, direction: PortDirection) -> EngineResult<PortId> {
        let id = PortId::from_index(self.graph.ports.len());
        let desc = self
            .graph
            .vertices
            .get_mut(vertex.index())
            .ok_or_else(|| EngineError::graph(format!("unknown vertex {vertex}")))?;
        let duplicate = desc
            .inputs
            .iter()
            .chain(desc.outputs.iter())
            .any(|p| self.graph.ports[p.index()].name == name);
        if duplicate {
            return Err(EngineError::graph(format!(
                "vertex {} already has a port named '{}'",
                desc.name, name
            )));
        }
        match direction {
            PortDirection::Input => desc.inputs.push(id),
            PortDirection::Output => desc.outputs.push(id),
        }
        self.graph.ports.push(PortDesc {
            id,
            vertex,
            name,
            direction,
        });
        Ok(id)
    }

    fn push_edge(
        &mut self,
        source: PortId,
        destination: PortId,
        kind: EdgeKind,
        shuffle: Option<Arc<dyn ShuffleContract>>,
    ) -> EngineResult<EdgeId> {
        let src = self
            .graph
            .ports
            .get(source.index())
            .ok_or_else(|| EngineError::graph(format!("unknown port {source}")))?;
        let dst = self
            .graph
            .ports
            .get(destination.index())
            .ok_or_else(|| EngineError::graph(format!("unknown port {destination}")))?;
        if src.direction != PortDirection::Output || dst.direction != PortDirection::Input {
            return Err(EngineError::graph(format!(
                "edge must run from an output port to an input port: {} ({:?}) -> {} ({:?})",
                src.name, src.direction, dst.name, dst.direction
            )));
        }
        if !self.edge_pairs.insert((source, destination)) {
            return Err(EngineError::graph(format!(
                "duplicate edge {source} -> {destination}"
            )));
        }
        let id = EdgeId::from_index(self.graph.edges.len());
        self.graph.edges.push(EdgeDesc {
            id,
            source,
            destination,
            kind,
            shuffle,
        });
        Ok(id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::exec::vertex::{TaskSchedule, VertexContext, VertexProcessor};

    #[derive(Debug)]
    pub(crate) struct IdleFactory;

    struct IdleProcessor;

    impl VertexProcessor for IdleProcessor {
        fn initialize(&mut self, _ctx: &mut VertexContext<'_>) -> EngineResult<Option<TaskSchedule>> {
            Ok(None)
        }

        fn create_task_processor(&self) -> EngineResult<Box<dyn crate::exec::vertex::TaskProcessor>> {
            Err(EngineError::internal("idle vertex has no tasks"))
        }
    }

    impl VertexProcessorFactory for IdleFactory {
        fn create(&self) -> EngineResult<Box<dyn VertexProcessor>> {
            Ok(Box::new(IdleProcessor))
        }
    }

    pub(crate) fn idle() -> Arc<dyn VertexProcessorFactory> {
        Arc::new(IdleFactory)
    }

    #[test]
    fn rejects_duplicate_port_names() {
        let mut b = GraphBuilder::new();
        let v = b.add_vertex("v", idle());
        b.add_input(v, "in").unwrap();
        assert!(b.add_output(v, "in").is_err());
    }

    #[test]
    fn rejects_backwards_and_duplicate_edges() {
        let mut b = GraphBuilder::new();
        let a = b.add_vertex("a", idle());
        let c = b.add_vertex("c", idle());
        let out = b.add_output(a, "out").unwrap();
        let inp = b.add_input(c, "in").unwrap();
        assert!(b.connect(inp, out, EdgeKind::OneToOne).is_err());
        b.connect(out, inp, EdgeKind::OneToOne).unwrap();
        assert!(b.connect(out, inp, EdgeKind::OneToOne).is_err());
    }

    #[test]
    fn scatter_gather_requires_contract() {
        let mut b = GraphBuilder::new();
        let a = b.add_vertex("a", idle());
        let c = b.add_vertex("c", idle());
        let out = b.add_output(a, "out").unwrap();
        let inp = b.add_input(c, "in").unwrap();
        assert!(b.connect(out, inp, EdgeKind::ScatterGather).is_err());
        b.connect_shuffle(out, inp, Arc::new(BytesShuffleContract))
            .unwrap();
        let graph = b.build().unwrap();
        assert_eq!(graph.edges().len(), 1);
        assert!(graph.edges()[0].shuffle.is_some());
    }

    #[test]
    fn bytes_contract_partitions_equal_keys_together() {
        let contract = BytesShuffleContract;
        let p = contract.partition(b"key", 7);
        assert!(p < 7);
        assert_eq!(contract.partition(b"key", 7), p);
        assert_eq!(contract.compare_keys(b"a", b"b"), Ordering::Less);
        assert_eq!(contract.partition(b"anything", 1), 0);
    }
}
