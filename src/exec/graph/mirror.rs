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
//! Read-only structural view of a graph description.
//!
//! Responsibilities:
//! - Indexes ports by vertex and name, opposite ports, per-port edge kind and shuffle contract.
//! - Derives vertex-level upstream/downstream sets and one topological order.
//!
//! Current limitations:
//! - All edges touching one port must share one kind (and one shuffle contract); mixed ports are rejected.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::common::error::{EngineError, EngineResult};
use crate::common::ids::{PortId, VertexId};
use crate::exec::graph::{
    EdgeKind, GraphDescription, PortDesc, PortDirection, ShuffleContract, VertexAttribute,
    VertexDesc,
};

pub struct GraphMirror {
    graph: GraphDescription,
    port_names: HashMap<(VertexId, String), PortId>,
    port_peers: Vec<Vec<PortId>>,
    port_kind: Vec<Option<EdgeKind>>,
    port_shuffle: Vec<Option<Arc<dyn ShuffleContract>>>,
    upstream_vertices: Vec<Vec<VertexId>>,
    downstream_vertices: Vec<Vec<VertexId>>,
    topological_order: Vec<VertexId>,
}

impl GraphMirror {
    pub fn new(graph: GraphDescription) -> EngineResult<Self> {
        let topological_order = validate(&graph)?;
        let port_count = graph.ports.len();
        let vertex_count = graph.vertices.len();

        let mut port_names = HashMap::with_capacity(port_count);
        for port in &graph.ports {
            port_names.insert((port.vertex, port.name.clone()), port.id);
        }

        let mut port_peers = vec![Vec::new(); port_count];
        let mut port_kind = vec![None; port_count];
        let mut port_shuffle: Vec<Option<Arc<dyn ShuffleContract>>> = vec![None; port_count];
        let mut upstream_vertices = vec![Vec::new(); vertex_count];
        let mut downstream_vertices = vec![Vec::new(); vertex_count];
        for edge in &graph.edges {
            port_peers[edge.source.index()].push(edge.destination);
            port_peers[edge.destination.index()].push(edge.source);
            for port in [edge.source, edge.destination] {
                port_kind[port.index()] = Some(edge.kind);
                if edge.shuffle.is_some() {
                    port_shuffle[port.index()] = edge.shuffle.clone();
                }
            }
            let from = graph.ports[edge.source.index()].vertex;
            let to = graph.ports[edge.destination.index()].vertex;
            if !upstream_vertices[to.index()].contains(&from) {
                upstream_vertices[to.index()].push(from);
            }
            if !downstream_vertices[from.index()].contains(&to) {
                downstream_vertices[from.index()].push(to);
            }
        }

        Ok(Self {
            graph,
            port_names,
            port_peers,
            port_kind,
            port_shuffle,
            upstream_vertices,
            downstream_vertices,
            topological_order,
        })
    }

    pub fn vertex_count(&self) -> usize {
        self.graph.vertices.len()
    }

    pub fn vertices(&self) -> &[VertexDesc] {
        &self.graph.vertices
    }

    pub fn vertex(&self, id: VertexId) -> &VertexDesc {
        &self.graph.vertices[id.index()]
    }

    pub fn port(&self, id: PortId) -> EngineResult<&PortDesc> {
        self.graph
            .ports
            .get(id.index())
            .ok_or_else(|| EngineError::graph(format!("unknown port {id}")))
    }

    pub fn ports(&self) -> &[PortDesc] {
        &self.graph.ports
    }

    pub fn find_port(&self, vertex: VertexId, name: &str) -> Option<PortId> {
        self.port_names.get(&(vertex, name.to_string())).copied()
    }

    /// Resolve a port by name and check its direction.
    pub fn resolve_port(
        &self,
        vertex: VertexId,
        name: &str,
        direction: PortDirection,
    ) -> EngineResult<PortId> {
        let id = self.find_port(vertex, name).ok_or_else(|| {
            EngineError::graph(format!(
                "vertex {} has no port named '{}'",
                self.vertex_label(vertex),
                name
            ))
        })?;
        let port = &self.graph.ports[id.index()];
        if port.direction != direction {
            return Err(EngineError::graph(format!(
                "port '{}' of vertex {} is an {:?} port, not {:?}",
                name,
                self.vertex_label(vertex),
                port.direction,
                direction
            )));
        }
        Ok(id)
    }

    /// Ports on the other side of every edge touching `port`.
    pub fn peers(&self, port: PortId) -> &[PortId] {
        &self.port_peers[port.index()]
    }

    /// Edge kind of a port, `None` when it is not connected.
    pub fn kind(&self, port: PortId) -> Option<EdgeKind> {
        self.port_kind[port.index()]
    }

    pub fn shuffle(&self, port: PortId) -> Option<&Arc<dyn ShuffleContract>> {
        self.port_shuffle[port.index()].as_ref()
    }

    pub fn upstream_vertices(&self, vertex: VertexId) -> &[VertexId] {
        &self.upstream_vertices[vertex.index()]
    }

    pub fn downstream_vertices(&self, vertex: VertexId) -> &[VertexId] {
        &self.downstream_vertices[vertex.index()]
    }

    pub fn topological_order(&self) -> &[VertexId] {
        &self.topological_order
    }

    pub fn vertex_label(&self, vertex: VertexId) -> String {
        let desc = &self.graph.vertices[vertex.index()];
        desc.attributes
            .iter()
            .find_map(|a| match a {
                VertexAttribute::Label(label) => Some(label.clone()),
                _ => None,
            })
            .unwrap_or_else(|| desc.name.clone())
    }

    pub fn max_concurrency(&self, vertex: VertexId) -> Option<usize> {
        self.graph.vertices[vertex.index()]
            .attributes
            .iter()
            .find_map(|a| match a {
                VertexAttribute::MaxConcurrency(n) => Some((*n).max(1)),
                _ => None,
            })
    }

    pub fn port_label(&self, port: PortId) -> String {
        match self.graph.ports.get(port.index()) {
            Some(desc) => format!("{}.{}", self.vertex_label(desc.vertex), desc.name),
            None => port.to_string(),
        }
    }
}

/// Check per-port consistency and acyclicity; returns a topological order.
pub(crate) fn validate(graph: &GraphDescription) -> EngineResult<Vec<VertexId>> {
    let mut kinds: Vec<Option<EdgeKind>> = vec![None; graph.ports.len()];
    let mut contracts: Vec<Option<&Arc<dyn ShuffleContract>>> = vec![None; graph.ports.len()];
    for edge in &graph.edges {
        for port in [edge.source, edge.destination] {
            let desc = graph
                .ports
                .get(port.index())
                .ok_or_else(|| EngineError::graph(format!("edge {} uses unknown port {port}", edge.id)))?;
            match kinds[port.index()] {
                None => kinds[port.index()] = Some(edge.kind),
                Some(existing) if existing != edge.kind => {
                    return Err(EngineError::graph(format!(
                        "port '{}' mixes {} and {} edges",
                        desc.name, existing, edge.kind
                    )));
                }
                Some(_) => {}
            }
            if let Some(contract) = &edge.shuffle {
                match contracts[port.index()] {
                    None => contracts[port.index()] = Some(contract),
                    Some(existing) if !Arc::ptr_eq(existing, contract) => {
                        return Err(EngineError::graph(format!(
                            "port '{}' is fed by scatter-gather edges with different shuffle contracts",
                            desc.name
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
    }

    let vertex_count = graph.vertices.len();
    let mut indegree = vec![0usize; vertex_count];
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); vertex_count];
    for edge in &graph.edges {
        let from = graph.ports[edge.source.index()].vertex.index();
        let to = graph.ports[edge.destination.index()].vertex.index();
        if from == to {
            return Err(EngineError::graph(format!(
                "vertex {} is connected to itself",
                graph.vertices[from].name
            )));
        }
        if !downstream[from].contains(&to) {
            downstream[from].push(to);
            indegree[to] += 1;
        }
    }

    let mut queue = (0..vertex_count)
        .filter(|v| indegree[*v] == 0)
        .collect::<VecDeque<_>>();
    let mut order = Vec::with_capacity(vertex_count);
    while let Some(v) = queue.pop_front() {
        order.push(VertexId::from_index(v));
        for &next in &downstream[v] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    if order.len() != vertex_count {
        let stuck = (0..vertex_count)
            .filter(|v| indegree[*v] > 0)
            .map(|v| graph.vertices[v].name.as_str())
            .collect::<Vec<_>>();
        return Err(EngineError::graph(format!(
            "graph contains a cycle through vertices {:?}",
            stuck
        )));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::graph::tests::idle;
    use crate::exec::graph::{BytesShuffleContract, GraphBuilder};

    fn diamond() -> GraphDescription {
        let mut b = GraphBuilder::new();
        let src = b.add_vertex("src", idle());
        let left = b.add_vertex("left", idle());
        let right = b.add_vertex("right", idle());
        let sink = b.add_vertex("sink", idle());
        let src_out = b.add_output(src, "out").unwrap();
        let left_in = b.add_input(left, "in").unwrap();
        let right_in = b.add_input(right, "in").unwrap();
        let left_out = b.add_output(left, "out").unwrap();
        let right_out = b.add_output(right, "out").unwrap();
        let sink_in = b.add_input(sink, "in").unwrap();
        b.connect(src_out, left_in, EdgeKind::OneToOne).unwrap();
        b.connect(src_out, right_in, EdgeKind::OneToOne).unwrap();
        b.connect_shuffle(left_out, sink_in, Arc::new(BytesShuffleContract))
            .unwrap();
        b.connect(right_out, sink_in, EdgeKind::ScatterGather)
            .unwrap_err();
        b.add_attribute(sink, VertexAttribute::Label("final".to_string()))
            .unwrap();
        b.add_attribute(left, VertexAttribute::MaxConcurrency(2))
            .unwrap();
        b.build().unwrap()
    }

    #[test]
    fn indexes_ports_and_vertices() {
        let mirror = GraphMirror::new(diamond()).unwrap();
        assert_eq!(mirror.vertex_count(), 4);
        let src = VertexId::new(0);
        let sink = VertexId::new(3);
        let src_out = mirror.find_port(src, "out").unwrap();
        assert_eq!(mirror.peers(src_out).len(), 2);
        assert_eq!(mirror.kind(src_out), Some(EdgeKind::OneToOne));
        let sink_in = mirror.find_port(sink, "in").unwrap();
        assert_eq!(mirror.kind(sink_in), Some(EdgeKind::ScatterGather));
        assert!(mirror.shuffle(sink_in).is_some());
        assert_eq!(mirror.downstream_vertices(src).len(), 2);
        assert_eq!(mirror.upstream_vertices(sink), &[VertexId::new(1)]);
        assert_eq!(mirror.vertex_label(sink), "final");
        assert_eq!(mirror.max_concurrency(VertexId::new(1)), Some(2));
        assert_eq!(mirror.port_label(sink_in), "final.in");
        let right_out = mirror.find_port(VertexId::new(2), "out").unwrap();
        assert_eq!(mirror.kind(right_out), None);
    }

    #[test]
    fn topological_order_respects_edges() {
        let mirror = GraphMirror::new(diamond()).unwrap();
        let order = mirror.topological_order();
        let pos = |v: u32| order.iter().position(|x| *x == VertexId::new(v)).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(0) < pos(2));
        assert!(pos(1) < pos(3));
    }

    #[test]
    fn resolve_port_checks_direction() {
        let mirror = GraphMirror::new(diamond()).unwrap();
        let src = VertexId::new(0);
        assert!(mirror.resolve_port(src, "out", PortDirection::Output).is_ok());
        assert!(matches!(
            mirror.resolve_port(src, "out", PortDirection::Input),
            Err(EngineError::GraphConsistency(_))
        ));
        assert!(mirror.resolve_port(src, "missing", PortDirection::Output).is_err());
    }

    #[test]
    fn rejects_cycles() {
        let mut b = GraphBuilder::new();
        let a = b.add_vertex("a", idle());
        let c = b.add_vertex("c", idle());
        let a_out = b.add_output(a, "out").unwrap();
        let a_in = b.add_input(a, "in").unwrap();
        let c_out = b.add_output(c, "out").unwrap();
        let c_in = b.add_input(c, "in").unwrap();
        b.connect(a_out, c_in, EdgeKind::OneToOne).unwrap();
        b.connect(c_out, a_in, EdgeKind::Nothing).unwrap();
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn rejects_mixed_kinds_on_one_port() {
        let mut b = GraphBuilder::new();
        let a = b.add_vertex("a", idle());
        let c = b.add_vertex("c", idle());
        let d = b.add_vertex("d", idle());
        let a_out = b.add_output(a, "out").unwrap();
        let c_in = b.add_input(c, "in").unwrap();
        let d_in = b.add_input(d, "in").unwrap();
        b.connect(a_out, c_in, EdgeKind::OneToOne).unwrap();
        b.connect(a_out, d_in, EdgeKind::Broadcast).unwrap();
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("mixes"));
    }

    #[test]
    fn rejects_mixed_shuffle_contracts() {
        let mut b = GraphBuilder::new();
        let a = b.add_vertex("a", idle());
        let c = b.add_vertex("c", idle());
        let d = b.add_vertex("d", idle());
        let a_out = b.add_output(a, "out").unwrap();
        let c_out = b.add_output(c, "out").unwrap();
        let d_in = b.add_input(d, "in").unwrap();
        b.connect_shuffle(a_out, d_in, Arc::new(BytesShuffleContract))
            .unwrap();
        b.connect_shuffle(c_out, d_in, Arc::new(BytesShuffleContract))
            .unwrap();
        assert!(b.build().is_err());
    }
}
