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
pub mod common;
pub mod exec;
pub mod runtime;

// Short aliases used across the crate, mirroring the module layout.
pub use common::app_config as vanilla_config;
pub use common::logging as vanilla_logging;

pub use common::error::{EngineError, EngineResult};
pub use common::ids::{EdgeId, PortId, VertexId};
pub use exec::edge::{
    EdgeDriver, GroupReader, InputHandle, InputState, KeyValueWriter, OutputHandle, RecordReader,
    RecordWriter, ShuffleConfig, SignalWriter,
};
pub use exec::graph::{
    BytesShuffleContract, EdgeKind, GraphBuilder, GraphDescription, GraphMirror, ShuffleContract,
    VertexAttribute,
};
pub use exec::graph_executor::{Engine, EngineConfig, ExecutionSummary, GraphExecutor};
pub use exec::scheduler::{BasicVertexScheduler, VertexScheduler};
pub use exec::spill::{BufferStore, SpillStorageConfig};
pub use exec::vertex::{
    TaskContext, TaskInfo, TaskProcessor, TaskSchedule, VertexContext, VertexProcessor,
    VertexProcessorFactory,
};
pub use runtime::buffer_pool::{Buffer, BufferPool, BufferPoolConfig, BufferPoolStats};
