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
//! Engine error kinds.
//!
//! Nothing in the engine retries. Every error is fatal for the task that
//! observes it; the graph executor reports the first one it receives.

use std::io;

use thiserror::Error;

/// Result type alias using `EngineError`.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Malformed or incompatible record bytes.
    #[error("SerializationError: {context}: {message}")]
    Serialization { context: String, message: String },

    /// Spill or restore I/O failure.
    #[error("StorageError: {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A spill file that does not hold what the store wrote.
    #[error("StorageFormatError: {0}")]
    StorageFormat(String),

    /// Contract violation between the graph description and its users.
    #[error("GraphConsistencyError: {0}")]
    GraphConsistency(String),

    /// A buffer request the pool can never satisfy: larger than the budget, or
    /// stalled while every running job waits for memory.
    #[error("BudgetExceeded: requested {requested} bytes, pool budget is {budget} bytes")]
    BudgetExceeded { requested: usize, budget: usize },

    /// Cooperative cancellation; unwinds like an error but is not a root cause.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Reading from an input whose upstream edge has been failed.
    #[error("EdgeFailed: port {port}: {message}")]
    EdgeFailed { port: String, message: String },

    /// First fatal error of a vertex, labelled with the vertex that raised it.
    #[error("vertex {vertex} failed: {source}")]
    VertexFailed {
        vertex: String,
        #[source]
        source: Box<EngineError>,
    },

    /// Panics and poisoned internal state.
    #[error("InternalError: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn serialization<C: Into<String>, M: Into<String>>(context: C, message: M) -> Self {
        Self::Serialization {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn storage<C: Into<String>>(context: C, source: io::Error) -> Self {
        Self::Storage {
            context: context.into(),
            source,
        }
    }

    pub fn graph<S: Into<String>>(msg: S) -> Self {
        Self::GraphConsistency(msg.into())
    }

    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    pub fn in_vertex(self, vertex: impl Into<String>) -> Self {
        match self {
            already @ EngineError::VertexFailed { .. } => already,
            other => EngineError::VertexFailed {
                vertex: vertex.into(),
                source: Box::new(other),
            },
        }
    }

    /// True when the error (or the error it wraps) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            EngineError::Cancelled(_) => true,
            EngineError::VertexFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Strip vertex labels and return the underlying error.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::VertexFailed { source, .. } => source.root(),
            other => other,
        }
    }
}
