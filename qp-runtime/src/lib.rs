// Copyright 2018-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # The Query Processing Runtime
//!
//! `qp-runtime` provides the execution model on which the query processing
//! primitives in `qp-ops` are built. Kernels are written against a SIMT-style
//! model: a launch consists of a grid of work-groups, and each work-group
//! consists of a block of lanes that advance in lock-step phases separated by
//! barriers. Work-groups may only communicate through global memory, and only
//! across kernel launches.
//!
//! The runtime hides the execution back-end behind the `ExecutionSurface`
//! trait. The `CpuSurface` back-end maps work-groups onto a Rayon thread pool
//! and emulates the lanes of a work-group sequentially, phase by phase.

pub mod error;
pub mod runtime;
pub mod utils;
