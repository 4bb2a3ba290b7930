// Copyright 2026 the Basalt authors
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

//! # Basalt Core
//!
//! GPU buffer-pool subsystem: a sub-allocating manager for pooled hardware
//! buffers with multi-frame rotation, fence-based CPU/GPU synchronization,
//! deferred immutable-buffer batching, and staging-transfer tracking.
//!
//! The crate is backend-agnostic: all driver interaction goes through the
//! [`renderer::traits::GraphicsDevice`] trait, which a concrete backend (or a
//! software device, as in the sandbox demo) implements.

#![warn(missing_docs)]

pub mod renderer;
pub mod utils;

pub use renderer::vao::VaoManager;
