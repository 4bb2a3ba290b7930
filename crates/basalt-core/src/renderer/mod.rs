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

//! The rendering-facing half of the crate: API types, the device trait, and
//! the buffer-pool subsystem.

pub mod api;
pub mod error;
pub mod traits;
pub mod vao;

pub use api::{
    BufferDescriptor, BufferId, BufferType, BufferUsage, FenceId, IndexFormat, MapMode,
    MemoryClass, PrimitiveTopology, TexelFormat, VertexElement, VertexFormat, VertexSemantic,
};
pub use error::{ResourceError, VaoError};
pub use traits::{DeviceFeature, GraphicsDevice};
pub use vao::VaoManager;
