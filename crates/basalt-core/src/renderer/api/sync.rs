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

//! CPU/GPU synchronization handles.

/// An opaque handle to a GPU fence.
///
/// A fence is a marker inserted into the device's command stream; once the
/// GPU has executed everything submitted before it, the fence reports
/// completion through [`GraphicsDevice::fence_status`]. Fences are the sole
/// cross-domain synchronization primitive of this subsystem.
///
/// [`GraphicsDevice::fence_status`]: crate::renderer::traits::GraphicsDevice::fence_status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(pub usize);
