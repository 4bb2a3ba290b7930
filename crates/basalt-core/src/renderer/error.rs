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

//! Defines the hierarchy of error types for the buffer subsystem.

use std::fmt;

/// An error reported by the graphics device layer.
#[derive(Debug)]
pub enum ResourceError {
    /// An error originating from the specific graphics backend implementation,
    /// carrying the driver's native error description.
    BackendError(String),
    /// The handle or ID used to reference a resource is invalid.
    InvalidHandle,
    /// The referenced resource does not exist (e.g., already destroyed).
    NotFound,
    /// An attempt was made to access a resource out of its bounds.
    OutOfBounds,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::BackendError(msg) => {
                write!(f, "Backend-specific resource error: {msg}")
            }
            ResourceError::InvalidHandle => write!(f, "Invalid resource handle or ID."),
            ResourceError::NotFound => write!(f, "Resource not found."),
            ResourceError::OutOfBounds => write!(f, "Resource access out of bounds."),
        }
    }
}

impl std::error::Error for ResourceError {}

/// An error reported by the buffer allocator.
///
/// All variants are fatal for the operation that raised them; nothing in the
/// subsystem retries on its own.
#[derive(Debug)]
pub enum VaoError {
    /// The device could not provide the memory backing a pool or dedicated
    /// buffer. Carries the requested size for diagnostics; the caller must
    /// reduce its working set.
    OutOfDeviceMemory {
        /// Size of the failed allocation in bytes.
        requested_bytes: u64,
        /// Which allocation path failed.
        context: &'static str,
        /// The underlying device error.
        source: ResourceError,
    },
    /// A staging buffer had no free region large enough for a download.
    /// The caller must use (or create) a different staging buffer.
    StagingCapacityExceeded {
        /// Size of the requested region in bytes.
        requested_bytes: u64,
        /// Total capacity of the staging buffer in bytes.
        capacity_bytes: u64,
    },
    /// A creation request violated a platform limit or was self-contradictory.
    InvalidParams(String),
    /// The buffer's usage class or interface does not support mapping.
    NotMappable,
    /// A device-layer error on a path with no extra diagnostics to attach.
    Resource(ResourceError),
}

impl fmt::Display for VaoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaoError::OutOfDeviceMemory {
                requested_bytes,
                context,
                source,
            } => {
                write!(
                    f,
                    "Out of device memory during {context}: requested {requested_bytes} bytes: {source}"
                )
            }
            VaoError::StagingCapacityExceeded {
                requested_bytes,
                capacity_bytes,
            } => {
                write!(
                    f,
                    "Staging buffer capacity exceeded: requested {requested_bytes} bytes, \
                     capacity {capacity_bytes} bytes"
                )
            }
            VaoError::InvalidParams(msg) => write!(f, "Invalid parameters: {msg}"),
            VaoError::NotMappable => {
                write!(f, "The buffer's usage class does not support mapping.")
            }
            VaoError::Resource(err) => write!(f, "Buffer resource operation failed: {err}"),
        }
    }
}

impl std::error::Error for VaoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VaoError::OutOfDeviceMemory { source, .. } => Some(source),
            VaoError::Resource(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ResourceError> for VaoError {
    fn from(err: ResourceError) -> Self {
        VaoError::Resource(err)
    }
}
