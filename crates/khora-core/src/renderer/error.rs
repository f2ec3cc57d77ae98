// Copyright 2025 eraflo
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

//! Defines the error types used by the buffer-management subsystem.

use std::fmt;

/// An error that can occur while creating, accessing or destroying a GPU buffer resource.
///
/// Every fallible operation of a [`BufferDevice`](crate::renderer::traits::BufferDevice)
/// and of the pool allocator built on top of it reports this type, synchronously, to the
/// call that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// A generic resource could not be found.
    NotFound,
    /// The handle or ID used to reference a resource is invalid or stale.
    InvalidHandle,
    /// An error originating from the specific graphics backend implementation.
    BackendError(String),
    /// An attempt was made to access a resource out of its bounds (e.g., in a buffer).
    OutOfBounds,
    /// The device could not satisfy an allocation of the given size.
    OutOfDeviceMemory {
        /// The number of bytes that were requested.
        requested_bytes: u64,
    },
    /// An immutable buffer was requested without the data it must be created with.
    MissingInitialData,
    /// The arguments of a request violate one of the allocator's rules.
    InvalidArgument(String),
    /// The device has been lost and API-level resources are unavailable until it is restored.
    DeviceLost,
    /// The driver reported a hard failure while polling or waiting on a fence.
    FenceWaitFailed(String),
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::NotFound => write!(f, "Resource not found with ID."),
            ResourceError::InvalidHandle => write!(f, "Invalid resource handle or ID."),
            ResourceError::BackendError(msg) => {
                write!(f, "Backend-specific resource error: {msg}")
            }
            ResourceError::OutOfBounds => {
                write!(f, "Resource access out of bounds.")
            }
            ResourceError::OutOfDeviceMemory { requested_bytes } => {
                write!(f, "Out of device memory while allocating {requested_bytes} bytes.")
            }
            ResourceError::MissingInitialData => {
                write!(f, "Immutable buffers must be created with initial data.")
            }
            ResourceError::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            ResourceError::DeviceLost => write!(f, "The graphics device was lost."),
            ResourceError::FenceWaitFailed(msg) => {
                write!(f, "Failure while waiting for a GPU fence: {msg}")
            }
        }
    }
}

impl std::error::Error for ResourceError {}
