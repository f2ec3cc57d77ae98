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

//! Provides the public, backend-agnostic contracts for GPU buffer management.
//!
//! This module defines the "common language" spoken between the pool allocator in
//! `khora-data` and the concrete graphics backends in `khora-infra`: buffer value
//! types, the [`BufferDevice`] capability trait and the [`ResourceError`] type.
//!
//! The allocator only ever talks to a `dyn BufferDevice`, so a backend can be
//! swapped (wgpu, headless) without touching any allocation logic.

pub mod api;
pub mod error;
pub mod traits;

// Re-export the most important traits and types for easier use.
pub use self::api::*;
pub use self::error::ResourceError;
pub use self::traits::BufferDevice;
