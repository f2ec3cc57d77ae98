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

//! A buffer device that needs no GPU.
//!
//! Useful for tools, servers and tests that drive the pool allocator without a window
//! or an adapter. Contents live in host memory and the GPU timeline is simulated.

mod device;

pub use self::device::{HeadlessBufferDevice, HeadlessStats};
