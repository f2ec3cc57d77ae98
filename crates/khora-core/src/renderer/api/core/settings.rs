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

//! Configuration of the GPU buffer pool allocator.

use super::DEFAULT_DYNAMIC_BUFFER_MULTIPLIER;
use crate::renderer::api::resource::{InternalBufferType, PoolCategory};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const MIB: u64 = 1024 * 1024;

/// Prefix of the name/value overrides understood by [`BufferManagerSettings::apply_overrides`].
pub const POOL_SIZE_OVERRIDE_PREFIX: &str = "GpuBufferManager::";

/// Default pool sizes of one internal buffer type, per pool category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySizes {
    /// Size of immutable pools. Also the largest batch of immutable buffers merged together.
    pub immutable: u64,
    /// Size of default pools.
    pub default: u64,
    /// Size of shared default pools.
    pub default_shared: u64,
    /// Size of dynamic pools.
    pub dynamic: u64,
}

impl CategorySizes {
    fn get(&self, category: PoolCategory) -> u64 {
        match category {
            PoolCategory::Immutable => self.immutable,
            PoolCategory::Default => self.default,
            PoolCategory::DefaultShared => self.default_shared,
            PoolCategory::Dynamic => self.dynamic,
        }
    }

    fn get_mut(&mut self, category: PoolCategory) -> &mut u64 {
        match category {
            PoolCategory::Immutable => &mut self.immutable,
            PoolCategory::Default => &mut self.default,
            PoolCategory::DefaultShared => &mut self.default_shared,
            PoolCategory::Dynamic => &mut self.dynamic,
        }
    }
}

/// Default pool sizes for every (internal type, category) bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizeTable {
    /// Vertex pools.
    pub vertex: CategorySizes,
    /// Index pools.
    pub index: CategorySizes,
    /// Shader (const, tex, uav, indirect) pools.
    pub shader: CategorySizes,
}

impl PoolSizeTable {
    /// Returns the default size of pools in the given bucket.
    pub fn get(&self, internal: InternalBufferType, category: PoolCategory) -> u64 {
        self.row(internal).get(category)
    }

    /// Overrides the default size of pools in the given bucket.
    pub fn set(&mut self, internal: InternalBufferType, category: PoolCategory, size: u64) {
        *self.row_mut(internal).get_mut(category) = size;
    }

    fn row(&self, internal: InternalBufferType) -> &CategorySizes {
        match internal {
            InternalBufferType::Vertex => &self.vertex,
            InternalBufferType::Index => &self.index,
            InternalBufferType::Shader => &self.shader,
        }
    }

    fn row_mut(&mut self, internal: InternalBufferType) -> &mut CategorySizes {
        match internal {
            InternalBufferType::Vertex => &mut self.vertex,
            InternalBufferType::Index => &mut self.index,
            InternalBufferType::Shader => &mut self.shader,
        }
    }
}

impl Default for PoolSizeTable {
    fn default() -> Self {
        Self {
            vertex: CategorySizes {
                immutable: 64 * MIB,
                default: 32 * MIB,
                default_shared: 32 * MIB,
                dynamic: 16 * MIB,
            },
            index: CategorySizes {
                immutable: 64 * MIB,
                default: 16 * MIB,
                default_shared: 16 * MIB,
                dynamic: 16 * MIB,
            },
            shader: CategorySizes {
                immutable: 64 * MIB,
                default: 16 * MIB,
                default_shared: 16 * MIB,
                dynamic: 16 * MIB,
            },
        }
    }
}

/// Settings of the GPU buffer pool allocator.
///
/// Loaded from JSON (every field is optional and falls back to its default), then
/// optionally patched with name/value pairs coming from the render system's options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferManagerSettings {
    /// Number of buffered copies kept for dynamic buffers (N). Clamped to at least 1.
    pub dynamic_buffer_multiplier: u8,
    /// Default pool size per bucket.
    pub pool_sizes: PoolSizeTable,
    /// How long an unreferenced staging buffer survives before being destroyed.
    pub staging_buffer_lifetime_ms: u64,
    /// Smallest staging buffer that will be created.
    pub min_staging_buffer_size: u64,
    /// Number of entries in the draw-id vertex buffer. 0 disables it.
    pub draw_id_instance_count: u32,
}

impl Default for BufferManagerSettings {
    fn default() -> Self {
        Self {
            dynamic_buffer_multiplier: DEFAULT_DYNAMIC_BUFFER_MULTIPLIER,
            pool_sizes: PoolSizeTable::default(),
            staging_buffer_lifetime_ms: 300_000,
            min_staging_buffer_size: 4 * MIB,
            // Two eyes worth of 4096 instances.
            draw_id_instance_count: 4096 * 2,
        }
    }
}

impl BufferManagerSettings {
    /// Parses settings from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reads and parses a JSON settings file.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read buffer settings '{}'", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("failed to parse buffer settings '{}'", path.display()))
    }

    /// Applies pool size overrides such as `GpuBufferManager::VERTEX_IMMUTABLE = 1048576`.
    ///
    /// Unknown keys are ignored. Values that are not valid byte counts are logged and skipped.
    pub fn apply_overrides(&mut self, params: &HashMap<String, String>) {
        for internal in InternalBufferType::ALL {
            for category in PoolCategory::ALL {
                let key = format!(
                    "{POOL_SIZE_OVERRIDE_PREFIX}{}_{}",
                    internal.name(),
                    category.name()
                );
                let Some(value) = params.get(&key) else {
                    continue;
                };
                match value.trim().parse::<u64>() {
                    Ok(size) if size > 0 => self.pool_sizes.set(internal, category, size),
                    _ => log::warn!("Ignoring invalid pool size '{value}' for {key}"),
                }
            }
        }
    }

    /// The ring multiplier actually used, never zero.
    pub fn effective_multiplier(&self) -> u8 {
        self.dynamic_buffer_multiplier.max(1)
    }
}
