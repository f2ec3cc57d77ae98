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

//! Vertex layout descriptors.

use super::enums::*;

/// Describes a single vertex attribute within a vertex buffer layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexAttributeDescriptor {
    /// The input location of this attribute in the vertex shader (e.g., `@location(0)`).
    pub shader_location: u32,
    /// The format of the attribute's data.
    pub format: VertexFormat,
    /// The byte offset of this attribute from the start of the vertex.
    pub offset: u64,
}

impl VertexAttributeDescriptor {
    /// Creates an attribute descriptor.
    pub const fn new(shader_location: u32, format: VertexFormat, offset: u64) -> Self {
        Self {
            shader_location,
            format,
            offset,
        }
    }
}

/// Computes the size of one vertex made of `attributes`.
///
/// The stride covers the furthest byte any attribute reaches, so interleaved layouts
/// with explicit offsets and tightly packed ones both work.
pub fn vertex_stride(attributes: &[VertexAttributeDescriptor]) -> u64 {
    attributes
        .iter()
        .map(|attr| attr.offset + attr.format.size() as u64)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_of_interleaved_layout() {
        let attributes = [
            VertexAttributeDescriptor::new(0, VertexFormat::Float32x3, 0),
            VertexAttributeDescriptor::new(1, VertexFormat::Float32x3, 12),
            VertexAttributeDescriptor::new(2, VertexFormat::Float32x2, 24),
        ];
        assert_eq!(vertex_stride(&attributes), 32);
    }

    #[test]
    fn stride_of_empty_layout_is_zero() {
        assert_eq!(vertex_stride(&[]), 0);
    }
}
