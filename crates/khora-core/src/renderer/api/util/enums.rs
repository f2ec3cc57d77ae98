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

//! Generic rendering enums.

/// Specifies the data type of indices in an index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    /// Indices are 16-bit unsigned integers.
    Uint16,
    /// Indices are 32-bit unsigned integers.
    Uint32,
}

impl IndexFormat {
    /// Returns the size in bytes of a single index.
    pub const fn size(&self) -> u64 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` does not need to be a power of two; a zero alignment leaves the value untouched.
pub const fn align_to_next(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Least common multiple of two alignments.
pub const fn lcm(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 {
        return if a > b { a } else { b };
    }
    let (mut x, mut y) = (a, b);
    while y != 0 {
        let t = x % y;
        x = y;
        y = t;
    }
    a / x * b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_handles_non_power_of_two() {
        assert_eq!(align_to_next(0, 12), 0);
        assert_eq!(align_to_next(1, 12), 12);
        assert_eq!(align_to_next(24, 12), 24);
        assert_eq!(align_to_next(25, 16), 32);
        assert_eq!(align_to_next(7, 0), 7);
    }

    #[test]
    fn lcm_of_alignments() {
        assert_eq!(lcm(256, 12), 768);
        assert_eq!(lcm(256, 16), 256);
        assert_eq!(lcm(4, 0), 4);
    }

    #[test]
    fn index_sizes() {
        assert_eq!(IndexFormat::Uint16.size(), 2);
        assert_eq!(IndexFormat::Uint32.size(), 4);
    }
}
