// Copyright 2019 The Glare Developers.
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

//! Rectangle primitives used by blits, transfers and render-pass runs.

use std::cmp::{max, min};

/// A 2D rectangle between two corners. Flipped rectangles (where an end
/// coordinate is smaller than its start) are meaningful for mirrored blits.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Rect2D {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Rect2D {
    /// Width of the normalized rectangle.
    pub fn w(&self) -> u32 {
        self.x1 - self.x0
    }

    /// Height of the normalized rectangle.
    pub fn h(&self) -> u32 {
        self.y1 - self.y0
    }

    /// Return a copy with the corners swapped such that `x0 <= x1` and
    /// `y0 <= y1`.
    pub fn normalize(self) -> Self {
        Rect2D {
            x0: min(self.x0, self.x1),
            y0: min(self.y0, self.y1),
            x1: max(self.x0, self.x1),
            y1: max(self.y0, self.y1),
        }
    }
}

/// A 3D rectangle between two corners, used for texture regions. Unused
/// axes carry the `[0, 1)` range.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Rect3D {
    pub x0: u32,
    pub y0: u32,
    pub z0: u32,
    pub x1: u32,
    pub y1: u32,
    pub z1: u32,
}

impl Rect3D {
    /// Width of the normalized rectangle.
    pub fn w(&self) -> u32 {
        self.x1 - self.x0
    }

    /// Height of the normalized rectangle.
    pub fn h(&self) -> u32 {
        self.y1 - self.y0
    }

    /// Depth of the normalized rectangle.
    pub fn d(&self) -> u32 {
        self.z1 - self.z0
    }

    /// Return a copy with the corners swapped so that all start coordinates
    /// are smaller than their end coordinates.
    pub fn normalize(self) -> Self {
        Rect3D {
            x0: min(self.x0, self.x1),
            y0: min(self.y0, self.y1),
            z0: min(self.z0, self.z1),
            x1: max(self.x0, self.x1),
            y1: max(self.y0, self.y1),
            z1: max(self.z0, self.z1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_swaps_flipped_corners() {
        let rc = Rect3D { x0: 8, y0: 0, z0: 1, x1: 2, y1: 4, z1: 0 };
        let n = rc.normalize();
        assert_eq!(n, Rect3D { x0: 2, y0: 0, z0: 0, x1: 8, y1: 4, z1: 1 });
        assert_eq!(n.w(), 6);
        assert_eq!(n.h(), 4);
        assert_eq!(n.d(), 1);
    }

    #[test]
    fn normalize_is_identity_on_ordered_rects() {
        let rc = Rect2D { x0: 1, y0: 2, x1: 3, y1: 4 };
        assert_eq!(rc.normalize(), rc);
    }
}
