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

//! Texel format descriptors and format lookup.
//!
//! Formats are plain runtime values enumerated once by the backend at device
//! creation. The component tables allow swizzled and padded layouts; the
//! `regular` predicate identifies formats that map 1:1 onto a packed host
//! array of the advertised bit depth.

use std::mem;

use crate::device::{Backend, Device};

/// Maximum number of components a format can carry.
pub const MAX_COMPONENTS: usize = 4;

bitflags!(
    /// Capabilities advertised by a format.
    pub struct FormatCaps: u16 {
        /// Can be used to create textures at all.
        const TEXTURE    = 1 << 0;
        /// Can be sampled from in a shader.
        const SAMPLEABLE = 1 << 1;
        /// Supports linear filtering while sampling.
        const LINEAR     = 1 << 2;
        /// Can back storage images.
        const STORABLE   = 1 << 3;
        /// Can be rendered into.
        const RENDERABLE = 1 << 4;
        /// Supports fixed-function blending when rendered into.
        const BLENDABLE  = 1 << 5;
        /// Can be a blit source or destination.
        const BLITTABLE  = 1 << 6;
        /// Can describe vertex attribute data.
        const VERTEX     = 1 << 7;
    }
);

/// The semantic interpretation of a format's components.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FormatType {
    /// Floating point.
    Float,
    /// Unsigned, normalized to `[0, 1]`.
    Unorm,
    /// Signed, normalized to `[-1, 1]`.
    Snorm,
    /// Unsigned integer.
    Uint,
    /// Signed integer.
    Sint,
}

/// A texel format. Immutable for the lifetime of the device that
/// enumerated it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Format {
    /// Human readable name, unique within a device's format table.
    pub name: String,
    /// Semantic type of all components.
    pub ty: FormatType,
    /// Number of components, 1 to 4.
    pub num_components: u8,
    /// Meaningful bits per component.
    pub component_depth: [u8; MAX_COMPONENTS],
    /// Padding bits following each component.
    pub component_pad: [u8; MAX_COMPONENTS],
    /// Logical index of each physical component, enabling swizzled layouts.
    pub component_index: [u8; MAX_COMPONENTS],
    /// Size of one texel in bytes.
    pub texel_size: usize,
    /// What the device can do with this format.
    pub caps: FormatCaps,
}

impl Format {
    /// Build an unswizzled, unpadded format whose texel size follows from
    /// the component count and depth.
    pub fn regular(
        name: &str,
        ty: FormatType,
        num_components: u8,
        bits: u8,
        caps: FormatCaps,
    ) -> Format {
        let mut depth = [0; MAX_COMPONENTS];
        for i in 0..num_components as usize {
            depth[i] = bits;
        }
        Format {
            name: name.to_string(),
            ty,
            num_components,
            component_depth: depth,
            component_pad: [0; MAX_COMPONENTS],
            component_index: [0, 1, 2, 3],
            texel_size: num_components as usize * bits as usize / 8,
            caps,
        }
    }

    /// Whether the components appear in their logical order.
    pub fn is_ordered(&self) -> bool {
        (0..self.num_components as usize).all(|i| self.component_index[i] == i as u8)
    }

    /// Whether the format is ordered, unpadded, and fills its texel size
    /// exactly. Regular formats can be copied to and from packed host
    /// arrays without any bit shuffling.
    pub fn is_regular(&self) -> bool {
        let mut bits = 0;
        for i in 0..self.num_components as usize {
            if self.component_index[i] != i as u8 || self.component_pad[i] != 0 {
                return false;
            }
            bits += self.component_depth[i] as usize;
        }
        bits == self.texel_size * 8
    }
}

impl<B: Backend> Device<B> {
    /// Find the first format matching the given type, component count,
    /// per-component depth and capability set. The format table is in the
    /// backend's preference order, so the first match is the best one.
    pub fn find_fmt(
        &self,
        ty: FormatType,
        num_components: u8,
        bits_per_component: u8,
        regular: bool,
        caps: FormatCaps,
    ) -> Option<&Format> {
        'fmts: for fmt in &self.formats {
            if fmt.ty != ty || fmt.num_components != num_components {
                continue;
            }
            if !fmt.caps.contains(caps) {
                continue;
            }
            if regular && !fmt.is_regular() {
                continue;
            }
            for i in 0..fmt.num_components as usize {
                if fmt.component_depth[i] != bits_per_component {
                    continue 'fmts;
                }
            }
            return Some(fmt);
        }

        debug!("no matching format found");
        None
    }

    /// Find a regular format suitable for vertex attributes of the given
    /// type and component count, sized to the matching host type.
    pub fn find_vertex_fmt(&self, ty: FormatType, comps: u8) -> Option<&Format> {
        let size = match ty {
            FormatType::Float => mem::size_of::<f32>(),
            FormatType::Unorm | FormatType::Uint => mem::size_of::<u32>(),
            FormatType::Snorm | FormatType::Sint => mem::size_of::<i32>(),
        };
        self.find_fmt(ty, comps, 8 * size as u8, true, FormatCaps::VERTEX)
    }

    /// Find a format by its exact name.
    pub fn find_named_fmt(&self, name: &str) -> Option<&Format> {
        self.formats.iter().find(|fmt| fmt.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba8() -> Format {
        Format::regular("rgba8", FormatType::Unorm, 4, 8, FormatCaps::all())
    }

    #[test]
    fn regular_constructor_is_regular() {
        let fmt = rgba8();
        assert!(fmt.is_ordered());
        assert!(fmt.is_regular());
        assert_eq!(fmt.texel_size, 4);
    }

    #[test]
    fn swizzled_format_is_not_ordered() {
        let mut fmt = rgba8();
        fmt.component_index = [2, 1, 0, 3]; // bgra
        assert!(!fmt.is_ordered());
        assert!(!fmt.is_regular());
    }

    #[test]
    fn padded_format_is_not_regular() {
        // rgb8 with 8 bits of padding in a 4-byte texel
        let mut fmt = Format::regular("rgbx8", FormatType::Unorm, 3, 8, FormatCaps::all());
        fmt.component_pad[2] = 8;
        fmt.texel_size = 4;
        assert!(fmt.is_ordered());
        assert!(!fmt.is_regular());
    }
}
