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

//! Shader input variables, their memory layouts, and descriptors.
//!
//! A variable is a scalar, vector or column-major matrix of a base type.
//! It has one canonical host layout (tightly packed columns) and up to
//! three GPU layouts: std140, std430 and the backend-defined push-constant
//! layout. The layout functions here implement the portable rules;
//! backends answer the device-level queries with them or with their own
//! variants.

use std::mem;

use crate::device::{Backend, Device};

/// Base type of a shader variable.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum VarType {
    /// 32-bit float.
    Float,
    /// 32-bit signed integer.
    Sint,
    /// 32-bit unsigned integer.
    Uint,
}

impl VarType {
    /// Host size of one element.
    pub fn size(self) -> usize {
        match self {
            VarType::Float => mem::size_of::<f32>(),
            VarType::Sint => mem::size_of::<i32>(),
            VarType::Uint => mem::size_of::<u32>(),
        }
    }
}

/// A named shader input variable.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Var {
    /// Name as it appears in the shader.
    pub name: String,
    /// Base type.
    pub ty: VarType,
    /// Vector width, 1 to 4.
    pub dim_v: u8,
    /// Matrix columns, 1 to 4. 1 means not a matrix.
    pub dim_m: u8,
}

macro_rules! float_var {
    ($($fn_name:ident => ($m:expr, $v:expr),)*) => {
        $(
            /// Float variable constructor named after its GLSL type.
            pub fn $fn_name(name: &str) -> Var {
                Var {
                    name: name.to_string(),
                    ty: VarType::Float,
                    dim_m: $m,
                    dim_v: $v,
                }
            }
        )*
    }
}

impl Var {
    float_var! {
        float => (1, 1),
        vec2 => (1, 2),
        vec3 => (1, 3),
        vec4 => (1, 4),
        mat2 => (2, 2),
        mat3 => (3, 3),
        mat4 => (4, 4),
    }

    /// The GLSL type this variable declares as, if it is expressible.
    pub fn glsl_type_name(&self) -> Option<&'static str> {
        let name = match (self.ty, self.dim_m, self.dim_v) {
            (VarType::Float, 1, 1) => "float",
            (VarType::Float, 1, 2) => "vec2",
            (VarType::Float, 1, 3) => "vec3",
            (VarType::Float, 1, 4) => "vec4",
            (VarType::Float, 2, 2) => "mat2",
            (VarType::Float, 2, 3) => "mat2x3",
            (VarType::Float, 2, 4) => "mat2x4",
            (VarType::Float, 3, 2) => "mat3x2",
            (VarType::Float, 3, 3) => "mat3",
            (VarType::Float, 3, 4) => "mat3x4",
            (VarType::Float, 4, 2) => "mat4x2",
            (VarType::Float, 4, 3) => "mat4x3",
            (VarType::Float, 4, 4) => "mat4",
            (VarType::Sint, 1, 1) => "int",
            (VarType::Sint, 1, 2) => "ivec2",
            (VarType::Sint, 1, 3) => "ivec3",
            (VarType::Sint, 1, 4) => "ivec4",
            (VarType::Uint, 1, 1) => "uint",
            (VarType::Uint, 1, 2) => "uvec2",
            (VarType::Uint, 1, 3) => "uvec3",
            (VarType::Uint, 1, 4) => "uvec4",
            _ => return None,
        };
        Some(name)
    }
}

/// Memory placement of a variable inside some buffer layout.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct VarLayout {
    /// Byte offset of the variable.
    pub offset: usize,
    /// Byte stride between matrix columns.
    pub stride: usize,
    /// Total size in bytes.
    pub size: usize,
}

fn align_to(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Canonical host layout: column-major, tightly packed.
pub fn host_layout(offset: usize, var: &Var) -> VarLayout {
    let col_size = var.ty.size() * var.dim_v as usize;
    VarLayout {
        offset,
        stride: col_size,
        size: col_size * var.dim_m as usize,
    }
}

/// std140 layout rules:
///
/// 1. The size of generic values is their size in bytes.
/// 2. The size of vectors is the vector length times the base size, except
///    that *vec3 is always the size of *vec4.
/// 3. Matrices are treated like arrays of column vectors.
/// 4. The size of array rows is the element size rounded up to a multiple
///    of the size of a vec4.
/// 5. All values are aligned to a multiple of their size (stride for
///    arrays).
pub fn std140_layout(offset: usize, var: &Var) -> VarLayout {
    let el_size = var.ty.size();
    let mut size = el_size * var.dim_v as usize;
    if var.dim_v == 3 {
        size += el_size;
    }
    if var.dim_m > 1 {
        size = align_to(size, mem::size_of::<[f32; 4]>());
    }

    VarLayout {
        offset: align_to(offset, size),
        stride: size,
        size: size * var.dim_m as usize,
    }
}

/// std430 layout rules: like std140, except arrays and matrices are
/// always tightly packed, even when their columns are vec3s.
pub fn std430_layout(offset: usize, var: &Var) -> VarLayout {
    let el_size = var.ty.size();
    let mut size = el_size * var.dim_v as usize;
    if var.dim_v == 3 && var.dim_m == 1 {
        size += el_size;
    }

    VarLayout {
        offset: align_to(offset, size),
        stride: size,
        size: size * var.dim_m as usize,
    }
}

/// Kind of object a descriptor binds.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DescType {
    /// A sampleable texture.
    SampledTex,
    /// A storable texture accessed as an image.
    StorageImg,
    /// A uniform buffer.
    UniformBuf,
    /// A storage buffer.
    StorageBuf,
}

/// Access the shader declares on a descriptor binding.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Access {
    /// Read and write.
    ReadWrite,
    /// Read only.
    ReadOnly,
    /// Write only.
    WriteOnly,
}

impl Access {
    /// The GLSL memory qualifier for this access mode.
    pub fn glsl_name(self) -> &'static str {
        match self {
            Access::ReadWrite => "",
            Access::ReadOnly => "readonly",
            Access::WriteOnly => "writeonly",
        }
    }
}

/// A named descriptor declared by a render pass.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Desc {
    /// Name as it appears in the shader.
    pub name: String,
    /// What kind of object gets bound.
    pub ty: DescType,
    /// Declared access.
    pub access: Access,
}

impl<B: Backend> Device<B> {
    /// Uniform-buffer layout of `var` at `offset`, or a zeroed layout when
    /// the device does not support uniform buffers.
    pub fn uniform_layout(&self, offset: usize, var: &Var) -> VarLayout {
        if self.limits.max_ubo_size > 0 {
            self.backend.buf_uniform_layout(offset, var)
        } else {
            VarLayout::default()
        }
    }

    /// Storage-buffer layout of `var` at `offset`, or a zeroed layout when
    /// the device does not support storage buffers.
    pub fn storage_layout(&self, offset: usize, var: &Var) -> VarLayout {
        if self.limits.max_ssbo_size > 0 {
            self.backend.buf_storage_layout(offset, var)
        } else {
            VarLayout::default()
        }
    }

    /// Push-constant layout of `var` at `offset`, or a zeroed layout when
    /// the device does not support push constants.
    pub fn push_constant_layout(&self, offset: usize, var: &Var) -> VarLayout {
        if self.limits.max_pushc_size > 0 {
            self.backend.push_constant_layout(offset, var)
        } else {
            VarLayout::default()
        }
    }

    /// Binding namespace of a descriptor type. Types mapping to the same
    /// namespace share binding slots.
    pub fn desc_namespace(&self, ty: DescType) -> usize {
        self.backend.desc_namespace(ty)
    }
}
