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

//! Render passes: immutable compiled programs and their execution.
//!
//! A pass is created from already-generated shader text plus a description
//! of its inputs; compiling the text is the backend's business. The pass
//! keeps a deep copy of its creation parameters, so callers are free to
//! reuse or drop theirs.

use draw_state::state::Blend;

use crate::buffer::{Buffer, Role};
use crate::device::{Backend, Caps, Device, Error};
use crate::format::{Format, FormatCaps};
use crate::rect::Rect2D;
use crate::shade::{host_layout, Desc, DescType, Var};
use crate::texture::{TexUsage, Texture};

/// A single vertex attribute consumed by a raster pass.
#[derive(Clone, Debug, PartialEq)]
pub struct VertexAttrib {
    /// Name as it appears in the vertex shader.
    pub name: String,
    /// Data format. Must carry [`FormatCaps::VERTEX`].
    pub format: Format,
    /// Byte offset into the vertex.
    pub offset: usize,
}

/// Parameters specific to rasterization passes.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterInfo {
    /// Vertex shader text.
    pub vertex_shader: String,
    /// Vertex attribute layout.
    pub vertex_attribs: Vec<VertexAttrib>,
    /// Byte stride between consecutive vertices.
    pub vertex_stride: usize,
    /// Format of the render target. Must be renderable, and blendable when
    /// blending is enabled.
    pub target_format: Format,
    /// Fixed-function blending, if any.
    pub blend: Option<Blend>,
    /// Load the previous target contents instead of discarding them.
    pub load_target: bool,
}

/// What kind of work a pass performs.
#[derive(Clone, Debug, PartialEq)]
pub enum Kind {
    /// Rasterization over a 2D target.
    Raster(RasterInfo),
    /// Compute dispatch. Requires [`Caps::COMPUTE`].
    Compute,
}

/// Render-pass creation parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Info {
    /// Raster- or compute-specific parameters.
    pub kind: Kind,
    /// Fragment or compute shader text.
    pub shader: String,
    /// Variables updatable per run. Requires [`Caps::INPUT_VARIABLES`].
    pub variables: Vec<Var>,
    /// Descriptors bound per run.
    pub descriptors: Vec<Desc>,
    /// Size of the push-constant block, 4-byte aligned.
    pub push_constants_size: usize,
}

/// A compiled render pass, exclusively owned by its creator. Destroy
/// through [`Device::pass_destroy`].
#[derive(Debug)]
pub struct RenderPass<B: Backend> {
    res: B::Pass,
    info: Info,
}

impl<B: Backend> RenderPass<B> {
    /// The parameters this pass was created with.
    pub fn info(&self) -> &Info {
        &self.info
    }

    /// The backend resource.
    pub fn resource(&self) -> &B::Pass {
        &self.res
    }
}

/// An object bound to one descriptor slot for the duration of a run.
#[derive(Debug)]
pub enum Binding<'a, B: Backend> {
    /// Texture bound for sampling. Must be sampleable.
    SampledTex(&'a Texture<B>),
    /// Texture bound as a storage image. Must be storable.
    StorageImg(&'a Texture<B>),
    /// Uniform buffer.
    UniformBuf(&'a Buffer<B>),
    /// Storage buffer.
    StorageBuf(&'a Buffer<B>),
}

/// New value for one of the pass's declared variables.
#[derive(Clone, Copy, Debug)]
pub struct VarUpdate<'a> {
    /// Index into the pass's variable list.
    pub index: usize,
    /// Raw value in the variable's host layout.
    pub data: &'a [u8],
}

/// Parameters for a single execution of a pass.
#[derive(Debug)]
pub struct Run<'a, B: Backend> {
    /// The pass to run.
    pub pass: &'a RenderPass<B>,
    /// One binding per declared descriptor, in declaration order.
    pub bindings: &'a [Binding<'a, B>],
    /// Variable updates applied before the run.
    pub var_updates: &'a [VarUpdate<'a>],
    /// Push-constant block. Present exactly when the pass declares one.
    pub push_constants: Option<&'a [u8]>,
    /// Render target; raster runs only.
    pub target: Option<&'a Texture<B>>,
    /// Normalized viewport rectangle; raster runs only.
    pub viewport: Rect2D,
    /// Normalized scissor rectangle; raster runs only.
    pub scissors: Rect2D,
    /// Raw vertex data; raster runs only.
    pub vertex_data: &'a [u8],
    /// Number of vertices to draw; raster runs only.
    pub vertex_count: usize,
    /// Work-group count per axis; compute runs only.
    pub compute_groups: [u32; 3],
}

impl<B: Backend> Device<B> {
    /// Compile a render pass.
    pub fn pass_create(&mut self, params: &Info) -> Result<RenderPass<B>, Error> {
        assert!(!params.shader.is_empty(), "pass without shader text");
        match &params.kind {
            Kind::Raster(raster) => {
                assert!(!raster.vertex_shader.is_empty(), "raster pass without vertex shader");
                for va in &raster.vertex_attribs {
                    assert!(!va.name.is_empty(), "vertex attribute without a name");
                    assert!(
                        va.format.caps.contains(FormatCaps::VERTEX),
                        "vertex attribute format unusable for vertex data"
                    );
                    assert!(
                        va.offset + va.format.texel_size <= raster.vertex_stride,
                        "vertex attribute exceeds the vertex stride"
                    );
                }

                assert!(
                    raster.target_format.caps.contains(FormatCaps::RENDERABLE),
                    "target format is not renderable"
                );
                assert!(
                    raster.blend.is_none()
                        || raster.target_format.caps.contains(FormatCaps::BLENDABLE),
                    "blending enabled on a non-blendable target format"
                );
            }
            Kind::Compute => {
                assert!(self.caps.contains(Caps::COMPUTE), "device does not support compute");
            }
        }

        for var in &params.variables {
            assert!(
                self.caps.contains(Caps::INPUT_VARIABLES),
                "device does not support live variable updates"
            );
            assert!(!var.name.is_empty(), "variable without a name");
            assert!(var.glsl_type_name().is_some(), "variable has no GLSL representation");
        }

        for desc in &params.descriptors {
            assert!(!desc.name.is_empty(), "descriptor without a name");
        }

        assert!(
            params.push_constants_size <= self.limits.max_pushc_size,
            "push constants exceed the device limit"
        );
        assert_eq!(
            params.push_constants_size % 4,
            0,
            "push-constant block must be 4-byte aligned"
        );

        let res = self.backend.pass_create(params)?;
        Ok(RenderPass {
            res,
            info: params.clone(),
        })
    }

    /// Destroy the pass held by `slot`, if any, and leave the slot empty.
    pub fn pass_destroy(&mut self, slot: &mut Option<RenderPass<B>>) {
        if let Some(pass) = slot.take() {
            self.backend.pass_destroy(pass);
        }
    }

    /// Execute a pass once. Unless the pass loads its target, the target's
    /// previous contents are discarded before the run.
    pub fn pass_run(&mut self, run: &Run<B>) {
        let info = &run.pass.info;

        assert_eq!(
            run.bindings.len(),
            info.descriptors.len(),
            "one binding required per declared descriptor"
        );
        for (desc, binding) in info.descriptors.iter().zip(run.bindings) {
            match (desc.ty, binding) {
                (DescType::SampledTex, Binding::SampledTex(tex)) => {
                    assert!(
                        tex.info().usage.contains(TexUsage::SAMPLEABLE),
                        "bound texture is not sampleable"
                    );
                }
                (DescType::StorageImg, Binding::StorageImg(tex)) => {
                    assert!(
                        tex.info().usage.contains(TexUsage::STORABLE),
                        "bound texture is not storable"
                    );
                }
                (DescType::UniformBuf, Binding::UniformBuf(buf)) => {
                    assert_eq!(buf.info().role, Role::Uniform, "bound buffer is not uniform");
                }
                (DescType::StorageBuf, Binding::StorageBuf(buf)) => {
                    assert_eq!(buf.info().role, Role::Storage, "bound buffer is not storage");
                }
                (ty, _) => panic!("descriptor {:?} bound with a mismatched object kind", ty),
            }
        }

        for vu in run.var_updates {
            assert!(
                self.caps.contains(Caps::INPUT_VARIABLES),
                "device does not support live variable updates"
            );
            assert!(vu.index < info.variables.len(), "variable update index out of range");
            let var = &info.variables[vu.index];
            assert!(
                vu.data.len() >= host_layout(0, var).size,
                "variable update data smaller than the variable"
            );
        }

        assert!(
            run.push_constants.is_some() || info.push_constants_size == 0,
            "pass declares push constants but the run provides none"
        );

        match &info.kind {
            Kind::Raster(raster) => {
                let tex = run.target.expect("raster run without a target");
                assert_eq!(tex.info().dimension(), 2, "render target must be 2D");
                assert_eq!(
                    tex.info().format, raster.target_format,
                    "target format differs from the pass target format"
                );
                assert!(
                    tex.info().usage.contains(TexUsage::RENDERABLE),
                    "target is not renderable"
                );
                assert_eq!(run.viewport, run.viewport.normalize(), "viewport is not normalized");
                assert_eq!(run.scissors, run.scissors.normalize(), "scissors are not normalized");
            }
            Kind::Compute => {
                for i in 0..3 {
                    assert!(
                        run.compute_groups[i] <= self.limits.max_dispatch[i],
                        "dispatch exceeds the device limit"
                    );
                }
            }
        }

        if let Some(target) = run.target {
            let load = match &info.kind {
                Kind::Raster(raster) => raster.load_target,
                Kind::Compute => false,
            };
            if !load {
                self.tex_invalidate(target);
            }
        }

        self.backend.pass_run(run);
    }
}
