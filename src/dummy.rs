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

//! Dummy backend which does minimal work, just enough to exercise the
//! validation layer and the transfer paths without a GPU. Buffers store
//! real bytes; textures and passes are bare identifiers. Poll results can
//! be scripted to simulate in-flight buffers.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::buffer::{self, Buffer};
use crate::device::{Backend, Caps, Device, Error, Limits};
use crate::format::{Format, FormatCaps, FormatType};
use crate::pass::{self, RenderPass, Run};
use crate::rect::Rect3D;
use crate::shade::{std140_layout, std430_layout, DescType, Var, VarLayout};
use crate::texture::{TexTransfer, Texture, TransferDest, TransferSource};

/// A buffer of real host bytes.
#[derive(Debug)]
pub struct DummyBuffer {
    id: u32,
    data: RefCell<Vec<u8>>,
}

impl DummyBuffer {
    /// Identifier, unique per backend, in creation order.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current contents.
    pub fn bytes(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }
}

/// The stub backend.
#[derive(Debug)]
pub struct DummyBackend {
    next_id: u32,
    poll_script: Rc<RefCell<VecDeque<bool>>>,
    invalidations: Rc<Cell<usize>>,
}

impl DummyBackend {
    /// New backend with an empty poll script.
    pub fn new() -> Self {
        DummyBackend {
            next_id: 0,
            poll_script: Rc::new(RefCell::new(VecDeque::new())),
            invalidations: Rc::new(Cell::new(0)),
        }
    }

    /// Scripted poll results, consumed front first; an exhausted script
    /// reports idle.
    pub fn poll_script(&self) -> Rc<RefCell<VecDeque<bool>>> {
        self.poll_script.clone()
    }

    /// Count of texture invalidations observed by the backend.
    pub fn invalidations(&self) -> Rc<Cell<usize>> {
        self.invalidations.clone()
    }

    fn fresh_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        DummyBackend::new()
    }
}

impl Backend for DummyBackend {
    type Texture = u32;
    type Buffer = DummyBuffer;
    type Pass = u32;

    fn tex_create(&mut self, _params: &crate::texture::Info) -> Result<u32, Error> {
        Ok(self.fresh_id())
    }

    fn tex_destroy(&mut self, _tex: Texture<Self>) {}

    fn tex_invalidate(&mut self, _tex: &Texture<Self>) {
        self.invalidations.set(self.invalidations.get() + 1);
    }

    fn tex_clear(&mut self, _tex: &Texture<Self>, _color: [f32; 4]) {}

    fn tex_blit(
        &mut self,
        _dst: &Texture<Self>,
        _src: &Texture<Self>,
        _dst_rc: Rect3D,
        _src_rc: Rect3D,
    ) {
    }

    fn tex_upload(
        &mut self,
        _xfer: &TexTransfer<Self>,
        _src: &TransferSource<Self>,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn tex_download(
        &mut self,
        xfer: &TexTransfer<Self>,
        dst: TransferDest<Self>,
    ) -> Result<(), Error> {
        // No image storage; downloads read back as zeroes
        let size = xfer.transfer_size();
        match dst {
            TransferDest::Buf { buf, offset } => {
                let mut data = buf.resource().data.borrow_mut();
                for b in &mut data[offset..offset + size] {
                    *b = 0;
                }
            }
            TransferDest::Host(out) => {
                for b in &mut out[..size] {
                    *b = 0;
                }
            }
        }
        Ok(())
    }

    fn buf_create(
        &mut self,
        params: &buffer::Info,
        initial_data: Option<&[u8]>,
    ) -> Result<(DummyBuffer, Option<NonNull<u8>>), Error> {
        if params.host_mapped {
            return Err(Error::Unsupported);
        }
        let data = match initial_data {
            Some(data) => data.to_vec(),
            None => vec![0; params.size],
        };
        let buf = DummyBuffer {
            id: self.fresh_id(),
            data: RefCell::new(data),
        };
        Ok((buf, None))
    }

    fn buf_destroy(&mut self, _buf: Buffer<Self>) {}

    fn buf_write(&mut self, buf: &Buffer<Self>, offset: usize, data: &[u8]) {
        buf.resource().data.borrow_mut()[offset..offset + data.len()].copy_from_slice(data);
    }

    fn buf_read(&mut self, buf: &Buffer<Self>, offset: usize, dest: &mut [u8]) -> Result<(), Error> {
        dest.copy_from_slice(&buf.resource().data.borrow()[offset..offset + dest.len()]);
        Ok(())
    }

    fn buf_poll(&mut self, _buf: &Buffer<Self>, _timeout_ns: u64) -> bool {
        self.poll_script.borrow_mut().pop_front().unwrap_or(false)
    }

    fn buf_uniform_layout(&self, offset: usize, var: &Var) -> VarLayout {
        std140_layout(offset, var)
    }

    fn buf_storage_layout(&self, offset: usize, var: &Var) -> VarLayout {
        std430_layout(offset, var)
    }

    fn push_constant_layout(&self, offset: usize, var: &Var) -> VarLayout {
        std430_layout(offset, var)
    }

    fn desc_namespace(&self, _ty: DescType) -> usize {
        0
    }

    fn pass_create(&mut self, _params: &pass::Info) -> Result<u32, Error> {
        Ok(self.fresh_id())
    }

    fn pass_destroy(&mut self, _pass: RenderPass<Self>) {}

    fn pass_run(&mut self, _run: &Run<Self>) {}
}

/// A ready-made dummy device with a representative format table.
pub fn device() -> Device<DummyBackend> {
    let tex = FormatCaps::TEXTURE
        | FormatCaps::SAMPLEABLE
        | FormatCaps::LINEAR
        | FormatCaps::STORABLE
        | FormatCaps::BLITTABLE;
    let color = tex | FormatCaps::RENDERABLE | FormatCaps::BLENDABLE;

    let formats = vec![
        Format::regular("r8", FormatType::Unorm, 1, 8, color),
        Format::regular("rg8", FormatType::Unorm, 2, 8, color),
        Format::regular("rgba8", FormatType::Unorm, 4, 8, color),
        Format::regular("r32f", FormatType::Float, 1, 32, color | FormatCaps::VERTEX),
        Format::regular("rg32f", FormatType::Float, 2, 32, color | FormatCaps::VERTEX),
        Format::regular("rgb32f", FormatType::Float, 3, 32, tex | FormatCaps::VERTEX),
        Format::regular("rgba32f", FormatType::Float, 4, 32, color | FormatCaps::VERTEX),
        Format::regular("r32u", FormatType::Uint, 1, 32, tex | FormatCaps::VERTEX),
        Format::regular("r32i", FormatType::Sint, 1, 32, tex | FormatCaps::VERTEX),
    ];

    let limits = Limits {
        max_tex_1d_dim: 1 << 14,
        max_tex_2d_dim: 1 << 14,
        max_tex_3d_dim: 1 << 11,
        max_xfer_size: 1 << 30,
        max_ubo_size: 1 << 16,
        max_ssbo_size: 1 << 27,
        max_pushc_size: 128,
        max_dispatch: [1 << 16; 3],
        buf_image_granularity: 1,
    };

    Device::new(
        DummyBackend::new(),
        Caps::COMPUTE | Caps::INPUT_VARIABLES,
        limits,
        formats,
    )
}
