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

//! The device abstraction: a validated facade over a concrete backend.
//!
//! [`Device`] is the only public entry point for resource operations. Every
//! call checks its documented preconditions (violations are programming
//! errors and abort through `assert!`) and then forwards to exactly one
//! [`Backend`] method, so a backend never observes invalid input.
//! Device-level failures, such as refused allocations, come back as
//! [`Error`] values.
//!
//! All calls assume external serialization by the caller; no lock is held
//! across a backend call.

use std::error::Error as StdError;
use std::fmt;
use std::ptr::NonNull;

use crate::buffer::{self, Buffer};
use crate::format::Format;
use crate::pass::{self, RenderPass, Run};
use crate::rect::Rect3D;
use crate::shade::{DescType, Var, VarLayout};
use crate::texture::{TexTransfer, Texture, TransferDest, TransferSource};

bitflags!(
    /// Optional device capabilities.
    pub struct Caps: u32 {
        /// Compute passes are available.
        const COMPUTE         = 1 << 0;
        /// Render passes may declare variables updated per run.
        const INPUT_VARIABLES = 1 << 1;
    }
);

/// Hard limits of a device, supplied once by the backend at creation.
#[allow(missing_docs)]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Limits {
    pub max_tex_1d_dim: u32,
    pub max_tex_2d_dim: u32,
    pub max_tex_3d_dim: u32,
    /// Maximum size of a transfer buffer, 0 if unsupported.
    pub max_xfer_size: usize,
    /// Maximum size of a uniform buffer, 0 if unsupported.
    pub max_ubo_size: usize,
    /// Maximum size of a storage buffer, 0 if unsupported.
    pub max_ssbo_size: usize,
    /// Maximum push-constant block size, 0 if unsupported.
    pub max_pushc_size: usize,
    /// Maximum compute dispatch size, per axis.
    pub max_dispatch: [u32; 3],
    /// Optimal alignment between buffer and image memory, consumed by the
    /// memory sub-allocator.
    pub buf_image_granularity: u64,
}

/// A device-level failure. Precondition violations are not errors; they
/// abort. Everything here is reported back so the caller can retry with
/// different parameters or give up.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    /// The requested feature is not advertised by the device.
    Unsupported,
    /// The device refused to allocate.
    OutOfMemory,
    /// The external handle type is not supported for this use.
    HandleUnsupported,
    /// All buffers are in flight and the pool could not grow.
    Busy,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let desc = match *self {
            Error::Unsupported => "requested capability is not supported by the device",
            Error::OutOfMemory => "out of device memory",
            Error::HandleUnsupported => "external handle type is not supported",
            Error::Busy => "all buffers are in flight",
        };
        write!(f, "{}", desc)
    }
}

impl StdError for Error {}

/// The interface a concrete driver implements. Called only by [`Device`],
/// which validates every argument first.
///
/// The original dispatch surface is a record of function pointers; here it
/// is a trait with one associated type per raw resource. Backend teardown
/// is `Drop` on the implementing type.
pub trait Backend: Sized {
    /// Raw texture resource.
    type Texture: fmt::Debug;
    /// Raw buffer resource.
    type Buffer: fmt::Debug;
    /// Raw compiled render pass.
    type Pass: fmt::Debug;

    /// Create a texture. `params` already passed validation.
    fn tex_create(&mut self, params: &crate::texture::Info) -> Result<Self::Texture, Error>;
    /// Destroy a texture.
    fn tex_destroy(&mut self, tex: Texture<Self>);
    /// Hint that the texture's contents may be discarded.
    fn tex_invalidate(&mut self, tex: &Texture<Self>);
    /// Fill the texture with a solid color.
    fn tex_clear(&mut self, tex: &Texture<Self>, color: [f32; 4]);
    /// Copy `src_rc` of `src` into `dst_rc` of `dst`, scaling and flipping
    /// as needed.
    fn tex_blit(
        &mut self,
        dst: &Texture<Self>,
        src: &Texture<Self>,
        dst_rc: Rect3D,
        src_rc: Rect3D,
    );
    /// Upload data into a texture region.
    fn tex_upload(
        &mut self,
        xfer: &TexTransfer<Self>,
        src: &TransferSource<Self>,
    ) -> Result<(), Error>;
    /// Download a texture region.
    fn tex_download(
        &mut self,
        xfer: &TexTransfer<Self>,
        dst: TransferDest<Self>,
    ) -> Result<(), Error>;

    /// Create a buffer, returning the raw resource and, for host-mapped
    /// buffers, the mapping.
    fn buf_create(
        &mut self,
        params: &buffer::Info,
        initial_data: Option<&[u8]>,
    ) -> Result<(Self::Buffer, Option<NonNull<u8>>), Error>;
    /// Destroy a buffer.
    fn buf_destroy(&mut self, buf: Buffer<Self>);
    /// Write into a buffer.
    fn buf_write(&mut self, buf: &Buffer<Self>, offset: usize, data: &[u8]);
    /// Read out of a buffer.
    fn buf_read(&mut self, buf: &Buffer<Self>, offset: usize, dest: &mut [u8])
        -> Result<(), Error>;
    /// Probe whether the buffer is still in use by the device, blocking up
    /// to `timeout_ns`. Backends without queue introspection report idle.
    fn buf_poll(&mut self, _buf: &Buffer<Self>, _timeout_ns: u64) -> bool {
        false
    }

    /// Uniform-buffer layout of a variable at the given offset.
    fn buf_uniform_layout(&self, offset: usize, var: &Var) -> VarLayout;
    /// Storage-buffer layout of a variable at the given offset.
    fn buf_storage_layout(&self, offset: usize, var: &Var) -> VarLayout;
    /// Push-constant layout of a variable at the given offset.
    fn push_constant_layout(&self, offset: usize, var: &Var) -> VarLayout;
    /// Binding namespace for a descriptor type. Descriptor types sharing a
    /// namespace compete for binding slots.
    fn desc_namespace(&self, ty: DescType) -> usize;

    /// Compile a render pass. `params` already passed validation.
    fn pass_create(&mut self, params: &pass::Info) -> Result<Self::Pass, Error>;
    /// Destroy a render pass.
    fn pass_destroy(&mut self, pass: RenderPass<Self>);
    /// Execute a render pass. `run` already passed validation.
    fn pass_run(&mut self, run: &Run<Self>);

    /// Flush any queued work to the device.
    fn flush(&mut self) {}
}

/// A single logical GPU device: the backend plus its advertised
/// capabilities, limits and format table.
#[derive(Debug)]
pub struct Device<B: Backend> {
    pub(crate) backend: B,
    pub(crate) caps: Caps,
    pub(crate) limits: Limits,
    pub(crate) formats: Vec<Format>,
}

impl<B: Backend> Device<B> {
    /// Wrap a backend. The capability block and format table describe what
    /// the backend can do and are fixed for the device's lifetime.
    pub fn new(backend: B, caps: Caps, limits: Limits, formats: Vec<Format>) -> Self {
        Device {
            backend,
            caps,
            limits,
            formats,
        }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Advertised capability flags.
    pub fn caps(&self) -> Caps {
        self.caps
    }

    /// Device limits.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// The device's format table, in the backend's preference order.
    pub fn formats(&self) -> &[Format] {
        &self.formats
    }

    /// Flush queued work to the device.
    pub fn flush(&mut self) {
        self.backend.flush();
    }
}
