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

//! Texture creation, blits and host transfers.
//!
//! A texture owns device memory and is described entirely by its creation
//! parameters. Its dimensionality is inferred from which of `w`, `h`, `d`
//! are nonzero; coordinates along unused axes are normalized to the
//! `[0, 1)` range before they reach a backend.

use std::cmp::max;

use crate::buffer::Buffer;
use crate::device::{Backend, Device, Error};
use crate::format::{Format, FormatCaps};
use crate::rect::Rect3D;

bitflags!(
    /// Requested texture usage. Every flag requires the matching
    /// capability on the texture's format.
    pub struct TexUsage: u8 {
        /// Can be sampled from in a shader.
        const SAMPLEABLE    = 1 << 0;
        /// Can be rendered into. Only 2D textures can be renderable.
        const RENDERABLE    = 1 << 1;
        /// Can back a storage image.
        const STORABLE      = 1 << 2;
        /// Accepts host uploads.
        const HOST_WRITABLE = 1 << 3;
        /// Supports host downloads.
        const HOST_READABLE = 1 << 4;
        /// Can be a blit source.
        const BLIT_SRC      = 1 << 5;
        /// Can be a blit destination.
        const BLIT_DST      = 1 << 6;
    }
);

/// How the texture is filtered when sampled.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SampleMode {
    /// Nearest-neighbour lookup.
    Nearest,
    /// Linear interpolation. Requires [`FormatCaps::LINEAR`].
    Linear,
}

/// How out-of-range texture coordinates are handled.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AddressMode {
    /// Clamp to the edge texel.
    Clamp,
    /// Tile the texture.
    Repeat,
    /// Tile with mirroring.
    Mirror,
}

/// Texture creation parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Info {
    /// Width in texels. Always nonzero.
    pub w: u32,
    /// Height in texels, or 0 for 1D textures.
    pub h: u32,
    /// Depth in texels, or 0 for 1D and 2D textures.
    pub d: u32,
    /// Texel format. Must carry [`FormatCaps::TEXTURE`].
    pub format: Format,
    /// Requested usage.
    pub usage: TexUsage,
    /// Filtering used when the texture is sampled.
    pub sample_mode: SampleMode,
    /// Coordinate wrapping used when the texture is sampled.
    pub address_mode: AddressMode,
}

impl Info {
    /// Dimensionality implied by the nonzero extents.
    pub fn dimension(&self) -> u32 {
        if self.d > 0 {
            3
        } else if self.h > 0 {
            2
        } else {
            1
        }
    }

    /// Force coordinates along unused axes into the `[0, 1)` range.
    pub(crate) fn strip_coords(&self, rc: &mut Rect3D) {
        if self.d == 0 {
            rc.z0 = 0;
            rc.z1 = 1;
        }
        if self.h == 0 {
            rc.y0 = 0;
            rc.y1 = 1;
        }
    }
}

/// A texture, exclusively owned by its creator. Destroy through
/// [`Device::tex_destroy`].
#[derive(Debug)]
pub struct Texture<B: Backend> {
    res: B::Texture,
    info: Info,
}

impl<B: Backend> Texture<B> {
    pub(crate) fn new(res: B::Texture, info: Info) -> Self {
        Texture { res, info }
    }

    /// The parameters this texture was created with.
    pub fn info(&self) -> &Info {
        &self.info
    }

    /// The backend resource.
    pub fn resource(&self) -> &B::Texture {
        &self.res
    }
}

/// A texture region addressed by a host transfer. Zeroed rectangle axes
/// default to the whole texture; zero strides default to the texture
/// dimensions.
#[derive(Debug)]
pub struct TexTransfer<'a, B: Backend> {
    /// The texture to transfer into or out of.
    pub tex: &'a Texture<B>,
    /// The addressed region.
    pub rc: Rect3D,
    /// Row pitch of the host data, in texels.
    pub stride_w: u32,
    /// Image pitch of the host data, in rows.
    pub stride_h: u32,
}

impl<'a, B: Backend> Clone for TexTransfer<'a, B> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'a, B: Backend> Copy for TexTransfer<'a, B> {}

impl<'a, B: Backend> TexTransfer<'a, B> {
    /// New transfer covering the whole texture with tight strides.
    pub fn whole(tex: &'a Texture<B>) -> Self {
        TexTransfer {
            tex,
            rc: Rect3D::default(),
            stride_w: 0,
            stride_h: 0,
        }
    }

    /// Infer defaults and validate; the result is what backends see.
    pub(crate) fn fix(&self) -> Self {
        let tex = self.tex.info();
        let mut rc = self.rc;

        if rc.x0 == 0 && rc.x1 == 0 {
            rc.x1 = tex.w;
        }
        if rc.y0 == 0 && rc.y1 == 0 {
            rc.y1 = tex.h;
        }
        if rc.z0 == 0 && rc.z1 == 0 {
            rc.z1 = tex.d;
        }

        let stride_w = if self.stride_w == 0 { tex.w } else { self.stride_w };
        let mut stride_h = if self.stride_h == 0 { tex.h } else { self.stride_h };

        let dim = tex.dimension();
        if dim >= 3 {
            assert!(rc.z1 > rc.z0, "transfer depth range is empty or flipped");
            assert!(rc.z0 < tex.d && rc.z1 <= tex.d, "transfer depth range out of bounds");
            assert!(stride_h >= rc.h(), "image pitch smaller than the transfer height");
        }
        if dim >= 2 {
            assert!(rc.y1 > rc.y0, "transfer height range is empty or flipped");
            assert!(rc.y0 < tex.h && rc.y1 <= tex.h, "transfer height range out of bounds");
            assert!(stride_w >= rc.w(), "row pitch smaller than the transfer width");
        }
        assert!(rc.x1 > rc.x0, "transfer width range is empty or flipped");
        assert!(rc.x0 < tex.w && rc.x1 <= tex.w, "transfer width range out of bounds");

        tex.strip_coords(&mut rc);
        if tex.h == 0 {
            stride_h = 1;
        }

        TexTransfer {
            tex: self.tex,
            rc,
            stride_w,
            stride_h,
        }
    }

    /// Number of bytes this transfer moves, after default inference.
    /// Monotonic in the rectangle area and the strides.
    pub fn transfer_size(&self) -> usize {
        self.fix().fixed_size()
    }

    fn fixed_size(&self) -> usize {
        let tex = self.tex.info();
        let texels = match tex.dimension() {
            1 => self.rc.w() as usize,
            2 => self.rc.h() as usize * self.stride_w as usize,
            _ => self.rc.d() as usize * self.stride_w as usize * self.stride_h as usize,
        };
        texels * tex.format.texel_size
    }
}

/// Where the data of a texture upload comes from.
#[derive(Debug)]
pub enum TransferSource<'a, B: Backend> {
    /// A device buffer window, starting at a 4-byte-aligned offset.
    Buf {
        /// The source buffer.
        buf: &'a Buffer<B>,
        /// Byte offset into the buffer.
        offset: usize,
    },
    /// Host memory.
    Host(&'a [u8]),
}

/// Where the data of a texture download goes.
#[derive(Debug)]
pub enum TransferDest<'a, B: Backend> {
    /// A device buffer window, starting at a 4-byte-aligned offset.
    Buf {
        /// The destination buffer.
        buf: &'a Buffer<B>,
        /// Byte offset into the buffer.
        offset: usize,
    },
    /// Host memory.
    Host(&'a mut [u8]),
}

impl<B: Backend> Device<B> {
    /// Create a texture. Every requested usage flag must be backed by the
    /// matching format capability, and 1D/3D textures are never
    /// renderable.
    pub fn tex_create(&mut self, params: &Info) -> Result<Texture<B>, Error> {
        match params.dimension() {
            1 => {
                assert!(params.w > 0, "1D texture with zero width");
                assert!(params.w <= self.limits.max_tex_1d_dim, "1D texture too large");
                assert!(
                    !params.usage.contains(TexUsage::RENDERABLE),
                    "1D textures are not renderable"
                );
            }
            2 => {
                assert!(params.w > 0 && params.h > 0, "2D texture with zero extent");
                assert!(params.w <= self.limits.max_tex_2d_dim, "2D texture too wide");
                assert!(params.h <= self.limits.max_tex_2d_dim, "2D texture too tall");
            }
            _ => {
                assert!(
                    params.w > 0 && params.h > 0 && params.d > 0,
                    "3D texture with zero extent"
                );
                assert!(params.w <= self.limits.max_tex_3d_dim, "3D texture too wide");
                assert!(params.h <= self.limits.max_tex_3d_dim, "3D texture too tall");
                assert!(params.d <= self.limits.max_tex_3d_dim, "3D texture too deep");
                assert!(
                    !params.usage.contains(TexUsage::RENDERABLE),
                    "3D textures are not renderable"
                );
            }
        }

        let fmt = &params.format;
        assert!(fmt.caps.contains(FormatCaps::TEXTURE), "format unusable for textures");
        let requires = [
            (TexUsage::SAMPLEABLE, FormatCaps::SAMPLEABLE),
            (TexUsage::RENDERABLE, FormatCaps::RENDERABLE),
            (TexUsage::STORABLE, FormatCaps::STORABLE),
            (TexUsage::BLIT_SRC, FormatCaps::BLITTABLE),
            (TexUsage::BLIT_DST, FormatCaps::BLITTABLE),
        ];
        for &(usage, cap) in &requires {
            assert!(
                !params.usage.contains(usage) || fmt.caps.contains(cap),
                "texture usage {:?} requires format capability {:?}",
                usage,
                cap
            );
        }
        assert!(
            params.sample_mode != SampleMode::Linear || fmt.caps.contains(FormatCaps::LINEAR),
            "format does not support linear filtering"
        );

        let res = self.backend.tex_create(params)?;
        Ok(Texture::new(res, params.clone()))
    }

    /// Destroy the texture held by `slot`, if any, and leave the slot
    /// empty.
    pub fn tex_destroy(&mut self, slot: &mut Option<Texture<B>>) {
        if let Some(tex) = slot.take() {
            self.backend.tex_destroy(tex);
        }
    }

    /// Ensure `slot` holds a texture with exactly these parameters,
    /// reusing the current one when it already matches.
    pub fn tex_recreate(&mut self, slot: &mut Option<Texture<B>>, params: &Info) -> Result<(), Error> {
        if let Some(tex) = slot {
            if tex.info == *params {
                return Ok(());
            }
        }

        debug!("tex_recreate: {}x{}x{}", params.w, params.h, params.d);
        self.tex_destroy(slot);
        *slot = Some(self.tex_create(params)?);
        Ok(())
    }

    /// Fill a texture with a solid color. The previous contents are
    /// discarded.
    pub fn tex_clear(&mut self, dst: &Texture<B>, color: [f32; 4]) {
        assert!(
            dst.info.usage.contains(TexUsage::BLIT_DST),
            "cleared texture must be a blit destination"
        );

        self.tex_invalidate(dst);
        self.backend.tex_clear(dst, color);
    }

    /// Hint that the current contents of the texture may be discarded.
    pub fn tex_invalidate(&mut self, tex: &Texture<B>) {
        self.backend.tex_invalidate(tex);
    }

    /// Copy a region between two textures of equal texel size, scaling
    /// and mirroring as implied by the rectangles. A blit covering the
    /// whole destination discards its previous contents first.
    pub fn tex_blit(
        &mut self,
        dst: &Texture<B>,
        src: &Texture<B>,
        mut dst_rc: Rect3D,
        mut src_rc: Rect3D,
    ) {
        assert_eq!(
            src.info.format.texel_size, dst.info.format.texel_size,
            "blit between formats of different texel size"
        );
        assert!(src.info.usage.contains(TexUsage::BLIT_SRC), "source is not blittable");
        assert!(dst.info.usage.contains(TexUsage::BLIT_DST), "destination is not blittable");

        src.info.strip_coords(&mut src_rc);
        dst.info.strip_coords(&mut dst_rc);
        assert_blit_rect(&src_rc, &src.info);
        assert_blit_rect(&dst_rc, &dst.info);

        let mut full = Rect3D {
            x0: 0,
            y0: 0,
            z0: 0,
            x1: dst.info.w,
            y1: dst.info.h,
            z1: dst.info.d,
        };
        dst.info.strip_coords(&mut full);
        if dst_rc.normalize() == full {
            self.tex_invalidate(dst);
        }

        self.backend.tex_blit(dst, src, dst_rc, src_rc);
    }

    /// Upload host or buffer data into a texture region.
    pub fn tex_upload(&mut self, xfer: &TexTransfer<B>, src: TransferSource<B>) -> Result<(), Error> {
        assert!(
            xfer.tex.info.usage.contains(TexUsage::HOST_WRITABLE),
            "uploaded texture must be host writable"
        );

        let fixed = xfer.fix();
        let size = fixed.fixed_size();
        match &src {
            TransferSource::Buf { buf, offset } => {
                assert_eq!(offset % 4, 0, "transfer buffer offset must be 4-byte aligned");
                assert!(offset + size <= buf.info().size, "transfer exceeds the buffer");
            }
            TransferSource::Host(data) => {
                assert!(data.len() >= size, "host data smaller than the transfer");
            }
        }

        self.backend.tex_upload(&fixed, &src)
    }

    /// Download a texture region into host or buffer memory.
    pub fn tex_download(&mut self, xfer: &TexTransfer<B>, dst: TransferDest<B>) -> Result<(), Error> {
        assert!(
            xfer.tex.info.usage.contains(TexUsage::HOST_READABLE),
            "downloaded texture must be host readable"
        );

        let fixed = xfer.fix();
        let size = fixed.fixed_size();
        match &dst {
            TransferDest::Buf { buf, offset } => {
                assert_eq!(offset % 4, 0, "transfer buffer offset must be 4-byte aligned");
                assert!(offset + size <= buf.info().size, "transfer exceeds the buffer");
            }
            TransferDest::Host(data) => {
                assert!(data.len() >= size, "host destination smaller than the transfer");
            }
        }

        self.backend.tex_download(&fixed, dst)
    }
}

fn assert_blit_rect(rc: &Rect3D, info: &Info) {
    let n = rc.normalize();
    assert!(n.x0 < n.x1 && n.x1 <= info.w, "blit rectangle out of bounds");
    assert!(n.y0 < n.y1 && n.y1 <= max(info.h, 1), "blit rectangle out of bounds");
    assert!(n.z0 < n.z1 && n.z1 <= max(info.d, 1), "blit rectangle out of bounds");
}
