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

//! A ring of reusable transfer buffers, and staged texture transfers
//! built on top of it.
//!
//! The pool hands out the least recently used buffer that the device is
//! no longer reading from, growing on demand when every buffer is still
//! in flight. Buffers are never shrunk; switching to incompatible
//! parameters empties the pool.

use crate::buffer::{self, Buffer, Role};
use crate::device::{Backend, Device, Error};
use crate::texture::{TexTransfer, TransferDest, TransferSource};

/// A rotating pool of buffers sharing one set of creation parameters.
#[derive(Debug)]
pub struct BufferPool<B: Backend> {
    buffers: Vec<Buffer<B>>,
    index: usize,
    current: Option<buffer::Info>,
}

impl<B: Backend> Default for BufferPool<B> {
    fn default() -> Self {
        BufferPool::new()
    }
}

impl<B: Backend> BufferPool<B> {
    /// New empty pool.
    pub fn new() -> Self {
        BufferPool {
            buffers: Vec::new(),
            index: 0,
            current: None,
        }
    }

    /// Number of buffers currently held.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the pool holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Destroy all buffers and forget the current parameters.
    pub fn uninit(&mut self, dev: &mut Device<B>) {
        for buf in self.buffers.drain(..) {
            dev.backend.buf_destroy(buf);
        }
        self.index = 0;
        self.current = None;
    }

    /// Fetch an idle buffer satisfying `params`, creating one if needed.
    /// Fails with [`Error::Busy`] when every buffer is in flight and the
    /// pool cannot grow.
    pub fn get(&mut self, dev: &mut Device<B>, params: &buffer::Info) -> Result<&Buffer<B>, Error> {
        let compatible = match &self.current {
            Some(cur) => {
                params.role == cur.role
                    && params.size <= cur.size
                    && params.host_mapped == cur.host_mapped
                    && params.host_writable == cur.host_writable
                    && params.host_readable == cur.host_readable
            }
            None => false,
        };
        if !compatible {
            self.uninit(dev);
            self.current = Some(*params);
        }

        // Make sure at least one buffer exists
        if self.buffers.is_empty() {
            self.grow(dev)?;
        }

        // Make sure the next buffer is no longer in flight
        if dev.buf_poll(&self.buffers[self.index], 0) {
            if let Err(err) = self.grow(dev) {
                debug!("buffer pool exhausted and growth failed: {}", err);
                return Err(Error::Busy);
            }
        }

        let index = self.index;
        self.index = (index + 1) % self.buffers.len();
        Ok(&self.buffers[index])
    }

    fn grow(&mut self, dev: &mut Device<B>) -> Result<(), Error> {
        let params = self.current.expect("growing a pool with no parameters");
        let buf = dev.buf_create(&params, None)?;
        self.buffers.insert(self.index, buf);
        debug!(
            "resized buffer pool of type {:?} to size {}",
            params.role,
            self.buffers.len()
        );
        Ok(())
    }
}

/// Upload to a texture, staging host data through a pooled transfer
/// buffer. Transfers that already come from a buffer pass through
/// unchanged.
pub fn tex_upload_pbo<B: Backend>(
    dev: &mut Device<B>,
    pbo: &mut BufferPool<B>,
    xfer: &TexTransfer<B>,
    src: TransferSource<B>,
) -> Result<(), Error> {
    let data = match src {
        TransferSource::Buf { .. } => return dev.tex_upload(xfer, src),
        TransferSource::Host(data) => data,
    };

    let bufparams = buffer::Info {
        role: Role::Transfer,
        size: xfer.transfer_size(),
        host_mapped: false,
        host_writable: true,
        host_readable: false,
    };

    let buf = pbo.get(dev, &bufparams)?;
    dev.buf_write(buf, 0, &data[..bufparams.size]);
    dev.tex_upload(xfer, TransferSource::Buf { buf, offset: 0 })
}

/// Download from a texture, staging through a pooled transfer buffer when
/// the caller provided host memory. This path has to wait for the device
/// to finish the copy, which makes it the documented slow path.
pub fn tex_download_pbo<B: Backend>(
    dev: &mut Device<B>,
    pbo: &mut BufferPool<B>,
    xfer: &TexTransfer<B>,
    dst: TransferDest<B>,
) -> Result<(), Error> {
    let out = match dst {
        TransferDest::Buf { .. } => return dev.tex_download(xfer, dst),
        TransferDest::Host(out) => out,
    };

    let bufparams = buffer::Info {
        role: Role::Transfer,
        size: xfer.transfer_size(),
        host_mapped: false,
        host_writable: false,
        host_readable: true,
    };

    let buf = pbo.get(dev, &bufparams)?;
    dev.tex_download(xfer, TransferDest::Buf { buf, offset: 0 })?;

    if dev.buf_poll(buf, 0) {
        trace!("tex_download without buffer: blocking (slow path)");
        while dev.buf_poll(buf, u64::MAX) {}
    }

    dev.buf_read(buf, 0, &mut out[..bufparams.size])
}
