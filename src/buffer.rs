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

//! Memory buffers.

use std::ptr::NonNull;

use crate::device::{Backend, Device, Error};

/// Role of the memory buffer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Role {
    /// Staging buffer for texture transfers.
    Transfer,
    /// Uniform buffer.
    Uniform,
    /// Storage buffer.
    Storage,
}

/// Buffer creation parameters.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Info {
    /// Role. Bounds the size by the matching device limit.
    pub role: Role,
    /// Size in bytes.
    pub size: usize,
    /// Keep the buffer persistently mapped into host memory.
    pub host_mapped: bool,
    /// Accepts host writes.
    pub host_writable: bool,
    /// Supports host reads.
    pub host_readable: bool,
}

/// A buffer, exclusively owned by its creator. Destroy through
/// [`Device::buf_destroy`].
#[derive(Debug)]
pub struct Buffer<B: Backend> {
    res: B::Buffer,
    info: Info,
    data: Option<NonNull<u8>>,
}

impl<B: Backend> Buffer<B> {
    /// The parameters this buffer was created with.
    pub fn info(&self) -> &Info {
        &self.info
    }

    /// The backend resource.
    pub fn resource(&self) -> &B::Buffer {
        &self.res
    }

    /// The persistent mapping. Present exactly when the buffer was
    /// created `host_mapped`.
    pub fn data(&self) -> Option<NonNull<u8>> {
        self.data
    }
}

impl<B: Backend> Device<B> {
    /// Create a buffer, optionally filled with initial data of exactly
    /// the buffer's size.
    pub fn buf_create(
        &mut self,
        params: &Info,
        initial_data: Option<&[u8]>,
    ) -> Result<Buffer<B>, Error> {
        let limit = match params.role {
            Role::Transfer => self.limits.max_xfer_size,
            Role::Uniform => self.limits.max_ubo_size,
            Role::Storage => self.limits.max_ssbo_size,
        };
        assert!(limit > 0, "device does not support {:?} buffers", params.role);
        assert!(params.size <= limit, "buffer exceeds the {:?} size limit", params.role);
        if let Some(data) = initial_data {
            assert_eq!(data.len(), params.size, "initial data must fill the buffer");
        }

        let (res, data) = self.backend.buf_create(params, initial_data)?;
        assert!(data.is_some() || !params.host_mapped, "host-mapped buffer without a mapping");
        Ok(Buffer {
            res,
            info: *params,
            data,
        })
    }

    /// Destroy the buffer held by `slot`, if any, and leave the slot
    /// empty.
    pub fn buf_destroy(&mut self, slot: &mut Option<Buffer<B>>) {
        if let Some(buf) = slot.take() {
            self.backend.buf_destroy(buf);
        }
    }

    /// Write `data` into the buffer at a 4-byte-aligned offset.
    pub fn buf_write(&mut self, buf: &Buffer<B>, offset: usize, data: &[u8]) {
        assert!(buf.info.host_writable, "written buffer must be host writable");
        assert!(offset + data.len() <= buf.info.size, "write exceeds the buffer");
        assert_eq!(offset % 4, 0, "buffer offset must be 4-byte aligned");
        self.backend.buf_write(buf, offset, data);
    }

    /// Read from the buffer at a 4-byte-aligned offset into `dest`.
    pub fn buf_read(&mut self, buf: &Buffer<B>, offset: usize, dest: &mut [u8]) -> Result<(), Error> {
        assert!(buf.info.host_readable, "read buffer must be host readable");
        assert!(offset + dest.len() <= buf.info.size, "read exceeds the buffer");
        assert_eq!(offset % 4, 0, "buffer offset must be 4-byte aligned");
        self.backend.buf_read(buf, offset, dest)
    }

    /// Probe whether the buffer is still in use by the device, blocking
    /// for at most `timeout_ns`. This is the only suspension point the
    /// abstraction exposes.
    pub fn buf_poll(&mut self, buf: &Buffer<B>, timeout_ns: u64) -> bool {
        self.backend.buf_poll(buf, timeout_ns)
    }
}
