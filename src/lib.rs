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

//! A backend-agnostic rendering abstraction over a single GPU device.
//!
//! The crate has three layers. The [`Device`] type is the validated public
//! surface: it checks every argument of every operation and forwards to a
//! concrete driver through the [`Backend`] trait. Below the backend sits the
//! [`memory`] module, a best-fit sub-allocator that multiplexes large device
//! allocations into many small slices and handles external-memory export and
//! import. The [`tone_map`] module is self-contained HDR signal processing
//! used by renderers built on top of this crate.
//!
//! Everything here assumes a single logical device context and external
//! serialization by the caller; see the module docs for the details.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub use crate::device::{Backend, Caps, Device, Error, Limits};
pub use crate::format::{Format, FormatCaps, FormatType};
pub use crate::rect::{Rect2D, Rect3D};

pub mod buffer;
pub mod device;
pub mod dummy;
pub mod format;
pub mod memory;
pub mod pass;
pub mod pool;
pub mod rect;
pub mod shade;
pub mod texture;
pub mod tone_map;
