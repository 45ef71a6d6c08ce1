// gallium/renderer/src/lib.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Pipe contexts: state tracking and validation, a command-stream backend for hardware
//! screens, and a tiled rasterizer for software screens.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod command;
pub mod concurrent;
pub mod context;
pub mod cso;
pub mod dirty;
pub mod hw;
pub mod lifecycle;
pub mod rasterizer;
pub mod scene;
pub mod setup;
pub mod shader;
pub mod soft;
pub mod tile_map;
pub mod tiler;
pub mod tiles;
pub mod upload;
pub mod vertex;
