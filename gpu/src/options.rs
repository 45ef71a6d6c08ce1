// gallium/gpu/src/options.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Debug options that toggle optional driver behavior.
//!
//! Options are read once, when the embedding program starts up, from an `OptionSource` (a
//! plain key/value bag, typically filled from the process environment) or from JSON. The
//! resulting `DebugOptions` is handed to the screen and never consulted through globals.

use crate::error::{PipeError, PipeResult};
use fxhash::FxHashMap;
use serde::Deserialize;

/// A named flag accepted by `OptionSource::get_flags()`.
#[derive(Clone, Copy, Debug)]
pub struct DebugFlag {
    pub name: &'static str,
    pub value: u64,
    pub desc: &'static str,
}

/// A read-only key/value lookup with typed accessors.
#[derive(Clone, Debug, Default)]
pub struct OptionSource {
    values: FxHashMap<String, String>,
}

impl OptionSource {
    #[inline]
    pub fn new() -> OptionSource {
        OptionSource::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> OptionSource
                               where I: IntoIterator<Item = (K, V)>,
                                     K: Into<String>,
                                     V: Into<String> {
        let mut source = OptionSource::new();
        for (key, value) in pairs {
            source.set(key, value);
        }
        source
    }

    /// Keeps only the `GALLIUM_` variables out of a full environment listing.
    pub fn from_env_vars<I>(vars: I) -> OptionSource
                            where I: IntoIterator<Item = (String, String)> {
        OptionSource::from_pairs(vars.into_iter().filter(|(key, _)| key.starts_with("GALLIUM_")))
    }

    #[inline]
    pub fn set<K, V>(&mut self, key: K, value: V) where K: Into<String>, V: Into<String> {
        self.values.insert(key.into(), value.into());
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|value| value.as_str())
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        let value = match self.get(name) {
            None => return default,
            Some(value) => value.trim().to_ascii_lowercase(),
        };
        match &*value {
            "1" | "y" | "yes" | "t" | "true" | "on" => true,
            "0" | "n" | "no" | "f" | "false" | "off" => false,
            _ => {
                warn!("ignoring unrecognized boolean {}={}", name, value);
                default
            }
        }
    }

    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        let value = match self.get(name) {
            None => return default,
            Some(value) => value.trim(),
        };
        let parsed = if value.starts_with("0x") || value.starts_with("0X") {
            i64::from_str_radix(&value[2..], 16)
        } else {
            value.parse()
        };
        match parsed {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("ignoring unrecognized integer {}={}", name, value);
                default
            }
        }
    }

    /// Parses a comma-, space-, or colon-separated list of flag names. `all` sets every flag.
    pub fn get_flags(&self, name: &str, table: &[DebugFlag]) -> u64 {
        let value = match self.get(name) {
            None => return 0,
            Some(value) => value,
        };
        let mut flags = 0;
        for word in value.split(|c: char| c == ',' || c == ':' || c.is_whitespace()) {
            if word.is_empty() {
                continue;
            }
            if word.eq_ignore_ascii_case("all") {
                flags |= table.iter().fold(0, |acc, flag| acc | flag.value);
                continue;
            }
            match table.iter().find(|flag| flag.name.eq_ignore_ascii_case(word)) {
                Some(flag) => flags |= flag.value,
                None => warn!("ignoring unknown flag {} in {}", word, name),
            }
        }
        flags
    }
}

pub const DEBUG_FORCE_SURFACE_VIEW: u64 = 1 << 0;
pub const DEBUG_FORCE_LEVEL_SURFACE_VIEW: u64 = 1 << 1;
pub const DEBUG_NO_SURFACE_VIEW: u64 = 1 << 2;
pub const DEBUG_FORCE_SAMPLER_VIEW: u64 = 1 << 3;
pub const DEBUG_NO_SAMPLER_VIEW: u64 = 1 << 4;
pub const DEBUG_FORCE_SWTNL: u64 = 1 << 5;
pub const DEBUG_NO_SWTNL: u64 = 1 << 6;
pub const DEBUG_SYNC: u64 = 1 << 7;

pub static DEBUG_FLAGS: [DebugFlag; 8] = [
    DebugFlag {
        name: "force_surface_view",
        value: DEBUG_FORCE_SURFACE_VIEW,
        desc: "Render through a separate view surface",
    },
    DebugFlag {
        name: "force_level_surface_view",
        value: DEBUG_FORCE_LEVEL_SURFACE_VIEW,
        desc: "Render to non-base mip levels through a view surface",
    },
    DebugFlag {
        name: "no_surface_view",
        value: DEBUG_NO_SURFACE_VIEW,
        desc: "Never create view surfaces for rendering",
    },
    DebugFlag {
        name: "force_sampler_view",
        value: DEBUG_FORCE_SAMPLER_VIEW,
        desc: "Sample through a separate view surface",
    },
    DebugFlag {
        name: "no_sampler_view",
        value: DEBUG_NO_SAMPLER_VIEW,
        desc: "Never create view surfaces for sampling",
    },
    DebugFlag {
        name: "force_swtnl",
        value: DEBUG_FORCE_SWTNL,
        desc: "Always transform on the CPU",
    },
    DebugFlag { name: "no_swtnl", value: DEBUG_NO_SWTNL, desc: "Never transform on the CPU" },
    DebugFlag { name: "sync", value: DEBUG_SYNC, desc: "Wait for the GPU after every flush" },
];

/// The typed options bag handed to the screen at creation.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugOptions {
    pub force_surface_view: bool,
    pub force_level_surface_view: bool,
    pub no_surface_view: bool,
    pub force_sampler_view: bool,
    pub no_sampler_view: bool,
    pub force_swtnl: bool,
    pub no_swtnl: bool,
    /// Finish every flush before returning.
    pub sync: bool,
    /// Reject draws that sample from a texture they also render to.
    pub check_feedback_loops: bool,
    /// Maximum number of dirty ranges tracked per buffer before ranges start coalescing.
    pub max_dirty_ranges: usize,
    /// Soft byte budget of recycled host surfaces.
    pub surface_cache_bytes: u64,
    /// Worker threads for the software tile pass. Zero runs tiles sequentially.
    pub rasterizer_threads: usize,
}

impl Default for DebugOptions {
    fn default() -> DebugOptions {
        DebugOptions {
            force_surface_view: false,
            force_level_surface_view: false,
            no_surface_view: false,
            force_sampler_view: false,
            no_sampler_view: false,
            force_swtnl: false,
            no_swtnl: false,
            sync: false,
            check_feedback_loops: true,
            max_dirty_ranges: 32,
            surface_cache_bytes: 16 * 1024 * 1024,
            rasterizer_threads: 0,
        }
    }
}

impl DebugOptions {
    pub fn from_json(json: &str) -> PipeResult<DebugOptions> {
        serde_json::from_str(json).map_err(|err| {
            PipeError::bad_input(format!("invalid debug options: {}", err))
        })
    }

    pub fn from_source(source: &OptionSource) -> DebugOptions {
        let defaults = DebugOptions::default();
        let flags = source.get_flags("GALLIUM_DEBUG", &DEBUG_FLAGS);
        let max_dirty_ranges = source.get_int("GALLIUM_MAX_DIRTY_RANGES",
                                              defaults.max_dirty_ranges as i64);
        let surface_cache_bytes = source.get_int("GALLIUM_SURFACE_CACHE_BYTES",
                                                 defaults.surface_cache_bytes as i64);
        let rasterizer_threads = source.get_int("GALLIUM_RASTERIZER_THREADS",
                                                defaults.rasterizer_threads as i64);
        DebugOptions {
            force_surface_view: flags & DEBUG_FORCE_SURFACE_VIEW != 0,
            force_level_surface_view: flags & DEBUG_FORCE_LEVEL_SURFACE_VIEW != 0,
            no_surface_view: flags & DEBUG_NO_SURFACE_VIEW != 0,
            force_sampler_view: flags & DEBUG_FORCE_SAMPLER_VIEW != 0,
            no_sampler_view: flags & DEBUG_NO_SAMPLER_VIEW != 0,
            force_swtnl: flags & DEBUG_FORCE_SWTNL != 0,
            no_swtnl: flags & DEBUG_NO_SWTNL != 0,
            sync: flags & DEBUG_SYNC != 0 || source.get_bool("GALLIUM_SYNC", false),
            check_feedback_loops: source.get_bool("GALLIUM_CHECK_FEEDBACK_LOOPS",
                                                  defaults.check_feedback_loops),
            max_dirty_ranges: max_dirty_ranges.max(1) as usize,
            surface_cache_bytes: surface_cache_bytes.max(0) as u64,
            rasterizer_threads: rasterizer_threads.max(0) as usize,
        }
    }
}
