// gallium/renderer/src/lifecycle.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The checked state machine every tile goes through in the tile pass.
//!
//! A tile is started, then each bound surface is either cleared or loaded (never both), then
//! shaded any number of times, then stored. A stored tile can only be touched again after a
//! new start.

use gallium_gpu::{PipeError, PipeResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TilePhase {
    Idle,
    /// Waiting for some bound surfaces to be cleared or loaded.
    Started,
    /// Every bound surface holds known content.
    Ready,
    Shading,
    Stored,
}

#[derive(Clone, Copy, Debug)]
pub struct TileLifecycle {
    /// One bit per bound surface slot.
    bound: u8,
    pending: u8,
    phase: TilePhase,
}

impl TileLifecycle {
    #[inline]
    pub fn new(bound: u8) -> TileLifecycle {
        TileLifecycle { bound, pending: 0, phase: TilePhase::Idle }
    }

    #[inline]
    pub fn phase(&self) -> TilePhase {
        self.phase
    }

    pub fn start(&mut self) -> PipeResult<()> {
        match self.phase {
            TilePhase::Idle | TilePhase::Stored => {}
            _ => return Err(PipeError::Fatal("tile started twice")),
        }
        self.pending = self.bound;
        self.phase = if self.bound == 0 { TilePhase::Ready } else { TilePhase::Started };
        Ok(())
    }

    #[inline]
    pub fn clear(&mut self, slot: usize) -> PipeResult<()> {
        self.begin_surface(slot)
    }

    #[inline]
    pub fn load(&mut self, slot: usize) -> PipeResult<()> {
        self.begin_surface(slot)
    }

    fn begin_surface(&mut self, slot: usize) -> PipeResult<()> {
        let bit = 1u8.checked_shl(slot as u32).unwrap_or(0);
        if self.phase != TilePhase::Started || self.pending & bit == 0 {
            return Err(PipeError::Fatal("tile surface cleared or loaded out of order"));
        }
        self.pending &= !bit;
        if self.pending == 0 {
            self.phase = TilePhase::Ready;
        }
        Ok(())
    }

    pub fn shade(&mut self) -> PipeResult<()> {
        match self.phase {
            TilePhase::Ready | TilePhase::Shading => {
                self.phase = TilePhase::Shading;
                Ok(())
            }
            _ => Err(PipeError::Fatal("tile shaded before its surfaces were cleared or loaded")),
        }
    }

    pub fn store(&mut self) -> PipeResult<()> {
        match self.phase {
            TilePhase::Ready | TilePhase::Shading => {
                self.phase = TilePhase::Stored;
                Ok(())
            }
            _ => Err(PipeError::Fatal("tile stored without known content")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{TileLifecycle, TilePhase};
    use quickcheck;

    #[test]
    fn test_store_is_reachable_after_clear_or_load() {
        let mut tile = TileLifecycle::new(0b1_0001);
        tile.start().unwrap();
        assert!(tile.shade().is_err());
        tile.clear(0).unwrap();
        assert!(tile.load(0).is_err());
        assert!(tile.store().is_err());
        tile.load(4).unwrap();
        tile.store().unwrap();
        assert_eq!(tile.phase(), TilePhase::Stored);
        assert!(tile.shade().is_err());
        tile.start().unwrap();
        assert_eq!(tile.phase(), TilePhase::Started);
    }

    #[test]
    fn test_shading_always_follows_clear_or_load() {
        fn prop_shading_needs_known_content(bound: u8, ops: Vec<u8>) -> bool {
            let bound = bound & 0x1f;
            let mut tile = TileLifecycle::new(bound);
            let (mut started, mut begun) = (false, 0u8);
            for op in ops {
                let slot = (op / 5) as usize % 5;
                match op % 5 {
                    0 => {
                        if tile.start().is_ok() {
                            if started {
                                return false;
                            }
                            started = true;
                            begun = 0;
                        }
                    }
                    1 | 2 => {
                        let result = if op % 5 == 1 { tile.clear(slot) } else { tile.load(slot) };
                        if result.is_ok() {
                            let bit = 1 << slot;
                            if !started || begun & bit != 0 || bound & bit == 0 {
                                return false;
                            }
                            begun |= bit;
                        }
                    }
                    3 => {
                        if tile.shade().is_ok() && (!started || begun != bound) {
                            return false;
                        }
                    }
                    _ => {
                        if tile.store().is_ok() {
                            if !started || begun != bound {
                                return false;
                            }
                            started = false;
                        }
                    }
                }
            }
            true
        }
        quickcheck::quickcheck(prop_shading_needs_known_content as fn(u8, Vec<u8>) -> bool);
    }
}
