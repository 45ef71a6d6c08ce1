// gallium/renderer/src/dirty.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The dirty-state engine.
//!
//! State setters OR bits into the context's dirty mask. Before a draw, `run_pass()` walks a fixed,
//! ordered table of emitters and calls each one whose dependency mask intersects the live mask.
//! An emitter may dirty derived state: bits consumed by later emitters are picked up in the same
//! pass, and bits consumed by the emitter itself or by earlier ones are left for the next pass.

use gallium_gpu::{PipeError, PipeResult};

bitflags! {
    pub struct DirtyState: u32 {
        const BLEND            = 1 << 0;
        const BLEND_COLOR      = 1 << 1;
        const DEPTH_STENCIL    = 1 << 2;
        const STENCIL_REF      = 1 << 3;
        const RASTERIZER       = 1 << 4;
        const VIEWPORT         = 1 << 5;
        const SCISSOR          = 1 << 6;
        const FRAMEBUFFER      = 1 << 7;
        const VS               = 1 << 8;
        const FS               = 1 << 9;
        const VS_CONSTANTS     = 1 << 10;
        const FS_CONSTANTS     = 1 << 11;
        const SAMPLERS         = 1 << 12;
        const SAMPLER_VIEWS    = 1 << 13;
        const VERTEX_ELEMENTS  = 1 << 14;
        const VERTEX_BUFFERS   = 1 << 15;
        const INDEX_BUFFER     = 1 << 16;
        /// Derived: whether vertex fetch has to run on the CPU.
        const NEED_SWVFETCH    = 1 << 17;
        /// Derived: whether vertex processing has to run on the CPU.
        const NEED_SWTNL       = 1 << 18;
        /// Derived: whether primitives have to be decomposed on the CPU.
        const NEED_PIPELINE    = 1 << 19;
    }
}

pub type EmitFn<C> = fn(&mut C, DirtyState) -> PipeResult<()>;

pub struct StateEmitter<C> {
    pub name: &'static str,
    pub dirty: DirtyState,
    /// Upper bound on the command dwords one call writes.
    pub num_dw: u32,
    pub emit: EmitFn<C>,
}

/// What the engine needs from the context it updates.
pub trait StateContext {
    fn dirty(&self) -> DirtyState;
    fn set_dirty(&mut self, dirty: DirtyState);
    /// Submits pending commands so that a failed emitter can run in a fresh command buffer.
    ///
    /// Must leave every dirty bit set.
    fn flush_for_retry(&mut self) -> PipeResult<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PassReport {
    /// Emitter calls made, including retries and catch-up calls.
    pub emitted: u32,
    pub flushes: u32,
}

pub struct StateEngine<C> {
    emitters: Vec<StateEmitter<C>>,
}

impl<C> StateEngine<C> where C: StateContext {
    #[inline]
    pub fn new() -> StateEngine<C> {
        StateEngine { emitters: vec![] }
    }

    /// Appends an emitter. Table order is execution order.
    pub fn register_emitter(&mut self,
                            name: &'static str,
                            dirty: DirtyState,
                            num_dw: u32,
                            emit: EmitFn<C>) {
        self.emitters.push(StateEmitter { name, dirty, num_dw, emit });
    }

    #[inline]
    pub fn emitters(&self) -> &[StateEmitter<C>] {
        &self.emitters
    }

    /// A conservative bound on the dwords a pass over `dirty` writes.
    pub fn pending_dwords(&self, dirty: DirtyState) -> u32 {
        self.emitters
            .iter()
            .filter(|emitter| emitter.dirty.intersects(dirty))
            .map(|emitter| emitter.num_dw)
            .sum()
    }

    pub fn run_pass(&self, ctx: &mut C) -> PipeResult<PassReport> {
        let mut pass = Pass {
            live: ctx.dirty(),
            carry: DirtyState::empty(),
            report: PassReport::default(),
        };
        ctx.set_dirty(DirtyState::empty());

        let mut catch_up_until = 0;
        for index in 0..self.emitters.len() {
            if !self.emitters[index].dirty.intersects(pass.live) {
                continue;
            }
            match self.invoke(ctx, index, index, &mut pass) {
                Ok(()) => {}
                Err(PipeError::OutOfMemory) => {
                    debug!("emitter {} out of space, flushing", self.emitters[index].name);
                    self.flush(ctx, &mut pass)?;
                    self.invoke(ctx, index, index, &mut pass)?;
                    catch_up_until = index;
                }
                Err(error) => return Err(error),
            }
        }

        // Emitters before a mid-pass flush wrote into the old command buffer. Everything after
        // them has already run, so whatever they dirty waits for the next pass.
        let last = self.emitters.len().saturating_sub(1);
        for index in 0..catch_up_until {
            if self.emitters[index].dirty.intersects(pass.live) {
                self.invoke(ctx, index, last, &mut pass)?;
            }
        }

        ctx.set_dirty(pass.carry);
        Ok(pass.report)
    }

    /// Runs one emitter. Bits it dirties for emitters up to `ran_until` are carried over.
    fn invoke(&self, ctx: &mut C, index: usize, ran_until: usize, pass: &mut Pass)
              -> PipeResult<()> {
        let emitter = &self.emitters[index];
        pass.report.emitted += 1;
        if let Err(error) = (emitter.emit)(ctx, pass.live) {
            ctx.set_dirty(pass.live | pass.carry | ctx.dirty());
            return Err(error);
        }

        let added = ctx.dirty();
        if added.is_empty() {
            return Ok(());
        }
        ctx.set_dirty(DirtyState::empty());
        pass.live |= added;
        for earlier in &self.emitters[..=ran_until] {
            pass.carry |= added & earlier.dirty;
        }
        Ok(())
    }

    fn flush(&self, ctx: &mut C, pass: &mut Pass) -> PipeResult<()> {
        ctx.flush_for_retry()?;
        pass.report.flushes += 1;
        pass.live = DirtyState::all();
        ctx.set_dirty(DirtyState::empty());
        Ok(())
    }
}

struct Pass {
    live: DirtyState,
    carry: DirtyState,
    report: PassReport,
}

#[cfg(test)]
mod test {
    use super::{DirtyState, StateContext, StateEngine};
    use gallium_gpu::{PipeError, PipeResult};

    struct MockContext {
        dirty: DirtyState,
        calls: Vec<&'static str>,
        fail_blend: u32,
        flushes: u32,
    }

    impl Default for MockContext {
        fn default() -> MockContext {
            MockContext { dirty: DirtyState::empty(), calls: vec![], fail_blend: 0, flushes: 0 }
        }
    }

    impl StateContext for MockContext {
        fn dirty(&self) -> DirtyState {
            self.dirty
        }

        fn set_dirty(&mut self, dirty: DirtyState) {
            self.dirty = dirty;
        }

        fn flush_for_retry(&mut self) -> PipeResult<()> {
            self.flushes += 1;
            self.dirty = DirtyState::all();
            Ok(())
        }
    }

    fn emit_need_swtnl(ctx: &mut MockContext, _: DirtyState) -> PipeResult<()> {
        ctx.calls.push("need_swtnl");
        ctx.dirty |= DirtyState::VS;
        Ok(())
    }

    fn emit_blend(ctx: &mut MockContext, _: DirtyState) -> PipeResult<()> {
        if ctx.fail_blend > 0 {
            ctx.fail_blend -= 1;
            return Err(PipeError::OutOfMemory);
        }
        ctx.calls.push("blend");
        Ok(())
    }

    fn emit_vs(ctx: &mut MockContext, _: DirtyState) -> PipeResult<()> {
        ctx.calls.push("vs");
        // Re-dirties the derived state computed before it.
        ctx.dirty |= DirtyState::NEED_SWTNL;
        Ok(())
    }

    fn engine() -> StateEngine<MockContext> {
        let mut engine = StateEngine::new();
        engine.register_emitter("need_swtnl",
                                DirtyState::NEED_SWTNL | DirtyState::RASTERIZER,
                                0,
                                emit_need_swtnl);
        engine.register_emitter("blend", DirtyState::BLEND, 4, emit_blend);
        engine.register_emitter("vs", DirtyState::VS, 8, emit_vs);
        engine
    }

    #[test]
    fn test_later_emitters_see_derived_bits_in_the_same_pass() {
        let engine = engine();
        let mut ctx = MockContext { dirty: DirtyState::RASTERIZER, ..MockContext::default() };
        engine.run_pass(&mut ctx).unwrap();
        assert_eq!(ctx.calls, vec!["need_swtnl", "vs"]);
        // The bit `vs` set for `need_swtnl` waits for the next pass.
        assert_eq!(ctx.dirty, DirtyState::NEED_SWTNL);
    }

    #[test]
    fn test_second_pass_without_changes_emits_nothing() {
        let engine = engine();
        let mut ctx = MockContext { dirty: DirtyState::BLEND, ..MockContext::default() };
        assert_eq!(engine.run_pass(&mut ctx).unwrap().emitted, 1);
        assert_eq!(engine.run_pass(&mut ctx).unwrap().emitted, 0);
        assert_eq!(ctx.calls, vec!["blend"]);
    }

    #[test]
    fn test_out_of_memory_flushes_and_retries_once() {
        let engine = engine();
        let mut ctx = MockContext { dirty: DirtyState::BLEND, fail_blend: 1, ..Default::default() };
        let report = engine.run_pass(&mut ctx).unwrap();
        assert_eq!(report.flushes, 1);
        assert_eq!(ctx.flushes, 1);
        // The flush dirtied everything: the retried emitter, the rest of the table, then the
        // emitters that ran before the flush.
        assert_eq!(ctx.calls, vec!["blend", "vs", "need_swtnl"]);
    }

    #[test]
    fn test_second_failure_is_returned_and_state_stays_dirty() {
        let engine = engine();
        let mut ctx = MockContext { dirty: DirtyState::BLEND, fail_blend: 2, ..Default::default() };
        assert_eq!(engine.run_pass(&mut ctx), Err(PipeError::OutOfMemory));
        assert_eq!(ctx.flushes, 1);
        assert!(ctx.dirty.contains(DirtyState::BLEND));
    }

    #[test]
    fn test_pending_dwords_counts_dirty_emitters() {
        let engine = engine();
        assert_eq!(engine.pending_dwords(DirtyState::BLEND | DirtyState::VS), 12);
        assert_eq!(engine.pending_dwords(DirtyState::SCISSOR), 0);
    }

    #[test]
    fn test_catch_up_dirt_waits_for_the_next_pass() {
        let engine = engine();
        let mut ctx = MockContext { dirty: DirtyState::BLEND, fail_blend: 1, ..Default::default() };
        engine.run_pass(&mut ctx).unwrap();
        assert!(ctx.dirty.contains(DirtyState::VS | DirtyState::NEED_SWTNL));
    }

    #[test]
    fn test_idempotence_over_any_dirty_mask() {
        fn emit_vs_plain(ctx: &mut MockContext, _: DirtyState) -> PipeResult<()> {
            ctx.calls.push("vs");
            Ok(())
        }

        fn prop_idempotent(bits: u32) -> bool {
            let mut engine = StateEngine::new();
            engine.register_emitter("need_swtnl",
                                    DirtyState::NEED_SWTNL | DirtyState::RASTERIZER,
                                    0,
                                    emit_need_swtnl);
            engine.register_emitter("blend", DirtyState::BLEND, 4, emit_blend);
            engine.register_emitter("vs", DirtyState::VS, 8, emit_vs_plain);

            let mut ctx = MockContext {
                dirty: DirtyState::from_bits_truncate(bits),
                ..MockContext::default()
            };
            engine.run_pass(&mut ctx).unwrap();
            ctx.calls.clear();
            let report = engine.run_pass(&mut ctx).unwrap();
            report.emitted == 0 && ctx.calls.is_empty()
        }
        quickcheck::quickcheck(prop_idempotent as fn(u32) -> bool);
    }
}
