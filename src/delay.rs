// Copyright © 2025 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! The delay/hazard model consumed by the post-RA scheduler.
//!
//! The scheduler only depends on the [`DelayModel`] call contract and on
//! [`LegalizeState`] being mergeable across block boundaries; the actual
//! latency numbers belong to the model.  [`MakoDelayModel`] is the
//! standard implementation, with its calibration constants gathered in
//! [`DelayTunables`] rather than scattered through the passes.

use crate::ir::*;
use crate::reg_tracker::RegTracker;

/// Running hazard state carried from instruction to instruction while a
/// block is scheduled, and merged (componentwise max) into successor
/// blocks at block boundaries.
#[derive(Clone)]
pub struct LegalizeState {
    /// Issue-cycle counter for the current block.
    pub cycle: u32,
    /// Cycle at which each register slot's pending fixed-latency write
    /// lands.
    ready: RegTracker<u32>,
    /// Slots written by a special-function-class producer that has not
    /// been waited on yet.
    pending_ss: RegTracker<bool>,
    /// Slots written by a long-latency memory/texture producer that has
    /// not been waited on yet.
    pending_sy: RegTracker<bool>,
}

impl LegalizeState {
    pub fn new() -> LegalizeState {
        LegalizeState {
            cycle: 0,
            ready: RegTracker::new_with(&|| 0),
            pending_ss: RegTracker::new_with(&|| false),
            pending_sy: RegTracker::new_with(&|| false),
        }
    }

    /// Merges a predecessor block's exit state into this entry state.
    pub fn merge(&mut self, pred: &LegalizeState) {
        self.cycle = self.cycle.max(pred.cycle);
        self.ready.zip_apply(&pred.ready, |a, b| *a = (*a).max(*b));
        self.pending_ss.zip_apply(&pred.pending_ss, |a, b| *a |= *b);
        self.pending_sy.zip_apply(&pred.pending_sy, |a, b| *a |= *b);
    }
}

impl Default for LegalizeState {
    fn default() -> Self {
        LegalizeState::new()
    }
}

/// The scheduler's window into the target's latency and hazard rules.
pub trait DelayModel {
    /// Sync-wait flags `i` must carry if issued in `state` right now.
    fn required_sync_flags(
        &self,
        state: &LegalizeState,
        sh: &Shader,
        i: InstrRef,
    ) -> InstrFlags;

    /// Nop cycles that must precede `i` if issued in `state` right now.
    fn required_delay(
        &self,
        state: &LegalizeState,
        sh: &Shader,
        i: InstrRef,
    ) -> u32;

    /// Commits `i` (with its final sync flags) to the running state.
    fn update_state(
        &self,
        state: &mut LegalizeState,
        sh: &Shader,
        i: InstrRef,
    );

    /// Estimated producer→consumer latency for a register carried from
    /// `assigner` into source `src_n` of `consumer`, folding in the
    /// repeat counts of both sides.
    fn delay_slots_with_repeat(
        &self,
        sh: &Shader,
        assigner: InstrRef,
        consumer: InstrRef,
        src_n: usize,
    ) -> u32;

    /// Amortized cost of waiting on `i`'s special-function-class result.
    fn soft_ss_delay(&self, sh: &Shader, i: InstrRef) -> u32;

    /// Amortized cost of waiting on `i`'s texture/memory result.
    fn soft_sy_delay(&self, sh: &Shader, i: InstrRef) -> u32;

    /// The scheduler prefers instructions whose soft delay stays at or
    /// under this bound.
    fn soft_stall_threshold(&self) -> u32;

    /// Upper bound on any hard delay this model can report; the scheduler
    /// asserts it.
    fn max_hard_delay(&self) -> u32;
}

/// Calibration constants for [`MakoDelayModel`].  These are measured
/// numbers, not architecture: keep them with the model so retuning for a
/// new target revision never touches the scheduler.
#[derive(Debug, Clone)]
pub struct DelayTunables {
    pub soft_stall_threshold: u32,
    pub max_hard_delay: u32,
    /// Result latency of fixed-latency ALU producers.
    pub alu_latency: u32,
    /// Soft cost of waiting on an SFU or local-memory result.
    pub ss_sfu_delay: u32,
    /// Soft cost of waiting on a shared-register producer.
    pub ss_shared_delay: u32,
    /// Texture fetch latency by destination component count.
    pub sy_tex_latency: [u32; 4],
    /// Base latency of a constant-file load, plus per-component cost.
    pub sy_const_load_latency: u32,
    /// Base latency of a global memory access.
    pub sy_mem_latency: u32,
}

impl Default for DelayTunables {
    fn default() -> DelayTunables {
        DelayTunables {
            soft_stall_threshold: 3,
            max_hard_delay: 6,
            alu_latency: 3,
            ss_sfu_delay: 10,
            ss_shared_delay: 6,
            sy_tex_latency: [51, 53, 62, 64],
            sy_const_load_latency: 18,
            sy_mem_latency: 109,
        }
    }
}

pub struct MakoDelayModel {
    pub tunables: DelayTunables,
}

impl MakoDelayModel {
    pub fn new() -> MakoDelayModel {
        MakoDelayModel {
            tunables: DelayTunables::default(),
        }
    }

    /// Fragment and compute shaders run at doubled wave size, which about
    /// halves the visible memory latency per instruction slot.
    fn double_wavesize(&self, sh: &Shader) -> bool {
        matches!(sh.stage, ShaderStage::Fragment | ShaderStage::Compute)
    }
}

impl Default for MakoDelayModel {
    fn default() -> Self {
        MakoDelayModel::new()
    }
}

impl DelayModel for MakoDelayModel {
    fn required_sync_flags(
        &self,
        state: &LegalizeState,
        sh: &Shader,
        i: InstrRef,
    ) -> InstrFlags {
        let mut flags = InstrFlags::empty();
        let merged = sh.mergedregs;

        // A (ss)/(sy) waits for every outstanding producer of its class,
        // so touching any pending slot (read or overwrite) requires the
        // flag.
        let mut touch = |pending: &RegTracker<bool>| -> bool {
            let mut hit = false;
            pending.for_each_instr_src(sh, i, merged, |_, &p| hit |= p);
            pending.for_each_instr_dst(sh, i, merged, |_, &p| hit |= p);
            hit
        };

        if touch(&state.pending_ss) {
            flags |= InstrFlags::SS;
        }
        if touch(&state.pending_sy) {
            flags |= InstrFlags::SY;
        }
        flags
    }

    fn required_delay(
        &self,
        state: &LegalizeState,
        sh: &Shader,
        i: InstrRef,
    ) -> u32 {
        let merged = sh.mergedregs;
        let mut delay = 0;
        state.ready.for_each_instr_src(sh, i, merged, |_, &ready| {
            delay = delay.max(ready.saturating_sub(state.cycle));
        });
        state.ready.for_each_instr_dst(sh, i, merged, |_, &ready| {
            delay = delay.max(ready.saturating_sub(state.cycle));
        });
        delay
    }

    fn update_state(
        &self,
        state: &mut LegalizeState,
        sh: &Shader,
        i: InstrRef,
    ) {
        let merged = sh.mergedregs;

        if sh[i].flags.contains(InstrFlags::SS) {
            state.pending_ss.fill(false);
        }
        if sh[i].flags.contains(InstrFlags::SY) {
            state.pending_sy.fill(false);
        }

        state.cycle += 1 + u32::from(sh[i].repeat);

        let is_ss = sh.is_ss_producer(i);
        let is_sy = sh.is_sy_producer(i);
        let ready = state.cycle + self.tunables.alu_latency;
        if is_ss {
            state.pending_ss.for_each_instr_dst_mut(sh, i, merged, |_, p| {
                *p = true;
            });
        }
        if is_sy {
            state.pending_sy.for_each_instr_dst_mut(sh, i, merged, |_, p| {
                *p = true;
            });
        }
        if !is_ss && !is_sy && sh[i].opc.is_alu() {
            state.ready.for_each_instr_dst_mut(sh, i, merged, |_, r| {
                *r = ready;
            });
        }
    }

    fn delay_slots_with_repeat(
        &self,
        sh: &Shader,
        assigner: InstrRef,
        consumer: InstrRef,
        _src_n: usize,
    ) -> u32 {
        if sh[assigner].opc.is_meta() || sh[consumer].opc.is_meta() {
            return 0;
        }
        // Producers waited on through sync flags contribute no nop
        // cycles; their cost shows up as soft delay instead.
        if sh.is_ss_producer(assigner) || sh.is_sy_producer(assigner) {
            return 0;
        }

        let base = self.tunables.alu_latency;
        // The last replicated write of the assigner lands later; the
        // replicated reads of the consumer start later too and hide part
        // of that.
        (base + u32::from(sh[assigner].repeat))
            .saturating_sub(u32::from(sh[consumer].repeat))
    }

    fn soft_ss_delay(&self, sh: &Shader, i: InstrRef) -> u32 {
        let opc = sh[i].opc;
        if opc.is_sfu() || opc.is_local_mem_load() {
            self.tunables.ss_sfu_delay
        } else {
            self.tunables.ss_shared_delay
        }
    }

    fn soft_sy_delay(&self, sh: &Shader, i: InstrRef) -> u32 {
        let comps = sh.dest_elems(i).clamp(1, 4) as u32;
        let opc = sh[i].opc;

        let delay = if opc == Opcode::Ldc {
            self.tunables.sy_const_load_latency + 4 * comps
        } else if opc.is_tex_or_prefetch() {
            self.tunables.sy_tex_latency[(comps - 1) as usize]
        } else {
            self.tunables.sy_mem_latency + comps
        };

        if self.double_wavesize(sh) {
            delay / 2
        } else {
            delay
        }
    }

    fn soft_stall_threshold(&self) -> u32 {
        self.tunables.soft_stall_threshold
    }

    fn max_hard_delay(&self) -> u32 {
        self.tunables.max_hard_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_shader() -> Shader {
        Shader::new(ShaderStage::Vertex)
    }

    #[test]
    fn test_required_delay_counts_down() {
        let mut sh = simple_shader();
        let b = sh.block_create();

        let add = sh.instr_create(b, Opcode::AddF);
        sh.dst_create(add, regid(1, 0), RegFlags::empty());
        sh.src_create(add, regid(0, 0), RegFlags::empty());
        sh.src_create(add, regid(0, 1), RegFlags::empty());

        let mul = sh.instr_create(b, Opcode::MulF);
        sh.dst_create(mul, regid(2, 0), RegFlags::empty());
        sh.src_create(mul, regid(1, 0), RegFlags::empty());
        sh.src_create(mul, regid(0, 2), RegFlags::empty());

        let model = MakoDelayModel::new();
        let mut state = LegalizeState::new();

        model.update_state(&mut state, &sh, add);
        let d0 = model.required_delay(&state, &sh, mul);
        assert_eq!(d0, model.tunables.alu_latency);

        // An unrelated issue cycle shrinks the remaining wait
        state.cycle += 1;
        let d1 = model.required_delay(&state, &sh, mul);
        assert_eq!(d1, d0 - 1);
    }

    #[test]
    fn test_sync_flags_for_sfu_consumer() {
        let mut sh = simple_shader();
        let b = sh.block_create();

        let rcp = sh.instr_create(b, Opcode::Rcp);
        sh.dst_create(rcp, regid(1, 0), RegFlags::empty());
        sh.src_create(rcp, regid(0, 0), RegFlags::empty());

        let add = sh.instr_create(b, Opcode::AddF);
        sh.dst_create(add, regid(2, 0), RegFlags::empty());
        sh.src_create(add, regid(1, 0), RegFlags::empty());
        sh.src_create(add, regid(0, 1), RegFlags::empty());

        let other = sh.instr_create(b, Opcode::AddF);
        sh.dst_create(other, regid(3, 0), RegFlags::empty());
        sh.src_create(other, regid(0, 2), RegFlags::empty());
        sh.src_create(other, regid(0, 3), RegFlags::empty());

        let model = MakoDelayModel::new();
        let mut state = LegalizeState::new();

        model.update_state(&mut state, &sh, rcp);
        assert_eq!(
            model.required_sync_flags(&state, &sh, add),
            InstrFlags::SS
        );
        assert_eq!(
            model.required_sync_flags(&state, &sh, other),
            InstrFlags::empty()
        );

        // Committing the consumer with (ss) drains the wait
        sh[add].flags |= InstrFlags::SS;
        model.update_state(&mut state, &sh, add);
        let late = sh.instr_create(b, Opcode::AddF);
        sh.dst_create(late, regid(4, 0), RegFlags::empty());
        sh.src_create(late, regid(1, 0), RegFlags::empty());
        sh.src_create(late, regid(0, 1), RegFlags::empty());
        assert_eq!(
            model.required_sync_flags(&state, &sh, late),
            InstrFlags::empty()
        );
    }

    #[test]
    fn test_state_merge_takes_max() {
        let mut sh = simple_shader();
        let b = sh.block_create();

        let rcp = sh.instr_create(b, Opcode::Rcp);
        sh.dst_create(rcp, regid(1, 0), RegFlags::empty());
        sh.src_create(rcp, regid(0, 0), RegFlags::empty());

        let model = MakoDelayModel::new();
        let mut a = LegalizeState::new();
        let mut c = LegalizeState::new();
        model.update_state(&mut a, &sh, rcp);
        c.cycle = 7;

        let mut entry = LegalizeState::new();
        entry.merge(&a);
        entry.merge(&c);
        assert_eq!(entry.cycle, 7);

        let use_instr = sh.instr_create(b, Opcode::AddF);
        sh.dst_create(use_instr, regid(2, 0), RegFlags::empty());
        sh.src_create(use_instr, regid(1, 0), RegFlags::empty());
        sh.src_create(use_instr, regid(0, 1), RegFlags::empty());
        assert_eq!(
            model.required_sync_flags(&entry, &sh, use_instr),
            InstrFlags::SS
        );
    }
}
