// Copyright © 2025 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! Post-RA instruction scheduling.
//!
//! Runs once per block after register allocation.  Builds a dependency
//! DAG over the four hazard register files, computes critical-path
//! delays, then greedily issues ready instructions, asking the delay
//! model what each candidate would cost right now.  The block's
//! terminator sits out the whole dance and is reattached at the end.

use crate::dag::Dag;
use crate::delay::{DelayModel, LegalizeState};
use crate::ir::*;
use crate::reg_tracker::RegTracker;
use log::trace;
use rustc_hash::FxHashMap;

struct SchedNode {
    instr: InstrRef,
    /// Nops needed if this instruction were issued right now.
    /// Recomputed for every DAG head each time we pick, since the
    /// legalize state moves under us.
    delay: u32,
    max_delay: u32,
    has_ss_src: bool,
    has_sy_src: bool,
}

/// Per-block running state.  Survives the block so successors can seed
/// themselves with the componentwise max over their predecessors.
struct BlockSchedData {
    legalize: LegalizeState,
    /// Cycles until the most recent special-function-class result lands.
    ss_delay: u32,
    /// Cycles until the most recent texture/memory result lands.
    sy_delay: u32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DepDir {
    Forward,
    Reverse,
}

struct PostSched<'a, M: DelayModel> {
    sh: &'a mut Shader,
    model: &'a M,
    nodes: Vec<SchedNode>,
    dag: Dag,
    scheduled: Vec<bool>,
}

impl<M: DelayModel> PostSched<'_, M> {
    /// One direction of register-overlap dependencies.  Forward adds
    /// true dependencies with estimated latencies; reverse adds
    /// zero-latency anti and output dependencies, and marks writers that
    /// overwrite a late-read source as needing a sync.
    fn calc_reg_deps(&mut self, order: &[usize], dir: DepDir) {
        let merged = self.sh.mergedregs;
        let mut tables: RegTracker<Option<usize>> =
            RegTracker::new_with(&|| None);

        for &node_idx in order {
            let instr = self.nodes[node_idx].instr;
            let sh = &*self.sh;
            let model = self.model;
            let nodes = &mut self.nodes;
            let dag = &mut self.dag;

            tables.for_each_instr_src_mut(sh, instr, merged, |src_n, slot| {
                let Some(dep) = *slot else {
                    return;
                };
                if dep == node_idx {
                    return;
                }
                match dir {
                    DepDir::Forward => {
                        let latency = model.delay_slots_with_repeat(
                            sh,
                            nodes[dep].instr,
                            instr,
                            src_n,
                        );
                        dag.add_edge_max_latency(dep, node_idx, latency);
                        if sh.is_sy_producer(nodes[dep].instr) {
                            nodes[node_idx].has_sy_src = true;
                        }
                        if sh.is_ss_producer(nodes[dep].instr) {
                            nodes[node_idx].has_ss_src = true;
                        }
                    }
                    DepDir::Reverse => {
                        // `dep` is the next writer of this register.  If
                        // we keep reading the source after issue, that
                        // writer has to sync before clobbering it; the
                        // effect is the same as an (ss) source on the
                        // writer, so model it as one.
                        if sh.is_war_hazard_producer(instr) {
                            nodes[dep].has_ss_src = true;
                        }
                        dag.add_edge_max_latency(node_idx, dep, 0);
                    }
                }
            });

            tables.for_each_instr_dst_mut(sh, instr, merged, |_, slot| {
                if let Some(dep) = *slot {
                    if dep != node_idx {
                        match dir {
                            DepDir::Forward => {
                                dag.add_edge_max_latency(dep, node_idx, 0);
                            }
                            DepDir::Reverse => {
                                dag.add_edge_max_latency(node_idx, dep, 0);
                            }
                        }
                    }
                }
                *slot = Some(node_idx);
            });
        }
    }

    fn calc_extra_deps(&mut self, node_of: &FxHashMap<InstrRef, usize>) {
        // Explicit false dependencies, honored identically to register
        // dependencies.  They stay in SSA shape even post-RA.
        for node_idx in 0..self.nodes.len() {
            let instr = self.nodes[node_idx].instr;
            let block = self.sh[instr].block;
            for di in 0..self.sh[instr].deps.len() {
                let dep = self.sh[instr].deps[di];
                if self.sh[dep].block != block {
                    continue;
                }
                // unused false deps may survive DCE; skip them
                if self.sh[dep].flags.contains(InstrFlags::UNUSED) {
                    continue;
                }
                let Some(&dep_idx) = node_of.get(&dep) else {
                    continue;
                };
                self.dag.add_edge_max_latency(dep_idx, node_idx, 0);
            }
        }

        // Varying fetches must all land before any kill (the hardware
        // wants the end-of-input signal first), and kills must land
        // before any following texture/memory access so nothing
        // speculates past a dead thread.
        let mut inputs: Vec<usize> = Vec::new();
        let mut kills: Vec<usize> = Vec::new();
        for node_idx in 0..self.nodes.len() {
            let instr = self.nodes[node_idx].instr;
            let opc = self.sh[instr].opc;
            if opc.is_input() {
                inputs.push(node_idx);
            } else if opc.is_kill_or_demote() {
                for &in_idx in &inputs {
                    self.dag.add_edge_max_latency(in_idx, node_idx, 0);
                }
                kills.push(node_idx);
            } else if opc.is_tex() || opc.is_mem() {
                for &kill_idx in &kills {
                    self.dag.add_edge_max_latency(kill_idx, node_idx, 0);
                }
            }
        }
    }

    /// Critical path to the block exit, with the long-latency classes
    /// charged only on consumers that would actually wait for them.
    fn calc_max_delay(&mut self) {
        let sh = &*self.sh;
        let model = self.model;
        let nodes = &mut self.nodes;
        self.dag.traverse_bottom_up(|dag, n| {
            let mut max_delay = 0;
            for e in dag.edges(n) {
                let child = e.child;
                let mut delay = e.latency;
                if nodes[child].has_sy_src
                    && sh.is_sy_producer(nodes[n].instr)
                {
                    delay =
                        delay.max(model.soft_sy_delay(sh, nodes[n].instr));
                }
                if nodes[child].has_ss_src
                    && sh.is_ss_producer(nodes[n].instr)
                {
                    delay =
                        delay.max(model.soft_ss_delay(sh, nodes[n].instr));
                }
                max_delay = max_delay.max(nodes[child].max_delay + delay);
            }
            nodes[n].max_delay = nodes[n].max_delay.max(max_delay);
        });
    }

    fn instr_needs_ss_now(&self, i: InstrRef) -> bool {
        self.sh[i].flags.contains(InstrFlags::SS)
    }

    fn instr_needs_sy_now(&self, i: InstrRef) -> bool {
        self.sh[i].flags.contains(InstrFlags::SY)
    }

    /// Hard delay plus the amortized cost of outstanding long-latency
    /// work this instruction would have to wait on.
    fn node_delay_soft(&self, bd: &BlockSchedData, n: usize) -> u32 {
        let mut delay = self.nodes[n].delay;
        let instr = self.nodes[n].instr;
        if self.instr_needs_ss_now(instr) {
            delay = delay.max(bd.ss_delay);
        }
        if self.instr_needs_sy_now(instr) {
            delay = delay.max(bd.sy_delay);
        }
        delay
    }

    fn schedule(&mut self, bd: &mut BlockSchedData, n: usize) {
        let instr = self.nodes[n].instr;
        let block = self.sh[instr].block;

        trace!("psched: schedule {}", InstrDisp(&*self.sh, instr));

        self.sh[block].instrs.push(instr);
        self.dag.prune_head(n);
        self.scheduled[n] = true;

        bd.legalize.cycle += self.nodes[n].delay;
        self.model.update_state(&mut bd.legalize, self.sh, instr);

        let opc = self.sh[instr].opc;
        if opc.is_meta() && opc != Opcode::MetaTexPrefetch {
            return;
        }

        if self.sh.is_ss_producer(instr) {
            bd.ss_delay = self.model.soft_ss_delay(self.sh, instr);
        } else if self.instr_needs_ss_now(instr) {
            bd.ss_delay = 0;
        } else if bd.ss_delay > 0 {
            bd.ss_delay -= 1;
        }

        if self.sh.is_sy_producer(instr) {
            bd.sy_delay = self.model.soft_sy_delay(self.sh, instr);
        } else if self.instr_needs_sy_now(instr) {
            bd.sy_delay = 0;
        } else if bd.sy_delay > 0 {
            bd.sy_delay -= 1;
        }
    }

    /// Picks the next instruction.  Priorities, re-evaluated every step
    /// because head readiness changes as the cycle counter moves:
    /// meta first, then inputs, then hard-ready kills, then soft-ready
    /// long-latency producers, then anything within the soft stall
    /// budget, then the longest critical path.
    fn choose_instr(&mut self, bd: &BlockSchedData) -> usize {
        let heads: Vec<usize> = self.dag.heads().collect();

        // Required sync flags and nop delays depend on everything
        // scheduled so far; refresh them for all candidates.
        for &n in &heads {
            let instr = self.nodes[n].instr;
            let sync = self.model.required_sync_flags(
                &bd.legalize,
                self.sh,
                instr,
            );
            self.sh[instr]
                .flags
                .remove(InstrFlags::SS | InstrFlags::SY);
            self.sh[instr].flags |= sync;
            self.nodes[n].delay =
                self.model.required_delay(&bd.legalize, self.sh, instr);
        }

        let mut chosen: Option<usize> = None;

        for &n in &heads {
            if !self.sh[self.nodes[n].instr].opc.is_meta() {
                continue;
            }
            if chosen.map_or(true, |c| {
                self.nodes[c].max_delay < self.nodes[n].max_delay
            }) {
                chosen = Some(n);
            }
        }
        if let Some(n) = chosen {
            trace!("psched: chose (meta)");
            return n;
        }

        // Issue inputs as early as possible; consuming the last one
        // unlocks varying storage for the next wave, so it should also
        // be the last thing holding that storage.
        for &n in &heads {
            if !self.sh[self.nodes[n].instr].opc.is_input() {
                continue;
            }
            if chosen.map_or(true, |c| {
                self.nodes[c].max_delay < self.nodes[n].max_delay
            }) {
                chosen = Some(n);
            }
        }
        if let Some(n) = chosen {
            trace!("psched: chose (input)");
            return n;
        }

        // Kills end threads; get them out of the way as soon as they
        // cost nothing.
        for &n in &heads {
            if self.nodes[n].delay > 0 {
                continue;
            }
            if !self.sh[self.nodes[n].instr].opc.is_kill_or_demote() {
                continue;
            }
            if chosen.map_or(true, |c| {
                self.nodes[c].max_delay < self.nodes[n].max_delay
            }) {
                chosen = Some(n);
            }
        }
        if let Some(n) = chosen {
            trace!("psched: chose (kill, hard ready)");
            return n;
        }

        // Start long-latency work early so its latency overlaps other
        // instructions.
        for &n in &heads {
            if self.node_delay_soft(bd, n) > 0 {
                continue;
            }
            let instr = self.nodes[n].instr;
            if !(self.sh.is_ss_producer(instr)
                || self.sh.is_sy_producer(instr))
            {
                continue;
            }
            if chosen.map_or(true, |c| {
                self.nodes[c].max_delay < self.nodes[n].max_delay
            }) {
                chosen = Some(n);
            }
        }
        if let Some(n) = chosen {
            trace!("psched: chose (sfu/tex, soft ready)");
            return n;
        }

        // Prefer a small now-stall over a future one, up to a point.
        let threshold = self.model.soft_stall_threshold();
        let mut chosen_delay = 0;
        for &n in &heads {
            let d = self.node_delay_soft(bd, n);
            if d > threshold {
                continue;
            }

            match chosen {
                None => {
                    chosen = Some(n);
                    chosen_delay = d;
                    continue;
                }
                Some(c) => {
                    if d < chosen_delay {
                        chosen = Some(n);
                        chosen_delay = d;
                        continue;
                    }
                    if d > chosen_delay {
                        continue;
                    }
                    if self.nodes[c].max_delay < self.nodes[n].max_delay {
                        chosen = Some(n);
                        chosen_delay = d;
                    }
                }
            }
        }
        if let Some(n) = chosen {
            trace!("psched: chose (soft ready)");
            return n;
        }

        // Otherwise take the head with the longest path to the exit
        for &n in &heads {
            if chosen.map_or(true, |c| {
                self.nodes[c].max_delay < self.nodes[n].max_delay
            }) {
                chosen = Some(n);
            }
        }
        trace!("psched: chose (leader)");
        chosen.expect("ready list is empty")
    }
}

/// In-place movs (`mov rN, rN`) survive to this point because before RA
/// it was not safe to prove them removable.  Drop them now, and scrub
/// them out of false-dependency lists.
fn cleanup_self_movs(sh: &mut Shader) {
    for b in sh.block_refs() {
        let instrs = sh[b].instrs.clone();
        for i in instrs {
            let deps = std::mem::take(&mut sh[i].deps);
            let deps: Vec<InstrRef> = deps
                .into_iter()
                .filter(|&d| !sh.is_self_mov(d))
                .collect();
            sh[i].deps = deps;

            if sh.is_self_mov(i) {
                sh.instr_unlink(i);
                sh[i].flags.insert(InstrFlags::UNUSED);
            }
        }
    }
}

fn sched_block<M: DelayModel>(
    sh: &mut Shader,
    model: &M,
    block_data: &mut Vec<Option<BlockSchedData>>,
    b: BlockRef,
) {
    let mut bd = BlockSchedData {
        legalize: LegalizeState::new(),
        ss_delay: 0,
        sy_delay: 0,
    };

    // A block with multiple predecessors inherits the worst case of each
    // of them: componentwise max, never a sum.
    for pi in 0..sh[b].predecessors.len() {
        let pred = sh[b].predecessors[pi];
        if let Some(pd) = &block_data[pred.idx()] {
            bd.legalize.merge(&pd.legalize);
            bd.ss_delay = bd.ss_delay.max(pd.ss_delay);
            bd.sy_delay = bd.sy_delay.max(pd.sy_delay);
        }
    }

    // The terminator stays last; pulling it out is simpler than wiring
    // up dependencies to pin it there.
    let terminator = sh.block_take_terminator(b);

    let unscheduled: Vec<InstrRef> = std::mem::take(&mut sh.blocks[b.idx()].instrs)
        .into_iter()
        .filter(|&i| {
            if sh[i].opc == Opcode::Nop {
                return false;
            }
            true
        })
        .collect();

    let nodes: Vec<SchedNode> = unscheduled
        .iter()
        .map(|&i| SchedNode {
            instr: i,
            delay: 0,
            max_delay: 0,
            has_ss_src: false,
            has_sy_src: false,
        })
        .collect();
    let node_of: FxHashMap<InstrRef, usize> = unscheduled
        .iter()
        .enumerate()
        .map(|(n, &i)| (i, n))
        .collect();

    let num_nodes = nodes.len();
    let mut ps = PostSched {
        sh: &mut *sh,
        model,
        nodes,
        dag: Dag::new(num_nodes),
        scheduled: vec![false; num_nodes],
    };

    let forward_order: Vec<usize> = (0..num_nodes).collect();
    let reverse_order: Vec<usize> = (0..num_nodes).rev().collect();
    ps.calc_reg_deps(&forward_order, DepDir::Forward);
    ps.calc_reg_deps(&reverse_order, DepDir::Reverse);
    ps.calc_extra_deps(&node_of);
    ps.calc_max_delay();

    // Everything that loads values into registers before the shader
    // really starts goes first: inputs, then texture prefetches, then
    // push-constant loads.
    for phase_opc in [
        Opcode::MetaInput,
        Opcode::MetaTexPrefetch,
        Opcode::PushConstsLoadMacro,
    ] {
        for n in 0..num_nodes {
            if ps.scheduled[n] {
                continue;
            }
            if ps.sh[ps.nodes[n].instr].opc != phase_opc {
                continue;
            }
            debug_assert!(ps.dag.is_head(n));
            ps.schedule(&mut bd, n);
        }
    }

    let mut remaining =
        num_nodes - ps.scheduled.iter().filter(|&&s| s).count();
    while remaining > 0 {
        let n = ps.choose_instr(&bd);

        // A larger hard delay here means the dependency DAG or the
        // delay model dropped an edge, not that the input was bad.
        let delay = ps.nodes[n].delay;
        trace!("psched: delay={}", delay);
        assert!(delay <= model.max_hard_delay());

        ps.schedule(&mut bd, n);
        remaining -= 1;
    }

    if let Some(t) = terminator {
        sh[b].instrs.push(t);
    }

    block_data[b.idx()] = Some(bd);
}

impl Shader {
    /// Reorders every block's instructions to minimize estimated stall
    /// cycles under `model`.
    pub fn opt_instr_sched_postpass(&mut self, model: &impl DelayModel) {
        cleanup_self_movs(self);

        let mut block_data: Vec<Option<BlockSchedData>> =
            (0..self.blocks.len()).map(|_| None).collect();

        for b in self.block_refs() {
            sched_block(self, model, &mut block_data, b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::MakoDelayModel;

    fn alu(
        sh: &mut Shader,
        b: BlockRef,
        dst: u16,
        s0: u16,
        s1: u16,
    ) -> InstrRef {
        let i = sh.instr_create(b, Opcode::AddF);
        sh.dst_create(i, dst, RegFlags::empty());
        sh.src_create(i, s0, RegFlags::empty());
        sh.src_create(i, s1, RegFlags::empty());
        i
    }

    fn pos(sh: &Shader, b: BlockRef, i: InstrRef) -> usize {
        sh[b].instrs.iter().position(|&x| x == i).unwrap()
    }

    #[test]
    fn test_topological_order() {
        let mut sh = Shader::new(ShaderStage::Fragment);
        let b = sh.block_create();

        let a = alu(&mut sh, b, regid(1, 0), regid(0, 0), regid(0, 1));
        let c = alu(&mut sh, b, regid(2, 0), regid(1, 0), regid(0, 2));
        let d = alu(&mut sh, b, regid(3, 0), regid(2, 0), regid(2, 0));
        let term = sh.instr_create(b, Opcode::End);

        let model = MakoDelayModel::new();
        sh.opt_instr_sched_postpass(&model);

        assert!(pos(&sh, b, a) < pos(&sh, b, c));
        assert!(pos(&sh, b, c) < pos(&sh, b, d));
        assert_eq!(*sh[b].instrs.last().unwrap(), term);
    }

    fn build_mixed_block() -> (Shader, BlockRef, Vec<InstrRef>) {
        let mut sh = Shader::new(ShaderStage::Fragment);
        let b = sh.block_create();
        let mut all = Vec::new();

        // a handful of independent ALU ops
        for n in 0..4_u16 {
            all.push(alu(
                &mut sh,
                b,
                regid(1 + n, 0),
                regid(0, n % 4),
                regid(0, (n + 1) % 4),
            ));
        }
        // a long-latency fetch whose result is consumed at the end
        let tex = sh.instr_create(b, Opcode::Sam);
        sh.dst_create(tex, regid(8, 0), RegFlags::empty());
        sh.src_create(tex, regid(0, 0), RegFlags::empty());
        all.push(tex);
        all.push(alu(&mut sh, b, regid(9, 0), regid(8, 0), regid(1, 0)));
        sh.instr_create(b, Opcode::End);

        (sh, b, all)
    }

    #[test]
    fn test_long_latency_work_starts_early() {
        let (mut sh, b, all) = build_mixed_block();
        let tex = all[4];
        let consumer = all[5];

        let model = MakoDelayModel::new();
        sh.opt_instr_sched_postpass(&model);

        // Nothing forces the fetch late, so it gets issued right away to
        // overlap its latency with the independent ALU work.
        assert!(pos(&sh, b, tex) <= 2);
        assert!(pos(&sh, b, consumer) > pos(&sh, b, tex));
        // Its consumer picked up the sync-wait marker
        assert!(sh[consumer].flags.contains(InstrFlags::SY));
    }

    #[test]
    fn test_determinism() {
        let (mut sh1, b1, _) = build_mixed_block();
        let (mut sh2, b2, _) = build_mixed_block();

        let model = MakoDelayModel::new();
        sh1.opt_instr_sched_postpass(&model);
        sh2.opt_instr_sched_postpass(&model);

        let order1: Vec<u32> =
            sh1[b1].instrs.iter().map(|i| sh1[*i].serial).collect();
        let order2: Vec<u32> =
            sh2[b2].instrs.iter().map(|i| sh2[*i].serial).collect();
        assert_eq!(order1, order2);
    }

    #[test]
    fn test_war_hazard_keeps_late_reader_first() {
        let mut sh = Shader::new(ShaderStage::Fragment);
        let b = sh.block_create();

        // The sample keeps reading its coordinate register after issue
        let tex = sh.instr_create(b, Opcode::Sam);
        sh.dst_create(tex, regid(2, 0), RegFlags::empty());
        sh.src_create(tex, regid(1, 0), RegFlags::empty());

        // ...so this overwrite of r1.x cannot move above it
        let clobber = alu(&mut sh, b, regid(1, 0), regid(0, 0), regid(0, 1));
        sh.instr_create(b, Opcode::End);

        let model = MakoDelayModel::new();
        sh.opt_instr_sched_postpass(&model);

        assert!(pos(&sh, b, tex) < pos(&sh, b, clobber));
    }

    #[test]
    fn test_inputs_before_kill_before_tex() {
        let mut sh = Shader::new(ShaderStage::Fragment);
        let b = sh.block_create();

        let bary = sh.instr_create(b, Opcode::BaryF);
        sh.dst_create(bary, regid(1, 0), RegFlags::empty());
        sh.src_create(bary, regid(0, 0), RegFlags::empty());

        let kill = sh.instr_create(b, Opcode::Kill);
        sh.src_create(kill, REG_P0, RegFlags::PREDICATE);

        let tex = sh.instr_create(b, Opcode::Sam);
        sh.dst_create(tex, regid(2, 0), RegFlags::empty());
        sh.src_create(tex, regid(1, 0), RegFlags::empty());

        sh.instr_create(b, Opcode::End);

        let model = MakoDelayModel::new();
        sh.opt_instr_sched_postpass(&model);

        assert!(pos(&sh, b, bary) < pos(&sh, b, kill));
        assert!(pos(&sh, b, kill) < pos(&sh, b, tex));
    }

    #[test]
    fn test_false_dep_ordering() {
        let mut sh = Shader::new(ShaderStage::Fragment);
        let b = sh.block_create();

        let st = sh.instr_create(b, Opcode::Stl);
        sh.src_create(st, regid(1, 0), RegFlags::empty());
        sh.src_create(st, regid(0, 0), RegFlags::empty());

        let ld = sh.instr_create(b, Opcode::Ldl);
        sh.dst_create(ld, regid(2, 0), RegFlags::empty());
        sh.src_create(ld, regid(1, 0), RegFlags::empty());
        sh.instr_add_dep(ld, st);

        sh.instr_create(b, Opcode::End);

        let model = MakoDelayModel::new();
        sh.opt_instr_sched_postpass(&model);

        assert!(pos(&sh, b, st) < pos(&sh, b, ld));
    }

    #[test]
    fn test_meta_inputs_issue_first() {
        let mut sh = Shader::new(ShaderStage::Fragment);
        let b = sh.block_create();

        let a = alu(&mut sh, b, regid(4, 0), regid(2, 0), regid(2, 1));
        let input = sh.instr_create(b, Opcode::MetaInput);
        sh.dst_create(input, regid(0, 0), RegFlags::empty());
        let _ = a;

        sh.instr_create(b, Opcode::End);

        let model = MakoDelayModel::new();
        sh.opt_instr_sched_postpass(&model);

        assert_eq!(pos(&sh, b, input), 0);
    }

    #[test]
    fn test_cross_block_sync_carries_over() {
        let mut sh = Shader::new(ShaderStage::Fragment);
        let b0 = sh.block_create();
        let b1 = sh.block_create();
        sh[b0].successors[0] = Some(b1);
        sh.block_add_predecessor(b1, b0);

        let rcp = sh.instr_create(b0, Opcode::Rcp);
        sh.dst_create(rcp, regid(1, 0), RegFlags::empty());
        sh.src_create(rcp, regid(0, 0), RegFlags::empty());
        let jump = sh.instr_create(b0, Opcode::Jump);
        sh[jump].flow_info_mut().target = Some(b1);

        let consumer = alu(&mut sh, b1, regid(2, 0), regid(1, 0), regid(0, 1));
        sh.instr_create(b1, Opcode::End);

        let model = MakoDelayModel::new();
        sh.opt_instr_sched_postpass(&model);

        // The wait for the special-function result crosses the block
        // boundary with the merged legalize state.
        assert!(sh[consumer].flags.contains(InstrFlags::SS));
    }

    #[test]
    fn test_self_mov_cleanup() {
        let mut sh = Shader::new(ShaderStage::Fragment);
        let b = sh.block_create();

        let m = sh.instr_create(b, Opcode::Mov);
        sh.dst_create(m, regid(1, 0), RegFlags::empty());
        sh.src_create(m, regid(1, 0), RegFlags::empty());

        let a = alu(&mut sh, b, regid(2, 0), regid(1, 0), regid(0, 0));
        sh.instr_create(b, Opcode::End);

        let model = MakoDelayModel::new();
        sh.opt_instr_sched_postpass(&model);

        assert!(!sh[b].instrs.contains(&m));
        assert!(sh[b].instrs.contains(&a));
    }
}
