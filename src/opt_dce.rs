// Copyright © 2025 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! Dead code elimination.
//!
//! Copy propagation only drops use counts; this pass actually removes
//! the instructions nothing consumes.  Liveness is a fixed point over
//! backwards sweeps: terminators, keeps and side-effecting instructions
//! seed it, sources of live instructions join it.

use crate::ir::*;
use log::trace;

struct DeadCodePass {
    any_dead: bool,
    new_live: bool,
    live: Vec<bool>,
}

impl DeadCodePass {
    fn new(sh: &Shader) -> DeadCodePass {
        DeadCodePass {
            any_dead: false,
            new_live: false,
            live: vec![false; sh.num_instrs()],
        }
    }

    fn mark_live(&mut self, i: InstrRef) {
        if !self.live[i.idx()] {
            self.live[i.idx()] = true;
            self.new_live = true;
        }
    }

    fn is_instr_live(&self, sh: &Shader, i: InstrRef) -> bool {
        if self.live[i.idx()] {
            return true;
        }

        let instr = &sh[i];
        if instr.opc.is_terminator()
            || instr.opc.is_store()
            || instr.opc.is_atomic()
            || instr.opc.is_kill_or_demote()
            || instr.opc.is_barrier()
            || instr.opc == Opcode::MetaInput
        {
            return true;
        }
        if !instr.barrier_class.is_empty() {
            return true;
        }
        let block = instr.block;
        if sh[block].keeps.contains(&i) {
            return true;
        }
        false
    }

    fn mark_instr(&mut self, sh: &Shader, i: InstrRef) {
        if !self.is_instr_live(sh, i) {
            self.any_dead = true;
            return;
        }
        self.mark_live(i);

        for n in 0..sh[i].srcs.len() {
            if let Some(def) = sh.ssa_def(sh[i].srcs[n]) {
                self.mark_live(def);
            }
        }
        for &dep in &sh[i].deps {
            self.mark_live(dep);
        }
    }

    fn run(&mut self, sh: &mut Shader) -> bool {
        loop {
            self.new_live = false;
            self.any_dead = false;

            for b in sh.block_refs().rev() {
                for ii in (0..sh[b].instrs.len()).rev() {
                    let i = sh[b].instrs[ii];
                    self.mark_instr(sh, i);
                }
            }

            if !self.new_live {
                break;
            }
        }

        if !self.any_dead {
            return false;
        }

        for b in sh.block_refs() {
            let block = &mut sh.blocks[b.idx()];
            let dead: Vec<InstrRef> = block
                .instrs
                .iter()
                .copied()
                .filter(|i| !self.live[i.idx()])
                .collect();
            block.instrs.retain(|i| self.live[i.idx()]);
            for i in dead {
                trace!("dce: removed {}", i);
                sh[i].flags.insert(InstrFlags::UNUSED);
            }
        }

        // Flag value-less destinations so RA knows not to allocate them
        for b in sh.block_refs() {
            for ii in 0..sh[b].instrs.len() {
                let i = sh[b].instrs[ii];
                for dn in 0..sh[i].dsts.len() {
                    let d = sh[i].dsts[dn];
                    if !sh[d].flags.contains(RegFlags::SSA) {
                        continue;
                    }
                    let used = self.reg_has_live_use(sh, d);
                    if !used {
                        sh[d].flags.insert(RegFlags::UNUSED);
                    }
                }
            }
        }

        true
    }

    fn reg_has_live_use(&self, sh: &Shader, d: RegRef) -> bool {
        for b in sh.block_refs() {
            for &i in &sh[b].instrs {
                for &s in &sh[i].srcs {
                    if sh[s].def == Some(d) {
                        return true;
                    }
                }
            }
        }
        false
    }
}

impl Shader {
    /// Removes instructions with no live consumers.  Returns whether
    /// anything was removed.
    pub fn opt_dce(&mut self) -> bool {
        DeadCodePass::new(self).run(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_mov_chain_removed() {
        let mut sh = Shader::new(ShaderStage::Vertex);
        let b = sh.block_create();

        let ld = sh.instr_create(b, Opcode::Ldg);
        sh.dst_create(ld, INVALID_REG, RegFlags::SSA);
        sh.src_create(ld, regid(0, 0), RegFlags::empty());

        // mov chain nothing reads
        let m0 = sh.instr_create(b, Opcode::Mov);
        sh.dst_create(m0, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(m0, ld, RegFlags::empty());
        let m1 = sh.instr_create(b, Opcode::Mov);
        sh.dst_create(m1, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(m1, m0, RegFlags::empty());

        // a store keeps the load itself alive
        let st = sh.instr_create(b, Opcode::Stg);
        sh.src_create(st, regid(1, 0), RegFlags::empty());
        sh.src_ssa(st, ld, RegFlags::empty());
        sh[b].keeps.push(st);

        let end = sh.instr_create(b, Opcode::End);
        let _ = end;

        assert!(sh.opt_dce());
        let instrs = &sh[b].instrs;
        assert!(instrs.contains(&ld));
        assert!(instrs.contains(&st));
        assert!(!instrs.contains(&m0));
        assert!(!instrs.contains(&m1));
        assert!(sh[m1].flags.contains(InstrFlags::UNUSED));

        // second run finds nothing
        assert!(!sh.opt_dce());
    }

    #[test]
    fn test_live_through_output() {
        let mut sh = Shader::new(ShaderStage::Vertex);
        let b = sh.block_create();

        let add = sh.instr_create(b, Opcode::AddF);
        sh.dst_create(add, INVALID_REG, RegFlags::SSA);
        sh.src_create(add, regid(0, 0), RegFlags::empty());
        sh.src_create(add, regid(0, 1), RegFlags::empty());

        let end = sh.instr_create(b, Opcode::End);
        sh.src_ssa(end, add, RegFlags::empty());

        assert!(!sh.opt_dce());
        assert!(sh[b].instrs.contains(&add));
    }
}
