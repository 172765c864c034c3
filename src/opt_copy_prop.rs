// Copyright © 2025 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! Copy propagation.
//!
//! Walks the use-def graph depth first from each block's terminator and
//! kept instructions, folding trivial movs, immediate/constant loads and
//! abs/neg modifier registers directly into their consumers.  Nothing is
//! unlinked here; producers whose use count drops to zero are left for
//! DCE.

use crate::ir::*;
use crate::util::half_to_f32_bits;
use log::trace;

struct CopyPropPass<'a> {
    sh: &'a mut Shader,
    progress: bool,
    lower_imm_to_const: bool,
    /// SSA consumer counts, computed once up front.  Folding a source
    /// past a mov decrements the mov's entry.
    use_count: Vec<u32>,
}

impl CopyPropPass<'_> {
    /// A type-preserving mov whose source is an SSA value, with no
    /// relative or array addressing in the way.  With `allow_flags`
    /// unset, abs/neg/not modifiers on the source disqualify it too
    /// (used for output movs, where there is no consumer slot to carry
    /// the modifiers).
    fn is_eligible_mov(&self, i: InstrRef, allow_flags: bool) -> bool {
        let sh = &*self.sh;
        if !sh.is_same_type_mov(i) {
            return false;
        }

        let dst = sh[i].dsts[0];
        let src = sh[i].srcs[0];

        if sh.ssa_def(src).is_none() {
            return false;
        }

        if sh[dst].flags.contains(RegFlags::RELATIV) {
            return false;
        }
        if sh[src].flags.contains(RegFlags::RELATIV) {
            return false;
        }
        if sh[src].flags.contains(RegFlags::ARRAY) {
            return false;
        }

        if !allow_flags
            && sh[src].flags.intersects(
                RegFlags::FABS
                    | RegFlags::FNEG
                    | RegFlags::SABS
                    | RegFlags::SNEG
                    | RegFlags::BNOT,
            )
        {
            return false;
        }

        true
    }

    /// Recombines a consumer's operand flags with the flags of the mov
    /// source being folded in.  Negates need care so that double
    /// negation cancels and an existing abs absorbs a same-domain neg.
    fn combine_flags(&self, dstflags: &mut RegFlags, mov: InstrRef) {
        let sh = &*self.sh;
        let src_reg = sh[mov].srcs[0];
        let mut srcflags = sh[src_reg].flags;

        if dstflags.contains(RegFlags::FABS) {
            srcflags.remove(RegFlags::FNEG);
        }
        if dstflags.contains(RegFlags::SABS) {
            srcflags.remove(RegFlags::SNEG);
        }

        if srcflags.contains(RegFlags::FABS) {
            dstflags.insert(RegFlags::FABS);
        }
        if srcflags.contains(RegFlags::SABS) {
            dstflags.insert(RegFlags::SABS);
        }
        if srcflags.contains(RegFlags::FNEG) {
            dstflags.toggle(RegFlags::FNEG);
        }
        if srcflags.contains(RegFlags::SNEG) {
            dstflags.toggle(RegFlags::SNEG);
        }
        if srcflags.contains(RegFlags::BNOT) {
            dstflags.toggle(RegFlags::BNOT);
        }

        dstflags.remove(RegFlags::SSA | RegFlags::SHARED);
        *dstflags |= srcflags
            & (RegFlags::SSA
                | RegFlags::CONST
                | RegFlags::IMMED
                | RegFlags::RELATIV
                | RegFlags::ARRAY
                | RegFlags::SHARED);

        // abs of a known 0/1 boolean is a no-op
        if let Some(srcsrc) = sh.ssa_def(src_reg) {
            if sh[srcsrc].opc.is_bool() {
                dstflags.remove(RegFlags::SABS);
            }
        }
    }

    fn unuse(&mut self, i: InstrRef) {
        debug_assert!(self.use_count[i.idx()] > 0);
        self.use_count[i.idx()] -= 1;

        if self.use_count[i.idx()] == 0 {
            self.sh[i].barrier_class = BarrierMask::empty();
            self.sh[i].barrier_conflict = BarrierMask::empty();

            let block = self.sh[i].block;
            debug_assert!(!self.sh[block].keeps.contains(&i));
        }
    }

    /// Retries a failed immediate fold by parking the value in the
    /// constant file instead.  Pool exhaustion just abandons the fold.
    fn lower_immed(
        &mut self,
        instr: InstrRef,
        n: usize,
        reg: RegRef,
        new_flags: RegFlags,
    ) -> bool {
        if !self.lower_imm_to_const {
            return false;
        }
        if !new_flags.contains(RegFlags::IMMED) {
            return false;
        }

        let mut new_flags = new_flags;
        new_flags.remove(RegFlags::IMMED);
        new_flags.insert(RegFlags::CONST);

        if !self.sh.valid_flags(instr, n, new_flags) {
            return false;
        }

        let mut val = self.sh[reg].imm_u32();

        // Half constant slots only hold 32-bit values within float
        // opcodes, so widen the value back up.
        let opc = self.sh[instr].opc;
        let f_opcode = opc.is_float_alu() || opc.is_float_muladd();
        if f_opcode && new_flags.contains(RegFlags::HALF) {
            val = half_to_f32_bits(val as u16);
        }

        // abs/neg plus const has encoding restrictions, so evaluate them
        // into the value and drop the flags
        if new_flags.contains(RegFlags::SABS) {
            val = (val as i32).wrapping_abs() as u32;
            new_flags.remove(RegFlags::SABS);
        }
        if new_flags.contains(RegFlags::FABS) {
            val &= 0x7fff_ffff;
            new_flags.remove(RegFlags::FABS);
        }
        if new_flags.contains(RegFlags::SNEG) {
            val = (val as i32).wrapping_neg() as u32;
            new_flags.remove(RegFlags::SNEG);
        }
        if new_flags.contains(RegFlags::FNEG) {
            val ^= 0x8000_0000;
            new_flags.remove(RegFlags::FNEG);
        }

        let num = match self.sh.consts.find_imm(val) {
            Some(num) => num,
            None => match self.sh.consts.add_imm(val) {
                Some(num) => num,
                None => return false,
            },
        };

        let nr = self.sh.reg_clone(reg);
        self.sh[nr].num = num;
        self.sh[nr].flags = new_flags;
        self.sh[nr].value = RegValue::None;
        self.sh[nr].instr = instr;
        self.sh[instr].srcs[n] = nr;

        true
    }

    /// Tries moving source `n` (which wants `new_flags`) into slot
    /// `swap_n`.  The sources are pre-swapped so the flag check sees the
    /// final arrangement; an invalid swap is undone.
    fn try_swap_two_srcs(
        &mut self,
        instr: InstrRef,
        n: usize,
        new_flags: RegFlags,
        swap_n: usize,
    ) -> bool {
        self.sh[instr].srcs.swap(swap_n, n);

        let displaced = self.sh[instr].srcs[n];
        let displaced_flags = self.sh[displaced].flags;
        let valid_swap = self.sh.valid_flags(instr, swap_n, new_flags)
            && self.sh.valid_flags(instr, n, displaced_flags);

        if !valid_swap {
            self.sh[instr].srcs.swap(swap_n, n);
        } else {
            self.sh[instr].muladd_info_mut().swapped = true;
        }

        valid_swap
    }

    /// The middle source of the plain multiply-adds cannot reference the
    /// constant file, but the first two sources commute.  The
    /// sum-of-absolute-differences ops are three-source commutative, so
    /// for those the 2nd↔3rd and 1st/3rd↔2nd swaps are fair game too
    /// (only the 2nd source takes a negate).
    fn try_swap_muladd_srcs(
        &mut self,
        instr: InstrRef,
        n: usize,
        new_flags: RegFlags,
    ) -> bool {
        let opc = self.sh[instr].opc;
        if !(opc.is_mad() && n == 1) && !opc.is_sad() {
            return false;
        }

        // If a swap already happened, the original 2nd source was const
        // or immediate; swapping back cannot improve anything and would
        // ping-pong forever.
        if self.sh[instr].muladd_info().swapped {
            return false;
        }

        // These encodings have no immediate form, but an immediate can
        // ride along as a constant
        let mut new_flags = new_flags;
        if new_flags.contains(RegFlags::IMMED) {
            new_flags.remove(RegFlags::IMMED);
            new_flags.insert(RegFlags::CONST);
        }

        // If the fold failed for some reason other than a const-class
        // source, a swap will not help
        if !new_flags.intersects(
            RegFlags::CONST | RegFlags::SHARED | RegFlags::SNEG,
        ) {
            return false;
        }

        if n == 1 {
            if self.try_swap_two_srcs(instr, n, new_flags, 0) {
                return true;
            }
            if opc.is_sad() && self.try_swap_two_srcs(instr, n, new_flags, 2)
            {
                return true;
            }
        }

        opc.is_sad() && self.try_swap_two_srcs(instr, n, new_flags, 1)
    }

    /// Tries to fold the definition of source `n` into `instr`.  Handles
    /// the plain SSA case plus the immediate/constant collapses that
    /// replace the source with a non-SSA operand.
    fn reg_cp(&mut self, instr: InstrRef, reg: RegRef, n: usize) -> bool {
        let src = self.sh.ssa_def(reg).unwrap();

        if self.is_eligible_mov(src, true) {
            // simple case: an SSA-sourced mov, possibly with modifiers
            let src_reg = self.sh[src].srcs[0];
            let mut new_flags = self.sh[reg].flags;
            self.combine_flags(&mut new_flags, src);

            if self.sh.valid_flags(instr, n, new_flags) {
                if new_flags.contains(RegFlags::ARRAY) {
                    debug_assert!(
                        !self.sh[reg].flags.contains(RegFlags::ARRAY)
                    );
                    self.sh[reg].value = self.sh[src_reg].value;
                }
                let def = self.sh[src_reg].def;
                self.sh[reg].flags = new_flags;
                self.sh[reg].def = def;

                let (class, conflict) = (
                    self.sh[src].barrier_class,
                    self.sh[src].barrier_conflict,
                );
                self.sh[instr].barrier_class |= class;
                self.sh[instr].barrier_conflict |= conflict;

                self.unuse(src);
                if let Some(d) = def {
                    let di = self.sh[d].instr;
                    self.use_count[di.idx()] += 1;
                }

                return true;
            } else if self.try_swap_muladd_srcs(instr, n, new_flags) {
                return true;
            }
        } else if (self.sh.is_same_type_mov(src)
            || self.sh.is_const_mov(src))
            && self.sh[instr].opc.cat() != Category::Flow
        {
            // immediate/constant loads; these cannot collapse into
            // control flow and replace the operand outright
            let src_reg = self.sh[src].srcs[0];
            let mut new_flags = self.sh[reg].flags;

            if self.sh[src_reg].flags.contains(RegFlags::ARRAY) {
                return false;
            }

            self.combine_flags(&mut new_flags, src);

            if !self.sh.valid_flags(instr, n, new_flags) {
                // Maybe the value can live in the constant file instead
                if self.lower_immed(instr, n, src_reg, new_flags) {
                    self.unuse(src);
                    return true;
                }

                return self.try_swap_muladd_srcs(instr, n, new_flags);
            }

            if self.sh[src_reg].flags.contains(RegFlags::CONST) {
                if self.sh[src_reg].flags.contains(RegFlags::RELATIV) {
                    // one address register per instruction
                    let def = self.sh[reg].def.unwrap();
                    let def_instr = self.sh[def].instr;
                    let (a, b) =
                        (self.sh[instr].address, self.sh[def_instr].address);
                    if self.sh.address_conflicts(a, b) {
                        return false;
                    }
                }

                // Narrowing a constant works differently for float and
                // integer references, so the consumer has to match the
                // mov's destination type.
                let opc = self.sh[instr].opc;
                let src_dst_type = self.sh[src].mov_info().dst_type;
                if src_dst_type == Type::F16 {
                    if opc.is_meta() {
                        return false;
                    }
                    if opc == Opcode::Mov
                        && !self.sh[instr].mov_info().src_type.is_float()
                    {
                        return false;
                    }
                    if !opc.is_float_alu() && !opc.is_float_muladd() {
                        return false;
                    }
                } else if src_dst_type == Type::U16
                    || src_dst_type == Type::S16
                {
                    if opc.is_float_alu() || opc.is_float_muladd() {
                        return false;
                    }
                    if opc == Opcode::Mov
                        && self.sh[instr].mov_info().src_type.is_float()
                    {
                        return false;
                    }
                }

                let nr = self.sh.reg_clone(src_reg);
                self.sh[nr].flags = new_flags;
                self.sh[nr].instr = instr;
                self.sh[instr].srcs[n] = nr;

                if new_flags.contains(RegFlags::RELATIV) {
                    let def = self.sh[reg].def.unwrap();
                    let def_instr = self.sh[def].instr;
                    let addr_reg = self.sh[def_instr].address.unwrap();
                    let addr_instr = self.sh[addr_reg].instr;
                    self.sh.set_address(instr, addr_instr);
                }

                self.unuse(src);
                return true;
            }

            if self.sh[src_reg].flags.contains(RegFlags::IMMED) {
                let opc = self.sh[instr].opc;
                debug_assert!(
                    matches!(
                        opc.cat(),
                        Category::Move
                            | Category::Alu
                            | Category::Mem
                            | Category::Meta
                    ) || (opc.is_mad() && n == 0)
                        || (opc == Opcode::Isam && (n == 1 || n == 2))
                );

                let mut iim_val = self.sh[src_reg].imm_i32();

                if opc.cat() == Category::Alu && !opc.is_int_alu() {
                    // Float ALU immediates only exist as lookup-table
                    // indices
                    match self.sh.flut(src_reg) {
                        Some(idx) => iim_val = idx as i32,
                        None => {
                            if self.lower_immed(instr, n, src_reg, new_flags)
                            {
                                self.unuse(src);
                                return true;
                            }
                            return false;
                        }
                    }
                }

                if new_flags.contains(RegFlags::SABS) {
                    iim_val = iim_val.wrapping_abs();
                }
                if new_flags.contains(RegFlags::SNEG) {
                    iim_val = iim_val.wrapping_neg();
                }
                if new_flags.contains(RegFlags::BNOT) {
                    iim_val = !iim_val;
                }

                if self.sh.valid_flags(instr, n, new_flags)
                    && self.sh.valid_immediate(instr, iim_val)
                {
                    let mut nf = new_flags;
                    nf.remove(
                        RegFlags::SABS | RegFlags::SNEG | RegFlags::BNOT,
                    );
                    let nr = self.sh.reg_clone(src_reg);
                    self.sh[nr].flags = nf;
                    self.sh[nr].set_imm_i32(iim_val);
                    self.sh[nr].instr = instr;
                    self.sh[instr].srcs[n] = nr;

                    self.unuse(src);
                    return true;
                } else if self.lower_immed(instr, n, src_reg, new_flags) {
                    self.unuse(src);
                    return true;
                }
                return false;
            }
        }

        false
    }

    /// Output movs sitting in a keeps list have no consumer slot to fold
    /// into, but a plain one can be bypassed by re-pointing the keep at
    /// its source.
    fn eliminate_output_mov(&mut self, i: InstrRef) -> InstrRef {
        if self.is_eligible_mov(i, false) {
            let reg = self.sh[i].srcs[0];
            if !self.sh[reg].flags.contains(RegFlags::ARRAY) {
                let src_instr = self.sh.ssa_def(reg).unwrap();
                self.progress = true;
                return src_instr;
            }
        }
        i
    }

    /// Post-order walk: fold each source's definition before looking at
    /// the definition's own consumers.  A successful fold restarts the
    /// scan, since the remaining sources may have changed.
    fn instr_cp(&mut self, instr: InstrRef) {
        if self.sh[instr].srcs.is_empty() {
            return;
        }

        if self.sh.instr_check_mark(instr) {
            return;
        }

        loop {
            let mut progress = false;
            for n in 0..self.sh[instr].srcs.len() {
                let reg = self.sh[instr].srcs[n];
                let Some(src) = self.sh.ssa_def(reg) else {
                    continue;
                };

                self.instr_cp(src);

                // Relative array reads stay put; only phis see through
                // them
                if self.sh[reg].flags.contains(RegFlags::ARRAY)
                    && self.sh[src].opc != Opcode::MetaPhi
                {
                    continue;
                }

                // Folding absneg into meta instructions would hide the
                // modifier from the encoder
                if self.sh[instr].opc.is_meta()
                    && matches!(
                        self.sh[src].opc,
                        Opcode::AbsnegF | Opcode::AbsnegS
                    )
                {
                    continue;
                }

                // Address-register writers never collapse into users
                if self.sh.writes_addr0(src) || self.sh.writes_addr1(src) {
                    continue;
                }

                let p = self.reg_cp(instr, reg, n);
                if p {
                    trace!(
                        "cp: folded src{} of {}",
                        n,
                        InstrDisp(&*self.sh, instr)
                    );
                }
                progress |= p;
                self.progress |= p;
            }
            if !progress {
                break;
            }
        }

        // Folding can leave a type-converting mov of an immediate.
        // Rewriting the value in place to the destination width turns it
        // into a same-type mov, unlocking further propagation.  Only the
        // unsigned family shows up here.
        if self.sh[instr].opc == Opcode::Mov {
            let src0 = self.sh[instr].srcs[0];
            if self.sh[src0].flags.contains(RegFlags::IMMED) {
                let info = self.sh[instr].mov_info();
                let (src_type, dst_type) = (info.src_type, info.dst_type);
                if src_type != dst_type
                    && src_type.full() == Type::U32
                    && dst_type.full() == Type::U32
                {
                    let mut val = self.sh[src0].imm_u32();
                    if dst_type == Type::U16 {
                        val &= 0xffff;
                    }
                    self.sh[src0].set_imm_u32(val);

                    let dst = self.sh[instr].dsts[0];
                    if self.sh[dst].flags.contains(RegFlags::HALF) {
                        self.sh[src0].flags.insert(RegFlags::HALF);
                    } else {
                        self.sh[src0].flags.remove(RegFlags::HALF);
                    }
                    self.sh[instr].mov_info_mut().src_type = dst_type;
                    self.progress = true;
                }
            }
        }

        // A sample taking its sampler/texture indices through a register
        // collapses to the immediate-index encoding once both indices
        // turn out to be small immediates, dropping the collect
        // entirely.
        if self.sh[instr].opc.is_tex()
            && self.sh[instr].flags.contains(InstrFlags::S2EN)
            && !self.sh[instr].flags.contains(InstrFlags::BINDLESS)
        {
            let samp_tex_src = self.sh[instr].srcs[0];
            if let Some(samp_tex) = self.sh.ssa_def(samp_tex_src) {
                debug_assert_eq!(
                    self.sh[samp_tex].opc,
                    Opcode::MetaCollect
                );

                let tex = self.sh[samp_tex].srcs[0];
                let samp = self.sh[samp_tex].srcs[1];

                if self.sh[tex].flags.contains(RegFlags::IMMED)
                    && self.sh[samp].flags.contains(RegFlags::IMMED)
                    && self.sh[tex].imm_u32() < 16
                    && self.sh[samp].imm_u32() < 16
                {
                    let (t, s) =
                        (self.sh[tex].imm_u32(), self.sh[samp].imm_u32());
                    self.sh[instr].flags.remove(InstrFlags::S2EN);
                    {
                        let info = self.sh[instr].tex_info_mut();
                        info.tex = t as u16;
                        info.samp = s as u16;
                    }
                    self.sh[instr].srcs.remove(0);

                    self.unuse(samp_tex);
                    self.progress = true;
                }
            }
        }
    }
}

impl Shader {
    /// One round of copy propagation.  Returns whether anything folded;
    /// the caller reruns to a fixed point.
    pub fn opt_copy_prop(&mut self, lower_imm_to_const: bool) -> bool {
        let mut use_count = vec![0_u32; self.num_instrs()];

        // Count consumers first so we can tell when a mov loses its last
        // one.  False deps are not accounted for, so this pass has to
        // run before any are inserted.
        for b in self.block_refs() {
            for ii in 0..self[b].instrs.len() {
                let i = self[b].instrs[ii];
                debug_assert!(self[i].deps.is_empty());
                for n in 0..self[i].srcs.len() {
                    let reg = self[i].srcs[n];
                    if let Some(d) = self.ssa_def(reg) {
                        use_count[d.idx()] += 1;
                    }
                }
            }
        }

        self.clear_marks();

        let mut pass = CopyPropPass {
            sh: self,
            progress: false,
            lower_imm_to_const,
            use_count,
        };

        for b in pass.sh.block_refs() {
            if let Some(term) = pass.sh.block_terminator(b) {
                pass.instr_cp(term);
            }

            for k in 0..pass.sh[b].keeps.len() {
                let keep = pass.sh[b].keeps[k];
                pass.instr_cp(keep);
                let keep = pass.eliminate_output_mov(keep);
                pass.sh[b].keeps[k] = keep;
            }
        }

        pass.progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mov_imm(sh: &mut Shader, b: BlockRef, ty: Type, val: u32) -> InstrRef {
        let m = sh.instr_create(b, Opcode::Mov);
        {
            let info = sh[m].mov_info_mut();
            info.src_type = ty;
            info.dst_type = ty;
        }
        sh.dst_create(m, INVALID_REG, RegFlags::SSA);
        sh.src_imm(m, val, RegFlags::empty());
        m
    }

    fn producer(sh: &mut Shader, b: BlockRef) -> InstrRef {
        let p = sh.instr_create(b, Opcode::AddF);
        sh.dst_create(p, INVALID_REG, RegFlags::SSA);
        sh.src_create(p, regid(0, 0), RegFlags::empty());
        sh.src_create(p, regid(0, 1), RegFlags::empty());
        p
    }

    #[test]
    fn test_immediate_fold() {
        let mut sh = Shader::new(ShaderStage::Vertex);
        let b = sh.block_create();

        let m = mov_imm(&mut sh, b, Type::U32, 5);
        sh[m].barrier_class = BarrierMask::BUFFER_R;

        let add = sh.instr_create(b, Opcode::AddU);
        sh.dst_create(add, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(add, m, RegFlags::empty());
        sh.src_create(add, regid(0, 2), RegFlags::empty());

        let end = sh.instr_create(b, Opcode::End);
        sh.src_ssa(end, add, RegFlags::empty());

        let count_before = sh[b].instrs.len();
        assert!(sh.opt_copy_prop(true));

        let s0 = sh[add].srcs[0];
        assert!(sh[s0].flags.contains(RegFlags::IMMED));
        assert_eq!(sh[s0].imm_u32(), 5);
        // the mov lost its last consumer, so its side-effect tracking
        // state is gone too
        assert!(sh[m].barrier_class.is_empty());
        // folds never add instructions
        assert_eq!(sh[b].instrs.len(), count_before);
    }

    #[test]
    fn test_relative_const_fold_carries_address() {
        let mut sh = Shader::new(ShaderStage::Vertex);
        let b = sh.block_create();

        // a0.x = ...
        let addr = sh.instr_create(b, Opcode::Mov);
        {
            let info = sh[addr].mov_info_mut();
            info.src_type = Type::S32;
            info.dst_type = Type::S32;
        }
        sh.dst_create(addr, REG_A0, RegFlags::empty());
        sh.src_create(addr, regid(0, 0), RegFlags::empty());

        // mov of c<a0.x + 8>
        let cmov = sh.instr_create(b, Opcode::Mov);
        sh.dst_create(cmov, INVALID_REG, RegFlags::SSA);
        let crel = sh.src_const(cmov, regid(8, 0), RegFlags::RELATIV);
        sh[crel].value = RegValue::Array(ArrayAccess {
            id: 0,
            offset: 8,
            base: 0,
        });
        sh.set_address(cmov, addr);

        let add = sh.instr_create(b, Opcode::AddF);
        sh.dst_create(add, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(add, cmov, RegFlags::empty());
        sh.src_create(add, regid(0, 1), RegFlags::empty());

        let end = sh.instr_create(b, Opcode::End);
        sh.src_ssa(end, add, RegFlags::empty());

        assert!(sh.opt_copy_prop(true));

        // the consumer reads the relative constant directly and picked
        // up the address-register dependency
        let s0 = sh[add].srcs[0];
        assert!(sh[s0]
            .flags
            .contains(RegFlags::CONST | RegFlags::RELATIV));
        assert_eq!(sh[s0].array().offset, 8);
        let addr_dst = sh[addr].dsts[0];
        assert_eq!(sh[add].address, Some(addr_dst));
        assert!(sh.addr0_users.contains(&add));
    }

    #[test]
    fn test_negate_cancellation() {
        let mut sh = Shader::new(ShaderStage::Vertex);
        let b = sh.block_create();

        let x = producer(&mut sh, b);
        let x_dst = sh[x].dsts[0];

        let a = sh.instr_create(b, Opcode::AbsnegF);
        sh.dst_create(a, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(a, x, RegFlags::FNEG);

        let bmov = sh.instr_create(b, Opcode::Mov);
        sh.dst_create(bmov, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(bmov, a, RegFlags::empty());

        let c = sh.instr_create(b, Opcode::MulF);
        sh.dst_create(c, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(c, bmov, RegFlags::FNEG);
        sh.src_create(c, regid(0, 2), RegFlags::empty());

        let end = sh.instr_create(b, Opcode::End);
        sh.src_ssa(end, c, RegFlags::empty());

        assert!(sh.opt_copy_prop(true));

        // the two negates cancel and the consumer reads x directly
        let s0 = sh[c].srcs[0];
        assert_eq!(sh[s0].def, Some(x_dst));
        assert!(!sh[s0].flags.contains(RegFlags::FNEG));
    }

    #[test]
    fn test_flag_algebra() {
        let dst_cases = [
            RegFlags::empty(),
            RegFlags::FABS,
            RegFlags::FNEG,
            RegFlags::FABS.union(RegFlags::FNEG),
        ];
        let src_cases =
            [RegFlags::empty(), RegFlags::FABS, RegFlags::FNEG];

        for df in dst_cases {
            for sf in src_cases {
                let mut sh = Shader::new(ShaderStage::Vertex);
                let b = sh.block_create();

                let x = producer(&mut sh, b);
                let x_dst = sh[x].dsts[0];

                let m = sh.instr_create(b, Opcode::AbsnegF);
                sh.dst_create(m, INVALID_REG, RegFlags::SSA);
                sh.src_ssa(m, x, sf);

                let c = sh.instr_create(b, Opcode::MulF);
                sh.dst_create(c, INVALID_REG, RegFlags::SSA);
                sh.src_ssa(c, m, df);
                sh.src_create(c, regid(0, 2), RegFlags::empty());

                let end = sh.instr_create(b, Opcode::End);
                sh.src_ssa(end, c, RegFlags::empty());

                assert!(sh.opt_copy_prop(true));

                // closed form: an existing abs absorbs the incoming
                // negate, abs ORs, neg XORs
                let mut sf2 = sf;
                if df.contains(RegFlags::FABS) {
                    sf2.remove(RegFlags::FNEG);
                }
                let mut expect = df;
                if sf2.contains(RegFlags::FABS) {
                    expect.insert(RegFlags::FABS);
                }
                if sf2.contains(RegFlags::FNEG) {
                    expect.toggle(RegFlags::FNEG);
                }

                let s0 = sh[c].srcs[0];
                assert_eq!(sh[s0].def, Some(x_dst));
                assert_eq!(
                    sh[s0].flags & (RegFlags::FABS | RegFlags::FNEG),
                    expect,
                    "dst {:?} src {:?}",
                    df,
                    sf
                );
            }
        }
    }

    #[test]
    fn test_abs_of_bool_dropped() {
        let mut sh = Shader::new(ShaderStage::Vertex);
        let b = sh.block_create();

        let cmp = sh.instr_create(b, Opcode::CmpsF);
        sh.dst_create(cmp, INVALID_REG, RegFlags::SSA);
        sh.src_create(cmp, regid(0, 0), RegFlags::empty());
        sh.src_create(cmp, regid(0, 1), RegFlags::empty());
        let cmp_dst = sh[cmp].dsts[0];

        let m = sh.instr_create(b, Opcode::AbsnegS);
        sh.dst_create(m, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(m, cmp, RegFlags::SABS);

        let c = sh.instr_create(b, Opcode::AddU);
        sh.dst_create(c, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(c, m, RegFlags::empty());
        sh.src_create(c, regid(0, 2), RegFlags::empty());

        let end = sh.instr_create(b, Opcode::End);
        sh.src_ssa(end, c, RegFlags::empty());

        assert!(sh.opt_copy_prop(true));

        // a comparison result is already 0/1, abs is a no-op
        let s0 = sh[c].srcs[0];
        assert_eq!(sh[s0].def, Some(cmp_dst));
        assert!(!sh[s0].flags.contains(RegFlags::SABS));
    }

    #[test]
    fn test_idempotence() {
        let mut sh = Shader::new(ShaderStage::Vertex);
        let b = sh.block_create();

        let x = producer(&mut sh, b);
        let m = sh.instr_create(b, Opcode::Mov);
        sh.dst_create(m, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(m, x, RegFlags::empty());
        let c = sh.instr_create(b, Opcode::MulF);
        sh.dst_create(c, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(c, m, RegFlags::empty());
        sh.src_create(c, regid(0, 2), RegFlags::empty());
        let end = sh.instr_create(b, Opcode::End);
        sh.src_ssa(end, c, RegFlags::empty());

        assert!(sh.opt_copy_prop(true));
        assert!(!sh.opt_copy_prop(true));
    }

    #[test]
    fn test_lower_immed_to_const_and_reuse() {
        let mut sh = Shader::new(ShaderStage::Vertex);
        let b = sh.block_create();

        // 0.3 is not in the float lookup table, so the immediate has to
        // go through the constant file
        let bits = 0.3_f32.to_bits();
        let m1 = mov_imm(&mut sh, b, Type::F32, bits);
        let a1 = sh.instr_create(b, Opcode::AddF);
        sh.dst_create(a1, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(a1, m1, RegFlags::empty());
        sh.src_create(a1, regid(0, 0), RegFlags::empty());

        let m2 = mov_imm(&mut sh, b, Type::F32, bits);
        let a2 = sh.instr_create(b, Opcode::AddF);
        sh.dst_create(a2, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(a2, m2, RegFlags::empty());
        sh.src_create(a2, regid(0, 1), RegFlags::empty());

        let end = sh.instr_create(b, Opcode::End);
        sh.src_ssa(end, a1, RegFlags::empty());
        sh.src_ssa(end, a2, RegFlags::empty());

        assert!(sh.opt_copy_prop(true));

        let s1 = sh[a1].srcs[0];
        let s2 = sh[a2].srcs[0];
        assert!(sh[s1].flags.contains(RegFlags::CONST));
        assert!(sh[s2].flags.contains(RegFlags::CONST));
        // deduplicated by value
        assert_eq!(sh[s1].num, sh[s2].num);
        assert_eq!(sh.consts.len(), 1);
    }

    #[test]
    fn test_flut_immediate_stays_inline() {
        let mut sh = Shader::new(ShaderStage::Vertex);
        let b = sh.block_create();

        let m = mov_imm(&mut sh, b, Type::F32, 1.0_f32.to_bits());
        let a = sh.instr_create(b, Opcode::AddF);
        sh.dst_create(a, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(a, m, RegFlags::empty());
        sh.src_create(a, regid(0, 0), RegFlags::empty());
        let end = sh.instr_create(b, Opcode::End);
        sh.src_ssa(end, a, RegFlags::empty());

        assert!(sh.opt_copy_prop(true));

        // 1.0 is lookup-table entry 2; no constant slot gets burned
        let s0 = sh[a].srcs[0];
        assert!(sh[s0].flags.contains(RegFlags::IMMED));
        assert_eq!(sh[s0].imm_u32(), 2);
        assert_eq!(sh.consts.len(), 0);
    }

    #[test]
    fn test_muladd_swap_for_const() {
        let mut sh = Shader::new(ShaderStage::Vertex);
        let b = sh.block_create();

        let cmov = sh.instr_create(b, Opcode::Mov);
        sh.dst_create(cmov, INVALID_REG, RegFlags::SSA);
        sh.src_const(cmov, regid(4, 0), RegFlags::empty());

        let mad = sh.instr_create(b, Opcode::MadF32);
        sh.dst_create(mad, INVALID_REG, RegFlags::SSA);
        sh.src_create(mad, regid(1, 0), RegFlags::empty());
        sh.src_ssa(mad, cmov, RegFlags::empty());
        sh.src_create(mad, regid(2, 0), RegFlags::empty());

        let end = sh.instr_create(b, Opcode::End);
        sh.src_ssa(end, mad, RegFlags::empty());

        assert!(sh.opt_copy_prop(true));

        // the const cannot sit in the middle slot, but the first two
        // sources commute
        assert!(sh[mad].muladd_info().swapped);
        let s0 = sh[mad].srcs[0];
        assert!(sh[s0].flags.contains(RegFlags::CONST));
        assert_eq!(sh[s0].num, regid(4, 0));
        let s1 = sh[mad].srcs[1];
        assert_eq!(sh[s1].num, regid(1, 0));
    }

    #[test]
    fn test_sample_index_collapse() {
        let mut sh = Shader::new(ShaderStage::Vertex);
        let b = sh.block_create();

        let tmov = mov_imm(&mut sh, b, Type::U32, 5);
        let smov = mov_imm(&mut sh, b, Type::U32, 3);

        let col = sh.instr_create(b, Opcode::MetaCollect);
        sh.dst_create(col, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(col, tmov, RegFlags::empty());
        sh.src_ssa(col, smov, RegFlags::empty());

        let sam = sh.instr_create(b, Opcode::Sam);
        sh[sam].flags.insert(InstrFlags::S2EN);
        sh.dst_create(sam, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(sam, col, RegFlags::empty());
        sh.src_create(sam, regid(0, 0), RegFlags::empty());
        sh[b].keeps.push(sam);

        sh.instr_create(b, Opcode::End);

        assert!(sh.opt_copy_prop(true));

        // both indices were small immediates, so the sample switched to
        // the immediate-index encoding and dropped the collect
        assert!(!sh[sam].flags.contains(InstrFlags::S2EN));
        assert_eq!(sh[sam].tex_info().tex, 5);
        assert_eq!(sh[sam].tex_info().samp, 3);
        assert_eq!(sh[sam].srcs.len(), 1);
    }

    #[test]
    fn test_mov_into_flow_not_const_folded() {
        let mut sh = Shader::new(ShaderStage::Vertex);
        let b = sh.block_create();

        let m = mov_imm(&mut sh, b, Type::U32, 7);
        let end = sh.instr_create(b, Opcode::End);
        sh.src_ssa(end, m, RegFlags::empty());

        // immediates never collapse into control flow
        assert!(!sh.opt_copy_prop(true));
        let s0 = sh[end].srcs[0];
        assert!(sh[s0].flags.contains(RegFlags::SSA));
    }

    #[test]
    fn test_output_mov_elimination() {
        let mut sh = Shader::new(ShaderStage::Vertex);
        let b = sh.block_create();

        let st = sh.instr_create(b, Opcode::Stg);
        sh.src_create(st, regid(1, 0), RegFlags::empty());

        let x = producer(&mut sh, b);
        let m = sh.instr_create(b, Opcode::Mov);
        sh.dst_create(m, INVALID_REG, RegFlags::SSA);
        sh.src_ssa(m, x, RegFlags::empty());
        sh[b].keeps.push(m);
        let _ = st;

        sh.instr_create(b, Opcode::End);

        assert!(sh.opt_copy_prop(true));
        assert_eq!(sh[b].keeps.last(), Some(&x));
    }
}
