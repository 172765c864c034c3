// Copyright © 2025 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! Dense per-register-file tables for hazard tracking.
//!
//! Entries are in half-register slots so half and full aliases of the
//! same location land on the same entries, see [`reg_file_offset`].

use crate::ir::*;

/// One table per disjoint hazard file: full-precision GPRs,
/// half-precision GPRs (only used when the files are split), shared
/// registers, and the small non-GPR space (a0/p0).
pub struct RegTracker<T> {
    full: Vec<T>,
    half: Vec<T>,
    shared: Vec<T>,
    nongpr: Vec<T>,
}

impl<T> RegTracker<T> {
    pub fn new_with(f: &impl Fn() -> T) -> Self {
        Self {
            full: (0..2 * usize::from(GPR_REG_SIZE)).map(|_| f()).collect(),
            half: (0..usize::from(GPR_REG_SIZE)).map(|_| f()).collect(),
            shared: (0..2 * usize::from(SHARED_REG_SIZE))
                .map(|_| f())
                .collect(),
            nongpr: (0..2 * usize::from(NONGPR_REG_SIZE))
                .map(|_| f())
                .collect(),
        }
    }

    pub fn file(&self, file: RegFile) -> &[T] {
        match file {
            RegFile::Full => &self.full,
            RegFile::Half => &self.half,
            RegFile::Shared => &self.shared,
            RegFile::NonGpr => &self.nongpr,
        }
    }

    pub fn file_mut(&mut self, file: RegFile) -> &mut [T] {
        match file {
            RegFile::Full => &mut self.full,
            RegFile::Half => &mut self.half,
            RegFile::Shared => &mut self.shared,
            RegFile::NonGpr => &mut self.nongpr,
        }
    }

    /// Runs `f` over the slots covered by one element of `reg` at
    /// register number `num` (`reg` itself only contributes its flags).
    pub fn for_each_elem_slot_mut(
        &mut self,
        sh: &Shader,
        reg: RegRef,
        num: u16,
        merged: bool,
        mut f: impl FnMut(&mut T),
    ) {
        let r = &sh[reg];
        let size = r.elem_size();
        let (file, offset) = reg_file_offset(r, num, merged);
        for slot in &mut self.file_mut(file)[offset..offset + size] {
            f(slot);
        }
    }

    /// Runs `f(src_n, slot)` over every register slot read by `instr`,
    /// skipping operands that never occupy the register files.
    pub fn for_each_instr_src_mut(
        &mut self,
        sh: &Shader,
        instr: InstrRef,
        merged: bool,
        mut f: impl FnMut(usize, &mut T),
    ) {
        for n in 0..sh[instr].srcs.len() {
            let reg = sh[instr].srcs[n];
            let r = &sh[reg];
            if r.flags.intersects(
                RegFlags::CONST | RegFlags::IMMED | RegFlags::DUMMY,
            ) {
                continue;
            }
            if r.flags.contains(RegFlags::RELATIV) {
                // A relative access may hit anything in the array
                let base = r.array().base;
                for j in 0..r.size {
                    self.for_each_elem_slot_mut(sh, reg, base + j, merged, |t| {
                        f(n, t)
                    });
                }
            } else {
                let (num, wrmask) = (r.num, r.wrmask);
                for b in 0..16 {
                    if wrmask & (1 << b) == 0 {
                        continue;
                    }
                    self.for_each_elem_slot_mut(sh, reg, num + b, merged, |t| {
                        f(n, t)
                    });
                }
            }
        }
    }

    /// Runs `f(dst_n, slot)` over every register slot written by `instr`.
    pub fn for_each_instr_dst_mut(
        &mut self,
        sh: &Shader,
        instr: InstrRef,
        merged: bool,
        mut f: impl FnMut(usize, &mut T),
    ) {
        for n in 0..sh[instr].dsts.len() {
            let reg = sh[instr].dsts[n];
            let r = &sh[reg];
            if r.wrmask == 0 {
                continue;
            }
            if r.flags.intersects(
                RegFlags::CONST | RegFlags::IMMED | RegFlags::DUMMY,
            ) {
                continue;
            }
            if r.flags.contains(RegFlags::RELATIV) {
                let base = r.array().base;
                for j in 0..r.size {
                    self.for_each_elem_slot_mut(sh, reg, base + j, merged, |t| {
                        f(n, t)
                    });
                }
            } else {
                let (num, wrmask) = (r.num, r.wrmask);
                for b in 0..16 {
                    if wrmask & (1 << b) == 0 {
                        continue;
                    }
                    self.for_each_elem_slot_mut(sh, reg, num + b, merged, |t| {
                        f(n, t)
                    });
                }
            }
        }
    }
}

impl<T> RegTracker<T> {
    fn for_each_elem_slot(
        &self,
        sh: &Shader,
        reg: RegRef,
        num: u16,
        merged: bool,
        mut f: impl FnMut(&T),
    ) {
        let r = &sh[reg];
        let size = r.elem_size();
        let (file, offset) = reg_file_offset(r, num, merged);
        for slot in &self.file(file)[offset..offset + size] {
            f(slot);
        }
    }

    fn for_each_operand_slot(
        &self,
        sh: &Shader,
        reg: RegRef,
        merged: bool,
        mut f: impl FnMut(&T),
    ) {
        let r = &sh[reg];
        if r.flags.intersects(
            RegFlags::CONST | RegFlags::IMMED | RegFlags::DUMMY,
        ) {
            return;
        }
        if r.flags.contains(RegFlags::RELATIV) {
            let base = r.array().base;
            for j in 0..r.size {
                self.for_each_elem_slot(sh, reg, base + j, merged, &mut f);
            }
        } else {
            for b in 0..16 {
                if r.wrmask & (1 << b) == 0 {
                    continue;
                }
                self.for_each_elem_slot(sh, reg, r.num + b, merged, &mut f);
            }
        }
    }

    /// Read-only walk over every register slot read by `instr`.
    pub fn for_each_instr_src(
        &self,
        sh: &Shader,
        instr: InstrRef,
        merged: bool,
        mut f: impl FnMut(usize, &T),
    ) {
        for n in 0..sh[instr].srcs.len() {
            let reg = sh[instr].srcs[n];
            self.for_each_operand_slot(sh, reg, merged, |t| f(n, t));
        }
    }

    /// Read-only walk over every register slot written by `instr`.
    pub fn for_each_instr_dst(
        &self,
        sh: &Shader,
        instr: InstrRef,
        merged: bool,
        mut f: impl FnMut(usize, &T),
    ) {
        for n in 0..sh[instr].dsts.len() {
            let reg = sh[instr].dsts[n];
            if sh[reg].wrmask == 0 {
                continue;
            }
            self.for_each_operand_slot(sh, reg, merged, |t| f(n, t));
        }
    }
}

impl<T: Clone> Clone for RegTracker<T> {
    fn clone(&self) -> Self {
        Self {
            full: self.full.clone(),
            half: self.half.clone(),
            shared: self.shared.clone(),
            nongpr: self.nongpr.clone(),
        }
    }
}

impl<T: Clone> RegTracker<T> {
    /// Resets every slot in every file.
    pub fn fill(&mut self, val: T) {
        for slot in self
            .full
            .iter_mut()
            .chain(self.half.iter_mut())
            .chain(self.shared.iter_mut())
            .chain(self.nongpr.iter_mut())
        {
            *slot = val.clone();
        }
    }
}

impl<T> RegTracker<T> {
    /// Componentwise merge with another tracker's entries.
    pub fn zip_apply(&mut self, other: &Self, mut f: impl FnMut(&mut T, &T)) {
        for (a, b) in self.full.iter_mut().zip(other.full.iter()) {
            f(a, b);
        }
        for (a, b) in self.half.iter_mut().zip(other.half.iter()) {
            f(a, b);
        }
        for (a, b) in self.shared.iter_mut().zip(other.shared.iter()) {
            f(a, b);
        }
        for (a, b) in self.nongpr.iter_mut().zip(other.nongpr.iter()) {
            f(a, b);
        }
    }
}
