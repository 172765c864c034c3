// Copyright © 2025 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! Cursor-based instruction insertion.
//!
//! A [`Cursor`] names one of four positions in the program; everything
//! that inserts or moves instructions goes through one, so passes never
//! touch block instruction lists directly.

use crate::ir::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    BeforeBlock(BlockRef),
    AfterBlock(BlockRef),
    BeforeInstr(InstrRef),
    AfterInstr(InstrRef),
}

impl Cursor {
    pub fn block(&self, sh: &Shader) -> BlockRef {
        match *self {
            Cursor::BeforeBlock(b) | Cursor::AfterBlock(b) => b,
            Cursor::BeforeInstr(i) | Cursor::AfterInstr(i) => sh[i].block,
        }
    }

    /// The index in the block's instruction list a new instruction would
    /// be inserted at.
    fn pos(&self, sh: &Shader) -> usize {
        match *self {
            Cursor::BeforeBlock(_) => 0,
            Cursor::AfterBlock(b) => sh[b].instrs.len(),
            Cursor::BeforeInstr(i) => sh.instr_pos(i),
            Cursor::AfterInstr(i) => sh.instr_pos(i) + 1,
        }
    }
}

/// A cursor that advances past each instruction it inserts, so a sequence
/// of inserts comes out in program order.
#[derive(Debug, Clone, Copy)]
pub struct Builder {
    pub cursor: Cursor,
}

impl Builder {
    pub fn new(cursor: Cursor) -> Builder {
        Builder { cursor }
    }

    pub fn before_instr(i: InstrRef) -> Builder {
        Builder::new(Cursor::BeforeInstr(i))
    }

    pub fn after_instr(i: InstrRef) -> Builder {
        Builder::new(Cursor::AfterInstr(i))
    }

    pub fn at_block_start(b: BlockRef) -> Builder {
        Builder::new(Cursor::BeforeBlock(b))
    }

    pub fn at_block_end(b: BlockRef) -> Builder {
        Builder::new(Cursor::AfterBlock(b))
    }

    pub fn build_instr(&mut self, sh: &mut Shader, opc: Opcode) -> InstrRef {
        let i = sh.instr_create_at(self.cursor, opc);
        self.cursor = Cursor::AfterInstr(i);
        i
    }
}

impl Shader {
    /// Creates an instruction at the position named by `cursor`.
    pub fn instr_create_at(
        &mut self,
        cursor: Cursor,
        opc: Opcode,
    ) -> InstrRef {
        let block = cursor.block(self);
        let pos = cursor.pos(self);
        let i = self.instr_create(block, opc);
        // instr_create appends; put it where the cursor wants it
        let moved = self[block].instrs.pop().unwrap();
        debug_assert_eq!(moved, i);
        self[block].instrs.insert(pos, i);
        i
    }

    /// Moves `i` to the position named by `cursor`, which may be in a
    /// different block.
    pub fn instr_move_to(&mut self, i: InstrRef, cursor: Cursor) {
        let block = cursor.block(self);
        self.instr_unlink(i);
        let pos = cursor.pos(self);
        self[block].instrs.insert(pos, i);
        self[i].block = block;
    }

    pub fn instr_move_before(&mut self, i: InstrRef, before: InstrRef) {
        self.instr_move_to(i, Cursor::BeforeInstr(before));
    }

    pub fn instr_move_after(&mut self, i: InstrRef, after: InstrRef) {
        self.instr_move_to(i, Cursor::AfterInstr(after));
    }
}
