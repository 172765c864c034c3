// Copyright © 2025 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! The Mako backend IR.
//!
//! A [`Shader`] owns two arenas, one of [`Instr`]s and one of [`Register`]s,
//! addressed by [`InstrRef`]/[`RegRef`] indices.  Blocks hold their
//! instructions as ordered lists of `InstrRef`, so structural mutation is
//! index surgery on a `Vec` rather than pointer splicing.  All cross
//! references in the IR (SSA def links, tied operands, false dependencies)
//! are arena indices as well and therefore stay valid across clones and
//! moves.

use crate::util::half_to_f32_bits;
use bitflags::bitflags;
use smallvec::SmallVec;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrRef(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegRef(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRef(u32);

impl InstrRef {
    pub fn idx(&self) -> usize {
        self.0 as usize
    }
}

impl RegRef {
    pub fn idx(&self) -> usize {
        self.0 as usize
    }
}

impl BlockRef {
    pub fn idx(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

// r0.x-r47.w are the general-purpose file, r48.x-r55.w are shared registers
// and everything above is the non-GPR space (a0, p0) that RA never assigns.
// Register numbers are (N << 2) | comp.
pub const GPR_REG_SIZE: u16 = 4 * 48;
pub const SHARED_REG_START: u16 = GPR_REG_SIZE;
pub const SHARED_REG_SIZE: u16 = 4 * 8;
pub const NONGPR_REG_START: u16 = SHARED_REG_START + SHARED_REG_SIZE;
pub const NONGPR_REG_SIZE: u16 = 4 * 8;

pub const fn regid(base: u16, comp: u16) -> u16 {
    (base << 2) | comp
}

pub const REG_A0: u16 = NONGPR_REG_START;
pub const REG_A1: u16 = NONGPR_REG_START + 1;
pub const REG_P0: u16 = regid((NONGPR_REG_START >> 2) + 1, 0);

pub const INVALID_REG: u16 = u16::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RegFlags: u32 {
        const CONST = 1 << 0;
        const IMMED = 1 << 1;
        const HALF = 1 << 2;
        /// Shared registers read the same value in every thread and may
        /// only be written while a single thread is active.
        const SHARED = 1 << 3;
        const RELATIV = 1 << 4;
        /// Float and integer abs/neg are separate operations on the
        /// hardware, and for bitwise ops the "negate" is a bitwise not, so
        /// all five get their own flag.
        const FNEG = 1 << 5;
        const FABS = 1 << 6;
        const SNEG = 1 << 7;
        const SABS = 1 << 8;
        const BNOT = 1 << 9;
        /// End-of-input marker, set on the last varying fetch.
        const EI = 1 << 10;
        /// `def` points at the assigning destination register.
        const SSA = 1 << 11;
        const ARRAY = 1 << 12;
        /// The SSA value dies after this use.
        const KILL = 1 << 13;
        /// Like KILL, but only set on the first of multiple uses in one
        /// instruction.
        const FIRST_KILL = 1 << 14;
        /// A destination with no consumers.
        const UNUSED = 1 << 15;
        /// The destination is (potentially) written before all sources are
        /// read and interferes with them.
        const EARLY_CLOBBER = 1 << 16;
        /// Post-RA marker for the last read of a physical register.
        const LAST_USE = 1 << 17;
        /// Predicate register (p0.c).
        const PREDICATE = 1 << 18;
        /// Placeholder operand that every pass must ignore.
        const DUMMY = 1 << 19;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstrFlags: u32 {
        /// Stall until outstanding texture/memory results have landed.
        const SY = 1 << 0;
        /// Stall until outstanding special-function results have landed.
        const SS = 1 << 1;
        /// Jump target.
        const JP = 1 << 2;
        const SAT = 1 << 3;
        /// Sampler/texture indices come in through a register operand.
        const S2EN = 1 << 4;
        const BINDLESS = 1 << 5;
        const NONUNIF = 1 << 6;
        /// Per-pass visit marker, see [`Shader::clear_marks`].
        const MARK = 1 << 7;
        /// Set on instructions removed from their block but still
        /// referenced through false-dependency lists.
        const UNUSED = 1 << 8;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BarrierMask: u32 {
        const EVERYTHING = 1 << 0;
        const SHARED_R = 1 << 1;
        const SHARED_W = 1 << 2;
        const IMAGE_R = 1 << 3;
        const IMAGE_W = 1 << 4;
        const BUFFER_R = 1 << 5;
        const BUFFER_W = 1 << 6;
        const ARRAY_R = 1 << 7;
        const ARRAY_W = 1 << 8;
        const PRIVATE_R = 1 << 9;
        const PRIVATE_W = 1 << 10;
        const CONST_W = 1 << 11;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    F32,
    F16,
    U32,
    U16,
    S32,
    S16,
    U8,
}

impl Type {
    pub fn bytes(&self) -> usize {
        match self {
            Type::F32 | Type::U32 | Type::S32 => 4,
            Type::F16 | Type::U16 | Type::S16 => 2,
            Type::U8 => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::F32 | Type::F16)
    }

    pub fn is_uint(&self) -> bool {
        matches!(self, Type::U32 | Type::U16 | Type::U8)
    }

    pub fn is_sint(&self) -> bool {
        matches!(self, Type::S32 | Type::S16)
    }

    /// The 32-bit type in the same numeric family.
    pub fn full(&self) -> Type {
        match self {
            Type::F32 | Type::F16 => Type::F32,
            Type::U32 | Type::U16 | Type::U8 => Type::U32,
            Type::S32 | Type::S16 => Type::S32,
        }
    }

    pub fn half(&self) -> Type {
        match self {
            Type::F32 | Type::F16 => Type::F16,
            Type::U32 | Type::U16 => Type::U16,
            Type::S32 | Type::S16 => Type::S16,
            Type::U8 => Type::U8,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Type::F32 => "f32",
            Type::F16 => "f16",
            Type::U32 => "u32",
            Type::U16 => "u16",
            Type::S32 => "s32",
            Type::S16 => "s16",
            Type::U8 => "u8",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Flow,
    Move,
    Alu,
    MulAdd,
    Sfu,
    Tex,
    Mem,
    Barrier,
    Meta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Control flow
    Nop,
    Jump,
    Br,
    BAny,
    BAll,
    Predt,
    Predf,
    Kill,
    Demote,
    /// Shader end; its sources are the shader's outputs.
    End,
    // Moves
    Mov,
    AbsnegF,
    AbsnegS,
    // Scalar ALU
    AddF,
    MulF,
    MaxF,
    MinF,
    FloorF,
    CmpsF,
    AddU,
    AddS,
    SubU,
    AndB,
    OrB,
    XorB,
    NotB,
    ShlB,
    ShrB,
    CmpsS,
    CmpsU,
    BaryF,
    FlatB,
    // Three-source ALU
    MadF16,
    MadF32,
    MadU16,
    SadS16,
    SadS32,
    SelB16,
    SelB32,
    SelF16,
    SelF32,
    // Special function unit
    Rcp,
    Rsq,
    Log2,
    Exp2,
    Sin,
    Cos,
    Sqrt,
    // Texture
    Sam,
    SamB,
    SamL,
    Isam,
    Getlod,
    // Memory
    Ldg,
    Stg,
    Ldl,
    Stl,
    Ldlv,
    Ldc,
    Stc,
    AtomicAdd,
    AtomicMax,
    // Barriers
    Bar,
    Fence,
    // Meta
    MetaInput,
    MetaPhi,
    MetaCollect,
    MetaSplit,
    MetaParallelCopy,
    MetaTexPrefetch,
    PushConstsLoadMacro,
}

impl Opcode {
    pub fn cat(&self) -> Category {
        use Opcode::*;
        match self {
            Nop | Jump | Br | BAny | BAll | Predt | Predf | Kill | Demote
            | End => Category::Flow,
            Mov | AbsnegF | AbsnegS => Category::Move,
            AddF | MulF | MaxF | MinF | FloorF | CmpsF | AddU | AddS
            | SubU | AndB | OrB | XorB | NotB | ShlB | ShrB | CmpsS
            | CmpsU | BaryF | FlatB => Category::Alu,
            MadF16 | MadF32 | MadU16 | SadS16 | SadS32 | SelB16 | SelB32
            | SelF16 | SelF32 => Category::MulAdd,
            Rcp | Rsq | Log2 | Exp2 | Sin | Cos | Sqrt => Category::Sfu,
            Sam | SamB | SamL | Isam | Getlod => Category::Tex,
            Ldg | Stg | Ldl | Stl | Ldlv | Ldc | Stc | AtomicAdd
            | AtomicMax => Category::Mem,
            Bar | Fence => Category::Barrier,
            MetaInput | MetaPhi | MetaCollect | MetaSplit
            | MetaParallelCopy | MetaTexPrefetch | PushConstsLoadMacro => {
                Category::Meta
            }
        }
    }

    pub fn is_terminator(&self) -> bool {
        use Opcode::*;
        matches!(self, Jump | Br | BAny | BAll | Predt | Predf | End)
    }

    pub fn is_kill_or_demote(&self) -> bool {
        matches!(self, Opcode::Kill | Opcode::Demote)
    }

    pub fn is_meta(&self) -> bool {
        self.cat() == Category::Meta
    }

    pub fn is_alu(&self) -> bool {
        matches!(
            self.cat(),
            Category::Move | Category::Alu | Category::MulAdd
        )
    }

    pub fn is_sfu(&self) -> bool {
        self.cat() == Category::Sfu
    }

    pub fn is_tex(&self) -> bool {
        self.cat() == Category::Tex
    }

    pub fn is_tex_or_prefetch(&self) -> bool {
        self.is_tex() || *self == Opcode::MetaTexPrefetch
    }

    pub fn is_mem(&self) -> bool {
        self.cat() == Category::Mem
    }

    pub fn is_barrier(&self) -> bool {
        self.cat() == Category::Barrier
    }

    pub fn is_store(&self) -> bool {
        matches!(self, Opcode::Stg | Opcode::Stl | Opcode::Stc)
    }

    pub fn is_load(&self) -> bool {
        matches!(self, Opcode::Ldg | Opcode::Ldl | Opcode::Ldlv | Opcode::Ldc)
    }

    pub fn is_local_mem_load(&self) -> bool {
        matches!(self, Opcode::Ldl | Opcode::Ldlv)
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self, Opcode::AtomicAdd | Opcode::AtomicMax)
    }

    /// Instructions that receive shader inputs from varying storage.
    pub fn is_input(&self) -> bool {
        matches!(self, Opcode::Ldlv | Opcode::BaryF | Opcode::FlatB)
    }

    /// The plain multiply-adds whose first two sources commute.
    pub fn is_mad(&self) -> bool {
        matches!(self, Opcode::MadF16 | Opcode::MadF32 | Opcode::MadU16)
    }

    /// Sum-of-absolute-differences, three-source commutative.
    pub fn is_sad(&self) -> bool {
        matches!(self, Opcode::SadS16 | Opcode::SadS32)
    }

    /// Comparisons produce canonical 0/1 booleans.
    pub fn is_bool(&self) -> bool {
        matches!(self, Opcode::CmpsF | Opcode::CmpsS | Opcode::CmpsU)
    }

    pub fn is_float_alu(&self) -> bool {
        use Opcode::*;
        matches!(self, AddF | MulF | MaxF | MinF | FloorF | CmpsF)
    }

    pub fn is_int_alu(&self) -> bool {
        use Opcode::*;
        matches!(
            self,
            AddU | AddS | SubU | AndB | OrB | XorB | NotB | ShlB | ShrB
                | CmpsS | CmpsU
        )
    }

    pub fn is_bitwise(&self) -> bool {
        use Opcode::*;
        matches!(self, AndB | OrB | XorB | NotB | ShlB | ShrB)
    }

    pub fn is_float_muladd(&self) -> bool {
        use Opcode::*;
        matches!(self, MadF16 | MadF32 | SelF16 | SelF32)
    }

    pub fn name(&self) -> &'static str {
        use Opcode::*;
        match self {
            Nop => "nop",
            Jump => "jump",
            Br => "br",
            BAny => "bany",
            BAll => "ball",
            Predt => "predt",
            Predf => "predf",
            Kill => "kill",
            Demote => "demote",
            End => "end",
            Mov => "mov",
            AbsnegF => "absneg.f",
            AbsnegS => "absneg.s",
            AddF => "add.f",
            MulF => "mul.f",
            MaxF => "max.f",
            MinF => "min.f",
            FloorF => "floor.f",
            CmpsF => "cmps.f",
            AddU => "add.u",
            AddS => "add.s",
            SubU => "sub.u",
            AndB => "and.b",
            OrB => "or.b",
            XorB => "xor.b",
            NotB => "not.b",
            ShlB => "shl.b",
            ShrB => "shr.b",
            CmpsS => "cmps.s",
            CmpsU => "cmps.u",
            BaryF => "bary.f",
            FlatB => "flat.b",
            MadF16 => "mad.f16",
            MadF32 => "mad.f32",
            MadU16 => "mad.u16",
            SadS16 => "sad.s16",
            SadS32 => "sad.s32",
            SelB16 => "sel.b16",
            SelB32 => "sel.b32",
            SelF16 => "sel.f16",
            SelF32 => "sel.f32",
            Rcp => "rcp",
            Rsq => "rsq",
            Log2 => "log2",
            Exp2 => "exp2",
            Sin => "sin",
            Cos => "cos",
            Sqrt => "sqrt",
            Sam => "sam",
            SamB => "sam.b",
            SamL => "sam.l",
            Isam => "isam",
            Getlod => "getlod",
            Ldg => "ldg",
            Stg => "stg",
            Ldl => "ldl",
            Stl => "stl",
            Ldlv => "ldlv",
            Ldc => "ldc",
            Stc => "stc",
            AtomicAdd => "atomic.add",
            AtomicMax => "atomic.max",
            Bar => "bar",
            Fence => "fence",
            MetaInput => "meta.input",
            MetaPhi => "meta.phi",
            MetaCollect => "meta.collect",
            MetaSplit => "meta.split",
            MetaParallelCopy => "meta.pcopy",
            MetaTexPrefetch => "meta.tex_prefetch",
            PushConstsLoadMacro => "push_consts_load.macro",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundMode {
    #[default]
    Zero,
    Even,
    Pos,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpCond {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Default)]
pub struct FlowInfo {
    pub target: Option<BlockRef>,
}

#[derive(Debug, Clone)]
pub struct MovInfo {
    pub src_type: Type,
    pub dst_type: Type,
    pub round: RoundMode,
}

#[derive(Debug, Clone)]
pub struct AluInfo {
    /// Only meaningful for the comparison opcodes.
    pub cond: CmpCond,
}

#[derive(Debug, Clone, Default)]
pub struct MulAddInfo {
    /// Set once copy propagation has commuted the sources, so it never
    /// tries to swap them back.
    pub swapped: bool,
}

#[derive(Debug, Clone)]
pub struct TexInfo {
    pub samp: u16,
    pub tex: u16,
    pub tex_type: Type,
}

#[derive(Debug, Clone)]
pub struct MemInfo {
    pub mem_type: Type,
    pub dst_offset: i32,
}

#[derive(Debug, Clone, Default)]
pub struct SplitInfo {
    pub off: u8,
}

#[derive(Debug, Clone, Default)]
pub struct InputInfo {
    pub inidx: u16,
}

#[derive(Debug, Clone, Default)]
pub struct PrefetchInfo {
    pub samp: u16,
    pub tex: u16,
    pub input_offset: u16,
}

#[derive(Debug, Clone, Default)]
pub struct PushConstsInfo {
    pub src_base: u16,
    pub src_size: u16,
    pub dst_base: u16,
}

/// Category-specific instruction state.  Keyed by the opcode's category so
/// a pass can only ever see the fields that are valid for the instruction
/// it is looking at.
#[derive(Debug, Clone)]
pub enum OpPayload {
    None,
    Flow(FlowInfo),
    Mov(MovInfo),
    Alu(AluInfo),
    MulAdd(MulAddInfo),
    Tex(TexInfo),
    Mem(MemInfo),
    Split(SplitInfo),
    Input(InputInfo),
    Prefetch(PrefetchInfo),
    PushConsts(PushConstsInfo),
}

impl OpPayload {
    pub fn for_opc(opc: Opcode) -> OpPayload {
        match opc {
            Opcode::MetaSplit => OpPayload::Split(Default::default()),
            Opcode::MetaInput => OpPayload::Input(Default::default()),
            Opcode::MetaTexPrefetch => {
                OpPayload::Prefetch(Default::default())
            }
            Opcode::PushConstsLoadMacro => {
                OpPayload::PushConsts(Default::default())
            }
            _ => match opc.cat() {
                Category::Flow => OpPayload::Flow(Default::default()),
                Category::Move => OpPayload::Mov(MovInfo {
                    src_type: Type::F32,
                    dst_type: Type::F32,
                    round: RoundMode::Zero,
                }),
                Category::Alu => {
                    OpPayload::Alu(AluInfo { cond: CmpCond::Lt })
                }
                Category::MulAdd => OpPayload::MulAdd(Default::default()),
                Category::Tex => OpPayload::Tex(TexInfo {
                    samp: 0,
                    tex: 0,
                    tex_type: Type::F32,
                }),
                Category::Mem => OpPayload::Mem(MemInfo {
                    mem_type: Type::U32,
                    dst_offset: 0,
                }),
                Category::Sfu | Category::Barrier | Category::Meta => {
                    OpPayload::None
                }
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayAccess {
    pub id: u16,
    pub offset: i16,
    pub base: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegValue {
    None,
    Imm(u32),
    Array(ArrayAccess),
}

#[derive(Debug, Clone)]
pub struct Register {
    pub flags: RegFlags,
    /// Register number, `(N << 2) | comp`.  `INVALID_REG` until RA runs
    /// for SSA temporaries.
    pub num: u16,
    /// Mask of adjacent scalar components this operand touches.  Used for
    /// both sources and destinations.
    pub wrmask: u16,
    /// Component count for relative accesses, where a write mask cannot
    /// describe the footprint.
    pub size: u16,
    pub value: RegValue,
    /// The instruction this operand belongs to.
    pub instr: InstrRef,
    /// For SSA sources, the destination register that assigns this value.
    pub def: Option<RegRef>,
    /// The other half of a tied destination/source pair.  Always mutual.
    pub tied: Option<RegRef>,
}

impl Register {
    pub fn base(&self) -> u16 {
        self.num >> 2
    }

    pub fn comp(&self) -> u16 {
        self.num & 0x3
    }

    pub fn imm_u32(&self) -> u32 {
        match self.value {
            RegValue::Imm(v) => v,
            _ => panic!("operand holds no immediate"),
        }
    }

    pub fn imm_i32(&self) -> i32 {
        self.imm_u32() as i32
    }

    pub fn imm_f32(&self) -> f32 {
        f32::from_bits(self.imm_u32())
    }

    pub fn set_imm_u32(&mut self, v: u32) {
        self.value = RegValue::Imm(v);
    }

    pub fn set_imm_i32(&mut self, v: i32) {
        self.value = RegValue::Imm(v as u32);
    }

    pub fn set_imm_f32(&mut self, v: f32) {
        self.value = RegValue::Imm(v.to_bits());
    }

    pub fn array(&self) -> &ArrayAccess {
        match &self.value {
            RegValue::Array(a) => a,
            _ => panic!("operand holds no array access"),
        }
    }

    pub fn array_mut(&mut self) -> &mut ArrayAccess {
        match &mut self.value {
            RegValue::Array(a) => a,
            _ => panic!("operand holds no array access"),
        }
    }

    pub fn elems(&self) -> usize {
        if self.flags.contains(RegFlags::ARRAY) {
            usize::from(self.size)
        } else {
            16 - (self.wrmask.leading_zeros() as usize)
        }
    }

    /// Size of one element in half-register slots.
    pub fn elem_size(&self) -> usize {
        if self.flags.contains(RegFlags::HALF) {
            1
        } else {
            2
        }
    }

    /// Post-RA element count; relative accesses cover the whole array.
    pub fn post_ra_elems(&self) -> usize {
        if self.flags.contains(RegFlags::RELATIV) {
            usize::from(self.size)
        } else {
            self.elems()
        }
    }

    /// Post-RA base register number of the operand's footprint.
    pub fn post_ra_num(&self) -> u16 {
        if self.flags.contains(RegFlags::RELATIV) {
            self.array().base
        } else {
            self.num
        }
    }

    pub fn is_gpr(&self) -> bool {
        if self.flags.intersects(
            RegFlags::CONST | RegFlags::IMMED | RegFlags::PREDICATE,
        ) {
            return false;
        }
        if self.num != INVALID_REG && self.base() >= (NONGPR_REG_START >> 2) {
            return false;
        }
        if !self.flags.intersects(RegFlags::SSA | RegFlags::RELATIV)
            && self.num == INVALID_REG
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegFile {
    Full,
    Half,
    Shared,
    NonGpr,
}

/// Maps a register element to a (file, offset) pair for overlap checks.
/// Offsets are in half-register slots; with merged half/full files a full
/// register covers two slots so it conflicts with its half aliases.
pub fn reg_file_offset(
    reg: &Register,
    num: u16,
    merged: bool,
) -> (RegFile, usize) {
    debug_assert!(
        !reg.flags.intersects(RegFlags::CONST | RegFlags::IMMED)
    );
    let size = reg.elem_size();
    if !reg.is_gpr() {
        (RegFile::NonGpr, usize::from(num - NONGPR_REG_START) * size)
    } else if reg.flags.contains(RegFlags::SHARED) {
        (RegFile::Shared, usize::from(num - SHARED_REG_START) * size)
    } else if merged || !reg.flags.contains(RegFlags::HALF) {
        (RegFile::Full, usize::from(num) * size)
    } else {
        (RegFile::Half, usize::from(num))
    }
}

#[derive(Debug, Clone)]
pub struct Instr {
    pub opc: Opcode,
    pub flags: InstrFlags,
    /// Scalar replication count for vectorized-as-scalar operations.
    pub repeat: u8,
    pub block: BlockRef,
    pub dsts: SmallVec<[RegRef; 1]>,
    pub srcs: SmallVec<[RegRef; 4]>,
    pub payload: OpPayload,
    /// Extra ordering edges for barriers and array/SSBO hazards that the
    /// register-based dependency model cannot see.
    pub deps: Vec<InstrRef>,
    /// The (at most one) address register this instruction reads through.
    pub address: Option<RegRef>,
    pub barrier_class: BarrierMask,
    pub barrier_conflict: BarrierMask,
    /// Creation-order stamp, used as a stable tiebreak.
    pub serial: u32,
}

impl Instr {
    pub fn flow_info(&self) -> &FlowInfo {
        match &self.payload {
            OpPayload::Flow(p) => p,
            _ => panic!("payload is not Flow"),
        }
    }

    pub fn flow_info_mut(&mut self) -> &mut FlowInfo {
        match &mut self.payload {
            OpPayload::Flow(p) => p,
            _ => panic!("payload is not Flow"),
        }
    }

    pub fn mov_info(&self) -> &MovInfo {
        match &self.payload {
            OpPayload::Mov(p) => p,
            _ => panic!("payload is not Mov"),
        }
    }

    pub fn mov_info_mut(&mut self) -> &mut MovInfo {
        match &mut self.payload {
            OpPayload::Mov(p) => p,
            _ => panic!("payload is not Mov"),
        }
    }

    pub fn alu_info(&self) -> &AluInfo {
        match &self.payload {
            OpPayload::Alu(p) => p,
            _ => panic!("payload is not Alu"),
        }
    }

    pub fn muladd_info(&self) -> &MulAddInfo {
        match &self.payload {
            OpPayload::MulAdd(p) => p,
            _ => panic!("payload is not MulAdd"),
        }
    }

    pub fn muladd_info_mut(&mut self) -> &mut MulAddInfo {
        match &mut self.payload {
            OpPayload::MulAdd(p) => p,
            _ => panic!("payload is not MulAdd"),
        }
    }

    pub fn tex_info(&self) -> &TexInfo {
        match &self.payload {
            OpPayload::Tex(p) => p,
            _ => panic!("payload is not Tex"),
        }
    }

    pub fn tex_info_mut(&mut self) -> &mut TexInfo {
        match &mut self.payload {
            OpPayload::Tex(p) => p,
            _ => panic!("payload is not Tex"),
        }
    }

    pub fn mem_info(&self) -> &MemInfo {
        match &self.payload {
            OpPayload::Mem(p) => p,
            _ => panic!("payload is not Mem"),
        }
    }

    pub fn input_info(&self) -> &InputInfo {
        match &self.payload {
            OpPayload::Input(p) => p,
            _ => panic!("payload is not Input"),
        }
    }

    pub fn push_consts_info(&self) -> &PushConstsInfo {
        match &self.payload {
            OpPayload::PushConsts(p) => p,
            _ => panic!("payload is not PushConsts"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Block {
    pub instrs: Vec<InstrRef>,
    /// Logical successors; the second one is taken when the branch
    /// condition selects it.
    pub successors: [Option<BlockRef>; 2],
    pub divergent_condition: bool,
    /// Maintained by whoever adds successor edges, see
    /// [`Shader::block_add_predecessor`].
    pub predecessors: Vec<BlockRef>,
    /// Where the machine's path through the program diverges from the
    /// per-thread view (if/else fallthrough), these carry the physical
    /// edges.
    pub physical_successors: Vec<BlockRef>,
    pub physical_predecessors: Vec<BlockRef>,
    /// Instructions with no data-flow consumer that must survive anyway
    /// (stores, barriers, kills).
    pub keeps: Vec<InstrRef>,
    pub imm_dom: Option<BlockRef>,
    pub dom_pre_index: u32,
    pub dom_post_index: u32,
    pub loop_depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

/// Immediates lowered out of instruction encodings land in a reserved
/// range of the constant file, deduplicated by value.
#[derive(Debug)]
pub struct ConstPool {
    imms: Vec<u32>,
    base: u16,
    capacity: usize,
}

impl ConstPool {
    pub fn new(base: u16, capacity: usize) -> ConstPool {
        ConstPool {
            imms: Vec::new(),
            base,
            capacity,
        }
    }

    fn slot_num(&self, idx: usize) -> u16 {
        let idx = u16::try_from(idx).unwrap();
        regid(self.base + idx / 4, idx % 4)
    }

    /// Finds an existing constant slot holding `val`.
    pub fn find_imm(&self, val: u32) -> Option<u16> {
        self.imms
            .iter()
            .position(|&v| v == val)
            .map(|idx| self.slot_num(idx))
    }

    /// Allocates a constant slot for `val`, or `None` if the pool is full.
    pub fn add_imm(&mut self, val: u32) -> Option<u16> {
        if self.imms.len() >= self.capacity {
            return None;
        }
        self.imms.push(val);
        Some(self.slot_num(self.imms.len() - 1))
    }

    pub fn len(&self) -> usize {
        self.imms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.imms.is_empty()
    }
}

pub struct Shader {
    pub stage: ShaderStage,
    instrs: Vec<Instr>,
    regs: Vec<Register>,
    pub blocks: Vec<Block>,
    /// Varying-fetch instructions; scheduling makes sure these all land
    /// before any kill.
    pub inputs: Vec<InstrRef>,
    /// Every instruction reading through a0/a1, kept so address-register
    /// scheduling hazards are easy to find.
    pub addr0_users: Vec<InstrRef>,
    pub addr1_users: Vec<InstrRef>,
    /// Texture prefetch placeholders, scheduled as a block of their own.
    pub tex_prefetches: Vec<InstrRef>,
    pub consts: ConstPool,
    /// Half and full registers share one file on this target generation.
    pub mergedregs: bool,
    serial: u32,
}

impl std::ops::Index<InstrRef> for Shader {
    type Output = Instr;

    fn index(&self, i: InstrRef) -> &Instr {
        &self.instrs[i.idx()]
    }
}

impl std::ops::IndexMut<InstrRef> for Shader {
    fn index_mut(&mut self, i: InstrRef) -> &mut Instr {
        &mut self.instrs[i.idx()]
    }
}

impl std::ops::Index<RegRef> for Shader {
    type Output = Register;

    fn index(&self, r: RegRef) -> &Register {
        &self.regs[r.idx()]
    }
}

impl std::ops::IndexMut<RegRef> for Shader {
    fn index_mut(&mut self, r: RegRef) -> &mut Register {
        &mut self.regs[r.idx()]
    }
}

impl std::ops::Index<BlockRef> for Shader {
    type Output = Block;

    fn index(&self, b: BlockRef) -> &Block {
        &self.blocks[b.idx()]
    }
}

impl std::ops::IndexMut<BlockRef> for Shader {
    fn index_mut(&mut self, b: BlockRef) -> &mut Block {
        &mut self.blocks[b.idx()]
    }
}

impl Shader {
    pub fn new(stage: ShaderStage) -> Shader {
        Shader {
            stage,
            instrs: Vec::new(),
            regs: Vec::new(),
            blocks: Vec::new(),
            inputs: Vec::new(),
            addr0_users: Vec::new(),
            addr1_users: Vec::new(),
            tex_prefetches: Vec::new(),
            consts: ConstPool::new(40, 64),
            mergedregs: true,
            serial: 0,
        }
    }

    pub fn block_create(&mut self) -> BlockRef {
        let b = BlockRef(u32::try_from(self.blocks.len()).unwrap());
        self.blocks.push(Block::default());
        b
    }

    pub fn block_refs(&self) -> impl DoubleEndedIterator<Item = BlockRef> {
        (0..u32::try_from(self.blocks.len()).unwrap()).map(BlockRef)
    }

    pub fn num_instrs(&self) -> usize {
        self.instrs.len()
    }

    fn alloc_instr(&mut self, block: BlockRef, opc: Opcode) -> InstrRef {
        let i = InstrRef(u32::try_from(self.instrs.len()).unwrap());
        self.instrs.push(Instr {
            opc,
            flags: InstrFlags::empty(),
            repeat: 0,
            block,
            dsts: SmallVec::new(),
            srcs: SmallVec::new(),
            payload: OpPayload::for_opc(opc),
            deps: Vec::new(),
            address: None,
            barrier_class: BarrierMask::empty(),
            barrier_conflict: BarrierMask::empty(),
            serial: self.serial,
        });
        self.serial += 1;

        // Keep the side lists current so passes never have to rediscover
        // these by scanning.
        match opc {
            Opcode::MetaInput => self.inputs.push(i),
            Opcode::MetaTexPrefetch => self.tex_prefetches.push(i),
            _ => (),
        }

        i
    }

    /// Creates an instruction at the end of `block`.
    pub fn instr_create(&mut self, block: BlockRef, opc: Opcode) -> InstrRef {
        let i = self.alloc_instr(block, opc);
        self[block].instrs.push(i);
        i
    }

    fn alloc_reg(&mut self, instr: InstrRef, num: u16, flags: RegFlags) -> RegRef {
        let r = RegRef(u32::try_from(self.regs.len()).unwrap());
        self.regs.push(Register {
            flags,
            num,
            wrmask: 0x1,
            size: 0,
            value: RegValue::None,
            instr,
            def: None,
            tied: None,
        });
        r
    }

    /// Appends a destination and hands it back so the caller can finish
    /// flagging it up.
    pub fn dst_create(
        &mut self,
        instr: InstrRef,
        num: u16,
        flags: RegFlags,
    ) -> RegRef {
        let r = self.alloc_reg(instr, num, flags);
        self[instr].dsts.push(r);
        r
    }

    pub fn src_create(
        &mut self,
        instr: InstrRef,
        num: u16,
        flags: RegFlags,
    ) -> RegRef {
        let r = self.alloc_reg(instr, num, flags);
        self[instr].srcs.push(r);
        r
    }

    /// Appends an SSA source referencing `def_instr`'s (only) destination.
    pub fn src_ssa(
        &mut self,
        instr: InstrRef,
        def_instr: InstrRef,
        flags: RegFlags,
    ) -> RegRef {
        let def = self[def_instr].dsts[0];
        let def_flags = self[def].flags
            & (RegFlags::HALF | RegFlags::SHARED | RegFlags::PREDICATE);
        let r = self.src_create(
            instr,
            INVALID_REG,
            flags | def_flags | RegFlags::SSA,
        );
        self[r].def = Some(def);
        r
    }

    pub fn src_imm(
        &mut self,
        instr: InstrRef,
        val: u32,
        flags: RegFlags,
    ) -> RegRef {
        let r = self.src_create(instr, INVALID_REG, flags | RegFlags::IMMED);
        self[r].value = RegValue::Imm(val);
        r
    }

    pub fn src_const(
        &mut self,
        instr: InstrRef,
        num: u16,
        flags: RegFlags,
    ) -> RegRef {
        self.src_create(instr, num, flags | RegFlags::CONST)
    }

    /// Clones a register into a fresh arena slot.  The clone shares the
    /// original's SSA def link until it is overwritten but never its tied
    /// pairing, which has to stay mutual.
    pub fn reg_clone(&mut self, r: RegRef) -> RegRef {
        let mut reg = self[r].clone();
        reg.tied = None;
        let nr = RegRef(u32::try_from(self.regs.len()).unwrap());
        self.regs.push(reg);
        nr
    }

    /// Deep-clones an instruction, inserting the clone right after the
    /// original in its block.
    pub fn instr_clone(&mut self, i: InstrRef) -> InstrRef {
        let ni = self.alloc_instr(self[i].block, self[i].opc);
        let mut instr = self[i].clone();
        instr.serial = self[ni].serial;
        let dsts: SmallVec<[RegRef; 1]> = instr
            .dsts
            .iter()
            .map(|&r| {
                let nr = self.reg_clone(r);
                self[nr].instr = ni;
                nr
            })
            .collect();
        let srcs: SmallVec<[RegRef; 4]> = instr
            .srcs
            .iter()
            .map(|&r| {
                let nr = self.reg_clone(r);
                self[nr].instr = ni;
                nr
            })
            .collect();
        instr.dsts = dsts;
        instr.srcs = srcs;
        self[ni] = instr;

        let block = self[ni].block;
        let pos = self.instr_pos(i);
        self[block].instrs.insert(pos + 1, ni);
        ni
    }

    /// Ties a destination to a source that must share its physical
    /// location.
    pub fn tie_regs(&mut self, dst: RegRef, src: RegRef) {
        assert!(self[dst].tied.is_none() && self[src].tied.is_none());
        self[dst].tied = Some(src);
        self[src].tied = Some(dst);
    }

    /// The defining instruction of an SSA (or array) source, if any.
    pub fn ssa_def(&self, r: RegRef) -> Option<InstrRef> {
        let reg = &self[r];
        if reg.flags.intersects(RegFlags::SSA | RegFlags::ARRAY) {
            reg.def.map(|d| self[d].instr)
        } else {
            None
        }
    }

    /// Two address operands conflict if they name different definitions.
    pub fn address_conflicts(
        &self,
        a: Option<RegRef>,
        b: Option<RegRef>,
    ) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => self[a].def != self[b].def,
            _ => false,
        }
    }

    /// Records the address-register dependency of `i`.  An instruction can
    /// reference at most one address register.
    pub fn set_address(&mut self, i: InstrRef, addr_instr: InstrRef) {
        let addr_reg = self[addr_instr].dsts[0];
        if let Some(cur) = self[i].address {
            assert!(self[cur].def == Some(addr_reg) || cur == addr_reg);
            return;
        }
        self[i].address = Some(addr_reg);
        if self.writes_addr1(addr_instr) {
            self.addr1_users.push(i);
        } else {
            self.addr0_users.push(i);
        }
    }

    pub fn instr_add_dep(&mut self, i: InstrRef, dep: InstrRef) {
        if !self[i].deps.contains(&dep) {
            self[i].deps.push(dep);
        }
    }

    /// Index of `i` within its block's instruction list.
    pub fn instr_pos(&self, i: InstrRef) -> usize {
        let block = self[i].block;
        self[block]
            .instrs
            .iter()
            .position(|&x| x == i)
            .expect("instruction is not in its block")
    }

    /// Unlinks `i` from its block without touching the arena.
    pub fn instr_unlink(&mut self, i: InstrRef) {
        let pos = self.instr_pos(i);
        let block = self[i].block;
        self[block].instrs.remove(pos);
    }

    pub fn block_terminator(&self, b: BlockRef) -> Option<InstrRef> {
        let last = *self[b].instrs.last()?;
        if self[last].opc.is_terminator() {
            Some(last)
        } else {
            None
        }
    }

    /// Detaches the block's terminator.  The caller must reattach it
    /// before the block is well-formed again.
    pub fn block_take_terminator(&mut self, b: BlockRef) -> Option<InstrRef> {
        let term = self.block_terminator(b)?;
        self[b].instrs.pop();
        Some(term)
    }

    pub fn block_add_predecessor(&mut self, b: BlockRef, pred: BlockRef) {
        self[b].predecessors.push(pred);
    }

    pub fn block_remove_predecessor(&mut self, b: BlockRef, pred: BlockRef) {
        let pos = self[b]
            .predecessors
            .iter()
            .position(|&p| p == pred)
            .expect("not a predecessor");
        self[b].predecessors.remove(pos);
    }

    pub fn block_link_physical(&mut self, pred: BlockRef, succ: BlockRef) {
        self[pred].physical_successors.push(succ);
        self[succ].physical_predecessors.push(pred);
    }

    /// Checks and sets the per-pass visit marker.
    pub fn instr_check_mark(&mut self, i: InstrRef) -> bool {
        if self[i].flags.contains(InstrFlags::MARK) {
            return true;
        }
        self[i].flags.insert(InstrFlags::MARK);
        false
    }

    pub fn clear_marks(&mut self) {
        for instr in &mut self.instrs {
            instr.flags.remove(InstrFlags::MARK);
        }
    }

    pub fn dest_elems(&self, i: InstrRef) -> usize {
        match self[i].dsts.first() {
            Some(&d) => self[d].elems(),
            None => 0,
        }
    }

    pub fn writes_gpr(&self, i: InstrRef) -> bool {
        match self[i].dsts.first() {
            Some(&d) => self[d].wrmask != 0 && self[d].is_gpr(),
            None => false,
        }
    }

    pub fn writes_addr0(&self, i: InstrRef) -> bool {
        match self[i].dsts.first() {
            Some(&d) => self[d].num == regid(REG_A0 >> 2, 0)
                && !self[d]
                    .flags
                    .intersects(RegFlags::CONST | RegFlags::IMMED),
            None => false,
        }
    }

    pub fn writes_addr1(&self, i: InstrRef) -> bool {
        match self[i].dsts.first() {
            Some(&d) => self[d].num == regid(REG_A0 >> 2, 1)
                && !self[d]
                    .flags
                    .intersects(RegFlags::CONST | RegFlags::IMMED),
            None => false,
        }
    }

    pub fn writes_pred(&self, i: InstrRef) -> bool {
        match self[i].dsts.first() {
            Some(&d) => self[d].flags.contains(RegFlags::PREDICATE),
            None => false,
        }
    }

    fn is_same_type_reg(&self, a: RegRef, b: RegRef) -> bool {
        self[a].flags.contains(RegFlags::HALF)
            == self[b].flags.contains(RegFlags::HALF)
    }

    /// A non-transformative mov: same-typed `mov` or a non-saturating
    /// absneg, with a plain destination.
    pub fn is_same_type_mov(&self, i: InstrRef) -> bool {
        let instr = &self[i];
        match instr.opc {
            Opcode::Mov => {
                let info = instr.mov_info();
                if info.src_type != info.dst_type {
                    return false;
                }
                if !self.is_same_type_reg(instr.dsts[0], instr.srcs[0]) {
                    return false;
                }
            }
            Opcode::AbsnegF | Opcode::AbsnegS => {
                if instr.flags.contains(InstrFlags::SAT) {
                    return false;
                }
                if !self.is_same_type_reg(instr.dsts[0], instr.srcs[0]) {
                    return false;
                }
            }
            _ => return false,
        }

        let dst = &self[instr.dsts[0]];
        if dst.flags.contains(RegFlags::PREDICATE) {
            return false;
        }
        if dst.num != INVALID_REG && dst.base() == (REG_A0 >> 2) {
            return false;
        }
        if dst.flags.intersects(RegFlags::RELATIV | RegFlags::ARRAY) {
            return false;
        }
        true
    }

    /// A mov from the constant file that narrows but does not change the
    /// numeric family.  Narrowing is fine because reading a full constant
    /// through a half reference demotes it the same way.
    pub fn is_const_mov(&self, i: InstrRef) -> bool {
        let instr = &self[i];
        if instr.opc != Opcode::Mov {
            return false;
        }
        if !self[instr.srcs[0]].flags.contains(RegFlags::CONST) {
            return false;
        }

        let info = instr.mov_info();
        let (src_type, dst_type) = (info.src_type, info.dst_type);
        if dst_type.bytes() > src_type.bytes() {
            return false;
        }

        (src_type.is_float() && dst_type.is_float())
            || (src_type.is_uint() && dst_type.is_uint())
            || (src_type.is_sint() && dst_type.is_sint())
    }

    /// Post-RA `mov rN, rN` left over from pre-RA conservatism.
    pub fn is_self_mov(&self, i: InstrRef) -> bool {
        if !self.is_same_type_mov(i) {
            return false;
        }

        let instr = &self[i];
        if instr.opc != Opcode::Mov {
            return false;
        }
        let dst = &self[instr.dsts[0]];
        let src = &self[instr.srcs[0]];
        if dst.num != src.num {
            return false;
        }
        if dst.flags.contains(RegFlags::RELATIV) {
            return false;
        }
        if instr.mov_info().round != RoundMode::Zero {
            return false;
        }
        if src.flags.intersects(
            RegFlags::CONST
                | RegFlags::IMMED
                | RegFlags::RELATIV
                | RegFlags::FNEG
                | RegFlags::FABS
                | RegFlags::SNEG
                | RegFlags::SABS
                | RegFlags::BNOT,
        ) {
            return false;
        }
        true
    }

    /// Does this instruction sometimes need an (ss) wait for its result?
    pub fn is_ss_producer(&self, i: InstrRef) -> bool {
        let instr = &self[i];
        for &d in &instr.dsts {
            if self[d].flags.contains(RegFlags::SHARED) {
                return true;
            }
        }
        instr.opc.is_sfu() || instr.opc.is_local_mem_load()
    }

    /// Does this instruction need a (sy) wait for its result?
    pub fn is_sy_producer(&self, i: InstrRef) -> bool {
        let opc = self[i].opc;
        opc.is_tex_or_prefetch()
            || (opc.is_load() && !opc.is_local_mem_load())
            || opc.is_atomic()
    }

    /// Instructions that keep reading their sources after issue and so can
    /// introduce a WAR hazard against later writers.
    pub fn is_war_hazard_producer(&self, i: InstrRef) -> bool {
        let opc = self[i].opc;
        opc.is_tex()
            || opc.is_mem()
            || self.is_ss_producer(i)
            || opc == Opcode::Stc
    }

    /// True of any other source carrying a non-GPR operand kind, used for
    /// the one-special-operand-per-instruction encodings.
    fn other_src_is_special(&self, i: InstrRef, n: usize) -> bool {
        self[i].srcs.iter().enumerate().any(|(m, &s)| {
            m != n
                && self[s].flags.intersects(
                    RegFlags::CONST | RegFlags::IMMED | RegFlags::RELATIV,
                )
        })
    }

    /// Whether source `n` of `i` could legally carry `flags`.  This is the
    /// one place that knows the per-category operand encoding rules; every
    /// fold asks here before mutating anything.
    pub fn valid_flags(&self, i: InstrRef, n: usize, flags: RegFlags) -> bool {
        let opc = self[i].opc;
        let absneg = RegFlags::FNEG
            | RegFlags::FABS
            | RegFlags::SNEG
            | RegFlags::SABS
            | RegFlags::BNOT;
        let special =
            RegFlags::CONST | RegFlags::IMMED | RegFlags::RELATIV;

        match opc.cat() {
            Category::Flow | Category::Barrier => {
                !flags.intersects(special | absneg)
            }
            Category::Meta => {
                // Immediates are allowed so texture/sampler indices can
                // fold behind a collect; modifiers would change the value.
                if flags.intersects(absneg | RegFlags::RELATIV) {
                    return false;
                }
                true
            }
            Category::Move => {
                let allowed_absneg = match opc {
                    Opcode::AbsnegF => RegFlags::FNEG | RegFlags::FABS,
                    Opcode::AbsnegS => RegFlags::SNEG | RegFlags::SABS,
                    _ => RegFlags::empty(),
                };
                !flags.intersects(absneg - allowed_absneg)
            }
            Category::Alu => {
                let allowed_absneg = if opc.is_bitwise() {
                    RegFlags::BNOT
                } else if opc.is_float_alu() {
                    RegFlags::FNEG | RegFlags::FABS
                } else if opc.is_int_alu() {
                    RegFlags::SNEG | RegFlags::SABS
                } else {
                    // bary.f and friends fetch varyings, plain GPRs only
                    return !flags.intersects(special | absneg);
                };
                if flags.intersects(absneg - allowed_absneg) {
                    return false;
                }
                if flags.intersects(special)
                    && self.other_src_is_special(i, n)
                {
                    return false;
                }
                true
            }
            Category::MulAdd => {
                if flags.contains(RegFlags::IMMED) {
                    return false;
                }
                // The middle source has no constant-file or shared-read
                // path in the encoding.
                if n == 1
                    && flags.intersects(
                        RegFlags::CONST
                            | RegFlags::RELATIV
                            | RegFlags::SHARED,
                    )
                {
                    return false;
                }
                let allowed_absneg = if opc.is_float_muladd() {
                    RegFlags::FNEG
                } else if n == 1 {
                    RegFlags::SNEG
                } else {
                    RegFlags::empty()
                };
                if flags.intersects(absneg - allowed_absneg) {
                    return false;
                }
                if flags.intersects(special)
                    && self.other_src_is_special(i, n)
                {
                    return false;
                }
                true
            }
            Category::Sfu => {
                if flags
                    .intersects(RegFlags::IMMED | RegFlags::RELATIV)
                {
                    return false;
                }
                !flags.intersects(
                    RegFlags::SNEG
                        | RegFlags::SABS
                        | RegFlags::BNOT,
                )
            }
            Category::Tex => !flags.intersects(special | absneg),
            Category::Mem => {
                if flags.intersects(
                    RegFlags::CONST | RegFlags::RELATIV | absneg,
                ) {
                    return false;
                }
                true
            }
        }
    }

    /// Whether `imm` fits the immediate encoding of `i`.
    pub fn valid_immediate(&self, i: InstrRef, imm: i32) -> bool {
        match self[i].opc.cat() {
            // ALU encodings carry a 16-bit immediate field
            Category::Alu => imm >= -(1 << 15) && imm < (1 << 16),
            Category::Move | Category::Meta | Category::Mem => true,
            _ => false,
        }
    }

    /// Float ALU immediates must come from the hardware's small float
    /// lookup table; returns the table index for the operand's value.
    pub fn flut(&self, r: RegRef) -> Option<u32> {
        const FLUT: [f32; 12] = [
            0.0,
            0.5,
            1.0,
            2.0,
            std::f32::consts::E,
            std::f32::consts::PI,
            std::f32::consts::FRAC_1_PI,
            std::f32::consts::LN_2,
            std::f32::consts::LOG2_E,
            std::f32::consts::LOG10_2,
            std::f32::consts::LOG2_10,
            4.0,
        ];

        let reg = &self[r];
        let bits = if reg.flags.contains(RegFlags::HALF) {
            half_to_f32_bits(reg.imm_u32() as u16)
        } else {
            reg.imm_u32()
        };

        FLUT.iter()
            .position(|f| f.to_bits() == bits)
            .map(|idx| u32::try_from(idx).unwrap())
    }

    /// Computes immediate dominators and dominance-tree DFS indices.
    /// Blocks are expected in reverse post-order, which the selector
    /// maintains by construction.
    pub fn calc_dominance(&mut self) {
        if self.blocks.is_empty() {
            return;
        }

        for b in &mut self.blocks {
            b.imm_dom = None;
        }
        self.blocks[0].imm_dom = Some(BlockRef(0));

        let intersect = |doms: &Vec<Option<usize>>,
                         mut a: usize,
                         mut b: usize| {
            while a != b {
                while a > b {
                    a = doms[a].unwrap();
                }
                while b > a {
                    b = doms[b].unwrap();
                }
            }
            a
        };

        let mut doms: Vec<Option<usize>> = vec![None; self.blocks.len()];
        doms[0] = Some(0);
        loop {
            let mut changed = false;
            for i in 1..self.blocks.len() {
                let mut new_dom = None;
                for p in &self.blocks[i].predecessors {
                    let p = p.idx();
                    if doms[p].is_none() {
                        continue;
                    }
                    new_dom = Some(match new_dom {
                        None => p,
                        Some(d) => intersect(&doms, p, d),
                    });
                }
                let new_dom = new_dom.expect("unreachable block");
                if doms[i] != Some(new_dom) {
                    doms[i] = Some(new_dom);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for (i, d) in doms.iter().enumerate() {
            self.blocks[i].imm_dom =
                Some(BlockRef(u32::try_from(d.unwrap()).unwrap()));
        }

        // Pre/post indices from a DFS of the dominance tree
        let mut children: Vec<Vec<usize>> =
            vec![Vec::new(); self.blocks.len()];
        for (i, d) in doms.iter().enumerate().skip(1) {
            children[d.unwrap()].push(i);
        }

        let mut count = 0_u32;
        let mut stack = vec![(0_usize, 0_usize)];
        self.blocks[0].dom_pre_index = count;
        count += 1;
        while let Some(&(id, ci)) = stack.last() {
            if ci < children[id].len() {
                let c = children[id][ci];
                stack.last_mut().unwrap().1 += 1;
                self.blocks[c].dom_pre_index = count;
                count += 1;
                stack.push((c, 0));
            } else {
                self.blocks[id].dom_post_index = count;
                count += 1;
                stack.pop();
            }
        }
    }

    /// Returns true if `a` dominates `b`.  Requires [`Self::calc_dominance`].
    pub fn block_dominates(&self, a: BlockRef, b: BlockRef) -> bool {
        self[b].dom_pre_index >= self[a].dom_pre_index
            && self[b].dom_post_index <= self[a].dom_post_index
    }

    /// Computes per-block loop nesting depth.  Requires dominance.
    pub fn calc_loop_depth(&mut self) {
        let n = self.blocks.len();
        if n == 0 {
            return;
        }

        // Back-edge targets are loop headers
        let mut header = vec![false; n];
        let mut pre = vec![false; n];
        let mut post = vec![false; n];
        let mut stack = vec![(0_usize, 0_usize)];
        pre[0] = true;
        while let Some(&(id, si)) = stack.last() {
            let succ: Vec<usize> = self.blocks[id]
                .successors
                .iter()
                .flatten()
                .map(|s| s.idx())
                .collect();
            if si < succ.len() {
                let s = succ[si];
                stack.last_mut().unwrap().1 += 1;
                if pre[s] {
                    if !post[s] {
                        header[s] = true;
                    }
                    continue;
                }
                pre[s] = true;
                stack.push((s, 0));
            } else {
                post[id] = true;
                stack.pop();
            }
        }

        // A block's innermost loop header is itself if it is a header,
        // otherwise its dominator's.
        let mut lph: Vec<Option<usize>> = vec![None; n];
        for i in 1..n {
            lph[i] = if header[i] {
                Some(i)
            } else {
                lph[self.blocks[i].imm_dom.unwrap().idx()]
            };
        }

        for i in 0..n {
            let mut depth = 0;
            let mut idx = i;
            while let Some(h) = lph[idx] {
                depth += 1;
                idx = self.blocks[h].imm_dom.unwrap().idx();
                if idx == h {
                    break;
                }
            }
            self.blocks[i].loop_depth = depth;
        }
    }

    fn fmt_reg(&self, f: &mut fmt::Formatter<'_>, r: RegRef) -> fmt::Result {
        let reg = &self[r];
        if reg.flags.contains(RegFlags::FNEG)
            || reg.flags.contains(RegFlags::SNEG)
        {
            write!(f, "(neg)")?;
        }
        if reg.flags.contains(RegFlags::FABS)
            || reg.flags.contains(RegFlags::SABS)
        {
            write!(f, "(abs)")?;
        }
        if reg.flags.contains(RegFlags::BNOT) {
            write!(f, "(not)")?;
        }
        if reg.flags.contains(RegFlags::IMMED) {
            return write!(f, "{:#x}", reg.imm_u32());
        }
        let h = if reg.flags.contains(RegFlags::HALF) {
            "h"
        } else {
            ""
        };
        if reg.flags.contains(RegFlags::CONST) {
            return write!(f, "{}c{}.{}", h, reg.base(), comp_name(reg.comp()));
        }
        if reg.flags.contains(RegFlags::SSA) {
            return match reg.def {
                Some(d) => write!(f, "{}ssa_{}", h, d.0),
                None => write!(f, "{}ssa_{}", h, r.0),
            };
        }
        if reg.flags.contains(RegFlags::RELATIV) {
            let a = reg.array();
            return write!(f, "{}r<a0.x + {}>", h, a.offset);
        }
        write!(f, "{}r{}.{}", h, reg.base(), comp_name(reg.comp()))
    }

    fn fmt_instr(
        &self,
        f: &mut fmt::Formatter<'_>,
        i: InstrRef,
    ) -> fmt::Result {
        let instr = &self[i];
        if instr.flags.contains(InstrFlags::SY) {
            write!(f, "(sy)")?;
        }
        if instr.flags.contains(InstrFlags::SS) {
            write!(f, "(ss)")?;
        }
        if instr.repeat > 0 {
            write!(f, "(rpt{})", instr.repeat)?;
        }
        write!(f, "{}", instr.opc)?;
        if instr.flags.contains(InstrFlags::SAT) {
            write!(f, "(sat)")?;
        }
        let mut first = true;
        for &d in &instr.dsts {
            write!(f, "{}", if first { " " } else { ", " })?;
            first = false;
            self.fmt_reg(f, d)?;
        }
        for &s in &instr.srcs {
            write!(f, "{}", if first { " " } else { ", " })?;
            first = false;
            self.fmt_reg(f, s)?;
        }
        Ok(())
    }
}

fn comp_name(comp: u16) -> char {
    match comp {
        0 => 'x',
        1 => 'y',
        2 => 'z',
        _ => 'w',
    }
}

/// Display adapter for one instruction; registers only know their arena,
/// so printing always goes through the shader.
pub struct InstrDisp<'a>(pub &'a Shader, pub InstrRef);

impl fmt::Display for InstrDisp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_instr(f, self.1)
    }
}

impl fmt::Display for Shader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.block_refs() {
            write!(f, "{} [", b)?;
            for (pi, p) in self[b].predecessors.iter().enumerate() {
                if pi > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", p)?;
            }
            write!(f, "] {{\n")?;
            for &i in &self[b].instrs {
                write!(f, "  ")?;
                self.fmt_instr(f, i)?;
                write!(f, "\n")?;
            }
            write!(f, "}} -> [")?;
            for (si, s) in self[b].successors.iter().flatten().enumerate() {
                if si > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", s)?;
            }
            write!(f, "]\n")?;
        }
        Ok(())
    }
}
