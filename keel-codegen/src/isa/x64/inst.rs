//! Machine instruction representation for the x86-64 back end.
//!
//! Instruction selection produces a flat vector of `MachInst` records per
//! function. Operands are virtual registers, indices into the function's
//! interval table, where the first 32 entries are the fixed physical
//! registers (16 GPRs, then 16 XMMs), stored in the order
//! `outs, ins, tmps, saves`. The encoder interprets the operands together
//! with the flags and the memory parameters.

use super::regs::{RegClass, X64Type};
use crate::cfg::Block;
use crate::ir::SymbolId;
use keel_entity::entity_impl;
use smallvec::SmallVec;

/// A virtual register: an index into the function's live-interval table.
///
/// Indices 0..16 are the fixed GPRs, 16..32 the fixed XMMs, and everything
/// from [`VReg::FIRST_VIRTUAL`] up is a genuine virtual register.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u32);
entity_impl!(VReg, "v");

impl VReg {
    /// The first non-physical register index.
    pub const FIRST_VIRTUAL: u32 = 32;

    /// The fixed interval for physical register `enc` of `class`.
    pub fn phys(class: RegClass, enc: u8) -> Self {
        debug_assert!(enc < 16);
        Self(class.index() as u32 * 16 + u32::from(enc))
    }

    /// Is this one of the 32 fixed physical registers?
    pub fn is_phys(self) -> bool {
        self.0 < Self::FIRST_VIRTUAL
    }

    /// The hardware encoding, for physical registers.
    pub fn phys_enc(self) -> u8 {
        debug_assert!(self.is_phys());
        (self.0 % 16) as u8
    }
}

/// x86 condition codes, in hardware encoding order.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Cond {
    O = 0,
    No,
    B,
    Nb,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cond {
    /// All conditions, indexed by hardware encoding.
    const ALL: [Cond; 16] = [
        Cond::O,
        Cond::No,
        Cond::B,
        Cond::Nb,
        Cond::E,
        Cond::Ne,
        Cond::Be,
        Cond::A,
        Cond::S,
        Cond::Ns,
        Cond::P,
        Cond::Np,
        Cond::L,
        Cond::Ge,
        Cond::Le,
        Cond::G,
    ];

    /// The hardware encoding of the condition.
    pub fn enc(self) -> u8 {
        self as u8
    }

    /// The inverse condition: every even/odd encoding pair is a condition
    /// and its negation.
    pub fn invert(self) -> Self {
        Self::ALL[(self.enc() ^ 1) as usize]
    }
}

/// Memory addressing scale.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Scale {
    /// ×1
    #[default]
    X1,
    /// ×2
    X2,
    /// ×4
    X4,
    /// ×8
    X8,
}

impl Scale {
    /// The scale for a power-of-two stride, if it fits the SIB encoding.
    pub fn from_stride(stride: i64) -> Option<Self> {
        match stride {
            1 => Some(Self::X1),
            2 => Some(Self::X2),
            4 => Some(Self::X4),
            8 => Some(Self::X8),
            _ => None,
        }
    }

    /// The two SIB scale bits.
    pub fn enc(self) -> u8 {
        match self {
            Self::X1 => 0,
            Self::X2 => 1,
            Self::X4 => 2,
            Self::X8 => 3,
        }
    }
}

bitflags::bitflags! {
    /// Instruction flags.
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
    pub struct InstFlags: u16 {
        /// `lock` prefix.
        const LOCK = 1 << 0;
        /// `rep` prefix.
        const REP = 1 << 1;
        /// The instruction has a memory operand at `mem.slot`.
        const MEM = 1 << 4;
        /// The instruction references a symbol rip-relatively at `mem.slot`.
        const GLOBAL = 1 << 5;
        /// The branch target is a block label.
        const NODE = 1 << 6;
        /// The instruction carries a 32-bit immediate payload.
        const IMMEDIATE = 1 << 8;
        /// The instruction carries a 64-bit absolute payload.
        const ABSOLUTE = 1 << 9;
        /// The memory operand has an index register in the slot after the
        /// base.
        const INDEXED = 1 << 10;
        /// Spill/reload move inserted by the register allocator.
        const SPILL = 1 << 11;
        /// The epilogue should be followed by `ret`.
        const RET = 1 << 12;
    }
}

/// Memory operand parameters.
///
/// `slot` is the index into the unified operand array where the base
/// register sits (`MEM`), or where the symbol reference logically sits
/// (`GLOBAL`, consuming no register operand). With `INDEXED`, the operand
/// after the base is the index register.
#[derive(Copy, Clone, Debug, Default)]
pub struct MemSpec {
    /// Operand position of the memory operand.
    pub slot: u8,
    /// Index scale.
    pub scale: Scale,
    /// Constant displacement.
    pub disp: i32,
}

/// Kind-specific instruction payload.
#[derive(Copy, Clone, Debug, Default)]
pub enum InstProps {
    /// No payload.
    #[default]
    None,
    /// A 32-bit immediate.
    Imm(i32),
    /// A 64-bit absolute immediate (`movabs`).
    Abs(u64),
    /// A branch target block.
    Target(Block),
    /// A referenced symbol.
    Symbol(SymbolId),
}

/// Encoding category of an opcode: which byte-level shape it takes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Category {
    /// Pseudo-instruction expanded by the encoder.
    Pseudo,
    /// Single opcode byte, no operands.
    Byte,
    /// `0F`-escaped opcode byte, no operands.
    ByteExt,
    /// One-operand instruction with a /rx extension.
    Unary,
    /// `0F`-escaped one-operand instruction (jcc, setcc).
    UnaryExt,
    /// Classic two-operand ALU instruction.
    Binop,
    /// Opcode with the register encoded in its low bits (`movabs`).
    BinopPlus,
    /// `0F`-escaped two-operand instruction (`imul r, r/m`).
    BinopExt1,
    /// `0F`-escaped widening move (`movsx`, `movzx`).
    BinopExt2,
    /// `66 0F` GPR↔XMM move (`movd`/`movq`).
    BinopExt3,
    /// Shift with an implicit CL count.
    BinopCl,
    /// Scalar SSE operation with an F3/F2 prefix.
    BinopSse,
}

/// Static encoding description of an opcode.
#[derive(Copy, Clone, Debug)]
pub struct Desc {
    /// Assembly mnemonic, for logging.
    pub mnemonic: &'static str,
    /// Encoding category.
    pub category: Category,
    /// Primary opcode byte.
    pub op: u8,
    /// Opcode byte of the immediate form, when one exists.
    pub op_imm: u8,
    /// The /rx opcode extension.
    pub rx: u8,
}

const fn desc(mnemonic: &'static str, category: Category, op: u8, op_imm: u8, rx: u8) -> Desc {
    Desc {
        mnemonic,
        category,
        op,
        op_imm,
        rx,
    }
}

/// The operation of a machine instruction.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Opcode {
    /// Marks the start of a block; binds the block's label.
    Label,
    /// Receives the ABI parameter registers at function entry.
    Entry,
    /// Marks the end of a block's body ahead of its branches.
    Terminator,
    /// Expands to stack teardown, and to `ret` when flagged [`InstFlags::RET`].
    Epilogue,
    /// Expands to `xor r, r`.
    Zero,

    /// `ret`
    Ret,
    /// `int3`
    Int3,
    /// `nop`
    Nop,
    /// `ud2`
    Ud2,
    /// `syscall`
    Syscall,

    /// `not r/m`
    Not,
    /// `neg r/m`
    Neg,
    /// `div r/m`
    Div,
    /// `idiv r/m`
    Idiv,
    /// `call rel32` / `call r/m`
    Call,
    /// `jmp rel32` / `jmp r/m`
    Jmp,
    /// `jcc rel32`
    Jcc(Cond),
    /// `setcc r/m8`
    Setcc(Cond),

    /// `shl r/m, cl|imm`
    Shl,
    /// `shr r/m, cl|imm`
    Shr,
    /// `sar r/m, cl|imm`
    Sar,

    /// `add`
    Add,
    /// `or`
    Or,
    /// `and`
    And,
    /// `sub`
    Sub,
    /// `xor`
    Xor,
    /// `cmp`
    Cmp,
    /// `mov`
    Mov,
    /// `test`
    Test,

    /// `mov r64, imm64`
    Movabs,
    /// `lea r, [m]`
    Lea,
    /// `imul r, r/m`
    Imul,
    /// `imul r, r/m, imm32`
    Imul3,
    /// `movsx r, r/m8`
    MovsxB,
    /// `movsx r, r/m16`
    MovsxW,
    /// `movsxd r64, r/m32`
    MovsxD,
    /// `movzx r, r/m8`
    MovzxB,
    /// `movzx r, r/m16`
    MovzxW,

    /// `movd/movq xmm, r`
    MovI2F,
    /// `movd/movq r, xmm`
    MovF2I,

    /// `movss/movsd`
    FpMov,
    /// `addss/addsd`
    FpAdd,
    /// `subss/subsd`
    FpSub,
    /// `mulss/mulsd`
    FpMul,
    /// `divss/divsd`
    FpDiv,
    /// `ucomiss/ucomisd`
    FpUcomi,
    /// `xorps/xorpd`
    FpXor,
    /// `cvtss2sd/cvtsd2ss`
    FpCvt,
}

impl Opcode {
    /// The encoding description of this opcode.
    pub fn desc(self) -> Desc {
        use Category::*;
        match self {
            Self::Label | Self::Entry | Self::Terminator | Self::Epilogue | Self::Zero => {
                desc("pseudo", Pseudo, 0, 0, 0)
            }

            Self::Ret => desc("ret", Byte, 0xc3, 0, 0),
            Self::Int3 => desc("int3", Byte, 0xcc, 0, 0),
            Self::Nop => desc("nop", Byte, 0x90, 0, 0),
            Self::Ud2 => desc("ud2", ByteExt, 0x0b, 0, 0),
            Self::Syscall => desc("syscall", ByteExt, 0x05, 0, 0),

            Self::Not => desc("not", Unary, 0xf7, 0xf7, 0x02),
            Self::Neg => desc("neg", Unary, 0xf7, 0xf7, 0x03),
            Self::Div => desc("div", Unary, 0xf7, 0xf7, 0x06),
            Self::Idiv => desc("idiv", Unary, 0xf7, 0xf7, 0x07),
            Self::Call => desc("call", Unary, 0xe8, 0xff, 0x02),
            Self::Jmp => desc("jmp", Unary, 0xe9, 0xff, 0x04),
            Self::Jcc(cc) => desc("jcc", UnaryExt, 0x80 + cc.enc(), 0, 0),
            Self::Setcc(cc) => desc("setcc", UnaryExt, 0x90 + cc.enc(), 0, 0),

            Self::Shl => desc("shl", BinopCl, 0xd2, 0xc0, 0x04),
            Self::Shr => desc("shr", BinopCl, 0xd2, 0xc0, 0x05),
            Self::Sar => desc("sar", BinopCl, 0xd2, 0xc0, 0x07),

            Self::Add => desc("add", Binop, 0x00, 0x80, 0x00),
            Self::Or => desc("or", Binop, 0x08, 0x80, 0x01),
            Self::And => desc("and", Binop, 0x20, 0x80, 0x04),
            Self::Sub => desc("sub", Binop, 0x28, 0x80, 0x05),
            Self::Xor => desc("xor", Binop, 0x30, 0x80, 0x06),
            Self::Cmp => desc("cmp", Binop, 0x38, 0x80, 0x07),
            Self::Mov => desc("mov", Binop, 0x88, 0xc6, 0x00),
            Self::Test => desc("test", Binop, 0x84, 0xf6, 0x00),

            Self::Movabs => desc("movabs", BinopPlus, 0xb8, 0, 0),
            Self::Lea => desc("lea", Binop, 0x8d, 0, 0),
            Self::Imul => desc("imul", BinopExt1, 0xaf, 0, 0),
            Self::Imul3 => desc("imul", Binop, 0x69, 0x69, 0),
            Self::MovsxB => desc("movsx", BinopExt2, 0xbe, 0, 0),
            Self::MovsxW => desc("movsx", BinopExt2, 0xbf, 0, 0),
            Self::MovsxD => desc("movsxd", Binop, 0x63, 0, 0),
            Self::MovzxB => desc("movzx", BinopExt2, 0xb6, 0, 0),
            Self::MovzxW => desc("movzx", BinopExt2, 0xb7, 0, 0),

            Self::MovI2F => desc("mov", BinopExt3, 0x6e, 0, 0),
            Self::MovF2I => desc("mov", BinopExt3, 0x7e, 0, 0),

            Self::FpMov => desc("mov", BinopSse, 0x10, 0, 0),
            Self::FpAdd => desc("add", BinopSse, 0x58, 0, 0),
            Self::FpSub => desc("sub", BinopSse, 0x5c, 0, 0),
            Self::FpMul => desc("mul", BinopSse, 0x59, 0, 0),
            Self::FpDiv => desc("div", BinopSse, 0x5e, 0, 0),
            Self::FpUcomi => desc("ucomi", BinopSse, 0x2e, 0, 0),
            Self::FpXor => desc("xor", BinopSse, 0x57, 0, 0),
            Self::FpCvt => desc("cvt", BinopSse, 0x5a, 0, 0),
        }
    }
}

/// One machine instruction.
#[derive(Clone, Debug)]
pub struct MachInst {
    /// The operation.
    pub opcode: Opcode,
    /// Legalized operand type.
    pub ty: X64Type,
    /// Flags refining the encoding.
    pub flags: InstFlags,
    /// Position in instruction time, assigned before liveness analysis.
    pub time: u32,
    /// Operands: `outs, ins, tmps, saves`.
    pub operands: SmallVec<[VReg; 4]>,
    /// Number of output operands.
    pub out_count: u8,
    /// Number of input operands.
    pub in_count: u8,
    /// Number of temporaries (clobbers at call sites).
    pub tmp_count: u8,
    /// Number of save operands (live-across values the allocator may keep in
    /// memory).
    pub save_count: u8,
    /// Memory operand parameters, meaningful with `MEM`/`GLOBAL`.
    pub mem: MemSpec,
    /// Kind-specific payload.
    pub props: InstProps,
}

impl MachInst {
    /// A bare instruction with no operands.
    pub fn new(opcode: Opcode, ty: X64Type) -> Self {
        Self {
            opcode,
            ty,
            flags: InstFlags::empty(),
            time: 0,
            operands: SmallVec::new(),
            out_count: 0,
            in_count: 0,
            tmp_count: 0,
            save_count: 0,
            mem: MemSpec::default(),
            props: InstProps::None,
        }
    }

    /// The block-label marker for `block`.
    pub fn label(block: Block) -> Self {
        let mut inst = Self::new(Opcode::Label, X64Type::None);
        inst.flags |= InstFlags::NODE;
        inst.props = InstProps::Target(block);
        inst
    }

    /// An unconditional jump to `block`.
    pub fn jump(block: Block) -> Self {
        let mut inst = Self::new(Opcode::Jmp, X64Type::None);
        inst.flags |= InstFlags::NODE;
        inst.props = InstProps::Target(block);
        inst
    }

    /// A conditional jump to `block`.
    pub fn jcc(cc: Cond, block: Block) -> Self {
        let mut inst = Self::new(Opcode::Jcc(cc), X64Type::None);
        inst.flags |= InstFlags::NODE;
        inst.props = InstProps::Target(block);
        inst
    }

    /// A register-to-register move of the right class for `ty`.
    pub fn mov(ty: X64Type, dst: VReg, src: VReg) -> Self {
        let opcode = if ty.is_sse() { Opcode::FpMov } else { Opcode::Mov };
        Self::rr(opcode, ty, dst, src)
    }

    /// `xor dst, dst`.
    pub fn zero(ty: X64Type, dst: VReg) -> Self {
        let mut inst = Self::new(Opcode::Zero, ty);
        inst.operands.push(dst);
        inst.out_count = 1;
        inst
    }

    /// A unary or two-operand instruction `op dst, src`.
    pub fn rr(opcode: Opcode, ty: X64Type, dst: VReg, src: VReg) -> Self {
        let mut inst = Self::new(opcode, ty);
        inst.operands.push(dst);
        inst.operands.push(src);
        inst.out_count = 1;
        inst.in_count = 1;
        inst
    }

    /// A single-output instruction with no inputs (`setcc r`).
    pub fn r(opcode: Opcode, ty: X64Type, dst: VReg) -> Self {
        let mut inst = Self::new(opcode, ty);
        inst.operands.push(dst);
        inst.out_count = 1;
        inst
    }

    /// A compare-shaped instruction `op a, b` with no output.
    pub fn rr_cmp(opcode: Opcode, ty: X64Type, a: VReg, b: VReg) -> Self {
        let mut inst = Self::new(opcode, ty);
        inst.operands.push(a);
        inst.operands.push(b);
        inst.in_count = 2;
        inst
    }

    /// `op dst` with an immediate: `mov r, imm32` and friends.
    pub fn imm(opcode: Opcode, ty: X64Type, dst: VReg, value: i32) -> Self {
        let mut inst = Self::new(opcode, ty);
        inst.operands.push(dst);
        inst.out_count = 1;
        inst.flags |= InstFlags::IMMEDIATE;
        inst.props = InstProps::Imm(value);
        inst
    }

    /// `op src, imm32` with no output (`cmp r, imm`).
    pub fn ri(opcode: Opcode, ty: X64Type, src: VReg, value: i32) -> Self {
        let mut inst = Self::new(opcode, ty);
        inst.operands.push(src);
        inst.in_count = 1;
        inst.flags |= InstFlags::IMMEDIATE;
        inst.props = InstProps::Imm(value);
        inst
    }

    /// `op dst, src, imm32` (`imul3`, or a two-operand ALU op whose source
    /// is the destination).
    pub fn rri(opcode: Opcode, ty: X64Type, dst: VReg, src: VReg, value: i32) -> Self {
        let mut inst = Self::rr(opcode, ty, dst, src);
        inst.flags |= InstFlags::IMMEDIATE;
        inst.props = InstProps::Imm(value);
        inst
    }

    /// `movabs dst, imm64`.
    pub fn abs(opcode: Opcode, ty: X64Type, dst: VReg, value: u64) -> Self {
        let mut inst = Self::new(opcode, ty);
        inst.operands.push(dst);
        inst.out_count = 1;
        inst.flags |= InstFlags::ABSOLUTE;
        inst.props = InstProps::Abs(value);
        inst
    }

    /// `op dst, a, b`: a two-operand ALU op in three-address clothing. The
    /// selector ensures `dst == a` with a preceding move.
    pub fn rrr(opcode: Opcode, ty: X64Type, dst: VReg, a: VReg, b: VReg) -> Self {
        let mut inst = Self::new(opcode, ty);
        inst.operands.push(dst);
        inst.operands.push(a);
        inst.operands.push(b);
        inst.out_count = 1;
        inst.in_count = 2;
        inst
    }

    /// `op dst, [base + index*scale + disp]`.
    pub fn rm(
        opcode: Opcode,
        ty: X64Type,
        dst: VReg,
        base: VReg,
        index: Option<VReg>,
        scale: Scale,
        disp: i32,
    ) -> Self {
        let mut inst = Self::new(opcode, ty);
        inst.operands.push(dst);
        inst.out_count = 1;
        inst.operands.push(base);
        inst.in_count = 1;
        inst.flags |= InstFlags::MEM;
        inst.mem = MemSpec {
            slot: 1,
            scale,
            disp,
        };
        if let Some(index) = index {
            inst.operands.push(index);
            inst.in_count += 1;
            inst.flags |= InstFlags::INDEXED;
        }
        inst
    }

    /// `op dst, src, [mem]`: a two-operand instruction whose second source
    /// is a memory operand (folded loads).
    pub fn rrm(
        opcode: Opcode,
        ty: X64Type,
        dst: VReg,
        src: VReg,
        base: VReg,
        index: Option<VReg>,
        scale: Scale,
        disp: i32,
    ) -> Self {
        let mut inst = Self::new(opcode, ty);
        inst.operands.push(dst);
        inst.out_count = 1;
        inst.operands.push(src);
        inst.operands.push(base);
        inst.in_count = 2;
        inst.flags |= InstFlags::MEM;
        inst.mem = MemSpec {
            slot: 2,
            scale,
            disp,
        };
        if let Some(index) = index {
            inst.operands.push(index);
            inst.in_count += 1;
            inst.flags |= InstFlags::INDEXED;
        }
        inst
    }

    /// `op [base + index*scale + disp], src`, the store shape. With
    /// `src == None` the value comes from the immediate payload instead.
    pub fn mr(
        opcode: Opcode,
        ty: X64Type,
        base: VReg,
        index: Option<VReg>,
        scale: Scale,
        disp: i32,
        src: Option<VReg>,
    ) -> Self {
        let mut inst = Self::new(opcode, ty);
        inst.operands.push(base);
        inst.in_count = 1;
        inst.flags |= InstFlags::MEM;
        inst.mem = MemSpec {
            slot: 0,
            scale,
            disp,
        };
        if let Some(index) = index {
            inst.operands.push(index);
            inst.in_count += 1;
            inst.flags |= InstFlags::INDEXED;
        }
        if let Some(src) = src {
            inst.operands.push(src);
            inst.in_count += 1;
        }
        inst
    }

    /// `op dst, [rip + symbol]`.
    pub fn op_global(opcode: Opcode, ty: X64Type, dst: VReg, symbol: SymbolId) -> Self {
        let mut inst = Self::new(opcode, ty);
        inst.operands.push(dst);
        inst.out_count = 1;
        inst.flags |= InstFlags::GLOBAL;
        inst.mem = MemSpec {
            slot: 1,
            scale: Scale::X1,
            disp: 0,
        };
        inst.props = InstProps::Symbol(symbol);
        inst
    }

    /// Slices of the operand array by role: `(outs, ins, tmps, saves)`.
    pub fn operand_groups(&self) -> (&[VReg], &[VReg], &[VReg], &[VReg]) {
        let o = self.out_count as usize;
        let i = o + self.in_count as usize;
        let t = i + self.tmp_count as usize;
        let s = t + self.save_count as usize;
        (
            &self.operands[..o],
            &self.operands[o..i],
            &self.operands[i..t],
            &self.operands[t..s],
        )
    }
}

/// The lowered machine code of one function, before and after register
/// allocation.
pub struct VCode {
    /// The instructions, in final emission order.
    pub insts: Vec<MachInst>,
    /// Live intervals; the first 32 are the fixed physical registers.
    pub intervals: keel_entity::PrimaryMap<VReg, crate::regalloc::LiveInterval>,
    /// Blocks in emission order: reverse post-order with the exit block
    /// moved last.
    pub block_order: Vec<Block>,
    /// Bytes of stack frame used by locals, spill slots, and callee-saved
    /// saves. Finalized (alignment, shadow space) by the encoder.
    pub stack_usage: u32,
    /// Maximum number of stack slots any call site in the function needs.
    pub caller_usage: u32,
}

impl VCode {
    /// An empty `VCode` with the 32 fixed physical intervals seeded.
    pub fn new() -> Self {
        use crate::regalloc::LiveInterval;
        let mut intervals = keel_entity::PrimaryMap::new();
        for enc in 0..16 {
            intervals.push(LiveInterval::fixed(RegClass::Gpr, enc));
        }
        for enc in 0..16 {
            intervals.push(LiveInterval::fixed(RegClass::Xmm, enc));
        }
        Self {
            insts: Vec::new(),
            intervals,
            block_order: Vec::new(),
            stack_usage: 0,
            caller_usage: 0,
        }
    }

    /// Allocate a fresh virtual register of `class` and `ty`.
    pub fn new_vreg(&mut self, class: RegClass, ty: X64Type) -> VReg {
        self.intervals
            .push(crate::regalloc::LiveInterval::new(class, ty))
    }

    /// Assign even instruction times in vector order. Odd times are left for
    /// the allocator's split moves.
    pub fn number_insts(&mut self) {
        for (i, inst) in self.insts.iter_mut().enumerate() {
            inst.time = (i as u32 + 1) * 2;
        }
    }
}

impl Default for VCode {
    fn default() -> Self {
        Self::new()
    }
}
