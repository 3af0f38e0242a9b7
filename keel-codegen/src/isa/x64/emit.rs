//! x86-64 binary emission.
//!
//! Two phases per function. The prologue is synthesized first, once the
//! final stack usage (locals + spill slots + outgoing call area, 16-byte
//! aligned) is known. The body is then encoded in one forward pass over the
//! instruction vector: for each instruction the opcode description drives
//! the byte shape: prefixes, REX, opcode, ModR/M, SIB, displacement,
//! immediate. Label references become 32-bit fixups resolved by the code
//! buffer; symbol references become patches for the object writers. The
//! stream is finally padded to a 16-byte boundary with canonical wide nops.

use super::inst::{Category, InstFlags, InstProps, MachInst, Opcode, Scale, VCode, VReg};
use super::regs::{gpr, RegClass, X64Type};
use crate::binemit::CodeBuffer;
use crate::context::CompiledCode;
use crate::ir::SymbolId;
use crate::isa::Abi;

/// A fully-resolved instruction operand.
#[derive(Clone, Copy, Debug)]
enum Operand {
    Gpr(u8),
    Xmm(u8),
    Mem {
        base: u8,
        index: Option<u8>,
        scale: Scale,
        disp: i32,
    },
    Global {
        sym: SymbolId,
        disp: i32,
    },
    Imm(i32),
    Abs(u64),
    Label(crate::cfg::Block),
}

impl Operand {
    fn reg(self) -> u8 {
        match self {
            Self::Gpr(r) | Self::Xmm(r) => r,
            _ => panic!("operand {self:?} is not a register"),
        }
    }

    fn matches(self, other: Operand) -> bool {
        matches!(
            (self, other),
            (Self::Gpr(a), Self::Gpr(b)) if a == b
        ) || matches!(
            (self, other),
            (Self::Xmm(a), Self::Xmm(b)) if a == b
        )
    }
}

fn fits_i8(v: i32) -> bool {
    v == i32::from(v as i8)
}

#[inline]
fn modrm(m0d: u8, rx: u8, rm: u8) -> u8 {
    ((m0d & 3) << 6) | ((rx & 7) << 3) | (rm & 7)
}

#[inline]
fn sib(scale: u8, index: u8, base: u8) -> u8 {
    ((scale & 3) << 6) | ((index & 7) << 3) | (base & 7)
}

#[inline]
fn rex(w: bool, rx: u8, base: u8, index: u8) -> u8 {
    0x40 | ((w as u8) << 3) | ((rx >> 3) << 2) | ((index >> 3) << 1) | (base >> 3)
}

/// Encode the body of `vcode` and package the result.
///
/// `vcode.stack_usage` is finalized here: the outgoing argument area is
/// added (with the Win64 minimum of four shadow slots) and the whole frame
/// is aligned to 16 bytes.
pub fn emit(name: &str, vcode: &mut VCode, abi: Abi) -> CompiledCode {
    // Finalize the frame.
    let mut caller = vcode.caller_usage;
    if abi == Abi::Win64 && caller > 0 && caller < 4 {
        caller = 4;
    }
    let stack_usage = (vcode.stack_usage + caller * 8 + 15) & !15;
    vcode.stack_usage = stack_usage;

    let mut buf = CodeBuffer::new();

    // Prologue: establish the frame, then carve out the stack.
    buf.put1(0x50 + gpr::RBP);
    buf.put1(rex(true, gpr::RSP, gpr::RBP, 0));
    buf.put1(0x89);
    buf.put1(modrm(3, gpr::RSP, gpr::RBP));
    if stack_usage > 0 {
        buf.put1(rex(true, 0, gpr::RSP, 0));
        if stack_usage <= i8::MAX as u32 {
            buf.put1(0x83);
            buf.put1(modrm(3, 0x05, gpr::RSP));
            buf.put1(stack_usage as u8);
        } else {
            buf.put1(0x81);
            buf.put1(modrm(3, 0x05, gpr::RSP));
            buf.put4(stack_usage);
        }
    }
    let prologue_len = buf.len() as u8;

    let mut emitter = Emitter {
        vcode,
        buf,
        stack_usage,
    };
    emitter.body();
    let Emitter { mut buf, .. } = emitter;

    // Pad the function to a 16-byte boundary with canonical nops.
    emit_nops_to_width(&mut buf);

    let (bytes, patches) = buf.finish();
    log::debug!("emitted {} bytes for `{name}`", bytes.len());
    CompiledCode {
        bytes,
        patches,
        prologue_len,
        stack_usage,
    }
}

/// Canonical multi-byte nop encodings, 1 to 8 bytes.
const NOPS: [&[u8]; 8] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0f, 0x1f, 0x00],
    &[0x0f, 0x1f, 0x40, 0x00],
    &[0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

fn emit_nops_to_width(buf: &mut CodeBuffer) {
    let mut pad = (16 - (buf.len() & 15)) & 15;
    // Nops wider than 8 bytes are a 0x66 run in front of the 8-byte form.
    while pad > 8 {
        buf.put1(0x66);
        pad -= 1;
    }
    if pad > 0 {
        for &b in NOPS[pad as usize - 1] {
            buf.put1(b);
        }
    }
}

struct Emitter<'a> {
    vcode: &'a VCode,
    buf: CodeBuffer,
    stack_usage: u32,
}

impl<'a> Emitter<'a> {
    fn body(&mut self) {
        for i in 0..self.vcode.insts.len() {
            self.inst(i);
        }
    }

    /// Resolve the operand at position `i`, returning it and the number of
    /// operand slots consumed.
    fn resolve(&self, inst: &MachInst, i: usize) -> (Operand, usize) {
        if inst
            .flags
            .intersects(InstFlags::MEM | InstFlags::GLOBAL)
            && i == inst.mem.slot as usize
        {
            if inst.flags.contains(InstFlags::GLOBAL) {
                let sym = match inst.props {
                    InstProps::Symbol(sym) => sym,
                    _ => panic!("global operand without a symbol"),
                };
                return (
                    Operand::Global {
                        sym,
                        disp: inst.mem.disp,
                    },
                    0,
                );
            }
            let base_iv = &self.vcode.intervals[inst.operands[i]];
            assert!(
                !base_iv.is_spilled(),
                "memory operand base was spilled by the allocator"
            );
            let base = base_iv.assigned.expect("unallocated base register");
            if inst.flags.contains(InstFlags::INDEXED) {
                let index_iv = &self.vcode.intervals[inst.operands[i + 1]];
                assert!(!index_iv.is_spilled());
                return (
                    Operand::Mem {
                        base,
                        index: Some(index_iv.assigned.expect("unallocated index register")),
                        scale: inst.mem.scale,
                        disp: inst.mem.disp,
                    },
                    2,
                );
            }
            return (
                Operand::Mem {
                    base,
                    index: None,
                    scale: inst.mem.scale,
                    disp: inst.mem.disp,
                },
                1,
            );
        }

        let iv = &self.vcode.intervals[inst.operands[i]];
        if iv.is_spilled() {
            return (
                Operand::Mem {
                    base: gpr::RBP,
                    index: None,
                    scale: Scale::X1,
                    disp: -(iv.spill as i32),
                },
                1,
            );
        }
        let enc = iv.assigned.unwrap_or_else(|| {
            panic!("operand {} has no register", inst.operands[i])
        });
        let op = match iv.class {
            RegClass::Gpr => Operand::Gpr(enc),
            RegClass::Xmm => Operand::Xmm(enc),
        };
        (op, 1)
    }

    fn inst(&mut self, index: usize) {
        let inst = self.vcode.insts[index].clone();
        let desc = inst.opcode.desc();
        let in_base = inst.out_count as usize;

        match inst.opcode {
            Opcode::Label => {
                let block = match inst.props {
                    InstProps::Target(block) => block,
                    _ => panic!("label without a block"),
                };
                self.buf.bind_label(block);
                return;
            }
            Opcode::Entry | Opcode::Terminator => return,
            Opcode::Epilogue => {
                self.epilogue();
                if inst.flags.contains(InstFlags::RET) {
                    self.buf.put1(0xc3);
                }
                return;
            }
            Opcode::Zero => {
                let (dst, _) = self.resolve(&inst, 0);
                let opcode = if inst.ty.is_sse() {
                    Opcode::FpXor
                } else {
                    Opcode::Xor
                };
                self.emit2(opcode, dst, dst, inst.ty);
                return;
            }
            Opcode::Jmp | Opcode::Jcc(_) if inst.flags.contains(InstFlags::NODE) => {
                let block = match inst.props {
                    InstProps::Target(block) => block,
                    _ => panic!("branch without a target"),
                };
                self.emit1(inst.opcode, Operand::Label(block), X64Type::Dword);
                return;
            }
            // Direct calls and tail jumps to a symbol: rel32 plus a patch.
            Opcode::Call | Opcode::Jmp if inst.flags.contains(InstFlags::GLOBAL) => {
                let sym = match inst.props {
                    InstProps::Symbol(sym) => sym,
                    _ => panic!("direct call without a symbol"),
                };
                self.emit1(inst.opcode, Operand::Global { sym, disp: 0 }, X64Type::Qword);
                return;
            }
            Opcode::Call => {
                let target = self.resolve(&inst, in_base).0;
                self.emit1(Opcode::Call, target, X64Type::Qword);
                return;
            }
            // A rip-relative source with no register inputs (`lea r, [rip+sym]`).
            _ if inst.flags.contains(InstFlags::GLOBAL) && inst.in_count == 0 => {
                let (out, _) = self.resolve(&inst, 0);
                let sym = match inst.props {
                    InstProps::Symbol(sym) => sym,
                    _ => panic!("global operand without a symbol"),
                };
                self.emit2(
                    inst.opcode,
                    out,
                    Operand::Global {
                        sym,
                        disp: inst.mem.disp,
                    },
                    inst.ty,
                );
                return;
            }
            _ => {}
        }

        if matches!(desc.category, Category::Byte | Category::ByteExt) {
            if inst.flags.contains(InstFlags::REP) {
                self.buf.put1(0xf3);
            }
            self.emit0(inst.opcode, inst.ty);
            return;
        }

        // Prefixes shared by the general shapes.
        if inst.flags.contains(InstFlags::LOCK) {
            self.buf.put1(0xf0);
        }
        if inst.flags.contains(InstFlags::REP) {
            self.buf.put1(0xf3);
        }

        let dt = inst.ty;
        let unary = matches!(desc.category, Category::Unary | Category::UnaryExt);
        let is_mov = matches!(inst.opcode, Opcode::Mov | Opcode::FpMov);

        let mut out = None;
        let mut consumed = in_base;
        if inst.out_count == 1 {
            let (o, n) = self.resolve(&inst, 0);
            out = Some(o);
            debug_assert_eq!(n.max(1), in_base);
        }

        let total = in_base + inst.in_count as usize;
        let mut ternary = false;
        if inst.in_count > 0 {
            let (left, n) = self.resolve(&inst, consumed);
            consumed += n.max(1);
            ternary = consumed < total
                || inst
                    .flags
                    .intersects(InstFlags::IMMEDIATE | InstFlags::ABSOLUTE);

            // Ternary imul has its own immediate form.
            if ternary
                && inst.opcode == Opcode::Imul3
                && inst.flags.contains(InstFlags::IMMEDIATE)
            {
                let imm = match inst.props {
                    InstProps::Imm(v) => v,
                    _ => unreachable!(),
                };
                let out = out.expect("imul without destination");
                if !out.matches(left) {
                    self.emit2(Opcode::Mov, out, left, dt);
                }
                self.emit2(Opcode::Imul3, out, out, dt);
                if dt == X64Type::Word {
                    self.buf.put2(imm as u16);
                } else {
                    self.buf.put4(imm as u32);
                }
                return;
            }

            if inst.out_count == 0 {
                out = Some(left);
            } else if matches!(inst.opcode, Opcode::Div | Opcode::Idiv) {
                self.emit1(inst.opcode, left, dt);
                return;
            } else if !unary {
                let out = out.expect("binary instruction without destination");
                if ternary || is_mov {
                    if !out.matches(left) {
                        let mv = if dt.is_sse() { Opcode::FpMov } else { Opcode::Mov };
                        self.emit2(mv, out, left, dt);
                    }
                } else {
                    self.emit2(inst.opcode, out, left, dt);
                }
            }
        }

        if unary {
            self.emit1(inst.opcode, out.expect("unary without operand"), dt);
            return;
        }

        if inst.flags.contains(InstFlags::IMMEDIATE) {
            let imm = match inst.props {
                InstProps::Imm(v) => v,
                _ => panic!("immediate flag without immediate payload"),
            };
            self.emit2(inst.opcode, out.expect("no destination"), Operand::Imm(imm), dt);
        } else if inst.flags.contains(InstFlags::ABSOLUTE) {
            let value = match inst.props {
                InstProps::Abs(v) => v,
                _ => panic!("absolute flag without absolute payload"),
            };
            self.emit2(inst.opcode, out.expect("no destination"), Operand::Abs(value), dt);
        } else if ternary {
            let (right, _) = self.resolve(&inst, consumed);
            let out = out.expect("ternary without destination");
            if !(is_mov && out.matches(right)) {
                self.emit2(inst.opcode, out, right, dt);
            }
        }
    }

    fn epilogue(&mut self) {
        if self.stack_usage > 0 {
            self.buf.put1(rex(true, 0, gpr::RSP, 0));
            if self.stack_usage <= i8::MAX as u32 {
                self.buf.put1(0x83);
                self.buf.put1(modrm(3, 0x00, gpr::RSP));
                self.buf.put1(self.stack_usage as u8);
            } else {
                self.buf.put1(0x81);
                self.buf.put1(modrm(3, 0x00, gpr::RSP));
                self.buf.put4(self.stack_usage);
            }
        }
        self.buf.put1(0x58 + gpr::RBP);
    }

    /// Nullary shape: optional REX.W, optional 0F escape, opcode byte(s).
    fn emit0(&mut self, opcode: Opcode, dt: X64Type) {
        let desc = opcode.desc();
        if dt == X64Type::Qword {
            self.buf.put1(0x48);
        }
        if desc.category == Category::ByteExt {
            self.buf.put1(0x0f);
        }
        self.buf.put1(desc.op);
    }

    /// Unary shape: one explicit operand plus a /rx extension.
    fn emit1(&mut self, opcode: Opcode, operand: Operand, dt: X64Type) {
        let desc = opcode.desc();
        let is_rex = dt == X64Type::Byte || dt == X64Type::Qword;
        let is_rexw = dt == X64Type::Qword;
        let op_imm = desc.op_imm;
        let rx = desc.rx;

        match operand {
            Operand::Gpr(r) => {
                // Byte operations only need REX to reach spl/bpl/sil/dil.
                if is_rexw || r >= 8 || (dt == X64Type::Byte && r >= 4) {
                    self.buf.put1(rex(is_rexw, 0, r, 0));
                }
                if desc.category == Category::UnaryExt {
                    self.buf.put1(0x0f);
                }
                self.buf.put1(if op_imm != 0 { op_imm } else { desc.op });
                self.buf.put1(modrm(3, rx, r));
            }
            Operand::Mem {
                base,
                index,
                scale,
                disp,
            } => {
                let needs_index = index.is_some() || (base & 7) == gpr::RSP;
                self.buf
                    .put1(rex(is_rexw, 0, base, index.unwrap_or(0)));
                if desc.category == Category::UnaryExt {
                    self.buf.put1(0x0f);
                }
                self.buf.put1(op_imm);

                let m = if fits_i8(disp) { 1 } else { 2 };
                self.buf
                    .put1(modrm(m, rx, if needs_index { gpr::RSP } else { base }));
                if needs_index {
                    let idx = if (base & 7) == gpr::RSP {
                        gpr::RSP
                    } else {
                        index.unwrap_or(gpr::RSP)
                    };
                    self.buf.put1(sib(scale.enc(), idx, base));
                }
                if m == 1 {
                    self.buf.put1(disp as u8);
                } else {
                    self.buf.put4(disp as u32);
                }
            }
            Operand::Global { sym, disp } => {
                if desc.op != 0 && desc.category != Category::UnaryExt {
                    // Direct rel32 form (call/jmp).
                    self.buf.put1(desc.op);
                } else {
                    if is_rex {
                        self.buf.put1(if is_rexw { 0x48 } else { 0x40 });
                    }
                    if desc.category == Category::UnaryExt {
                        self.buf.put1(0x0f);
                    }
                    self.buf.put1(op_imm);
                    self.buf.put1(modrm(0, rx, gpr::RBP));
                }
                self.buf.put4(disp as u32);
                self.buf.add_patch(sym);
            }
            Operand::Label(block) => {
                if desc.category == Category::UnaryExt {
                    self.buf.put1(0x0f);
                }
                self.buf.put1(desc.op);
                let pos = self.buf.len();
                self.buf.put4(0);
                self.buf.use_label_at(pos, block);
            }
            _ => panic!("invalid unary operand {operand:?}"),
        }
    }

    /// Binary shape: the work-horse covering register, memory, immediate,
    /// and rip-relative forms.
    fn emit2(&mut self, opcode: Opcode, a: Operand, b: Operand, dt: X64Type) {
        if matches!(a, Operand::Xmm(_)) || matches!(b, Operand::Xmm(_)) || dt.is_sse() {
            self.emit2_sse(opcode, a, b, dt);
            return;
        }

        let desc = opcode.desc();
        let mut a = a;
        let mut b = b;
        let mut dt = dt;
        assert!(
            matches!(dt, X64Type::Byte | X64Type::Word | X64Type::Dword | X64Type::Qword),
            "invalid data type {dt:?} for {opcode:?}"
        );

        if opcode == Opcode::Movabs {
            let (r, value) = match (a, b) {
                (Operand::Gpr(r), Operand::Abs(v)) => (r, v),
                _ => panic!("movabs needs a register and a 64-bit immediate"),
            };
            self.buf.put1(0x40 | 8 | (r >> 3));
            self.buf.put1(desc.op + (r & 7));
            self.buf.put8(value);
            return;
        }

        // The ModR/M `r/m` field must hold the memory operand, and some
        // opcodes fix which side is the plain register.
        let dir = matches!(b, Operand::Mem { .. } | Operand::Global { .. });
        if dir
            || desc.op == 0x63
            || desc.op == 0x69
            || desc.op == 0x6e
            || desc.op == 0xaf
            || desc.category == Category::BinopExt2
        {
            core::mem::swap(&mut a, &mut b);
        }

        // The low opcode bit usually selects the operand size.
        let mut sz = dt != X64Type::Byte;

        // An immediate that works as a sign-extended 8-bit number.
        let short_imm = sz
            && matches!(b, Operand::Imm(v) if fits_i8(v))
            && desc.op_imm == 0x80;

        let is_gpr_only_dst = desc.op & 1 != 0;
        let dir_flag = (dir != is_gpr_only_dst) && desc.op != 0x69;

        if desc.category == Category::BinopExt3 {
            self.buf.put1(0x66);
        } else if dt == X64Type::Word && desc.category != Category::BinopExt2 {
            self.buf.put1(0x66);
        }

        // REX prefix assembly: W for 64-bit, B/X from the r/m side, R from
        // the register side.
        let mut rex_prefix = 0x40 | if dt == X64Type::Qword { 8 } else { 0 };
        let base = match a {
            Operand::Mem { base, .. } => base,
            Operand::Gpr(r) => r,
            _ => gpr::RBP,
        };
        if let Operand::Mem {
            index: Some(index), ..
        } = a
        {
            rex_prefix |= (index >> 3) << 1;
        }
        let mut rx = match b {
            Operand::Gpr(r) => r,
            _ => desc.rx,
        };
        if desc.category == Category::BinopCl {
            debug_assert!(
                matches!(b, Operand::Imm(_))
                    || matches!(b, Operand::Gpr(r) if r == gpr::RCX),
                "shift count must be an immediate or cl"
            );
            dt = X64Type::Byte;
            rx = desc.rx;
        }
        rex_prefix |= base >> 3;
        rex_prefix |= (rx >> 3) << 2;

        let byte_regs = dt == X64Type::Byte
            && (matches!(a, Operand::Gpr(r) if r >= 4) || matches!(b, Operand::Gpr(r) if r >= 4));
        if rex_prefix != 0x40 || byte_regs || opcode == Opcode::MovzxB {
            self.buf.put1(rex_prefix);
        }

        if desc.category == Category::BinopExt3 {
            self.buf.put1(0x0f);
            self.buf.put1(desc.op);
        } else {
            if matches!(desc.category, Category::BinopExt1 | Category::BinopExt2) {
                sz = false;
                self.buf.put1(0x0f);
            }

            let has_imm = matches!(b, Operand::Imm(_));
            debug_assert!(
                !has_imm || desc.op_imm != 0 || desc.rx != 0,
                "no immediate form of {opcode:?}"
            );
            let mut op = if has_imm { desc.op_imm } else { desc.op };
            op |= sz as u8;
            op |= (dir_flag as u8) << 1;
            op |= (short_imm as u8) << 1;
            self.buf.put1(op);
        }

        self.emit_mem_operand(rx, a);

        // Memory displacements go before immediates.
        let disp_patch = self.buf.len().saturating_sub(4);

        if let Operand::Imm(imm) = b {
            if dt == X64Type::Byte || short_imm {
                self.buf.put1(imm as u8);
            } else if dt == X64Type::Word {
                self.buf.put2(imm as u16);
            } else {
                self.buf.put4(imm as u32);
            }
        }

        // A rip-relative operand followed by an immediate must account for
        // the immediate bytes in its displacement.
        if matches!(a, Operand::Global { .. }) && disp_patch + 4 != self.buf.len() {
            let adjust = (disp_patch + 4).wrapping_sub(self.buf.len());
            self.buf.patch4(disp_patch, adjust);
        }
    }

    /// Scalar SSE shape: `F3/F2/66` prefix, `0F` escape, opcode, ModR/M.
    fn emit2_sse(&mut self, opcode: Opcode, a: Operand, b: Operand, dt: X64Type) {
        let desc = opcode.desc();

        // `movd/movq` between register files uses the 66-prefixed form.
        if desc.category == Category::BinopExt3 {
            self.buf.put1(0x66);
            let (reg, rm) = match opcode {
                // movd/movq xmm, r/m: the xmm destination is the reg field.
                Opcode::MovI2F => (a.reg(), b),
                // movd/movq r/m, xmm: the xmm source is the reg field.
                Opcode::MovF2I => (b.reg(), a),
                _ => panic!("{opcode:?} is not a register-file move"),
            };
            let base = match rm {
                Operand::Gpr(r) => r,
                Operand::Mem { base, .. } => base,
                _ => panic!("invalid movq operand"),
            };
            let w = dt == X64Type::Qword;
            let prefix = rex(w, reg, base, 0);
            if prefix != 0x40 || w {
                self.buf.put1(prefix);
            }
            self.buf.put1(0x0f);
            self.buf.put1(desc.op);
            self.emit_mem_operand(reg, rm);
            return;
        }

        // Scalar prefix: F3 for single, F2 for double; ucomis* uses the
        // 66/no-prefix packed forms, xorps needs none.
        match opcode {
            Opcode::FpUcomi => {
                if dt == X64Type::SseSd {
                    self.buf.put1(0x66);
                }
            }
            Opcode::FpXor => {}
            _ => {
                self.buf
                    .put1(if dt == X64Type::SseSd { 0xf2 } else { 0xf3 });
            }
        }

        // Memory (or the second register) sits in r/m; the xmm register in
        // the reg field. Stores flip the opcode's low bit.
        let (reg, rm, store) = match (a, b) {
            (Operand::Xmm(r), _) => (r, b, false),
            (_, Operand::Xmm(r)) => (r, a, true),
            _ => panic!("sse operation without an xmm operand"),
        };
        let base = match rm {
            Operand::Xmm(r) | Operand::Gpr(r) => r,
            Operand::Mem { base, .. } => base,
            Operand::Global { .. } => gpr::RBP,
            _ => panic!("invalid sse operand {rm:?}"),
        };
        let index = match rm {
            Operand::Mem {
                index: Some(index), ..
            } => index,
            _ => 0,
        };
        let prefix = rex(false, reg, base, index);
        if prefix != 0x40 {
            self.buf.put1(prefix);
        }
        self.buf.put1(0x0f);
        let mut op = desc.op;
        if store && opcode == Opcode::FpMov {
            op |= 1;
        }
        self.buf.put1(op);
        self.emit_mem_operand(reg, rm);
    }

    /// ModR/M + SIB + displacement for the r/m operand `a`.
    fn emit_mem_operand(&mut self, rx: u8, a: Operand) {
        match a {
            Operand::Gpr(r) | Operand::Xmm(r) => {
                self.buf.put1(modrm(3, rx, r));
            }
            Operand::Mem {
                base,
                index,
                scale,
                disp,
            } => {
                let needs_index = index.is_some() || (base & 7) == gpr::RSP;

                let m = if disp == 0 && (base & 7) != gpr::RBP {
                    0
                } else if fits_i8(disp) {
                    1
                } else {
                    2
                };
                self.buf
                    .put1(modrm(m, rx, if needs_index { gpr::RSP } else { base }));

                if needs_index {
                    let idx = match index {
                        Some(i) => i,
                        // SIB with index 100 means "no index".
                        None => gpr::RSP,
                    };
                    self.buf.put1(sib(scale.enc(), idx, base));
                }

                if m == 1 {
                    self.buf.put1(disp as u8);
                } else if m == 2 {
                    self.buf.put4(disp as u32);
                }
            }
            Operand::Global { sym, disp } => {
                self.buf.put1(modrm(0, rx, gpr::RBP));
                self.buf.put4(disp as u32);
                self.buf.add_patch(sym);
            }
            _ => panic!("operand {a:?} cannot be a ModR/M target"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::inst::{InstFlags, MachInst, Opcode, Scale, VCode, VReg};
    use super::super::regs::{gpr, RegClass, X64Type};
    use super::*;

    /// Emit a single instruction with physical operands and return the hex
    /// string of the produced bytes.
    fn enc(inst: MachInst) -> String {
        let mut vcode = VCode::new();
        vcode.insts.push(inst);
        vcode.number_insts();
        let mut emitter = Emitter {
            vcode: &vcode,
            buf: CodeBuffer::new(),
            stack_usage: 0,
        };
        emitter.body();
        let (bytes, _) = emitter.buf.finish();
        bytes
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join("")
    }

    fn g(enc: u8) -> VReg {
        VReg::phys(RegClass::Gpr, enc)
    }

    #[test]
    fn mov_reg_reg() {
        // mov eax, ecx
        assert_eq!(
            enc(MachInst::mov(X64Type::Dword, g(gpr::RAX), g(gpr::RCX))),
            "89C8"
        );
        // mov rax, rdi
        assert_eq!(
            enc(MachInst::mov(X64Type::Qword, g(gpr::RAX), g(gpr::RDI))),
            "4889F8"
        );
        // mov r8, rax
        assert_eq!(
            enc(MachInst::mov(X64Type::Qword, g(gpr::R8), g(gpr::RAX))),
            "4989C0"
        );
    }

    #[test]
    fn mov_imm() {
        // mov eax, 7
        assert_eq!(
            enc(MachInst::imm(Opcode::Mov, X64Type::Dword, g(gpr::RAX), 7)),
            "C7C007000000"
        );
        // movabs rax, 0x1122334455667788
        assert_eq!(
            enc(MachInst::abs(
                Opcode::Movabs,
                X64Type::Qword,
                g(gpr::RAX),
                0x1122_3344_5566_7788
            )),
            "48B88877665544332211"
        );
    }

    #[test]
    fn xor_zero() {
        // xor eax, eax
        assert_eq!(enc(MachInst::zero(X64Type::Dword, g(gpr::RAX))), "31C0");
    }

    #[test]
    fn lea_base_disp() {
        // lea rax, [rdi + 7]
        assert_eq!(
            enc(MachInst::rm(
                Opcode::Lea,
                X64Type::Qword,
                g(gpr::RAX),
                g(gpr::RDI),
                None,
                Scale::X1,
                7
            )),
            "488D4707"
        );
        // lea rax, [rcx + rdx*4 + 16]
        assert_eq!(
            enc(MachInst::rm(
                Opcode::Lea,
                X64Type::Qword,
                g(gpr::RAX),
                g(gpr::RCX),
                Some(g(gpr::RDX)),
                Scale::X4,
                16
            )),
            "488D449110"
        );
    }

    #[test]
    fn store_forms() {
        // mov dword ptr [rbp - 4], 5
        let inst = {
            let mut i = MachInst::mr(
                Opcode::Mov,
                X64Type::Dword,
                g(gpr::RBP),
                None,
                Scale::X1,
                -4,
                None,
            );
            i.flags |= InstFlags::IMMEDIATE;
            i.props = super::InstProps::Imm(5);
            i
        };
        assert_eq!(enc(inst), "C745FC05000000");

        // mov [rsp + 32], rax; an rsp base always takes a SIB byte.
        let inst = MachInst::mr(
            Opcode::Mov,
            X64Type::Qword,
            g(gpr::RSP),
            None,
            Scale::X1,
            32,
            Some(g(gpr::RAX)),
        );
        assert_eq!(enc(inst), "4889442420");
    }

    #[test]
    fn load_form() {
        // mov eax, [rbp - 4]
        let inst = MachInst::rm(
            Opcode::Mov,
            X64Type::Dword,
            g(gpr::RAX),
            g(gpr::RBP),
            None,
            Scale::X1,
            -4,
        );
        assert_eq!(enc(inst), "8B45FC");
    }

    #[test]
    fn alu_and_test() {
        // add rax, rcx  (via the rrr shape: dst == first input, no move)
        assert_eq!(
            enc(MachInst::rrr(
                Opcode::Add,
                X64Type::Qword,
                g(gpr::RAX),
                g(gpr::RAX),
                g(gpr::RCX)
            )),
            "4801C8"
        );
        // test edi, edi
        assert_eq!(
            enc(MachInst::rr_cmp(
                Opcode::Test,
                X64Type::Dword,
                g(gpr::RDI),
                g(gpr::RDI)
            )),
            "85FF"
        );
        // cmp rdi, 10
        assert_eq!(
            enc(MachInst::ri(Opcode::Cmp, X64Type::Qword, g(gpr::RDI), 10)),
            "4883FF0A"
        );
    }

    #[test]
    fn setcc_and_ext() {
        use super::super::inst::Cond;
        // sete al
        assert_eq!(
            enc(MachInst::r(Opcode::Setcc(Cond::E), X64Type::Byte, g(gpr::RAX))),
            "0F94C0"
        );
        // movsx eax, cl
        assert_eq!(
            enc(MachInst::rr(
                Opcode::MovsxB,
                X64Type::Dword,
                g(gpr::RAX),
                g(gpr::RCX)
            )),
            "0FBEC1"
        );
        // movsxd rax, ecx
        assert_eq!(
            enc(MachInst::rr(
                Opcode::MovsxD,
                X64Type::Qword,
                g(gpr::RAX),
                g(gpr::RCX)
            )),
            "4863C1"
        );
    }

    #[test]
    fn imul_imm() {
        // imul rax, rax, 100
        let inst = MachInst::rri(Opcode::Imul3, X64Type::Qword, g(gpr::RAX), g(gpr::RAX), 100);
        assert_eq!(enc(inst), "4869C064000000");
    }

    #[test]
    fn shifts() {
        // shl rax, 3
        let inst = MachInst::rri(Opcode::Shl, X64Type::Qword, g(gpr::RAX), g(gpr::RAX), 3);
        assert_eq!(enc(inst), "48C1E003");
    }

    #[test]
    fn padding_is_canonical() {
        let mut buf = CodeBuffer::new();
        buf.put1(0xc3);
        emit_nops_to_width(&mut buf);
        let (bytes, _) = buf.finish();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 0xc3);
        // 15 bytes of padding: a run of 0x66 prefixes then the 8-byte nop.
        assert_eq!(&bytes[1..8], &[0x66; 7]);
        assert_eq!(
            &bytes[8..],
            &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }
}
