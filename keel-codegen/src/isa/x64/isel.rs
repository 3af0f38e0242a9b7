//! x86-64 instruction selection.
//!
//! Selection runs one basic block at a time over the scheduled graph. The
//! intra-block order comes from a DFS rooted at the block's terminator:
//! inputs are visited right-to-left, anti-dependencies through the memory
//! chain keep readers ahead of the next writer, and successor phis are
//! seeded with the value flowing along this block's edge. Nodes are then
//! lowered in reverse, which lets later nodes fold their single-use operands
//! (loads into ALU memory forms, constants into immediates) before those
//! operands are themselves materialized.

use super::abi::{param_descriptor, ParamDescriptor, RETURN_GPRS};
use super::inst::{Cond, InstFlags, InstProps, MachInst, Opcode, Scale, VCode, VReg};
use super::regs::{gpr, legalize, RegClass, X64Type};
use crate::cfg::{Block, ControlFlowGraph};
use crate::ir::{Function, Node, NodeKind, NodeProps};
use crate::isa::{Abi, Target};
use crate::schedule::Schedule;
use crate::{CodegenError, CodegenResult};
use keel_entity::packed_option::PackedOption;
use keel_entity::{EntitySet, SecondaryMap};
use rustc_hash::FxHashMap;

/// Virtual-register count past which the function is rejected rather than
/// compiled. The allocator is the only component allowed to fail on resource
/// exhaustion, and this is the resource.
const MAX_VREGS: usize = u16::MAX as usize;

/// Per-node selection state.
#[derive(Clone, Default)]
struct ValueState {
    /// The node has been scheduled and will be (or has been) defined.
    tracked: bool,
    /// Users still expected to consume the value.
    use_count: u32,
    /// The virtual register holding the value, once known.
    vreg: PackedOption<VReg>,
}

/// An outgoing phi assignment: at the end of the current block, `dst` must
/// receive the value of `target`.
struct PhiVal {
    phi: Node,
    target: PackedOption<Node>,
    dst: VReg,
}

/// Select instructions for `func`, producing virtual-register machine code.
pub fn select(
    func: &Function,
    cfg: &ControlFlowGraph,
    schedule: &Schedule,
    target: Target,
) -> CodegenResult<VCode> {
    Selector::new(func, cfg, schedule, target).run()
}

struct Selector<'a> {
    func: &'a Function,
    cfg: &'a ControlFlowGraph,
    schedule: &'a Schedule,
    abi: Abi,
    desc: ParamDescriptor,

    vcode: VCode,
    values: SecondaryMap<Node, ValueState>,
    visited: EntitySet<Node>,
    work: Vec<Node>,
    phi_values: Vec<PhiVal>,
    stack_slots: FxHashMap<Node, i32>,
    fallthrough: Option<Block>,

    /// Scratch the current node lowers into.
    cur: Vec<MachInst>,
}

impl<'a> Selector<'a> {
    fn new(
        func: &'a Function,
        cfg: &'a ControlFlowGraph,
        schedule: &'a Schedule,
        target: Target,
    ) -> Self {
        Self {
            func,
            cfg,
            schedule,
            abi: target.abi(),
            desc: param_descriptor(target.abi()),
            vcode: VCode::new(),
            values: SecondaryMap::new(),
            visited: EntitySet::new(),
            work: Vec::new(),
            phi_values: Vec::new(),
            stack_slots: FxHashMap::default(),
            fallthrough: None,
            cur: Vec::new(),
        }
    }

    fn run(mut self) -> CodegenResult<VCode> {
        // Emission order: RPO with the exit block moved last.
        let mut order: Vec<Block> = Vec::new();
        let mut exit_block = None;
        for block in self.cfg.rpo() {
            if self.func.kind(self.cfg.blocks[block].end) == NodeKind::Exit {
                exit_block = Some(block);
            } else {
                order.push(block);
            }
        }
        order.extend(exit_block);
        self.vcode.block_order = order.clone();

        // Data phis are handled through the phi-move machinery, never as
        // ordinary work items: pre-mark them visited and pre-track them.
        for &block in &order {
            let head = self.cfg.blocks[block].entry;
            let phis: Vec<Node> = self
                .func
                .users(head)
                .filter(|&(user, _)| {
                    self.func.kind(user) == NodeKind::Phi && !self.func.ty(user).is_memory()
                })
                .map(|(user, _)| user)
                .collect();
            for phi in phis {
                self.values[phi].tracked = true;
                self.visited.insert(phi);
            }
        }

        for i in 0..order.len() {
            let block = order[i];
            self.fallthrough = order.get(i + 1).copied();
            self.select_block(block, i)?;
        }

        if self.vcode.intervals.len() > MAX_VREGS {
            return Err(CodegenError::VirtualRegisterOverflow(self.func.name.clone()));
        }

        self.vcode.number_insts();
        log::debug!(
            "selected {} instructions, {} vregs for `{}`",
            self.vcode.insts.len(),
            self.vcode.intervals.len(),
            self.func.name
        );
        Ok(self.vcode)
    }

    fn select_block(&mut self, block: Block, rpo_index: usize) -> CodegenResult<()> {
        let head = self.cfg.blocks[block].entry;
        let end = self.cfg.blocks[block].end;
        let work_start = self.work.len();

        // Intra-block schedule.
        self.dfs_schedule(block, end, true);

        // The entry block also owns the parameter projections.
        if rpo_index == 0 {
            let entry = self.func.entry.unwrap();
            let projs: Vec<Node> = self
                .func
                .users(entry)
                .filter(|&(user, _)| self.func.kind(user) == NodeKind::Projection)
                .map(|(user, _)| user)
                .collect();
            for proj in projs {
                if self.visited.insert(proj) {
                    self.work.push(proj);
                }
            }
        }

        // Define every node scheduled into this block and count its live
        // users.
        for i in work_start..self.work.len() {
            let node = self.work[i];
            let use_count = self
                .func
                .users(node)
                .filter(|&(user, _)| self.schedule.block_of(user).is_some())
                .count() as u32;
            self.values[node].tracked = true;
            self.values[node].use_count = use_count;
        }

        // Assign destinations for the outgoing phi moves seeded by the DFS.
        let old_phi_count = self.phi_values.len();
        for i in 0..old_phi_count {
            let phi = self.phi_values[i].phi;
            self.phi_values[i].dst = self.use_value(phi);
        }

        // Phis of this block see themselves as the previous iteration's
        // value: copy into a temporary and read that inside the block.
        let mut prefix = Vec::new();
        if self.func.kind(head) == NodeKind::Region {
            let phis: Vec<Node> = self
                .func
                .users(head)
                .filter(|&(user, _)| {
                    self.func.kind(user) == NodeKind::Phi && !self.func.ty(user).is_memory()
                })
                .map(|(user, _)| user)
                .collect();
            for phi in phis {
                let dst = self.use_value(phi);
                self.phi_values.push(PhiVal {
                    phi,
                    target: None.into(),
                    dst,
                });
                let ty = legalize(self.func.ty(phi));
                let tmp = self.vcode.new_vreg(RegClass::of(self.func.ty(phi)), ty);
                prefix.push(MachInst::mov(ty, tmp, dst));
                self.values[phi].vreg = tmp.into();
            }
        }

        // Entry lowering happens ahead of the reverse walk so the parameter
        // registers are pinned at the very top of the function.
        let mut entry_seq = Vec::new();
        if rpo_index == 0 {
            debug_assert!(self.cur.is_empty());
            let entry = self.func.entry.unwrap();
            self.select_node(entry, None);
            entry_seq = core::mem::take(&mut self.cur);
        }

        // Lower the block's nodes in reverse; collect one sequence per node.
        let mut seqs: Vec<Vec<MachInst>> = Vec::new();
        for idx in (work_start..self.work.len()).rev() {
            let node = self.work[idx];
            if self.func.kind(node) == NodeKind::Entry {
                continue;
            }

            let vreg = self.values[node].vreg.expand();
            if node != end && vreg.is_none() && self.func.should_rematerialize(node) {
                continue;
            }

            debug_assert!(self.cur.is_empty());
            let ty = self.func.ty(node);
            if ty.is_tuple() || ty.is_control() || ty.is_memory() {
                self.select_node(node, vreg);
            } else if self.values[node].use_count > 0 || vreg.is_some() {
                let vreg = match vreg {
                    Some(v) => v,
                    None => {
                        let v = self.new_value_vreg(node);
                        self.values[node].vreg = v.into();
                        v
                    }
                };
                self.select_node(node, Some(vreg));
            }
            let seq = core::mem::take(&mut self.cur);
            if !seq.is_empty() {
                seqs.push(seq);
            }
        }

        // Restore this block's phis to their canonical registers.
        for pv in &self.phi_values[old_phi_count..] {
            self.values[pv.phi].vreg = pv.dst.into();
        }
        self.phi_values.truncate(old_phi_count);

        // Stitch the block together: label, phi copies, entry, the node
        // sequences in forward order.
        self.vcode.insts.push(MachInst::label(block));
        self.vcode.insts.extend(prefix);
        self.vcode.insts.extend(entry_seq);
        for seq in seqs.into_iter().rev() {
            self.vcode.insts.extend(seq);
        }

        // Implicit goto for blocks that simply fall into their successor.
        if !self.func.kind(end).is_terminator() {
            let succ = self.cfg.blocks[block].succs[0];
            self.vcode
                .insts
                .push(MachInst::new(Opcode::Terminator, X64Type::None));

            debug_assert!(self.cur.is_empty());
            let moves: Vec<(Node, VReg)> = self.phi_values[..old_phi_count]
                .iter()
                .map(|pv| (pv.target.expect("outgoing phi without a source"), pv.dst))
                .collect();
            for (target, dst) in moves {
                let src = self.use_value(target);
                self.hint_reg(dst, src);
                let ty = legalize(self.func.ty(target));
                self.cur.push(MachInst::mov(ty, dst, src));
            }
            let moves = core::mem::take(&mut self.cur);
            self.vcode.insts.extend(moves);

            if self.fallthrough != Some(succ) {
                self.vcode.insts.push(MachInst::jump(succ));
            }
        } else {
            debug_assert!(
                old_phi_count == 0 || self.func.kind(end) != NodeKind::Branch,
                "critical edge into a phi out of `{}`: branch successors must not carry phis",
                self.func.name
            );
        }
        self.phi_values.clear();

        Ok(())
    }

    /// Depth-first intra-block scheduling, rooted at the terminator.
    fn dfs_schedule(&mut self, block: Block, node: Node, is_end: bool) {
        if self.schedule.block_of(node) != Some(block) {
            return;
        }
        if !self.visited.insert(node) {
            return;
        }

        // The terminator seeds the phis of its successors with the value
        // flowing along this edge; memory phis first, then data phis.
        if is_end {
            let edges: Vec<Node> = self
                .func
                .users(node)
                .map(|(user, _)| user)
                .filter(|&user| {
                    self.func.ty(user).is_control() || self.func.kind(user) == NodeKind::Region
                })
                .collect();
            for edge in edges {
                let destination = if self.func.kind(node) == NodeKind::Branch {
                    match self
                        .func
                        .users(edge)
                        .find(|&(u, _)| self.func.kind(u) == NodeKind::Region)
                    {
                        Some((region, _)) => region,
                        None => continue,
                    }
                } else {
                    edge
                };
                if self.func.kind(destination) != NodeKind::Region {
                    continue;
                }

                // Which predecessor slot is ours?
                let phi_index = match self
                    .cfg
                    .pred_index(self.func, destination, block)
                {
                    Some(i) => i,
                    None => continue,
                };

                let phis: Vec<(Node, bool)> = self
                    .func
                    .users(destination)
                    .filter(|&(u, _)| self.func.kind(u) == NodeKind::Phi)
                    .map(|(u, _)| (u, self.func.ty(u).is_memory()))
                    .collect();
                // Memory phis first; scheduling data phis afterwards is
                // generally better for the block order.
                for &(phi, _) in phis.iter().filter(|(_, is_mem)| *is_mem) {
                    self.dfs_schedule_phi(block, phi, phi_index);
                }
                for &(phi, _) in phis.iter().filter(|(_, is_mem)| !is_mem) {
                    self.dfs_schedule_phi(block, phi, phi_index);
                }
            }
        }

        // Inputs, right to left.
        for i in (0..self.func.input_count(node)).rev() {
            if let Some(input) = self.func.input(node, i) {
                self.dfs_schedule(block, input, false);
            }
        }

        // Before the terminator, pick up whatever late scheduling parked in
        // this block that the operand walk did not reach.
        if is_end {
            let items: Vec<Node> = self.schedule.items(block).to_vec();
            for item in items {
                self.dfs_schedule(block, item, false);
            }
        }

        self.work.push(node);

        // Anti-dependencies: readers of our memory predecessor must be
        // ordered ahead of us, the next writer.
        let kind = self.func.kind(node);
        if kind.is_memory_effect() {
            if let Some(mem) = self.func.input(node, 1) {
                let readers: Vec<Node> = self
                    .func
                    .users(mem)
                    .filter(|&(user, slot)| slot == 1 && user != node)
                    .map(|(user, _)| user)
                    .collect();
                for reader in readers {
                    self.dfs_schedule(block, reader, false);
                }
            }
        }

        // Projections ride along with their producer.
        if self.func.ty(node).is_tuple() && kind != NodeKind::Branch {
            let projs: Vec<Node> = self
                .func
                .users(node)
                .filter(|&(user, _)| self.func.kind(user) == NodeKind::Projection)
                .map(|(user, _)| user)
                .collect();
            for proj in projs {
                self.dfs_schedule(block, proj, false);
            }
        }
    }

    fn dfs_schedule_phi(&mut self, block: Block, phi: Node, phi_index: usize) {
        let value = match self.func.input(phi, 1 + phi_index) {
            Some(v) => v,
            None => return,
        };
        if !self.func.ty(phi).is_memory() {
            self.phi_values.push(PhiVal {
                phi,
                target: value.into(),
                dst: VReg::phys(RegClass::Gpr, 0), // overwritten before use
            });
        }
        self.dfs_schedule(block, value, false);
    }

    // ----- value plumbing ------------------------------------------------

    fn new_value_vreg(&mut self, node: Node) -> VReg {
        let ty = self.func.ty(node);
        let vreg = self.vcode.new_vreg(RegClass::of(ty), legalize(ty));
        self.vcode.intervals[vreg].node = node.into();
        vreg
    }

    /// The virtual register holding `node`'s value, selecting or
    /// rematerializing on the spot when needed. Counts one use.
    fn use_value(&mut self, node: Node) -> VReg {
        if !self.values[node].tracked {
            // Not scheduled anywhere we have been: materialize inline.
            let vreg = self.new_value_vreg(node);
            self.select_node(node, Some(vreg));
            return vreg;
        }

        self.values[node].use_count = self.values[node].use_count.saturating_sub(1);

        if let Some(vreg) = self.values[node].vreg.expand() {
            return vreg;
        }
        if self.func.should_rematerialize(node) {
            let vreg = self.new_value_vreg(node);
            self.select_node(node, Some(vreg));
            return vreg;
        }
        let vreg = self.new_value_vreg(node);
        self.values[node].vreg = vreg.into();
        vreg
    }

    /// Consume a use of `node` without needing its value in a register
    /// (because it was folded into the consumer).
    fn use_node(&mut self, node: Node) {
        self.values[node].use_count = self.values[node].use_count.saturating_sub(1);
    }

    fn is_on_last_use(&self, node: Node) -> bool {
        self.values[node].use_count == 1
    }

    fn hint_reg(&mut self, dst: VReg, src: VReg) {
        self.vcode.intervals[dst].hint = src.into();
    }

    fn phys_gpr(&self, enc: u8) -> VReg {
        VReg::phys(RegClass::Gpr, enc)
    }

    fn phys_xmm(&self, enc: u8) -> VReg {
        VReg::phys(RegClass::Xmm, enc)
    }

    /// `node` as a 32-bit immediate, when it is a constant whose value
    /// sign-extends correctly from 32 bits at the given logical width.
    fn try_imm32(&self, node: Node, bits: u32) -> Option<i32> {
        if self.func.kind(node) != NodeKind::IntConst {
            return None;
        }
        let value = self.func.int_value(node);
        if bits > 32 {
            let sign = (value >> 31) & 1;
            let top = value >> 32;
            if top != if sign != 0 { 0xffff_ffff } else { 0 } {
                return None;
            }
        }
        Some(value as i32)
    }

    fn stack_slot(&mut self, local: Node) -> i32 {
        if let Some(&slot) = self.stack_slots.get(&local) {
            return slot;
        }
        let (size, align) = match *self.func.props(local) {
            NodeProps::Local { size, align } => (size, align.max(1)),
            _ => panic!("node {local} in `{}` is not a local", self.func.name),
        };
        let usage = (self.vcode.stack_usage + size + align - 1) & !(align - 1);
        self.vcode.stack_usage = usage;
        let slot = -(usage as i32);
        self.stack_slots.insert(local, slot);
        slot
    }

    // ----- node lowering -------------------------------------------------

    fn select_node(&mut self, node: Node, dst: Option<VReg>) {
        let func = self.func;
        match func.kind(node) {
            NodeKind::Phi | NodeKind::Region => {}

            NodeKind::Entry => self.lower_entry(),

            NodeKind::Projection => self.lower_projection(node, dst),

            NodeKind::IntConst => {
                let dst = dst.expect("integer constant selected without destination");
                self.lower_iconst(node, dst);
            }

            NodeKind::Add
            | NodeKind::Sub
            | NodeKind::And
            | NodeKind::Or
            | NodeKind::Xor => self.lower_alu(node, dst.unwrap()),

            NodeKind::Shl | NodeKind::Shr | NodeKind::Sar => {
                self.lower_shift(node, dst.unwrap())
            }

            NodeKind::Mul => self.lower_mul(node, dst.unwrap()),

            NodeKind::Not | NodeKind::Neg => {
                let dst = dst.unwrap();
                let ty = func.ty(node);
                assert!(
                    !ty.is_float(),
                    "float {:?} of {node} in `{}` is not supported",
                    func.kind(node),
                    func.name
                );
                let opcode = if func.kind(node) == NodeKind::Not {
                    Opcode::Not
                } else {
                    Opcode::Neg
                };
                let src = self.use_value(func.input(node, 1).unwrap());
                let mty = legalize(ty);
                self.cur.push(MachInst::mov(mty, dst, src));
                self.cur.push(MachInst::rr(opcode, mty, dst, dst));
            }

            NodeKind::SignExtend | NodeKind::ZeroExtend => self.lower_extend(node, dst.unwrap()),

            NodeKind::Truncate => {
                let dst = dst.unwrap();
                let src_node = func.input(node, 1).unwrap();
                let src = self.use_value(src_node);
                if func.ty(node).is_float() {
                    self.cur.push(MachInst::rr(
                        Opcode::FpCvt,
                        legalize(func.ty(src_node)),
                        dst,
                        src,
                    ));
                } else {
                    self.cur
                        .push(MachInst::mov(legalize(func.ty(node)), dst, src));
                }
            }

            kind if kind.is_compare() => {
                let dst = dst.expect("compare selected without destination");
                let cc = self.lower_cmp(node);
                self.cur
                    .push(MachInst::r(Opcode::Setcc(cc), X64Type::Byte, dst));
            }

            NodeKind::Branch => self.lower_branch(node),

            NodeKind::Call | NodeKind::SystemCall | NodeKind::TailCall => {
                self.lower_call(node)
            }

            NodeKind::Exit => self.lower_exit(node),

            NodeKind::Local | NodeKind::MemberAccess | NodeKind::ArrayAccess => {
                let inst = self.select_memory_access(node, dst, None, None);
                self.cur.push(inst);
            }

            NodeKind::Load | NodeKind::AtomicLoad | NodeKind::Read => {
                // A volatile read is tuple-typed; its result lives in the
                // value projection (index 1).
                let (dst, ty) = if func.kind(node) == NodeKind::Read {
                    let value_proj = func
                        .users(node)
                        .find(|&(u, _)| {
                            func.kind(u) == NodeKind::Projection
                                && matches!(*func.props(u), NodeProps::Proj { index: 1 })
                        })
                        .map(|(u, _)| u);
                    match value_proj {
                        Some(proj) => {
                            let vreg = match self.values[proj].vreg.expand() {
                                Some(v) => v,
                                None => {
                                    let v = self.new_value_vreg(proj);
                                    self.values[proj].vreg = v.into();
                                    v
                                }
                            };
                            (vreg, func.ty(proj))
                        }
                        None => {
                            // The value is unused but the access must still
                            // happen.
                            let v = self.vcode.new_vreg(RegClass::Gpr, X64Type::Qword);
                            (v, crate::ir::types::I64)
                        }
                    }
                } else {
                    (dst.expect("load selected without destination"), func.ty(node))
                };
                let address = func.input(node, 2).unwrap();
                let mut inst = self.select_array_access(address, Some(dst), None, None);
                inst.opcode = if ty.is_float() {
                    Opcode::FpMov
                } else {
                    Opcode::Mov
                };
                inst.ty = legalize(ty);
                self.cur.push(inst);
            }

            NodeKind::Store | NodeKind::Write => self.lower_store(node, dst),

            NodeKind::Symbol => {
                let dst = dst.expect("symbol address selected without destination");
                let symbol = match *func.props(node) {
                    NodeProps::Symbol { symbol } => symbol,
                    _ => panic!("symbol node {node} without symbol payload"),
                };
                self.cur.push(MachInst::op_global(
                    Opcode::Lea,
                    X64Type::Qword,
                    dst,
                    symbol,
                ));
            }

            NodeKind::Trap | NodeKind::Unreachable => {
                self.cur.push(MachInst::new(Opcode::Ud2, X64Type::None));
            }

            kind => panic!(
                "unsupported node {node} ({kind:?}) in `{}`",
                self.func.name
            ),
        }
    }

    fn lower_entry(&mut self) {
        let is_sysv = self.abi == Abi::SystemV;
        let mut used_gpr = 0usize;
        let mut used_xmm = 0usize;
        let mut outs: Vec<VReg> = Vec::new();
        let mut moves: Vec<MachInst> = Vec::new();

        let param_count = self.func.signature.params.len();
        for i in 0..param_count {
            let proj = self.func.params[3 + i];
            let ty = self.func.ty(proj);
            let is_float = ty.is_float();
            let limit = if is_float {
                self.desc.xmm_param_count as usize
            } else {
                self.desc.gpr_params.len()
            };
            let id = if is_float { used_xmm } else { used_gpr };
            if is_sysv {
                if is_float {
                    used_xmm += 1;
                } else {
                    used_gpr += 1;
                }
            } else {
                // Win64 burns the slot in both files regardless of class.
                used_gpr += 1;
                used_xmm += 1;
            }

            if id < limit && self.values[proj].tracked {
                let phys = if is_float {
                    self.phys_xmm(id as u8)
                } else {
                    self.phys_gpr(self.desc.gpr_params[id])
                };
                let vreg = self.new_value_vreg(proj);
                self.values[proj].vreg = vreg.into();
                self.hint_reg(vreg, phys);
                moves.push(MachInst::mov(legalize(ty), vreg, phys));
                outs.push(phys);
            }
        }

        let mut entry = MachInst::new(Opcode::Entry, X64Type::None);
        entry.out_count = outs.len() as u8;
        entry.operands.extend(outs);
        self.cur.push(entry);
        self.cur.extend(moves);
    }

    fn lower_projection(&mut self, node: Node, dst: Option<VReg>) {
        let func = self.func;
        let source = func.input(node, 0).unwrap();
        if func.kind(source) != NodeKind::Entry {
            return;
        }
        let index = match *func.props(node) {
            NodeProps::Proj { index } => index as usize,
            _ => unreachable!(),
        };
        if index < 3 {
            return;
        }
        let param = index - 3;

        // Count register assignment the same way `lower_entry` does and emit
        // a load from the overflow home for parameters passed on the stack.
        let is_sysv = self.abi == Abi::SystemV;
        let mut used_gpr = 0usize;
        let mut used_xmm = 0usize;
        let mut overflow_slots = 0usize;
        for i in 0..=param {
            let ty = func.ty(func.params[3 + i]);
            let is_float = ty.is_float();
            let limit = if is_float {
                self.desc.xmm_param_count as usize
            } else {
                self.desc.gpr_params.len()
            };
            let id = if is_float { used_xmm } else { used_gpr };
            let in_regs = id < limit;
            if is_sysv {
                if is_float {
                    used_xmm += 1;
                } else {
                    used_gpr += 1;
                }
            } else {
                used_gpr += 1;
                used_xmm += 1;
            }
            if i == param {
                if in_regs {
                    return;
                }
                break;
            }
            if !in_regs {
                overflow_slots += 1;
            }
        }

        let dst = match dst {
            Some(d) => d,
            None => return,
        };
        // Win64 overflow slots sit past the four home slots; System V packs
        // them tightly above the return address.
        let disp = match self.abi {
            Abi::Win64 => 16 + (param as i32) * 8,
            Abi::SystemV => 16 + (overflow_slots as i32) * 8,
        };
        let ty = func.ty(node);
        let opcode = if ty.is_float() {
            Opcode::FpMov
        } else {
            Opcode::Mov
        };
        self.cur.push(MachInst::rm(
            opcode,
            legalize(ty),
            dst,
            self.phys_gpr(gpr::RBP),
            None,
            Scale::X1,
            disp,
        ));
    }

    fn lower_iconst(&mut self, node: Node, dst: VReg) {
        let func = self.func;
        let value = func.int_value(node);
        let ty = func.ty(node);
        let bits = ty.bit_width();

        if value == 0 {
            self.cur.push(MachInst::zero(legalize(ty), dst));
        } else if value >> 32 == 0 {
            // Fits unsigned 32 bits: a plain 32-bit move zero-extends.
            self.cur.push(MachInst::imm(
                Opcode::Mov,
                if bits <= 32 { legalize(ty) } else { X64Type::Dword },
                dst,
                value as i32,
            ));
        } else if (value as i64) == i64::from(value as i32) {
            // Sign-extending 32-bit form covers the all-ones upper half.
            self.cur
                .push(MachInst::imm(Opcode::Mov, X64Type::Qword, dst, value as i32));
        } else {
            self.cur
                .push(MachInst::abs(Opcode::Movabs, X64Type::Qword, dst, value));
        }
    }

    fn lower_alu(&mut self, node: Node, dst: VReg) {
        let func = self.func;
        let kind = func.kind(node);
        let opcode = match kind {
            NodeKind::Add => Opcode::Add,
            NodeKind::Sub => Opcode::Sub,
            NodeKind::And => Opcode::And,
            NodeKind::Or => Opcode::Or,
            NodeKind::Xor => Opcode::Xor,
            _ => unreachable!(),
        };
        let ty = func.ty(node);
        let mty = legalize(ty);
        let bits = ty.bit_width();

        let mut lhs = func.input(node, 1).unwrap();
        let mut rhs = func.input(node, 2).unwrap();
        // Commute so the immediate lands on the right.
        let commutative = !matches!(kind, NodeKind::Sub);
        if commutative
            && self.try_imm32(lhs, bits).is_some()
            && self.try_imm32(rhs, bits).is_none()
        {
            core::mem::swap(&mut lhs, &mut rhs);
        }

        let left = self.use_value(lhs);
        self.hint_reg(dst, left);

        if func.kind(rhs) == NodeKind::Load && self.is_on_last_use(rhs) {
            // Fold the single-use load into the ALU memory form.
            self.use_node(rhs);
            self.cur.push(MachInst::mov(mty, dst, left));
            let address = func.input(rhs, 2).unwrap();
            let mut inst = self.select_array_access(address, Some(dst), None, Some(dst));
            inst.opcode = opcode;
            inst.ty = mty;
            self.cur.push(inst);
        } else if let Some(imm) = self.try_imm32(rhs, bits) {
            self.use_node(rhs);
            if kind == NodeKind::Add {
                // `lea` is shorter and leaves the flags alone.
                self.cur.push(MachInst::rm(
                    Opcode::Lea,
                    X64Type::Qword,
                    dst,
                    left,
                    None,
                    Scale::X1,
                    imm,
                ));
            } else {
                self.cur.push(MachInst::mov(mty, dst, left));
                self.cur.push(MachInst::rri(opcode, mty, dst, dst, imm));
            }
        } else {
            let right = self.use_value(rhs);
            self.cur.push(MachInst::mov(mty, dst, left));
            self.cur.push(MachInst::rrr(opcode, mty, dst, dst, right));
        }
    }

    fn lower_shift(&mut self, node: Node, dst: VReg) {
        let func = self.func;
        let opcode = match func.kind(node) {
            NodeKind::Shl => Opcode::Shl,
            NodeKind::Shr => Opcode::Shr,
            NodeKind::Sar => Opcode::Sar,
            _ => unreachable!(),
        };
        let mty = legalize(func.ty(node));
        let value = func.input(node, 1).unwrap();
        let amount = func.input(node, 2).unwrap();

        let left = self.use_value(value);
        self.hint_reg(dst, left);
        if let Some(imm) = self.try_imm32(amount, 8) {
            self.use_node(amount);
            self.cur.push(MachInst::mov(mty, dst, left));
            self.cur.push(MachInst::rri(opcode, mty, dst, dst, imm));
        } else {
            let count = self.use_value(amount);
            let rcx = self.phys_gpr(gpr::RCX);
            self.cur
                .push(MachInst::mov(X64Type::Qword, rcx, count));
            self.cur.push(MachInst::mov(mty, dst, left));
            self.cur.push(MachInst::rrr(opcode, mty, dst, dst, rcx));
        }
    }

    fn lower_mul(&mut self, node: Node, dst: VReg) {
        let func = self.func;
        let ty = func.ty(node);
        assert!(
            ty.is_int(),
            "mul node {node} in `{}` must be an integer",
            func.name
        );
        // `imul` has no 8-bit two-operand form.
        let mty = if ty.bit_width() < 16 {
            X64Type::Word
        } else {
            legalize(ty)
        };

        let mut lhs = func.input(node, 1).unwrap();
        let mut rhs = func.input(node, 2).unwrap();
        if self.try_imm32(lhs, ty.bit_width()).is_some()
            && self.try_imm32(rhs, ty.bit_width()).is_none()
        {
            core::mem::swap(&mut lhs, &mut rhs);
        }

        let left = self.use_value(lhs);
        self.hint_reg(dst, left);

        if let Some(imm) = self.try_imm32(rhs, ty.bit_width().max(16)) {
            self.use_node(rhs);
            self.cur.push(MachInst::mov(mty, dst, left));
            self.cur.push(MachInst::rri(Opcode::Imul3, mty, dst, dst, imm));
        } else {
            let right = self.use_value(rhs);
            self.cur.push(MachInst::mov(mty, dst, left));
            self.cur.push(MachInst::rrr(Opcode::Imul, mty, dst, dst, right));
        }
    }

    fn lower_extend(&mut self, node: Node, dst: VReg) {
        let func = self.func;
        let sign_ext = func.kind(node) == NodeKind::SignExtend;
        let src_node = func.input(node, 1).unwrap();
        let src_ty = func.ty(src_node);
        let bits = src_ty.bit_width();

        if let Some(imm) = self.try_imm32(src_node, bits) {
            // Extend the constant right here.
            self.use_node(src_node);
            let mut value = imm as u32 as u64;
            if bits < 64 {
                let mask = u64::MAX << bits;
                let sign_bit = (value >> (bits - 1)) & 1;
                value &= !mask;
                if sign_ext && sign_bit != 0 {
                    value |= mask;
                }
            }
            if (value as i64) == i64::from(value as i32) {
                self.cur.push(MachInst::imm(
                    Opcode::Mov,
                    legalize(func.ty(node)),
                    dst,
                    value as i32,
                ));
            } else {
                self.cur
                    .push(MachInst::abs(Opcode::Movabs, X64Type::Qword, dst, value));
            }
            return;
        }

        let mut dt = legalize(func.ty(node));
        let opcode = if bits <= 8 {
            if sign_ext {
                Opcode::MovsxB
            } else {
                Opcode::MovzxB
            }
        } else if bits <= 16 {
            if sign_ext {
                Opcode::MovsxW
            } else {
                Opcode::MovzxW
            }
        } else if bits <= 32 {
            if sign_ext {
                Opcode::MovsxD
            } else {
                // A 32-bit mov zero-extends implicitly.
                dt = legalize(src_ty);
                Opcode::Mov
            }
        } else {
            Opcode::Mov
        };

        let src = self.use_value(src_node);
        self.cur.push(MachInst::rr(opcode, dt, dst, src));
    }

    fn lower_cmp(&mut self, node: Node) -> Cond {
        let func = self.func;
        let mut node = node;
        let mut invert = false;

        // `b == false` on a boolean operand is just `!b`.
        if func.kind(node) == NodeKind::CmpEq {
            let bool_operands = matches!(
                *func.props(node),
                NodeProps::Cmp { operand_ty } if operand_ty.bit_width() == 1
            );
            if bool_operands {
                if let Some(rhs) = func.input(node, 2) {
                    if func.kind(rhs) == NodeKind::IntConst && func.int_value(rhs) == 0 {
                        invert = true;
                        self.use_node(node);
                        self.use_node(rhs);
                        node = func.input(node, 1).unwrap();
                    }
                }
            }
        }

        let kind = func.kind(node);
        if kind.is_compare() {
            let cmp_ty = match *func.props(node) {
                NodeProps::Cmp { operand_ty } => operand_ty,
                _ => panic!("compare node {node} without compare payload"),
            };
            self.use_node(node);

            let cc;
            if cmp_ty.is_float() {
                let lhs = self.use_value(func.input(node, 1).unwrap());
                let rhs = self.use_value(func.input(node, 2).unwrap());
                self.cur.push(MachInst::rr_cmp(
                    Opcode::FpUcomi,
                    legalize(cmp_ty),
                    lhs,
                    rhs,
                ));
                cc = match kind {
                    NodeKind::CmpEq => Cond::E,
                    NodeKind::CmpNe => Cond::Ne,
                    NodeKind::CmpFlt => Cond::B,
                    NodeKind::CmpFle => Cond::Be,
                    _ => panic!("unordered integer compare on float operands"),
                };
            } else {
                let mty = legalize(cmp_ty);
                let bits = cmp_ty.bit_width();
                let lhs_node = func.input(node, 1).unwrap();
                let rhs_node = func.input(node, 2).unwrap();
                let lhs = self.use_value(lhs_node);

                if let Some(imm) = self.try_imm32(rhs_node, bits) {
                    self.use_node(rhs_node);
                    if imm == 0 && matches!(kind, NodeKind::CmpEq | NodeKind::CmpNe) {
                        self.cur
                            .push(MachInst::rr_cmp(Opcode::Test, mty, lhs, lhs));
                    } else {
                        self.cur.push(MachInst::ri(Opcode::Cmp, mty, lhs, imm));
                    }
                } else if func.kind(rhs_node) == NodeKind::Load && self.is_on_last_use(rhs_node) {
                    // Fold the dying load: `cmp lhs, [mem]`.
                    self.use_node(rhs_node);
                    let address = func.input(rhs_node, 2).unwrap();
                    let mut inst = self.select_array_access(address, Some(lhs), None, None);
                    inst.opcode = Opcode::Cmp;
                    inst.ty = mty;
                    inst.out_count = 0;
                    inst.in_count += 1;
                    self.cur.push(inst);
                } else {
                    let rhs = self.use_value(rhs_node);
                    self.cur.push(MachInst::rr_cmp(Opcode::Cmp, mty, lhs, rhs));
                }

                cc = match kind {
                    NodeKind::CmpEq => Cond::E,
                    NodeKind::CmpNe => Cond::Ne,
                    NodeKind::CmpSlt => Cond::L,
                    NodeKind::CmpSle => Cond::Le,
                    NodeKind::CmpUlt => Cond::B,
                    NodeKind::CmpUle => Cond::Be,
                    _ => unreachable!(),
                };
            }
            if invert {
                cc.invert()
            } else {
                cc
            }
        } else {
            // A bare boolean: test it against itself.
            let src = self.use_value(node);
            let ty = func.ty(node);
            assert!(!ty.is_float(), "float condition without compare");
            self.cur
                .push(MachInst::rr_cmp(Opcode::Test, legalize(ty), src, src));
            if invert {
                Cond::E
            } else {
                Cond::Ne
            }
        }
    }

    fn lower_branch(&mut self, node: Node) {
        let func = self.func;
        let keys = match func.props(node) {
            NodeProps::Branch(data) => data.keys.clone(),
            _ => panic!("branch node {node} without branch payload"),
        };

        // Successor blocks by projection index.
        let mut successors: Vec<Option<Block>> = vec![None; 2];
        for (proj, _) in func.users(node) {
            if func.kind(proj) != NodeKind::Projection {
                continue;
            }
            let index = match *func.props(proj) {
                NodeProps::Proj { index } => index as usize,
                _ => unreachable!(),
            };
            let target = func
                .users(proj)
                .find(|&(u, _)| func.kind(u) == NodeKind::Region)
                .map(|(u, _)| u);
            if let Some(region) = target {
                if index >= successors.len() {
                    successors.resize(index + 1, None);
                }
                successors[index] = self.cfg.block_of(region);
            }
        }

        self.cur
            .push(MachInst::new(Opcode::Terminator, X64Type::None));

        assert!(
            successors.len() == 2,
            "only two-way branches are supported (node {node} in `{}`)",
            func.name
        );
        let t = successors[0].expect("missing true successor");
        let f = successors[1].expect("missing false successor");

        let cond_node = func.input(node, 1).unwrap();
        let dt = legalize(func.ty(cond_node));
        let cc = if keys[0] == 0 {
            self.lower_cmp(cond_node)
        } else {
            let key = self.use_value(cond_node);
            self.cur
                .push(MachInst::ri(Opcode::Cmp, dt, key, keys[0] as i32));
            Cond::Ne
        };

        // Prefer falling through; flip the condition when that saves a jmp.
        if self.fallthrough == Some(t) {
            self.cur.push(MachInst::jcc(cc.invert(), f));
        } else {
            self.cur.push(MachInst::jcc(cc, t));
            if self.fallthrough != Some(f) {
                self.cur.push(MachInst::jump(f));
            }
        }
    }

    fn lower_call(&mut self, node: Node) {
        let func = self.func;
        let node_kind = func.kind(node);
        let is_sysv = self.abi == Abi::SystemV;

        let (signature, projections) = match func.props(node) {
            NodeProps::Call(data) => (data.signature.clone(), data.projections.clone()),
            _ => panic!("call node {node} without call payload"),
        };

        let mut caller_saved_gprs = self.desc.caller_saved_gprs;
        let mut caller_saved_xmms = self.desc.caller_saved_xmms;

        // Return values come back in rax/rdx or xmm0/xmm1.
        assert!(
            signature.returns.len() <= 2,
            "call {node} in `{}` returns more than two values",
            func.name
        );
        let mut return_vregs: [Option<VReg>; 2] = [None, None];
        let mut return_float: [bool; 2] = [false, false];
        for i in 0..signature.returns.len() {
            let ret = projections.get(2 + i).copied();
            let ret = match ret {
                Some(r) if func.user_count(r) > 0 => r,
                _ => continue,
            };
            return_vregs[i] = Some(self.use_value(ret));
            return_float[i] = func.ty(ret).is_float();
            if return_float[i] {
                caller_saved_xmms &= !(1 << i);
            } else {
                caller_saved_gprs &= !(1 << RETURN_GPRS[i]);
            }
        }

        // Arguments: registers first, overflow to outgoing stack slots.
        let arg_count = func.input_count(node) - 3;
        let vararg_cutoff = if signature.variadic {
            signature.params.len()
        } else {
            usize::MAX
        };

        let mut used_gpr = 0usize;
        let mut used_xmm = 0usize;
        let mut overflow_slots = 0usize;
        let mut ins: Vec<VReg> = Vec::new();
        let mut arg_moves: Vec<(X64Type, VReg, VReg)> = Vec::new();
        let mut float_dups: Vec<(usize, VReg)> = Vec::new();

        for i in 0..arg_count {
            let arg = func.input(node, 3 + i).unwrap();
            let ty = func.ty(arg);
            let use_xmm = ty.is_float();
            let id = if use_xmm { used_xmm } else { used_gpr };
            let limit = if use_xmm {
                self.desc.xmm_param_count as usize
            } else {
                self.desc.gpr_params.len()
            };
            if is_sysv {
                if use_xmm {
                    used_xmm += 1;
                } else {
                    used_gpr += 1;
                }
            } else {
                used_gpr += 1;
                used_xmm += 1;
            }

            let src = self.use_value(arg);
            if id >= limit {
                // Write straight into the outgoing argument area.
                let slot = match self.abi {
                    Abi::Win64 => i as i32,
                    Abi::SystemV => {
                        let s = overflow_slots as i32;
                        overflow_slots += 1;
                        s
                    }
                };
                let opcode = if use_xmm { Opcode::FpMov } else { Opcode::Mov };
                self.cur.push(MachInst::mr(
                    opcode,
                    legalize(ty),
                    self.phys_gpr(gpr::RSP),
                    None,
                    Scale::X1,
                    slot * 8,
                    Some(src),
                ));
            } else {
                let phys = if use_xmm {
                    caller_saved_xmms &= !(1 << id);
                    self.phys_xmm(id as u8)
                } else {
                    let enc = self.desc.gpr_params[id];
                    caller_saved_gprs &= !(1 << enc);
                    self.phys_gpr(enc)
                };
                self.hint_reg(src, phys);
                arg_moves.push((legalize(ty), phys, src));
                ins.push(phys);
                if use_xmm && i >= vararg_cutoff && id < self.desc.gpr_params.len() {
                    // Win64 duplicates variadic float arguments into the
                    // matching GPR slot.
                    if self.abi == Abi::Win64 {
                        float_dups.push((id, phys));
                    }
                }
            }
        }

        // Track the widest outgoing argument area for the frame.
        let outgoing = match self.abi {
            Abi::Win64 => arg_count as u32,
            Abi::SystemV => overflow_slots as u32,
        };
        self.vcode.caller_usage = self.vcode.caller_usage.max(outgoing);

        // The callee address, unless the call is direct.
        let callee = func.input(node, 2).unwrap();
        let static_call =
            node_kind != NodeKind::SystemCall && func.kind(callee) == NodeKind::Symbol;
        let mut target_val = None;
        if static_call {
            self.use_node(callee);
        } else {
            target_val = Some(self.use_value(callee));
        }

        // Last-minute copies keep the argument registers live as briefly as
        // possible.
        for &(ty, phys, src) in &arg_moves {
            self.cur.push(MachInst::mov(ty, phys, src));
        }
        for &(id, xmm_phys) in &float_dups {
            let enc = self.desc.gpr_params[id];
            self.cur.push(MachInst::rr(
                Opcode::MovF2I,
                X64Type::Qword,
                self.phys_gpr(enc),
                xmm_phys,
            ));
            ins.push(self.phys_gpr(enc));
        }

        // System V variadic calls report the float-register count in al.
        if signature.variadic && is_sysv && node_kind != NodeKind::SystemCall {
            let rax = self.phys_gpr(gpr::RAX);
            self.cur.push(MachInst::imm(
                Opcode::Mov,
                X64Type::Byte,
                rax,
                used_xmm as i32,
            ));
            ins.push(rax);
            caller_saved_gprs &= !(1 << gpr::RAX);
        }

        let opcode = match node_kind {
            NodeKind::SystemCall => Opcode::Syscall,
            NodeKind::TailCall => Opcode::Jmp,
            _ => Opcode::Call,
        };

        let mut call = MachInst::new(opcode, X64Type::Qword);
        for i in 0..2 {
            if return_vregs[i].is_some() {
                let phys = if return_float[i] {
                    self.phys_xmm(i as u8)
                } else {
                    self.phys_gpr(RETURN_GPRS[i])
                };
                call.operands.push(phys);
                call.out_count += 1;
            }
        }
        if static_call {
            let symbol = match *func.props(callee) {
                NodeProps::Symbol { symbol } => symbol,
                _ => unreachable!(),
            };
            call.flags |= InstFlags::GLOBAL;
            call.mem.slot = call.out_count;
            call.props = InstProps::Symbol(symbol);
        } else {
            call.operands.push(target_val.unwrap());
            call.in_count += 1;
        }
        for &arg in &ins {
            call.operands.push(arg);
            call.in_count += 1;
        }
        // Everything else caller-saved is clobbered: the allocator must
        // spill live values across the call.
        for enc in 0..16u8 {
            if caller_saved_gprs & (1 << enc) != 0 {
                call.operands.push(self.phys_gpr(enc));
                call.tmp_count += 1;
            }
        }
        for enc in 0..16u8 {
            if caller_saved_xmms & (1 << enc) != 0 {
                call.operands.push(self.phys_xmm(enc));
                call.tmp_count += 1;
            }
        }
        self.cur.push(call);

        // Copy the returned values out of the fixed registers.
        for i in 0..2 {
            if let Some(vreg) = return_vregs[i] {
                let ret = projections[2 + i];
                let ty = legalize(func.ty(ret));
                let phys = if return_float[i] {
                    self.phys_xmm(i as u8)
                } else {
                    self.phys_gpr(RETURN_GPRS[i])
                };
                self.hint_reg(vreg, phys);
                self.cur.push(MachInst::mov(ty, vreg, phys));
                self.values[ret].vreg = vreg.into();
            }
        }
    }

    fn lower_exit(&mut self, node: Node) {
        let func = self.func;
        let return_count = func.input_count(node).saturating_sub(3);
        assert!(
            return_count <= 2,
            "exit of `{}` returns more than two values",
            func.name
        );

        let mut used_xmm = 0u8;
        let mut used_gpr = 0usize;
        for i in 0..return_count {
            let value = func.input(node, 3 + i).unwrap();
            let ty = func.ty(value);
            let src = self.use_value(value);
            let phys = if ty.is_float() {
                let p = self.phys_xmm(used_xmm);
                used_xmm += 1;
                p
            } else {
                let p = self.phys_gpr(RETURN_GPRS[used_gpr]);
                used_gpr += 1;
                p
            };
            self.hint_reg(src, phys);
            self.cur.push(MachInst::mov(legalize(ty), phys, src));
        }

        let mut epilogue = MachInst::new(Opcode::Epilogue, X64Type::None);
        epilogue.flags |= InstFlags::RET;
        self.cur.push(epilogue);
    }

    fn lower_store(&mut self, node: Node, dst: Option<VReg>) {
        let func = self.func;
        if dst.is_some() {
            // The store was already folded into a consumer.
            self.use_node(func.input(node, 2).unwrap());
            self.use_node(func.input(node, 3).unwrap());
            return;
        }

        let address = func.input(node, 2).unwrap();
        let mut source = func.input(node, 3).unwrap();
        let store_ty = func.ty(source);

        // `store(x op load(addr))` with matching memory state folds into
        // `op [addr], x`.
        let folded_op = self.folded_store_op(node, address, source);
        let store_op = match folded_op {
            Some(op) => {
                let load = func.input(source, 1).unwrap();
                self.use_node(source);
                self.use_node(load);
                source = func.input(source, 2).unwrap();
                op
            }
            None => {
                if store_ty.is_float() {
                    Opcode::FpMov
                } else {
                    Opcode::Mov
                }
            }
        };

        let bits = if store_ty.is_pointer() {
            64
        } else {
            store_ty.bit_width()
        };
        if let Some(imm) = self.try_imm32(source, bits) {
            self.use_node(source);
            let mut inst = self.select_array_access(address, None, Some(store_op), None);
            inst.ty = legalize(store_ty);
            inst.flags |= InstFlags::IMMEDIATE;
            inst.props = InstProps::Imm(imm);
            debug_assert!(inst.flags.intersects(InstFlags::MEM | InstFlags::GLOBAL));
            self.cur.push(inst);
        } else {
            let src = self.use_value(source);
            let mut inst = self.select_array_access(address, None, Some(store_op), Some(src));
            inst.ty = legalize(store_ty);
            debug_assert!(inst.flags.intersects(InstFlags::MEM | InstFlags::GLOBAL));
            self.cur.push(inst);
        }
    }

    /// If `store(addr, src)` is really `store(addr, op(load(addr), y))` with
    /// both the op and the load dying here, return the ALU opcode to use in
    /// the read-modify-write form.
    fn folded_store_op(&mut self, store: Node, address: Node, source: Node) -> Option<Opcode> {
        let func = self.func;
        let op = match func.kind(source) {
            NodeKind::And => Opcode::And,
            NodeKind::Or => Opcode::Or,
            NodeKind::Xor => Opcode::Xor,
            NodeKind::Add => Opcode::Add,
            NodeKind::Sub => Opcode::Sub,
            _ => return None,
        };
        let load = func.input(source, 1)?;
        if func.kind(load) != NodeKind::Load {
            return None;
        }
        if func.input(load, 1) != func.input(store, 1) || func.input(load, 2) != Some(address) {
            return None;
        }
        if !self.is_on_last_use(source) || !self.is_on_last_use(load) {
            return None;
        }
        Some(op)
    }

    /// Lower an address computation to a single addressing mode, folding
    /// member offsets, array scaling, and locals.
    ///
    /// With `store_op` set the result is the store form `op [mem], src/imm`;
    /// otherwise it is `lea dst, [mem]` (or, with `src`, the ALU-with-memory
    /// shape the caller rewrites the opcode of).
    fn select_memory_access(
        &mut self,
        node: Node,
        dst: Option<VReg>,
        store_op: Option<Opcode>,
        src: Option<VReg>,
    ) -> MachInst {
        let func = self.func;
        let mut n = node;
        let mut offset = 0i32;
        let mut dst = dst;

        if func.kind(n) == NodeKind::MemberAccess {
            offset = match *func.props(n) {
                NodeProps::Member { offset } => offset,
                _ => unreachable!(),
            };
            self.use_node(n);
            n = func.input(n, 1).unwrap();
        }

        let mut scale = Scale::X1;
        let mut index: Option<VReg> = None;

        if func.kind(n) == NodeKind::ArrayAccess {
            let base = func.input(n, 1).unwrap();
            let mut stride = match *func.props(n) {
                NodeProps::Array { stride } => stride,
                _ => unreachable!(),
            };
            self.use_node(n);
            let mut idx_node = func.input(n, 2).unwrap();

            // A shift feeding the index folds into the stride.
            if func.kind(idx_node) == NodeKind::Shl {
                if let Some(sh) = self.try_imm32(func.input(idx_node, 2).unwrap(), 64) {
                    self.use_node(idx_node);
                    self.use_node(func.input(idx_node, 2).unwrap());
                    idx_node = func.input(idx_node, 1).unwrap();
                    stride = stride.wrapping_mul(1i64 << sh);
                }
            }

            let idx = self.use_value(idx_node);
            match Scale::from_stride(stride) {
                Some(s) => {
                    scale = s;
                    index = Some(idx);
                }
                None => {
                    // Pre-multiply into a scratch register.
                    let tmp = match dst {
                        Some(d) if store_op.is_none() => d,
                        _ => self.vcode.new_vreg(RegClass::Gpr, X64Type::Qword),
                    };
                    if stride.count_ones() == 1 {
                        let shift = stride.trailing_zeros() as i32;
                        self.cur.push(MachInst::rri(
                            Opcode::Shl,
                            X64Type::Qword,
                            tmp,
                            idx,
                            shift,
                        ));
                    } else {
                        self.cur.push(MachInst::rri(
                            Opcode::Imul3,
                            X64Type::Qword,
                            tmp,
                            idx,
                            stride as i32,
                        ));
                    }
                    index = Some(tmp);
                    if store_op.is_none() {
                        dst = Some(tmp);
                    }
                }
            }

            n = base;
        }

        let base = if func.kind(n) == NodeKind::Local {
            self.use_node(n);
            offset += self.stack_slot(n);
            self.phys_gpr(gpr::RBP)
        } else {
            self.use_value(n)
        };

        match store_op {
            None => {
                let dst = dst.expect("address computation without destination");
                match src {
                    Some(src) => {
                        MachInst::rrm(Opcode::Lea, X64Type::Qword, dst, src, base, index, scale, offset)
                    }
                    None => {
                        MachInst::rm(Opcode::Lea, X64Type::Qword, dst, base, index, scale, offset)
                    }
                }
            }
            Some(op) => MachInst::mr(op, X64Type::Qword, base, index, scale, offset, src),
        }
    }

    /// Like [`Self::select_memory_access`], but an array access that is
    /// shared by several consumers is materialized once and then addressed
    /// plainly.
    fn select_array_access(
        &mut self,
        node: Node,
        dst: Option<VReg>,
        store_op: Option<Opcode>,
        src: Option<VReg>,
    ) -> MachInst {
        if self.func.kind(node) == NodeKind::ArrayAccess
            && (self.values[node].use_count > 2 || self.values[node].vreg.is_some())
        {
            let base = self.use_value(node);
            return match store_op {
                None => {
                    let dst = dst.expect("address computation without destination");
                    match src {
                        Some(src) => MachInst::rrm(
                            Opcode::Lea,
                            X64Type::Qword,
                            dst,
                            src,
                            base,
                            None,
                            Scale::X1,
                            0,
                        ),
                        None => MachInst::rm(
                            Opcode::Lea,
                            X64Type::Qword,
                            dst,
                            base,
                            None,
                            Scale::X1,
                            0,
                        ),
                    }
                }
                Some(op) => MachInst::mr(op, X64Type::Qword, base, None, Scale::X1, 0, src),
            };
        }
        self.select_memory_access(node, dst, store_op, src)
    }
}
