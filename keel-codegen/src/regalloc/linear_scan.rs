//! Linear-scan register allocation with interval splitting and spilling.
//!
//! The scan works over the intervals built by liveness analysis, sorted by
//! start position. The 32 fixed physical intervals participate like any
//! other interval but arrive pre-assigned, so they simply occupy their
//! register wherever the selector pinned them (argument marshalling, call
//! clobbers, return values). When no register is free the interval whose
//! next register use lies furthest away is split and spilled.

use super::interval::{LiveInterval, LiveRange, UseKind};
use super::liveness::MachineBlock;
use crate::cfg::ControlFlowGraph;
use crate::isa::x64::abi::param_descriptor;
use crate::isa::x64::inst::{InstFlags, MachInst, Opcode, VCode, VReg};
use crate::isa::x64::regs::{gpr, RegClass};
use crate::isa::Abi;
use keel_entity::EntityRef;

/// Free-position value for a callee-saved register that is available but
/// would cost a save/restore pair. Ranks below a truly free caller-saved
/// register while staying beyond any realistic instruction time.
const HALF_FREE: u32 = 1 << 30;

/// Run register allocation over `vcode`.
pub fn run(vcode: &mut VCode, blocks: &[MachineBlock], cfg: &ControlFlowGraph, abi: Abi) {
    Scan {
        vcode,
        blocks,
        cfg,
        active: [[None; 16]; 2],
        inactive: Vec::new(),
        unhandled: Vec::new(),
        cursors: Vec::new(),
        callee_saved: [0; 2],
        endpoint: 0,
    }
    .run(abi)
}

struct Scan<'a> {
    vcode: &'a mut VCode,
    blocks: &'a [MachineBlock],
    cfg: &'a ControlFlowGraph,
    /// Occupied registers per class.
    active: [[Option<VReg>; 16]; 2],
    /// Intervals currently in a lifetime hole.
    inactive: Vec<VReg>,
    /// Pending intervals, sorted by descending start so `pop` yields the
    /// earliest.
    unhandled: Vec<VReg>,
    /// Per-interval cursor into its range list.
    cursors: Vec<usize>,
    /// Callee-saved registers not yet paid for, per class.
    callee_saved: [u32; 2],
    /// Time of the epilogue, where callee-saved restores go.
    endpoint: u32,
}

impl<'a> Scan<'a> {
    fn run(mut self, abi: Abi) {
        let desc = param_descriptor(abi);
        self.callee_saved[0] = u32::from(!desc.caller_saved_gprs)
            & 0xffff
            & !(1 << gpr::RBP)
            & !(1 << gpr::RSP);
        self.callee_saved[1] = u32::from(!desc.caller_saved_xmms) & 0xffff;

        self.endpoint = self
            .vcode
            .insts
            .iter()
            .find(|inst| inst.opcode == Opcode::Epilogue)
            .map_or_else(
                || self.vcode.insts.last().map_or(0, |inst| inst.time),
                |inst| inst.time,
            );

        self.cursors = vec![0; self.vcode.intervals.len()];
        let mut unhandled: Vec<VReg> = self
            .vcode
            .intervals
            .iter()
            .filter(|(_, it)| !it.ranges.is_empty())
            .map(|(v, _)| v)
            .collect();
        unhandled.sort_by(|&a, &b| {
            self.vcode.intervals[b]
                .start()
                .cmp(&self.vcode.intervals[a].start())
        });
        self.unhandled = unhandled;

        while let Some(vreg) = self.unhandled.pop() {
            let interval = &self.vcode.intervals[vreg];
            let time = interval.start();
            let fixed = interval.fixed;

            // Spilled split children never come back for a register.
            if fixed.is_none() && interval.is_spilled() {
                continue;
            }

            self.expire(time);

            let reg = match fixed {
                Some(enc) => Some(enc),
                None => self
                    .allocate_free_reg(vreg)
                    .or_else(|| self.allocate_blocked_reg(vreg)),
            };

            if let Some(enc) = reg {
                self.vcode.intervals[vreg].assigned = Some(enc);
                self.move_to_active(vreg);
            }
        }

        self.resolve_edges();
        self.rewrite_operands();
    }

    /// Advance all active and inactive intervals to `time`.
    fn expire(&mut self, time: u32) {
        for class in 0..2 {
            for enc in 0..16 {
                if let Some(vreg) = self.active[class][enc] {
                    self.advance_cursor(vreg, time);
                    let it = &self.vcode.intervals[vreg];
                    let cursor = self.cursors[vreg.index()];
                    if cursor == it.ranges.len() {
                        self.active[class][enc] = None;
                    } else if time < it.ranges[cursor].start {
                        // Entered a lifetime hole.
                        self.active[class][enc] = None;
                        self.inactive.push(vreg);
                    }
                }
            }
        }

        let inactive = core::mem::take(&mut self.inactive);
        for vreg in inactive {
            self.advance_cursor(vreg, time);
            let it = &self.vcode.intervals[vreg];
            let cursor = self.cursors[vreg.index()];
            if cursor == it.ranges.len() {
                continue; // expired
            }
            if time >= it.ranges[cursor].start {
                self.move_to_active(vreg);
            } else {
                self.inactive.push(vreg);
            }
        }
    }

    fn advance_cursor(&mut self, vreg: VReg, time: u32) {
        let it = &self.vcode.intervals[vreg];
        let cursor = &mut self.cursors[vreg.index()];
        while *cursor < it.ranges.len() && it.ranges[*cursor].end <= time {
            *cursor += 1;
        }
    }

    fn move_to_active(&mut self, vreg: VReg) {
        let it = &self.vcode.intervals[vreg];
        let class = it.class.index();
        let enc = it.assigned.expect("activating an unassigned interval") as usize;
        assert!(
            self.active[class][enc].is_none(),
            "intervals should never be forced out of {enc}"
        );
        self.active[class][enc] = Some(vreg);
    }

    /// Try to find a register that is free for (enough of) the interval.
    fn allocate_free_reg(&mut self, vreg: VReg) -> Option<u8> {
        let class = self.vcode.intervals[vreg].class;
        let ci = class.index();

        let mut free_pos = [u32::MAX; 16];
        for (enc, pos) in free_pos.iter_mut().enumerate() {
            if self.callee_saved[ci] & (1 << enc) != 0 {
                *pos = HALF_FREE;
            }
        }
        for (enc, slot) in self.active[ci].iter().enumerate() {
            if slot.is_some() {
                free_pos[enc] = 0;
            }
        }
        for &other in &self.inactive {
            let it = &self.vcode.intervals[other];
            if it.class != class {
                continue;
            }
            let enc = it.assigned.expect("inactive interval without a register") as usize;
            if free_pos[enc] > 0 {
                if let Some(pos) = it.intersect(&self.vcode.intervals[vreg]) {
                    free_pos[enc] = free_pos[enc].min(pos);
                }
            }
        }
        if class == RegClass::Gpr {
            free_pos[gpr::RBP as usize] = 0;
            free_pos[gpr::RSP as usize] = 0;
        }

        // Prefer the hint when the whole interval fits in it.
        let interval_end = self.vcode.intervals[vreg].end();
        let mut choice: Option<u8> = None;
        if let Some(hint) = self.vcode.intervals[vreg].hint.expand() {
            let hint_it = &self.vcode.intervals[hint];
            if hint_it.class == class {
                if let Some(enc) = hint_it.assigned.or(hint_it.fixed) {
                    if interval_end <= free_pos[enc as usize] {
                        choice = Some(enc);
                    }
                }
            }
        }

        let enc = match choice {
            Some(enc) => enc,
            None => {
                let mut best = 0u8;
                for enc in 1..16u8 {
                    if free_pos[enc as usize] > free_pos[best as usize] {
                        best = enc;
                    }
                }
                best
            }
        };

        let pos = free_pos[enc as usize];
        if pos == 0 {
            return None;
        }

        // First use of a callee-saved register buys its save/restore pair.
        if self.callee_saved[ci] & (1 << enc) != 0 {
            self.callee_saved[ci] &= !(1 << enc);

            self.vcode.stack_usage = (self.vcode.stack_usage + 8 + 7) & !7;
            let slot = self.vcode.stack_usage;
            let phys = VReg::phys(class, enc);
            let ty = self.vcode.intervals[phys].ty;
            let mut saved = LiveInterval::new(class, ty);
            saved.spill = slot;
            let saved = self.vcode.intervals.push(saved);
            self.cursors.push(0);

            self.insert_move(0, phys, saved);
            self.insert_move(self.endpoint, saved, phys);
        }

        if interval_end > pos {
            // The register is only free up to `pos`: take it and split the
            // rest off into a spilled child.
            self.vcode.intervals[vreg].assigned = Some(enc);
            self.split_intersecting(vreg, pos - 1, true);
        }

        Some(enc)
    }

    /// No register is free: either spill this interval or evict the one
    /// whose next register use is furthest away.
    fn allocate_blocked_reg(&mut self, vreg: VReg) -> Option<u8> {
        let class = self.vcode.intervals[vreg].class;
        let ci = class.index();
        let start = self.vcode.intervals[vreg].start();

        let mut use_pos = [u32::MAX; 16];
        for (enc, slot) in self.active[ci].iter().enumerate() {
            if let Some(occupant) = slot {
                let it = &self.vcode.intervals[*occupant];
                use_pos[enc] = if it.fixed.is_some() {
                    0
                } else {
                    it.next_reg_use_after(start).unwrap_or(u32::MAX)
                };
            }
        }
        for &other in &self.inactive {
            let it = &self.vcode.intervals[other];
            if it.class != class {
                continue;
            }
            let enc = it.assigned.expect("inactive interval without a register") as usize;
            if it.intersect(&self.vcode.intervals[vreg]).is_some() {
                let pos = if it.fixed.is_some() {
                    0
                } else {
                    it.next_reg_use_after(start).unwrap_or(u32::MAX)
                };
                use_pos[enc] = use_pos[enc].min(pos);
            }
        }
        if class == RegClass::Gpr {
            use_pos[gpr::RBP as usize] = 0;
            use_pos[gpr::RSP as usize] = 0;
        }

        let mut pick = 0usize;
        for enc in 1..16 {
            if use_pos[enc] > use_pos[pick] {
                pick = enc;
            }
        }

        let first_use = self.vcode.intervals[vreg]
            .uses
            .iter()
            .find(|u| u.kind != UseKind::MemOrReg)
            .map_or(u32::MAX, |u| u.pos);

        if first_use >= use_pos[pick] || use_pos[pick] == 0 {
            // Everyone else's use comes sooner: spill this interval and
            // reload it just before its own first register use.
            if first_use <= start + 1 && use_pos[pick] == 0 {
                panic!("register pressure too high at time {start}: no spillable interval");
            }
            self.vcode.stack_usage = (self.vcode.stack_usage + 8 + 7) & !7;
            self.vcode.intervals[vreg].spill = self.vcode.stack_usage;
            if first_use != u32::MAX && first_use > start {
                self.split_intersecting(vreg, first_use - 1, false);
            }
            None
        } else {
            let victim = self.active[ci][pick].expect("picked an empty register");
            self.split_intersecting(victim, start, true);
            Some(pick as u8)
        }
    }

    /// Split `vreg` at `pos`. The child takes the ranges and uses after the
    /// split point; with `spill` it is given a stack slot, otherwise it is
    /// queued for its own register. A connecting move is inserted at `pos`.
    fn split_intersecting(&mut self, vreg: VReg, pos: u32, spill: bool) -> VReg {
        let (class, ty) = {
            let it = &self.vcode.intervals[vreg];
            (it.class, it.ty)
        };

        let mut slot = 0;
        if !self.vcode.intervals[vreg].is_spilled() {
            self.vcode.stack_usage = (self.vcode.stack_usage + 8 + 7) & !7;
            slot = self.vcode.stack_usage;
            // The donor keeps its register only up to the split point.
            if let Some(enc) = self.vcode.intervals[vreg].assigned {
                if self.active[class.index()][enc as usize] == Some(vreg) {
                    self.active[class.index()][enc as usize] = None;
                }
            }
        }
        assert!(
            self.vcode.intervals[vreg].split_child.is_none(),
            "interval split twice at the same level"
        );

        let mut child = LiveInterval::new(class, ty);
        if spill {
            child.spill = slot;
        }

        // Move the uses and ranges past the split point into the child.
        {
            let parent = &mut self.vcode.intervals[vreg];
            let split_uses = parent.uses.partition_point(|u| u.pos <= pos);
            child.uses = parent.uses.split_off(split_uses);

            let mut keep = Vec::new();
            for range in parent.ranges.drain(..) {
                if range.start > pos {
                    child.ranges.push(range);
                } else if range.end > pos {
                    keep.push(LiveRange {
                        start: range.start,
                        end: pos,
                    });
                    child.ranges.push(LiveRange {
                        start: pos,
                        end: range.end,
                    });
                } else {
                    keep.push(range);
                }
            }
            parent.ranges = keep;
        }

        let child = {
            let c = self.vcode.intervals.push(child);
            self.cursors.push(0);
            self.vcode.intervals[vreg].split_child = c.into();
            c
        };

        self.insert_move(pos, vreg, child);

        if !spill {
            // The child competes for a register of its own.
            let start = self.vcode.intervals[child].start();
            let idx = self
                .unhandled
                .partition_point(|&v| self.vcode.intervals[v].start() > start);
            self.unhandled.insert(idx, child);
        } else {
            // Reload before the next use that must be in a register.
            let next_reg_use = self.vcode.intervals[child]
                .uses
                .iter()
                .find(|u| u.kind == UseKind::Reg)
                .map(|u| u.pos);
            if let Some(use_pos) = next_reg_use {
                self.split_intersecting(child, use_pos.saturating_sub(1), false);
            }
        }

        child
    }

    /// Insert a spill/reload/shuffle move of `from` into `to` at time `t`.
    fn insert_move(&mut self, t: u32, from: VReg, to: VReg) {
        let idx = self
            .vcode
            .insts
            .partition_point(|inst| inst.time <= t);

        // A plain move already sitting here can simply retarget its
        // destination.
        if let Some(inst) = self.vcode.insts.get_mut(idx) {
            if inst.opcode == Opcode::Mov
                && inst.flags.is_empty()
                && inst.out_count == 1
                && inst.operands[0] == from
            {
                inst.operands[0] = to;
                return;
            }
        }

        let ty = self.vcode.intervals[from].ty;
        let time = if idx == 0 {
            1
        } else {
            self.vcode.insts[idx - 1].time + 1
        };
        let mut mv = MachInst::mov(ty, to, from);
        mv.flags |= InstFlags::SPILL;
        mv.time = time;
        self.vcode.insts.insert(idx, mv);
    }

    /// Walk the split chain of `root` to the interval covering `time`.
    fn child_at(&self, root: VReg, time: u32) -> VReg {
        let mut cur = root;
        while let Some(child) = self.vcode.intervals[cur].split_child.expand() {
            if self.vcode.intervals[child].start() <= time {
                cur = child;
            } else {
                break;
            }
        }
        cur
    }

    /// Insert moves on control edges where a value changed location between
    /// a block and its successor.
    fn resolve_edges(&mut self) {
        let blocks = self.blocks;
        let cfg = self.cfg;
        for mb in blocks {
            let (m_end, m_term) = (mb.end, mb.terminator);
            for &succ in &cfg.blocks[mb.block].succs {
                let Some(target) = blocks.iter().find(|t| t.block == succ) else {
                    continue;
                };
                let (t_start, t_live_in) = (target.start, &target.live_in);

                for i in 0..self.vcode.intervals.len().min(t_live_in.len() * 64) {
                    if t_live_in[i / 64] & (1 << (i % 64)) == 0 {
                        continue;
                    }
                    let root = VReg::new(i);
                    let from = self.child_at(root, m_end);
                    let to = self.child_at(root, t_start);
                    if from == to {
                        continue;
                    }
                    if self.vcode.intervals[from].is_spilled() {
                        assert!(
                            !self.vcode.intervals[to].is_spilled(),
                            "both edge intervals are spilled"
                        );
                        self.insert_move(t_start + 1, from, to);
                    } else {
                        self.insert_move(m_term.saturating_sub(1), from, to);
                    }
                }
            }
        }
    }

    /// Rewrite every operand to the split child covering its instruction.
    fn rewrite_operands(&mut self) {
        for idx in 0..self.vcode.insts.len() {
            if self.vcode.insts[idx].flags.contains(InstFlags::SPILL) {
                continue;
            }
            let time = self.vcode.insts[idx].time;
            let count = self.vcode.insts[idx].operands.len();
            for oi in 0..count {
                let op = self.vcode.insts[idx].operands[oi];
                let replacement = self.child_at(op, time);
                self.vcode.insts[idx].operands[oi] = replacement;
            }
        }
        log::trace!(
            "allocation finished: {} intervals, stack usage {}",
            self.vcode.intervals.len(),
            self.vcode.stack_usage
        );
    }
}
