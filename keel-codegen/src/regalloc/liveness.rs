//! Live-range analysis: per-block dataflow and interval construction.
//!
//! Works on the lowered instruction vector. Block boundaries are recovered
//! from the `Label` markers, live-out sets are computed by backward dataflow
//! over the machine blocks, and each block is then walked in reverse to
//! build the interval ranges and use positions the allocator consumes.

use super::interval::{LiveRange, UseKind};
use crate::cfg::{Block, ControlFlowGraph};
use crate::isa::x64::inst::{InstFlags, Opcode, VCode, VReg};
use keel_entity::{EntityRef, SecondaryMap};

/// A basic block at the machine level.
#[derive(Clone, Debug)]
pub struct MachineBlock {
    /// The CFG block this corresponds to.
    pub block: Block,
    /// Index of the block's `Label` instruction.
    pub first: usize,
    /// Index one past the block's last instruction.
    pub last: usize,
    /// Instruction time of the label.
    pub start: u32,
    /// Instruction time of the last instruction.
    pub end: u32,
    /// Instruction time of the `Terminator` marker, where edge-resolution
    /// moves are placed.
    pub terminator: u32,
    /// Virtual registers live on entry, as a bit set.
    pub live_in: Vec<u64>,
    /// Virtual registers live on exit, as a bit set.
    pub live_out: Vec<u64>,
}

fn bit_get(set: &[u64], i: usize) -> bool {
    set[i / 64] & (1 << (i % 64)) != 0
}

fn bit_set(set: &mut [u64], i: usize) -> bool {
    let word = &mut set[i / 64];
    let mask = 1 << (i % 64);
    let newly = *word & mask == 0;
    *word |= mask;
    newly
}

/// Build machine blocks and live intervals for `vcode`.
///
/// On return every interval's ranges and use positions are final and the 32
/// physical intervals have their `[0, 1)` anchor range so they interfere
/// from the start of the function.
pub fn build_intervals(vcode: &mut VCode, cfg: &ControlFlowGraph) -> Vec<MachineBlock> {
    let words = (vcode.intervals.len() + 63) / 64;

    // Recover block extents from the label markers.
    let mut blocks: Vec<MachineBlock> = Vec::new();
    for (i, inst) in vcode.insts.iter().enumerate() {
        if inst.opcode == Opcode::Label {
            if let Some(prev) = blocks.last_mut() {
                prev.last = i;
                prev.end = vcode.insts[i - 1].time;
            }
            let block = match inst.props {
                crate::isa::x64::inst::InstProps::Target(block) => block,
                _ => panic!("label instruction without a block"),
            };
            blocks.push(MachineBlock {
                block,
                first: i,
                last: vcode.insts.len(),
                start: inst.time,
                end: 0,
                terminator: 0,
                live_in: vec![0; words],
                live_out: vec![0; words],
            });
        }
    }
    if let Some(last) = blocks.last_mut() {
        last.end = vcode.insts.last().map_or(0, |inst| inst.time);
    }
    for mb in &mut blocks {
        if mb.end == 0 {
            mb.end = mb.start;
        }
        mb.terminator = vcode.insts[mb.first..mb.last]
            .iter()
            .find(|inst| inst.opcode == Opcode::Terminator || inst.opcode == Opcode::Epilogue)
            .map_or(mb.end, |inst| inst.time);
    }

    let index_of: SecondaryMap<Block, u32> = {
        let mut map = SecondaryMap::with_default(u32::MAX);
        for (i, mb) in blocks.iter().enumerate() {
            map[mb.block] = i as u32;
        }
        map
    };

    // Per-block use/def sets.
    let mut gens: Vec<Vec<u64>> = vec![vec![0; words]; blocks.len()];
    let mut kills: Vec<Vec<u64>> = vec![vec![0; words]; blocks.len()];
    for (bi, mb) in blocks.iter().enumerate() {
        for inst in &vcode.insts[mb.first..mb.last] {
            let (outs, ins, tmps, saves) = inst.operand_groups();
            for &vreg in ins.iter().chain(saves) {
                if !bit_get(&kills[bi], vreg.index()) {
                    bit_set(&mut gens[bi], vreg.index());
                }
            }
            for &vreg in outs.iter().chain(tmps) {
                bit_set(&mut kills[bi], vreg.index());
            }
        }
    }

    // Backward dataflow to a fixed point.
    let mut changed = true;
    while changed {
        changed = false;
        for bi in (0..blocks.len()).rev() {
            let mut live_out = vec![0u64; words];
            for &succ in &cfg.blocks[blocks[bi].block].succs {
                let si = index_of[succ];
                if si == u32::MAX {
                    continue;
                }
                for (w, &bits) in blocks[si as usize].live_in.iter().enumerate() {
                    live_out[w] |= bits;
                }
            }
            let mut live_in = live_out.clone();
            for w in 0..words {
                live_in[w] = gens[bi][w] | (live_out[w] & !kills[bi][w]);
            }
            if live_in != blocks[bi].live_in || live_out != blocks[bi].live_out {
                blocks[bi].live_in = live_in;
                blocks[bi].live_out = live_out;
                changed = true;
            }
        }
    }

    // Physical registers interfere from the very start.
    for i in 0..32 {
        vcode.intervals[VReg::new(i)].add_range(LiveRange { start: 0, end: 1 });
    }

    // Reverse walk building ranges and uses.
    for mb in blocks.iter().rev() {
        let block_start = mb.start;
        let block_end = mb.end + 2;

        for i in 0..vcode.intervals.len() {
            if bit_get(&mb.live_out, i) {
                vcode.intervals[VReg::new(i)].add_range(LiveRange {
                    start: block_start,
                    end: block_end,
                });
            }
        }

        for idx in (mb.first..mb.last).rev() {
            let inst = &vcode.insts[idx];
            let time = inst.time;
            let is_call =
                matches!(inst.opcode, Opcode::Call | Opcode::Syscall) && inst.tmp_count > 0;
            // These shapes need their destination in a register even when
            // the value could otherwise live in memory.
            let dst_needs_reg = matches!(inst.opcode, Opcode::Imul | Opcode::Imul3 | Opcode::Zero)
                || inst
                    .flags
                    .intersects(InstFlags::MEM | InstFlags::GLOBAL);

            let (outs, ins, tmps, saves) = {
                let (o, i, t, s) = inst.operand_groups();
                (o.to_vec(), i.to_vec(), t.to_vec(), s.to_vec())
            };

            for &vreg in &outs {
                let interval = &mut vcode.intervals[vreg];
                // The definition trims the range that liveness opened at the
                // block start.
                if let Some(r) = interval
                    .ranges
                    .iter_mut()
                    .find(|r| r.contains(time) || (r.start <= time && time <= r.end))
                {
                    r.start = time;
                } else {
                    interval.add_range(LiveRange {
                        start: time,
                        end: time + 1,
                    });
                }
                interval.add_use(
                    time,
                    if dst_needs_reg { UseKind::Reg } else { UseKind::Out },
                );
            }

            for &vreg in &ins {
                let interval = &mut vcode.intervals[vreg];
                interval.add_use(time, UseKind::Reg);
                interval.add_range(LiveRange {
                    start: block_start,
                    end: time,
                });
            }

            for &vreg in &tmps {
                let interval = &mut vcode.intervals[vreg];
                interval.add_range(LiveRange {
                    start: time,
                    end: time + 1,
                });
                if !is_call {
                    interval.add_use(time, UseKind::Reg);
                }
            }

            for &vreg in &saves {
                let interval = &mut vcode.intervals[vreg];
                interval.add_use(time, UseKind::MemOrReg);
                interval.add_range(LiveRange {
                    start: block_start,
                    end: time,
                });
            }
        }
    }

    blocks
}
