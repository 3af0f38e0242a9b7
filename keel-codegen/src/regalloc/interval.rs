//! Live intervals and their building blocks.

use crate::ir::Node;
use crate::isa::x64::inst::VReg;
use crate::isa::x64::regs::{RegClass, X64Type};
use keel_entity::packed_option::PackedOption;

/// A half-open `[start, end)` range of instruction time.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LiveRange {
    /// First instruction time covered.
    pub start: u32,
    /// First instruction time no longer covered.
    pub end: u32,
}

impl LiveRange {
    /// Does this range contain `time`?
    pub fn contains(self, time: u32) -> bool {
        self.start <= time && time < self.end
    }
}

/// How strongly a use position needs a register.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UseKind {
    /// Definition of the value.
    Out,
    /// The value must be in a register at this position.
    Reg,
    /// The value may be read from its spill slot.
    MemOrReg,
}

/// A use of an interval at a specific instruction time.
#[derive(Copy, Clone, Debug)]
pub struct UsePos {
    /// Instruction time of the use.
    pub pos: u32,
    /// Register requirement at this position.
    pub kind: UseKind,
}

/// The live interval of one virtual register.
///
/// The first 32 intervals of every function are fixed: they represent the
/// physical registers themselves and participate in interference with the
/// pre-assigned encoding.
#[derive(Clone, Debug)]
pub struct LiveInterval {
    /// Register class of the value.
    pub class: RegClass,
    /// Legalized machine type, used when spill/reload moves are synthesized.
    pub ty: X64Type,
    /// The fixed physical encoding, for the 32 physical intervals.
    pub fixed: Option<u8>,
    /// The physical register chosen by allocation.
    pub assigned: Option<u8>,
    /// Allocation hint: prefer the register assigned to this interval.
    pub hint: PackedOption<VReg>,
    /// Live ranges, sorted by ascending start, non-overlapping.
    pub ranges: Vec<LiveRange>,
    /// Use positions, sorted ascending.
    pub uses: Vec<UsePos>,
    /// Spill slot as a positive offset below `rbp`, or 0 if not spilled.
    pub spill: u32,
    /// The interval this one was split into, if any.
    pub split_child: PackedOption<VReg>,
    /// The IR node that produced the value, when known.
    pub node: PackedOption<Node>,
}

impl LiveInterval {
    /// A fresh virtual interval of `class` and `ty`.
    pub fn new(class: RegClass, ty: X64Type) -> Self {
        Self {
            class,
            ty,
            fixed: None,
            assigned: None,
            hint: None.into(),
            ranges: Vec::new(),
            uses: Vec::new(),
            spill: 0,
            split_child: None.into(),
            node: None.into(),
        }
    }

    /// The fixed interval for physical register `enc` of `class`.
    pub fn fixed(class: RegClass, enc: u8) -> Self {
        let ty = match class {
            RegClass::Gpr => X64Type::Qword,
            RegClass::Xmm => X64Type::SseSd,
        };
        Self {
            fixed: Some(enc),
            assigned: Some(enc),
            ..Self::new(class, ty)
        }
    }

    /// Is this interval spilled to the stack?
    pub fn is_spilled(&self) -> bool {
        self.spill > 0
    }

    /// First covered instruction time; `u32::MAX` for an empty interval.
    pub fn start(&self) -> u32 {
        self.ranges.first().map_or(u32::MAX, |r| r.start)
    }

    /// One past the last covered instruction time.
    pub fn end(&self) -> u32 {
        self.ranges.last().map_or(0, |r| r.end)
    }

    /// Does any range cover `time`?
    pub fn covers(&self, time: u32) -> bool {
        self.ranges.iter().any(|r| r.contains(time))
    }

    /// Extend the interval with `range`, merging with an adjacent or
    /// overlapping neighbour. Ranges arrive mostly back-to-front during the
    /// reverse walk, so the common case is cheap.
    pub fn add_range(&mut self, range: LiveRange) {
        debug_assert!(range.start <= range.end);
        // Find the insertion point by start position.
        let idx = self
            .ranges
            .partition_point(|r| r.start < range.start);

        // Merge with the predecessor if it touches.
        if idx > 0 && self.ranges[idx - 1].end >= range.start {
            self.ranges[idx - 1].end = self.ranges[idx - 1].end.max(range.end);
            self.coalesce_from(idx - 1);
            return;
        }
        // Merge with the successor if it touches.
        if idx < self.ranges.len() && range.end >= self.ranges[idx].start {
            self.ranges[idx].start = range.start;
            self.ranges[idx].end = self.ranges[idx].end.max(range.end);
            self.coalesce_from(idx);
            return;
        }
        self.ranges.insert(idx, range);
    }

    fn coalesce_from(&mut self, idx: usize) {
        while idx + 1 < self.ranges.len() && self.ranges[idx].end >= self.ranges[idx + 1].start {
            self.ranges[idx].end = self.ranges[idx].end.max(self.ranges[idx + 1].end);
            self.ranges.remove(idx + 1);
        }
    }

    /// Record a use position, keeping the list sorted.
    pub fn add_use(&mut self, pos: u32, kind: UseKind) {
        let idx = self.uses.partition_point(|u| u.pos < pos);
        self.uses.insert(idx, UsePos { pos, kind });
    }

    /// The first use at or after `time` that demands a register.
    pub fn next_reg_use_after(&self, time: u32) -> Option<u32> {
        self.uses
            .iter()
            .find(|u| u.pos >= time && u.kind != UseKind::MemOrReg)
            .map(|u| u.pos)
    }

    /// The first time both intervals are live simultaneously, if any.
    pub fn intersect(&self, other: &Self) -> Option<u32> {
        let mut i = 0;
        let mut j = 0;
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            if start < end {
                return Some(start);
            }
            if a.end <= b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_merge() {
        let mut it = LiveInterval::new(RegClass::Gpr, X64Type::Qword);
        it.add_range(LiveRange { start: 10, end: 20 });
        it.add_range(LiveRange { start: 30, end: 40 });
        it.add_range(LiveRange { start: 18, end: 32 });
        assert_eq!(it.ranges, vec![LiveRange { start: 10, end: 40 }]);
        assert!(it.covers(25));
        assert!(!it.covers(40));
    }

    #[test]
    fn intersection() {
        let mut a = LiveInterval::new(RegClass::Gpr, X64Type::Qword);
        a.add_range(LiveRange { start: 0, end: 10 });
        a.add_range(LiveRange { start: 20, end: 30 });
        let mut b = LiveInterval::new(RegClass::Gpr, X64Type::Qword);
        b.add_range(LiveRange { start: 12, end: 22 });
        assert_eq!(a.intersect(&b), Some(20));
        assert_eq!(b.intersect(&a), Some(20));

        let mut c = LiveInterval::new(RegClass::Gpr, X64Type::Qword);
        c.add_range(LiveRange { start: 10, end: 12 });
        assert_eq!(a.intersect(&c), None);
    }
}
