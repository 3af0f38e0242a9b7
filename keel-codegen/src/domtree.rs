//! A dominator tree represented as mappings of blocks to their immediate
//! dominator.

use crate::cfg::{Block, ControlFlowGraph};
use keel_entity::packed_option::PackedOption;
use keel_entity::SecondaryMap;

/// Dominator tree node. We keep one of these per block.
#[derive(Clone, Default)]
struct DomNode {
    /// Number of this node in a reverse post-order traversal of the CFG,
    /// starting from 1. Unreachable nodes get number 0.
    rpo_number: u32,

    /// The immediate dominator of this block.
    ///
    /// This is `None` for unreachable blocks and the entry block, which has
    /// no immediate dominator.
    idom: PackedOption<Block>,
}

/// The dominator tree for a single function.
pub struct DominatorTree {
    nodes: SecondaryMap<Block, DomNode>,
}

impl DominatorTree {
    /// Compute the dominator tree for `cfg` using the iterative fixed-point
    /// algorithm over the reverse post-order.
    pub fn compute(cfg: &ControlFlowGraph) -> Self {
        let mut tree = Self {
            nodes: SecondaryMap::new(),
        };

        let rpo: Vec<Block> = cfg.rpo().collect();
        for (i, &block) in rpo.iter().enumerate() {
            tree.nodes[block].rpo_number = (i + 1) as u32;
        }

        // The entry block dominates everything and has no idom; seed the
        // rest from reachable predecessors and iterate to a fixed point.
        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom: Option<Block> = None;
                for &pred in &cfg.blocks[block].preds {
                    if tree.nodes[pred].rpo_number == 0 {
                        continue;
                    }
                    // Only predecessors that already have an idom (or are the
                    // entry) can participate in the intersection.
                    if pred != rpo[0] && tree.nodes[pred].idom.is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(cur) => tree.intersect(cur, pred),
                    });
                }
                if let Some(idom) = new_idom {
                    if tree.nodes[block].idom.expand() != Some(idom) {
                        tree.nodes[block].idom = idom.into();
                        changed = true;
                    }
                }
            }
        }

        tree
    }

    /// Is `block` reachable from the entry block?
    pub fn is_reachable(&self, block: Block) -> bool {
        self.nodes[block].rpo_number != 0
    }

    /// Returns the immediate dominator of `block`, or `None` for the entry
    /// block and unreachable blocks.
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.nodes[block].idom.expand()
    }

    /// The reverse post-order number of `block`, starting from 1.
    pub fn rpo_number(&self, block: Block) -> u32 {
        self.nodes[block].rpo_number
    }

    /// Returns `true` if `a` dominates `b`.
    ///
    /// This means that every control-flow path from the function entry to
    /// `b` must go through `a`. A block dominates itself.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        let mut cur = b;
        let rpo_a = self.nodes[a].rpo_number;
        loop {
            if cur == a {
                return true;
            }
            if self.nodes[cur].rpo_number <= rpo_a {
                return false;
            }
            match self.idom(cur) {
                Some(idom) => cur = idom,
                None => return false,
            }
        }
    }

    /// Compute the common dominator of two blocks, both assumed reachable.
    pub fn common_dominator(&self, a: Block, b: Block) -> Block {
        self.intersect(a, b)
    }

    fn intersect(&self, mut a: Block, mut b: Block) -> Block {
        while a != b {
            while self.nodes[a].rpo_number > self.nodes[b].rpo_number {
                a = self.nodes[a].idom.expect("unreachable block in intersect");
            }
            while self.nodes[b].rpo_number > self.nodes[a].rpo_number {
                b = self.nodes[b].idom.expect("unreachable block in intersect");
            }
        }
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::ControlFlowGraph;
    use crate::ir::types;
    use crate::ir::{Function, NodeKind, NodeProps, Signature};

    /// Build a diamond: entry → (then | else) → merge → exit.
    #[test]
    fn diamond() {
        let mut func = Function::with_signature(
            "f",
            Signature::new(vec![types::BOOL], vec![]),
        );
        let cond = func.param(0);
        let entry_ctrl = func.params[0];

        let branch = func.create_node(
            NodeKind::Branch,
            types::TUPLE,
            &[entry_ctrl, cond],
            NodeProps::Branch(crate::ir::BranchData {
                successors: 2,
                keys: smallvec::smallvec![0],
            }),
        );
        let t_proj = func.create_projection(branch, 0, types::CONTROL);
        let f_proj = func.create_projection(branch, 1, types::CONTROL);

        let mut region = |func: &mut Function| {
            func.create_node(
                NodeKind::Region,
                types::CONTROL,
                &[],
                NodeProps::Region(Default::default()),
            )
        };
        let then_region = region(&mut func);
        let else_region = region(&mut func);
        let merge = region(&mut func);
        func.add_input_late(then_region, t_proj);
        func.add_input_late(else_region, f_proj);
        func.add_input_late(merge, then_region);
        func.add_input_late(merge, else_region);

        let exit = func.create_node_with_slots(
            NodeKind::Exit,
            types::CONTROL,
            3,
            NodeProps::Region(Default::default()),
        );
        let exit_region = region(&mut func);
        func.set_input(exit, 0, exit_region);
        func.add_input_late(exit_region, merge);
        func.exit = exit.into();

        let cfg = ControlFlowGraph::compute(&func);
        let tree = DominatorTree::compute(&cfg);

        let entry = cfg.entry_block();
        let then_b = cfg.block_of(then_region).unwrap();
        let else_b = cfg.block_of(else_region).unwrap();
        let merge_b = cfg.block_of(merge).unwrap();

        assert_eq!(tree.idom(entry), None);
        assert_eq!(tree.idom(then_b), Some(entry));
        assert_eq!(tree.idom(else_b), Some(entry));
        assert_eq!(tree.idom(merge_b), Some(entry));
        assert!(tree.dominates(entry, merge_b));
        assert!(!tree.dominates(then_b, merge_b));
        assert_eq!(tree.common_dominator(then_b, else_b), entry);
    }
}
