//! Basic blocks recovered from the sea of nodes.
//!
//! A basic block is a maximal straight-line chain of control nodes headed by
//! an `Entry` or `Region` node and ended by the last control node before the
//! flow splits, joins, or leaves the function. The graph carries no explicit
//! block structure, so this pass rebuilds it: it identifies heads, walks each
//! control chain to its end, and records successor edges and a post-order.

use crate::ir::{Function, Node, NodeKind};
use keel_entity::packed_option::PackedOption;
use keel_entity::{entity_impl, PrimaryMap, SecondaryMap};

/// An opaque reference to a basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// A basic block: its head node and the last control node of its chain.
#[derive(Clone, Debug)]
pub struct BlockData {
    /// The `Entry` or `Region` node heading the block.
    pub entry: Node,
    /// The block's last control node: a terminator, or the control token
    /// handed to a successor region.
    pub end: Node,
    /// Successor blocks, in branch-projection order.
    pub succs: Vec<Block>,
    /// Predecessor blocks, in region-input order.
    pub preds: Vec<Block>,
}

/// The control flow graph of one function.
pub struct ControlFlowGraph {
    /// All reachable blocks, in discovery order. Block 0 is the entry block.
    pub blocks: PrimaryMap<Block, BlockData>,
    /// Block membership for control-chain nodes and branch projections.
    block_of: SecondaryMap<Node, PackedOption<Block>>,
    /// Post-order over the reachable blocks.
    postorder: Vec<Block>,
}

impl ControlFlowGraph {
    /// Compute the control flow graph of `func`.
    pub fn compute(func: &Function) -> Self {
        let entry = func
            .entry
            .expand()
            .unwrap_or_else(|| panic!("function `{}` has no entry node", func.name));

        let mut cfg = Self {
            blocks: PrimaryMap::new(),
            block_of: SecondaryMap::new(),
            postorder: Vec::new(),
        };

        cfg.discover(func, entry);
        cfg.link_edges(func);
        cfg.compute_postorder();
        log::trace!(
            "cfg of `{}`: {} blocks, {} reachable",
            func.name,
            cfg.blocks.len(),
            cfg.postorder.len()
        );
        cfg
    }

    /// The block containing `node`, for control-chain nodes and branch
    /// projections.
    pub fn block_of(&self, node: Node) -> Option<Block> {
        self.block_of[node].expand()
    }

    /// The entry block.
    pub fn entry_block(&self) -> Block {
        Block::from_u32(0)
    }

    /// Post-order over the reachable blocks.
    pub fn postorder(&self) -> &[Block] {
        &self.postorder
    }

    /// Reverse post-order over the reachable blocks.
    pub fn rpo(&self) -> impl Iterator<Item = Block> + '_ {
        self.postorder.iter().rev().copied()
    }

    /// The input slot of `region` that corresponds to an edge from `pred`.
    pub fn pred_index(&self, func: &Function, region: Node, pred: Block) -> Option<usize> {
        func.inputs(region)
            .iter()
            .position(|&input| !input.is_nil() && self.block_of(input) == Some(pred))
    }

    fn discover(&mut self, func: &Function, entry: Node) {
        let mut stack = vec![entry];
        while let Some(head) = stack.pop() {
            if self.block_of[head].is_some() {
                continue;
            }
            let block = self.blocks.push(BlockData {
                entry: head,
                end: head,
                succs: Vec::new(),
                preds: Vec::new(),
            });

            // Walk the control chain to the block's end.
            let mut cur = head;
            self.block_of[cur] = block.into();
            while !func.kind(cur).is_terminator() {
                match self.chain_successor(func, cur) {
                    Some(next) => {
                        cur = next;
                        self.block_of[cur] = block.into();
                    }
                    None => break,
                }
            }
            self.blocks[block].end = cur;

            // Queue the successor heads.
            match func.kind(cur) {
                NodeKind::Branch => {
                    for (proj, _) in func.users(cur) {
                        if func.kind(proj) != NodeKind::Projection {
                            continue;
                        }
                        self.block_of[proj] = block.into();
                        if let Some(target) = self.region_user(func, proj) {
                            stack.push(target);
                        }
                    }
                }
                NodeKind::Exit | NodeKind::Trap | NodeKind::Unreachable | NodeKind::TailCall => {}
                _ => {
                    if let Some(target) = self.region_user(func, cur) {
                        stack.push(target);
                    }
                }
            }
        }
    }

    /// The next node of the control chain after `cur`, if the chain
    /// continues within the same block.
    fn chain_successor(&self, func: &Function, cur: Node) -> Option<Node> {
        func.users(cur).find_map(|(user, slot)| {
            if slot != 0 {
                return None;
            }
            match func.kind(user) {
                NodeKind::Call | NodeKind::SystemCall => Some(user),
                NodeKind::Projection if func.ty(user).is_control() => Some(user),
                NodeKind::Branch
                | NodeKind::Exit
                | NodeKind::Trap
                | NodeKind::Unreachable
                | NodeKind::TailCall => Some(user),
                _ => None,
            }
        })
    }

    /// The region that consumes `node` as a control predecessor, if any.
    fn region_user(&self, func: &Function, node: Node) -> Option<Node> {
        func.users(node)
            .find(|&(user, _)| func.kind(user) == NodeKind::Region)
            .map(|(user, _)| user)
    }

    fn link_edges(&mut self, func: &Function) {
        for block in self.blocks.keys() {
            let head = self.blocks[block].entry;
            if func.kind(head) != NodeKind::Region {
                continue;
            }
            let preds: Vec<Block> = func
                .inputs(head)
                .iter()
                .filter(|input| !input.is_nil())
                .filter_map(|&input| self.block_of(input))
                .collect();
            for &pred in &preds {
                self.blocks[pred].succs.push(block);
            }
            self.blocks[block].preds = preds;
        }

        // Order branch successors by projection index, not by the incidental
        // region-input order established above.
        for block in self.blocks.keys() {
            let end = self.blocks[block].end;
            if func.kind(end) != NodeKind::Branch {
                continue;
            }
            let mut ordered: Vec<(u32, Block)> = Vec::new();
            for (proj, _) in func.users(end) {
                if func.kind(proj) != NodeKind::Projection {
                    continue;
                }
                let index = match *func.props(proj) {
                    crate::ir::NodeProps::Proj { index } => index,
                    _ => unreachable!(),
                };
                if let Some(target) = self.region_user(func, proj) {
                    if let Some(tb) = self.block_of(target) {
                        ordered.push((index, tb));
                    }
                }
            }
            ordered.sort_by_key(|&(index, _)| index);
            self.blocks[block].succs = ordered.into_iter().map(|(_, b)| b).collect();
        }
    }

    fn compute_postorder(&mut self) {
        // Two-state DFS: push a block once to visit it, a second time to
        // emit it after its successors.
        let mut seen = SecondaryMap::<Block, u8>::new();
        let mut stack = vec![(self.entry_block(), false)];
        while let Some((block, emit)) = stack.pop() {
            if emit {
                self.postorder.push(block);
                continue;
            }
            if seen[block] != 0 {
                continue;
            }
            seen[block] = 1;
            stack.push((block, true));
            for i in (0..self.blocks[block].succs.len()).rev() {
                let succ = self.blocks[block].succs[i];
                if seen[succ] == 0 {
                    stack.push((succ, false));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types;
    use crate::ir::{NodeProps, Signature};

    #[test]
    fn straight_line() {
        let mut func = Function::with_signature("f", Signature::default());
        let entry_ctrl = func.params[0];
        let exit_region = func.create_node(
            NodeKind::Region,
            types::CONTROL,
            &[],
            NodeProps::Region(Default::default()),
        );
        let exit = func.create_node_with_slots(
            NodeKind::Exit,
            types::CONTROL,
            3,
            NodeProps::Region(Default::default()),
        );
        func.set_input(exit, 0, exit_region);
        func.set_input(exit, 2, func.params[2]);
        func.add_input_late(exit_region, entry_ctrl);
        func.exit = exit.into();

        let cfg = ControlFlowGraph::compute(&func);
        assert_eq!(cfg.blocks.len(), 2);
        assert_eq!(cfg.postorder().len(), 2);

        let entry_block = cfg.entry_block();
        assert_eq!(cfg.blocks[entry_block].succs.len(), 1);
        let exit_block = cfg.blocks[entry_block].succs[0];
        assert_eq!(cfg.blocks[exit_block].preds, vec![entry_block]);
        assert_eq!(cfg.blocks[exit_block].end, exit);
    }
}
