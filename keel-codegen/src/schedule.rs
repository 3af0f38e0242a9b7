//! Global code motion: late placement of floating nodes into blocks.
//!
//! Control nodes, phis, and projections are pinned to blocks by their nature.
//! Every other node floats freely in the graph and is placed here, in the
//! latest block that dominates all of its users, the nearest common
//! dominator of the use sites. A use through a phi counts at the
//! corresponding predecessor block, not at the phi's own block.

use crate::cfg::{Block, ControlFlowGraph};
use crate::domtree::DominatorTree;
use crate::ir::{Function, Node, NodeKind};
use keel_entity::packed_option::PackedOption;
use keel_entity::SecondaryMap;

/// The result of scheduling: a block assignment for every live node.
pub struct Schedule {
    placement: SecondaryMap<Node, PackedOption<Block>>,
    /// Floating nodes placed in each block, in creation order. The
    /// instruction selector evaluates these ahead of the terminator if the
    /// operand DFS has not already reached them.
    items: SecondaryMap<Block, Vec<Node>>,
}

impl Schedule {
    /// Compute the late schedule for `func`.
    pub fn compute(func: &Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) -> Self {
        let mut sched = Self {
            placement: SecondaryMap::new(),
            items: SecondaryMap::new(),
        };

        // Pin what is pinned: the control chains and branch projections are
        // already mapped by the CFG; phis follow their region, and
        // projections follow their producer.
        for node in func.nodes() {
            if let Some(block) = cfg.block_of(node) {
                sched.placement[node] = block.into();
            }
        }
        for node in func.nodes() {
            if sched.placement[node].is_some() {
                continue;
            }
            match func.kind(node) {
                NodeKind::Phi => {
                    let region = func.input(node, 0).unwrap_or_else(|| {
                        panic!("phi {node} in `{}` has no region input", func.name)
                    });
                    sched.placement[node] = sched.placement[region];
                }
                NodeKind::Projection => {
                    let source = func.input(node, 0).unwrap();
                    if let Some(block) = cfg.block_of(source) {
                        sched.placement[node] = block.into();
                    }
                }
                _ => {
                    // A control-dependent node belongs to its controlling
                    // block.
                    if let Some(ctrl) = func.input(node, 0) {
                        if let Some(block) = cfg.block_of(ctrl) {
                            sched.placement[node] = block.into();
                        }
                    }
                }
            }
        }

        // Place the floating nodes bottom-up from their users.
        for node in func.nodes() {
            sched.place_late(func, cfg, domtree, node);
        }

        // Collect per-block item lists for the selector.
        for node in func.nodes() {
            if func.is_pinned(node) {
                continue;
            }
            if let Some(block) = sched.placement[node].expand() {
                sched.items[block].push(node);
            }
        }

        sched
    }

    /// The block `node` was placed in, or `None` if the node is dead.
    pub fn block_of(&self, node: Node) -> Option<Block> {
        self.placement[node].expand()
    }

    /// The floating nodes placed in `block`.
    pub fn items(&self, block: Block) -> &[Node] {
        self.items
            .get(block)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn place_late(
        &mut self,
        func: &Function,
        cfg: &ControlFlowGraph,
        domtree: &DominatorTree,
        node: Node,
    ) -> Option<Block> {
        if let Some(block) = self.placement[node].expand() {
            return Some(block);
        }
        if func.is_pinned(node) {
            // A pinned node with no placement is unreachable.
            return None;
        }

        let mut lca: Option<Block> = None;
        // Snapshot the users first; placing a user can recurse back into the
        // placement map.
        let users: Vec<(Node, u32)> = func.users(node).collect();
        for (user, slot) in users {
            let use_block = match func.kind(user) {
                NodeKind::Phi => {
                    // The value flows in along the predecessor edge matching
                    // the phi slot, so that is where the use happens.
                    debug_assert!(slot >= 1, "phi value uses start at slot 1");
                    let region = func.input(user, 0).unwrap();
                    func.input(region, slot as usize - 1)
                        .and_then(|pred| cfg.block_of(pred))
                }
                _ => self.place_late(func, cfg, domtree, user),
            };
            if let Some(use_block) = use_block {
                lca = Some(match lca {
                    None => use_block,
                    Some(cur) => domtree.common_dominator(cur, use_block),
                });
            }
        }

        if let Some(block) = lca {
            self.placement[node] = block.into();
        }
        lca
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types;
    use crate::ir::{ArithBehavior, NodeProps, Signature};

    #[test]
    fn floating_add_lands_in_use_block() {
        let mut func = Function::with_signature(
            "f",
            Signature::new(vec![types::I64], vec![types::I64]),
        );
        let x = func.param(0);
        let seven = func.create_node(
            NodeKind::IntConst,
            types::I64,
            &[Node::nil()],
            NodeProps::Int { value: 7, bits: 64 },
        );
        let add = func.create_node(
            NodeKind::Add,
            types::I64,
            &[Node::nil(), x, seven],
            NodeProps::Arith {
                behavior: ArithBehavior::None,
            },
        );

        // return add;
        let exit_region = func.create_node(
            NodeKind::Region,
            types::CONTROL,
            &[],
            NodeProps::Region(Default::default()),
        );
        let mem_phi =
            func.create_node(NodeKind::Phi, types::MEMORY, &[exit_region], NodeProps::None);
        func.add_input_late(mem_phi, func.params[1]);
        let val_phi =
            func.create_node(NodeKind::Phi, types::I64, &[exit_region], NodeProps::None);
        func.add_input_late(val_phi, add);
        let exit = func.create_node(
            NodeKind::Exit,
            types::CONTROL,
            &[exit_region, mem_phi, func.params[2], val_phi],
            NodeProps::Region(Default::default()),
        );
        func.add_input_late(exit_region, func.params[0]);
        func.exit = exit.into();

        let cfg = ControlFlowGraph::compute(&func);
        let domtree = DominatorTree::compute(&cfg);
        let sched = Schedule::compute(&func, &cfg, &domtree);

        // The add is used through the exit phi, so it counts at the
        // predecessor of the exit region: the entry block.
        let entry = cfg.entry_block();
        assert_eq!(sched.block_of(add), Some(entry));
        assert_eq!(sched.block_of(seven), Some(entry));
        assert!(sched.items(entry).contains(&add));
    }
}
