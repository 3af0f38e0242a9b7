//! The per-function node graph and its storage.

use super::node::{NodeData, NodeKind, NodeProps, UserData};
use super::{DataType, Node, Signature, TypeKind, User};
use keel_entity::packed_option::PackedOption;
use keel_entity::{EntityList, ListPool, PrimaryMap};

/// A function in Keel IR.
///
/// The function owns every node it contains: node records live in a
/// `PrimaryMap`, input lists in a `ListPool`, and user-list records in a
/// second `PrimaryMap`. Dropping the function releases the whole graph at
/// once. Node handles are plain indices and never outlive their function in
/// any meaningful way.
pub struct Function {
    /// Name of the function, used in diagnostics.
    pub name: String,
    /// The function's signature.
    pub signature: Signature,

    nodes: PrimaryMap<Node, NodeData>,
    users: PrimaryMap<User, UserData>,
    /// Pool backing every node's input list.
    pub node_lists: ListPool<Node>,

    /// The unique entry node.
    pub entry: PackedOption<Node>,
    /// The unique exit node, if any return has been built.
    pub exit: PackedOption<Node>,
    /// Parameter projections. Slots 0..3 are the control, memory, and
    /// continuation projections of the entry; slot `3 + i` is formal
    /// parameter `i`.
    pub params: Vec<Node>,
    /// Terminator nodes collected during construction.
    pub terminators: Vec<Node>,
}

impl Function {
    /// Create an empty function with the given name and signature.
    ///
    /// The entry node, its control/memory/continuation projections, and the
    /// parameter projections are created eagerly; the first three land in
    /// `params[0..3]`.
    pub fn with_signature(name: impl Into<String>, signature: Signature) -> Self {
        let mut func = Self {
            name: name.into(),
            signature: signature.clone(),
            nodes: PrimaryMap::new(),
            users: PrimaryMap::new(),
            node_lists: ListPool::new(),
            entry: None.into(),
            exit: None.into(),
            params: Vec::new(),
            terminators: Vec::new(),
        };

        let entry = func.create_node(
            NodeKind::Entry,
            super::types::TUPLE,
            &[],
            NodeProps::Region(Default::default()),
        );
        func.entry = entry.into();

        let ctrl = func.create_projection(entry, 0, super::types::CONTROL);
        let mem = func.create_projection(entry, 1, super::types::MEMORY);
        let cont = func.create_projection(entry, 2, super::types::CONT);
        func.params.extend([ctrl, mem, cont]);

        for (i, &ty) in signature.params.iter().enumerate() {
            let proj = func.create_projection(entry, 3 + i as u32, ty);
            func.params.push(proj);
        }

        // The entry's memory chain starts and ends at the memory projection.
        if let NodeProps::Region(region) = &mut func.nodes[entry].props {
            region.memory_in = mem.into();
            region.memory_out = mem.into();
        }

        func
    }

    /// Number of nodes created so far.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Iterate over every node in creation order.
    pub fn nodes(&self) -> keel_entity::Keys<Node> {
        self.nodes.keys()
    }

    /// The formal parameter projection for parameter `index`.
    pub fn param(&self, index: usize) -> Node {
        assert!(
            3 + index < self.params.len(),
            "function `{}` has no parameter {index}",
            self.name
        );
        self.params[3 + index]
    }

    /// Create a node with the given inputs. Nil entries in `inputs` leave the
    /// slot unset.
    pub fn create_node(
        &mut self,
        kind: NodeKind,
        ty: DataType,
        inputs: &[Node],
        props: NodeProps,
    ) -> Node {
        let list = EntityList::from_slice(inputs, &mut self.node_lists);
        let node = self.nodes.push(NodeData {
            kind,
            ty,
            inputs: list,
            first_user: None.into(),
            props,
        });
        for (slot, &input) in inputs.iter().enumerate() {
            if !input.is_nil() {
                self.add_user(input, node, slot as u32);
            }
        }
        node
    }

    /// Create a node with `count` nil inputs, to be filled in with
    /// [`Function::set_input`].
    pub fn create_node_with_slots(
        &mut self,
        kind: NodeKind,
        ty: DataType,
        count: usize,
        props: NodeProps,
    ) -> Node {
        let list = EntityList::with_len(count, Node::nil(), &mut self.node_lists);
        self.nodes.push(NodeData {
            kind,
            ty,
            inputs: list,
            first_user: None.into(),
            props,
        })
    }

    /// Create a projection extracting component `index` of `source`.
    pub fn create_projection(&mut self, source: Node, index: u32, ty: DataType) -> Node {
        debug_assert!(
            self.nodes[source].ty.is_tuple(),
            "projection source {source} in `{}` is not a tuple",
            self.name
        );
        self.create_node(
            NodeKind::Projection,
            ty,
            &[source],
            NodeProps::Proj { index },
        )
    }

    /// The kind of `node`.
    pub fn kind(&self, node: Node) -> NodeKind {
        self.nodes[node].kind
    }

    /// The value type of `node`.
    pub fn ty(&self, node: Node) -> DataType {
        self.nodes[node].ty
    }

    /// The property payload of `node`.
    pub fn props(&self, node: Node) -> &NodeProps {
        &self.nodes[node].props
    }

    /// The property payload of `node`, mutable edition.
    pub fn props_mut(&mut self, node: Node) -> &mut NodeProps {
        &mut self.nodes[node].props
    }

    /// All input slots of `node`, nil placeholders included.
    pub fn inputs(&self, node: Node) -> &[Node] {
        self.nodes[node].inputs.as_slice(&self.node_lists)
    }

    /// The input in `slot`, or `None` if the slot is nil.
    pub fn input(&self, node: Node, slot: usize) -> Option<Node> {
        let raw = *self.inputs(node).get(slot)?;
        if raw.is_nil() {
            None
        } else {
            Some(raw)
        }
    }

    /// Number of input slots of `node`.
    pub fn input_count(&self, node: Node) -> usize {
        self.nodes[node].inputs.len()
    }

    /// Store `input` into `slot` of `node`, maintaining the user lists on
    /// both the old and new producer.
    pub fn set_input(&mut self, node: Node, slot: usize, input: Node) {
        let old = self.nodes[node].inputs.get(slot, &self.node_lists).expect(
            "input slot out of range",
        );
        if old == input {
            return;
        }
        if !old.is_nil() {
            self.remove_user(old, node, slot as u32);
        }
        self.nodes[node].inputs.as_mut_slice(&mut self.node_lists)[slot] = input;
        if !input.is_nil() {
            self.add_user(input, node, slot as u32);
        }
    }

    /// Append a late input to a region or phi, growing its input list.
    ///
    /// Only regions and phis may grow their inputs after construction; every
    /// other node's slot count is fixed.
    pub fn add_input_late(&mut self, node: Node, input: Node) {
        let kind = self.nodes[node].kind;
        assert!(
            matches!(kind, NodeKind::Region | NodeKind::Phi),
            "cannot append an input to {kind:?} node {node} in `{}`",
            self.name
        );
        let slot = self.nodes[node].inputs.len() as u32;
        let mut list = self.nodes[node].inputs;
        list.push(input, &mut self.node_lists);
        self.nodes[node].inputs = list;
        self.add_user(input, node, slot);
    }

    /// Iterate over the users of `node` as `(user, slot)` pairs.
    pub fn users(&self, node: Node) -> UserIter<'_> {
        UserIter {
            users: &self.users,
            next: self.nodes[node].first_user,
        }
    }

    /// Count the users of `node`.
    pub fn user_count(&self, node: Node) -> usize {
        self.users(node).count()
    }

    fn add_user(&mut self, of: Node, user_node: Node, slot: u32) {
        let head = self.nodes[of].first_user;
        let rec = self.users.push(UserData {
            node: user_node,
            slot,
            next: head,
        });
        self.nodes[of].first_user = rec.into();
    }

    fn remove_user(&mut self, of: Node, user_node: Node, slot: u32) {
        let mut prev: PackedOption<User> = None.into();
        let mut cur = self.nodes[of].first_user;
        while let Some(rec) = cur.expand() {
            let data = &self.users[rec];
            if data.node == user_node && data.slot == slot {
                let next = data.next;
                match prev.expand() {
                    Some(p) => self.users[p].next = next,
                    None => self.nodes[of].first_user = next,
                }
                return;
            }
            prev = cur;
            cur = data.next;
        }
        panic!(
            "user list of {of} in `{}` does not mirror the inputs of {user_node}",
            self.name
        );
    }

    /// The value of an `IntConst` node, masked to its bit width.
    pub fn int_value(&self, node: Node) -> u64 {
        match self.nodes[node].props {
            NodeProps::Int { value, bits } => {
                if bits == 0 || bits >= 64 {
                    value
                } else {
                    value & ((1u64 << bits) - 1)
                }
            }
            _ => panic!("node {node} in `{}` is not an integer constant", self.name),
        }
    }

    /// Is `node` pinned to a specific block by its nature (control nodes,
    /// phis, and projections), as opposed to floating data?
    pub fn is_pinned(&self, node: Node) -> bool {
        let data = &self.nodes[node];
        matches!(
            data.kind,
            NodeKind::Entry
                | NodeKind::Exit
                | NodeKind::Region
                | NodeKind::Branch
                | NodeKind::Phi
                | NodeKind::Projection
                | NodeKind::Trap
                | NodeKind::Unreachable
        ) || data.ty.kind == TypeKind::Control
    }

    /// Is `node` cheap enough to recompute at each use instead of keeping it
    /// live in a register?
    pub fn should_rematerialize(&self, node: Node) -> bool {
        matches!(self.nodes[node].kind, NodeKind::IntConst | NodeKind::Symbol)
    }

    /// Walk control predecessors from `node` up to the region or entry that
    /// heads its basic block.
    pub fn parent_region(&self, node: Node) -> Node {
        let mut cur = node;
        loop {
            match self.nodes[cur].kind {
                NodeKind::Region | NodeKind::Entry => return cur,
                _ => {
                    cur = self.input(cur, 0).unwrap_or_else(|| {
                        panic!(
                            "node {node} in `{}` has no control predecessor chain",
                            self.name
                        )
                    });
                }
            }
        }
    }

    /// The single control-typed user of `node`, i.e. the next node in the
    /// block's control chain, if any.
    pub fn next_control(&self, node: Node) -> Option<Node> {
        self.users(node)
            .find(|&(user, slot)| slot == 0 && self.is_control_chained(user))
            .map(|(user, _)| user)
    }

    fn is_control_chained(&self, node: Node) -> bool {
        let data = &self.nodes[node];
        match data.kind {
            // A phi's slot-0 edge points at its region; it is not part of
            // the control chain.
            NodeKind::Phi => false,
            NodeKind::Projection => data.ty.is_control(),
            NodeKind::Region => true,
            _ => self.input(node, 0).is_some(),
        }
    }
}

/// Iterator over the user list of a node.
pub struct UserIter<'a> {
    users: &'a PrimaryMap<User, UserData>,
    next: PackedOption<User>,
}

impl<'a> Iterator for UserIter<'a> {
    type Item = (Node, u32);

    fn next(&mut self) -> Option<Self::Item> {
        let rec = self.next.expand()?;
        let data = &self.users[rec];
        self.next = data.next;
        Some((data.node, data.slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types;

    #[test]
    fn users_mirror_inputs() {
        let sig = Signature::new(vec![types::I32, types::I32], vec![types::I32]);
        let mut func = Function::with_signature("f", sig);
        let a = func.param(0);
        let b = func.param(1);

        let add = func.create_node(
            NodeKind::Add,
            types::I32,
            &[Node::nil(), a, b],
            NodeProps::Arith {
                behavior: Default::default(),
            },
        );

        assert_eq!(func.input(add, 0), None);
        assert_eq!(func.input(add, 1), Some(a));
        assert_eq!(func.input(add, 2), Some(b));
        assert!(func.users(a).any(|(n, s)| n == add && s == 1));
        assert!(func.users(b).any(|(n, s)| n == add && s == 2));

        // Replacing an input unlinks the old user edge.
        func.set_input(add, 2, a);
        assert!(!func.users(b).any(|(n, _)| n == add));
        assert!(func.users(a).any(|(n, s)| n == add && s == 2));
    }

    #[test]
    fn late_inputs_grow_regions() {
        let mut func = Function::with_signature("g", Signature::default());
        let region = func.create_node(
            NodeKind::Region,
            types::CONTROL,
            &[],
            NodeProps::Region(Default::default()),
        );
        let phi = func.create_node(NodeKind::Phi, types::MEMORY, &[region], NodeProps::None);

        let entry_ctrl = func.params[0];
        func.add_input_late(region, entry_ctrl);
        func.add_input_late(phi, func.params[1]);

        // |inputs(phi)| == |predecessors(region)| + 1, slot 0 is the region.
        assert_eq!(func.input_count(phi), func.input_count(region) + 1);
        assert_eq!(func.input(phi, 0), Some(region));
    }
}
