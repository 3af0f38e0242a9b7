//! The function builder.

use keel_codegen::ir::types;
use keel_codegen::ir::{
    ArithBehavior, BranchData, CallData, DataType, Function, Node, NodeKind, NodeProps,
    RegionData, Signature, SymbolId,
};
use keel_module::{FuncId, Module};
use smallvec::SmallVec;

/// Temporary object used to build a single function's IR.
///
/// The builder borrows the module so calls can reference other functions and
/// externals by symbol. It keeps one piece of state: the active control
/// node, where the next effectful node attaches. Terminating operations
/// (branches, returns) clear it; [`FunctionBuilder::switch_to_region`]
/// re-establishes it at a region.
pub struct FunctionBuilder<'a> {
    module: &'a mut Module,
    func_id: FuncId,
    control: Option<Node>,
}

impl<'a> FunctionBuilder<'a> {
    /// Start building `func`, with the insert point at the entry's control
    /// projection.
    pub fn new(module: &'a mut Module, func_id: FuncId) -> Self {
        let control = module.functions[func_id].func.params[0];
        Self {
            module,
            func_id,
            control: Some(control),
        }
    }

    /// The function under construction.
    pub fn func(&self) -> &Function {
        &self.module.functions[self.func_id].func
    }

    /// The function under construction, mutable edition.
    pub fn func_mut(&mut self) -> &mut Function {
        &mut self.module.functions[self.func_id].func
    }

    /// The module being built into.
    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    fn insert_point(&self) -> Node {
        self.control.unwrap_or_else(|| {
            panic!(
                "no insert point is set in `{}`; switch to a region first",
                self.func().name
            )
        })
    }

    /// The projection carrying formal parameter `index`.
    pub fn param(&self, index: usize) -> Node {
        self.func().param(index)
    }

    /// Move the insert point to `region`.
    pub fn switch_to_region(&mut self, region: Node) {
        debug_assert_eq!(self.func().kind(region), NodeKind::Region);
        self.control = Some(region);
    }

    /// Is the current block still open (no terminator built yet)?
    pub fn is_filled(&self) -> bool {
        self.control.is_none()
    }

    // ----- control flow --------------------------------------------------

    /// Create a new region with its memory phi.
    pub fn create_region(&mut self) -> Node {
        let func = self.func_mut();
        let region = func.create_node(
            NodeKind::Region,
            types::CONTROL,
            &[],
            NodeProps::Region(RegionData::default()),
        );
        let phi = func.create_node(NodeKind::Phi, types::MEMORY, &[region], NodeProps::None);
        if let NodeProps::Region(data) = func.props_mut(region) {
            data.memory_in = phi.into();
            data.memory_out = phi.into();
        }
        region
    }

    /// Branch unconditionally to `target`, closing the current block.
    pub fn create_branch(&mut self, target: Node) {
        let control = self.insert_point();
        let memory = self.peek_memory();

        let func = self.func_mut();
        func.terminators.push(control);
        func.add_input_late(target, control);
        Self::add_memory_edge(func, memory, target);
        self.control = None;
    }

    /// Branch to `if_true` or `if_false` on `condition`, closing the
    /// current block.
    pub fn create_conditional_branch(&mut self, condition: Node, if_true: Node, if_false: Node) {
        let control = self.insert_point();
        let memory = self.peek_memory();

        let func = self.func_mut();
        let branch = func.create_node(
            NodeKind::Branch,
            types::TUPLE,
            &[control, condition],
            NodeProps::Branch(BranchData {
                successors: 2,
                keys: smallvec::smallvec![0],
            }),
        );

        for (i, target) in [if_true, if_false].into_iter().enumerate() {
            let proj = func.create_projection(branch, i as u32, types::CONTROL);
            func.add_input_late(target, proj);
            Self::add_memory_edge(func, memory, target);
        }

        func.terminators.push(branch);
        self.control = None;
    }

    /// Return from the function. All returns funnel into a single exit
    /// region whose phis merge the returned values and the memory state.
    pub fn create_return(&mut self, values: &[Node]) {
        let control = self.insert_point();
        let memory = self.peek_memory();

        let continuation = self.func().params[2];
        let func = self.func_mut();

        if let Some(exit) = func.exit.expand() {
            // Append this return as another predecessor of the exit region.
            let exit_region = func.input(exit, 0).unwrap();
            let memory_phi = func.input(exit, 1).unwrap();
            func.add_input_late(memory_phi, memory);
            for (i, &value) in values.iter().enumerate() {
                let phi = func.input(exit, 3 + i).unwrap_or_else(|| {
                    panic!("return arity mismatch in `{}`", func.name)
                });
                func.add_input_late(phi, value);
            }
            func.add_input_late(exit_region, control);
        } else {
            let exit_region = func.create_node(
                NodeKind::Region,
                types::CONTROL,
                &[],
                NodeProps::Region(RegionData::default()),
            );
            let memory_phi = func.create_node(
                NodeKind::Phi,
                types::MEMORY,
                &[exit_region, memory],
                NodeProps::None,
            );

            let mut inputs: SmallVec<[Node; 6]> = SmallVec::new();
            inputs.extend([exit_region, memory_phi, continuation]);
            for &value in values {
                let ty = func.ty(value);
                let phi = func.create_node(
                    NodeKind::Phi,
                    ty,
                    &[exit_region, value],
                    NodeProps::None,
                );
                inputs.push(phi);
            }

            let exit = func.create_node(
                NodeKind::Exit,
                types::CONTROL,
                &inputs,
                NodeProps::Region(RegionData::default()),
            );

            if let NodeProps::Region(data) = func.props_mut(exit_region) {
                data.memory_in = memory_phi.into();
                data.memory_out = memory_phi.into();
                data.end = exit.into();
            }

            func.add_input_late(exit_region, control);
            func.terminators.push(exit);
            func.exit = exit.into();
        }

        self.control = None;
    }

    /// An unconditional trap, closing the current block.
    pub fn create_trap(&mut self) {
        let control = self.insert_point();
        let func = self.func_mut();
        let trap = func.create_node(NodeKind::Trap, types::CONTROL, &[control], NodeProps::None);
        func.terminators.push(trap);
        self.control = None;
    }

    /// Mark the current point unreachable, closing the current block.
    pub fn create_unreachable(&mut self) {
        let control = self.insert_point();
        let func = self.func_mut();
        let node = func.create_node(
            NodeKind::Unreachable,
            types::CONTROL,
            &[control],
            NodeProps::None,
        );
        func.terminators.push(node);
        self.control = None;
    }

    // ----- constants -----------------------------------------------------

    /// A signed integer constant of the given bit width.
    pub fn create_signed_integer(&mut self, value: i64, bits: u8) -> Node {
        self.create_unsigned_integer(value as u64, bits)
    }

    /// An unsigned integer constant of the given bit width, masked to it.
    pub fn create_unsigned_integer(&mut self, mut value: u64, bits: u8) -> Node {
        if bits < 64 {
            value &= !0u64 >> (64 - bits);
        }
        self.func_mut().create_node(
            NodeKind::IntConst,
            DataType::int(bits),
            &[Node::nil()],
            NodeProps::Int { value, bits },
        )
    }

    /// A boolean constant.
    pub fn create_bool(&mut self, value: bool) -> Node {
        self.func_mut().create_node(
            NodeKind::IntConst,
            types::BOOL,
            &[Node::nil()],
            NodeProps::Int {
                value: value as u64,
                bits: 1,
            },
        )
    }

    // ----- arithmetic ----------------------------------------------------

    fn binary(
        &mut self,
        kind: NodeKind,
        left: Node,
        right: Node,
        behavior: ArithBehavior,
    ) -> Node {
        let func = self.func_mut();
        assert!(
            func.ty(left) == func.ty(right),
            "operand types of {kind:?} differ in `{}`: {} vs {}",
            func.name,
            func.ty(left),
            func.ty(right)
        );
        let ty = func.ty(left);
        func.create_node(
            kind,
            ty,
            &[Node::nil(), left, right],
            NodeProps::Arith { behavior },
        )
    }

    /// Integer addition.
    pub fn create_add(&mut self, left: Node, right: Node, behavior: ArithBehavior) -> Node {
        self.binary(NodeKind::Add, left, right, behavior)
    }

    /// Integer subtraction.
    pub fn create_sub(&mut self, left: Node, right: Node, behavior: ArithBehavior) -> Node {
        self.binary(NodeKind::Sub, left, right, behavior)
    }

    /// Integer multiplication.
    pub fn create_mul(&mut self, left: Node, right: Node, behavior: ArithBehavior) -> Node {
        self.binary(NodeKind::Mul, left, right, behavior)
    }

    /// Bitwise and. Bitwise operators cannot wrap.
    pub fn create_and(&mut self, left: Node, right: Node) -> Node {
        self.binary(NodeKind::And, left, right, ArithBehavior::None)
    }

    /// Bitwise or.
    pub fn create_or(&mut self, left: Node, right: Node) -> Node {
        self.binary(NodeKind::Or, left, right, ArithBehavior::None)
    }

    /// Bitwise exclusive or.
    pub fn create_xor(&mut self, left: Node, right: Node) -> Node {
        self.binary(NodeKind::Xor, left, right, ArithBehavior::None)
    }

    /// Left shift.
    pub fn create_shl(&mut self, value: Node, amount: Node) -> Node {
        self.binary(NodeKind::Shl, value, amount, ArithBehavior::None)
    }

    /// Logical right shift.
    pub fn create_shr(&mut self, value: Node, amount: Node) -> Node {
        self.binary(NodeKind::Shr, value, amount, ArithBehavior::None)
    }

    /// Arithmetic right shift.
    pub fn create_sar(&mut self, value: Node, amount: Node) -> Node {
        self.binary(NodeKind::Sar, value, amount, ArithBehavior::None)
    }

    /// Bitwise complement.
    pub fn create_not(&mut self, value: Node) -> Node {
        let ty = self.func().ty(value);
        self.func_mut()
            .create_node(NodeKind::Not, ty, &[Node::nil(), value], NodeProps::None)
    }

    /// Two's complement negation.
    pub fn create_neg(&mut self, value: Node) -> Node {
        let ty = self.func().ty(value);
        self.func_mut()
            .create_node(NodeKind::Neg, ty, &[Node::nil(), value], NodeProps::None)
    }

    // ----- comparisons ---------------------------------------------------

    fn compare(&mut self, kind: NodeKind, left: Node, right: Node) -> Node {
        let func = self.func_mut();
        assert!(
            func.ty(left) == func.ty(right),
            "operand types of {kind:?} differ in `{}`",
            func.name
        );
        let operand_ty = func.ty(left);
        func.create_node(
            kind,
            types::BOOL,
            &[Node::nil(), left, right],
            NodeProps::Cmp { operand_ty },
        )
    }

    /// Equality.
    pub fn create_cmp_eq(&mut self, left: Node, right: Node) -> Node {
        self.compare(NodeKind::CmpEq, left, right)
    }

    /// Inequality.
    pub fn create_cmp_ne(&mut self, left: Node, right: Node) -> Node {
        self.compare(NodeKind::CmpNe, left, right)
    }

    /// Less-than, signed or unsigned.
    pub fn create_cmp_lt(&mut self, left: Node, right: Node, signed: bool) -> Node {
        let kind = if signed {
            NodeKind::CmpSlt
        } else {
            NodeKind::CmpUlt
        };
        self.compare(kind, left, right)
    }

    /// Less-than-or-equal, signed or unsigned.
    pub fn create_cmp_le(&mut self, left: Node, right: Node, signed: bool) -> Node {
        let kind = if signed {
            NodeKind::CmpSle
        } else {
            NodeKind::CmpUle
        };
        self.compare(kind, left, right)
    }

    /// Greater-than, expressed by swapping the operands of less-than.
    pub fn create_cmp_gt(&mut self, left: Node, right: Node, signed: bool) -> Node {
        self.create_cmp_lt(right, left, signed)
    }

    /// Greater-than-or-equal, expressed by swapping the operands.
    pub fn create_cmp_ge(&mut self, left: Node, right: Node, signed: bool) -> Node {
        self.create_cmp_le(right, left, signed)
    }

    // ----- conversions ---------------------------------------------------

    /// Sign-extend to a wider type.
    pub fn create_sxt(&mut self, value: Node, ty: DataType) -> Node {
        self.func_mut()
            .create_node(NodeKind::SignExtend, ty, &[Node::nil(), value], NodeProps::None)
    }

    /// Zero-extend to a wider type.
    pub fn create_zxt(&mut self, value: Node, ty: DataType) -> Node {
        self.func_mut()
            .create_node(NodeKind::ZeroExtend, ty, &[Node::nil(), value], NodeProps::None)
    }

    /// Truncate to a narrower type.
    pub fn create_truncate(&mut self, value: Node, ty: DataType) -> Node {
        self.func_mut()
            .create_node(NodeKind::Truncate, ty, &[Node::nil(), value], NodeProps::None)
    }

    // ----- memory --------------------------------------------------------

    /// A stack slot of the given size and alignment.
    pub fn create_local(&mut self, size: u32, align: u32) -> Node {
        let entry = self.func().entry.unwrap();
        self.func_mut().create_node(
            NodeKind::Local,
            types::PTR,
            &[entry],
            NodeProps::Local { size, align },
        )
    }

    /// The address `base + offset`.
    pub fn create_member_access(&mut self, base: Node, offset: i32) -> Node {
        self.func_mut().create_node(
            NodeKind::MemberAccess,
            types::PTR,
            &[Node::nil(), base],
            NodeProps::Member { offset },
        )
    }

    /// The address `base + index * stride`.
    pub fn create_array_access(&mut self, base: Node, index: Node, stride: i64) -> Node {
        self.func_mut().create_node(
            NodeKind::ArrayAccess,
            types::PTR,
            &[Node::nil(), base, index],
            NodeProps::Array { stride },
        )
    }

    /// The address of a module symbol.
    pub fn create_symbol_address(&mut self, symbol: SymbolId) -> Node {
        self.func_mut().create_node(
            NodeKind::Symbol,
            types::PTR,
            &[Node::nil()],
            NodeProps::Symbol { symbol },
        )
    }

    /// Load a value of type `ty` from `address`.
    ///
    /// A volatile load is ordered in the memory chain like a store; its
    /// value is extracted through a projection.
    pub fn create_load(
        &mut self,
        address: Node,
        ty: DataType,
        align: u32,
        volatile: bool,
    ) -> Node {
        let control = self.insert_point();
        let memory = self.peek_memory();
        let func = self.func_mut();

        if volatile {
            let read = func.create_node(
                NodeKind::Read,
                types::TUPLE,
                &[control, memory, address],
                NodeProps::MemAccess { align },
            );
            let memory_proj = func.create_projection(read, 0, types::MEMORY);
            let value = func.create_projection(read, 1, ty);
            self.append_memory(memory_proj);
            value
        } else {
            func.create_node(
                NodeKind::Load,
                ty,
                &[control, memory, address],
                NodeProps::MemAccess { align },
            )
        }
    }

    /// An atomic load of type `ty` from `address`.
    ///
    /// Aligned loads are atomic on the targets Keel supports, so this only
    /// differs from a plain load in the node kind it records.
    pub fn create_atomic_load(&mut self, address: Node, ty: DataType, align: u32) -> Node {
        let control = self.insert_point();
        let memory = self.peek_memory();
        self.func_mut().create_node(
            NodeKind::AtomicLoad,
            ty,
            &[control, memory, address],
            NodeProps::MemAccess { align },
        )
    }

    /// Store `value` to `address`.
    pub fn create_store(&mut self, address: Node, value: Node, align: u32, volatile: bool) {
        let control = self.insert_point();
        let memory = self.peek_memory();
        let kind = if volatile {
            NodeKind::Write
        } else {
            NodeKind::Store
        };
        let store = self.func_mut().create_node(
            kind,
            types::MEMORY,
            &[control, memory, address, value],
            NodeProps::MemAccess { align },
        );
        self.append_memory(store);
    }

    // ----- calls ---------------------------------------------------------

    /// Call another function of this module. Returns the value projections.
    pub fn create_call(&mut self, callee: FuncId, args: &[Node]) -> Vec<Node> {
        let signature = self.module.functions[callee].func.signature.clone();
        let symbol = self.module.functions[callee].symbol;
        let address = self.create_symbol_address(symbol);
        self.build_call(NodeKind::Call, signature, address, args)
    }

    /// Call an external symbol with the given signature.
    pub fn create_call_external(
        &mut self,
        callee: SymbolId,
        signature: Signature,
        args: &[Node],
    ) -> Vec<Node> {
        let address = self.create_symbol_address(callee);
        self.build_call(NodeKind::Call, signature, address, args)
    }

    /// Call through a computed address.
    pub fn create_call_indirect(
        &mut self,
        address: Node,
        signature: Signature,
        args: &[Node],
    ) -> Vec<Node> {
        self.build_call(NodeKind::Call, signature, address, args)
    }

    fn build_call(
        &mut self,
        kind: NodeKind,
        signature: Signature,
        address: Node,
        args: &[Node],
    ) -> Vec<Node> {
        let control = self.insert_point();
        let func = self.func_mut();

        let mut inputs: SmallVec<[Node; 8]> = SmallVec::new();
        inputs.extend([control, Node::nil(), address]);
        inputs.extend_from_slice(args);

        let call = func.create_node(
            kind,
            types::TUPLE,
            &inputs,
            NodeProps::Call(CallData {
                signature: signature.clone(),
                projections: SmallVec::new(),
            }),
        );

        let control_proj = func.create_projection(call, 0, types::CONTROL);
        let memory_proj = func.create_projection(call, 1, types::MEMORY);
        let mut projections: SmallVec<[Node; 4]> = SmallVec::new();
        projections.extend([control_proj, memory_proj]);

        let mut returns = Vec::with_capacity(signature.returns.len());
        for (i, &ty) in signature.returns.iter().enumerate() {
            let proj = func.create_projection(call, 2 + i as u32, ty);
            projections.push(proj);
            returns.push(proj);
        }
        if let NodeProps::Call(data) = func.props_mut(call) {
            data.projections = projections;
        }

        // The call consumes the current memory state and produces the next
        // one through its memory projection.
        self.control = Some(control_proj);
        let old = self.append_memory(memory_proj);
        self.func_mut().set_input(call, 1, old);

        returns
    }

    // ----- memory chain upkeep -------------------------------------------

    /// The region heading the block the insert point is in.
    fn active_region(&self) -> Node {
        self.func().parent_region(self.insert_point())
    }

    /// The current end of the active block's memory chain.
    fn peek_memory(&self) -> Node {
        let region = self.active_region();
        match self.func().props(region) {
            NodeProps::Region(data) => data
                .memory_out
                .expect("region has no memory chain"),
            _ => unreachable!(),
        }
    }

    /// Advance the memory chain to `memory`, returning the previous state.
    fn append_memory(&mut self, memory: Node) -> Node {
        let region = self.active_region();
        let func = self.func_mut();
        match func.props_mut(region) {
            NodeProps::Region(data) => {
                let old = data.memory_out.expect("region has no memory chain");
                data.memory_out = memory.into();
                old
            }
            _ => unreachable!(),
        }
    }

    /// Record the memory state flowing into `target`'s memory phi.
    fn add_memory_edge(func: &mut Function, memory: Node, target: Node) {
        debug_assert_eq!(func.kind(target), NodeKind::Region);
        let memory_in = match func.props(target) {
            NodeProps::Region(data) => data
                .memory_in
                .expect("branch target region has no memory phi"),
            _ => panic!("branch target is not a region"),
        };
        debug_assert_eq!(func.kind(memory_in), NodeKind::Phi);
        func.add_input_late(memory_in, memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_codegen::{Arch, System, Target};
    use keel_module::Linkage;

    fn test_module() -> Module {
        Module::new(Target::new(Arch::X64, System::Linux))
    }

    #[test]
    fn straight_line_return() {
        let mut module = test_module();
        let func = module
            .declare_function(
                "add7",
                Signature::new(vec![types::I64], vec![types::I64]),
                Linkage::Public,
            )
            .unwrap();

        let mut builder = FunctionBuilder::new(&mut module, func);
        let x = builder.param(0);
        let seven = builder.create_signed_integer(7, 64);
        let sum = builder.create_add(x, seven, ArithBehavior::None);
        builder.create_return(&[sum]);
        assert!(builder.is_filled());

        let func = &module.functions[func].func;
        let exit = func.exit.expand().unwrap();
        // Exit carries region, memory phi, continuation, and one value phi.
        assert_eq!(func.input_count(exit), 4);
        let value_phi = func.input(exit, 3).unwrap();
        assert_eq!(func.kind(value_phi), NodeKind::Phi);
        assert_eq!(func.input(value_phi, 1), Some(sum));
    }

    #[test]
    fn memory_chain_advances() {
        let mut module = test_module();
        let func = module
            .declare_function("stores", Signature::default(), Linkage::Private)
            .unwrap();

        let mut builder = FunctionBuilder::new(&mut module, func);
        let slot = builder.create_local(8, 8);
        let value = builder.create_signed_integer(5, 64);

        let before = builder.peek_memory();
        builder.create_store(slot, value, 8, false);
        let after = builder.peek_memory();

        assert_ne!(before, after);
        let func_ref = builder.func();
        assert_eq!(func_ref.kind(after), NodeKind::Store);
        // The store consumed the previous memory state through slot 1.
        assert_eq!(func_ref.input(after, 1), Some(before));
    }

    #[test]
    fn diamond_merges_memory() {
        let mut module = test_module();
        let func = module
            .declare_function(
                "pick",
                Signature::new(vec![types::BOOL], vec![]),
                Linkage::Private,
            )
            .unwrap();

        let mut builder = FunctionBuilder::new(&mut module, func);
        let cond = builder.param(0);
        let then_region = builder.create_region();
        let else_region = builder.create_region();
        let merge = builder.create_region();

        builder.create_conditional_branch(cond, then_region, else_region);

        builder.switch_to_region(then_region);
        builder.create_branch(merge);

        builder.switch_to_region(else_region);
        builder.create_branch(merge);

        builder.switch_to_region(merge);
        builder.create_return(&[]);

        let func = &module.functions[func].func;
        // The merge's memory phi has the region plus one input per
        // predecessor.
        let phi = func
            .users(merge)
            .find(|&(u, _)| func.kind(u) == NodeKind::Phi)
            .map(|(u, _)| u)
            .unwrap();
        assert_eq!(func.input_count(phi), func.input_count(merge) + 1);
        assert_eq!(func.input_count(merge), 2);
    }
}
