//! Node kinds and their property payloads.

use super::{DataType, Node, Signature, SymbolId, User};
use keel_entity::packed_option::PackedOption;
use keel_entity::EntityList;
use smallvec::SmallVec;

/// The operation a node performs.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum NodeKind {
    /// The unique function entry; a tuple producing control, memory, the
    /// continuation, and the parameters as projections.
    Entry,
    /// The unique function exit; all returns flow into its region.
    Exit,
    /// A control-flow join point and the head of a basic block.
    Region,
    /// A value merge at a region; input 0 is the region itself.
    Phi,
    /// Extraction of one component of a tuple-typed producer.
    Projection,
    /// A conditional or multi-way control split.
    Branch,
    /// A function call.
    Call,
    /// A raw system call.
    SystemCall,
    /// A call in tail position, lowered as a jump.
    TailCall,

    /// An integer constant.
    IntConst,
    /// Integer addition.
    Add,
    /// Integer subtraction.
    Sub,
    /// Integer multiplication.
    Mul,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise exclusive or.
    Xor,
    /// Left shift.
    Shl,
    /// Logical right shift.
    Shr,
    /// Arithmetic right shift.
    Sar,
    /// Two's complement negation.
    Neg,
    /// Bitwise complement.
    Not,
    /// Sign extension to a wider integer type.
    SignExtend,
    /// Zero extension to a wider integer type.
    ZeroExtend,
    /// Truncation to a narrower type.
    Truncate,

    /// Integer equality.
    CmpEq,
    /// Integer inequality.
    CmpNe,
    /// Signed less-than.
    CmpSlt,
    /// Signed less-than-or-equal.
    CmpSle,
    /// Unsigned less-than.
    CmpUlt,
    /// Unsigned less-than-or-equal.
    CmpUle,
    /// Float less-than.
    CmpFlt,
    /// Float less-than-or-equal.
    CmpFle,

    /// A memory load.
    Load,
    /// A memory store.
    Store,
    /// An atomic load.
    AtomicLoad,
    /// A volatile load; tuple-typed with memory and value projections.
    Read,
    /// A volatile store.
    Write,

    /// A stack slot in the function frame.
    Local,
    /// The address of a module-level symbol.
    Symbol,
    /// A constant-offset address computation.
    MemberAccess,
    /// A scaled-index address computation.
    ArrayAccess,

    /// An unconditional trap.
    Trap,
    /// A point the front end asserts is never reached.
    Unreachable,
}

impl NodeKind {
    /// Is this one of the compare operators?
    pub fn is_compare(self) -> bool {
        matches!(
            self,
            Self::CmpEq
                | Self::CmpNe
                | Self::CmpSlt
                | Self::CmpSle
                | Self::CmpUlt
                | Self::CmpUle
                | Self::CmpFlt
                | Self::CmpFle
        )
    }

    /// Does this node kind end a basic block?
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::Branch | Self::Exit | Self::Trap | Self::Unreachable | Self::TailCall
        )
    }

    /// Does this node consume and produce the memory state?
    pub fn is_memory_effect(self) -> bool {
        matches!(
            self,
            Self::Store
                | Self::Write
                | Self::Read
                | Self::Call
                | Self::SystemCall
                | Self::TailCall
                | Self::AtomicLoad
        )
    }
}

/// Overflow behaviour of an arithmetic node.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub enum ArithBehavior {
    /// Wrapping arithmetic; no assumptions.
    #[default]
    None,
    /// No signed wrap.
    Nsw,
    /// No unsigned wrap.
    Nuw,
}

/// Region property payload shared by `Entry`, `Region`, and `Exit` nodes.
#[derive(Clone, Debug, Default)]
pub struct RegionData {
    /// The memory phi (or entry memory projection) on entry to the block.
    pub memory_in: PackedOption<Node>,
    /// The current end of the block's memory chain.
    pub memory_out: PackedOption<Node>,
    /// The last control node of the block, once construction has sealed it.
    pub end: PackedOption<Node>,
    /// Dominator link filled in by scheduling.
    pub dom: PackedOption<Node>,
}

/// Branch property payload.
#[derive(Clone, Debug, Default)]
pub struct BranchData {
    /// Number of successor projections hanging off this branch.
    pub successors: u32,
    /// Comparison keys; a single `0` for an ordinary conditional branch.
    pub keys: SmallVec<[i64; 2]>,
}

/// Call property payload.
#[derive(Clone, Debug)]
pub struct CallData {
    /// The callee's signature.
    pub signature: Signature,
    /// Projections: `[control, memory, return values...]`.
    pub projections: SmallVec<[Node; 4]>,
}

/// The property payload of a node, selected by its [`NodeKind`].
#[derive(Clone, Debug)]
pub enum NodeProps {
    /// No payload.
    None,
    /// `IntConst` payload.
    Int {
        /// The constant's value, zero-extended to 64 bits.
        value: u64,
        /// The logical bit width of the constant.
        bits: u8,
    },
    /// `Entry` / `Region` / `Exit` payload.
    Region(RegionData),
    /// `Branch` payload.
    Branch(BranchData),
    /// `Call` family payload.
    Call(CallData),
    /// `Projection` payload.
    Proj {
        /// Index of the extracted tuple component.
        index: u32,
    },
    /// `Local` payload.
    Local {
        /// Size of the stack slot in bytes.
        size: u32,
        /// Required alignment in bytes.
        align: u32,
    },
    /// `MemberAccess` payload.
    Member {
        /// Constant byte offset from the base address.
        offset: i32,
    },
    /// `ArrayAccess` payload.
    Array {
        /// Byte stride between consecutive elements.
        stride: i64,
    },
    /// `Load` / `Store` / `Read` / `Write` / `AtomicLoad` payload.
    MemAccess {
        /// Access alignment in bytes.
        align: u32,
    },
    /// `Symbol` payload.
    Symbol {
        /// The referenced module symbol.
        symbol: SymbolId,
    },
    /// Arithmetic payload.
    Arith {
        /// Overflow behaviour.
        behavior: ArithBehavior,
    },
    /// Compare payload.
    Cmp {
        /// The type of the compared operands; the node itself is `bool`.
        operand_ty: DataType,
    },
}

/// The complete in-memory representation of one node.
#[derive(Clone, Debug)]
pub struct NodeData {
    /// The operation.
    pub kind: NodeKind,
    /// The type of the produced value.
    pub ty: DataType,
    /// Ordered input slots. Slot 0 is the control predecessor (or nil),
    /// slot 1 the memory predecessor for memory-consuming nodes, and
    /// slots 2+ the data operands.
    pub inputs: EntityList<Node>,
    /// Head of the singly-linked user list.
    pub first_user: PackedOption<User>,
    /// Kind-specific payload.
    pub props: NodeProps,
}

/// One record in the user-list pool: a back edge saying "`node` reads me
/// through input `slot`".
#[derive(Clone, Debug)]
pub struct UserData {
    /// The using node.
    pub node: Node,
    /// Which of `node`'s input slots holds the edge.
    pub slot: u32,
    /// Next record in the producer's user list.
    pub next: PackedOption<User>,
}
