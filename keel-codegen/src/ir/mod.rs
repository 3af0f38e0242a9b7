//! Representation of Keel IR functions.
//!
//! The IR is a sea of nodes: every operation is a [`Node`] with an ordered
//! list of input edges and an intrusive list of users mirroring those edges.
//! Control flow, memory state, and data values all flow along the same edge
//! mechanism, distinguished only by the [`DataType`] of the producing node.

mod function;
mod node;
pub mod types;

pub use self::function::{Function, UserIter};
pub use self::node::{
    ArithBehavior, BranchData, CallData, NodeData, NodeKind, NodeProps, RegionData, UserData,
};
pub use self::types::{DataType, TypeKind};

use keel_entity::entity_impl;
use keel_entity::packed_option::ReservedValue;

/// An opaque reference to a node in a function's graph.
///
/// This is the "global value index" of a node: stable for the lifetime of the
/// owning [`Function`] and meaningless outside it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node(u32);
entity_impl!(Node, "n");

impl Node {
    /// The placeholder for an unset input slot.
    ///
    /// Slot 0 of a data node is nil until the node becomes control-dependent,
    /// and pure operators keep it nil forever.
    pub fn nil() -> Self {
        Self::reserved_value()
    }

    /// Is this the nil placeholder rather than a real node?
    pub fn is_nil(self) -> bool {
        self.is_reserved_value()
    }
}

/// An opaque reference to one entry in a function's user list pool.
///
/// Each `User` record represents one input edge seen from the producer's
/// side: "node `n` uses me through slot `s`".
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct User(u32);
entity_impl!(User, "u");

/// An opaque reference to a symbol in the owning module's symbol table.
///
/// The node graph never looks through this reference; it exists so `Symbol`
/// nodes and patches can name module-level entities without the graph crate
/// depending on the module crate.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);
entity_impl!(SymbolId, "sym");

/// Function signature.
///
/// The signature describes the types of formal parameters and return values
/// along with whether the function accepts further variadic arguments.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Signature {
    /// Types of the formal parameters.
    pub params: Vec<DataType>,
    /// Types of the return values.
    pub returns: Vec<DataType>,
    /// True if the function takes variadic arguments after `params`.
    pub variadic: bool,
}

impl Signature {
    /// Create a signature with the given parameter and return types.
    pub fn new(params: Vec<DataType>, returns: Vec<DataType>) -> Self {
        Self {
            params,
            returns,
            variadic: false,
        }
    }
}
