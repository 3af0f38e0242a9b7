//! Keel code generation library.
//!
//! This crate lowers a sea-of-nodes intermediate representation to x86-64
//! machine code. A function moves through the pipeline in stages, each with
//! its own module:
//!
//! 1. [`ir`]: the node graph itself, with data types, nodes, and functions.
//! 2. [`cfg`]: basic blocks recovered from the control edges.
//! 3. [`domtree`]: immediate dominators over the block graph.
//! 4. [`schedule`]: late placement of floating nodes into blocks.
//! 5. [`isa`]: target description and per-ISA instruction selection.
//! 6. [`regalloc`]: live intervals and linear-scan register allocation.
//! 7. [`binemit`]: the code buffer the encoder writes into.
//!
//! [`Context::compile`] drives a single function through all of the stages
//! and produces a [`CompiledCode`] holding the raw bytes, the symbol patches,
//! and the frame metadata the object writers need.

#![deny(missing_docs)]

pub use keel_entity as entity;

pub mod binemit;
pub mod cfg;
pub mod domtree;
pub mod ir;
pub mod isa;
pub mod regalloc;
pub mod schedule;

mod context;

pub use crate::context::{Context, CompiledCode};
pub use crate::isa::{Abi, Arch, System, Target};

/// A compilation error.
///
/// Errors of this kind are recoverable conditions surfaced to the caller;
/// malformed IR is a programmer error and is reported by panicking with a
/// message naming the offending function and node instead.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// The requested (architecture, system) pair has no back end.
    #[error("unsupported target: {0}")]
    Unsupported(String),

    /// A function needed more simultaneously live virtual registers than the
    /// allocator supports.
    #[error("too many live virtual registers in function `{0}`")]
    VirtualRegisterOverflow(String),
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error
/// type.
pub type CodegenResult<T> = Result<T, CodegenError>;
