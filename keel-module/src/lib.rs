//! Defines a `Module` that collects functions, globals, and externals into
//! named sections and compiles them into relocatable machine code.
//!
//! The module is the unit that becomes one object file. It owns the symbol
//! table (every function, global, and external is declared by name exactly
//! once) and a small fixed set of sections created for the target system.
//! Functions are appended to a section at declaration; defining a function
//! runs the whole `keel-codegen` pipeline and stores the resulting bytes and
//! symbol patches for the object writers.

#![deny(missing_docs)]

mod module;
mod section;

pub use crate::module::{
    FuncId, GlobalData, GlobalId, InitData, InitObject, Module, ModuleFunction,
};
pub use crate::section::{Comdat, Section, SectionFlags, SectionId};

pub use keel_codegen::ir::SymbolId;

use keel_codegen::CodegenError;

/// Linkage of a symbol: how visible it is outside this module.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Linkage {
    /// Visible to the linker and other objects.
    Public,
    /// Local to this object.
    Private,
    /// Visible throughout the shared object but not exported from it.
    SoLocal,
    /// Exported from the shared object.
    SoExport,
}

impl Linkage {
    /// Does this linkage produce a global (externally visible) object
    /// symbol?
    pub fn is_public(self) -> bool {
        matches!(self, Self::Public | Self::SoExport)
    }
}

/// What a symbol names.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SymbolKind {
    /// The symbol was removed; it keeps its slot but is never emitted.
    Tombstone,
    /// An external symbol resolved by the linker.
    External,
    /// A global data object in one of this module's sections.
    Global,
    /// A function compiled into this module.
    Function,
}

/// One entry in the module's symbol table.
///
/// The numeric object-file id of a symbol is not stored here: ids are
/// assigned by the object writers at emission time, with zero reserved for
/// "unassigned".
#[derive(Clone, Debug)]
pub struct Symbol {
    /// The symbol's name as it appears in the object file.
    pub name: String,
    /// What the symbol names.
    pub kind: SymbolKind,
    /// Visibility of the symbol.
    pub linkage: Linkage,
}

/// Errors produced when building or compiling a module.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// A symbol with this name already exists.
    #[error("symbol `{0}` is declared more than once")]
    DuplicateSymbol(String),

    /// A function was defined twice.
    #[error("function `{0}` is defined more than once")]
    DuplicateDefinition(String),

    /// Compilation of a function failed.
    #[error("compilation failed")]
    Codegen(#[from] CodegenError),
}

/// A convenient alias for a `Result` that uses `ModuleError` as the error
/// type.
pub type ModuleResult<T> = Result<T, ModuleError>;
