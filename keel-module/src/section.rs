//! Module sections.

use crate::module::{FuncId, GlobalId};
use keel_entity::entity_impl;

/// An opaque reference to a section of the module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(u32);
entity_impl!(SectionId, "section");

bitflags::bitflags! {
    /// Target-independent section attributes; the writers translate them
    /// into format-specific characteristics.
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
    pub struct SectionFlags: u32 {
        /// The section is writable at run time.
        const WRITE = 1;
        /// The section contains executable code.
        const EXEC = 2;
        /// The section holds thread-local data.
        const TLS = 4;
    }
}

/// COMDAT selection for a section.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Comdat {
    /// Not a COMDAT section.
    #[default]
    None,
    /// The linker may pick any one of the identically-named definitions.
    MatchAny,
}

/// A named section of the module.
///
/// Sections own the ordered lists of functions and globals placed in them;
/// the raw layout numbers (file offsets, relocation tables, string-table
/// positions) are computed by the object writers and never stored here.
#[derive(Clone, Debug)]
pub struct Section {
    /// Section name, including the leading dot.
    pub name: String,
    /// Attribute flags.
    pub flags: SectionFlags,
    /// COMDAT selection kind.
    pub comdat: Comdat,
    /// Compiled functions placed in this section, in definition order.
    pub functions: Vec<FuncId>,
    /// Globals placed in this section, in declaration order.
    pub globals: Vec<GlobalId>,
    /// Bytes of code laid out so far (functions only).
    pub code_size: u32,
    /// Bytes of data laid out so far (globals only).
    pub data_size: u32,
}

impl Section {
    /// An empty section with the given name and flags.
    pub fn new(name: impl Into<String>, flags: SectionFlags) -> Self {
        Self {
            name: name.into(),
            flags,
            comdat: Comdat::None,
            functions: Vec::new(),
            globals: Vec::new(),
            code_size: 0,
            data_size: 0,
        }
    }

    /// Total bytes of section content.
    pub fn total_size(&self) -> u32 {
        self.code_size + self.data_size
    }
}
