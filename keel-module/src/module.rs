//! The module: symbol table, sections, functions, globals, externals.

use crate::section::{Section, SectionFlags, SectionId};
use crate::{Linkage, ModuleError, ModuleResult, Symbol, SymbolKind};
use keel_codegen::ir::{Function, Signature, SymbolId};
use keel_codegen::{CompiledCode, Context, System, Target};
use keel_entity::{entity_impl, PrimaryMap};
use rustc_hash::FxHashMap;

/// An opaque reference to a function declared in a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(u32);
entity_impl!(FuncId, "fn");

/// An opaque reference to a global declared in a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(u32);
entity_impl!(GlobalId, "global");

/// A function declared in the module: its IR, its symbol, and, once
/// defined, its compiled code.
pub struct ModuleFunction {
    /// The function's IR graph.
    pub func: Function,
    /// The module symbol naming this function.
    pub symbol: SymbolId,
    /// Visibility.
    pub linkage: Linkage,
    /// The section the code is placed in.
    pub section: SectionId,
    /// Compiled output, present after `define_function`.
    pub compiled: Option<CompiledCode>,
    /// Byte offset of the code within its section.
    pub code_offset: u32,
}

/// One initialized region or pointer relocation inside a global.
#[derive(Clone, Debug)]
pub struct InitObject {
    /// Offset within the global.
    pub offset: u32,
    /// What goes at that offset.
    pub data: InitData,
}

/// The content of an [`InitObject`].
#[derive(Clone, Debug)]
pub enum InitData {
    /// Literal bytes.
    Bytes(Vec<u8>),
    /// An absolute pointer to another symbol, fixed up by the linker.
    Reloc(SymbolId),
}

/// A global data object.
#[derive(Clone, Debug)]
pub struct GlobalData {
    /// The module symbol naming this global.
    pub symbol: SymbolId,
    /// Visibility.
    pub linkage: Linkage,
    /// The section the data is placed in.
    pub section: SectionId,
    /// Byte offset of the data within its section's data area.
    pub position: u32,
    /// Size in bytes.
    pub size: u32,
    /// Alignment in bytes.
    pub align: u32,
    /// Initialized regions and pointer relocations.
    pub init: Vec<InitObject>,
}

/// A module under construction: the in-memory form of one object file.
pub struct Module {
    target: Target,
    /// The symbol table. Object-file ids are assigned at emission.
    pub symbols: PrimaryMap<SymbolId, Symbol>,
    names: FxHashMap<String, SymbolId>,
    /// The fixed set of sections for the target system.
    pub sections: PrimaryMap<SectionId, Section>,
    /// Declared functions.
    pub functions: PrimaryMap<FuncId, ModuleFunction>,
    /// Declared globals.
    pub globals: PrimaryMap<GlobalId, GlobalData>,
    /// Declared externals, in declaration order.
    pub externals: Vec<SymbolId>,
}

impl Module {
    /// An empty module for `target`, with the standard sections created:
    /// `.text`, `.data`, and the read-only data section; Windows targets
    /// also get `.tls$`.
    pub fn new(target: Target) -> Self {
        let mut sections = PrimaryMap::new();
        sections.push(Section::new(".text", SectionFlags::EXEC));
        sections.push(Section::new(".data", SectionFlags::WRITE));
        match target.system() {
            System::Windows => {
                sections.push(Section::new(".rdata", SectionFlags::empty()));
                sections.push(Section::new(
                    ".tls$",
                    SectionFlags::WRITE | SectionFlags::TLS,
                ));
            }
            System::Linux => {
                sections.push(Section::new(".rodata", SectionFlags::empty()));
            }
        }

        Self {
            target,
            symbols: PrimaryMap::new(),
            names: FxHashMap::default(),
            sections,
            functions: PrimaryMap::new(),
            globals: PrimaryMap::new(),
            externals: Vec::new(),
        }
    }

    /// The module's target.
    pub fn target(&self) -> Target {
        self.target
    }

    /// The code section.
    pub fn text_section(&self) -> SectionId {
        SectionId::from_u32(0)
    }

    /// The mutable data section.
    pub fn data_section(&self) -> SectionId {
        SectionId::from_u32(1)
    }

    /// The read-only data section (`.rdata` / `.rodata`).
    pub fn rodata_section(&self) -> SectionId {
        SectionId::from_u32(2)
    }

    /// Look up a symbol by name.
    pub fn get_name(&self, name: &str) -> Option<SymbolId> {
        self.names.get(name).copied()
    }

    fn new_symbol(
        &mut self,
        name: &str,
        kind: SymbolKind,
        linkage: Linkage,
    ) -> ModuleResult<SymbolId> {
        if self.names.contains_key(name) {
            return Err(ModuleError::DuplicateSymbol(name.to_string()));
        }
        let id = self.symbols.push(Symbol {
            name: name.to_string(),
            kind,
            linkage,
        });
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Declare an external symbol resolved by the linker.
    pub fn declare_external(&mut self, name: &str) -> ModuleResult<SymbolId> {
        let id = self.new_symbol(name, SymbolKind::External, Linkage::Public)?;
        self.externals.push(id);
        Ok(id)
    }

    /// Declare a function, creating its IR shell and appending it to the
    /// text section.
    pub fn declare_function(
        &mut self,
        name: &str,
        signature: Signature,
        linkage: Linkage,
    ) -> ModuleResult<FuncId> {
        let symbol = self.new_symbol(name, SymbolKind::Function, linkage)?;
        let section = self.text_section();
        let func = Function::with_signature(name, signature);
        let id = self.functions.push(ModuleFunction {
            func,
            symbol,
            linkage,
            section,
            compiled: None,
            code_offset: 0,
        });
        self.sections[section].functions.push(id);
        Ok(id)
    }

    /// Declare a global data object in `section`.
    pub fn declare_global(
        &mut self,
        name: &str,
        linkage: Linkage,
        section: SectionId,
        size: u32,
        align: u32,
    ) -> ModuleResult<GlobalId> {
        let symbol = self.new_symbol(name, SymbolKind::Global, linkage)?;
        let align = align.max(1);
        let position = (self.sections[section].data_size + align - 1) & !(align - 1);
        self.sections[section].data_size = position + size;

        let id = self.globals.push(GlobalData {
            symbol,
            linkage,
            section,
            position,
            size,
            align,
            init: Vec::new(),
        });
        self.sections[section].globals.push(id);
        Ok(id)
    }

    /// Add an initialized byte region to a global.
    pub fn define_global_bytes(&mut self, global: GlobalId, offset: u32, bytes: Vec<u8>) {
        debug_assert!(
            offset + bytes.len() as u32 <= self.globals[global].size,
            "initializer overruns global `{}`",
            self.symbols[self.globals[global].symbol].name
        );
        self.globals[global].init.push(InitObject {
            offset,
            data: InitData::Bytes(bytes),
        });
    }

    /// Add an absolute pointer relocation inside a global.
    pub fn define_global_reloc(&mut self, global: GlobalId, offset: u32, target: SymbolId) {
        self.globals[global].init.push(InitObject {
            offset,
            data: InitData::Reloc(target),
        });
    }

    /// Compile a declared function and place its code in its section.
    pub fn define_function(&mut self, id: FuncId) -> ModuleResult<()> {
        if self.functions[id].compiled.is_some() {
            let name = self.symbols[self.functions[id].symbol].name.clone();
            return Err(ModuleError::DuplicateDefinition(name));
        }
        let ctx = Context::new(self.target);
        let compiled = ctx.compile(&self.functions[id].func)?;

        let section = self.functions[id].section;
        let offset = self.sections[section].code_size;
        self.sections[section].code_size = offset + compiled.bytes.len() as u32;

        log::debug!(
            "`{}`: {} bytes at {offset}, {} patches",
            self.symbols[self.functions[id].symbol].name,
            compiled.bytes.len(),
            compiled.patches.len()
        );

        let entry = &mut self.functions[id];
        entry.code_offset = offset;
        entry.compiled = Some(compiled);
        Ok(())
    }

    /// Compile every function that has not been defined yet.
    pub fn define_all_functions(&mut self) -> ModuleResult<()> {
        for id in self.functions.keys().collect::<Vec<_>>() {
            if self.functions[id].compiled.is_none() {
                self.define_function(id)?;
            }
        }
        Ok(())
    }
}
