//! Shared layout work: section raw data and patch resolution.

use keel_codegen::ir::SymbolId;
use keel_module::{FuncId, InitData, Module, SymbolKind};
use std::collections::HashMap;

/// One relocation request discovered during resolution: the 32-bit (or, for
/// data pointers, 64-bit) field at `address` within the section refers to
/// `target`.
#[derive(Clone, Copy, Debug)]
pub struct RelocRequest {
    /// Offset within the section's raw data.
    pub address: u32,
    /// The referenced symbol.
    pub target: SymbolId,
    /// True for absolute pointers inside data, false for pc-relative code
    /// references.
    pub absolute: bool,
}

/// A section with its raw bytes finalized and its relocations collected.
pub struct ResolvedSection {
    /// Raw section contents: code first, then global data.
    pub data: Vec<u8>,
    /// Relocations to emit, in encounter order.
    pub relocs: Vec<RelocRequest>,
}

/// Build the final raw data for every section and collect the relocations
/// that survive internal resolution.
///
/// Call patches whose target is a function in the same section are rewritten
/// in place as `rel32` displacements and dropped from the relocation list.
pub fn resolve_sections(module: &Module) -> Vec<ResolvedSection> {
    // Map function symbols back to their functions for internal resolution.
    let mut func_of_symbol: HashMap<SymbolId, FuncId> = HashMap::new();
    for (id, decl) in module.functions.iter() {
        func_of_symbol.insert(decl.symbol, id);
    }

    let mut out: Vec<ResolvedSection> = Vec::new();
    for (section_id, section) in module.sections.iter() {
        let mut data = vec![0u8; section.total_size() as usize];
        let mut relocs = Vec::new();

        // Code, at each function's assigned offset.
        for &fid in &section.functions {
            let decl = &module.functions[fid];
            let compiled = decl
                .compiled
                .as_ref()
                .unwrap_or_else(|| {
                    panic!(
                        "function `{}` was declared but never defined",
                        module.symbols[decl.symbol].name
                    )
                });
            let start = decl.code_offset as usize;
            data[start..start + compiled.bytes.len()].copy_from_slice(&compiled.bytes);
        }

        // Global initializers after the code.
        for &gid in &section.globals {
            let global = &module.globals[gid];
            let base = (section.code_size + global.position) as usize;
            for object in &global.init {
                match &object.data {
                    InitData::Bytes(bytes) => {
                        let at = base + object.offset as usize;
                        data[at..at + bytes.len()].copy_from_slice(bytes);
                    }
                    InitData::Reloc(target) => {
                        relocs.push(RelocRequest {
                            address: (base + object.offset as usize) as u32,
                            target: *target,
                            absolute: true,
                        });
                    }
                }
            }
        }

        // Patches: same-section calls resolve in place, the rest become
        // relocations.
        for &fid in &section.functions {
            let decl = &module.functions[fid];
            let compiled = decl.compiled.as_ref().unwrap();
            for patch in &compiled.patches {
                let address = decl.code_offset + patch.pos;
                let internal = func_of_symbol
                    .get(&patch.target)
                    .map(|&callee| module.functions[callee].section == section_id)
                    .unwrap_or(false);
                if internal {
                    let callee = func_of_symbol[&patch.target];
                    let target_offset = module.functions[callee].code_offset;
                    let rel = target_offset.wrapping_sub(address + 4) as i32;
                    data[address as usize..address as usize + 4]
                        .copy_from_slice(&rel.to_le_bytes());
                } else {
                    relocs.push(RelocRequest {
                        address,
                        target: patch.target,
                        absolute: false,
                    });
                }
            }
        }

        out.push(ResolvedSection { data, relocs });
    }
    out
}

/// Is the relocation target thread-local data? COFF translates such
/// references into `SECREL` relocations.
pub fn target_is_tls(module: &Module, target: SymbolId) -> bool {
    if module.symbols[target].kind != SymbolKind::Global {
        return false;
    }
    module
        .globals
        .iter()
        .find(|(_, g)| g.symbol == target)
        .map(|(_, g)| {
            module.sections[g.section]
                .flags
                .contains(keel_module::SectionFlags::TLS)
        })
        .unwrap_or(false)
}
