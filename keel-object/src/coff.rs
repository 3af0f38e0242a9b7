//! COFF object writer for Windows x64.
//!
//! Besides the module's own sections, every section that contains functions
//! gets a trailing `.pdata`/`.xdata` pair describing the canonical frame
//! prologue (`push rbp; mov rbp, rsp; sub rsp, imm`) so the OS unwinder can
//! walk through the emitted code.

use crate::layout::{resolve_sections, target_is_tls};
use crate::{put, ObjectResult};
use keel_codegen::ir::SymbolId;
use keel_entity::SecondaryMap;
use keel_module::{Comdat, Module, SectionFlags, SymbolKind};

const FILE_HEADER_SIZE: u32 = 20;
const SECTION_HEADER_SIZE: u32 = 40;
const SYMBOL_SIZE: u32 = 18;
const RELOC_SIZE: u32 = 10;

const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_FILE_LINE_NUMS_STRIPPED: u16 = 0x0004;

const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
const IMAGE_SCN_LNK_COMDAT: u32 = 0x0000_1000;
const IMAGE_SCN_LNK_NRELOC_OVFL: u32 = 0x0100_0000;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

const IMAGE_SYM_CLASS_EXTERNAL: u8 = 2;
const IMAGE_SYM_CLASS_STATIC: u8 = 3;

const IMAGE_REL_AMD64_ADDR64: u16 = 0x0001;
const IMAGE_REL_AMD64_ADDR32NB: u16 = 0x0003;
const IMAGE_REL_AMD64_REL32: u16 = 0x0004;
const IMAGE_REL_AMD64_SECREL: u16 = 0x000b;

/// Fixed timestamp for reproducible objects.
const TIMESTAMP: u32 = 1_056_582_000;

const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;
const RBP: u8 = 5;

/// Per-function-section unwind data.
struct UnwindInfo {
    /// Index of the base section this belongs to.
    section: usize,
    /// `.pdata` contents: `{start, end, unwind_info}` per function.
    pdata: Vec<u8>,
    /// `.xdata` contents: the unwind descriptors.
    xdata: Vec<u8>,
    /// Relocations for `.pdata`.
    relocs: Vec<(u32, u32, u16)>,
    /// Section number of the `.pdata` header.
    pdata_number: u16,
    /// Symbol-table index of the `.xdata` section symbol.
    xdata_symbol: u32,
    // Layout, filled in while sizing the file.
    pdata_pos: u32,
    xdata_pos: u32,
    reloc_pos: u32,
}

/// Serialize `module` as a COFF relocatable object.
pub fn write(module: &Module) -> ObjectResult<Vec<u8>> {
    let resolved = resolve_sections(module);
    let base_count = module.sections.len();

    // Assign symbol ids: section symbols (with one aux each) first, then the
    // unwind section symbols, then functions, globals, and externals.
    let mut ids: SecondaryMap<SymbolId, u32> = SecondaryMap::with_default(0);
    let function_sections: Vec<usize> = module
        .sections
        .iter()
        .enumerate()
        .filter(|(_, (_, s))| !s.functions.is_empty())
        .map(|(i, _)| i)
        .collect();

    let mut next_id = (base_count as u32) * 2 + (function_sections.len() as u32) * 4;
    for (_, section) in module.sections.iter() {
        for &fid in &section.functions {
            ids[module.functions[fid].symbol] = next_id;
            next_id += 1;
        }
        for &gid in &section.globals {
            ids[module.globals[gid].symbol] = next_id;
            next_id += 1;
        }
    }
    for &ext in &module.externals {
        ids[ext] = next_id;
        next_id += 1;
    }
    let symbol_count = next_id;

    // Build unwind data for each section holding functions.
    let mut unwinds: Vec<UnwindInfo> = Vec::new();
    for (k, &si) in function_sections.iter().enumerate() {
        let section_id = module.sections.keys().nth(si).unwrap();
        let section = &module.sections[section_id];
        let pdata_number = (base_count + 2 * k + 1) as u16;
        let xdata_symbol = (base_count as u32) * 2 + (k as u32) * 4 + 2;

        let mut pdata = Vec::new();
        let mut xdata = Vec::new();
        let mut relocs = Vec::new();
        for (j, &fid) in section.functions.iter().enumerate() {
            let decl = &module.functions[fid];
            let compiled = decl.compiled.as_ref().expect("undefined function");
            let unwind_offset = xdata.len() as u32;
            emit_unwind_info(&mut xdata, compiled.prologue_len, compiled.stack_usage);

            let start = decl.code_offset;
            put::u32(&mut pdata, start);
            put::u32(&mut pdata, start + compiled.bytes.len() as u32);
            put::u32(&mut pdata, unwind_offset);

            let sym = ids[decl.symbol];
            let at = (j as u32) * 12;
            relocs.push((at, sym, IMAGE_REL_AMD64_ADDR32NB));
            relocs.push((at + 4, sym, IMAGE_REL_AMD64_ADDR32NB));
            relocs.push((at + 8, xdata_symbol, IMAGE_REL_AMD64_ADDR32NB));
        }

        unwinds.push(UnwindInfo {
            section: si,
            pdata,
            xdata,
            relocs,
            pdata_number,
            xdata_symbol,
            pdata_pos: 0,
            xdata_pos: 0,
            reloc_pos: 0,
        });
    }

    let total_sections = base_count + unwinds.len() * 2;

    // File layout: headers, raw data (with unwind blocks following their
    // section), relocation tables, symbol table, string table.
    let mut offset = FILE_HEADER_SIZE + SECTION_HEADER_SIZE * total_sections as u32;
    let mut raw_pos = vec![0u32; base_count];
    for (i, section) in module.sections.values().enumerate() {
        raw_pos[i] = offset;
        offset += section.total_size();
        if let Some(unwind) = unwinds.iter_mut().find(|u| u.section == i) {
            unwind.pdata_pos = offset;
            offset += unwind.pdata.len() as u32;
            unwind.xdata_pos = offset;
            offset += unwind.xdata.len() as u32;
            unwind.reloc_pos = offset;
            offset += unwind.relocs.len() as u32 * RELOC_SIZE;
        }
    }
    let mut reloc_pos = vec![0u32; base_count];
    for (i, resolved_section) in resolved.iter().enumerate() {
        if !resolved_section.relocs.is_empty() {
            reloc_pos[i] = offset;
            offset += resolved_section.relocs.len() as u32 * RELOC_SIZE;
        }
    }
    let symtab_pos = offset;
    offset += symbol_count * SYMBOL_SIZE;

    // String table for names longer than the 8-byte field.
    let mut strings: Vec<u8> = Vec::new();
    let mut string_offsets: SecondaryMap<SymbolId, u32> = SecondaryMap::with_default(0);
    for (sym, data) in module.symbols.iter() {
        if matches!(
            data.kind,
            SymbolKind::Function | SymbolKind::Global | SymbolKind::External
        ) && data.name.len() > 8
        {
            string_offsets[sym] = 4 + strings.len() as u32;
            strings.extend_from_slice(data.name.as_bytes());
            strings.push(0);
        }
    }

    let mut out = Vec::with_capacity(offset as usize + 4 + strings.len());

    // File header.
    put::u16(&mut out, IMAGE_FILE_MACHINE_AMD64);
    put::u16(&mut out, total_sections as u16);
    put::u32(&mut out, TIMESTAMP);
    put::u32(&mut out, symtab_pos);
    put::u32(&mut out, symbol_count);
    put::u16(&mut out, 0); // no optional header
    put::u16(&mut out, IMAGE_FILE_LINE_NUMS_STRIPPED);

    // Base section headers.
    for (i, section) in module.sections.values().enumerate() {
        let mut characteristics = IMAGE_SCN_MEM_READ;
        if section.flags.contains(SectionFlags::WRITE) {
            characteristics |= IMAGE_SCN_MEM_WRITE;
        }
        if section.flags.contains(SectionFlags::EXEC) {
            characteristics |= IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_CNT_CODE;
        } else {
            characteristics |= IMAGE_SCN_CNT_INITIALIZED_DATA;
        }
        if section.comdat != Comdat::None {
            characteristics |= IMAGE_SCN_LNK_COMDAT;
        }

        let nrelocs = resolved[i].relocs.len();
        if nrelocs >= 0xffff {
            characteristics |= IMAGE_SCN_LNK_NRELOC_OVFL;
        }

        write_section_header(
            &mut out,
            &section.name,
            section.total_size(),
            raw_pos[i],
            reloc_pos[i],
            nrelocs.min(0xffff) as u16,
            characteristics,
        );
    }

    // Unwind section headers follow the base ones.
    for unwind in &unwinds {
        let rodata = IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ;
        let nrelocs = unwind.relocs.len();
        write_section_header(
            &mut out,
            ".pdata",
            unwind.pdata.len() as u32,
            unwind.pdata_pos,
            unwind.reloc_pos,
            nrelocs.min(0xffff) as u16,
            rodata | if nrelocs >= 0xffff { IMAGE_SCN_LNK_NRELOC_OVFL } else { 0 },
        );
        write_section_header(
            &mut out,
            ".xdata",
            unwind.xdata.len() as u32,
            unwind.xdata_pos,
            0,
            0,
            rodata,
        );
    }

    // Raw data, with unwind blocks interleaved after their section.
    for (i, resolved_section) in resolved.iter().enumerate() {
        debug_assert_eq!(out.len() as u32, raw_pos[i]);
        out.extend_from_slice(&resolved_section.data);
        if let Some(unwind) = unwinds.iter().find(|u| u.section == i) {
            out.extend_from_slice(&unwind.pdata);
            out.extend_from_slice(&unwind.xdata);
            for &(addr, sym, ty) in &unwind.relocs {
                put::u32(&mut out, addr);
                put::u32(&mut out, sym);
                put::u16(&mut out, ty);
            }
        }
    }

    // Relocation tables for the base sections.
    for (i, resolved_section) in resolved.iter().enumerate() {
        if resolved_section.relocs.is_empty() {
            continue;
        }
        debug_assert_eq!(out.len() as u32, reloc_pos[i]);
        for reloc in &resolved_section.relocs {
            let id = ids[reloc.target];
            assert!(id != 0, "relocation against unnumbered symbol");
            let ty = if reloc.absolute {
                IMAGE_REL_AMD64_ADDR64
            } else if target_is_tls(module, reloc.target) {
                IMAGE_REL_AMD64_SECREL
            } else {
                IMAGE_REL_AMD64_REL32
            };
            put::u32(&mut out, reloc.address);
            put::u32(&mut out, id);
            put::u16(&mut out, ty);
        }
    }

    // Symbol table.
    debug_assert_eq!(out.len() as u32, symtab_pos);
    for (i, section) in module.sections.values().enumerate() {
        write_short_symbol(
            &mut out,
            &section.name,
            0,
            (i + 1) as i16,
            IMAGE_SYM_CLASS_STATIC,
            1,
        );
        // Auxiliary section record.
        put::u32(&mut out, section.total_size());
        put::u16(&mut out, resolved[i].relocs.len().min(0xffff) as u16);
        put::u16(&mut out, 0); // line numbers
        put::u32(&mut out, 0); // checksum
        put::u16(&mut out, (i + 1) as u16);
        out.push(if section.comdat != Comdat::None { 2 } else { 0 });
        out.extend_from_slice(&[0; 3]);
    }
    for unwind in &unwinds {
        for (name, number, len, nrelocs) in [
            (
                ".pdata",
                unwind.pdata_number,
                unwind.pdata.len() as u32,
                unwind.relocs.len() as u16,
            ),
            (
                ".xdata",
                unwind.pdata_number + 1,
                unwind.xdata.len() as u32,
                0u16,
            ),
        ] {
            write_short_symbol(&mut out, name, 0, number as i16, IMAGE_SYM_CLASS_STATIC, 1);
            put::u32(&mut out, len);
            put::u16(&mut out, nrelocs);
            put::u16(&mut out, 0);
            put::u32(&mut out, 0);
            put::u16(&mut out, number);
            out.push(0);
            out.extend_from_slice(&[0; 3]);
        }
    }
    for (i, section) in module.sections.values().enumerate() {
        let number = (i + 1) as i16;
        for &fid in &section.functions {
            let decl = &module.functions[fid];
            let class = if decl.linkage.is_public() {
                IMAGE_SYM_CLASS_EXTERNAL
            } else {
                IMAGE_SYM_CLASS_STATIC
            };
            write_symbol(
                &mut out,
                module,
                &string_offsets,
                decl.symbol,
                decl.code_offset,
                number,
                class,
            );
        }
        for &gid in &section.globals {
            let global = &module.globals[gid];
            let class = if global.linkage.is_public() {
                IMAGE_SYM_CLASS_EXTERNAL
            } else {
                IMAGE_SYM_CLASS_STATIC
            };
            write_symbol(
                &mut out,
                module,
                &string_offsets,
                global.symbol,
                section.code_size + global.position,
                number,
                class,
            );
        }
    }
    for &ext in &module.externals {
        write_symbol(
            &mut out,
            module,
            &string_offsets,
            ext,
            0,
            0,
            IMAGE_SYM_CLASS_EXTERNAL,
        );
    }

    // String table, prefixed with its own length.
    put::u32(&mut out, 4 + strings.len() as u32);
    out.extend_from_slice(&strings);

    log::info!(
        "coff object: {} sections, {} symbols, {} bytes",
        total_sections,
        symbol_count,
        out.len()
    );
    Ok(out)
}

fn write_section_header(
    out: &mut Vec<u8>,
    name: &str,
    size: u32,
    raw_pos: u32,
    reloc_ptr: u32,
    nrelocs: u16,
    characteristics: u32,
) {
    let mut name_bytes = [0u8; 8];
    let n = name.len().min(8);
    name_bytes[..n].copy_from_slice(&name.as_bytes()[..n]);
    out.extend_from_slice(&name_bytes);
    put::u32(out, 0); // virtual size
    put::u32(out, 0); // virtual address
    put::u32(out, size);
    put::u32(out, raw_pos);
    put::u32(out, reloc_ptr);
    put::u32(out, 0); // line numbers
    put::u16(out, nrelocs);
    put::u16(out, 0);
    put::u32(out, characteristics);
}

fn write_short_symbol(
    out: &mut Vec<u8>,
    name: &str,
    value: u32,
    section_number: i16,
    class: u8,
    aux: u8,
) {
    let mut name_bytes = [0u8; 8];
    let n = name.len().min(8);
    name_bytes[..n].copy_from_slice(&name.as_bytes()[..n]);
    out.extend_from_slice(&name_bytes);
    put::u32(out, value);
    put::u16(out, section_number as u16);
    put::u16(out, 0); // type
    out.push(class);
    out.push(aux);
}

fn write_symbol(
    out: &mut Vec<u8>,
    module: &Module,
    string_offsets: &SecondaryMap<SymbolId, u32>,
    sym: SymbolId,
    value: u32,
    section_number: i16,
    class: u8,
) {
    let name = &module.symbols[sym].name;
    if name.len() > 8 {
        put::u32(out, 0);
        put::u32(out, string_offsets[sym]);
    } else {
        let mut name_bytes = [0u8; 8];
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());
        out.extend_from_slice(&name_bytes);
    }
    put::u32(out, value);
    put::u16(out, section_number as u16);
    put::u16(out, 0);
    out.push(class);
    out.push(0);
}

/// Emit one Windows x64 unwind descriptor for the canonical prologue and
/// return nothing; the caller records the offset before calling.
fn emit_unwind_info(xdata: &mut Vec<u8>, prologue_len: u8, stack_usage: u32) {
    // Unwind codes in reverse chronological order: the allocation, the
    // frame-pointer establishment, the push.
    let mut codes: Vec<[u8; 2]> = Vec::new();
    if stack_usage > 0 {
        if stack_usage <= 128 {
            codes.push([
                prologue_len,
                UWOP_ALLOC_SMALL | ((((stack_usage / 8) as u8) - 1) << 4),
            ]);
        } else {
            codes.push([prologue_len, UWOP_ALLOC_LARGE]);
            let slots = (stack_usage / 8) as u16;
            codes.push(slots.to_le_bytes());
        }
    }
    codes.push([4, UWOP_SET_FPREG]);
    codes.push([1, UWOP_PUSH_NONVOL | (RBP << 4)]);

    xdata.push(1); // version 1, no handler flags
    xdata.push(prologue_len);
    xdata.push(codes.len() as u8);
    xdata.push(RBP); // frame register rbp, frame offset 0

    for code in &codes {
        xdata.extend_from_slice(code);
    }
    // Descriptors are 4-byte aligned; an odd slot count needs a pad entry.
    if codes.len() % 2 == 1 {
        xdata.extend_from_slice(&[0, 0]);
    }
}
