//! ELF64 relocatable object writer for Linux x64.

use crate::layout::resolve_sections;
use crate::{put, ObjectResult};
use keel_codegen::ir::SymbolId;
use keel_entity::SecondaryMap;
use keel_module::{Module, SectionFlags, SymbolKind};

const EHDR_SIZE: u64 = 64;
const SHDR_SIZE: u64 = 64;
const SYM_SIZE: u64 = 24;
const RELA_SIZE: u64 = 24;

const ET_REL: u16 = 1;
const EM_X86_64: u16 = 62;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;

const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;
const SHF_INFO_LINK: u64 = 0x40;

const STB_LOCAL: u8 = 0;
const STB_GLOBAL: u8 = 1;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;
const STT_SECTION: u8 = 3;

const R_X86_64_64: u32 = 1;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_PLT32: u32 = 4;

fn st_info(bind: u8, ty: u8) -> u8 {
    (bind << 4) | (ty & 0xf)
}

fn r_info(sym: u32, ty: u32) -> u64 {
    (u64::from(sym) << 32) | u64::from(ty)
}

struct SymbolRecord {
    name: u32,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

/// Serialize `module` as an ELF64 relocatable object.
pub fn write(module: &Module) -> ObjectResult<Vec<u8>> {
    let resolved = resolve_sections(module);
    let base_count = module.sections.len();

    // String table; index 0 is the empty string.
    let mut strtab: Vec<u8> = vec![0];
    let intern = |strtab: &mut Vec<u8>, s: &str| -> u32 {
        let pos = strtab.len() as u32;
        strtab.extend_from_slice(s.as_bytes());
        strtab.push(0);
        pos
    };

    // Section names. For a section with relocations, ".rela" is placed
    // immediately ahead of the name so the rela section can reuse the same
    // bytes at `name_pos - 5`.
    let mut section_names = vec![0u32; base_count];
    for (i, section) in module.sections.values().enumerate() {
        if !resolved[i].relocs.is_empty() {
            strtab.extend_from_slice(b".rela");
        }
        section_names[i] = intern(&mut strtab, &section.name);
    }

    // Symbols: the null symbol and section symbols first, then local
    // definitions, then global definitions and externals. The object id of
    // a module symbol is its index in this combined table.
    let mut ids: SecondaryMap<SymbolId, u32> = SecondaryMap::with_default(0);
    let mut records: Vec<SymbolRecord> = Vec::new();
    records.push(SymbolRecord {
        name: 0,
        info: 0,
        shndx: 0,
        value: 0,
        size: 0,
    });
    for (i, _) in module.sections.values().enumerate() {
        records.push(SymbolRecord {
            name: section_names[i],
            info: st_info(STB_LOCAL, STT_SECTION),
            shndx: (3 + i) as u16,
            value: 0,
            size: 0,
        });
    }

    let push_defined = |module: &Module,
                            strtab: &mut Vec<u8>,
                            records: &mut Vec<SymbolRecord>,
                            ids: &mut SecondaryMap<SymbolId, u32>,
                            bind: u8,
                            public: bool| {
        for (i, section) in module.sections.values().enumerate() {
            for &fid in &section.functions {
                let decl = &module.functions[fid];
                if decl.linkage.is_public() != public {
                    continue;
                }
                let compiled = decl.compiled.as_ref().expect("undefined function");
                let name = {
                    let pos = strtab.len() as u32;
                    strtab.extend_from_slice(module.symbols[decl.symbol].name.as_bytes());
                    strtab.push(0);
                    pos
                };
                ids[decl.symbol] = records.len() as u32;
                records.push(SymbolRecord {
                    name,
                    info: st_info(bind, STT_FUNC),
                    shndx: (3 + i) as u16,
                    value: u64::from(decl.code_offset),
                    size: compiled.bytes.len() as u64,
                });
            }
            for &gid in &section.globals {
                let global = &module.globals[gid];
                if global.linkage.is_public() != public {
                    continue;
                }
                let name = {
                    let pos = strtab.len() as u32;
                    strtab.extend_from_slice(module.symbols[global.symbol].name.as_bytes());
                    strtab.push(0);
                    pos
                };
                ids[global.symbol] = records.len() as u32;
                records.push(SymbolRecord {
                    name,
                    info: st_info(bind, STT_OBJECT),
                    shndx: (3 + i) as u16,
                    value: u64::from(section.code_size + global.position),
                    size: u64::from(global.size),
                });
            }
        }
    };

    push_defined(module, &mut strtab, &mut records, &mut ids, STB_LOCAL, false);
    let local_count = records.len() as u32;
    push_defined(module, &mut strtab, &mut records, &mut ids, STB_GLOBAL, true);
    for &ext in &module.externals {
        let name = intern(&mut strtab, &module.symbols[ext].name);
        ids[ext] = records.len() as u32;
        records.push(SymbolRecord {
            name,
            info: st_info(STB_GLOBAL, 0),
            shndx: 0,
            value: 0,
            size: 0,
        });
    }

    let symtab_name = intern(&mut strtab, ".symtab");
    let strtab_name = intern(&mut strtab, ".strtab");

    // Layout: header, raw data, rela arrays, strtab, symtab, headers.
    let rela_sections: Vec<usize> = resolved
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.relocs.is_empty())
        .map(|(i, _)| i)
        .collect();
    let section_count = 2 + base_count + rela_sections.len();

    let mut offset = EHDR_SIZE;
    let mut raw_pos = vec![0u64; base_count];
    for (i, s) in resolved.iter().enumerate() {
        raw_pos[i] = offset;
        offset += s.data.len() as u64;
    }
    let mut rela_pos = vec![0u64; base_count];
    for &i in &rela_sections {
        rela_pos[i] = offset;
        offset += resolved[i].relocs.len() as u64 * RELA_SIZE;
    }
    let strtab_pos = offset;
    offset += strtab.len() as u64;
    let symtab_pos = offset;
    offset += records.len() as u64 * SYM_SIZE;
    let shoff = offset;

    let mut out = Vec::with_capacity((shoff + (1 + section_count as u64) * SHDR_SIZE) as usize);

    // ELF header.
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    put::u16(&mut out, ET_REL);
    put::u16(&mut out, EM_X86_64);
    put::u32(&mut out, 1); // version
    put::u64(&mut out, 0); // entry
    put::u64(&mut out, 0); // phoff
    put::u64(&mut out, shoff);
    put::u32(&mut out, 0); // flags
    put::u16(&mut out, EHDR_SIZE as u16);
    put::u16(&mut out, 0); // phentsize
    put::u16(&mut out, 0); // phnum
    put::u16(&mut out, SHDR_SIZE as u16);
    put::u16(&mut out, (1 + section_count) as u16);
    put::u16(&mut out, 1); // shstrndx: .strtab

    // Section contents.
    for (i, s) in resolved.iter().enumerate() {
        debug_assert_eq!(out.len() as u64, raw_pos[i]);
        out.extend_from_slice(&s.data);
    }

    // Relocation arrays. Calls and code references are pc-relative with the
    // standard -4 addend; data pointers are absolute.
    for &i in &rela_sections {
        debug_assert_eq!(out.len() as u64, rela_pos[i]);
        for reloc in &resolved[i].relocs {
            let sym = ids[reloc.target];
            assert!(sym != 0, "relocation against unnumbered symbol");
            let (ty, addend) = if reloc.absolute {
                (R_X86_64_64, 0i64)
            } else if module.symbols[reloc.target].kind == SymbolKind::Global {
                (R_X86_64_PC32, -4)
            } else {
                (R_X86_64_PLT32, -4)
            };
            put::u64(&mut out, u64::from(reloc.address));
            put::u64(&mut out, r_info(sym, ty));
            put::i64(&mut out, addend);
        }
    }

    debug_assert_eq!(out.len() as u64, strtab_pos);
    out.extend_from_slice(&strtab);

    debug_assert_eq!(out.len() as u64, symtab_pos);
    for record in &records {
        put::u32(&mut out, record.name);
        out.push(record.info);
        out.push(0); // st_other
        put::u16(&mut out, record.shndx);
        put::u64(&mut out, record.value);
        put::u64(&mut out, record.size);
    }

    // Section header table: null, .strtab, .symtab, the module sections,
    // then one .rela per relocated section.
    debug_assert_eq!(out.len() as u64, shoff);
    out.extend_from_slice(&[0u8; SHDR_SIZE as usize]);

    write_shdr(
        &mut out,
        strtab_name,
        SHT_STRTAB,
        0,
        strtab_pos,
        strtab.len() as u64,
        0,
        0,
        1,
        0,
    );
    write_shdr(
        &mut out,
        symtab_name,
        SHT_SYMTAB,
        0,
        symtab_pos,
        records.len() as u64 * SYM_SIZE,
        1, // the string table
        local_count,
        8,
        SYM_SIZE,
    );

    for (i, section) in module.sections.values().enumerate() {
        let mut flags = SHF_ALLOC;
        if section.flags.contains(SectionFlags::WRITE) {
            flags |= SHF_WRITE;
        }
        if section.flags.contains(SectionFlags::EXEC) {
            flags |= SHF_EXECINSTR;
        }
        write_shdr(
            &mut out,
            section_names[i],
            SHT_PROGBITS,
            flags,
            raw_pos[i],
            resolved[i].data.len() as u64,
            0,
            0,
            16,
            0,
        );
    }

    for &i in &rela_sections {
        write_shdr(
            &mut out,
            section_names[i] - 5,
            SHT_RELA,
            SHF_INFO_LINK,
            rela_pos[i],
            resolved[i].relocs.len() as u64 * RELA_SIZE,
            2, // the symbol table
            (3 + i) as u32,
            8,
            RELA_SIZE,
        );
    }

    log::info!(
        "elf object: {} sections, {} symbols, {} bytes",
        1 + section_count,
        records.len(),
        out.len()
    );
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn write_shdr(
    out: &mut Vec<u8>,
    name: u32,
    ty: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
) {
    put::u32(out, name);
    put::u32(out, ty);
    put::u64(out, flags);
    put::u64(out, 0); // addr
    put::u64(out, offset);
    put::u64(out, size);
    put::u32(out, link);
    put::u32(out, info);
    put::u64(out, addralign);
    put::u64(out, entsize);
}
