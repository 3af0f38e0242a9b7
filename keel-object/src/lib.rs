//! Object-file emission for Keel modules.
//!
//! A compiled [`Module`] becomes exactly one relocatable object: COFF for
//! Windows targets, ELF for Linux targets. Both writers share the same
//! skeleton (resolve same-section call patches in place, lay out section
//! raw data, assign symbol ids, then emit headers, relocations, the symbol
//! table, and the string table) and differ only in record formats.
//!
//! The whole object is assembled in memory and written with a single I/O
//! operation, so a failed write never leaves a partial file behind.

#![deny(missing_docs)]

mod coff;
mod elf;
mod layout;

use keel_codegen::System;
use keel_module::Module;
use std::path::Path;

/// Errors produced while emitting an object file.
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    /// Writing the finished byte stream failed.
    #[error("failed to write object file")]
    Io(#[from] std::io::Error),

    /// A patch referenced a symbol that names nothing emittable.
    #[error("relocation against unresolvable symbol `{0}`")]
    UnresolvableSymbol(String),
}

/// A convenient alias for a `Result` that uses `ObjectError` as the error
/// type.
pub type ObjectResult<T> = Result<T, ObjectError>;

/// Serialize `module` into the bytes of a relocatable object file for its
/// target.
pub fn write_object(module: &Module) -> ObjectResult<Vec<u8>> {
    match module.target().system() {
        System::Windows => coff::write(module),
        System::Linux => elf::write(module),
    }
}

/// Serialize `module` and write it to `path` in one operation.
pub fn write_object_file(module: &Module, path: impl AsRef<Path>) -> ObjectResult<()> {
    let bytes = write_object(module)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Little-endian append helpers shared by both writers.
pub(crate) mod put {
    pub fn u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    pub fn u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    pub fn u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    pub fn i64(buf: &mut Vec<u8>, v: i64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}
