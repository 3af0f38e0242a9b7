//! Binary emission primitives: the code buffer, label fixups, and symbol
//! patches.

use crate::cfg::Block;
use crate::ir::SymbolId;
use keel_entity::SecondaryMap;

/// A pending reference to a module-level symbol inside a function's code.
///
/// The encoder records one patch per `rip`-relative symbol reference; the
/// object writers turn them into relocations, or resolve them in place when
/// caller and callee share a section.
#[derive(Clone, Copy, Debug)]
pub struct Patch {
    /// Byte offset of the 32-bit field inside the function's code.
    pub pos: u32,
    /// The referenced symbol.
    pub target: SymbolId,
    /// Resolved in place by the object writer; no relocation is emitted.
    pub internal: bool,
}

/// A growable little-endian code buffer with block labels and 32-bit
/// `rip`-relative fixups.
pub struct CodeBuffer {
    bytes: Vec<u8>,
    patches: Vec<Patch>,
    label_offsets: SecondaryMap<Block, u32>,
    fixups: Vec<(u32, Block)>,
}

/// Offset marker for an unbound label.
const UNBOUND: u32 = u32::MAX;

impl CodeBuffer {
    /// An empty code buffer.
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            patches: Vec::new(),
            label_offsets: SecondaryMap::with_default(UNBOUND),
            fixups: Vec::new(),
        }
    }

    /// Current length of the buffer in bytes.
    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Is the buffer still empty?
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Add one byte.
    pub fn put1(&mut self, v: u8) {
        self.bytes.push(v);
    }

    /// Add two little-endian bytes.
    pub fn put2(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Add four little-endian bytes.
    pub fn put4(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Add eight little-endian bytes.
    pub fn put8(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Overwrite the 32-bit field at `pos`.
    pub fn patch4(&mut self, pos: u32, v: u32) {
        self.bytes[pos as usize..pos as usize + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Bind `block`'s label to the current offset.
    pub fn bind_label(&mut self, block: Block) {
        debug_assert_eq!(self.label_offsets[block], UNBOUND, "label bound twice");
        self.label_offsets[block] = self.len();
    }

    /// Record that the 32-bit field at `pos` is `rip`-relative to `block`'s
    /// label, to be resolved by [`CodeBuffer::finish`].
    pub fn use_label_at(&mut self, pos: u32, block: Block) {
        self.fixups.push((pos, block));
    }

    /// Record a symbol patch covering the last four emitted bytes.
    pub fn add_patch(&mut self, target: SymbolId) {
        let pos = self.len() - 4;
        self.patches.push(Patch {
            pos,
            target,
            internal: false,
        });
    }

    /// Resolve all label fixups and return the final bytes and symbol
    /// patches.
    pub fn finish(mut self) -> (Vec<u8>, Vec<Patch>) {
        for &(pos, block) in &self.fixups {
            let target = self.label_offsets[block];
            assert_ne!(target, UNBOUND, "jump to an unbound label");
            let rel = target.wrapping_sub(pos + 4) as u32;
            self.bytes[pos as usize..pos as usize + 4].copy_from_slice(&rel.to_le_bytes());
        }
        (self.bytes, self.patches)
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_entity::EntityRef;

    #[test]
    fn label_fixups() {
        let b0 = Block::new(0);
        let mut buf = CodeBuffer::new();
        buf.bind_label(b0);
        buf.put1(0x90);
        // jmp b0
        buf.put1(0xe9);
        buf.put4(0);
        buf.use_label_at(2, b0);
        let (bytes, patches) = buf.finish();
        assert_eq!(bytes, vec![0x90, 0xe9, 0xfb, 0xff, 0xff, 0xff]);
        assert!(patches.is_empty());
    }
}
