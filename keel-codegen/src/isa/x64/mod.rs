//! The x86-64 back end: registers, ABI data, instruction selection, and
//! binary emission.

pub mod abi;
pub mod emit;
pub mod inst;
pub mod isel;
pub mod regs;
