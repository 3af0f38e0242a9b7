//! A frontend for building Keel IR from other languages.
//!
//! Front ends construct IR exclusively through [`FunctionBuilder`]. The
//! builder tracks the insert point (the active control node new effectful
//! nodes attach to) and maintains the memory chain: every store, volatile
//! access, and call consumes the current memory state of its region and
//! produces the next one, with `phi(memory)` nodes materializing the state
//! at control joins.

#![deny(missing_docs)]

mod frontend;

pub use crate::frontend::FunctionBuilder;
