//! Register allocation: live intervals and the linear-scan allocator.

mod interval;
mod linear_scan;
mod liveness;

pub use self::interval::{LiveInterval, LiveRange, UseKind, UsePos};
pub use self::linear_scan::run as allocate_registers;
pub use self::liveness::{build_intervals, MachineBlock};
