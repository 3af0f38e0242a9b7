//! Target description and instruction set architectures.
//!
//! A [`Target`] names the (architecture, operating system, ABI) triple the
//! back end compiles for. Only x86-64 is implemented; the enum seams are
//! where another back end would slot in.

pub mod x64;

use crate::{CodegenError, CodegenResult};
use target_lexicon::{Architecture, OperatingSystem, Triple};

/// A supported CPU architecture.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Arch {
    /// x86-64.
    X64,
}

/// A supported operating system.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum System {
    /// Windows, producing COFF objects.
    Windows,
    /// Linux, producing ELF objects.
    Linux,
}

/// A calling convention, derived from the system.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Abi {
    /// The Windows x64 convention.
    Win64,
    /// The System V AMD64 convention.
    SystemV,
}

/// The target execution platform: architecture × system × ABI.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Target {
    arch: Arch,
    system: System,
}

impl Target {
    /// Create a target for a known (architecture, system) pair.
    pub fn new(arch: Arch, system: System) -> Self {
        Self { arch, system }
    }

    /// Create a target from a `target-lexicon` triple.
    ///
    /// Fails with [`CodegenError::Unsupported`] for any (architecture,
    /// operating system) pair without a back end.
    pub fn for_triple(triple: &Triple) -> CodegenResult<Self> {
        let arch = match triple.architecture {
            Architecture::X86_64 => Arch::X64,
            other => return Err(CodegenError::Unsupported(format!("architecture {other}"))),
        };
        let system = match triple.operating_system {
            OperatingSystem::Windows => System::Windows,
            OperatingSystem::Linux => System::Linux,
            other => {
                return Err(CodegenError::Unsupported(format!("operating system {other}")))
            }
        };
        Ok(Self::new(arch, system))
    }

    /// The target architecture.
    pub fn arch(self) -> Arch {
        self.arch
    }

    /// The target operating system.
    pub fn system(self) -> System {
        self.system
    }

    /// The calling convention implied by the system.
    pub fn abi(self) -> Abi {
        match self.system {
            System::Windows => Abi::Win64,
            System::Linux => Abi::SystemV,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::str::FromStr;

    #[test]
    fn triples() {
        let t = Target::for_triple(&Triple::from_str("x86_64-unknown-linux-gnu").unwrap())
            .unwrap();
        assert_eq!(t.abi(), Abi::SystemV);

        let t = Target::for_triple(&Triple::from_str("x86_64-pc-windows-msvc").unwrap()).unwrap();
        assert_eq!(t.abi(), Abi::Win64);

        assert!(Target::for_triple(&Triple::from_str("aarch64-unknown-linux-gnu").unwrap())
            .is_err());
    }
}
