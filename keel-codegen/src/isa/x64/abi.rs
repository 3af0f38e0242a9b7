//! Calling-convention parameter descriptors.

use super::regs::gpr;
use crate::isa::Abi;

/// How a calling convention passes arguments and which registers it
/// clobbers.
#[derive(Clone, Copy, Debug)]
pub struct ParamDescriptor {
    /// Integer argument registers, in order.
    pub gpr_params: &'static [u8],
    /// Number of XMM argument registers (always starting at xmm0).
    pub xmm_param_count: u8,
    /// Bit mask of caller-saved general purpose registers.
    pub caller_saved_gprs: u16,
    /// Bit mask of caller-saved SSE registers.
    pub caller_saved_xmms: u16,
    /// Bytes of shadow space the caller must reserve below its arguments.
    pub shadow_space: u32,
}

const WIN64_GPR_PARAMS: [u8; 4] = [gpr::RCX, gpr::RDX, gpr::R8, gpr::R9];
const SYSV_GPR_PARAMS: [u8; 6] = [gpr::RDI, gpr::RSI, gpr::RDX, gpr::RCX, gpr::R8, gpr::R9];

const fn mask(regs: &[u8]) -> u16 {
    let mut m = 0u16;
    let mut i = 0;
    while i < regs.len() {
        m |= 1 << regs[i];
        i += 1;
    }
    m
}

/// The parameter descriptor for `abi`.
pub fn param_descriptor(abi: Abi) -> ParamDescriptor {
    match abi {
        Abi::Win64 => ParamDescriptor {
            gpr_params: &WIN64_GPR_PARAMS,
            xmm_param_count: 4,
            caller_saved_gprs: mask(&[
                gpr::RAX,
                gpr::RCX,
                gpr::RDX,
                gpr::R8,
                gpr::R9,
                gpr::R10,
                gpr::R11,
            ]),
            // xmm0-xmm5 are volatile on Windows.
            caller_saved_xmms: 0x003f,
            shadow_space: 32,
        },
        Abi::SystemV => ParamDescriptor {
            gpr_params: &SYSV_GPR_PARAMS,
            xmm_param_count: 8,
            caller_saved_gprs: mask(&[
                gpr::RAX,
                gpr::RDI,
                gpr::RSI,
                gpr::RCX,
                gpr::RDX,
                gpr::R8,
                gpr::R9,
                gpr::R10,
                gpr::R11,
            ]),
            // Every SSE register is volatile in the System V ABI.
            caller_saved_xmms: 0xffff,
            shadow_space: 0,
        },
    }
}

/// The integer return registers shared by both conventions.
pub const RETURN_GPRS: [u8; 2] = [gpr::RAX, gpr::RDX];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn win64() {
        let d = param_descriptor(Abi::Win64);
        assert_eq!(d.gpr_params, &[gpr::RCX, gpr::RDX, gpr::R8, gpr::R9]);
        assert_eq!(d.shadow_space, 32);
        assert_eq!(d.caller_saved_gprs & (1 << gpr::RBX), 0);
        assert_ne!(d.caller_saved_gprs & (1 << gpr::R11), 0);
    }

    #[test]
    fn sysv() {
        let d = param_descriptor(Abi::SystemV);
        assert_eq!(d.gpr_params.len(), 6);
        assert_eq!(d.xmm_param_count, 8);
        assert_eq!(d.shadow_space, 0);
        assert_eq!(d.caller_saved_xmms, 0xffff);
    }
}
