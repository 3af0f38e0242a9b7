//! The per-function compilation context.

use crate::binemit::Patch;
use crate::cfg::ControlFlowGraph;
use crate::domtree::DominatorTree;
use crate::ir::Function;
use crate::isa::{x64, Arch, Target};
use crate::regalloc;
use crate::schedule::Schedule;
use crate::CodegenResult;

/// The result of compiling one function: raw code bytes plus the metadata
/// the module layer and the object writers need.
#[derive(Clone, Debug)]
pub struct CompiledCode {
    /// The encoded machine code, nop-padded to a multiple of 16 bytes.
    pub bytes: Vec<u8>,
    /// Symbol patches, in encounter order.
    pub patches: Vec<Patch>,
    /// Length of the prologue in bytes, for unwind descriptors.
    pub prologue_len: u8,
    /// Final frame size in bytes (locals + spills + outgoing arguments,
    /// 16-byte aligned).
    pub stack_usage: u32,
}

/// Persistent data structures for compiling functions.
///
/// The context holds no state between functions beyond the target; it exists
/// so the pipeline has one obvious entry point and a place to grow reusable
/// scratch allocations later.
pub struct Context {
    target: Target,
}

impl Context {
    /// A compilation context for `target`.
    pub fn new(target: Target) -> Self {
        Self { target }
    }

    /// The target this context compiles for.
    pub fn target(&self) -> Target {
        self.target
    }

    /// Run the full back-end pipeline on `func`: control-flow recovery,
    /// dominators, late scheduling, instruction selection, liveness, linear
    /// scan register allocation, and binary emission.
    pub fn compile(&self, func: &Function) -> CodegenResult<CompiledCode> {
        log::debug!("compiling `{}`", func.name);
        let Arch::X64 = self.target.arch();

        let cfg = ControlFlowGraph::compute(func);
        let domtree = DominatorTree::compute(&cfg);
        let schedule = Schedule::compute(func, &cfg, &domtree);

        let mut vcode = x64::isel::select(func, &cfg, &schedule, self.target)?;
        let blocks = regalloc::build_intervals(&mut vcode, &cfg);
        regalloc::allocate_registers(&mut vcode, &blocks, &cfg, self.target.abi());

        Ok(x64::emit::emit(&func.name, &mut vcode, self.target.abi()))
    }
}
