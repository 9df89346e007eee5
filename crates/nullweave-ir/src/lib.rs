//! nullweave-ir — the compiled-unit binary format.
//!
//! A unit (`.nwu` file) holds a string pool and a set of routines whose
//! bodies are stack-machine bytecode. This crate provides:
//! - The container model and codec ([`Unit`], [`Routine`], [`StringPool`])
//! - Signature descriptors ([`Signature`])
//! - The instruction set with label-based body decoding ([`Instr`],
//!   [`decode_body`])
//! - The assembler, which re-encodes instruction lists and recomputes
//!   operand-stack metadata ([`assemble`])
//! - A text disassembler ([`disasm`])
//!
//! The rewrite engine lives in `nullweave-engine`; this crate knows nothing
//! about markers beyond the [`MARKER_SYMBOL`]/[`MARKER_DESCRIPTOR`] contract
//! shared by the engine and the reference evaluator.

mod codec;

pub mod asm;
pub mod disasm;
pub mod instr;
pub mod unit;

pub use asm::{assemble, AsmError, AssembledBody};
pub use codec::FormatError;
pub use instr::{decode_body, op, Body, Instr, LabelId};
pub use unit::{
    Routine, Signature, StrId, StringPool, TypeCode, Unit, MAGIC, MARKER_DESCRIPTOR,
    MARKER_SYMBOL, VERSION_LEGACY, VERSION_MODERN,
};
