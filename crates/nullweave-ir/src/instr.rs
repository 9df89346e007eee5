//! Instruction set and body decoding.
//!
//! Encoded bodies address branch targets by absolute byte offset. Decoding
//! lifts a body to an instruction list in which every distinct branch target
//! becomes a [`Instr::Label`] pseudo-instruction and branches refer to label
//! ids; the assembler resolves labels back to offsets on encode. Working on
//! labels keeps rewrites position-independent: inserting a guard sequence
//! never invalidates another instruction's target.

use std::collections::BTreeSet;

use crate::codec::{FormatError, Reader};
use crate::unit::{Signature, StrId, StringPool};

/// Opcode bytes of the encoded form.
pub mod op {
    pub const CONST_NULL: u8 = 0x01;
    pub const CONST_INT: u8 = 0x02;
    pub const NEW: u8 = 0x03;
    pub const GET_STATIC: u8 = 0x04;
    pub const LOAD_SLOT: u8 = 0x05;
    pub const STORE_SLOT: u8 = 0x06;
    pub const DUP: u8 = 0x07;
    pub const POP: u8 = 0x08;
    pub const GET_FIELD: u8 = 0x09;
    pub const CHECK_CAST: u8 = 0x0a;
    pub const NEG: u8 = 0x0b;
    pub const ADD: u8 = 0x0c;
    pub const ARRAY_GET: u8 = 0x0d;
    pub const PUT_FIELD: u8 = 0x0e;
    pub const CALL: u8 = 0x0f;
    pub const NEW_MULTI: u8 = 0x10;
    pub const JUMP: u8 = 0x11;
    pub const JUMP_IF_NULL: u8 = 0x12;
    pub const RET: u8 = 0x13;
    pub const RET_VOID: u8 = 0x14;
}

/// Branch target in a decoded body. Dense per routine, assigned in target
/// offset order by [`decode_body`]; rewrites allocate further ids upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

/// One decoded instruction. `Label` marks a branch target and occupies no
/// bytes in the encoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    Label(LabelId),
    ConstNull,
    ConstInt(i64),
    New(StrId),
    GetStatic { field: StrId, is_ref: bool },
    LoadSlot(u32),
    StoreSlot(u32),
    Dup,
    Pop,
    GetField(StrId),
    CheckCast(StrId),
    Neg,
    Add,
    ArrayGet,
    PutField(StrId),
    Call { symbol: StrId, descriptor: StrId },
    NewMulti { ty: StrId, dims: u8 },
    Jump(LabelId),
    JumpIfNull(LabelId),
    Ret,
    RetVoid,
}

impl Instr {
    /// Operand-stack values consumed and produced, in that order. Call
    /// effects come from the callee descriptor, so a pool is required.
    pub fn stack_effect(&self, pool: &StringPool) -> Result<(u32, u32), FormatError> {
        Ok(match *self {
            Instr::Label(_) | Instr::RetVoid => (0, 0),
            Instr::ConstNull
            | Instr::ConstInt(_)
            | Instr::New(_)
            | Instr::GetStatic { .. }
            | Instr::LoadSlot(_) => (0, 1),
            Instr::StoreSlot(_) | Instr::Pop | Instr::JumpIfNull(_) | Instr::Ret => (1, 0),
            Instr::Dup => (1, 2),
            Instr::GetField(_) | Instr::CheckCast(_) | Instr::Neg => (1, 1),
            Instr::Add | Instr::ArrayGet => (2, 1),
            Instr::PutField(_) => (2, 0),
            Instr::Jump(_) => (0, 0),
            Instr::NewMulti { dims, .. } => (u32::from(dims), 1),
            Instr::Call { descriptor, .. } => {
                let desc = pool
                    .get(descriptor)
                    .ok_or(FormatError::BadStringIndex(descriptor.0))?;
                let sig = Signature::parse(desc)?;
                let pushes = if sig.ret == crate::unit::TypeCode::Void {
                    0
                } else {
                    1
                };
                (sig.param_count() as u32, pushes)
            }
        })
    }

    /// Whether execution can continue at the next instruction.
    pub fn falls_through(&self) -> bool {
        !matches!(self, Instr::Jump(_) | Instr::Ret | Instr::RetVoid)
    }

    /// The branch target, for control transfers that have one.
    pub fn branch_target(&self) -> Option<LabelId> {
        match *self {
            Instr::Jump(label) | Instr::JumpIfNull(label) => Some(label),
            _ => None,
        }
    }
}

/// A decoded routine body: the instruction list (with label pseudo-entries)
/// and the number of labels handed out, so rewrites can allocate fresh ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub instrs: Vec<Instr>,
    pub label_count: u32,
}

impl Body {
    pub fn fresh_label(&mut self) -> LabelId {
        let id = LabelId(self.label_count);
        self.label_count += 1;
        id
    }
}

/// Decode an encoded body into a [`Body`].
///
/// Runs two passes: first the raw opcode walk collecting instruction start
/// offsets and branch targets, then label assignment. A branch to an offset
/// that is not an instruction start (or past the end) is malformed.
pub fn decode_body(bytes: &[u8]) -> Result<Body, FormatError> {
    struct Raw {
        offset: u32,
        instr: Instr,
        // Branch operand still as a byte offset; rewritten in pass two.
        target: Option<u32>,
    }

    let mut r = Reader::new(bytes);
    let mut raw = Vec::new();
    let mut targets = BTreeSet::new();
    while !r.is_empty() {
        let offset = r.offset() as u32;
        let opcode = r.read_u8()?;
        let mut target = None;
        let instr = match opcode {
            op::CONST_NULL => Instr::ConstNull,
            op::CONST_INT => Instr::ConstInt(r.read_sleb()?),
            op::NEW => Instr::New(StrId(r.read_uleb_u32()?)),
            op::GET_STATIC => {
                let field = StrId(r.read_uleb_u32()?);
                let is_ref = r.read_u8()? != 0;
                Instr::GetStatic { field, is_ref }
            }
            op::LOAD_SLOT => Instr::LoadSlot(r.read_uleb_u32()?),
            op::STORE_SLOT => Instr::StoreSlot(r.read_uleb_u32()?),
            op::DUP => Instr::Dup,
            op::POP => Instr::Pop,
            op::GET_FIELD => Instr::GetField(StrId(r.read_uleb_u32()?)),
            op::CHECK_CAST => Instr::CheckCast(StrId(r.read_uleb_u32()?)),
            op::NEG => Instr::Neg,
            op::ADD => Instr::Add,
            op::ARRAY_GET => Instr::ArrayGet,
            op::PUT_FIELD => Instr::PutField(StrId(r.read_uleb_u32()?)),
            op::CALL => {
                let symbol = StrId(r.read_uleb_u32()?);
                let descriptor = StrId(r.read_uleb_u32()?);
                Instr::Call { symbol, descriptor }
            }
            op::NEW_MULTI => {
                let ty = StrId(r.read_uleb_u32()?);
                let dims = r.read_u8()?;
                Instr::NewMulti { ty, dims }
            }
            op::JUMP => {
                let t = r.read_u32_le()?;
                target = Some(t);
                targets.insert(t);
                // Placeholder label, fixed in pass two.
                Instr::Jump(LabelId(0))
            }
            op::JUMP_IF_NULL => {
                let t = r.read_u32_le()?;
                target = Some(t);
                targets.insert(t);
                Instr::JumpIfNull(LabelId(0))
            }
            op::RET => Instr::Ret,
            op::RET_VOID => Instr::RetVoid,
            _ => {
                return Err(FormatError::UnknownOpcode {
                    opcode,
                    offset: offset as usize,
                })
            }
        };
        raw.push(Raw {
            offset,
            instr,
            target,
        });
    }

    // Pass two: targets become labels, in offset order.
    let label_of = |offset: u32| -> Result<LabelId, FormatError> {
        let pos = targets
            .iter()
            .position(|&t| t == offset)
            .ok_or(FormatError::BadBranchTarget(offset))?;
        Ok(LabelId(pos as u32))
    };
    for &t in &targets {
        if !raw.iter().any(|i| i.offset == t) {
            return Err(FormatError::BadBranchTarget(t));
        }
    }

    let mut instrs = Vec::with_capacity(raw.len() + targets.len());
    for entry in raw {
        if targets.contains(&entry.offset) {
            instrs.push(Instr::Label(label_of(entry.offset)?));
        }
        let instr = match (entry.instr, entry.target) {
            (Instr::Jump(_), Some(t)) => Instr::Jump(label_of(t)?),
            (Instr::JumpIfNull(_), Some(t)) => Instr::JumpIfNull(label_of(t)?),
            (instr, _) => instr,
        };
        instrs.push(instr);
    }
    Ok(Body {
        instrs,
        label_count: targets.len() as u32,
    })
}
