//! Body assembler: encodes an instruction list back to bytes, resolving
//! labels through recorded fixups, and recomputes the metadata an edit
//! invalidates — the operand-stack high-water mark and, for modern units,
//! the depth table.

use std::collections::VecDeque;

use thiserror::Error;

use crate::codec::{FormatError, Writer};
use crate::instr::{op, Instr, LabelId};
use crate::unit::StringPool;

/// Result of assembling one routine body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledBody {
    pub bytes: Vec<u8>,
    /// Recomputed operand-stack high-water mark.
    pub max_stack: u32,
    /// `(body offset, stack depth)` per reachable label, in offset order.
    pub depth_table: Vec<(u32, u32)>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AsmError {
    #[error("branch to label L{0} which is never placed")]
    UnboundLabel(u32),
    #[error("label L{0} placed more than once")]
    DuplicateLabel(u32),
    #[error("operand stack underflow at instruction {at}")]
    StackUnderflow { at: usize },
    #[error("conflicting operand stack depths at instruction {at}: {have} vs {incoming}")]
    DepthConflict { at: usize, have: u32, incoming: u32 },
    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Encode `instrs` and recompute stack metadata.
///
/// The byte pass emits placeholder branch operands and patches them once
/// every label's offset is known. The depth pass then walks the instruction
/// list from the entry with a worklist, tracking the operand-stack depth
/// into every instruction; inconsistent depths at a merge point or a pop
/// from an empty stack mean the instruction list is malformed.
pub fn assemble(instrs: &[Instr], pool: &StringPool) -> Result<AssembledBody, AsmError> {
    let mut w = Writer::new();
    let mut label_offsets: Vec<Option<u32>> = Vec::new();
    let mut label_indices: Vec<Option<usize>> = Vec::new();
    let mut fixups: Vec<(usize, LabelId)> = Vec::new();

    fn slot<T: Copy>(v: &mut Vec<Option<T>>, id: LabelId) -> &mut Option<T> {
        let idx = id.0 as usize;
        if v.len() <= idx {
            v.resize(idx + 1, None);
        }
        &mut v[idx]
    }

    for (index, instr) in instrs.iter().enumerate() {
        match *instr {
            Instr::Label(id) => {
                let offset = w.len() as u32;
                let placed = slot(&mut label_offsets, id);
                if placed.is_some() {
                    return Err(AsmError::DuplicateLabel(id.0));
                }
                *placed = Some(offset);
                *slot(&mut label_indices, id) = Some(index);
            }
            Instr::ConstNull => w.write_u8(op::CONST_NULL),
            Instr::ConstInt(v) => {
                w.write_u8(op::CONST_INT);
                w.write_sleb(v);
            }
            Instr::New(ty) => {
                w.write_u8(op::NEW);
                w.write_uleb(u64::from(ty.0));
            }
            Instr::GetStatic { field, is_ref } => {
                w.write_u8(op::GET_STATIC);
                w.write_uleb(u64::from(field.0));
                w.write_u8(u8::from(is_ref));
            }
            Instr::LoadSlot(slot_idx) => {
                w.write_u8(op::LOAD_SLOT);
                w.write_uleb(u64::from(slot_idx));
            }
            Instr::StoreSlot(slot_idx) => {
                w.write_u8(op::STORE_SLOT);
                w.write_uleb(u64::from(slot_idx));
            }
            Instr::Dup => w.write_u8(op::DUP),
            Instr::Pop => w.write_u8(op::POP),
            Instr::GetField(field) => {
                w.write_u8(op::GET_FIELD);
                w.write_uleb(u64::from(field.0));
            }
            Instr::CheckCast(ty) => {
                w.write_u8(op::CHECK_CAST);
                w.write_uleb(u64::from(ty.0));
            }
            Instr::Neg => w.write_u8(op::NEG),
            Instr::Add => w.write_u8(op::ADD),
            Instr::ArrayGet => w.write_u8(op::ARRAY_GET),
            Instr::PutField(field) => {
                w.write_u8(op::PUT_FIELD);
                w.write_uleb(u64::from(field.0));
            }
            Instr::Call { symbol, descriptor } => {
                w.write_u8(op::CALL);
                w.write_uleb(u64::from(symbol.0));
                w.write_uleb(u64::from(descriptor.0));
            }
            Instr::NewMulti { ty, dims } => {
                w.write_u8(op::NEW_MULTI);
                w.write_uleb(u64::from(ty.0));
                w.write_u8(dims);
            }
            Instr::Jump(target) => {
                w.write_u8(op::JUMP);
                fixups.push((w.len(), target));
                w.write_u32_le(0);
            }
            Instr::JumpIfNull(target) => {
                w.write_u8(op::JUMP_IF_NULL);
                fixups.push((w.len(), target));
                w.write_u32_le(0);
            }
            Instr::Ret => w.write_u8(op::RET),
            Instr::RetVoid => w.write_u8(op::RET_VOID),
        }
    }

    for (at, label) in fixups {
        let offset = label_offsets
            .get(label.0 as usize)
            .copied()
            .flatten()
            .ok_or(AsmError::UnboundLabel(label.0))?;
        w.patch_u32_le(at, offset);
    }

    let label_index = |id: LabelId| -> Result<usize, AsmError> {
        label_indices
            .get(id.0 as usize)
            .copied()
            .flatten()
            .ok_or(AsmError::UnboundLabel(id.0))
    };

    // Depth pass.
    let mut depth_in: Vec<Option<u32>> = vec![None; instrs.len()];
    let mut max_stack = 0u32;
    let mut worklist = VecDeque::new();
    if !instrs.is_empty() {
        depth_in[0] = Some(0);
        worklist.push_back(0usize);
    }
    while let Some(index) = worklist.pop_front() {
        let depth = depth_in[index].unwrap_or(0);
        max_stack = max_stack.max(depth);
        let instr = &instrs[index];
        let (pops, pushes) = instr.stack_effect(pool)?;
        if depth < pops {
            return Err(AsmError::StackUnderflow { at: index });
        }
        let out = depth - pops + pushes;
        max_stack = max_stack.max(out);

        let mut successors: [Option<usize>; 2] = [None, None];
        if instr.falls_through() && index + 1 < instrs.len() {
            successors[0] = Some(index + 1);
        }
        if let Some(target) = instr.branch_target() {
            successors[1] = Some(label_index(target)?);
        }
        for succ in successors.into_iter().flatten() {
            match depth_in[succ] {
                None => {
                    depth_in[succ] = Some(out);
                    worklist.push_back(succ);
                }
                Some(have) if have != out => {
                    return Err(AsmError::DepthConflict {
                        at: succ,
                        have,
                        incoming: out,
                    });
                }
                Some(_) => {}
            }
        }
    }

    let mut depth_table = Vec::new();
    for (index, instr) in instrs.iter().enumerate() {
        if let Instr::Label(id) = instr {
            if let Some(depth) = depth_in[index] {
                let offset = label_offsets
                    .get(id.0 as usize)
                    .copied()
                    .flatten()
                    .ok_or(AsmError::UnboundLabel(id.0))?;
                depth_table.push((offset, depth));
            }
        }
    }

    Ok(AssembledBody {
        bytes: w.into_vec(),
        max_stack,
        depth_table,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::decode_body;
    use crate::unit::StrId;

    fn pool_with(strings: &[&str]) -> StringPool {
        let mut pool = StringPool::new();
        for s in strings {
            pool.intern(s);
        }
        pool
    }

    #[test]
    fn branch_operands_are_backpatched() {
        let pool = StringPool::new();
        // jump L0, const_null, L0: ret_void
        let instrs = vec![
            Instr::Jump(LabelId(0)),
            Instr::ConstNull,
            Instr::Label(LabelId(0)),
            Instr::RetVoid,
        ];
        let assembled = assemble(&instrs, &pool).unwrap();
        // jump is 1 + 4 bytes, const_null 1 byte, so L0 sits at offset 6.
        assert_eq!(assembled.bytes[1..5], [6, 0, 0, 0]);
        assert_eq!(assembled.bytes[6], op::RET_VOID);
    }

    #[test]
    fn forward_and_backward_branches_round_trip() {
        let pool = pool_with(&["f"]);
        let instrs = vec![
            Instr::Label(LabelId(1)),
            Instr::ConstNull,
            Instr::JumpIfNull(LabelId(0)),
            Instr::Jump(LabelId(1)),
            Instr::Label(LabelId(0)),
            Instr::RetVoid,
        ];
        let assembled = assemble(&instrs, &pool).unwrap();
        let body = decode_body(&assembled.bytes).unwrap();
        // Label ids are reassigned in offset order on decode.
        assert_eq!(
            body.instrs,
            vec![
                Instr::Label(LabelId(0)),
                Instr::ConstNull,
                Instr::JumpIfNull(LabelId(1)),
                Instr::Jump(LabelId(0)),
                Instr::Label(LabelId(1)),
                Instr::RetVoid,
            ]
        );
    }

    #[test]
    fn unbound_label_is_rejected() {
        let pool = StringPool::new();
        let instrs = vec![Instr::Jump(LabelId(3)), Instr::RetVoid];
        assert_eq!(assemble(&instrs, &pool), Err(AsmError::UnboundLabel(3)));
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let pool = StringPool::new();
        let instrs = vec![
            Instr::Label(LabelId(0)),
            Instr::Label(LabelId(0)),
            Instr::RetVoid,
        ];
        assert_eq!(assemble(&instrs, &pool), Err(AsmError::DuplicateLabel(0)));
    }

    #[test]
    fn stack_underflow_is_rejected() {
        let pool = StringPool::new();
        let instrs = vec![Instr::Pop, Instr::RetVoid];
        assert_eq!(
            assemble(&instrs, &pool),
            Err(AsmError::StackUnderflow { at: 0 })
        );
    }

    #[test]
    fn merge_depth_conflict_is_rejected() {
        let pool = StringPool::new();
        // The branch reaches L0 with an empty stack, the fall-through path
        // pushes one value first.
        let instrs = vec![
            Instr::ConstNull,
            Instr::JumpIfNull(LabelId(0)),
            Instr::ConstNull,
            Instr::Label(LabelId(0)),
            Instr::RetVoid,
        ];
        assert_eq!(
            assemble(&instrs, &pool),
            Err(AsmError::DepthConflict {
                at: 3,
                have: 0,
                incoming: 1
            })
        );
    }

    #[test]
    fn max_stack_covers_guard_duplication() {
        let pool = pool_with(&["b", "(R)R"]);
        let instrs = vec![
            Instr::LoadSlot(0),
            Instr::Dup,
            Instr::JumpIfNull(LabelId(0)),
            Instr::Call {
                symbol: StrId(0),
                descriptor: StrId(1),
            },
            Instr::Label(LabelId(0)),
            Instr::Ret,
        ];
        let assembled = assemble(&instrs, &pool).unwrap();
        assert_eq!(assembled.max_stack, 2);
    }

    #[test]
    fn depth_table_lists_reachable_labels_in_offset_order() {
        let pool = StringPool::new();
        let instrs = vec![
            Instr::ConstNull,
            Instr::JumpIfNull(LabelId(1)),
            Instr::ConstNull,
            Instr::Pop,
            Instr::Label(LabelId(1)),
            Instr::ConstNull,
            Instr::JumpIfNull(LabelId(0)),
            Instr::Label(LabelId(0)),
            Instr::RetVoid,
        ];
        let assembled = assemble(&instrs, &pool).unwrap();
        // L1 lands after const_null, jump_if_null, const_null, pop = 8 bytes;
        // L0 lands after a further const_null + jump_if_null = offset 14.
        assert_eq!(assembled.depth_table, vec![(8, 0), (14, 0)]);
    }

    #[test]
    fn unreachable_labels_are_left_out_of_the_depth_table() {
        let pool = StringPool::new();
        let instrs = vec![
            Instr::RetVoid,
            Instr::Label(LabelId(0)),
            Instr::Label(LabelId(1)),
            Instr::Jump(LabelId(0)),
        ];
        let assembled = assemble(&instrs, &pool).unwrap();
        assert!(assembled.depth_table.is_empty());
        assert_eq!(assembled.max_stack, 0);
    }
}
