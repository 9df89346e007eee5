//! Fixpoint abstract interpretation over one routine body.
//!
//! Produces one [`AnnotatedValue`] per live stack and local slot at every
//! instruction. The classification is purely local, keyed on instruction
//! arity/kind: call-like instructions dereference their first operand and
//! are nullable when they return a reference; single-operand instructions
//! are always nullable and dereference only for instance-field reads;
//! zero-operand instructions are nullable only for the null literal and
//! reference-typed static reads; slot copies record no inputs so resolved
//! nullability never travels through a binding; two-operand instructions
//! propagate nothing.
//!
//! Merge points keep the first value seen per slot. Conflicting value kinds
//! or conflicting stack depths fail the analysis, and with them the whole
//! unit rewrite.

use std::collections::VecDeque;

use nullweave_ir::{Body, FormatError, Instr, LabelId, Signature, StringPool, TypeCode};
use thiserror::Error;

use crate::value::{AnnotatedValue, Definition, ValueArena, ValueId, ValueKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("operand stack underflow at instruction {at}")]
    StackUnderflow { at: usize },
    #[error("local slot {slot} out of range at instruction {at}")]
    SlotOutOfRange { slot: u32, at: usize },
    #[error("local slot {slot} read before any write at instruction {at}")]
    UninitializedSlot { slot: u32, at: usize },
    #[error("local slot {slot} holds conflicting values at instruction {at}")]
    ConflictedSlot { slot: u32, at: usize },
    #[error("conflicting value kinds merge into instruction {at}")]
    KindConflict { at: usize },
    #[error("conflicting operand stack depths merge into instruction {at}")]
    DepthConflict { at: usize },
    #[error("execution can fall off the end of the body after instruction {at}")]
    FallsOffEnd { at: usize },
    #[error("branch to unplaced label L{label}")]
    UnknownLabel { label: u32 },
    #[error("routine declares {declared} local slots but its signature needs {needed}")]
    LocalCountMismatch { declared: u32, needed: usize },
    #[error("analysis did not converge after {0} steps")]
    NoFixpoint(usize),
    #[error(transparent)]
    Format(#[from] FormatError),
}

/// What a local slot holds at one program point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Local {
    /// Never written on any path reaching this point.
    Unset,
    /// Written with irreconcilable values on different paths.
    Conflicted,
    Val(ValueId),
}

/// Abstract machine state entering one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub locals: Vec<Local>,
    pub stack: Vec<ValueId>,
}

/// Result of one analysis pass: the value arena and the frame entering each
/// instruction (`None` for unreachable instructions).
#[derive(Debug)]
pub struct Analysis {
    pub arena: ValueArena,
    pub frames: Vec<Option<Frame>>,
}

struct FlowContext<'a> {
    pool: &'a StringPool,
    instrs: &'a [Instr],
    has_receiver: bool,
    // Instruction index per label id.
    labels: Vec<Option<usize>>,
}

impl FlowContext<'_> {
    fn label_index(&self, label: LabelId) -> Result<usize, AnalysisError> {
        self.labels
            .get(label.0 as usize)
            .copied()
            .flatten()
            .ok_or(AnalysisError::UnknownLabel { label: label.0 })
    }
}

/// Run the fixpoint over `body`.
pub fn analyze(
    body: &Body,
    pool: &StringPool,
    signature: &Signature,
    has_receiver: bool,
    local_count: u32,
) -> Result<Analysis, AnalysisError> {
    let instrs = &body.instrs;
    let mut arena = ValueArena::new();
    let mut frames: Vec<Option<Frame>> = vec![None; instrs.len()];
    if instrs.is_empty() {
        return Ok(Analysis { arena, frames });
    }

    if signature.param_count() > local_count as usize {
        return Err(AnalysisError::LocalCountMismatch {
            declared: local_count,
            needed: signature.param_count(),
        });
    }

    let mut labels: Vec<Option<usize>> = vec![None; body.label_count as usize];
    for (index, instr) in instrs.iter().enumerate() {
        if let Instr::Label(id) = instr {
            if let Some(slot) = labels.get_mut(id.0 as usize) {
                *slot = Some(index);
            }
        }
    }
    let ctx = FlowContext {
        pool,
        instrs,
        has_receiver,
        labels,
    };

    let mut entry = Frame {
        locals: vec![Local::Unset; local_count as usize],
        stack: Vec::new(),
    };
    for (slot, ty) in signature.params.iter().enumerate() {
        let kind = match ty {
            TypeCode::Int => ValueKind::Int,
            _ => ValueKind::Ref,
        };
        let id = arena.alloc(AnnotatedValue {
            def: Definition::Param { slot: slot as u32 },
            inputs: Vec::new(),
            derefs_primary: false,
            nullable: false,
            kind,
        });
        entry.locals[slot] = Local::Val(id);
    }
    frames[0] = Some(entry);

    // One value per instruction per pass; later re-executions reuse it.
    let mut produced: Vec<Option<ValueId>> = vec![None; instrs.len()];
    let mut worklist = VecDeque::new();
    worklist.push_back(0usize);

    let budget = instrs.len() * 32 + 256;
    let mut steps = 0usize;
    while let Some(index) = worklist.pop_front() {
        steps += 1;
        if steps > budget {
            tracing::warn!(steps, "analysis failed to converge");
            return Err(AnalysisError::NoFixpoint(steps));
        }
        let Some(mut frame) = frames[index].clone() else {
            continue;
        };
        exec(&ctx, &mut arena, &mut produced, index, &mut frame)?;

        let instr = &instrs[index];
        if instr.falls_through() {
            if index + 1 >= instrs.len() {
                return Err(AnalysisError::FallsOffEnd { at: index });
            }
            propagate(&mut frames, &arena, index + 1, &frame, &mut worklist)?;
        }
        if let Some(target) = instr.branch_target() {
            let target_index = ctx.label_index(target)?;
            propagate(&mut frames, &arena, target_index, &frame, &mut worklist)?;
        }
    }

    Ok(Analysis { arena, frames })
}

fn propagate(
    frames: &mut [Option<Frame>],
    arena: &ValueArena,
    target: usize,
    incoming: &Frame,
    worklist: &mut VecDeque<usize>,
) -> Result<(), AnalysisError> {
    match &mut frames[target] {
        slot @ None => {
            *slot = Some(incoming.clone());
            worklist.push_back(target);
        }
        Some(have) => {
            if merge(have, incoming, arena, target)? {
                worklist.push_back(target);
            }
        }
    }
    Ok(())
}

/// Merge `incoming` into `have`. The first value seen per slot wins; a
/// changed local (conflict poisoning) re-enqueues the target.
fn merge(
    have: &mut Frame,
    incoming: &Frame,
    arena: &ValueArena,
    at: usize,
) -> Result<bool, AnalysisError> {
    if have.stack.len() != incoming.stack.len() {
        return Err(AnalysisError::DepthConflict { at });
    }
    for (&h, &i) in have.stack.iter().zip(&incoming.stack) {
        if h != i && !arena[h].kind.compatible(arena[i].kind) {
            return Err(AnalysisError::KindConflict { at });
        }
    }
    let mut changed = false;
    for (h, &i) in have.locals.iter_mut().zip(&incoming.locals) {
        let merged = match (*h, i) {
            (Local::Conflicted, _) => Local::Conflicted,
            (Local::Unset, Local::Unset) => Local::Unset,
            (Local::Val(a), Local::Val(b)) => {
                if a == b || arena[a].kind.compatible(arena[b].kind) {
                    Local::Val(a)
                } else {
                    Local::Conflicted
                }
            }
            // Defined on one path only, or poisoned on the other.
            (Local::Unset, _) | (Local::Val(_), _) => Local::Conflicted,
        };
        if merged != *h {
            *h = merged;
            changed = true;
        }
    }
    Ok(changed)
}

/// Execute one instruction abstractly, mutating `frame` in place. The
/// classification table lives here.
fn exec(
    ctx: &FlowContext<'_>,
    arena: &mut ValueArena,
    produced: &mut [Option<ValueId>],
    at: usize,
    frame: &mut Frame,
) -> Result<(), AnalysisError> {
    let pop = |frame: &mut Frame| -> Result<ValueId, AnalysisError> {
        frame.stack.pop().ok_or(AnalysisError::StackUnderflow { at })
    };
    let mut produce = |arena: &mut ValueArena,
                       inputs: Vec<ValueId>,
                       derefs_primary: bool,
                       nullable: bool,
                       kind: ValueKind|
     -> ValueId {
        if let Some(id) = produced[at] {
            return id;
        }
        let id = arena.alloc(AnnotatedValue {
            def: Definition::Instr { index: at },
            inputs,
            derefs_primary,
            nullable,
            kind,
        });
        produced[at] = Some(id);
        id
    };

    match ctx.instrs[at] {
        Instr::Label(_) | Instr::Jump(_) | Instr::RetVoid => {}
        Instr::JumpIfNull(_) | Instr::Pop | Instr::Ret => {
            pop(frame)?;
        }

        // Zero-operand producers.
        Instr::ConstNull => {
            let id = produce(arena, Vec::new(), false, true, ValueKind::Ref);
            frame.stack.push(id);
        }
        Instr::ConstInt(_) => {
            let id = produce(arena, Vec::new(), false, false, ValueKind::Int);
            frame.stack.push(id);
        }
        Instr::New(_) => {
            let id = produce(arena, Vec::new(), false, false, ValueKind::Ref);
            frame.stack.push(id);
        }
        Instr::GetStatic { is_ref, .. } => {
            let kind = if is_ref { ValueKind::Ref } else { ValueKind::Int };
            let id = produce(arena, Vec::new(), false, is_ref, kind);
            frame.stack.push(id);
        }

        // Slot copies: no inputs, so nullability resolved inside a marked
        // chain cannot leak through a binding.
        Instr::LoadSlot(slot) => {
            let local = *frame
                .locals
                .get(slot as usize)
                .ok_or(AnalysisError::SlotOutOfRange { slot, at })?;
            let src = match local {
                Local::Unset => return Err(AnalysisError::UninitializedSlot { slot, at }),
                Local::Conflicted => return Err(AnalysisError::ConflictedSlot { slot, at }),
                Local::Val(id) => id,
            };
            let nullable = !(ctx.has_receiver && slot == 0);
            let kind = arena[src].kind;
            let id = produce(arena, Vec::new(), false, nullable, kind);
            frame.stack.push(id);
        }
        Instr::StoreSlot(slot) => {
            let v = pop(frame)?;
            if frame.locals.len() <= slot as usize {
                return Err(AnalysisError::SlotOutOfRange { slot, at });
            }
            let kind = arena[v].kind;
            let id = produce(arena, Vec::new(), false, false, kind);
            frame.locals[slot as usize] = Local::Val(id);
        }
        Instr::Dup => {
            let v = pop(frame)?;
            let kind = arena[v].kind;
            let copy = produce(arena, Vec::new(), false, false, kind);
            frame.stack.push(v);
            frame.stack.push(copy);
        }

        // Single-operand: always nullable, dereferences only for the
        // instance-field read.
        Instr::GetField(_) => {
            let v = pop(frame)?;
            let id = produce(arena, vec![v], true, true, ValueKind::Unknown);
            frame.stack.push(id);
        }
        Instr::CheckCast(_) => {
            let v = pop(frame)?;
            let id = produce(arena, vec![v], false, true, ValueKind::Ref);
            frame.stack.push(id);
        }
        Instr::Neg => {
            let v = pop(frame)?;
            let id = produce(arena, vec![v], false, true, ValueKind::Int);
            frame.stack.push(id);
        }

        // Two-operand: never dereferences, never nullable.
        Instr::Add => {
            let b = pop(frame)?;
            let a = pop(frame)?;
            let id = produce(arena, vec![a, b], false, false, ValueKind::Int);
            frame.stack.push(id);
        }
        Instr::ArrayGet => {
            let index = pop(frame)?;
            let array = pop(frame)?;
            let id = produce(arena, vec![array, index], false, false, ValueKind::Unknown);
            frame.stack.push(id);
        }
        Instr::PutField(_) => {
            let value = pop(frame)?;
            let object = pop(frame)?;
            // Two-operand classification, but no stack result.
            let _ = (object, value);
        }

        // Variadic call-likes: the dereference requirement applies to the
        // first operand whether or not it is really a receiver.
        Instr::Call { descriptor, .. } => {
            let desc = ctx
                .pool
                .get(descriptor)
                .ok_or(FormatError::BadStringIndex(descriptor.0))?;
            let sig = Signature::parse(desc)?;
            let mut inputs = Vec::with_capacity(sig.param_count());
            for _ in 0..sig.param_count() {
                inputs.push(pop(frame)?);
            }
            inputs.reverse();
            if sig.ret != TypeCode::Void {
                let kind = match sig.ret {
                    TypeCode::Int => ValueKind::Int,
                    _ => ValueKind::Ref,
                };
                let id = produce(arena, inputs, true, sig.returns_reference(), kind);
                frame.stack.push(id);
            }
        }
        Instr::NewMulti { dims, .. } => {
            let mut inputs = Vec::with_capacity(dims as usize);
            for _ in 0..dims {
                inputs.push(pop(frame)?);
            }
            inputs.reverse();
            let id = produce(arena, inputs, true, false, ValueKind::Ref);
            frame.stack.push(id);
        }
    }
    Ok(())
}
