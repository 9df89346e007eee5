//! Guard insertion for one marker site.
//!
//! Edits are phrased against original instruction indices and applied in a
//! single pass, so processing order across sites cannot matter: every guard
//! lands immediately after the producer it tests, every join label
//! immediately before its marker, wherever other sites placed theirs.

use std::collections::{BTreeMap, BTreeSet};

use nullweave_ir::{AsmError, Body, Instr};
use thiserror::Error;

use crate::value::{ValueArena, ValueId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("dereferencing value at instruction {at} has no recorded operands")]
    MissingPrimaryOperand { at: usize },
    #[error(transparent)]
    Asm(#[from] AsmError),
}

/// Pending insertions and removals keyed by original instruction index.
#[derive(Debug, Default)]
pub struct EditList {
    before: BTreeMap<usize, Vec<Instr>>,
    after: BTreeMap<usize, Vec<Instr>>,
    removed: BTreeSet<usize>,
}

impl EditList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_before(&mut self, index: usize, instrs: impl IntoIterator<Item = Instr>) {
        self.before.entry(index).or_default().extend(instrs);
    }

    pub fn insert_after(&mut self, index: usize, instrs: impl IntoIterator<Item = Instr>) {
        self.after.entry(index).or_default().extend(instrs);
    }

    pub fn remove(&mut self, index: usize) {
        self.removed.insert(index);
    }

    /// Materialize the edited instruction list. Insertions around a removed
    /// instruction survive its removal.
    pub fn apply(self, instrs: &[Instr]) -> Vec<Instr> {
        let mut out = Vec::with_capacity(instrs.len() + self.before.len() + self.after.len());
        for (index, instr) in instrs.iter().enumerate() {
            if let Some(pre) = self.before.get(&index) {
                out.extend(pre.iter().cloned());
            }
            if !self.removed.contains(&index) {
                out.push(instr.clone());
            }
            if let Some(post) = self.after.get(&index) {
                out.extend(post.iter().cloned());
            }
        }
        out
    }
}

/// Weave short-circuit guards for the marker site `site` into `edits`.
///
/// Inserts the join label immediately before the marker, walks the chain
/// upstream through each value's first operand, and guards every hop whose
/// producer is nullable with a duplicate-and-branch to the join. The marker
/// instruction itself is removed; the duplicated value is what remains as
/// the chain's result when a guard fires. Returns the number of guards
/// placed.
pub fn weave_guards(
    arena: &ValueArena,
    site: ValueId,
    body: &mut Body,
    edits: &mut EditList,
) -> Result<u32, ReassemblyError> {
    let marker = &arena[site];
    let Some(marker_at) = marker.def_index() else {
        // Sites come off evaluation stacks, so they are always
        // instruction-defined; a bare value here is a broken analysis.
        return Err(ReassemblyError::MissingPrimaryOperand { at: 0 });
    };
    let join = body.fresh_label();
    edits.insert_before(marker_at, [Instr::Label(join)]);
    edits.remove(marker_at);

    let mut guards = 0;
    let mut cur = next_hop(arena, site);
    while let Some((v_id, v_at)) = cur {
        let v = &arena[v_id];
        if v.derefs_primary {
            let p_id = *v
                .inputs
                .first()
                .ok_or(ReassemblyError::MissingPrimaryOperand { at: v_at })?;
            let p = &arena[p_id];
            if p.nullable {
                if let Some(p_at) = p.def_index() {
                    edits.insert_after(p_at, [Instr::Dup, Instr::JumpIfNull(join)]);
                    guards += 1;
                }
            }
        }
        cur = next_hop(arena, v_id);
    }
    Ok(guards)
}

// The walk follows first operands and stops at values with no producing
// instruction (parameters) or no operands at all (slot copies, literals).
fn next_hop(arena: &ValueArena, v: ValueId) -> Option<(ValueId, usize)> {
    let p = *arena[v].inputs.first()?;
    arena[p].def_index().map(|at| (p, at))
}

#[cfg(test)]
mod tests {
    use nullweave_ir::{Signature, StringPool, MARKER_DESCRIPTOR, MARKER_SYMBOL};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::flow::{analyze, Analysis};
    use crate::scan::is_marker;

    fn analyze_body(
        pool: &StringPool,
        instrs: Vec<Instr>,
        desc: &str,
        has_receiver: bool,
        local_count: u32,
    ) -> (Analysis, Body) {
        let body = Body {
            instrs,
            label_count: 0,
        };
        let sig = Signature::parse(desc).unwrap();
        let analysis = analyze(&body, pool, &sig, has_receiver, local_count).unwrap();
        (analysis, body)
    }

    fn marker_site(analysis: &Analysis, body: &Body, pool: &StringPool) -> ValueId {
        for frame in analysis.frames.iter().flatten() {
            for &id in &frame.stack {
                if let Some(at) = analysis.arena[id].def_index() {
                    if is_marker(&body.instrs[at], pool) {
                        return id;
                    }
                }
            }
        }
        panic!("no marker site in body")
    }

    fn rewrite_one(
        pool: &StringPool,
        instrs: Vec<Instr>,
        desc: &str,
        has_receiver: bool,
        local_count: u32,
    ) -> (Vec<Instr>, u32) {
        let (analysis, mut body) = analyze_body(pool, instrs, desc, has_receiver, local_count);
        let site = marker_site(&analysis, &body, pool);
        let mut edits = EditList::new();
        let guards = weave_guards(&analysis.arena, site, &mut body, &mut edits).unwrap();
        (edits.apply(&body.instrs), guards)
    }

    fn marked_pool() -> (StringPool, Instr) {
        let mut pool = StringPool::new();
        let symbol = pool.intern(MARKER_SYMBOL);
        let descriptor = pool.intern(MARKER_DESCRIPTOR);
        (pool, Instr::Call { symbol, descriptor })
    }

    #[test]
    fn single_hop_chain_gets_one_guard() {
        let (mut pool, mark) = marked_pool();
        let get_b = Instr::Call {
            symbol: pool.intern("app/a/get_b"),
            descriptor: pool.intern("(R)R"),
        };
        let (out, guards) = rewrite_one(
            &pool,
            vec![Instr::LoadSlot(0), get_b.clone(), mark, Instr::Ret],
            "(R)R",
            false,
            1,
        );
        assert_eq!(guards, 1);
        assert_eq!(
            out,
            vec![
                Instr::LoadSlot(0),
                Instr::Dup,
                Instr::JumpIfNull(nullweave_ir::LabelId(0)),
                get_b,
                Instr::Label(nullweave_ir::LabelId(0)),
                Instr::Ret,
            ]
        );
    }

    #[test]
    fn two_hop_chain_gets_a_guard_per_nullable_hop() {
        let (mut pool, mark) = marked_pool();
        let get_b = Instr::Call {
            symbol: pool.intern("app/a/get_b"),
            descriptor: pool.intern("(R)R"),
        };
        let get_c = Instr::Call {
            symbol: pool.intern("app/b/get_c"),
            descriptor: pool.intern("(R)R"),
        };
        let (out, guards) = rewrite_one(
            &pool,
            vec![
                Instr::LoadSlot(0),
                get_b.clone(),
                get_c.clone(),
                mark,
                Instr::Ret,
            ],
            "(R)R",
            false,
            1,
        );
        assert_eq!(guards, 2);
        let join = nullweave_ir::LabelId(0);
        assert_eq!(
            out,
            vec![
                Instr::LoadSlot(0),
                Instr::Dup,
                Instr::JumpIfNull(join),
                get_b,
                Instr::Dup,
                Instr::JumpIfNull(join),
                get_c,
                Instr::Label(join),
                Instr::Ret,
            ]
        );
    }

    #[test]
    fn receiver_loads_are_not_guarded() {
        let (mut pool, mark) = marked_pool();
        let get_b = Instr::Call {
            symbol: pool.intern("app/a/get_b"),
            descriptor: pool.intern("(R)R"),
        };
        let (out, guards) = rewrite_one(
            &pool,
            vec![Instr::LoadSlot(0), get_b.clone(), mark, Instr::Ret],
            "(R)R",
            true,
            1,
        );
        assert_eq!(guards, 0);
        // The join label still lands and the marker still goes away.
        assert_eq!(
            out,
            vec![
                Instr::LoadSlot(0),
                get_b,
                Instr::Label(nullweave_ir::LabelId(0)),
                Instr::Ret,
            ]
        );
    }

    #[test]
    fn null_literal_chain_is_marker_removal_only() {
        let (pool, mark) = marked_pool();
        let (out, guards) = rewrite_one(
            &pool,
            vec![Instr::ConstNull, mark, Instr::Ret],
            "()R",
            false,
            0,
        );
        assert_eq!(guards, 0);
        assert_eq!(
            out,
            vec![
                Instr::ConstNull,
                Instr::Label(nullweave_ir::LabelId(0)),
                Instr::Ret,
            ]
        );
    }

    #[test]
    fn field_read_hops_are_guarded() {
        let (mut pool, mark) = marked_pool();
        let field = pool.intern("b");
        let (out, guards) = rewrite_one(
            &pool,
            vec![Instr::LoadSlot(0), Instr::GetField(field), mark, Instr::Ret],
            "(R)R",
            false,
            1,
        );
        assert_eq!(guards, 1);
        let join = nullweave_ir::LabelId(0);
        assert_eq!(
            out,
            vec![
                Instr::LoadSlot(0),
                Instr::Dup,
                Instr::JumpIfNull(join),
                Instr::GetField(field),
                Instr::Label(join),
                Instr::Ret,
            ]
        );
    }

    #[test]
    fn indexed_reads_are_left_unguarded() {
        // The two-operand classification records no dereference and no
        // nullability, so a null container passes through unprotected.
        let (pool, mark) = marked_pool();
        let (out, guards) = rewrite_one(
            &pool,
            vec![
                Instr::LoadSlot(0),
                Instr::ConstInt(0),
                Instr::ArrayGet,
                mark,
                Instr::Ret,
            ],
            "(A)R",
            false,
            1,
        );
        assert_eq!(guards, 0);
        assert_eq!(
            out,
            vec![
                Instr::LoadSlot(0),
                Instr::ConstInt(0),
                Instr::ArrayGet,
                Instr::Label(nullweave_ir::LabelId(0)),
                Instr::Ret,
            ]
        );
    }

    #[test]
    fn chain_rooted_at_an_operandless_call_fails() {
        let (mut pool, mark) = marked_pool();
        let make = Instr::Call {
            symbol: pool.intern("app/a/make"),
            descriptor: pool.intern("()R"),
        };
        let (analysis, mut body) = analyze_body(
            &pool,
            vec![make, mark, Instr::Ret],
            "()R",
            false,
            0,
        );
        let site = marker_site(&analysis, &body, &pool);
        let mut edits = EditList::new();
        let err = weave_guards(&analysis.arena, site, &mut body, &mut edits).unwrap_err();
        assert_eq!(err, ReassemblyError::MissingPrimaryOperand { at: 0 });
    }

    #[test]
    fn edits_around_a_removed_instruction_survive() {
        let mut edits = EditList::new();
        edits.insert_before(1, [Instr::Pop]);
        edits.insert_after(1, [Instr::Dup]);
        edits.remove(1);
        let out = edits.apply(&[Instr::ConstNull, Instr::ConstInt(7), Instr::RetVoid]);
        assert_eq!(
            out,
            vec![Instr::ConstNull, Instr::Pop, Instr::Dup, Instr::RetVoid]
        );
    }
}
