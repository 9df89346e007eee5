//! Unit- and routine-level rewriting.
//!
//! The engine takes a unit's name and binary form and returns either a
//! rewritten unit or "no change". Failures abort the whole unit: the caller
//! decides between passing the original bytes through and halting, but a
//! half-rewritten routine is never produced.

use nullweave_ir::{assemble, decode_body, disasm, Routine, Signature, Unit};
use thiserror::Error;

use crate::flow::{analyze, Analysis, AnalysisError};
use crate::guard::{weave_guards, EditList, ReassemblyError};
use crate::options::RewriteOptions;
use crate::scan::{is_marker, scan_unit, ScanError};
use crate::value::ValueId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error("cannot rewrite unit {unit}: {source}")]
    Scan {
        unit: String,
        #[source]
        source: ScanError,
    },
    #[error("cannot rewrite unit {unit}: routine {routine}: {source}")]
    Analysis {
        unit: String,
        routine: String,
        #[source]
        source: AnalysisError,
    },
    #[error("cannot rewrite unit {unit}: routine {routine}: {source}")]
    Reassembly {
        unit: String,
        routine: String,
        #[source]
        source: ReassemblyError,
    },
}

// Stage attribution for one routine's failure, before unit context lands.
enum RoutineFailure {
    Analysis(AnalysisError),
    Reassembly(ReassemblyError),
}

#[derive(Debug)]
pub struct Engine {
    options: RewriteOptions,
}

impl Engine {
    pub fn new(options: RewriteOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RewriteOptions {
        &self.options
    }

    /// Rewrite one unit. `Ok(None)` means no change: the unit is excluded
    /// by namespace or contains no marker call.
    pub fn rewrite_unit(&self, name: &str, bytes: &[u8]) -> Result<Option<Vec<u8>>, RewriteError> {
        if self.options.is_excluded(name) {
            tracing::trace!(unit = name, "excluded namespace");
            return Ok(None);
        }
        let scan_failure = |source: ScanError| RewriteError::Scan {
            unit: name.to_string(),
            source,
        };
        let unit = Unit::decode(bytes).map_err(|e| scan_failure(ScanError::BadUnit(e)))?;
        let flagged = scan_unit(&unit).map_err(scan_failure)?;
        if flagged.is_empty() {
            return Ok(None);
        }
        tracing::debug!(unit = name, flagged = flagged.len(), "rewriting unit");

        let mut out = unit.clone();
        for routine in &mut out.routines {
            let routine_name = &unit.pool[routine.name];
            let signature = &unit.pool[routine.signature];
            let key = (routine_name.to_string(), signature.to_string());
            if !flagged.contains(&key) {
                continue;
            }
            rewrite_routine(&unit, routine).map_err(|failure| match failure {
                RoutineFailure::Analysis(source) => RewriteError::Analysis {
                    unit: name.to_string(),
                    routine: routine_name.to_string(),
                    source,
                },
                RoutineFailure::Reassembly(source) => RewriteError::Reassembly {
                    unit: name.to_string(),
                    routine: routine_name.to_string(),
                    source,
                },
            })?;
        }

        let rewritten = out.encode();
        if self.options.trace {
            dump_trace(name, &rewritten);
        }
        Ok(Some(rewritten))
    }
}

/// Analyze one flagged routine and weave guards for every reachable marker
/// site, updating its body and recomputed metadata in place. Verification
/// depth tables are only carried for modern-format units; legacy units have
/// none to preserve.
fn rewrite_routine(unit: &Unit, routine: &mut Routine) -> Result<(), RoutineFailure> {
    let mut body = decode_body(&routine.body)
        .map_err(|e| RoutineFailure::Analysis(AnalysisError::Format(e)))?;
    let signature = Signature::parse(&unit.pool[routine.signature])
        .map_err(|e| RoutineFailure::Analysis(AnalysisError::Format(e)))?;
    let analysis = analyze(
        &body,
        &unit.pool,
        &signature,
        routine.has_receiver,
        routine.local_count,
    )
    .map_err(RoutineFailure::Analysis)?;

    let sites = collect_sites(&analysis, &body, unit);
    let mut edits = EditList::new();
    let mut guards = 0;
    for &site in &sites {
        guards += weave_guards(&analysis.arena, site, &mut body, &mut edits)
            .map_err(RoutineFailure::Reassembly)?;
    }
    let instrs = edits.apply(&body.instrs);
    let assembled = assemble(&instrs, &unit.pool)
        .map_err(|e| RoutineFailure::Reassembly(ReassemblyError::Asm(e)))?;

    tracing::debug!(
        routine = %unit.pool[routine.name],
        sites = sites.len(),
        guards,
        max_stack = assembled.max_stack,
        "rewrote routine"
    );
    routine.body = assembled.bytes;
    routine.max_stack = assembled.max_stack;
    routine.depth_table = if unit.is_modern() {
        assembled.depth_table
    } else {
        Vec::new()
    };
    Ok(())
}

/// Marker sites anywhere in the computed frames: every stack position of
/// every reachable instruction, scanned from the last frame backward. A
/// site persisting across several frames is collected once. Markers in
/// unreachable code have no frame and stay in place.
fn collect_sites(analysis: &Analysis, body: &nullweave_ir::Body, unit: &Unit) -> Vec<ValueId> {
    let mut sites = Vec::new();
    for frame in analysis.frames.iter().rev().flatten() {
        for &id in &frame.stack {
            let Some(at) = analysis.arena[id].def_index() else {
                continue;
            };
            if is_marker(&body.instrs[at], &unit.pool) && !sites.contains(&id) {
                sites.push(id);
            }
        }
    }
    sites
}

fn dump_trace(name: &str, rewritten: &[u8]) {
    // Re-decode the output so the trace shows what was actually written.
    let rendered = Unit::decode(rewritten).and_then(|u| disasm::render_unit(&u));
    match rendered {
        Ok(text) => tracing::debug!(target: "nullweave::trace", unit = name, "\n{text}"),
        Err(err) => tracing::warn!(unit = name, %err, "trace render failed"),
    }
}
