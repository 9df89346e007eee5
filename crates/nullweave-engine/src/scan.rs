//! Marker identification: one cheap linear pass per routine, no dataflow.
//!
//! A routine is flagged when its body contains a call to the well-known
//! identity routine [`MARKER_SYMBOL`] with descriptor [`MARKER_DESCRIPTOR`].
//! Units with no flagged routine skip analysis and rewriting entirely.

use std::collections::BTreeSet;

use nullweave_ir::{
    decode_body, FormatError, Instr, StringPool, Unit, MARKER_DESCRIPTOR, MARKER_SYMBOL,
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The container itself would not decode; no routine names available.
    #[error(transparent)]
    BadUnit(#[from] FormatError),
    #[error("routine {routine}: {source}")]
    BadRoutine {
        routine: String,
        #[source]
        source: FormatError,
    },
}

/// Flagged `(routine name, signature descriptor)` pairs, ordered for
/// deterministic reporting.
pub type Flagged = BTreeSet<(String, String)>;

pub(crate) fn is_marker(instr: &Instr, pool: &StringPool) -> bool {
    match instr {
        Instr::Call { symbol, descriptor } => {
            pool.get(*symbol) == Some(MARKER_SYMBOL)
                && pool.get(*descriptor) == Some(MARKER_DESCRIPTOR)
        }
        _ => false,
    }
}

/// Scan every routine of `unit` for marker calls.
pub fn scan_unit(unit: &Unit) -> Result<Flagged, ScanError> {
    let mut flagged = Flagged::new();
    for routine in &unit.routines {
        let name = &unit.pool[routine.name];
        let body = decode_body(&routine.body).map_err(|source| ScanError::BadRoutine {
            routine: name.to_string(),
            source,
        })?;
        if body.instrs.iter().any(|i| is_marker(i, &unit.pool)) {
            flagged.insert((name.to_string(), unit.pool[routine.signature].to_string()));
        }
    }
    tracing::trace!(
        unit = unit.name_str(),
        flagged = flagged.len(),
        "marker scan"
    );
    Ok(flagged)
}

#[cfg(test)]
mod tests {
    use nullweave_ir::{assemble, Routine};

    use super::*;

    fn push_routine(unit: &mut Unit, name: &str, desc: &str, instrs: &[Instr]) {
        let assembled = assemble(instrs, &unit.pool).unwrap();
        let name = unit.pool.intern(name);
        let signature = unit.pool.intern(desc);
        unit.routines.push(Routine {
            name,
            signature,
            has_receiver: false,
            local_count: 1,
            max_stack: assembled.max_stack,
            depth_table: assembled.depth_table,
            body: assembled.bytes,
        });
    }

    fn marker_call(unit: &mut Unit) -> Instr {
        let symbol = unit.pool.intern(MARKER_SYMBOL);
        let descriptor = unit.pool.intern(MARKER_DESCRIPTOR);
        Instr::Call { symbol, descriptor }
    }

    #[test]
    fn flags_routines_containing_marker_calls() {
        let mut unit = Unit::new(2, "app/Main");
        let mark = marker_call(&mut unit);
        push_routine(
            &mut unit,
            "plain",
            "(R)R",
            &[Instr::LoadSlot(0), Instr::Ret],
        );
        push_routine(
            &mut unit,
            "marked",
            "(R)R",
            &[Instr::LoadSlot(0), mark, Instr::Ret],
        );
        let flagged = scan_unit(&unit).unwrap();
        assert_eq!(flagged.len(), 1);
        assert!(flagged.contains(&("marked".to_string(), "(R)R".to_string())));
    }

    #[test]
    fn calls_with_the_marker_name_but_another_shape_are_not_markers() {
        let mut unit = Unit::new(2, "app/Main");
        let symbol = unit.pool.intern(MARKER_SYMBOL);
        let descriptor = unit.pool.intern("(RR)R");
        push_routine(
            &mut unit,
            "lookalike",
            "(RR)R",
            &[
                Instr::LoadSlot(0),
                Instr::LoadSlot(0),
                Instr::Call { symbol, descriptor },
                Instr::Ret,
            ],
        );
        assert!(scan_unit(&unit).unwrap().is_empty());
    }

    #[test]
    fn unit_without_markers_yields_an_empty_set() {
        let mut unit = Unit::new(1, "app/Main");
        push_routine(&mut unit, "f", "()V", &[Instr::RetVoid]);
        assert!(scan_unit(&unit).unwrap().is_empty());
    }

    #[test]
    fn malformed_bodies_name_the_routine() {
        let mut unit = Unit::new(2, "app/Main");
        let name = unit.pool.intern("broken");
        let signature = unit.pool.intern("()V");
        unit.routines.push(Routine {
            name,
            signature,
            has_receiver: false,
            local_count: 0,
            max_stack: 0,
            depth_table: Vec::new(),
            body: vec![0xEE],
        });
        match scan_unit(&unit).unwrap_err() {
            ScanError::BadRoutine { routine, source } => {
                assert_eq!(routine, "broken");
                assert_eq!(
                    source,
                    FormatError::UnknownOpcode {
                        opcode: 0xEE,
                        offset: 0
                    }
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
