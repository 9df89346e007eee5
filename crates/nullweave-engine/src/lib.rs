//! Nullweave engine — marker-driven null-safe chain rewriting.
//!
//! The pipeline per unit: scan for marker calls ([`scan`]), abstractly
//! interpret each flagged routine into a value graph ([`flow`] and
//! [`value`]), weave short-circuit guards along each marked chain
//! ([`guard`]), then reassemble with recomputed metadata ([`rewrite`]).
//! Input bytes in, output bytes out; no I/O, no retained state beyond the
//! immutable [`RewriteOptions`].

pub mod flow;
pub mod guard;
pub mod options;
pub mod rewrite;
pub mod scan;
pub mod value;

pub use flow::{analyze, Analysis, AnalysisError, Frame, Local};
pub use guard::{weave_guards, EditList, ReassemblyError};
pub use options::{RewriteOptions, DEFAULT_EXCLUSIONS};
pub use rewrite::{Engine, RewriteError};
pub use scan::{scan_unit, Flagged, ScanError};
pub use value::{AnnotatedValue, Definition, ValueArena, ValueId, ValueKind};
