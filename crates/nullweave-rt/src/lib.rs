//! Nullweave runtime — reference evaluator and the marker fail-safe.
//!
//! Rewriting is meant to happen before execution; this crate is what
//! "execution" means for compiled units in tests and diagnostics. Its one
//! hard rule is the fail-safe: evaluating a marker call that survived to
//! runtime is a fatal configuration error, never a silent identity.

pub mod eval;

pub use eval::{EvalError, Limits, Machine, ObjId, Value};
