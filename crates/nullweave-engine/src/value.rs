//! Annotated values: the per-instruction result abstraction the analysis
//! computes and the guard walk consumes.
//!
//! Values are immutable once allocated and live in an arena scoped to one
//! routine's analysis pass; ids never escape that pass. Each value records
//! where it was defined, the ordered values consumed to produce it, whether
//! producing it dereferences its first input, and whether it can be null.

use std::ops::Index;

/// Index into a [`ValueArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub u32);

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Definition {
    /// Routine parameter, sitting in its local slot on entry.
    Param { slot: u32 },
    /// Result of the instruction at this index in the decoded body.
    Instr { index: usize },
}

/// Coarse value kind, used only to detect conflicting merges. `Unknown`
/// merges with anything (field and array-element reads carry no declared
/// type in the unit format).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Ref,
    Unknown,
}

impl ValueKind {
    pub fn compatible(self, other: ValueKind) -> bool {
        self == other || self == ValueKind::Unknown || other == ValueKind::Unknown
    }
}

/// One abstractly-interpreted result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedValue {
    pub def: Definition,
    /// Values consumed to produce this one, in stack order. Deliberately
    /// empty for slot copies so resolved nullability is not re-derived
    /// through a binding.
    pub inputs: Vec<ValueId>,
    /// Evaluating the defining instruction requires `inputs[0]` to be a
    /// valid non-null reference.
    pub derefs_primary: bool,
    /// The defining instruction can legitimately yield null.
    pub nullable: bool,
    pub kind: ValueKind,
}

impl AnnotatedValue {
    pub fn def_index(&self) -> Option<usize> {
        match self.def {
            Definition::Instr { index } => Some(index),
            Definition::Param { .. } => None,
        }
    }
}

/// Arena holding every value of one analysis pass.
#[derive(Debug, Default)]
pub struct ValueArena {
    values: Vec<AnnotatedValue>,
}

impl ValueArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn alloc(&mut self, value: AnnotatedValue) -> ValueId {
        self.values.push(value);
        ValueId((self.values.len() - 1) as u32)
    }
}

/// Ids are handed out by this arena and never cross passes, so indexing
/// panics only on a caller-side bug.
impl Index<ValueId> for ValueArena {
    type Output = AnnotatedValue;

    fn index(&self, id: ValueId) -> &AnnotatedValue {
        &self.values[id.0 as usize]
    }
}
