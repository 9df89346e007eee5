//! Reference evaluator for compiled units.
//!
//! Interprets decoded routine bodies directly: enough machinery to observe
//! what rewritten units actually do at runtime (short-circuits, call order,
//! dereference failures) without a real host. Execution runs under explicit
//! limits on instruction count and call depth.
//!
//! The marker operation is the one symbol the evaluator refuses to run:
//! reaching it means the unit was never rewritten, which is a fatal
//! configuration error rather than a value.

use std::collections::HashMap;

use nullweave_ir::{
    decode_body, Body, FormatError, Instr, Signature, StrId, StringPool, TypeCode, Unit,
    MARKER_SYMBOL,
};
use thiserror::Error;

/// Heap handle, dense per machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Null,
    Int(i64),
    Ref(ObjId),
}

impl Value {
    pub fn is_null(self) -> bool {
        matches!(self, Value::Null)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("marker call executed at runtime: the unit was never rewritten")]
    MarkerUnrewritten,
    #[error("null dereference calling {symbol}")]
    NullReceiver { symbol: String },
    #[error("null dereference reading field {field}")]
    NullFieldAccess { field: String },
    #[error("null dereference indexing a container")]
    NullIndex,
    #[error("no routine bound to {symbol}")]
    UnknownRoutine { symbol: String },
    #[error("{symbol} takes {expected} arguments, got {given}")]
    ArityMismatch {
        symbol: String,
        expected: usize,
        given: usize,
    },
    #[error("type mismatch in {context}")]
    TypeMismatch { context: &'static str },
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("local slot {slot} out of range")]
    BadSlot { slot: u32 },
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("allocation with negative length {0}")]
    NegativeLength(i64),
    #[error("execution fell off the end of a routine body")]
    FellOffEnd,
    #[error("branch to unplaced label")]
    UnplacedLabel,
    #[error("instruction budget exceeded")]
    FuelExceeded,
    #[error("call depth limit exceeded")]
    CallDepthExceeded,
    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Execution limits for one [`Machine::run`].
#[derive(Debug, Clone)]
pub struct Limits {
    /// Instruction budget across all frames.
    pub fuel: u64,
    pub max_call_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            fuel: 1_000_000,
            max_call_depth: 64,
        }
    }
}

#[derive(Debug, Clone)]
enum HeapCell {
    Object(HashMap<String, Value>),
    Array(Vec<Value>),
}

/// A loaded set of units plus the mutable world they execute against.
#[derive(Debug, Default)]
pub struct Machine {
    units: Vec<Unit>,
    heap: Vec<HeapCell>,
    statics: HashMap<String, Value>,
    /// Symbols of routines that began executing, in order.
    trace: Vec<String>,
    limits: Limits,
}

impl Machine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn load(&mut self, unit: Unit) {
        self.units.push(unit);
    }

    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<(), FormatError> {
        self.load(Unit::decode(bytes)?);
        Ok(())
    }

    pub fn alloc_object(&mut self) -> Value {
        self.alloc(HeapCell::Object(HashMap::new()))
    }

    pub fn alloc_array(&mut self, len: usize) -> Value {
        self.alloc(HeapCell::Array(vec![Value::Null; len]))
    }

    fn alloc(&mut self, cell: HeapCell) -> Value {
        let id = ObjId(self.heap.len() as u32);
        self.heap.push(cell);
        Value::Ref(id)
    }

    pub fn set_field(&mut self, obj: Value, field: &str, value: Value) -> Result<(), EvalError> {
        let fields = self.object_mut(obj, field)?;
        fields.insert(field.to_string(), value);
        Ok(())
    }

    pub fn get_field(&self, obj: Value, field: &str) -> Result<Value, EvalError> {
        match obj {
            Value::Null => Err(EvalError::NullFieldAccess {
                field: field.to_string(),
            }),
            Value::Int(_) => Err(EvalError::TypeMismatch {
                context: "field access on an integer",
            }),
            Value::Ref(id) => match &self.heap[id.0 as usize] {
                HeapCell::Object(fields) => Ok(fields.get(field).copied().unwrap_or(Value::Null)),
                HeapCell::Array(_) => Err(EvalError::TypeMismatch {
                    context: "field access on an array",
                }),
            },
        }
    }

    pub fn set_static(&mut self, name: &str, value: Value) {
        self.statics.insert(name.to_string(), value);
    }

    pub fn set_element(&mut self, array: Value, index: usize, value: Value) -> Result<(), EvalError> {
        match array {
            Value::Ref(id) => match &mut self.heap[id.0 as usize] {
                HeapCell::Array(items) if index < items.len() => {
                    items[index] = value;
                    Ok(())
                }
                HeapCell::Array(items) => Err(EvalError::IndexOutOfBounds {
                    index: index as i64,
                    len: items.len(),
                }),
                HeapCell::Object(_) => Err(EvalError::TypeMismatch {
                    context: "indexed write to an object",
                }),
            },
            Value::Null => Err(EvalError::NullIndex),
            Value::Int(_) => Err(EvalError::TypeMismatch {
                context: "indexed write to an integer",
            }),
        }
    }

    /// Routines that actually began executing, in order.
    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    pub fn clear_trace(&mut self) {
        self.trace.clear();
    }

    /// Invoke `symbol` ("unit-name/routine") with `args`. `None` for void
    /// routines.
    pub fn run(&mut self, symbol: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
        let mut fuel = self.limits.fuel;
        self.call(symbol, args.to_vec(), 0, &mut fuel)
    }

    fn object_mut(
        &mut self,
        obj: Value,
        field: &str,
    ) -> Result<&mut HashMap<String, Value>, EvalError> {
        match obj {
            Value::Null => Err(EvalError::NullFieldAccess {
                field: field.to_string(),
            }),
            Value::Int(_) => Err(EvalError::TypeMismatch {
                context: "field access on an integer",
            }),
            Value::Ref(id) => match &mut self.heap[id.0 as usize] {
                HeapCell::Object(fields) => Ok(fields),
                HeapCell::Array(_) => Err(EvalError::TypeMismatch {
                    context: "field access on an array",
                }),
            },
        }
    }

    fn resolve(&self, symbol: &str) -> Result<ExecFrame, EvalError> {
        let unknown = || EvalError::UnknownRoutine {
            symbol: symbol.to_string(),
        };
        let (unit_name, routine_name) = symbol.rsplit_once('/').ok_or_else(unknown)?;
        let unit = self
            .units
            .iter()
            .find(|u| u.name_str() == unit_name)
            .ok_or_else(unknown)?;
        let routine = unit.routine(routine_name).ok_or_else(unknown)?;
        Ok(ExecFrame {
            body: decode_body(&routine.body)?,
            signature: Signature::parse(&unit.pool[routine.signature])?,
            pool: unit.pool.clone(),
            has_receiver: routine.has_receiver,
            local_count: routine.local_count,
        })
    }

    fn call(
        &mut self,
        symbol: &str,
        args: Vec<Value>,
        depth: usize,
        fuel: &mut u64,
    ) -> Result<Option<Value>, EvalError> {
        if symbol == MARKER_SYMBOL {
            return Err(EvalError::MarkerUnrewritten);
        }
        if depth >= self.limits.max_call_depth {
            return Err(EvalError::CallDepthExceeded);
        }
        let frame = self.resolve(symbol)?;
        if frame.signature.param_count() != args.len() {
            return Err(EvalError::ArityMismatch {
                symbol: symbol.to_string(),
                expected: frame.signature.param_count(),
                given: args.len(),
            });
        }
        if frame.has_receiver && args.first().is_some_and(|v| v.is_null()) {
            return Err(EvalError::NullReceiver {
                symbol: symbol.to_string(),
            });
        }
        self.trace.push(symbol.to_string());
        self.exec(frame, args, depth, fuel)
    }

    fn exec(
        &mut self,
        frame: ExecFrame,
        args: Vec<Value>,
        depth: usize,
        fuel: &mut u64,
    ) -> Result<Option<Value>, EvalError> {
        let ExecFrame {
            body,
            pool,
            local_count,
            ..
        } = frame;
        let labels = label_indices(&body);
        let mut locals = vec![Value::Null; (local_count as usize).max(args.len())];
        locals[..args.len()].copy_from_slice(&args);
        let mut stack: Vec<Value> = Vec::new();
        let mut pc = 0usize;

        loop {
            if *fuel == 0 {
                return Err(EvalError::FuelExceeded);
            }
            *fuel -= 1;
            let Some(instr) = body.instrs.get(pc) else {
                return Err(EvalError::FellOffEnd);
            };
            match *instr {
                Instr::Label(_) => {}
                Instr::ConstNull => stack.push(Value::Null),
                Instr::ConstInt(v) => stack.push(Value::Int(v)),
                Instr::New(_) => {
                    let obj = self.alloc_object();
                    stack.push(obj);
                }
                Instr::NewMulti { dims, .. } => {
                    let mut lens = Vec::with_capacity(dims as usize);
                    for _ in 0..dims {
                        lens.push(as_int(pop(&mut stack)?, "allocation length")?);
                    }
                    lens.reverse();
                    let outer = lens.first().copied().unwrap_or(0);
                    if outer < 0 {
                        return Err(EvalError::NegativeLength(outer));
                    }
                    // Inner dimensions stay null until written.
                    let array = self.alloc_array(outer as usize);
                    stack.push(array);
                }
                Instr::GetStatic { field, is_ref } => {
                    let name = resolve(&pool, field)?;
                    let default = if is_ref { Value::Null } else { Value::Int(0) };
                    stack.push(self.statics.get(name).copied().unwrap_or(default));
                }
                Instr::LoadSlot(slot) => {
                    let v = *locals
                        .get(slot as usize)
                        .ok_or(EvalError::BadSlot { slot })?;
                    stack.push(v);
                }
                Instr::StoreSlot(slot) => {
                    let v = pop(&mut stack)?;
                    let cell = locals
                        .get_mut(slot as usize)
                        .ok_or(EvalError::BadSlot { slot })?;
                    *cell = v;
                }
                Instr::Dup => {
                    let v = *stack.last().ok_or(EvalError::StackUnderflow)?;
                    stack.push(v);
                }
                Instr::Pop => {
                    pop(&mut stack)?;
                }
                Instr::GetField(field) => {
                    let obj = pop(&mut stack)?;
                    let v = self.get_field(obj, resolve(&pool, field)?)?;
                    stack.push(v);
                }
                Instr::PutField(field) => {
                    let value = pop(&mut stack)?;
                    let obj = pop(&mut stack)?;
                    self.set_field(obj, resolve(&pool, field)?, value)?;
                }
                Instr::CheckCast(_) => {
                    // Casts are identities here; null passes through.
                }
                Instr::Neg => {
                    let v = as_int(pop(&mut stack)?, "negation")?;
                    stack.push(Value::Int(v.wrapping_neg()));
                }
                Instr::Add => {
                    let b = as_int(pop(&mut stack)?, "addition")?;
                    let a = as_int(pop(&mut stack)?, "addition")?;
                    stack.push(Value::Int(a.wrapping_add(b)));
                }
                Instr::ArrayGet => {
                    let index = as_int(pop(&mut stack)?, "indexing")?;
                    let array = pop(&mut stack)?;
                    stack.push(self.array_get(array, index)?);
                }
                Instr::Call { symbol, descriptor } => {
                    let callee = resolve(&pool, symbol)?.to_string();
                    let sig = Signature::parse(resolve(&pool, descriptor)?)?;
                    let mut call_args = Vec::with_capacity(sig.param_count());
                    for _ in 0..sig.param_count() {
                        call_args.push(pop(&mut stack)?);
                    }
                    call_args.reverse();
                    let returned = self.call(&callee, call_args, depth + 1, fuel)?;
                    if sig.ret != TypeCode::Void {
                        stack.push(returned.ok_or(EvalError::TypeMismatch {
                            context: "call produced no value",
                        })?);
                    }
                }
                Instr::Jump(label) => {
                    pc = *labels
                        .get(label.0 as usize)
                        .and_then(|t| t.as_ref())
                        .ok_or(EvalError::UnplacedLabel)?;
                    continue;
                }
                Instr::JumpIfNull(label) => {
                    if pop(&mut stack)?.is_null() {
                        pc = *labels
                            .get(label.0 as usize)
                            .and_then(|t| t.as_ref())
                            .ok_or(EvalError::UnplacedLabel)?;
                        continue;
                    }
                }
                Instr::Ret => {
                    let v = pop(&mut stack)?;
                    return Ok(Some(v));
                }
                Instr::RetVoid => return Ok(None),
            }
            pc += 1;
        }
    }

    fn array_get(&self, array: Value, index: i64) -> Result<Value, EvalError> {
        match array {
            Value::Null => Err(EvalError::NullIndex),
            Value::Int(_) => Err(EvalError::TypeMismatch {
                context: "indexing an integer",
            }),
            Value::Ref(id) => match &self.heap[id.0 as usize] {
                HeapCell::Array(items) => {
                    let len = items.len();
                    usize::try_from(index)
                        .ok()
                        .and_then(|i| items.get(i).copied())
                        .ok_or(EvalError::IndexOutOfBounds { index, len })
                }
                HeapCell::Object(_) => Err(EvalError::TypeMismatch {
                    context: "indexing an object",
                }),
            },
        }
    }
}

struct ExecFrame {
    body: Body,
    signature: Signature,
    pool: StringPool,
    has_receiver: bool,
    local_count: u32,
}

fn label_indices(body: &Body) -> Vec<Option<usize>> {
    let mut labels = vec![None; body.label_count as usize];
    for (index, instr) in body.instrs.iter().enumerate() {
        if let Instr::Label(id) = instr {
            if let Some(slot) = labels.get_mut(id.0 as usize) {
                *slot = Some(index);
            }
        }
    }
    labels
}

fn resolve(pool: &StringPool, id: StrId) -> Result<&str, EvalError> {
    pool.get(id)
        .ok_or(EvalError::Format(FormatError::BadStringIndex(id.0)))
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, EvalError> {
    stack.pop().ok_or(EvalError::StackUnderflow)
}

fn as_int(v: Value, context: &'static str) -> Result<i64, EvalError> {
    match v {
        Value::Int(n) => Ok(n),
        _ => Err(EvalError::TypeMismatch { context }),
    }
}

#[cfg(test)]
mod tests {
    use nullweave_ir::{assemble, Routine, VERSION_MODERN};
    use pretty_assertions::assert_eq;

    use super::*;

    fn unit_with(
        name: &str,
        build: impl FnOnce(&mut StringPool) -> Vec<(&'static str, &'static str, bool, u32, Vec<Instr>)>,
    ) -> Unit {
        let mut unit = Unit::new(VERSION_MODERN, name);
        for (rname, desc, has_receiver, local_count, instrs) in build(&mut unit.pool) {
            let assembled = assemble(&instrs, &unit.pool).unwrap();
            let rname = unit.pool.intern(rname);
            let signature = unit.pool.intern(desc);
            unit.routines.push(Routine {
                name: rname,
                signature,
                has_receiver,
                local_count,
                max_stack: assembled.max_stack,
                depth_table: assembled.depth_table,
                body: assembled.bytes,
            });
        }
        unit
    }

    #[test]
    fn identity_routine_returns_its_argument() {
        let unit = unit_with("app/a", |_| {
            vec![(
                "id",
                "(R)R",
                false,
                1,
                vec![Instr::LoadSlot(0), Instr::Ret],
            )]
        });
        let mut m = Machine::new();
        m.load(unit);
        let obj = m.alloc_object();
        assert_eq!(m.run("app/a/id", &[obj]).unwrap(), Some(obj));
        assert_eq!(m.trace(), vec!["app/a/id"]);
    }

    #[test]
    fn field_getter_reads_the_heap() {
        let unit = unit_with("app/a", |pool| {
            let field = pool.intern("b");
            vec![(
                "get_b",
                "(R)R",
                true,
                1,
                vec![Instr::LoadSlot(0), Instr::GetField(field), Instr::Ret],
            )]
        });
        let mut m = Machine::new();
        m.load(unit);
        let a = m.alloc_object();
        let b = m.alloc_object();
        m.set_field(a, "b", b).unwrap();
        assert_eq!(m.run("app/a/get_b", &[a]).unwrap(), Some(b));
        // Unset fields read as null.
        assert_eq!(m.run("app/a/get_b", &[b]).unwrap(), Some(Value::Null));
    }

    #[test]
    fn calling_a_receiver_routine_on_null_fails() {
        let unit = unit_with("app/a", |_| {
            vec![(
                "get_b",
                "(R)R",
                true,
                1,
                vec![Instr::LoadSlot(0), Instr::Ret],
            )]
        });
        let mut m = Machine::new();
        m.load(unit);
        let err = m.run("app/a/get_b", &[Value::Null]).unwrap_err();
        assert_eq!(
            err,
            EvalError::NullReceiver {
                symbol: "app/a/get_b".to_string()
            }
        );
        // The routine never began executing.
        assert!(m.trace().is_empty());
    }

    #[test]
    fn executing_the_marker_is_a_configuration_error() {
        let unit = unit_with("app/a", |pool| {
            let symbol = pool.intern(MARKER_SYMBOL);
            let descriptor = pool.intern(nullweave_ir::MARKER_DESCRIPTOR);
            vec![(
                "f",
                "(R)R",
                false,
                1,
                vec![
                    Instr::LoadSlot(0),
                    Instr::Call { symbol, descriptor },
                    Instr::Ret,
                ],
            )]
        });
        let mut m = Machine::new();
        m.load(unit);
        let err = m.run("app/a/f", &[Value::Null]).unwrap_err();
        assert_eq!(err, EvalError::MarkerUnrewritten);
    }

    #[test]
    fn indexing_a_null_container_fails() {
        let unit = unit_with("app/a", |_| {
            vec![(
                "first",
                "(A)R",
                false,
                1,
                vec![
                    Instr::LoadSlot(0),
                    Instr::ConstInt(0),
                    Instr::ArrayGet,
                    Instr::Ret,
                ],
            )]
        });
        let mut m = Machine::new();
        m.load(unit);
        assert_eq!(
            m.run("app/a/first", &[Value::Null]).unwrap_err(),
            EvalError::NullIndex
        );
        let arr = m.alloc_array(2);
        let x = m.alloc_object();
        m.set_element(arr, 0, x).unwrap();
        assert_eq!(m.run("app/a/first", &[arr]).unwrap(), Some(x));
        assert_eq!(
            m.run("app/a/first", &[Value::Int(3)]).unwrap_err(),
            EvalError::TypeMismatch {
                context: "indexing an integer"
            }
        );
    }

    #[test]
    fn arithmetic_and_statics() {
        let unit = unit_with("app/a", |pool| {
            let counter = pool.intern("counter");
            vec![
                (
                    "sum_neg",
                    "(II)I",
                    false,
                    2,
                    vec![
                        Instr::LoadSlot(0),
                        Instr::LoadSlot(1),
                        Instr::Add,
                        Instr::Neg,
                        Instr::Ret,
                    ],
                ),
                (
                    "read_counter",
                    "()I",
                    false,
                    0,
                    vec![
                        Instr::GetStatic {
                            field: counter,
                            is_ref: false,
                        },
                        Instr::Ret,
                    ],
                ),
            ]
        });
        let mut m = Machine::new();
        m.load(unit);
        assert_eq!(
            m.run("app/a/sum_neg", &[Value::Int(2), Value::Int(3)]).unwrap(),
            Some(Value::Int(-5))
        );
        assert_eq!(m.run("app/a/read_counter", &[]).unwrap(), Some(Value::Int(0)));
        m.set_static("counter", Value::Int(41));
        assert_eq!(
            m.run("app/a/read_counter", &[]).unwrap(),
            Some(Value::Int(41))
        );
    }

    #[test]
    fn runaway_loops_burn_out() {
        let unit = unit_with("app/a", |_| {
            vec![(
                "spin",
                "()V",
                false,
                0,
                vec![
                    Instr::Label(nullweave_ir::LabelId(0)),
                    Instr::Jump(nullweave_ir::LabelId(0)),
                ],
            )]
        });
        let mut m = Machine::with_limits(Limits {
            fuel: 1_000,
            max_call_depth: 4,
        });
        m.load(unit);
        assert_eq!(m.run("app/a/spin", &[]).unwrap_err(), EvalError::FuelExceeded);
    }

    #[test]
    fn unbounded_recursion_hits_the_depth_limit() {
        let unit = unit_with("app/a", |pool| {
            let symbol = pool.intern("app/a/rec");
            let descriptor = pool.intern("()V");
            vec![(
                "rec",
                "()V",
                false,
                0,
                vec![Instr::Call { symbol, descriptor }, Instr::RetVoid],
            )]
        });
        let mut m = Machine::with_limits(Limits {
            fuel: 1_000_000,
            max_call_depth: 8,
        });
        m.load(unit);
        assert_eq!(
            m.run("app/a/rec", &[]).unwrap_err(),
            EvalError::CallDepthExceeded
        );
    }

    #[test]
    fn unknown_symbols_are_reported() {
        let mut m = Machine::new();
        assert_eq!(
            m.run("app/missing/f", &[]).unwrap_err(),
            EvalError::UnknownRoutine {
                symbol: "app/missing/f".to_string()
            }
        );
    }
}
