//! Text rendering of units and routines, used by the `dump` command and the
//! debug trace sink.

use std::fmt::Write as _;

use crate::codec::FormatError;
use crate::instr::{decode_body, Instr};
use crate::unit::{Routine, StringPool, StrId, Unit};

/// Render a whole unit, one routine after another.
pub fn render_unit(unit: &Unit) -> Result<String, FormatError> {
    let mut out = format!("unit {} (version {})\n", unit.name_str(), unit.version);
    for routine in &unit.routines {
        out.push('\n');
        out.push_str(&render_routine(&unit.pool, routine)?);
    }
    Ok(out)
}

/// Render one routine: a header line and the decoded body, labels as
/// `L<n>:` lines and instructions numbered consecutively.
pub fn render_routine(pool: &StringPool, routine: &Routine) -> Result<String, FormatError> {
    let name = resolve(pool, routine.name)?;
    let signature = resolve(pool, routine.signature)?;
    let mut out = format!(
        "routine {name} {signature}{} locals={} stack={}\n",
        if routine.has_receiver { " receiver" } else { "" },
        routine.local_count,
        routine.max_stack,
    );
    let body = decode_body(&routine.body)?;
    let mut index = 0usize;
    for instr in &body.instrs {
        if let Instr::Label(id) = instr {
            let _ = writeln!(out, "  L{}:", id.0);
            continue;
        }
        let _ = writeln!(out, "{index:>5}  {}", render_instr(pool, instr)?);
        index += 1;
    }
    Ok(out)
}

fn render_instr(pool: &StringPool, instr: &Instr) -> Result<String, FormatError> {
    Ok(match *instr {
        Instr::Label(id) => format!("L{}:", id.0),
        Instr::ConstNull => "const_null".to_string(),
        Instr::ConstInt(v) => format!("const_int {v}"),
        Instr::New(ty) => format!("new {}", resolve(pool, ty)?),
        Instr::GetStatic { field, is_ref } => format!(
            "get_static {} {}",
            resolve(pool, field)?,
            if is_ref { "ref" } else { "int" }
        ),
        Instr::LoadSlot(slot) => format!("load_slot {slot}"),
        Instr::StoreSlot(slot) => format!("store_slot {slot}"),
        Instr::Dup => "dup".to_string(),
        Instr::Pop => "pop".to_string(),
        Instr::GetField(field) => format!("get_field {}", resolve(pool, field)?),
        Instr::CheckCast(ty) => format!("check_cast {}", resolve(pool, ty)?),
        Instr::Neg => "neg".to_string(),
        Instr::Add => "add".to_string(),
        Instr::ArrayGet => "array_get".to_string(),
        Instr::PutField(field) => format!("put_field {}", resolve(pool, field)?),
        Instr::Call { symbol, descriptor } => format!(
            "call {} {}",
            resolve(pool, symbol)?,
            resolve(pool, descriptor)?
        ),
        Instr::NewMulti { ty, dims } => {
            format!("new_multi {} dims={dims}", resolve(pool, ty)?)
        }
        Instr::Jump(label) => format!("jump L{}", label.0),
        Instr::JumpIfNull(label) => format!("jump_if_null L{}", label.0),
        Instr::Ret => "ret".to_string(),
        Instr::RetVoid => "ret_void".to_string(),
    })
}

fn resolve(pool: &StringPool, id: StrId) -> Result<&str, FormatError> {
    pool.get(id).ok_or(FormatError::BadStringIndex(id.0))
}
