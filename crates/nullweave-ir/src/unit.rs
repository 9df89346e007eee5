//! Compiled-unit container: string pool, routine records, signature
//! descriptors, and the `.nwu` decode/encode paths.
//!
//! A unit file is `b"NWUF"`, a little-endian u16 version, the string pool,
//! the unit name (a pool index), and the routine records. Version 1 is the
//! legacy format; version 2 additionally carries a per-routine depth table,
//! the verification metadata mapping each jump target to its operand-stack
//! depth.

use std::ops::Index;

use crate::codec::{FormatError, Reader, Writer};

pub const MAGIC: [u8; 4] = *b"NWUF";
/// Legacy format: no verification metadata.
pub const VERSION_LEGACY: u16 = 1;
/// Modern format: routines carry a depth table.
pub const VERSION_MODERN: u16 = 2;

/// Qualified symbol of the marker operation. A call to this symbol with the
/// identity descriptor delimits a chain to be made null-safe.
pub const MARKER_SYMBOL: &str = "nullweave/mark";
/// The marker's identity shape: one reference in, the same reference out.
pub const MARKER_DESCRIPTOR: &str = "(R)R";

/// Index into a unit's string pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrId(pub u32);

/// Deduplicating pool of the strings a unit refers to: the unit name,
/// routine names, signatures, field and type names, call symbols.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Add a string, reusing an existing entry when present.
    pub fn intern(&mut self, s: &str) -> StrId {
        if let Some(pos) = self.strings.iter().position(|e| e == s) {
            return StrId(pos as u32);
        }
        self.strings.push(s.to_string());
        StrId((self.strings.len() - 1) as u32)
    }

    pub fn get(&self, id: StrId) -> Option<&str> {
        self.strings.get(id.0 as usize).map(String::as_str)
    }

    fn check(&self, id: StrId) -> Result<(), FormatError> {
        if (id.0 as usize) < self.strings.len() {
            Ok(())
        } else {
            Err(FormatError::BadStringIndex(id.0))
        }
    }
}

/// Indexing with a pool id the unit itself produced. Out-of-range ids are
/// rejected at decode time, so this panics only on a caller-side bug.
impl Index<StrId> for StringPool {
    type Output = str;

    fn index(&self, id: StrId) -> &str {
        &self.strings[id.0 as usize]
    }
}

/// One-letter type codes used in signature descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCode {
    Int,
    Ref,
    Array,
    Void,
}

impl TypeCode {
    pub fn is_reference(self) -> bool {
        matches!(self, TypeCode::Ref | TypeCode::Array)
    }
}

/// A parsed signature descriptor: `( params ) ret` over `I`, `R`, `A`, and
/// `V` (return position only). The receiver, when a routine has one, is
/// parameter 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<TypeCode>,
    pub ret: TypeCode,
}

impl Signature {
    pub fn parse(desc: &str) -> Result<Self, FormatError> {
        let bad = || FormatError::BadDescriptor(desc.to_string());
        let rest = desc.strip_prefix('(').ok_or_else(bad)?;
        let (param_str, ret_str) = rest.split_once(')').ok_or_else(bad)?;
        let mut params = Vec::with_capacity(param_str.len());
        for c in param_str.chars() {
            params.push(match c {
                'I' => TypeCode::Int,
                'R' => TypeCode::Ref,
                'A' => TypeCode::Array,
                _ => return Err(bad()),
            });
        }
        let ret = match ret_str {
            "I" => TypeCode::Int,
            "R" => TypeCode::Ref,
            "A" => TypeCode::Array,
            "V" => TypeCode::Void,
            _ => return Err(bad()),
        };
        Ok(Self { params, ret })
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn returns_reference(&self) -> bool {
        self.ret.is_reference()
    }
}

/// One routine of a unit. The body stays in encoded form so unflagged
/// routines can be copied through bit-identically; [`crate::decode_body`]
/// lifts it to instructions on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routine {
    pub name: StrId,
    pub signature: StrId,
    /// Local slot 0 holds the receiver.
    pub has_receiver: bool,
    pub local_count: u32,
    /// Operand-stack high-water mark.
    pub max_stack: u32,
    /// `(body offset, stack depth)` per jump target; empty in version 1.
    pub depth_table: Vec<(u32, u32)>,
    pub body: Vec<u8>,
}

const FLAG_HAS_RECEIVER: u8 = 0x01;

/// A decoded compiled unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub version: u16,
    pub pool: StringPool,
    pub name: StrId,
    pub routines: Vec<Routine>,
}

impl Unit {
    /// Create an empty unit with the given fully-qualified name.
    pub fn new(version: u16, name: &str) -> Self {
        let mut pool = StringPool::new();
        let name = pool.intern(name);
        Self {
            version,
            pool,
            name,
            routines: Vec::new(),
        }
    }

    pub fn name_str(&self) -> &str {
        &self.pool[self.name]
    }

    /// Whether this unit's format version carries verification metadata.
    pub fn is_modern(&self) -> bool {
        self.version >= VERSION_MODERN
    }

    pub fn routine(&self, name: &str) -> Option<&Routine> {
        self.routines.iter().find(|r| &self.pool[r.name] == name)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut r = Reader::new(bytes);
        if r.read_bytes(4)? != MAGIC {
            return Err(FormatError::BadMagic);
        }
        let version = r.read_u16_le()?;
        if !(VERSION_LEGACY..=VERSION_MODERN).contains(&version) {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let mut pool = StringPool::new();
        let pool_len = r.read_uleb_u32()?;
        for _ in 0..pool_len {
            let s = r.read_str()?;
            pool.strings.push(s.to_string());
        }

        let name = StrId(r.read_uleb_u32()?);
        pool.check(name)?;

        let routine_count = r.read_uleb_u32()?;
        let mut routines = Vec::with_capacity(routine_count as usize);
        for _ in 0..routine_count {
            let name = StrId(r.read_uleb_u32()?);
            pool.check(name)?;
            let signature = StrId(r.read_uleb_u32()?);
            pool.check(signature)?;
            Signature::parse(&pool[signature])?;
            let flags = r.read_u8()?;
            let local_count = r.read_uleb_u32()?;
            let max_stack = r.read_uleb_u32()?;
            let mut depth_table = Vec::new();
            if version >= VERSION_MODERN {
                let entries = r.read_uleb_u32()?;
                depth_table.reserve(entries as usize);
                for _ in 0..entries {
                    let offset = r.read_uleb_u32()?;
                    let depth = r.read_uleb_u32()?;
                    depth_table.push((offset, depth));
                }
            }
            let body_len = r.read_uleb_u32()? as usize;
            let body = r.read_bytes(body_len)?.to_vec();
            routines.push(Routine {
                name,
                signature,
                has_receiver: flags & FLAG_HAS_RECEIVER != 0,
                local_count,
                max_stack,
                depth_table,
                body,
            });
        }
        Ok(Self {
            version,
            pool,
            name,
            routines,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_bytes(&MAGIC);
        w.write_u16_le(self.version);
        w.write_uleb(self.pool.strings.len() as u64);
        for s in &self.pool.strings {
            w.write_str(s);
        }
        w.write_uleb(u64::from(self.name.0));
        w.write_uleb(self.routines.len() as u64);
        for routine in &self.routines {
            w.write_uleb(u64::from(routine.name.0));
            w.write_uleb(u64::from(routine.signature.0));
            let mut flags = 0u8;
            if routine.has_receiver {
                flags |= FLAG_HAS_RECEIVER;
            }
            w.write_u8(flags);
            w.write_uleb(u64::from(routine.local_count));
            w.write_uleb(u64::from(routine.max_stack));
            if self.version >= VERSION_MODERN {
                w.write_uleb(routine.depth_table.len() as u64);
                for &(offset, depth) in &routine.depth_table {
                    w.write_uleb(u64::from(offset));
                    w.write_uleb(u64::from(depth));
                }
            }
            w.write_uleb(routine.body.len() as u64);
            w.write_bytes(&routine.body);
        }
        w.into_vec()
    }
}
