//! Binary module format executed by the VM.
//!
//! ```text
//! "GLYP" | u32 version | constants | functions | u32 code_len | code
//! ```
//!
//! Every integer is little-endian. Instructions are one opcode byte followed
//! by zero, one or two `u32` operands; jump operands are absolute offsets
//! into the code section.

use crate::value::Value;

pub mod disasm;
pub mod image;

pub use disasm::disassemble;
pub use image::{EntryKind, ImageEntry, ProgramImage};

pub const MAGIC: [u8; 4] = *b"GLYP";
pub const VERSION: u32 = 1;
pub const HEADER_LEN: usize = 8;

// ── Opcodes ──────────────────────────────────────────────────────────

pub const OP_PUSH: u8 = 0x01; // const
pub const OP_POP: u8 = 0x02;

pub const OP_ADD: u8 = 0x10;
pub const OP_SUB: u8 = 0x11;
pub const OP_MUL: u8 = 0x12;
pub const OP_DIV: u8 = 0x13;
pub const OP_MOD: u8 = 0x14;
pub const OP_CONCAT: u8 = 0x15;

pub const OP_EQ: u8 = 0x20;
pub const OP_NE: u8 = 0x21;
pub const OP_LT: u8 = 0x22;
pub const OP_GT: u8 = 0x23;
pub const OP_GE: u8 = 0x24;
pub const OP_LE: u8 = 0x25;
pub const OP_AND: u8 = 0x26;
pub const OP_OR: u8 = 0x27;
pub const OP_NOT: u8 = 0x28;
pub const OP_NEG: u8 = 0x29;

pub const OP_LOAD: u8 = 0x40; // name const
pub const OP_STORE: u8 = 0x41; // name const

pub const OP_JUMP: u8 = 0x50; // target
pub const OP_JUMP_IF_FALSE: u8 = 0x51; // target
pub const OP_JUMP_IF_TRUE: u8 = 0x52; // target
pub const OP_GET_ITER: u8 = 0x53;
pub const OP_ITER_NEXT: u8 = 0x54; // with_key
pub const OP_ITER_HAS_NEXT: u8 = 0x55;
pub const OP_GET_INDEX: u8 = 0x56;
pub const OP_ITER_RELEASE: u8 = 0x57;

pub const OP_RETURN: u8 = 0x61;
pub const OP_CALL: u8 = 0x62; // name const, argc
pub const OP_CALL_VOID: u8 = 0x63; // name const, argc

pub const OP_BUILD_OBJECT: u8 = 0x70; // pair count
pub const OP_GET_FIELD: u8 = 0x71; // name const
pub const OP_BUILD_ARRAY: u8 = 0x80; // element count

pub const OP_HALT: u8 = 0xFF;

/// Mnemonic and operand count, or `None` for an unassigned byte.
pub fn op_info(op: u8) -> Option<(&'static str, usize)> {
    Some(match op {
        OP_PUSH => ("PUSH", 1),
        OP_POP => ("POP", 0),
        OP_ADD => ("ADD", 0),
        OP_SUB => ("SUB", 0),
        OP_MUL => ("MUL", 0),
        OP_DIV => ("DIV", 0),
        OP_MOD => ("MOD", 0),
        OP_CONCAT => ("CONCAT", 0),
        OP_EQ => ("EQ", 0),
        OP_NE => ("NE", 0),
        OP_LT => ("LT", 0),
        OP_GT => ("GT", 0),
        OP_GE => ("GE", 0),
        OP_LE => ("LE", 0),
        OP_AND => ("AND", 0),
        OP_OR => ("OR", 0),
        OP_NOT => ("NOT", 0),
        OP_NEG => ("NEG", 0),
        OP_LOAD => ("LOAD", 1),
        OP_STORE => ("STORE", 1),
        OP_JUMP => ("JUMP", 1),
        OP_JUMP_IF_FALSE => ("JUMP_IF_FALSE", 1),
        OP_JUMP_IF_TRUE => ("JUMP_IF_TRUE", 1),
        OP_GET_ITER => ("GET_ITER", 0),
        OP_ITER_NEXT => ("ITER_NEXT", 1),
        OP_ITER_HAS_NEXT => ("ITER_HAS_NEXT", 0),
        OP_GET_INDEX => ("GET_INDEX", 0),
        OP_ITER_RELEASE => ("ITER_RELEASE", 0),
        OP_RETURN => ("RETURN", 0),
        OP_CALL => ("CALL", 2),
        OP_CALL_VOID => ("CALL_VOID", 2),
        OP_BUILD_OBJECT => ("BUILD_OBJECT", 1),
        OP_GET_FIELD => ("GET_FIELD", 1),
        OP_BUILD_ARRAY => ("BUILD_ARRAY", 1),
        OP_HALT => ("HALT", 0),
        _ => return None,
    })
}

const TAG_NULL: u8 = 0x00;
const TAG_INT: u8 = 0x01;
const TAG_FLOAT: u8 = 0x02;
const TAG_BOOL: u8 = 0x03;
const TAG_STR: u8 = 0x04;
const TAG_ARRAY: u8 = 0x05;
const TAG_OBJECT: u8 = 0x06;

/// Composite constants nest at most this deep.
const MAX_CONSTANT_DEPTH: usize = 64;

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("bytecode too short: {len} bytes, need at least {HEADER_LEN}")]
    TooShort { len: usize },
    #[error("bad magic {found:02x?}, expected \"GLYP\"")]
    BadMagic { found: [u8; 4] },
    #[error("unsupported bytecode version {version}, expected {VERSION}")]
    UnsupportedVersion { version: u32 },
    #[error("truncated {what} at byte {offset}")]
    Truncated { what: &'static str, offset: usize },
    #[error("unknown constant tag 0x{tag:02x} at byte {offset}")]
    BadConstantTag { tag: u8, offset: usize },
    #[error("constant string is not valid UTF-8 at byte {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("constant nested deeper than {MAX_CONSTANT_DEPTH} at byte {offset}")]
    ConstantTooDeep { offset: usize },
    #[error("invalid function table: {reason}")]
    BadFunction { reason: String },
    #[error("{0} trailing bytes after code section")]
    TrailingBytes(usize),
}

impl DecodeError {
    /// Header errors are raised before anything past byte 8 is looked at.
    pub fn is_header(&self) -> bool {
        matches!(
            self,
            DecodeError::TooShort { .. } | DecodeError::BadMagic { .. } | DecodeError::UnsupportedVersion { .. }
        )
    }
}

/// Check magic and version without decoding the rest.
pub fn check_header(bytes: &[u8]) -> Result<u32, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::TooShort { len: bytes.len() });
    }
    let found = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if found != MAGIC {
        return Err(DecodeError::BadMagic { found });
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion { version });
    }
    Ok(version)
}

// ── Module ───────────────────────────────────────────────────────────

/// A user function embedded in a module.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionEntry {
    pub name: String,
    /// Offset of the first instruction in the code section.
    pub entry: u32,
    pub params: Vec<String>,
    pub(crate) name_const: u32,
    pub(crate) param_consts: Vec<u32>,
}

impl FunctionEntry {
    pub fn new(name_const: u32, entry: u32, param_consts: Vec<u32>, constants: &[Value]) -> Self {
        let text = |idx: u32| constants.get(idx as usize).and_then(Value::as_str).unwrap_or_default().to_string();
        FunctionEntry {
            name: text(name_const),
            entry,
            params: param_consts.iter().map(|&i| text(i)).collect(),
            name_const,
            param_consts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BytecodeModule {
    pub constants: Vec<Value>,
    pub functions: Vec<FunctionEntry>,
    pub code: Vec<u8>,
}

impl BytecodeModule {
    pub fn constant(&self, idx: u32) -> Option<&Value> {
        self.constants.get(idx as usize)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionEntry> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.code.len() + 16 * self.constants.len());
        out.extend_from_slice(&MAGIC);
        put_u32(&mut out, VERSION);

        put_u32(&mut out, self.constants.len() as u32);
        for c in &self.constants {
            put_constant(&mut out, c);
        }

        put_u32(&mut out, self.functions.len() as u32);
        for f in &self.functions {
            put_u32(&mut out, f.name_const);
            put_u32(&mut out, f.entry);
            put_u32(&mut out, f.param_consts.len() as u32);
            for &p in &f.param_consts {
                put_u32(&mut out, p);
            }
        }

        put_u32(&mut out, self.code.len() as u32);
        out.extend_from_slice(&self.code);
        out
    }

    /// Decode and validate a module. The header is checked first, so short or
    /// foreign input is rejected without touching the body.
    pub fn decode(bytes: &[u8]) -> Result<BytecodeModule, DecodeError> {
        check_header(bytes)?;
        let mut r = Reader { bytes, pos: HEADER_LEN };

        let count = r.u32("constant count")?;
        let mut constants = Vec::with_capacity((count as usize).min(bytes.len()));
        for _ in 0..count {
            constants.push(r.constant(0)?);
        }

        let fn_count = r.u32("function count")?;
        let mut raw_functions = Vec::new();
        for _ in 0..fn_count {
            let name_const = r.u32("function name")?;
            let entry = r.u32("function entry")?;
            let argc = r.u32("parameter count")?;
            let mut params = Vec::new();
            for _ in 0..argc {
                params.push(r.u32("parameter name")?);
            }
            raw_functions.push((name_const, entry, params));
        }

        let code_len = r.u32("code length")? as usize;
        let code = r.take(code_len, "code section")?.to_vec();
        if r.pos != bytes.len() {
            return Err(DecodeError::TrailingBytes(bytes.len() - r.pos));
        }

        let is_name = |idx: u32| matches!(constants.get(idx as usize), Some(Value::Str(_)));
        let mut functions = Vec::with_capacity(raw_functions.len());
        for (name_const, entry, params) in raw_functions {
            if !is_name(name_const) || !params.iter().all(|&p| is_name(p)) {
                return Err(DecodeError::BadFunction {
                    reason: format!("name constant {} is not a string", name_const),
                });
            }
            if entry as usize >= code.len() {
                return Err(DecodeError::BadFunction {
                    reason: format!("entry {} outside code of length {}", entry, code.len()),
                });
            }
            functions.push(FunctionEntry::new(name_const, entry, params, &constants));
        }

        Ok(BytecodeModule { constants, functions, code })
    }
}

pub(crate) fn put_u32(out: &mut Vec<u8>, n: u32) {
    out.extend_from_slice(&n.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

/// The compiler only pools scalars, but hand-built modules may carry
/// arrays and objects; those encode element by element.
fn put_constant(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Int(n) => {
            out.push(TAG_INT);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Value::Float(x) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&x.to_bits().to_le_bytes());
        }
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(*b as u8);
        }
        Value::Str(s) => {
            out.push(TAG_STR);
            put_str(out, s);
        }
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            put_u32(out, items.len() as u32);
            for item in items {
                put_constant(out, item);
            }
        }
        Value::Object(fields) => {
            out.push(TAG_OBJECT);
            put_u32(out, fields.len() as u32);
            for (key, item) in fields {
                put_str(out, key);
                put_constant(out, item);
            }
        }
    }
}

pub(crate) struct Reader<'a> {
    pub(crate) bytes: &'a [u8],
    pub(crate) pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len());
        let Some(end) = end else {
            return Err(DecodeError::Truncated { what, offset: self.pos });
        };
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], DecodeError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N, what)?);
        Ok(buf)
    }

    pub(crate) fn u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array(what)?))
    }

    fn string(&mut self, what: &'static str) -> Result<String, DecodeError> {
        let offset = self.pos;
        let len = self.u32("string length")? as usize;
        let raw = self.take(len, what)?;
        let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8 { offset })?;
        Ok(s.to_string())
    }

    fn constant(&mut self, depth: usize) -> Result<Value, DecodeError> {
        let offset = self.pos;
        if depth > MAX_CONSTANT_DEPTH {
            return Err(DecodeError::ConstantTooDeep { offset });
        }
        Ok(match self.u8("constant tag")? {
            TAG_NULL => Value::Null,
            TAG_INT => Value::Int(i64::from_le_bytes(self.array("int constant")?)),
            TAG_FLOAT => Value::Float(f64::from_bits(u64::from_le_bytes(self.array("float constant")?))),
            TAG_BOOL => Value::Bool(self.u8("bool constant")? != 0),
            TAG_STR => Value::Str(self.string("string constant")?),
            TAG_ARRAY => {
                let len = self.u32("array length")?;
                let mut items = Vec::new();
                for _ in 0..len {
                    items.push(self.constant(depth + 1)?);
                }
                Value::Array(items)
            }
            TAG_OBJECT => {
                let len = self.u32("object length")?;
                let mut fields = std::collections::BTreeMap::new();
                for _ in 0..len {
                    let key = self.string("object key")?;
                    fields.insert(key, self.constant(depth + 1)?);
                }
                Value::Object(fields)
            }
            tag => return Err(DecodeError::BadConstantTag { tag, offset }),
        })
    }
}

/// Read the `u32` operand at `pos` in a code section.
#[inline]
pub fn read_u32(code: &[u8], pos: usize) -> Option<u32> {
    let bytes = code.get(pos..pos + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
