//! Stack virtual machine for compiled modules.
//!
//! One [`Vm`] is one execution context: an operand stack, a name-keyed
//! locals table, an iterator table and a call-frame stack. Instances share
//! nothing but an optional [`HostCallBridge`], so independent VMs can run
//! on independent threads.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument, trace};

use crate::ast::BinOp;
use crate::builtins::{Builtin, BuiltinError};
use crate::bytecode::*;
use crate::host::{self, HostCall, HostCallBridge, HostCallError, HostError};
use crate::ops::{self, OpError};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("stack underflow at offset {offset}")]
    StackUnderflow { offset: usize },
    #[error("stack overflow: more than {limit} values")]
    StackOverflow { limit: usize },
    #[error("type mismatch: {detail}")]
    TypeMismatch { detail: String },
    #[error("undefined local '{name}'")]
    UndefinedLocal { name: String },
    #[error("invalid opcode 0x{opcode:02x} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },
    #[error("malformed header: {reason}")]
    MalformedHeader { reason: String },
    #[error("malformed module: {reason}")]
    MalformedModule { reason: String },
    #[error("no host call bridge bound for '{call}'")]
    HostUnavailable { call: String },
    #[error(transparent)]
    Host(HostError),
    #[error("division by zero")]
    DivisionByZero,
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("no field '{field}'")]
    FieldNotFound { field: String },
    #[error("undefined function: {name}")]
    UndefinedFunction { name: String },
    #[error("{name}: expected {expected} argument(s), got {got}")]
    ArityMismatch { name: String, expected: usize, got: usize },
    #[error("invalid iterator id {id}")]
    InvalidIterator { id: i64 },
    #[error("step limit of {limit} exceeded")]
    StepLimitExceeded { limit: u64 },
    #[error("call depth limit of {limit} exceeded")]
    CallDepthExceeded { limit: usize },
    #[error(transparent)]
    Builtin(#[from] BuiltinError),
}

impl From<OpError> for VmError {
    fn from(e: OpError) -> Self {
        match e {
            OpError::DivisionByZero => VmError::DivisionByZero,
            OpError::IndexOutOfBounds { index, len } => VmError::IndexOutOfBounds { index, len },
            OpError::FieldNotFound { field } => VmError::FieldNotFound { field },
            other @ (OpError::TypeMismatch { .. } | OpError::UnaryMismatch { .. }) => {
                VmError::TypeMismatch { detail: other.to_string() }
            }
        }
    }
}

impl From<HostCallError> for VmError {
    fn from(e: HostCallError) -> Self {
        match e {
            HostCallError::Host(err) => VmError::Host(err),
            other @ HostCallError::Argument { .. } => VmError::TypeMismatch { detail: other.to_string() },
        }
    }
}

impl From<DecodeError> for VmError {
    fn from(e: DecodeError) -> Self {
        if e.is_header() {
            VmError::MalformedHeader { reason: e.to_string() }
        } else {
            VmError::MalformedModule { reason: e.to_string() }
        }
    }
}

pub type VmResult<T> = Result<T, VmError>;

/// Resource limits for one VM instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub max_stack: usize,
    /// `None` runs until the program halts.
    pub max_steps: Option<u64>,
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig { max_stack: 10_000, max_steps: None, max_call_depth: 256 }
    }
}

// ── Execution state ──────────────────────────────────────────────────

/// Snapshot of an array or object taken by `GET_ITER`.
struct Cursor {
    /// (key, value): array index or object key.
    entries: Vec<(Value, Value)>,
    pos: usize,
}

impl Cursor {
    fn over(value: Value) -> Option<Cursor> {
        let entries = match value {
            Value::Array(items) => items.into_iter().enumerate().map(|(i, v)| (Value::Int(i as i64), v)).collect(),
            Value::Object(fields) => fields.into_iter().map(|(k, v)| (Value::Str(k), v)).collect(),
            _ => return None,
        };
        Some(Cursor { entries, pos: 0 })
    }

    fn has_next(&self) -> bool {
        self.pos < self.entries.len()
    }
}

struct CallFrame {
    return_ip: usize,
    /// Caller's locals, restored on return.
    saved_locals: HashMap<String, Value>,
    stack_base: usize,
    discard_result: bool,
}

pub struct Vm {
    stack: Vec<Value>,
    locals: HashMap<String, Value>,
    iterators: HashMap<u32, Cursor>,
    next_iter: u32,
    frames: Vec<CallFrame>,
    bridge: Option<Arc<dyn HostCallBridge>>,
    config: VmConfig,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("stack", &self.stack.len())
            .field("locals", &self.locals.len())
            .field("iterators", &self.iterators.len())
            .field("bridge", &self.bridge.is_some())
            .field("config", &self.config)
            .finish()
    }
}

fn binop(op: u8) -> Option<BinOp> {
    Some(match op {
        OP_ADD => BinOp::Add,
        OP_SUB => BinOp::Sub,
        OP_MUL => BinOp::Mul,
        OP_DIV => BinOp::Div,
        OP_MOD => BinOp::Mod,
        OP_EQ => BinOp::Eq,
        OP_NE => BinOp::Ne,
        OP_LT => BinOp::Lt,
        OP_GT => BinOp::Gt,
        OP_GE => BinOp::Ge,
        OP_LE => BinOp::Le,
        OP_AND => BinOp::And,
        OP_OR => BinOp::Or,
        _ => return None,
    })
}

impl Vm {
    pub fn new() -> Self {
        Vm::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Vm {
            stack: Vec::with_capacity(64),
            locals: HashMap::new(),
            iterators: HashMap::new(),
            next_iter: 0,
            frames: Vec::new(),
            bridge: None,
            config,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn set_host_call_bridge(&mut self, bridge: Arc<dyn HostCallBridge>) {
        self.bridge = Some(bridge);
    }

    pub fn clear_host_call_bridge(&mut self) {
        self.bridge = None;
    }

    // ── Primitives ───────────────────────────────────────────────────

    pub fn push(&mut self, value: Value) -> VmResult<()> {
        if self.stack.len() >= self.config.max_stack {
            return Err(VmError::StackOverflow { limit: self.config.max_stack });
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow { offset: 0 })
    }

    pub fn set_local(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    pub fn get_local(&self, name: &str) -> VmResult<Value> {
        self.locals.get(name).cloned().ok_or_else(|| VmError::UndefinedLocal { name: name.to_string() })
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    pub fn locals_count(&self) -> usize {
        self.locals.len()
    }

    pub fn iterator_count(&self) -> usize {
        self.iterators.len()
    }

    /// Clear stack, locals, iterators and frames. The bridge and config stay.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.locals.clear();
        self.iterators.clear();
        self.next_iter = 0;
        self.frames.clear();
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Decode and run `bytes`. A bad header fails before any state changes.
    #[instrument(skip_all, fields(bytes = bytes.len()))]
    pub fn execute(&mut self, bytes: &[u8]) -> VmResult<Value> {
        let module = BytecodeModule::decode(bytes)?;
        self.run(&module)
    }

    /// Run a decoded module from offset 0. On error the stack, iterator
    /// table and locals are unwound to where they were on entry.
    pub fn run(&mut self, module: &BytecodeModule) -> VmResult<Value> {
        let base = self.stack.len();
        let iter_mark = self.next_iter;
        let result = self.dispatch(module, base);
        if let Err(err) = &result {
            debug!(error = %err, "execution failed");
            self.stack.truncate(base);
            self.iterators.retain(|&id, _| id < iter_mark);
            if let Some(outer) = self.frames.drain(..).next() {
                self.locals = outer.saved_locals;
            }
        }
        result
    }

    fn pop_at(&mut self, offset: usize) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow { offset })
    }

    fn pop_n(&mut self, n: usize, offset: usize) -> VmResult<Vec<Value>> {
        let Some(start) = self.stack.len().checked_sub(n) else {
            return Err(VmError::StackUnderflow { offset });
        };
        Ok(self.stack.split_off(start))
    }

    fn iterator_id(&mut self, offset: usize) -> VmResult<u32> {
        match self.pop_at(offset)? {
            Value::Int(n) => u32::try_from(n).map_err(|_| VmError::InvalidIterator { id: n }),
            other => Err(VmError::TypeMismatch { detail: format!("iterator id must be int, got {}", other.type_name()) }),
        }
    }

    fn name<'m>(module: &'m BytecodeModule, idx: u32) -> VmResult<&'m str> {
        match module.constant(idx) {
            Some(Value::Str(s)) => Ok(s),
            Some(other) => Err(VmError::MalformedModule {
                reason: format!("constant {} is {}, expected a name", idx, other.type_name()),
            }),
            None => Err(VmError::MalformedModule { reason: format!("constant index {} out of range", idx) }),
        }
    }

    fn finish(&mut self, base: usize) {
        if let Some(outer) = self.frames.drain(..).next() {
            self.locals = outer.saved_locals;
            self.stack.truncate(base);
        }
        debug_assert_eq!(self.stack.len(), base, "operand stack not empty at halt");
    }

    fn dispatch(&mut self, module: &BytecodeModule, base: usize) -> VmResult<Value> {
        let code = &module.code;
        let mut ip = 0usize;
        let mut steps: u64 = 0;

        macro_rules! operand {
            ($at:expr) => {
                read_u32(code, $at).ok_or_else(|| VmError::MalformedModule {
                    reason: format!("truncated operand at offset {}", $at),
                })?
            };
        }

        loop {
            if ip >= code.len() {
                self.finish(base);
                return Ok(Value::Null);
            }
            steps += 1;
            if let Some(limit) = self.config.max_steps {
                if steps > limit {
                    return Err(VmError::StepLimitExceeded { limit });
                }
            }

            let at = ip;
            let op = code[ip];
            let Some((mnemonic, operands)) = op_info(op) else {
                return Err(VmError::InvalidOpcode { opcode: op, offset: at });
            };
            trace!(offset = at, op = mnemonic, depth = self.stack.len(), "step");
            ip += 1 + 4 * operands;

            match op {
                OP_PUSH => {
                    let idx = operand!(at + 1);
                    let value = module.constant(idx).cloned().ok_or_else(|| VmError::MalformedModule {
                        reason: format!("constant index {} out of range", idx),
                    })?;
                    self.push(value)?;
                }
                OP_POP => {
                    self.pop_at(at)?;
                }

                OP_CONCAT => {
                    let b = self.pop_at(at)?;
                    let a = self.pop_at(at)?;
                    self.push(ops::plus(&a, &b)?)?;
                }
                OP_ADD | OP_SUB | OP_MUL | OP_DIV | OP_MOD | OP_EQ | OP_NE | OP_LT | OP_GT | OP_GE | OP_LE | OP_AND
                | OP_OR => {
                    let b = self.pop_at(at)?;
                    let a = self.pop_at(at)?;
                    let Some(bin) = binop(op) else {
                        return Err(VmError::InvalidOpcode { opcode: op, offset: at });
                    };
                    let result = match bin {
                        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => ops::arith(bin, &a, &b)?,
                        _ => ops::binary(bin, &a, &b)?,
                    };
                    self.push(result)?;
                }
                OP_NOT | OP_NEG => {
                    let v = self.pop_at(at)?;
                    let unary = if op == OP_NOT { crate::ast::UnaryOp::Not } else { crate::ast::UnaryOp::Neg };
                    self.push(ops::unary(unary, &v)?)?;
                }

                OP_LOAD => {
                    let name = Self::name(module, operand!(at + 1))?;
                    let value = self.get_local(name)?;
                    self.push(value)?;
                }
                OP_STORE => {
                    let name = Self::name(module, operand!(at + 1))?;
                    let value = self.pop_at(at)?;
                    self.locals.insert(name.to_string(), value);
                }

                OP_JUMP | OP_JUMP_IF_FALSE | OP_JUMP_IF_TRUE => {
                    let target = operand!(at + 1) as usize;
                    if target > code.len() {
                        return Err(VmError::MalformedModule {
                            reason: format!("jump target {} past end of code ({})", target, code.len()),
                        });
                    }
                    let taken = match op {
                        OP_JUMP => true,
                        _ => {
                            let cond = ops::truth(&self.pop_at(at)?)?;
                            cond == (op == OP_JUMP_IF_TRUE)
                        }
                    };
                    if taken {
                        ip = target;
                    }
                }

                OP_GET_ITER => {
                    let value = self.pop_at(at)?;
                    let type_name = value.type_name();
                    let cursor = Cursor::over(value).ok_or_else(|| VmError::TypeMismatch {
                        detail: format!("cannot iterate over {}", type_name),
                    })?;
                    let id = self.next_iter;
                    self.next_iter = self.next_iter.wrapping_add(1);
                    self.iterators.insert(id, cursor);
                    self.push(Value::Int(id as i64))?;
                }
                OP_ITER_HAS_NEXT => {
                    let id = self.iterator_id(at)?;
                    let cursor = self.iterators.get(&id).ok_or(VmError::InvalidIterator { id: id as i64 })?;
                    let more = cursor.has_next();
                    self.push(Value::Bool(more))?;
                }
                OP_ITER_NEXT => {
                    let with_key = operand!(at + 1) != 0;
                    let id = self.iterator_id(at)?;
                    let cursor = self.iterators.get_mut(&id).ok_or(VmError::InvalidIterator { id: id as i64 })?;
                    let Some((key, value)) = cursor.entries.get(cursor.pos).cloned() else {
                        return Err(VmError::InvalidIterator { id: id as i64 });
                    };
                    cursor.pos += 1;
                    if with_key {
                        self.push(key)?;
                    }
                    self.push(value)?;
                }
                OP_ITER_RELEASE => {
                    let id = self.iterator_id(at)?;
                    self.iterators.remove(&id);
                }

                OP_GET_INDEX => {
                    let idx = self.pop_at(at)?;
                    let container = self.pop_at(at)?;
                    self.push(ops::index(&container, &idx)?)?;
                }
                OP_GET_FIELD => {
                    let name = Self::name(module, operand!(at + 1))?;
                    let obj = self.pop_at(at)?;
                    self.push(ops::field(&obj, name)?)?;
                }
                OP_BUILD_OBJECT => {
                    let pairs = operand!(at + 1) as usize;
                    let flat = self.pop_n(pairs * 2, at)?;
                    let mut fields = std::collections::BTreeMap::new();
                    let mut it = flat.into_iter();
                    while let (Some(key), Some(value)) = (it.next(), it.next()) {
                        let Value::Str(key) = key else {
                            return Err(VmError::TypeMismatch {
                                detail: format!("object key must be string, got {}", key.type_name()),
                            });
                        };
                        fields.insert(key, value);
                    }
                    self.push(Value::Object(fields))?;
                }
                OP_BUILD_ARRAY => {
                    let n = operand!(at + 1) as usize;
                    let items = self.pop_n(n, at)?;
                    self.push(Value::Array(items))?;
                }

                OP_CALL | OP_CALL_VOID => {
                    let name = Self::name(module, operand!(at + 1))?;
                    let argc = operand!(at + 5) as usize;
                    let args = self.pop_n(argc, at)?;
                    let discard = op == OP_CALL_VOID;

                    if let Some(call) = HostCall::from_name(name) {
                        let bridge =
                            self.bridge.clone().ok_or_else(|| VmError::HostUnavailable { call: name.to_string() })?;
                        let result = host::invoke(call, bridge.as_ref(), &args)?;
                        if !discard {
                            self.push(result)?;
                        }
                    } else if let Some(func) = module.function(name) {
                        if func.params.len() != argc {
                            return Err(VmError::ArityMismatch {
                                name: name.to_string(),
                                expected: func.params.len(),
                                got: argc,
                            });
                        }
                        if self.frames.len() >= self.config.max_call_depth {
                            return Err(VmError::CallDepthExceeded { limit: self.config.max_call_depth });
                        }
                        let saved_locals = std::mem::take(&mut self.locals);
                        self.frames.push(CallFrame {
                            return_ip: ip,
                            saved_locals,
                            stack_base: self.stack.len(),
                            discard_result: discard,
                        });
                        for (param, arg) in func.params.iter().zip(args) {
                            self.locals.insert(param.clone(), arg);
                        }
                        ip = func.entry as usize;
                    } else if let Some(builtin) = Builtin::from_name(name) {
                        let result = builtin.call(&args)?;
                        if !discard {
                            self.push(result)?;
                        }
                    } else {
                        return Err(VmError::UndefinedFunction { name: name.to_string() });
                    }
                }
                OP_RETURN => {
                    let value = self.pop_at(at)?;
                    match self.frames.pop() {
                        Some(frame) => {
                            self.stack.truncate(frame.stack_base);
                            self.locals = frame.saved_locals;
                            ip = frame.return_ip;
                            if !frame.discard_result {
                                self.push(value)?;
                            }
                        }
                        None => {
                            debug_assert_eq!(self.stack.len(), base, "operand stack not empty at return");
                            debug!(steps, "execution finished");
                            return Ok(value);
                        }
                    }
                }
                OP_HALT => {
                    self.finish(base);
                    debug!(steps, "execution halted");
                    return Ok(Value::Null);
                }
                _ => return Err(VmError::InvalidOpcode { opcode: op, offset: at }),
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
