//! AST → bytecode.
//!
//! Each HTTP route and each WebSocket event becomes one self-contained
//! [`BytecodeModule`]: the handler body is the entry block at offset 0 and
//! every user function of the source follows it, in declaration order.
//! Locals are addressed by name through the constant pool.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument};

use crate::ast::*;
use crate::builtins::{Builtin, ReturnKind};
use crate::bytecode::*;
use crate::host::HostCall;
use crate::value::Value;

pub mod optimizer;
pub use optimizer::OptLevel;

use optimizer::BindingStats;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("unresolved symbol '{name}'")]
    UnresolvedSymbol { name: String, span: Span },
    #[error("{name}: expected {expected} argument(s), got {got}")]
    ArityMismatch { name: String, expected: String, got: usize, span: Span },
    #[error("unsupported construct: {what}")]
    UnsupportedConstruct { what: String, span: Span },
    #[error("malformed literal: {reason}")]
    MalformedLiteral { reason: String, span: Span },
    #[error("cannot redeclare '{name}' in the same scope")]
    Redeclaration { name: String, span: Span },
    #[error("assignment to undeclared variable '{name}'; declare it with '$ {name} = ...'")]
    UndeclaredAssignment { name: String, span: Span },
}

impl CompileError {
    pub fn span(&self) -> Span {
        match self {
            CompileError::UnresolvedSymbol { span, .. }
            | CompileError::ArityMismatch { span, .. }
            | CompileError::UnsupportedConstruct { span, .. }
            | CompileError::MalformedLiteral { span, .. }
            | CompileError::Redeclaration { span, .. }
            | CompileError::UndeclaredAssignment { span, .. } => *span,
        }
    }
}

type Result<T> = std::result::Result<T, CompileError>;

static PATH_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").expect("path parameter pattern is valid"));

/// `:name` segments of a route pattern, in order, without duplicates.
pub fn path_params(path: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for cap in PATH_PARAM.captures_iter(path) {
        let name = cap[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

// ── Compiled output ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRoute {
    pub method: HttpMethod,
    pub path: String,
    pub bytecode: Vec<u8>,
}

impl CompiledRoute {
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// One module per lifecycle event, all seeded with the same path-parameter
/// and `client` locals.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledWebSocketRoute {
    pub path: String,
    pub params: Vec<String>,
    pub on_connect: Vec<u8>,
    pub on_message: Vec<u8>,
    pub on_disconnect: Vec<u8>,
    /// Only present when the source declares `on error`.
    pub on_error: Option<Vec<u8>>,
}

impl CompiledWebSocketRoute {
    pub fn event(&self, event: WsEvent) -> Option<&[u8]> {
        match event {
            WsEvent::Connect => Some(&self.on_connect),
            WsEvent::Message => Some(&self.on_message),
            WsEvent::Disconnect => Some(&self.on_disconnect),
            WsEvent::Error => self.on_error.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledProgram {
    pub routes: Vec<CompiledRoute>,
    pub websockets: Vec<CompiledWebSocketRoute>,
}

impl CompiledProgram {
    pub fn route(&self, method: HttpMethod, path: &str) -> Option<&CompiledRoute> {
        self.routes.iter().find(|r| r.method == method && r.path == path)
    }

    pub fn websocket(&self, path: &str) -> Option<&CompiledWebSocketRoute> {
        self.websockets.iter().find(|w| w.path == path)
    }

    pub fn to_image(&self) -> ProgramImage {
        let mut image = ProgramImage::default();
        for r in &self.routes {
            image.push(EntryKind::Route, r.key(), r.bytecode.clone());
        }
        for ws in &self.websockets {
            for event in [WsEvent::Connect, WsEvent::Message, WsEvent::Disconnect, WsEvent::Error] {
                if let Some(bytes) = ws.event(event) {
                    image.push(EntryKind::WsEvent, ProgramImage::ws_key(&ws.path, event), bytes.to_vec());
                }
            }
        }
        image
    }
}

// ── Static types ─────────────────────────────────────────────────────

/// What the compiler can prove about a value. Only used to pick `ADD` over
/// `CONCAT`; nothing is enforced at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StaticType {
    Int,
    Float,
    Bool,
    Str,
    Array,
    Object,
    Null,
    Unknown,
}

impl StaticType {
    fn from_decl(ty: &Type) -> StaticType {
        match ty {
            Type::Int => StaticType::Int,
            Type::Float => StaticType::Float,
            Type::Str => StaticType::Str,
            Type::Bool => StaticType::Bool,
            Type::Array(_) => StaticType::Array,
            Type::Object | Type::Named(_) => StaticType::Object,
            Type::Any => StaticType::Unknown,
        }
    }

    fn numeric(self) -> bool {
        matches!(self, StaticType::Int | StaticType::Float)
    }
}

#[derive(Debug, Clone)]
struct Signature {
    arity: usize,
    returns: StaticType,
}

// ── Emitter ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Label(usize);

#[derive(Default)]
struct Emitter {
    code: Vec<u8>,
    constants: Vec<Value>,
    labels: Vec<Option<u32>>,
    /// (operand offset, label) pairs resolved by `finish`.
    patches: Vec<(usize, Label)>,
}

fn same_const(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        _ => a == b,
    }
}

impl Emitter {
    fn add_const(&mut self, value: Value) -> u32 {
        if let Some(i) = self.constants.iter().position(|c| same_const(c, &value)) {
            return i as u32;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    fn name(&mut self, name: &str) -> u32 {
        self.add_const(Value::str(name))
    }

    fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    fn op(&mut self, op: u8) {
        self.code.push(op);
    }

    fn op1(&mut self, op: u8, a: u32) {
        self.code.push(op);
        put_u32(&mut self.code, a);
    }

    fn op2(&mut self, op: u8, a: u32, b: u32) {
        self.code.push(op);
        put_u32(&mut self.code, a);
        put_u32(&mut self.code, b);
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.offset());
    }

    fn jump(&mut self, op: u8, label: Label) {
        self.code.push(op);
        self.patches.push((self.code.len(), label));
        put_u32(&mut self.code, 0);
    }

    fn finish(mut self, functions: Vec<FunctionEntry>) -> Result<BytecodeModule> {
        for (at, label) in std::mem::take(&mut self.patches) {
            let Some(target) = self.labels[label.0] else {
                return Err(CompileError::UnsupportedConstruct {
                    what: format!("jump to unbound label {}", label.0),
                    span: Span::UNKNOWN,
                });
            };
            self.code[at..at + 4].copy_from_slice(&target.to_le_bytes());
        }
        Ok(BytecodeModule { constants: self.constants, functions, code: self.code })
    }
}

// ── Code generation ──────────────────────────────────────────────────

struct LoopCtx {
    break_label: Label,
    continue_label: Label,
    /// Hidden local holding the iterator id of a `for` loop.
    iter_local: Option<String>,
}

struct Codegen<'c> {
    signatures: &'c HashMap<String, Signature>,
    em: Emitter,
    scopes: Vec<HashMap<String, StaticType>>,
    loops: Vec<LoopCtx>,
    /// Names bound more than once in the current body; their type is unknown.
    unstable: HashSet<String>,
    hidden: u32,
}

fn unstable_names(body: &Block, predeclared: &[String]) -> HashSet<String> {
    let mut stats = BindingStats::default();
    stats.visit(body);
    let mut names = stats.assigned;
    names.extend(stats.loop_bound);
    names.extend(
        stats
            .lets
            .into_iter()
            .filter(|(name, count)| *count > 1 || predeclared.contains(name))
            .map(|(name, _)| name),
    );
    names
}

impl<'c> Codegen<'c> {
    fn new(signatures: &'c HashMap<String, Signature>) -> Self {
        Codegen {
            signatures,
            em: Emitter::default(),
            scopes: Vec::new(),
            loops: Vec::new(),
            unstable: HashSet::new(),
            hidden: 0,
        }
    }

    fn hidden_local(&mut self, kind: &str) -> String {
        self.hidden += 1;
        format!("@{}{}", kind, self.hidden)
    }

    // ---- Symbols ----

    fn lookup(&self, name: &str) -> Option<StaticType> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    fn declare(&mut self, name: &str, ty: StaticType) {
        let ty = if self.unstable.contains(name) { StaticType::Unknown } else { ty };
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), ty);
        }
    }

    fn in_current_scope(&self, name: &str) -> bool {
        self.scopes.last().is_some_and(|s| s.contains_key(name))
    }

    fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.scopes.push(HashMap::new());
        let result = f(self);
        self.scopes.pop();
        result
    }

    // ---- Units ----

    /// Emit a handler body as the entry block. It ends in `HALT`, which
    /// yields `null` when the body has no `return`.
    fn entry_block(&mut self, body: &Block, locals: &[(String, StaticType)]) -> Result<()> {
        let names: Vec<String> = locals.iter().map(|(n, _)| n.clone()).collect();
        self.unstable = unstable_names(body, &names);
        self.scopes = vec![locals.iter().cloned().collect()];
        self.loops.clear();
        self.block(body)?;
        self.em.op(OP_HALT);
        Ok(())
    }

    fn function(&mut self, f: &Function) -> Result<FunctionEntry> {
        let entry = self.em.offset();
        let params: Vec<String> = f.params.iter().map(|p| p.name.clone()).collect();
        self.unstable = unstable_names(&f.body, &params);
        let mut scope = HashMap::new();
        for p in &f.params {
            if scope.contains_key(&p.name) {
                return Err(CompileError::Redeclaration { name: p.name.clone(), span: f.span });
            }
            let ty = if self.unstable.contains(&p.name) { StaticType::Unknown } else { StaticType::from_decl(&p.ty) };
            scope.insert(p.name.clone(), ty);
        }
        self.scopes = vec![scope];
        self.loops.clear();
        self.block(&f.body)?;
        let null = self.em.add_const(Value::Null);
        self.em.op1(OP_PUSH, null);
        self.em.op(OP_RETURN);

        let name_const = self.em.name(&f.name);
        let param_consts = params.iter().map(|p| self.em.name(p)).collect();
        Ok(FunctionEntry::new(name_const, entry, param_consts, &self.em.constants))
    }

    // ---- Statements ----

    fn block(&mut self, body: &Block) -> Result<()> {
        for stmt in body {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Spanned<Stmt>) -> Result<()> {
        let span = stmt.span;
        match &stmt.node {
            Stmt::Let { name, ty, value } => {
                self.expr(value)?;
                let static_ty = match ty {
                    Some(t) => StaticType::from_decl(t),
                    None => self.type_of(value),
                };
                if self.in_current_scope(name) {
                    return Err(CompileError::Redeclaration { name: name.clone(), span });
                }
                if self.lookup(name).is_none() {
                    self.declare(name, static_ty);
                }
                let idx = self.em.name(name);
                self.em.op1(OP_STORE, idx);
            }
            Stmt::Assign { name, value } => {
                if self.lookup(name).is_none() {
                    return Err(CompileError::UndeclaredAssignment { name: name.clone(), span });
                }
                self.expr(value)?;
                let idx = self.em.name(name);
                self.em.op1(OP_STORE, idx);
            }
            Stmt::Return(value) => {
                self.expr(value)?;
                let iter_locals: Vec<String> = self.loops.iter().rev().filter_map(|l| l.iter_local.clone()).collect();
                for local in iter_locals {
                    self.release_iterator(&local);
                }
                self.em.op(OP_RETURN);
            }
            Stmt::If { condition, then_body, else_body } => {
                self.expr(condition)?;
                let else_label = self.em.new_label();
                self.em.jump(OP_JUMP_IF_FALSE, else_label);
                self.scoped(|g| g.block(then_body))?;
                if else_body.is_empty() {
                    self.em.bind(else_label);
                } else {
                    let end = self.em.new_label();
                    self.em.jump(OP_JUMP, end);
                    self.em.bind(else_label);
                    self.scoped(|g| g.block(else_body))?;
                    self.em.bind(end);
                }
            }
            Stmt::While { condition, body } => {
                let head = self.em.new_label();
                let exit = self.em.new_label();
                self.em.bind(head);
                self.expr(condition)?;
                self.em.jump(OP_JUMP_IF_FALSE, exit);
                self.loops.push(LoopCtx { break_label: exit, continue_label: head, iter_local: None });
                let result = self.scoped(|g| g.block(body));
                self.loops.pop();
                result?;
                self.em.jump(OP_JUMP, head);
                self.em.bind(exit);
            }
            Stmt::For { key, binding, iterable, body } => self.for_loop(key.as_deref(), binding, iterable, body, span)?,
            Stmt::Switch { subject, cases, default } => {
                self.expr(subject)?;
                let local = self.hidden_local("switch");
                let local_idx = self.em.name(&local);
                self.em.op1(OP_STORE, local_idx);
                let end = self.em.new_label();
                for case in cases {
                    let next = self.em.new_label();
                    self.em.op1(OP_LOAD, local_idx);
                    self.expr(&case.value)?;
                    self.em.op(OP_EQ);
                    self.em.jump(OP_JUMP_IF_FALSE, next);
                    self.scoped(|g| g.block(&case.body))?;
                    self.em.jump(OP_JUMP, end);
                    self.em.bind(next);
                }
                self.scoped(|g| g.block(default))?;
                self.em.bind(end);
            }
            Stmt::Break => {
                let Some(target) = self.loops.last().map(|l| l.break_label) else {
                    return Err(CompileError::UnsupportedConstruct { what: "'break' outside of a loop".into(), span });
                };
                self.em.jump(OP_JUMP, target);
            }
            Stmt::Continue => {
                let Some(target) = self.loops.last().map(|l| l.continue_label) else {
                    return Err(CompileError::UnsupportedConstruct {
                        what: "'continue' outside of a loop".into(),
                        span,
                    });
                };
                self.em.jump(OP_JUMP, target);
            }
            Stmt::Block(body) => self.scoped(|g| g.block(body))?,
            Stmt::Expr(expr) => {
                if let Expr::Call { callee, args } = &expr.node {
                    if let Some(call) = HostCall::from_name(callee).filter(|c| c.is_void()) {
                        self.host_call_args(call, args, expr.span)?;
                        let idx = self.em.name(callee);
                        self.em.op2(OP_CALL_VOID, idx, args.len() as u32);
                        return Ok(());
                    }
                }
                self.expr(expr)?;
                self.em.op(OP_POP);
            }
        }
        Ok(())
    }

    fn release_iterator(&mut self, local: &str) {
        let idx = self.em.name(local);
        self.em.op1(OP_LOAD, idx);
        self.em.op(OP_ITER_RELEASE);
    }

    fn for_loop(&mut self, key: Option<&str>, binding: &str, iterable: &SExpr, body: &Block, span: Span) -> Result<()> {
        for name in key.into_iter().chain(std::iter::once(binding)) {
            if self.lookup(name).is_some() {
                return Err(CompileError::Redeclaration { name: name.to_string(), span });
            }
        }
        if key == Some(binding) {
            return Err(CompileError::Redeclaration { name: binding.to_string(), span });
        }

        self.expr(iterable)?;
        self.em.op(OP_GET_ITER);
        let local = self.hidden_local("iter");
        let local_idx = self.em.name(&local);
        self.em.op1(OP_STORE, local_idx);

        let head = self.em.new_label();
        let exit = self.em.new_label();
        self.em.bind(head);
        self.em.op1(OP_LOAD, local_idx);
        self.em.op(OP_ITER_HAS_NEXT);
        self.em.jump(OP_JUMP_IF_FALSE, exit);
        self.em.op1(OP_LOAD, local_idx);
        self.em.op1(OP_ITER_NEXT, key.is_some() as u32);
        // ITER_NEXT pushes the key (when requested) below the value.
        let binding_idx = self.em.name(binding);
        self.em.op1(OP_STORE, binding_idx);
        if let Some(k) = key {
            let key_idx = self.em.name(k);
            self.em.op1(OP_STORE, key_idx);
        }

        self.loops.push(LoopCtx { break_label: exit, continue_label: head, iter_local: Some(local.clone()) });
        let result = self.scoped(|g| {
            g.declare(binding, StaticType::Unknown);
            if let Some(k) = key {
                g.declare(k, StaticType::Unknown);
            }
            g.block(body)
        });
        self.loops.pop();
        result?;

        self.em.jump(OP_JUMP, head);
        self.em.bind(exit);
        self.release_iterator(&local);
        Ok(())
    }

    // ---- Expressions ----

    fn expr(&mut self, expr: &SExpr) -> Result<()> {
        let span = expr.span;
        match &expr.node {
            Expr::Literal(lit) => self.literal(lit, span)?,
            Expr::Var(name) => {
                if self.lookup(name).is_none() {
                    return Err(CompileError::UnresolvedSymbol { name: name.clone(), span });
                }
                let idx = self.em.name(name);
                self.em.op1(OP_LOAD, idx);
            }
            Expr::Binary { op, left, right } => {
                self.expr(left)?;
                self.expr(right)?;
                let opcode = match op {
                    BinOp::Add if self.type_of(left).numeric() && self.type_of(right).numeric() => OP_ADD,
                    BinOp::Add => OP_CONCAT,
                    BinOp::Sub => OP_SUB,
                    BinOp::Mul => OP_MUL,
                    BinOp::Div => OP_DIV,
                    BinOp::Mod => OP_MOD,
                    BinOp::Eq => OP_EQ,
                    BinOp::Ne => OP_NE,
                    BinOp::Lt => OP_LT,
                    BinOp::Gt => OP_GT,
                    BinOp::Le => OP_LE,
                    BinOp::Ge => OP_GE,
                    BinOp::And => OP_AND,
                    BinOp::Or => OP_OR,
                };
                self.em.op(opcode);
            }
            Expr::Unary { op, operand } => {
                self.expr(operand)?;
                self.em.op(match op {
                    UnaryOp::Not => OP_NOT,
                    UnaryOp::Neg => OP_NEG,
                });
            }
            Expr::Object(fields) => {
                let mut seen = HashSet::new();
                for (key, value) in fields {
                    if !seen.insert(key.as_str()) {
                        return Err(CompileError::MalformedLiteral { reason: format!("duplicate object key '{}'", key), span });
                    }
                    let idx = self.em.add_const(Value::str(key.as_str()));
                    self.em.op1(OP_PUSH, idx);
                    self.expr(value)?;
                }
                self.em.op1(OP_BUILD_OBJECT, fields.len() as u32);
            }
            Expr::Array(items) => {
                for item in items {
                    self.expr(item)?;
                }
                self.em.op1(OP_BUILD_ARRAY, items.len() as u32);
            }
            Expr::Field { object, field } => {
                self.expr(object)?;
                let idx = self.em.name(field);
                self.em.op1(OP_GET_FIELD, idx);
            }
            Expr::Index { object, index } => {
                self.expr(object)?;
                self.expr(index)?;
                self.em.op(OP_GET_INDEX);
            }
            Expr::Call { callee, args } => {
                self.resolve_call(callee, args, span)?;
                let idx = self.em.name(callee);
                self.em.op2(OP_CALL, idx, args.len() as u32);
            }
            Expr::Match { subject, arms } => self.match_expr(subject, arms, span)?,
        }
        Ok(())
    }

    fn literal(&mut self, lit: &Literal, span: Span) -> Result<()> {
        let value = match lit {
            Literal::Int(n) => Value::Int(*n),
            Literal::Float(x) if !x.is_finite() => {
                return Err(CompileError::MalformedLiteral { reason: format!("float {} is not finite", x), span });
            }
            Literal::Float(x) => Value::Float(*x),
            Literal::Str(s) => Value::Str(s.clone()),
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Null => Value::Null,
        };
        let idx = self.em.add_const(value);
        self.em.op1(OP_PUSH, idx);
        Ok(())
    }

    /// Leaves exactly one value on the stack: the first matching arm's
    /// value, or `null` when no arm matches.
    fn match_expr(&mut self, subject: &SExpr, arms: &[MatchArm], span: Span) -> Result<()> {
        self.expr(subject)?;
        let local = self.hidden_local("match");
        let local_idx = self.em.name(&local);
        self.em.op1(OP_STORE, local_idx);
        let end = self.em.new_label();
        for arm in arms {
            let next = self.em.new_label();
            match &arm.pattern {
                Pattern::Literal(lit) => {
                    self.em.op1(OP_LOAD, local_idx);
                    self.literal(lit, span)?;
                    self.em.op(OP_EQ);
                    self.em.jump(OP_JUMP_IF_FALSE, next);
                    self.expr(&arm.value)?;
                }
                Pattern::Wildcard => self.expr(&arm.value)?,
                Pattern::Binding(name) => {
                    if self.lookup(name).is_some() {
                        return Err(CompileError::Redeclaration { name: name.clone(), span: arm.value.span });
                    }
                    self.em.op1(OP_LOAD, local_idx);
                    let name_idx = self.em.name(name);
                    self.em.op1(OP_STORE, name_idx);
                    self.scoped(|g| {
                        g.declare(name, StaticType::Unknown);
                        g.expr(&arm.value)
                    })?;
                }
            }
            self.em.jump(OP_JUMP, end);
            self.em.bind(next);
        }
        let null = self.em.add_const(Value::Null);
        self.em.op1(OP_PUSH, null);
        self.em.bind(end);
        Ok(())
    }

    fn host_call_args(&mut self, call: HostCall, args: &[SExpr], span: Span) -> Result<()> {
        if !call.accepts(args.len()) {
            let (min, max) = call.arity();
            let expected = if min == max { min.to_string() } else { format!("{}..={}", min, max) };
            return Err(CompileError::ArityMismatch { name: call.name().into(), expected, got: args.len(), span });
        }
        for arg in args {
            self.expr(arg)?;
        }
        Ok(())
    }

    /// Check the callee exists with a matching arity and emit the arguments.
    /// Resolution order: host call, user function, builtin.
    fn resolve_call(&mut self, callee: &str, args: &[SExpr], span: Span) -> Result<()> {
        if let Some(call) = HostCall::from_name(callee) {
            return self.host_call_args(call, args, span);
        }
        let expected = if callee.starts_with("ws.") {
            None
        } else if let Some(sig) = self.signatures.get(callee) {
            Some(sig.arity)
        } else {
            Builtin::from_name(callee).map(Builtin::arity)
        };
        let Some(expected) = expected else {
            return Err(CompileError::UnresolvedSymbol { name: callee.to_string(), span });
        };
        if expected != args.len() {
            return Err(CompileError::ArityMismatch {
                name: callee.to_string(),
                expected: expected.to_string(),
                got: args.len(),
                span,
            });
        }
        for arg in args {
            self.expr(arg)?;
        }
        Ok(())
    }

    fn type_of(&self, expr: &SExpr) -> StaticType {
        match &expr.node {
            Expr::Literal(lit) => match lit {
                Literal::Int(_) => StaticType::Int,
                Literal::Float(_) => StaticType::Float,
                Literal::Str(_) => StaticType::Str,
                Literal::Bool(_) => StaticType::Bool,
                Literal::Null => StaticType::Null,
            },
            Expr::Var(name) => self.lookup(name).unwrap_or(StaticType::Unknown),
            Expr::Binary { op, left, right } => {
                let (l, r) = (self.type_of(left), self.type_of(right));
                match op {
                    BinOp::Add if l == StaticType::Str || r == StaticType::Str => StaticType::Str,
                    BinOp::Add if l == StaticType::Array && r == StaticType::Array => StaticType::Array,
                    BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => match (l, r) {
                        (StaticType::Int, StaticType::Int) => StaticType::Int,
                        (a, b) if a.numeric() && b.numeric() => StaticType::Float,
                        _ => StaticType::Unknown,
                    },
                    _ => StaticType::Bool,
                }
            }
            Expr::Unary { op: UnaryOp::Not, .. } => StaticType::Bool,
            Expr::Unary { op: UnaryOp::Neg, operand } => match self.type_of(operand) {
                t if t.numeric() => t,
                _ => StaticType::Unknown,
            },
            Expr::Object(_) => StaticType::Object,
            Expr::Array(_) => StaticType::Array,
            Expr::Field { .. } | Expr::Index { .. } | Expr::Match { .. } => StaticType::Unknown,
            Expr::Call { callee, .. } => {
                if let Some(call) = HostCall::from_name(callee) {
                    return match call {
                        c if c.is_void() => StaticType::Null,
                        c if c.returns_string() => StaticType::Str,
                        HostCall::GetRooms | HostCall::GetRoomClients => StaticType::Array,
                        _ => StaticType::Int,
                    };
                }
                if let Some(sig) = self.signatures.get(callee) {
                    return sig.returns;
                }
                match Builtin::from_name(callee).map(Builtin::returns) {
                    Some(ReturnKind::Int) => StaticType::Int,
                    Some(ReturnKind::Bool) => StaticType::Bool,
                    Some(ReturnKind::Str) => StaticType::Str,
                    Some(ReturnKind::Array) => StaticType::Array,
                    None => StaticType::Unknown,
                }
            }
        }
    }
}

// ── Compiler ─────────────────────────────────────────────────────────

pub struct Compiler {
    opt: OptLevel,
    /// User functions after optimization, in declaration order.
    functions: Vec<Function>,
    signatures: HashMap<String, Signature>,
}

impl Default for Compiler {
    fn default() -> Self {
        Compiler::new(OptLevel::default())
    }
}

impl Compiler {
    pub fn new(opt: OptLevel) -> Self {
        Compiler { opt, functions: Vec::new(), signatures: HashMap::new() }
    }

    pub fn opt_level(&self) -> OptLevel {
        self.opt
    }

    /// Make the module's functions callable from routes compiled afterwards.
    pub fn register_functions(&mut self, module: &Module) -> Result<()> {
        self.functions.clear();
        self.signatures.clear();
        for f in module.functions() {
            if self.signatures.contains_key(&f.name) {
                return Err(CompileError::Redeclaration { name: f.name.clone(), span: f.span });
            }
            let returns = f.return_type.as_ref().map(StaticType::from_decl).unwrap_or(StaticType::Unknown);
            self.signatures.insert(f.name.clone(), Signature { arity: f.params.len(), returns });
            let params: Vec<String> = f.params.iter().map(|p| p.name.clone()).collect();
            let mut optimized = f.clone();
            optimized.body = optimizer::optimize(&f.body, self.opt, &params);
            self.functions.push(optimized);
        }
        Ok(())
    }

    /// Compile every route and WebSocket route of `module`. No partial
    /// output is returned on error.
    #[instrument(skip_all, fields(items = module.items.len()))]
    pub fn compile(&mut self, module: &Module) -> Result<CompiledProgram> {
        self.register_functions(module)?;
        let mut program = CompiledProgram::default();
        for route in module.routes() {
            program.routes.push(self.compile_route(route)?);
        }
        for ws in module.websocket_routes() {
            program.websockets.push(self.compile_websocket_route(ws)?);
        }
        if program.routes.is_empty() && program.websockets.is_empty() {
            // Still type-check function bodies.
            self.compile_block(&Vec::new(), &[])?;
        }
        debug!(routes = program.routes.len(), websockets = program.websockets.len(), "compiled module");
        Ok(program)
    }

    pub fn compile_route(&self, route: &Route) -> Result<CompiledRoute> {
        let mut locals: Vec<(String, StaticType)> =
            path_params(&route.path).into_iter().map(|p| (p, StaticType::Unknown)).collect();
        locals.push(("query".into(), StaticType::Object));
        locals.push(("input".into(), StaticType::Unknown));
        let bytecode = self.unit(&route.body, &locals)?;
        debug!(route = %route.key(), bytes = bytecode.len(), "compiled route");
        Ok(CompiledRoute { method: route.method, path: route.path.clone(), bytecode })
    }

    pub fn compile_websocket_route(&self, ws: &WebSocketRoute) -> Result<CompiledWebSocketRoute> {
        let params = path_params(&ws.path);
        let mut base: Vec<(String, StaticType)> = params.iter().map(|p| (p.clone(), StaticType::Unknown)).collect();
        base.push(("client".into(), StaticType::Unknown));

        let empty = Vec::new();
        let event = |event: WsEvent| -> Result<Vec<u8>> {
            let mut locals = base.clone();
            match event {
                WsEvent::Message => locals.push(("input".into(), StaticType::Unknown)),
                WsEvent::Error => locals.push(("error".into(), StaticType::Unknown)),
                WsEvent::Connect | WsEvent::Disconnect => {}
            }
            let body = ws.handler(event).map(|h| &h.body).unwrap_or(&empty);
            self.unit(body, &locals)
        };

        let compiled = CompiledWebSocketRoute {
            path: ws.path.clone(),
            params: params.clone(),
            on_connect: event(WsEvent::Connect)?,
            on_message: event(WsEvent::Message)?,
            on_disconnect: event(WsEvent::Disconnect)?,
            on_error: match ws.handler(WsEvent::Error) {
                Some(_) => Some(event(WsEvent::Error)?),
                None => None,
            },
        };
        debug!(path = %ws.path, params = params.len(), "compiled websocket route");
        Ok(compiled)
    }

    /// Compile a free-standing block with the given locals pre-declared.
    pub fn compile_block(&self, body: &Block, locals: &[&str]) -> Result<Vec<u8>> {
        let locals: Vec<(String, StaticType)> = locals.iter().map(|n| (n.to_string(), StaticType::Unknown)).collect();
        self.unit(body, &locals)
    }

    fn unit(&self, body: &Block, locals: &[(String, StaticType)]) -> Result<Vec<u8>> {
        let names: Vec<String> = locals.iter().map(|(n, _)| n.clone()).collect();
        let body = optimizer::optimize(body, self.opt, &names);
        let mut cg = Codegen::new(&self.signatures);
        cg.entry_block(&body, locals)?;
        let mut entries = Vec::with_capacity(self.functions.len());
        for f in &self.functions {
            entries.push(cg.function(f)?);
        }
        let module = cg.em.finish(entries)?;
        Ok(module.encode())
    }
}

/// Lex, parse and compile a source file in one step.
pub fn compile_source(source: &str, opt: OptLevel) -> std::result::Result<CompiledProgram, SourceCompileError> {
    let module = crate::parser::parse_source(source)?;
    Ok(Compiler::new(opt).compile(&module)?)
}

#[derive(Debug, thiserror::Error)]
pub enum SourceCompileError {
    #[error(transparent)]
    Source(#[from] crate::parser::SourceError),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn compile(src: &str) -> Result<CompiledProgram> {
        Compiler::new(OptLevel::None).compile(&parse_source(src).unwrap())
    }

    fn route_module(src: &str) -> BytecodeModule {
        let program = compile(src).unwrap();
        BytecodeModule::decode(&program.routes[0].bytecode).unwrap()
    }

    /// Opcodes in order, skipping operands.
    fn opcodes(module: &BytecodeModule) -> Vec<u8> {
        let mut out = Vec::new();
        let mut ip = 0;
        while ip < module.code.len() {
            let op = module.code[ip];
            out.push(op);
            ip += 1 + 4 * op_info(op).map(|(_, n)| n).unwrap_or(0);
        }
        out
    }

    #[test]
    fn path_params_in_order() {
        assert_eq!(path_params("/users/:id/posts/:post_id"), vec!["id", "post_id"]);
        assert!(path_params("/health").is_empty());
    }

    #[test]
    fn simple_route_bytecode() {
        let program = compile(r#"@ GET /test { > {status: "ok"} }"#).unwrap();
        let bytes = &program.route(HttpMethod::Get, "/test").unwrap().bytecode;
        assert_eq!(&bytes[..4], b"GLYP");
        let module = BytecodeModule::decode(bytes).unwrap();
        assert_eq!(opcodes(&module), vec![OP_PUSH, OP_PUSH, OP_BUILD_OBJECT, OP_RETURN, OP_HALT]);
    }

    #[test]
    fn compile_is_deterministic() {
        let src = r#"
            fn double(x: int) -> int { > x * 2 }
            @ POST /items/:id {
              $ total = 0
              for k, v in {b: 2, a: 1} { total = total + v }
              > {id: id, total: double(total), tag: "t" + id}
            }
        "#;
        let module = parse_source(src).unwrap();
        let a = Compiler::default().compile(&module).unwrap();
        let b = Compiler::default().compile(&module).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn constants_are_deduplicated() {
        let module = route_module(r#"@ GET /p { > ["a", "a", 1, 1.0] }"#);
        assert_eq!(module.constants, vec![Value::str("a"), Value::Int(1), Value::Float(1.0)]);
    }

    #[test]
    fn string_plus_uses_concat() {
        let module = route_module(r#"@ GET /p/:name { > "hi " + name }"#);
        assert!(opcodes(&module).contains(&OP_CONCAT));
        let module = route_module("@ GET /p { $ a = 1\n > a + 2 }");
        assert!(opcodes(&module).contains(&OP_ADD));
    }

    #[test]
    fn match_chains_equality_tests() {
        let module = route_module(r#"@ GET /p { > match input { 1 => "a", _ => "b" } }"#);
        assert_eq!(
            opcodes(&module),
            vec![
                OP_LOAD,
                OP_STORE,
                OP_LOAD,
                OP_PUSH,
                OP_EQ,
                OP_JUMP_IF_FALSE,
                OP_PUSH,
                OP_JUMP,
                OP_PUSH,
                OP_JUMP,
                OP_PUSH,
                OP_RETURN,
                OP_HALT,
            ]
        );
        assert!(module.constants.contains(&Value::str("@match1")));
    }

    #[test]
    fn match_binding_is_scoped_to_its_arm() {
        assert!(compile("@ GET /p { > match input { n => n + 1 } }").is_ok());
        let err = compile("@ GET /p { > match input { n => 1 } + n }").unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedSymbol { ref name, .. } if name == "n"));
        let err = compile("@ GET /p { $ n = 1\n > match input { n => n } }").unwrap_err();
        assert!(matches!(err, CompileError::Redeclaration { ref name, .. } if name == "n"));
    }

    #[test]
    fn void_host_call_statement_has_no_pop() {
        let program = compile("@ ws /chat/:room { on connect { ws.join(room) } }").unwrap();
        let module = BytecodeModule::decode(&program.websockets[0].on_connect).unwrap();
        assert_eq!(opcodes(&module), vec![OP_LOAD, OP_CALL_VOID, OP_HALT]);
    }

    #[test]
    fn value_call_statement_is_popped() {
        let module = route_module("@ GET /p { upper(\"x\") }");
        assert_eq!(opcodes(&module), vec![OP_PUSH, OP_CALL, OP_POP, OP_HALT]);
    }

    #[test]
    fn for_loop_releases_iterator() {
        let module = route_module("@ GET /p { $ s = 0\n for x in [1, 2] { s = s + x }\n > s }");
        let ops = opcodes(&module);
        assert_eq!(ops.iter().filter(|&&o| o == OP_GET_ITER).count(), 1);
        assert_eq!(ops.iter().filter(|&&o| o == OP_ITER_RELEASE).count(), 1);
    }

    #[test]
    fn return_inside_nested_loops_releases_both() {
        let module = route_module("@ GET /p { for a in [1] { for b in [2] { > b } } > 0 }");
        let ops = opcodes(&module);
        // Two on return, one per loop on normal exit.
        assert_eq!(ops.iter().filter(|&&o| o == OP_ITER_RELEASE).count(), 4);
    }

    #[test]
    fn functions_follow_entry_block() {
        let module = route_module("fn one() { > 1 }\nfn two() { > 2 }\n@ GET /p { > one() + two() }");
        let names: Vec<&str> = module.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two"]);
        assert!(module.functions[0].entry > 0);
        assert!(module.functions[1].entry > module.functions[0].entry);
    }

    #[test]
    fn websocket_events_share_locals() {
        let program = compile("@ ws /chat/:room { on message { ws.broadcast_to_room(room, input) } }").unwrap();
        let ws = program.websocket("/chat/:room").unwrap();
        assert_eq!(ws.params, vec!["room"]);
        assert!(ws.on_error.is_none());
        // Missing events compile to an empty block.
        let connect = BytecodeModule::decode(&ws.on_connect).unwrap();
        assert_eq!(opcodes(&connect), vec![OP_HALT]);
    }

    #[test]
    fn input_is_message_only() {
        let err = compile("@ ws /chat { on connect { ws.send(input) } }").unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedSymbol { ref name, .. } if name == "input"));
    }

    #[test]
    fn unresolved_symbol_has_span() {
        let src = "@ GET /p { > missing }";
        let err = compile(src).unwrap_err();
        let span = err.span();
        assert_eq!(&src[span.start..span.end], "missing");
    }

    #[test]
    fn arity_mismatch() {
        let err = compile("fn f(a) { > a }\n@ GET /p { > f(1, 2) }").unwrap_err();
        assert!(matches!(err, CompileError::ArityMismatch { got: 2, .. }));
        let err = compile("@ ws /c { on connect { ws.join() } }").unwrap_err();
        assert!(matches!(err, CompileError::ArityMismatch { .. }));
    }

    #[test]
    fn unknown_host_call_is_unresolved() {
        let err = compile("@ ws /c { on connect { ws.teleport(1) } }").unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedSymbol { .. }));
    }

    #[test]
    fn break_outside_loop() {
        let err = compile("@ GET /p { break }").unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedConstruct { .. }));
    }

    #[test]
    fn redeclaration_and_undeclared_assignment() {
        let err = compile("@ GET /p { $ x = 1\n $ x = 2 }").unwrap_err();
        assert!(matches!(err, CompileError::Redeclaration { .. }));
        let err = compile("@ GET /p { y = 2 }").unwrap_err();
        assert!(matches!(err, CompileError::UndeclaredAssignment { .. }));
        // Enclosing-scope binding is updated, not redeclared.
        assert!(compile("@ GET /p { $ x = 1\n if true { $ x = 2 }\n > x }").is_ok());
    }

    #[test]
    fn duplicate_object_key() {
        let err = compile("@ GET /p { > {a: 1, a: 2} }").unwrap_err();
        assert!(matches!(err, CompileError::MalformedLiteral { .. }));
    }

    #[test]
    fn non_finite_float_literal() {
        let huge = format!("@ GET /p {{ > {}0.0 }}", "9".repeat(400));
        let err = compile(&huge).unwrap_err();
        assert!(matches!(err, CompileError::MalformedLiteral { .. }));
    }

    #[test]
    fn image_has_every_event() {
        let program = compile("@ GET /a { > 1 }\n@ ws /c { on error { ws.send(error) } }").unwrap();
        let image = program.to_image();
        assert!(image.get(EntryKind::Route, "GET /a").is_some());
        assert!(image.get(EntryKind::WsEvent, "/c connect").is_some());
        assert!(image.get(EntryKind::WsEvent, "/c error").is_some());
    }
}
