//! Tree-walking reference executor.
//!
//! Runs handler bodies straight from the AST with the same value semantics,
//! builtins and host calls as the VM. Used by `glyph run --interp` and as
//! the oracle in differential tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::ast::*;
use crate::builtins::{Builtin, BuiltinError};
use crate::host::{self, HostCall, HostCallBridge, HostCallError, HostError};
use crate::ops::{self, OpError};
use crate::value::Value;
use crate::vm::VmConfig;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("Runtime error: {message}")]
    Failed { message: String },
    #[error(transparent)]
    Host(#[from] HostError),
}

impl RuntimeError {
    fn new(msg: impl Into<String>) -> Self {
        RuntimeError::Failed { message: msg.into() }
    }
}

impl From<OpError> for RuntimeError {
    fn from(e: OpError) -> Self {
        RuntimeError::new(e.to_string())
    }
}

impl From<BuiltinError> for RuntimeError {
    fn from(e: BuiltinError) -> Self {
        RuntimeError::new(e.to_string())
    }
}

impl From<HostCallError> for RuntimeError {
    fn from(e: HostCallError) -> Self {
        match e {
            HostCallError::Host(err) => RuntimeError::Host(err),
            other => RuntimeError::new(other.to_string()),
        }
    }
}

type Result<T> = std::result::Result<T, RuntimeError>;

struct Env {
    scopes: Vec<HashMap<String, Value>>,
    depth: usize,
}

impl Env {
    fn new(locals: impl IntoIterator<Item = (String, Value)>, depth: usize) -> Self {
        Env { scopes: vec![locals.into_iter().collect()], depth }
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Bind in the innermost scope, shadowing nothing.
    fn declare(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    /// `$ name = v`: update the nearest existing binding, else declare.
    fn set(&mut self, name: &str, value: Value) {
        match self.scopes.iter_mut().rev().find(|s| s.contains_key(name)) {
            Some(scope) => {
                scope.insert(name.to_string(), value);
            }
            None => self.declare(name, value),
        }
    }

    /// `name = v`: the binding must already exist.
    fn assign(&mut self, name: &str, value: Value) -> Result<()> {
        match self.scopes.iter_mut().rev().find_map(|s| s.get_mut(name)) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::new(format!("assignment to undeclared variable: {}", name))),
        }
    }

    fn get(&self, name: &str) -> Result<Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(val) = scope.get(name) {
                return Ok(val.clone());
            }
        }
        Err(RuntimeError::new(format!("undefined variable: {}", name)))
    }
}

/// How a block finished.
enum BodyResult {
    Done,
    Return(Value),
    Break,
    Continue,
}

pub struct Interpreter<'m> {
    module: &'m Module,
    functions: HashMap<&'m str, &'m Function>,
    bridge: Option<Arc<dyn HostCallBridge>>,
    max_call_depth: usize,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module) -> Self {
        let functions = module.functions().map(|f| (f.name.as_str(), f)).collect();
        Interpreter { module, functions, bridge: None, max_call_depth: VmConfig::default().max_call_depth }
    }

    /// Take the call depth limit from the VM's configuration so both
    /// executors fail at the same depth.
    pub fn with_config(mut self, config: &VmConfig) -> Self {
        self.max_call_depth = config.max_call_depth;
        self
    }

    pub fn with_bridge(mut self, bridge: Arc<dyn HostCallBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    #[instrument(skip_all, fields(method = %method, path = %path))]
    pub fn run_route(
        &self,
        method: HttpMethod,
        path: &str,
        locals: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<Value> {
        let route = self
            .module
            .route(method, path)
            .ok_or_else(|| RuntimeError::new(format!("no route {} {}", method, path)))?;
        self.run_block(&route.body, locals)
    }

    /// A route without a handler for `event` yields `null`.
    #[instrument(skip_all, fields(path = %path, event = event.as_str()))]
    pub fn run_websocket_event(
        &self,
        path: &str,
        event: WsEvent,
        locals: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<Value> {
        let ws = self
            .module
            .websocket_route(path)
            .ok_or_else(|| RuntimeError::new(format!("no websocket route {}", path)))?;
        match ws.handler(event) {
            Some(handler) => self.run_block(&handler.body, locals),
            None => Ok(Value::Null),
        }
    }

    pub fn run_block(&self, body: &Block, locals: impl IntoIterator<Item = (String, Value)>) -> Result<Value> {
        let mut env = Env::new(locals, 0);
        let result = self.eval_body(&mut env, body)?;
        debug!("interpreted block");
        match result {
            BodyResult::Return(v) => Ok(v),
            BodyResult::Done => Ok(Value::Null),
            BodyResult::Break | BodyResult::Continue => Err(RuntimeError::new("'break' or 'continue' outside of a loop")),
        }
    }

    fn call_function(&self, env: &Env, name: &str, args: Vec<Value>) -> Result<Value> {
        if let Some(call) = HostCall::from_name(name) {
            let Some(bridge) = &self.bridge else {
                return Err(RuntimeError::new(format!("no host call bridge bound for '{}'", name)));
            };
            return Ok(host::invoke(call, bridge.as_ref(), &args)?);
        }

        if let Some(func) = self.functions.get(name) {
            if args.len() != func.params.len() {
                return Err(RuntimeError::new(format!(
                    "{}: expected {} args, got {}",
                    name,
                    func.params.len(),
                    args.len()
                )));
            }
            if env.depth >= self.max_call_depth {
                return Err(RuntimeError::new(format!("call depth limit of {} exceeded", self.max_call_depth)));
            }
            let params = func.params.iter().map(|p| p.name.clone()).zip(args);
            let mut callee_env = Env::new(params, env.depth + 1);
            return match self.eval_body(&mut callee_env, &func.body)? {
                BodyResult::Return(v) => Ok(v),
                BodyResult::Done => Ok(Value::Null),
                BodyResult::Break | BodyResult::Continue => {
                    Err(RuntimeError::new(format!("{}: 'break' or 'continue' outside of a loop", name)))
                }
            };
        }

        match Builtin::from_name(name) {
            Some(builtin) => Ok(builtin.call(&args)?),
            None => Err(RuntimeError::new(format!("undefined function: {}", name))),
        }
    }

    fn eval_scoped(&self, env: &mut Env, body: &Block) -> Result<BodyResult> {
        env.push_scope();
        let result = self.eval_body(env, body);
        env.pop_scope();
        result
    }

    fn eval_body(&self, env: &mut Env, stmts: &Block) -> Result<BodyResult> {
        for stmt in stmts {
            match self.eval_stmt(env, stmt)? {
                BodyResult::Done => {}
                other => return Ok(other),
            }
        }
        Ok(BodyResult::Done)
    }

    fn eval_stmt(&self, env: &mut Env, stmt: &Spanned<Stmt>) -> Result<BodyResult> {
        match &stmt.node {
            Stmt::Let { name, value, .. } => {
                let val = self.eval_expr(env, value)?;
                env.set(name, val);
            }
            Stmt::Assign { name, value } => {
                let val = self.eval_expr(env, value)?;
                env.assign(name, val)?;
            }
            Stmt::Return(value) => return Ok(BodyResult::Return(self.eval_expr(env, value)?)),
            Stmt::If { condition, then_body, else_body } => {
                let cond = self.eval_expr(env, condition)?;
                let branch = if ops::truth(&cond)? { then_body } else { else_body };
                return self.eval_scoped(env, branch);
            }
            Stmt::While { condition, body } => loop {
                let cond = self.eval_expr(env, condition)?;
                if !ops::truth(&cond)? {
                    break;
                }
                match self.eval_scoped(env, body)? {
                    BodyResult::Break => break,
                    BodyResult::Return(v) => return Ok(BodyResult::Return(v)),
                    BodyResult::Done | BodyResult::Continue => {}
                }
            },
            Stmt::For { key, binding, iterable, body } => {
                let entries: Vec<(Value, Value)> = match self.eval_expr(env, iterable)? {
                    Value::Array(items) => {
                        items.into_iter().enumerate().map(|(i, v)| (Value::Int(i as i64), v)).collect()
                    }
                    Value::Object(fields) => fields.into_iter().map(|(k, v)| (Value::Str(k), v)).collect(),
                    other => return Err(RuntimeError::new(format!("cannot iterate over {}", other.type_name()))),
                };
                for (k, item) in entries {
                    env.push_scope();
                    env.declare(binding, item);
                    if let Some(key) = key {
                        env.declare(key, k);
                    }
                    let result = self.eval_body(env, body);
                    env.pop_scope();
                    match result? {
                        BodyResult::Break => break,
                        BodyResult::Return(v) => return Ok(BodyResult::Return(v)),
                        BodyResult::Done | BodyResult::Continue => {}
                    }
                }
            }
            Stmt::Switch { subject, cases, default } => {
                let subj = self.eval_expr(env, subject)?;
                for case in cases {
                    let value = self.eval_expr(env, &case.value)?;
                    if subj.loose_eq(&value) {
                        return self.eval_scoped(env, &case.body);
                    }
                }
                return self.eval_scoped(env, default);
            }
            Stmt::Break => return Ok(BodyResult::Break),
            Stmt::Continue => return Ok(BodyResult::Continue),
            Stmt::Block(body) => return self.eval_scoped(env, body),
            Stmt::Expr(expr) => {
                self.eval_expr(env, expr)?;
            }
        }
        Ok(BodyResult::Done)
    }

    fn eval_expr(&self, env: &mut Env, expr: &SExpr) -> Result<Value> {
        match &expr.node {
            Expr::Literal(lit) => Ok(eval_literal(lit)),
            Expr::Var(name) => env.get(name),
            Expr::Binary { op, left, right } => {
                // Both sides are always evaluated, like the compiled form.
                let l = self.eval_expr(env, left)?;
                let r = self.eval_expr(env, right)?;
                Ok(ops::binary(*op, &l, &r)?)
            }
            Expr::Unary { op, operand } => {
                let val = self.eval_expr(env, operand)?;
                Ok(ops::unary(*op, &val)?)
            }
            Expr::Object(fields) => {
                let mut out = BTreeMap::new();
                for (key, value) in fields {
                    out.insert(key.clone(), self.eval_expr(env, value)?);
                }
                Ok(Value::Object(out))
            }
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_expr(env, item)?);
                }
                Ok(Value::Array(out))
            }
            Expr::Field { object, field } => {
                let obj = self.eval_expr(env, object)?;
                Ok(ops::field(&obj, field)?)
            }
            Expr::Index { object, index } => {
                let container = self.eval_expr(env, object)?;
                let idx = self.eval_expr(env, index)?;
                Ok(ops::index(&container, &idx)?)
            }
            Expr::Call { callee, args } => {
                let mut arg_vals = Vec::with_capacity(args.len());
                for arg in args {
                    arg_vals.push(self.eval_expr(env, arg)?);
                }
                self.call_function(env, callee, arg_vals)
            }
            Expr::Match { subject, arms } => {
                let subj = self.eval_expr(env, subject)?;
                for arm in arms {
                    match &arm.pattern {
                        Pattern::Literal(lit) if subj.loose_eq(&eval_literal(lit)) => {
                            return self.eval_expr(env, &arm.value);
                        }
                        Pattern::Literal(_) => {}
                        Pattern::Wildcard => return self.eval_expr(env, &arm.value),
                        Pattern::Binding(name) => {
                            env.push_scope();
                            env.declare(name, subj);
                            let result = self.eval_expr(env, &arm.value);
                            env.pop_scope();
                            return result;
                        }
                    }
                }
                Ok(Value::Null)
            }
        }
    }
}

fn eval_literal(lit: &Literal) -> Value {
    match lit {
        Literal::Int(n) => Value::Int(*n),
        Literal::Float(x) => Value::Float(*x),
        Literal::Str(s) => Value::Str(s.clone()),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use std::sync::Mutex;
    use std::time::Duration;

    fn run_get(source: &str, locals: Vec<(&str, Value)>) -> Result<Value> {
        let module = parse_source(source).unwrap();
        let route = module.routes().next().unwrap();
        let locals = locals.into_iter().map(|(k, v)| (k.to_string(), v));
        Interpreter::new(&module).run_route(route.method, &route.path, locals)
    }

    #[test]
    fn interpret_object_route() {
        let v = run_get(r#"@ GET /test { > {status: "ok"} }"#, vec![]).unwrap();
        assert_eq!(v, Value::object([("status", Value::str("ok"))]));
    }

    #[test]
    fn interpret_for_sum() {
        let v = run_get("@ GET /t { $ s = 0\n for x in [1, 2, 3] { s = s + x }\n > s }", vec![]).unwrap();
        assert_eq!(v, Value::Int(6));
    }

    #[test]
    fn interpret_path_param_concat() {
        let v = run_get(r#"@ GET /u/:id { > "user-" + id }"#, vec![("id", Value::str("42"))]).unwrap();
        assert_eq!(v, Value::str("user-42"));
    }

    #[test]
    fn interpret_plus_rejects_string_and_int() {
        let err = run_get(r#"@ GET /t { > "hello" + 5 }"#, vec![]).unwrap_err();
        assert!(err.to_string().contains("cannot apply '+' to string and int"), "{}", err);
        let err = run_get("@ GET /t {\n $ s = \"hello\"\n > s + input\n}", vec![("input", Value::Int(5))]);
        assert!(err.is_err());
    }

    #[test]
    fn interpret_match_first_arm_wins() {
        let src = "@ GET /t {\n > match input {\n 200 => \"ok\"\n 404 => \"missing\"\n n => n * 2\n _ => \"never\"\n }\n}";
        assert_eq!(run_get(src, vec![("input", Value::Int(404))]).unwrap(), Value::str("missing"));
        assert_eq!(run_get(src, vec![("input", Value::Int(7))]).unwrap(), Value::Int(14));
    }

    #[test]
    fn interpret_match_without_matching_arm_is_null() {
        let src = r#"@ GET /t { > match input { "a" => 1, "b" => 2 } }"#;
        assert_eq!(run_get(src, vec![("input", Value::str("c"))]).unwrap(), Value::Null);
        assert_eq!(run_get(src, vec![("input", Value::str("b"))]).unwrap(), Value::Int(2));
    }

    #[test]
    fn interpret_let_updates_enclosing_binding() {
        let v = run_get("@ GET /t { $ x = 1\n if true { $ x = 2 }\n > x }", vec![]).unwrap();
        assert_eq!(v, Value::Int(2));
    }

    #[test]
    fn interpret_recursion_and_isolation() {
        let src = "fn fib(n: int) -> int { if n < 2 { > n } > fib(n - 1) + fib(n - 2) }
            @ GET /t { $ n = 100\n > fib(10) + n }";
        assert_eq!(run_get(src, vec![]).unwrap(), Value::Int(155));
    }

    #[test]
    fn interpret_switch_and_loops() {
        let src = "@ GET /t {
            $ out = []
            for i in [1, 2, 3, 4] {
                switch i { case 2 { continue } case 4 { break } default { out = out + [i] } }
            }
            > out
        }";
        assert_eq!(run_get(src, vec![]).unwrap(), Value::Array(vec![Value::Int(1), Value::Int(3)]));
    }

    #[test]
    fn interpret_no_return_is_null() {
        assert_eq!(run_get("@ GET /t { $ a = 1 }", vec![]).unwrap(), Value::Null);
    }

    #[test]
    fn interpret_errors() {
        let err = run_get("@ GET /t { > 1 / 0 }", vec![]).unwrap_err();
        assert_eq!(err.to_string(), "Runtime error: division by zero");
        let err = run_get("@ GET /t { > missing }", vec![]).unwrap_err();
        assert!(err.to_string().contains("undefined variable: missing"));
        let err = run_get("@ GET /t { if 1 { > 1 } }", vec![]).unwrap_err();
        assert!(matches!(err, RuntimeError::Failed { .. }));
    }

    #[test]
    fn interpret_depth_limit() {
        let err = run_get("fn f(n) { > f(n) }\n@ GET /t { > f(1) }", vec![]).unwrap_err();
        assert!(err.to_string().contains("call depth"));
    }

    #[test]
    fn depth_limit_matches_vm_config() {
        use crate::compiler::{Compiler, OptLevel};
        use crate::vm::Vm;

        // d(31) .. d(0) is 32 nested calls.
        let module = parse_source("fn d(n) {\n if n == 0 { > 0 }\n > d(n - 1)\n}\n@ GET /t { > d(31) }").unwrap();
        let bytes = Compiler::new(OptLevel::Basic).compile(&module).unwrap().routes[0].bytecode.clone();
        for (limit, ok) in [(32, true), (31, false)] {
            let config = VmConfig { max_call_depth: limit, ..VmConfig::default() };
            let interpreted = Interpreter::new(&module).with_config(&config).run_route(HttpMethod::Get, "/t", Vec::<(String, Value)>::new());
            let mut vm = Vm::with_config(config);
            vm.set_local("query", Value::Null);
            vm.set_local("input", Value::Null);
            let compiled = vm.execute(&bytes);
            assert_eq!(interpreted.is_ok(), ok, "limit {}: {:?}", limit, interpreted);
            assert_eq!(compiled.is_ok(), ok, "limit {}: {:?}", limit, compiled);
        }
    }

    struct Joins(Mutex<Vec<String>>);

    impl HostCallBridge for Joins {
        fn send(&self, _m: &Value) -> std::result::Result<(), HostError> {
            Err(HostError::ConnectionClosed)
        }
        fn broadcast(&self, _m: &Value) -> std::result::Result<(), HostError> {
            Ok(())
        }
        fn broadcast_to_room(&self, _r: &str, _m: &Value) -> std::result::Result<(), HostError> {
            Ok(())
        }
        fn join_room(&self, room: &str) -> std::result::Result<(), HostError> {
            self.0.lock().unwrap().push(room.to_string());
            Ok(())
        }
        fn leave_room(&self, _r: &str) -> std::result::Result<(), HostError> {
            Ok(())
        }
        fn close(&self, _reason: &str) -> std::result::Result<(), HostError> {
            Ok(())
        }
        fn get_rooms(&self) -> std::result::Result<Vec<String>, HostError> {
            Ok(self.0.lock().unwrap().clone())
        }
        fn get_room_clients(&self, _r: &str) -> std::result::Result<Vec<String>, HostError> {
            Ok(vec![])
        }
        fn get_connection_id(&self) -> std::result::Result<String, HostError> {
            Ok("x".into())
        }
        fn get_connection_count(&self) -> std::result::Result<usize, HostError> {
            Ok(0)
        }
        fn get_uptime(&self) -> std::result::Result<Duration, HostError> {
            Ok(Duration::ZERO)
        }
    }

    #[test]
    fn interpret_websocket_events() {
        let module = parse_source(
            "@ ws /chat/:room {\n on connect { ws.join(room)\n > ws.get_rooms() }\n on message { ws.send(input) } }",
        )
        .unwrap();
        let bridge = Arc::new(Joins(Mutex::new(Vec::new())));
        let interp = Interpreter::new(&module).with_bridge(bridge.clone());
        let locals = || vec![("room".to_string(), Value::str("r1")), ("client".to_string(), Value::Null)];

        let rooms = interp.run_websocket_event("/chat/:room", WsEvent::Connect, locals()).unwrap();
        assert_eq!(rooms, Value::Array(vec![Value::str("r1")]));

        let mut with_input = locals();
        with_input.push(("input".to_string(), Value::str("hi")));
        let err = interp.run_websocket_event("/chat/:room", WsEvent::Message, with_input).unwrap_err();
        assert_eq!(err, RuntimeError::Host(HostError::ConnectionClosed));

        assert_eq!(interp.run_websocket_event("/chat/:room", WsEvent::Error, locals()).unwrap(), Value::Null);
    }

    #[test]
    fn interpret_host_call_without_bridge() {
        let module = parse_source("@ ws /c { on connect { ws.send(1) } }").unwrap();
        let err = Interpreter::new(&module).run_websocket_event("/c", WsEvent::Connect, Vec::new()).unwrap_err();
        assert!(err.to_string().contains("no host call bridge"));
    }
}
