//! Hot-reload capabilities.
//!
//! [`CompilerInterface`] turns a source file into program-image bytes and
//! [`ServerInterface`] is whatever hosts the VMs. [`hot_swap`] drives one
//! reload between them. File watching is left to the caller.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, instrument, warn};

use crate::ast::{HttpMethod, WsEvent};
use crate::bytecode::{BytecodeModule, DecodeError, EntryKind, ProgramImage};
use crate::compiler::{CompileError, Compiler, OptLevel};
use crate::host::HostCallBridge;
use crate::parser::{self, SourceError};
use crate::value::Value;
use crate::vm::{Vm, VmConfig, VmError};

/// State carried across a reload, keyed by name.
pub type ServerState = BTreeMap<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("invalid program image: {0}")]
    Image(#[from] DecodeError),
    #[error("invalid module '{key}': {source}")]
    Module {
        key: String,
        #[source]
        source: DecodeError,
    },
    #[error("invalid entry key '{key}'")]
    BadKey { key: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no route matches {method} {path}")]
    NoRoute { method: HttpMethod, path: String },
    #[error("no websocket route matches {path}")]
    NoWebSocket { path: String },
    #[error(transparent)]
    Vm(#[from] VmError),
}

pub trait CompilerInterface {
    fn compile_file(&self, path: &Path) -> Result<Vec<u8>, ReloadError>;
}

pub trait ServerInterface: Send + Sync {
    /// Validate `image` and make it the active program. On error the
    /// previous program stays active.
    fn reload(&self, image: &[u8]) -> Result<(), ReloadError>;
    fn get_state(&self) -> ServerState;
    fn set_state(&self, state: ServerState) -> Result<(), ReloadError>;
}

/// Reads, parses and compiles a source file into [`ProgramImage`] bytes.
#[derive(Debug, Clone, Default)]
pub struct FileCompiler {
    pub opt: OptLevel,
}

impl FileCompiler {
    pub fn new(opt: OptLevel) -> Self {
        FileCompiler { opt }
    }
}

impl CompilerInterface for FileCompiler {
    #[instrument(skip_all, fields(path = %path.display()))]
    fn compile_file(&self, path: &Path) -> Result<Vec<u8>, ReloadError> {
        let source =
            std::fs::read_to_string(path).map_err(|source| ReloadError::Io { path: path.to_path_buf(), source })?;
        let module = parser::parse_source(&source)?;
        let program = Compiler::new(self.opt).compile(&module)?;
        let bytes = program.to_image().encode();
        debug!(bytes = bytes.len(), "compiled file");
        Ok(bytes)
    }
}

// ── Loaded program ───────────────────────────────────────────────────

struct RouteEntry {
    method: HttpMethod,
    pattern: Vec<String>,
    module: BytecodeModule,
}

struct WebSocketEntry {
    path: String,
    pattern: Vec<String>,
    events: HashMap<WsEvent, BytecodeModule>,
}

/// A validated program image with every module decoded. Routes and
/// WebSocket routes keep declaration order; the first pattern that matches
/// a path wins.
#[derive(Default)]
pub struct LoadedProgram {
    routes: Vec<RouteEntry>,
    websockets: Vec<WebSocketEntry>,
}

fn segments(path: &str) -> Vec<String> {
    path.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

/// Match a concrete path against a `:param` pattern.
fn match_path(pattern: &[String], path: &str) -> Option<Vec<(String, Value)>> {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() != pattern.len() {
        return None;
    }
    let mut params = Vec::new();
    for (seg, part) in pattern.iter().zip(parts) {
        match seg.strip_prefix(':') {
            Some(name) => params.push((name.to_string(), Value::str(part))),
            None if seg == part => {}
            None => return None,
        }
    }
    Some(params)
}

impl LoadedProgram {
    pub fn from_image(bytes: &[u8]) -> Result<LoadedProgram, ReloadError> {
        let image = ProgramImage::decode(bytes)?;
        let mut program = LoadedProgram::default();
        for entry in &image.entries {
            let module = BytecodeModule::decode(&entry.module)
                .map_err(|source| ReloadError::Module { key: entry.key.clone(), source })?;
            let bad_key = || ReloadError::BadKey { key: entry.key.clone() };
            match entry.kind {
                EntryKind::Route => {
                    let (method, path) = entry.key.split_once(' ').ok_or_else(bad_key)?;
                    let method = HttpMethod::parse(method).ok_or_else(bad_key)?;
                    program.routes.push(RouteEntry { method, pattern: segments(path), module });
                }
                EntryKind::WsEvent => {
                    let (path, event) = entry.key.rsplit_once(' ').ok_or_else(bad_key)?;
                    let event = WsEvent::parse(event).ok_or_else(bad_key)?;
                    let index = match program.websockets.iter().position(|w| w.path == path) {
                        Some(index) => index,
                        None => {
                            program.websockets.push(WebSocketEntry {
                                path: path.to_string(),
                                pattern: segments(path),
                                events: HashMap::new(),
                            });
                            program.websockets.len() - 1
                        }
                    };
                    program.websockets[index].events.insert(event, module);
                }
            }
        }
        Ok(program)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn websocket_count(&self) -> usize {
        self.websockets.len()
    }

    fn find_route(&self, method: HttpMethod, path: &str) -> Option<(&BytecodeModule, Vec<(String, Value)>)> {
        self.routes
            .iter()
            .filter(|r| r.method == method)
            .find_map(|r| match_path(&r.pattern, path).map(|params| (&r.module, params)))
    }

    fn find_websocket(&self, path: &str) -> Option<(&HashMap<WsEvent, BytecodeModule>, Vec<(String, Value)>)> {
        self.websockets
            .iter()
            .find_map(|w| match_path(&w.pattern, path).map(|params| (&w.events, params)))
    }
}

// ── Program host ─────────────────────────────────────────────────────

/// Holds the active program and runs each request on a fresh [`Vm`].
pub struct ProgramHost {
    program: RwLock<Arc<LoadedProgram>>,
    state: Mutex<ServerState>,
    generation: AtomicU64,
    config: VmConfig,
}

impl Default for ProgramHost {
    fn default() -> Self {
        ProgramHost::new(VmConfig::default())
    }
}

impl ProgramHost {
    pub fn new(config: VmConfig) -> Self {
        ProgramHost {
            program: RwLock::new(Arc::new(LoadedProgram::default())),
            state: Mutex::new(ServerState::new()),
            generation: AtomicU64::new(0),
            config,
        }
    }

    /// Number of successful reloads.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn program(&self) -> Arc<LoadedProgram> {
        match self.program.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn state_insert(&self, key: impl Into<String>, value: Value) {
        self.lock_state().insert(key.into(), value);
    }

    pub fn state_get(&self, key: &str) -> Option<Value> {
        self.lock_state().get(key).cloned()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run the HTTP route matching `method` and `path`.
    #[instrument(skip_all, fields(method = %method, path = %path))]
    pub fn dispatch(&self, method: HttpMethod, path: &str, query: Value, input: Value) -> Result<Value, DispatchError> {
        let program = self.program();
        let (module, params) = program
            .find_route(method, path)
            .ok_or_else(|| DispatchError::NoRoute { method, path: path.to_string() })?;
        let mut vm = Vm::with_config(self.config.clone());
        for (name, value) in params {
            vm.set_local(name, value);
        }
        vm.set_local("query", query);
        vm.set_local("input", input);
        Ok(vm.run(module)?)
    }

    /// Run one WebSocket lifecycle event. `payload` becomes `input` for
    /// messages and `error` for errors; a missing handler yields `null`.
    #[instrument(skip_all, fields(path = %path, event = event.as_str()))]
    pub fn dispatch_ws(
        &self,
        path: &str,
        event: WsEvent,
        client: Value,
        payload: Value,
        bridge: Option<Arc<dyn HostCallBridge>>,
    ) -> Result<Value, DispatchError> {
        let program = self.program();
        let (events, params) =
            program.find_websocket(path).ok_or_else(|| DispatchError::NoWebSocket { path: path.to_string() })?;
        let Some(module) = events.get(&event) else {
            return Ok(Value::Null);
        };
        let mut vm = Vm::with_config(self.config.clone());
        if let Some(bridge) = bridge {
            vm.set_host_call_bridge(bridge);
        }
        for (name, value) in params {
            vm.set_local(name, value);
        }
        vm.set_local("client", client);
        match event {
            WsEvent::Message => vm.set_local("input", payload),
            WsEvent::Error => vm.set_local("error", payload),
            WsEvent::Connect | WsEvent::Disconnect => {}
        }
        Ok(vm.run(module)?)
    }
}

impl ServerInterface for ProgramHost {
    /// Swaps in the new program and starts from empty state.
    fn reload(&self, image: &[u8]) -> Result<(), ReloadError> {
        let loaded = LoadedProgram::from_image(image)?;
        let (routes, websockets) = (loaded.route_count(), loaded.websocket_count());
        {
            let mut guard = self.program.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = Arc::new(loaded);
        }
        self.lock_state().clear();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, routes, websockets, "program swapped");
        Ok(())
    }

    fn get_state(&self) -> ServerState {
        self.lock_state().clone()
    }

    fn set_state(&self, state: ServerState) -> Result<(), ReloadError> {
        self.lock_state().extend(state);
        Ok(())
    }
}

/// Save state, compile `path`, reload, restore state. Any failure leaves
/// the server on its previous program.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn hot_swap(
    compiler: &dyn CompilerInterface,
    server: &dyn ServerInterface,
    path: &Path,
) -> Result<(), ReloadError> {
    let state = server.get_state();
    let result = compiler.compile_file(path).and_then(|bytes| server.reload(&bytes));
    if let Err(err) = result {
        warn!(error = %err, "reload rejected");
        return Err(err);
    }
    let keys = state.len();
    server.set_state(state)?;
    info!(keys, "reloaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn source_file(source: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(source.as_bytes()).unwrap();
        file
    }

    #[test]
    fn path_matching() {
        let pattern = segments("/users/:id/posts");
        assert_eq!(match_path(&pattern, "/users/7/posts"), Some(vec![("id".to_string(), Value::str("7"))]));
        assert_eq!(match_path(&pattern, "/users/7"), None);
        assert_eq!(match_path(&pattern, "/teams/7/posts"), None);
    }

    #[test]
    fn dispatch_after_reload() {
        let file = source_file("@ GET /users/:id { > {id: id, q: query.page} }");
        let host = ProgramHost::default();
        hot_swap(&FileCompiler::default(), &host, file.path()).unwrap();
        assert_eq!(host.generation(), 1);

        let query = Value::object([("page", Value::Int(2))]);
        let v = host.dispatch(HttpMethod::Get, "/users/9", query, Value::Null).unwrap();
        assert_eq!(v, Value::object([("id", Value::str("9")), ("q", Value::Int(2))]));

        let err = host.dispatch(HttpMethod::Post, "/users/9", Value::Null, Value::Null).unwrap_err();
        assert!(matches!(err, DispatchError::NoRoute { .. }));
    }

    #[test]
    fn state_survives_hot_swap() {
        let file = source_file("@ GET /a { > 1 }");
        let host = ProgramHost::default();
        hot_swap(&FileCompiler::default(), &host, file.path()).unwrap();
        host.state_insert("session", Value::str("abc123"));

        std::fs::write(file.path(), "@ GET /a { > 2 }").unwrap();
        hot_swap(&FileCompiler::default(), &host, file.path()).unwrap();
        assert_eq!(host.state_get("session"), Some(Value::str("abc123")));
        assert_eq!(host.dispatch(HttpMethod::Get, "/a", Value::Null, Value::Null).unwrap(), Value::Int(2));
    }

    #[test]
    fn failed_compile_keeps_old_program() {
        let file = source_file("@ GET /a { > 1 }");
        let host = ProgramHost::default();
        hot_swap(&FileCompiler::default(), &host, file.path()).unwrap();

        std::fs::write(file.path(), "@ GET /a { > missing }").unwrap();
        let err = hot_swap(&FileCompiler::default(), &host, file.path()).unwrap_err();
        assert!(matches!(err, ReloadError::Compile(CompileError::UnresolvedSymbol { .. })));
        assert_eq!(host.generation(), 1);
        assert_eq!(host.dispatch(HttpMethod::Get, "/a", Value::Null, Value::Null).unwrap(), Value::Int(1));
    }

    #[test]
    fn corrupt_image_rejected() {
        let host = ProgramHost::default();
        assert!(matches!(host.reload(b"GLYI\x07"), Err(ReloadError::Image(_))));
        assert_eq!(host.program().route_count(), 0);
    }

    #[test]
    fn missing_file() {
        let err = FileCompiler::default().compile_file(Path::new("/nonexistent/app.glyph")).unwrap_err();
        assert!(matches!(err, ReloadError::Io { .. }));
    }

    #[test]
    fn overlapping_websocket_patterns_use_declaration_order() {
        let source = "@ ws /chat/:room { on connect { > \"param\" } }\n@ ws /chat/lobby { on connect { > \"literal\" } }";
        let reversed = "@ ws /chat/lobby { on connect { > \"literal\" } }\n@ ws /chat/:room { on connect { > \"param\" } }";
        for (text, expected) in [(source, "param"), (reversed, "literal")] {
            let file = source_file(text);
            for _ in 0..20 {
                let host = ProgramHost::default();
                hot_swap(&FileCompiler::default(), &host, file.path()).unwrap();
                let v = host.dispatch_ws("/chat/lobby", WsEvent::Connect, Value::Null, Value::Null, None).unwrap();
                assert_eq!(v, Value::str(expected));
            }
        }
    }

    #[test]
    fn websocket_dispatch_without_handler() {
        let file = source_file("@ ws /chat/:room { on message { > input + \"@\" + room } }");
        let host = ProgramHost::default();
        hot_swap(&FileCompiler::default(), &host, file.path()).unwrap();
        let v = host
            .dispatch_ws("/chat/lobby", WsEvent::Message, Value::Null, Value::str("hi"), None)
            .unwrap();
        assert_eq!(v, Value::str("hi@lobby"));
        let none = host.dispatch_ws("/chat/lobby", WsEvent::Error, Value::Null, Value::Null, None).unwrap();
        assert_eq!(none, Value::Null);
    }
}
