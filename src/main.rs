use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use glyph::ast::{HttpMethod, Module, SourceMap, Span, WsEvent};
use glyph::bytecode::image::IMAGE_MAGIC;
use glyph::bytecode::{self, BytecodeModule, ProgramImage};
use glyph::compiler::{self, CompileError, CompiledProgram, Compiler, OptLevel};
use glyph::host::{HostCallBridge, HostError};
use glyph::interpreter::Interpreter;
use glyph::parser::{self, SourceError};
use glyph::value::Value;
use glyph::vm::{Vm, VmConfig};

#[derive(Parser, Debug)]
#[command(name = "glyph", version, about = "Compile and run Glyph HTTP/WebSocket handlers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the parsed AST as JSON
    Ast { file: PathBuf },

    /// Compile a source file into a program image
    Compile {
        file: PathBuf,
        /// Output path (defaults to the source path with a .glyc extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Optimization level: none, basic or aggressive
        #[arg(long, default_value = "basic")]
        opt: OptLevel,
    },

    /// Disassemble a source file or a compiled image
    Disasm {
        file: PathBuf,
        #[arg(long, default_value = "basic")]
        opt: OptLevel,
    },

    /// Run one HTTP route and print its result as JSON
    Run {
        file: PathBuf,
        /// Route to run, e.g. "GET /users/:id"
        #[arg(long)]
        route: String,
        /// Path parameter, as name=value (repeatable)
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
        /// Query parameter, as name=value (repeatable)
        #[arg(long = "query", value_name = "NAME=VALUE")]
        query: Vec<String>,
        /// Request body as JSON
        #[arg(long)]
        input: Option<String>,
        /// Use the tree-walking interpreter instead of the VM
        #[arg(long)]
        interp: bool,
        #[arg(long, default_value = "basic")]
        opt: OptLevel,
        #[arg(long)]
        max_steps: Option<u64>,
        #[arg(long)]
        max_stack: Option<usize>,
    },

    /// Run one WebSocket event against a logging host bridge
    Ws {
        file: PathBuf,
        /// Route pattern, e.g. "/chat/:room"
        #[arg(long)]
        path: String,
        /// connect, message, disconnect or error
        #[arg(long, default_value = "connect")]
        event: String,
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
        /// Message (or error) payload as JSON
        #[arg(long)]
        input: Option<String>,
        #[arg(long)]
        interp: bool,
        #[arg(long, default_value = "basic")]
        opt: OptLevel,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("GLYPH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("error: {}", msg);
    process::exit(1);
}

fn read_source(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|e| fail(format!("cannot read {}: {}", path.display(), e)))
}

fn located(path: &Path, source: &str, span: Span) -> String {
    format!("{}:{}", path.display(), SourceMap::new(source).location(span))
}

fn parse_file(path: &Path, source: &str) -> Module {
    match parser::parse_source(source) {
        Ok(module) => module,
        Err(SourceError::Parse(errors)) => {
            for e in &errors {
                eprintln!("{}: error[{}]: {}", located(path, source, e.span), e.code, e.message);
            }
            process::exit(1);
        }
        Err(e) => fail(e),
    }
}

fn compile_module(path: &Path, source: &str, module: &Module, opt: OptLevel) -> CompiledProgram {
    Compiler::new(opt).compile(module).unwrap_or_else(|e: CompileError| {
        eprintln!("{}: error: {}", located(path, source, e.span()), e);
        process::exit(1);
    })
}

fn key_values(pairs: &[String]) -> Vec<(String, Value)> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), Value::str(v)),
            None => fail(format!("expected NAME=VALUE, got '{}'", pair)),
        })
        .collect()
}

fn json_input(input: Option<&str>) -> Value {
    match input {
        Some(text) => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(json) => Value::from_json(&json),
            Err(e) => fail(format!("--input is not valid JSON: {}", e)),
        },
        None => Value::Null,
    }
}

/// Path parameters from `--param`, in pattern order. Every one must be given.
fn path_locals(pattern: &str, params: &[String]) -> Vec<(String, Value)> {
    let given = key_values(params);
    compiler::path_params(pattern)
        .into_iter()
        .map(|name| match given.iter().find(|(k, _)| *k == name) {
            Some((_, v)) => (name, v.clone()),
            None => fail(format!("missing --param {}=...", name)),
        })
        .collect()
}

fn print_result(value: &Value) {
    match serde_json::to_string_pretty(&value.to_json()) {
        Ok(json) => println!("{}", json),
        Err(e) => fail(e),
    }
}

/// Prints every host call to stderr.
struct LoggingBridge {
    id: String,
    started: Instant,
}

impl LoggingBridge {
    fn new() -> Self {
        LoggingBridge { id: format!("conn-{:08x}", fastrand::u32(..)), started: Instant::now() }
    }

    fn log(&self, line: String) -> Result<(), HostError> {
        eprintln!("[{}] {}", self.id, line);
        Ok(())
    }
}

impl HostCallBridge for LoggingBridge {
    fn send(&self, message: &Value) -> Result<(), HostError> {
        self.log(format!("send {}", message))
    }
    fn broadcast(&self, message: &Value) -> Result<(), HostError> {
        self.log(format!("broadcast {}", message))
    }
    fn broadcast_to_room(&self, room: &str, message: &Value) -> Result<(), HostError> {
        self.log(format!("broadcast_to_room {} {}", room, message))
    }
    fn join_room(&self, room: &str) -> Result<(), HostError> {
        self.log(format!("join {}", room))
    }
    fn leave_room(&self, room: &str) -> Result<(), HostError> {
        self.log(format!("leave {}", room))
    }
    fn close(&self, reason: &str) -> Result<(), HostError> {
        self.log(format!("close '{}'", reason))
    }
    fn get_rooms(&self) -> Result<Vec<String>, HostError> {
        Ok(Vec::new())
    }
    fn get_room_clients(&self, _room: &str) -> Result<Vec<String>, HostError> {
        Ok(vec![self.id.clone()])
    }
    fn get_connection_id(&self) -> Result<String, HostError> {
        Ok(self.id.clone())
    }
    fn get_connection_count(&self) -> Result<usize, HostError> {
        Ok(1)
    }
    fn get_uptime(&self) -> Result<Duration, HostError> {
        Ok(self.started.elapsed())
    }
}

fn cmd_ast(file: &Path) {
    let source = read_source(file);
    let module = parse_file(file, &source);
    match serde_json::to_string_pretty(&module) {
        Ok(json) => println!("{}", json),
        Err(e) => fail(format!("serialization error: {}", e)),
    }
}

fn cmd_compile(file: &Path, output: Option<PathBuf>, opt: OptLevel) {
    let source = read_source(file);
    let module = parse_file(file, &source);
    let program = compile_module(file, &source, &module, opt);
    let bytes = program.to_image().encode();
    let output = output.unwrap_or_else(|| file.with_extension("glyc"));
    if let Err(e) = std::fs::write(&output, &bytes) {
        fail(format!("cannot write {}: {}", output.display(), e));
    }
    println!(
        "compiled {} route(s), {} websocket route(s) -> {} ({} bytes)",
        program.routes.len(),
        program.websockets.len(),
        output.display(),
        bytes.len()
    );
}

fn cmd_disasm(file: &Path, opt: OptLevel) {
    let bytes = std::fs::read(file).unwrap_or_else(|e| fail(format!("cannot read {}: {}", file.display(), e)));
    let image = if bytes.starts_with(&IMAGE_MAGIC) {
        ProgramImage::decode(&bytes).unwrap_or_else(|e| fail(e))
    } else {
        let source = String::from_utf8(bytes).unwrap_or_else(|_| fail("source is not valid UTF-8"));
        let module = parse_file(file, &source);
        compile_module(file, &source, &module, opt).to_image()
    };
    for entry in &image.entries {
        let module = BytecodeModule::decode(&entry.module).unwrap_or_else(|e| fail(format!("{}: {}", entry.key, e)));
        println!("== {} ==", entry.key);
        print!("{}", bytecode::disassemble(&module));
    }
}

struct RunArgs {
    route: String,
    params: Vec<String>,
    query: Vec<String>,
    input: Option<String>,
    interp: bool,
    opt: OptLevel,
    config: VmConfig,
}

fn cmd_run(file: &Path, args: RunArgs) {
    let (method, path) = match args.route.split_once(' ') {
        Some((m, p)) => match HttpMethod::parse(m) {
            Some(method) => (method, p.trim().to_string()),
            None => fail(format!("unknown HTTP method '{}'", m)),
        },
        None => fail(format!("expected --route \"METHOD /path\", got '{}'", args.route)),
    };
    let source = read_source(file);
    let module = parse_file(file, &source);

    let mut locals = path_locals(&path, &args.params);
    locals.push(("query".into(), Value::Object(key_values(&args.query).into_iter().collect())));
    locals.push(("input".into(), json_input(args.input.as_deref())));

    let result = if args.interp {
        Interpreter::new(&module).with_config(&args.config).run_route(method, &path, locals).map_err(|e| e.to_string())
    } else {
        let program = compile_module(file, &source, &module, args.opt);
        let Some(route) = program.route(method, &path) else {
            fail(format!("no route {} {}", method, path));
        };
        let mut vm = Vm::with_config(args.config);
        for (name, value) in locals {
            vm.set_local(name, value);
        }
        vm.execute(&route.bytecode).map_err(|e| e.to_string())
    };
    match result {
        Ok(value) => print_result(&value),
        Err(e) => fail(e),
    }
}

fn cmd_ws(file: &Path, path: &str, event: &str, params: &[String], input: Option<&str>, interp: bool, opt: OptLevel) {
    let Some(event) = WsEvent::parse(event) else {
        fail(format!("unknown event '{}'; use connect, message, disconnect or error", event));
    };
    let source = read_source(file);
    let module = parse_file(file, &source);
    let bridge = Arc::new(LoggingBridge::new());

    let mut locals = path_locals(path, params);
    locals.push(("client".into(), Value::object([("id", Value::str(bridge.id.clone()))])));
    match event {
        WsEvent::Message => locals.push(("input".into(), json_input(input))),
        WsEvent::Error => locals.push(("error".into(), json_input(input))),
        WsEvent::Connect | WsEvent::Disconnect => {}
    }

    let result = if interp {
        Interpreter::new(&module).with_bridge(bridge).run_websocket_event(path, event, locals).map_err(|e| e.to_string())
    } else {
        let program = compile_module(file, &source, &module, opt);
        let Some(ws) = program.websocket(path) else {
            fail(format!("no websocket route {}", path));
        };
        match ws.event(event) {
            Some(bytes) => {
                let mut vm = Vm::new();
                vm.set_host_call_bridge(bridge);
                for (name, value) in locals {
                    vm.set_local(name, value);
                }
                vm.execute(bytes).map_err(|e| e.to_string())
            }
            None => Ok(Value::Null),
        }
    };
    match result {
        Ok(value) => print_result(&value),
        Err(e) => fail(e),
    }
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Ast { file } => cmd_ast(&file),
        Command::Compile { file, output, opt } => cmd_compile(&file, output, opt),
        Command::Disasm { file, opt } => cmd_disasm(&file, opt),
        Command::Run { file, route, params, query, input, interp, opt, max_steps, max_stack } => {
            let defaults = VmConfig::default();
            let config = VmConfig {
                max_stack: max_stack.unwrap_or(defaults.max_stack),
                max_steps,
                max_call_depth: defaults.max_call_depth,
            };
            cmd_run(&file, RunArgs { route, params, query, input, interp, opt, config });
        }
        Command::Ws { file, path, event, params, input, interp, opt } => {
            cmd_ws(&file, &path, &event, &params, input.as_deref(), interp, opt)
        }
    }
}
