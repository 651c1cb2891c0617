use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use glyph::ast::HttpMethod;
use glyph::parser::parse_source;
use glyph::{Compiler, HostCallBridge, HostError, OptLevel, Value, Vm, VmError};

fn compile(source: &str) -> glyph::CompiledProgram {
    Compiler::new(OptLevel::Basic).compile(&parse_source(source).unwrap()).unwrap()
}

fn http_vm() -> Vm {
    let mut vm = Vm::new();
    vm.set_local("query", Value::Object(Default::default()));
    vm.set_local("input", Value::Null);
    vm
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    fn record(&self, call: &str, arg: impl ToString) -> Result<(), HostError> {
        self.calls.lock().unwrap().push((call.to_string(), arg.to_string()));
        Ok(())
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl HostCallBridge for Recorder {
    fn send(&self, message: &Value) -> Result<(), HostError> {
        self.record("send", message)
    }
    fn broadcast(&self, message: &Value) -> Result<(), HostError> {
        self.record("broadcast", message)
    }
    fn broadcast_to_room(&self, room: &str, _message: &Value) -> Result<(), HostError> {
        self.record("broadcastToRoom", room)
    }
    fn join_room(&self, room: &str) -> Result<(), HostError> {
        self.record("joinRoom", room)
    }
    fn leave_room(&self, room: &str) -> Result<(), HostError> {
        self.record("leaveRoom", room)
    }
    fn close(&self, reason: &str) -> Result<(), HostError> {
        self.record("close", reason)
    }
    fn get_rooms(&self) -> Result<Vec<String>, HostError> {
        Ok(vec![])
    }
    fn get_room_clients(&self, _room: &str) -> Result<Vec<String>, HostError> {
        Ok(vec![])
    }
    fn get_connection_id(&self) -> Result<String, HostError> {
        Ok("conn".into())
    }
    fn get_connection_count(&self) -> Result<usize, HostError> {
        Ok(1)
    }
    fn get_uptime(&self) -> Result<Duration, HostError> {
        Ok(Duration::from_secs(1))
    }
}

#[test]
fn compile_is_byte_identical() {
    let source = r#"
        fn greet(name: str) -> str { > "hello " + name }
        @ GET /users/:id {
          $ tags = []
          for k, v in {b: 2, a: 1} { tags = tags + [k] }
          > {id: id, greeting: greet(id), tags: tags}
        }
        @ ws /chat/:room { on connect { ws.join(room) } on message { ws.broadcast_to_room(room, input) } }
    "#;
    let module = parse_source(source).unwrap();
    for opt in [OptLevel::None, OptLevel::Basic, OptLevel::Aggressive] {
        let a = Compiler::new(opt).compile(&module).unwrap();
        let b = Compiler::new(opt).compile(&module).unwrap();
        assert_eq!(a.to_image().encode(), b.to_image().encode());
    }
}

#[test]
fn example_route_end_to_end() {
    let program = compile(r#"@ GET /test { > {status: "ok"} }"#);
    let bytes = &program.route(HttpMethod::Get, "/test").unwrap().bytecode;
    assert_eq!(&bytes[..4], b"GLYP");

    let mut vm = http_vm();
    let result = vm.execute(bytes).unwrap();
    assert_eq!(result, Value::object([("status", Value::str("ok"))]));
    assert_eq!(vm.stack_size(), 0);
}

#[test]
fn loop_sum_is_six() {
    let program = compile("@ GET /sum {\n $ total = 0\n for n in [1, 2, 3] { total = total + n }\n > total\n}");
    let mut vm = http_vm();
    assert_eq!(vm.execute(&program.routes[0].bytecode).unwrap(), Value::Int(6));
    assert_eq!(vm.stack_size(), 0);
}

#[test]
fn header_validation() {
    let mut vm = Vm::new();
    for bad in [&b""[..], &b"GLYP"[..], &b"GLYP\x01\x00\x00"[..], &b"ABCD\x01\x00\x00\x00\x00\x00"[..], &b"glyp\x01\x00\x00\x00"[..]] {
        let err = vm.execute(bad).unwrap_err();
        assert!(matches!(err, VmError::MalformedHeader { .. }), "{:?} gave {:?}", bad, err);
    }
    assert_eq!(vm.stack_size(), 0);
    assert_eq!(vm.locals_count(), 0);
}

#[test]
fn error_then_valid_execute() {
    let program = compile("@ GET /ok { > 40 + 2 }");
    let mut vm = http_vm();
    assert!(vm.execute(b"not bytecode").is_err());
    let mut truncated = program.routes[0].bytecode.clone();
    truncated.truncate(truncated.len() - 3);
    assert!(matches!(vm.execute(&truncated), Err(VmError::MalformedModule { .. })));
    assert_eq!(vm.execute(&program.routes[0].bytecode).unwrap(), Value::Int(42));
    assert_eq!(vm.stack_size(), 0);
}

#[test]
fn reset_clears_state() {
    let program = compile("@ GET /t { $ a = [1, 2]\n > a }");
    let mut vm = http_vm();
    vm.execute(&program.routes[0].bytecode).unwrap();
    vm.push(Value::Int(1)).unwrap();
    vm.reset();
    assert_eq!(vm.stack_size(), 0);
    assert_eq!(vm.locals_count(), 0);
    assert_eq!(vm.iterator_count(), 0);
}

#[test]
fn concurrent_instances_are_isolated() {
    let program = compile("@ GET /u/:id {\n $ acc = 0\n for i in [1, 2, 3, 4] { acc = acc + i }\n > {id: id, acc: acc}\n}");
    let bytes = Arc::new(program.routes[0].bytecode.clone());

    let handles: Vec<_> = (0..10)
        .map(|t| {
            let bytes = Arc::clone(&bytes);
            thread::spawn(move || {
                let mut vm = http_vm();
                vm.set_local("id", Value::str(format!("t{}", t)));
                for _ in 0..100 {
                    let result = vm.execute(&bytes).unwrap();
                    assert_eq!(result, Value::object([("id", Value::str(format!("t{}", t))), ("acc", Value::Int(10))]));
                    assert_eq!(vm.stack_size(), 0);
                }
                vm.stack_size()
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), 0);
    }
}

#[test]
fn void_host_call_does_not_underflow() {
    let program = compile("@ ws /chat/:room { on connect { ws.join(room) } }");
    let mut vm = Vm::new();
    vm.set_host_call_bridge(Arc::new(Recorder::default()));
    vm.set_local("room", Value::str("r"));
    vm.set_local("client", Value::Null);
    let result = vm.execute(&program.websockets[0].on_connect);
    assert_eq!(result, Ok(Value::Null));
    assert_eq!(vm.stack_size(), 0);
}

#[test]
fn path_parameters_reach_the_bridge() {
    let program = compile(
        "@ ws /chat/:room { on connect { ws.join(room) } on message { ws.broadcast_to_room(room, input) } }",
    );
    let ws = program.websocket("/chat/:room").unwrap();
    let recorder = Arc::new(Recorder::default());

    let mut vm = Vm::new();
    vm.set_host_call_bridge(recorder.clone());
    vm.set_local("room", Value::str("testroom"));
    vm.set_local("client", Value::Null);
    vm.execute(&ws.on_connect).unwrap();
    vm.set_local("input", Value::str("hello"));
    vm.execute(&ws.on_message).unwrap();

    assert_eq!(
        recorder.calls(),
        vec![("joinRoom".to_string(), "testroom".to_string()), ("broadcastToRoom".to_string(), "testroom".to_string())]
    );
}

#[test]
fn iterators_are_released() {
    let program = compile("@ GET /t { $ s = 0\n for x in [1, 2, 3] { s = s + x }\n > s }");
    let mut vm = http_vm();
    for _ in 0..50 {
        vm.execute(&program.routes[0].bytecode).unwrap();
    }
    assert_eq!(vm.iterator_count(), 0);
}

#[test]
fn host_error_passes_through() {
    struct Closed;
    impl HostCallBridge for Closed {
        fn send(&self, _m: &Value) -> Result<(), HostError> {
            Err(HostError::ConnectionClosed)
        }
        fn broadcast(&self, _m: &Value) -> Result<(), HostError> {
            Ok(())
        }
        fn broadcast_to_room(&self, _r: &str, _m: &Value) -> Result<(), HostError> {
            Ok(())
        }
        fn join_room(&self, _r: &str) -> Result<(), HostError> {
            Ok(())
        }
        fn leave_room(&self, _r: &str) -> Result<(), HostError> {
            Ok(())
        }
        fn close(&self, _reason: &str) -> Result<(), HostError> {
            Ok(())
        }
        fn get_rooms(&self) -> Result<Vec<String>, HostError> {
            Ok(vec![])
        }
        fn get_room_clients(&self, _r: &str) -> Result<Vec<String>, HostError> {
            Ok(vec![])
        }
        fn get_connection_id(&self) -> Result<String, HostError> {
            Ok(String::new())
        }
        fn get_connection_count(&self) -> Result<usize, HostError> {
            Ok(0)
        }
        fn get_uptime(&self) -> Result<Duration, HostError> {
            Ok(Duration::ZERO)
        }
    }

    let program = compile("@ ws /c { on message { ws.send(input) } }");
    let mut vm = Vm::new();
    vm.set_host_call_bridge(Arc::new(Closed));
    vm.set_local("client", Value::Null);
    vm.set_local("input", Value::Int(1));
    let err = vm.execute(&program.websockets[0].on_message).unwrap_err();
    assert_eq!(err, VmError::Host(HostError::ConnectionClosed));
    assert_eq!(vm.stack_size(), 0);
}

#[test]
fn image_round_trip_through_program_host() {
    use glyph::reload::{ProgramHost, ServerInterface};
    let program = compile("@ GET /items/:id { > {id: id, page: query.page} }");
    let host = ProgramHost::default();
    host.reload(&program.to_image().encode()).unwrap();
    let query = Value::object([("page", Value::Int(3))]);
    let v = host.dispatch(HttpMethod::Get, "/items/abc", query, Value::Null).unwrap();
    assert_eq!(v, Value::object([("id", Value::str("abc")), ("page", Value::Int(3))]));
}
