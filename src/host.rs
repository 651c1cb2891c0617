//! WebSocket side effects reachable from compiled programs as `ws.*` calls.
//!
//! The VM and the interpreter only see the [`HostCallBridge`] trait; the
//! transport layer that owns sockets and rooms implements it.

use std::time::Duration;

use tracing::debug;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HostError {
    #[error("room not found: {room}")]
    RoomNotFound { room: String },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("{0}")]
    Failed(String),
}

/// Side-effect capabilities of one WebSocket connection.
///
/// Calls are synchronous from the caller's side. Implementations are shared
/// across VM instances, so any fan-out to other connections is theirs to
/// synchronize.
pub trait HostCallBridge: Send + Sync {
    fn send(&self, message: &Value) -> Result<(), HostError>;
    fn broadcast(&self, message: &Value) -> Result<(), HostError>;
    fn broadcast_to_room(&self, room: &str, message: &Value) -> Result<(), HostError>;
    fn join_room(&self, room: &str) -> Result<(), HostError>;
    fn leave_room(&self, room: &str) -> Result<(), HostError>;
    fn close(&self, reason: &str) -> Result<(), HostError>;
    fn get_rooms(&self) -> Result<Vec<String>, HostError>;
    fn get_room_clients(&self, room: &str) -> Result<Vec<String>, HostError>;
    fn get_connection_id(&self) -> Result<String, HostError>;
    fn get_connection_count(&self) -> Result<usize, HostError>;
    fn get_uptime(&self) -> Result<Duration, HostError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCall {
    Send,
    Broadcast,
    BroadcastToRoom,
    Join,
    Leave,
    Close,
    GetRooms,
    GetRoomClients,
    GetConnectionId,
    GetConnectionCount,
    GetUptime,
}

impl HostCall {
    pub fn from_name(name: &str) -> Option<HostCall> {
        Some(match name {
            "ws.send" => HostCall::Send,
            "ws.broadcast" => HostCall::Broadcast,
            "ws.broadcast_to_room" => HostCall::BroadcastToRoom,
            "ws.join" => HostCall::Join,
            "ws.leave" => HostCall::Leave,
            "ws.close" => HostCall::Close,
            "ws.get_rooms" => HostCall::GetRooms,
            "ws.get_room_clients" | "ws.get_room_users" => HostCall::GetRoomClients,
            "ws.get_connection_id" => HostCall::GetConnectionId,
            "ws.get_connection_count" => HostCall::GetConnectionCount,
            "ws.get_uptime" => HostCall::GetUptime,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            HostCall::Send => "ws.send",
            HostCall::Broadcast => "ws.broadcast",
            HostCall::BroadcastToRoom => "ws.broadcast_to_room",
            HostCall::Join => "ws.join",
            HostCall::Leave => "ws.leave",
            HostCall::Close => "ws.close",
            HostCall::GetRooms => "ws.get_rooms",
            HostCall::GetRoomClients => "ws.get_room_clients",
            HostCall::GetConnectionId => "ws.get_connection_id",
            HostCall::GetConnectionCount => "ws.get_connection_count",
            HostCall::GetUptime => "ws.get_uptime",
        }
    }

    /// Accepted argument counts, inclusive.
    pub fn arity(self) -> (usize, usize) {
        match self {
            HostCall::Send | HostCall::Broadcast => (1, 1),
            HostCall::BroadcastToRoom => (2, 2),
            HostCall::Join | HostCall::Leave | HostCall::GetRoomClients => (1, 1),
            HostCall::Close => (0, 1),
            HostCall::GetRooms | HostCall::GetConnectionId | HostCall::GetConnectionCount | HostCall::GetUptime => {
                (0, 0)
            }
        }
    }

    pub fn accepts(self, argc: usize) -> bool {
        let (min, max) = self.arity();
        (min..=max).contains(&argc)
    }

    /// Calls that produce no value. In statement position they compile to
    /// `CALL_VOID`; as expressions they evaluate to `null`.
    pub fn is_void(self) -> bool {
        matches!(
            self,
            HostCall::Send
                | HostCall::Broadcast
                | HostCall::BroadcastToRoom
                | HostCall::Join
                | HostCall::Leave
                | HostCall::Close
        )
    }

    pub fn returns_string(self) -> bool {
        self == HostCall::GetConnectionId
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostCallError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("{call}: {message}")]
    Argument { call: &'static str, message: String },
}

fn room_arg<'a>(call: HostCall, args: &'a [Value], idx: usize) -> Result<&'a str, HostCallError> {
    match args.get(idx) {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(HostCallError::Argument {
            call: call.name(),
            message: format!("room must be a string, got {}", other.type_name()),
        }),
        None => Err(HostCallError::Argument { call: call.name(), message: "missing room".into() }),
    }
}

fn message_arg(call: HostCall, args: &[Value], idx: usize) -> Result<&Value, HostCallError> {
    args.get(idx)
        .ok_or_else(|| HostCallError::Argument { call: call.name(), message: "missing message".into() })
}

fn strings(items: Vec<String>) -> Value {
    Value::Array(items.into_iter().map(Value::Str).collect())
}

/// Run one host call against `bridge`. Void calls return `Value::Null`.
pub fn invoke(call: HostCall, bridge: &dyn HostCallBridge, args: &[Value]) -> Result<Value, HostCallError> {
    if !call.accepts(args.len()) {
        let (min, max) = call.arity();
        return Err(HostCallError::Argument {
            call: call.name(),
            message: format!("expected {}..={} arguments, got {}", min, max, args.len()),
        });
    }
    debug!(call = call.name(), argc = args.len(), "host call");
    let result = match call {
        HostCall::Send => bridge.send(message_arg(call, args, 0)?).map(|_| Value::Null),
        HostCall::Broadcast => bridge.broadcast(message_arg(call, args, 0)?).map(|_| Value::Null),
        HostCall::BroadcastToRoom => {
            let room = room_arg(call, args, 0)?;
            bridge.broadcast_to_room(room, message_arg(call, args, 1)?).map(|_| Value::Null)
        }
        HostCall::Join => bridge.join_room(room_arg(call, args, 0)?).map(|_| Value::Null),
        HostCall::Leave => bridge.leave_room(room_arg(call, args, 0)?).map(|_| Value::Null),
        HostCall::Close => {
            let reason = match args.first() {
                Some(Value::Str(s)) => s.as_str(),
                Some(other) => {
                    return Err(HostCallError::Argument {
                        call: call.name(),
                        message: format!("reason must be a string, got {}", other.type_name()),
                    });
                }
                None => "",
            };
            bridge.close(reason).map(|_| Value::Null)
        }
        HostCall::GetRooms => bridge.get_rooms().map(strings),
        HostCall::GetRoomClients => bridge.get_room_clients(room_arg(call, args, 0)?).map(strings),
        HostCall::GetConnectionId => bridge.get_connection_id().map(Value::Str),
        HostCall::GetConnectionCount => bridge.get_connection_count().map(|n| Value::Int(n as i64)),
        HostCall::GetUptime => bridge.get_uptime().map(|d| Value::Int(d.as_secs() as i64)),
    };
    Ok(result?)
}
