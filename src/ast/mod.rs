use serde::{Deserialize, Serialize};

pub mod source_map;
pub use source_map::SourceMap;

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn new(start: usize, end: usize) -> Span {
        Span { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl From<std::ops::Range<usize>> for Span {
    fn from(range: std::ops::Range<usize>) -> Self {
        Span { start: range.start, end: range.end }
    }
}

/// Wraps a node with its source span. Transparent to serde (serializes as inner node only).
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Spanned { node, span }
    }

    pub fn unknown(node: T) -> Self {
        Spanned { node, span: Span::UNKNOWN }
    }
}

impl<T> std::ops::Deref for Spanned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.node
    }
}

impl<T: Serialize> Serialize for Spanned<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.node.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Spanned<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(|node| Spanned { node, span: Span::UNKNOWN })
    }
}

pub type SExpr = Spanned<Expr>;
pub type Block = Vec<Spanned<Stmt>>;

// ---- Types ----

/// Declared types. Only used for static hints; nothing is enforced at run time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    Int,
    Float,
    Str,
    Bool,
    Any,
    Object,
    Array(Box<Type>),
    Named(String),
}

/// A parameter or field: `name: type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

// ---- Top-level items ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn parse(s: &str) -> Option<HttpMethod> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `@ GET /users/:id { ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub method: HttpMethod,
    pub path: String,
    pub body: Block,
    #[serde(skip)]
    pub span: Span,
}

impl Route {
    /// Key used to address a compiled route, e.g. `GET /users/:id`.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WsEvent {
    Connect,
    Message,
    Disconnect,
    Error,
}

impl WsEvent {
    pub fn parse(s: &str) -> Option<WsEvent> {
        match s {
            "connect" => Some(WsEvent::Connect),
            "message" => Some(WsEvent::Message),
            "disconnect" => Some(WsEvent::Disconnect),
            "error" => Some(WsEvent::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WsEvent::Connect => "connect",
            WsEvent::Message => "message",
            WsEvent::Disconnect => "disconnect",
            WsEvent::Error => "error",
        }
    }
}

/// `on message { ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsHandler {
    pub event: WsEvent,
    pub body: Block,
    #[serde(skip)]
    pub span: Span,
}

/// `@ ws /chat/:room { on connect {...} on message {...} }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketRoute {
    pub path: String,
    pub handlers: Vec<WsHandler>,
    #[serde(skip)]
    pub span: Span,
}

impl WebSocketRoute {
    pub fn handler(&self, event: WsEvent) -> Option<&WsHandler> {
        self.handlers.iter().find(|h| h.event == event)
    }
}

/// `fn name(a: int, b: int) -> int { ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<Type>,
    pub body: Block,
    #[serde(skip)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Item {
    /// `: Name { field: type, ... }`
    TypeDef {
        name: String,
        fields: Vec<Param>,
        #[serde(skip)]
        span: Span,
    },
    Function(Function),
    Route(Route),
    WebSocket(WebSocketRoute),
}

// ---- Statements ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub value: SExpr,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// `$ name = value` or `let name: ty = value`
    Let { name: String, ty: Option<Type>, value: SExpr },

    /// `name = value` on an existing binding
    Assign { name: String, value: SExpr },

    /// `> value` or `return value`
    Return(SExpr),

    If { condition: SExpr, then_body: Block, else_body: Block },

    While { condition: SExpr, body: Block },

    /// `for v in xs { }` or `for k, v in xs { }`
    For {
        key: Option<String>,
        binding: String,
        iterable: SExpr,
        body: Block,
    },

    Switch { subject: SExpr, cases: Vec<SwitchCase>, default: Block },

    Break,
    Continue,

    /// Nested scope. Produced by the optimizer when a branch is elided.
    Block(Block),

    /// Expression evaluated for its side effects
    Expr(SExpr),
}

// ---- Expressions ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Literal),

    Var(String),

    Binary {
        op: BinOp,
        left: Box<SExpr>,
        right: Box<SExpr>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<SExpr>,
    },

    /// `{key: value, ...}` in source order
    Object(Vec<(String, SExpr)>),

    Array(Vec<SExpr>),

    /// `obj.field`
    Field { object: Box<SExpr>, field: String },

    /// `arr[i]` or `obj["key"]`
    Index { object: Box<SExpr>, index: Box<SExpr> },

    /// `name(args)`, `ws.send(args)`, `time.now()`
    Call { callee: String, args: Vec<SExpr> },

    /// `match subject { pattern => value, ... }`. The first matching arm
    /// wins; `null` when none does.
    Match { subject: Box<SExpr>, arms: Vec<MatchArm> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub value: SExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pattern {
    /// Compared with `==`
    Literal(Literal),
    /// `_`
    Wildcard,
    /// Binds the subject for the arm's value
    Binding(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// A complete source file
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Module {
    pub items: Vec<Item>,
    #[serde(skip)]
    pub source: Option<String>,
}

impl Module {
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.items.iter().filter_map(|item| match item {
            Item::Function(f) => Some(f),
            _ => None,
        })
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.items.iter().filter_map(|item| match item {
            Item::Route(r) => Some(r),
            _ => None,
        })
    }

    pub fn websocket_routes(&self) -> impl Iterator<Item = &WebSocketRoute> {
        self.items.iter().filter_map(|item| match item {
            Item::WebSocket(w) => Some(w),
            _ => None,
        })
    }

    pub fn route(&self, method: HttpMethod, path: &str) -> Option<&Route> {
        self.routes().find(|r| r.method == method && r.path == path)
    }

    pub fn websocket_route(&self, path: &str) -> Option<&WebSocketRoute> {
        self.websocket_routes().find(|w| w.path == path)
    }
}
