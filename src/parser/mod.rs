use crate::ast::*;
use crate::lexer::{self, Token};

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    /// `line_start[i]` is true when a newline separates token `i` from the one before it.
    line_start: Vec<bool>,
}

#[derive(Debug, thiserror::Error)]
#[error("Parse error at token {position}: {message}")]
pub struct ParseError {
    pub code: &'static str,
    pub position: usize,
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>) -> Self {
        let line_start = vec![false; tokens.len()];
        Parser { tokens, pos: 0, line_start }
    }

    /// Like `new`, but records which tokens begin a line so that
    /// `$ x = a` followed by `> x` on the next line is not read as `a > x`.
    pub fn with_source(tokens: Vec<(Token, Span)>, source: &str) -> Self {
        let mut prev_end = 0;
        let line_start = tokens
            .iter()
            .map(|(_, span)| {
                let gap = source.get(prev_end..span.start).unwrap_or("");
                prev_end = span.end;
                gap.contains('\n')
            })
            .collect();
        Parser { tokens, pos: 0, line_start }
    }

    fn at_line_start(&self) -> bool {
        self.pos > 0 && self.line_start.get(self.pos).copied().unwrap_or(false)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| *s)
            .or_else(|| self.tokens.last().map(|(_, s)| Span::new(s.end, s.end)))
            .unwrap_or(Span::UNKNOWN)
    }

    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|(_, s)| *s)
            .unwrap_or(Span::UNKNOWN)
    }

    fn token_at(&self, idx: usize) -> Option<&Token> {
        self.tokens.get(idx).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, expected: &Token) -> bool {
        self.peek() == Some(expected)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span> {
        match self.peek() {
            Some(tok) if tok == expected => {
                let span = self.peek_span();
                self.advance();
                Ok(span)
            }
            Some(tok) => Err(self.error("GLY-P003", format!("expected {:?}, got {:?}", expected, tok))),
            None => Err(self.error("GLY-P004", format!("expected {:?}, got EOF", expected))),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(name)
            }
            Some(tok) => Err(self.error("GLY-P005", format!("expected identifier, got {:?}", tok))),
            None => Err(self.error("GLY-P006", "expected identifier, got EOF".into())),
        }
    }

    fn error(&self, code: &'static str, message: String) -> ParseError {
        ParseError {
            code,
            position: self.pos,
            span: self.peek_span(),
            message,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // ---- Top-level parsing ----

    pub fn parse_module(&mut self) -> (Module, Vec<ParseError>) {
        let mut items = Vec::new();
        let mut errors: Vec<ParseError> = Vec::new();
        const MAX_ERRORS: usize = 20;

        while !self.at_end() {
            if errors.len() >= MAX_ERRORS {
                break;
            }
            match self.parse_item() {
                Ok(item) => items.push(item),
                Err(e) => {
                    errors.push(e);
                    self.sync_to_item_boundary();
                }
            }
        }

        (Module { items, source: None }, errors)
    }

    /// Skip to the next token that can start a top-level item, at brace depth zero.
    fn sync_to_item_boundary(&mut self) {
        let mut depth: usize = 0;
        // Always make progress past the offending token.
        if let Some(tok) = self.advance() {
            match tok {
                Token::LBrace => depth += 1,
                Token::RBrace => return,
                _ => {}
            }
        }
        while let Some(tok) = self.peek() {
            match tok {
                Token::LBrace => depth += 1,
                Token::RBrace => {
                    if depth <= 1 {
                        self.advance();
                        if depth == 1 {
                            return;
                        }
                        continue;
                    }
                    depth -= 1;
                }
                Token::At | Token::Fn if depth == 0 => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn parse_item(&mut self) -> Result<Item> {
        match self.peek() {
            Some(Token::At) => self.parse_route_item(),
            Some(Token::Fn) => Ok(Item::Function(self.parse_function()?)),
            Some(Token::Colon) => self.parse_type_def(),
            Some(tok) => Err(self.error(
                "GLY-P001",
                format!("expected '@', 'fn' or ':' at top level, got {:?}", tok),
            )),
            None => Err(self.error("GLY-P002", "unexpected EOF".into())),
        }
    }

    fn parse_type_def(&mut self) -> Result<Item> {
        let start = self.expect(&Token::Colon)?;
        let name = self.expect_ident()?;
        self.expect(&Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) && !self.at_end() {
            let field = self.expect_ident()?;
            self.expect(&Token::Colon)?;
            let ty = self.parse_type()?;
            // `!` marks a required field; it has no runtime effect.
            self.eat(&Token::Bang);
            fields.push(Param { name: field, ty });
            self.eat(&Token::Comma);
        }
        let end = self.expect(&Token::RBrace)?;
        Ok(Item::TypeDef { name, fields, span: start.merge(end) })
    }

    fn parse_function(&mut self) -> Result<Function> {
        let start = self.expect(&Token::Fn)?;
        let name = self.expect_ident()?;
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        while !self.check(&Token::RParen) {
            let pname = self.expect_ident()?;
            let ty = if self.eat(&Token::Colon) { self.parse_type()? } else { Type::Any };
            params.push(Param { name: pname, ty });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        let return_type = if self.eat(&Token::Arrow) || self.eat(&Token::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let body = self.parse_block()?;
        Ok(Function { name, params, return_type, body, span: start.merge(self.prev_span()) })
    }

    fn parse_route_item(&mut self) -> Result<Item> {
        let start = self.expect(&Token::At)?;
        let method = self.expect_ident()?;
        if method.eq_ignore_ascii_case("ws") {
            let path = self.parse_path()?;
            let handlers = self.parse_ws_handlers()?;
            return Ok(Item::WebSocket(WebSocketRoute { path, handlers, span: start.merge(self.prev_span()) }));
        }
        let Some(method) = HttpMethod::parse(&method) else {
            return Err(ParseError {
                code: "GLY-P010",
                position: self.pos - 1,
                span: self.prev_span(),
                message: format!("unknown HTTP method '{}'; expected GET, POST, PUT, PATCH, DELETE or ws", method),
            });
        };
        let path = self.parse_path()?;
        let body = self.parse_block()?;
        Ok(Item::Route(Route { method, path, body, span: start.merge(self.prev_span()) }))
    }

    /// Rebuild a route path such as `/users/:id/posts` from adjacent tokens.
    fn parse_path(&mut self) -> Result<String> {
        if !self.check(&Token::Slash) {
            return Err(self.error("GLY-P011", "route path must start with '/'".into()));
        }
        let mut path = String::new();
        let mut last_end: Option<usize> = None;
        while let Some((tok, span)) = self.tokens.get(self.pos) {
            if last_end.is_some_and(|end| end != span.start) {
                break;
            }
            match tok {
                Token::Slash => path.push('/'),
                Token::Colon => path.push(':'),
                Token::Minus => path.push('-'),
                Token::Dot => path.push('.'),
                Token::Ident(s) => path.push_str(s),
                Token::Int(n) => path.push_str(&n.to_string()),
                _ => break,
            }
            last_end = Some(span.end);
            self.pos += 1;
        }
        Ok(path)
    }

    fn parse_ws_handlers(&mut self) -> Result<Vec<WsHandler>> {
        self.expect(&Token::LBrace)?;
        let mut handlers: Vec<WsHandler> = Vec::new();
        while !self.check(&Token::RBrace) && !self.at_end() {
            let start = self.expect(&Token::On)?;
            let name = self.expect_ident()?;
            let Some(event) = WsEvent::parse(&name) else {
                return Err(ParseError {
                    code: "GLY-P012",
                    position: self.pos - 1,
                    span: self.prev_span(),
                    message: format!("unknown WebSocket event '{}'; valid events are connect, message, disconnect, error", name),
                });
            };
            if handlers.iter().any(|h| h.event == event) {
                return Err(ParseError {
                    code: "GLY-P013",
                    position: self.pos - 1,
                    span: self.prev_span(),
                    message: format!("duplicate 'on {}' handler", name),
                });
            }
            let body = self.parse_block()?;
            handlers.push(WsHandler { event, body, span: start.merge(self.prev_span()) });
        }
        self.expect(&Token::RBrace)?;
        Ok(handlers)
    }

    // ---- Types ----

    fn parse_type(&mut self) -> Result<Type> {
        if self.eat(&Token::LBracket) {
            let inner = self.parse_type()?;
            self.expect(&Token::RBracket)?;
            return Ok(Type::Array(Box::new(inner)));
        }
        let name = self.expect_ident()?;
        Ok(match name.as_str() {
            "int" => Type::Int,
            "float" => Type::Float,
            "str" | "string" => Type::Str,
            "bool" => Type::Bool,
            "any" => Type::Any,
            "object" => Type::Object,
            "array" => Type::Array(Box::new(Type::Any)),
            _ => Type::Named(name),
        })
    }

    // ---- Blocks & Statements ----

    fn parse_block(&mut self) -> Result<Block> {
        self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.at_end() {
                return Err(self.error("GLY-P004", "expected RBrace, got EOF".into()));
            }
            stmts.push(self.parse_stmt()?);
        }
        self.expect(&Token::RBrace)?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Spanned<Stmt>> {
        let start = self.peek_span();
        let stmt = match self.peek() {
            Some(Token::Dollar) | Some(Token::Let) => self.parse_let()?,
            Some(Token::Greater) | Some(Token::Return) => {
                self.advance();
                Stmt::Return(self.parse_expr()?)
            }
            Some(Token::If) => self.parse_if()?,
            Some(Token::While) => {
                self.advance();
                let condition = self.parse_expr()?;
                let body = self.parse_block()?;
                Stmt::While { condition, body }
            }
            Some(Token::For) => self.parse_for()?,
            Some(Token::Switch) => self.parse_switch()?,
            Some(Token::Break) => {
                self.advance();
                Stmt::Break
            }
            Some(Token::Continue) => {
                self.advance();
                Stmt::Continue
            }
            Some(Token::Ident(_)) if self.token_at(self.pos + 1) == Some(&Token::Assign) => {
                let name = self.expect_ident()?;
                self.advance();
                Stmt::Assign { name, value: self.parse_expr()? }
            }
            Some(_) => {
                let expr = self.parse_expr()?;
                if !matches!(expr.node, Expr::Call { .. }) {
                    return Err(ParseError {
                        code: "GLY-P020",
                        position: self.pos,
                        span: expr.span,
                        message: "only calls can be used as statements; use '$ name = value' to bind a value".into(),
                    });
                }
                Stmt::Expr(expr)
            }
            None => return Err(self.error("GLY-P002", "unexpected EOF".into())),
        };
        Ok(Spanned::new(stmt, start.merge(self.prev_span())))
    }

    fn parse_let(&mut self) -> Result<Stmt> {
        self.advance(); // `$` or `let`
        let name = self.expect_ident()?;
        let ty = if self.eat(&Token::Colon) { Some(self.parse_type()?) } else { None };
        self.expect(&Token::Assign)?;
        let value = self.parse_expr()?;
        Ok(Stmt::Let { name, ty, value })
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        self.expect(&Token::If)?;
        let condition = self.parse_expr()?;
        let then_body = self.parse_block()?;
        let else_body = if self.eat(&Token::Else) {
            if self.check(&Token::If) {
                let start = self.peek_span();
                let nested = self.parse_if()?;
                vec![Spanned::new(nested, start.merge(self.prev_span()))]
            } else {
                self.parse_block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If { condition, then_body, else_body })
    }

    fn parse_for(&mut self) -> Result<Stmt> {
        self.expect(&Token::For)?;
        let first = self.expect_ident()?;
        let (key, binding) = if self.eat(&Token::Comma) {
            (Some(first), self.expect_ident()?)
        } else {
            (None, first)
        };
        self.expect(&Token::In)?;
        let iterable = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt::For { key, binding, iterable, body })
    }

    fn parse_switch(&mut self) -> Result<Stmt> {
        self.expect(&Token::Switch)?;
        let subject = self.parse_expr()?;
        self.expect(&Token::LBrace)?;
        let mut cases = Vec::new();
        let mut default = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Case) => {
                    self.advance();
                    let value = self.parse_expr()?;
                    let body = self.parse_block()?;
                    cases.push(SwitchCase { value, body });
                }
                Some(Token::Default) => {
                    self.advance();
                    default = self.parse_block()?;
                }
                _ => break,
            }
        }
        self.expect(&Token::RBrace)?;
        Ok(Stmt::Switch { subject, cases, default })
    }

    // ---- Expressions ----

    pub fn parse_expr(&mut self) -> Result<SExpr> {
        self.parse_binary(0)
    }

    fn binary_op(tok: &Token) -> Option<(BinOp, u8)> {
        Some(match tok {
            Token::OrOr => (BinOp::Or, 1),
            Token::AndAnd => (BinOp::And, 2),
            Token::EqEq => (BinOp::Eq, 3),
            Token::NotEq => (BinOp::Ne, 3),
            Token::Less => (BinOp::Lt, 4),
            Token::Greater => (BinOp::Gt, 4),
            Token::LessEq => (BinOp::Le, 4),
            Token::GreaterEq => (BinOp::Ge, 4),
            Token::Plus => (BinOp::Add, 5),
            Token::Minus => (BinOp::Sub, 5),
            Token::Star => (BinOp::Mul, 6),
            Token::Slash => (BinOp::Div, 6),
            Token::Percent => (BinOp::Mod, 6),
            _ => return None,
        })
    }

    /// Precedence climbing; all binary operators are left-associative.
    fn parse_binary(&mut self, min_prec: u8) -> Result<SExpr> {
        let mut left = self.parse_unary()?;
        while let Some((op, prec)) = self.peek().and_then(Self::binary_op) {
            if prec <= min_prec || self.at_line_start() {
                break;
            }
            self.advance();
            let right = self.parse_binary(prec)?;
            let span = left.span.merge(right.span);
            left = Spanned::new(Expr::Binary { op, left: Box::new(left), right: Box::new(right) }, span);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<SExpr> {
        let start = self.peek_span();
        let op = match self.peek() {
            Some(Token::Bang) => UnaryOp::Not,
            Some(Token::Minus) => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        let span = start.merge(operand.span);
        Ok(Spanned::new(Expr::Unary { op, operand: Box::new(operand) }, span))
    }

    fn parse_postfix(&mut self) -> Result<SExpr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let field = self.expect_ident()?;
                    let span = expr.span.merge(self.prev_span());
                    expr = Spanned::new(Expr::Field { object: Box::new(expr), field }, span);
                }
                Some(Token::LBracket | Token::LParen) if self.at_line_start() => return Ok(expr),
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    let span = expr.span.merge(self.prev_span());
                    expr = Spanned::new(Expr::Index { object: Box::new(expr), index: Box::new(index) }, span);
                }
                Some(Token::LParen) => {
                    let Some(callee) = dotted_name(&expr.node) else {
                        return Err(self.error("GLY-P021", "only named functions can be called".into()));
                    };
                    self.advance();
                    let mut args = Vec::new();
                    while !self.check(&Token::RParen) {
                        args.push(self.parse_expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RParen)?;
                    let span = expr.span.merge(self.prev_span());
                    expr = Spanned::new(Expr::Call { callee, args }, span);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<SExpr> {
        let span = self.peek_span();
        let Some(tok) = self.peek().cloned() else {
            return Err(self.error("GLY-P030", "expected expression, got EOF".into()));
        };
        let lit = |l: Literal| -> Result<SExpr> { Ok(Spanned::new(Expr::Literal(l), span)) };
        match tok {
            Token::Int(n) => {
                self.advance();
                lit(Literal::Int(n))
            }
            Token::Float(x) => {
                self.advance();
                lit(Literal::Float(x))
            }
            Token::Str(s) => {
                self.advance();
                lit(Literal::Str(s))
            }
            Token::True => {
                self.advance();
                lit(Literal::Bool(true))
            }
            Token::False => {
                self.advance();
                lit(Literal::Bool(false))
            }
            Token::Null => {
                self.advance();
                lit(Literal::Null)
            }
            Token::Ident(name) => {
                self.advance();
                Ok(Spanned::new(Expr::Var(name), span))
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(Spanned::new(inner.node, span.merge(self.prev_span())))
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(&Token::RBracket) {
                    items.push(self.parse_expr()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Spanned::new(Expr::Array(items), span.merge(self.prev_span())))
            }
            Token::LBrace => self.parse_object(),
            Token::Match => self.parse_match(),
            other => Err(self.error("GLY-P031", format!("expected expression, got {:?}", other))),
        }
    }

    /// Arms are separated by commas or line breaks.
    fn parse_match(&mut self) -> Result<SExpr> {
        let start = self.expect(&Token::Match)?;
        let subject = self.parse_expr()?;
        self.expect(&Token::LBrace)?;
        let mut arms = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.at_end() {
                return Err(self.error("GLY-P004", "expected RBrace, got EOF".into()));
            }
            let pattern = self.parse_pattern()?;
            self.expect(&Token::FatArrow)?;
            let value = self.parse_expr()?;
            arms.push(MatchArm { pattern, value });
            self.eat(&Token::Comma);
        }
        let end = self.expect(&Token::RBrace)?;
        Ok(Spanned::new(Expr::Match { subject: Box::new(subject), arms }, start.merge(end)))
    }

    fn parse_pattern(&mut self) -> Result<Pattern> {
        let Some(tok) = self.peek().cloned() else {
            return Err(self.error("GLY-P033", "expected pattern, got EOF".into()));
        };
        let pattern = match tok {
            Token::Int(n) => Pattern::Literal(Literal::Int(n)),
            Token::Float(x) => Pattern::Literal(Literal::Float(x)),
            Token::Str(s) => Pattern::Literal(Literal::Str(s)),
            Token::True => Pattern::Literal(Literal::Bool(true)),
            Token::False => Pattern::Literal(Literal::Bool(false)),
            Token::Null => Pattern::Literal(Literal::Null),
            Token::Minus => {
                self.advance();
                return match self.peek().cloned() {
                    Some(Token::Int(n)) => {
                        self.advance();
                        Ok(Pattern::Literal(Literal::Int(n.wrapping_neg())))
                    }
                    Some(Token::Float(x)) => {
                        self.advance();
                        Ok(Pattern::Literal(Literal::Float(-x)))
                    }
                    other => Err(self.error("GLY-P033", format!("expected number after '-', got {:?}", other))),
                };
            }
            Token::Ident(name) if name == "_" => Pattern::Wildcard,
            Token::Ident(name) => Pattern::Binding(name),
            other => return Err(self.error("GLY-P033", format!("expected pattern, got {:?}", other))),
        };
        self.advance();
        Ok(pattern)
    }

    fn parse_object(&mut self) -> Result<SExpr> {
        let start = self.expect(&Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) {
            let key = match self.peek().cloned() {
                Some(Token::Ident(k)) | Some(Token::Str(k)) => {
                    self.advance();
                    k
                }
                Some(tok) => return Err(self.error("GLY-P032", format!("expected object key, got {:?}", tok))),
                None => return Err(self.error("GLY-P004", "expected RBrace, got EOF".into())),
            };
            self.expect(&Token::Colon)?;
            fields.push((key, self.parse_expr()?));
            if !self.eat(&Token::Comma) && !matches!(self.peek(), Some(Token::Ident(_)) | Some(Token::Str(_))) {
                break;
            }
        }
        let end = self.expect(&Token::RBrace)?;
        Ok(Spanned::new(Expr::Object(fields), start.merge(end)))
    }
}

/// `ws.send` for `Field { Var(ws), send }`; `None` for anything that is not a plain dotted name.
fn dotted_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Var(name) => Some(name.clone()),
        Expr::Field { object, field } => dotted_name(&object.node).map(|base| format!("{}.{}", base, field)),
        _ => None,
    }
}

/// Parse a token stream. Without the source text line breaks are invisible,
/// so prefer `parse_source` for multi-line programs.
pub fn parse(tokens: Vec<(Token, Span)>) -> (Module, Vec<ParseError>) {
    let mut parser = Parser::new(tokens);
    parser.parse_module()
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error(transparent)]
    Lex(#[from] lexer::LexError),
    #[error("{}", .0.first().map(|e| e.to_string()).unwrap_or_default())]
    Parse(Vec<ParseError>),
}

/// Lex and parse a whole source file, keeping the source on the module.
pub fn parse_source(source: &str) -> std::result::Result<Module, SourceError> {
    let tokens = lexer::lex(source)?;
    let (mut module, errors) = Parser::with_source(tokens, source).parse_module();
    if !errors.is_empty() {
        return Err(SourceError::Parse(errors));
    }
    module.source = Some(source.to_string());
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(source: &str) -> Module {
        parse_source(source).unwrap()
    }

    fn parse_str_errors(source: &str) -> Vec<ParseError> {
        match parse_source(source) {
            Err(SourceError::Parse(errors)) => errors,
            other => panic!("expected parse errors, got {:?}", other.map(|m| m.items.len())),
        }
    }

    fn only_route(module: &Module) -> &Route {
        module.routes().next().expect("a route")
    }

    #[test]
    fn parse_simple_route() {
        let m = parse_str(r#"@ GET /test { > {status: "ok"} }"#);
        let route = only_route(&m);
        assert_eq!(route.method, HttpMethod::Get);
        assert_eq!(route.path, "/test");
        let Stmt::Return(expr) = &route.body[0].node else { panic!("expected return") };
        let Expr::Object(fields) = &expr.node else { panic!("expected object") };
        assert_eq!(fields[0].0, "status");
        assert_eq!(fields[0].1.node, Expr::Literal(Literal::Str("ok".into())));
    }

    #[test]
    fn parse_path_with_params_and_hyphens() {
        let m = parse_str("@ DELETE /api/v1/user-posts/:id { > id }");
        assert_eq!(only_route(&m).path, "/api/v1/user-posts/:id");
    }

    #[test]
    fn parse_root_path() {
        let m = parse_str("@ GET / { > 1 }");
        assert_eq!(only_route(&m).path, "/");
    }

    #[test]
    fn parse_websocket_route() {
        let m = parse_str(
            "@ ws /chat/:room {
               on connect { ws.join(room) }
               on message { ws.broadcast_to_room(room, input) }
               on disconnect { ws.leave(room) }
             }",
        );
        let ws = m.websocket_routes().next().unwrap();
        assert_eq!(ws.path, "/chat/:room");
        assert_eq!(ws.handlers.len(), 3);
        let connect = ws.handler(WsEvent::Connect).unwrap();
        let Stmt::Expr(call) = &connect.body[0].node else { panic!("expected call statement") };
        assert!(matches!(&call.node, Expr::Call { callee, args } if callee == "ws.join" && args.len() == 1));
    }

    #[test]
    fn parse_function_with_types() {
        let m = parse_str("fn add(a: int, b: int) -> int { > a + b }");
        let f = m.functions().next().unwrap();
        assert_eq!(f.name, "add");
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.params[1].ty, Type::Int);
        assert_eq!(f.return_type, Some(Type::Int));
    }

    #[test]
    fn parse_type_def() {
        let m = parse_str(": User { id: int!\n name: str\n tags: [str] }");
        let Item::TypeDef { name, fields, .. } = &m.items[0] else { panic!("expected type def") };
        assert_eq!(name, "User");
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[2].ty, Type::Array(Box::new(Type::Str)));
    }

    #[test]
    fn parse_precedence() {
        let m = parse_str("@ GET /p { > 1 + 2 * 3 }");
        let Stmt::Return(expr) = &only_route(&m).body[0].node else { panic!() };
        let Expr::Binary { op, right, .. } = &expr.node else { panic!("expected binary") };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(right.node, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn parse_left_associative_subtraction() {
        let m = parse_str("@ GET /p { > 10 - 4 - 3 }");
        let Stmt::Return(expr) = &only_route(&m).body[0].node else { panic!() };
        let Expr::Binary { left, right, .. } = &expr.node else { panic!() };
        assert!(matches!(left.node, Expr::Binary { op: BinOp::Sub, .. }));
        assert_eq!(right.node, Expr::Literal(Literal::Int(3)));
    }

    #[test]
    fn parse_comparison_binds_looser_than_arithmetic() {
        let m = parse_str("@ GET /p { > a + 1 > b && c }");
        let Stmt::Return(expr) = &only_route(&m).body[0].node else { panic!() };
        let Expr::Binary { op, left, .. } = &expr.node else { panic!() };
        assert_eq!(*op, BinOp::And);
        assert!(matches!(left.node, Expr::Binary { op: BinOp::Gt, .. }));
    }

    #[test]
    fn parse_control_flow() {
        let m = parse_str(
            "@ GET /p {
               $ total = 0
               for i, x in [1, 2] { total = total + x }
               while total < 10 { total = total * 2 }
               if total > 5 { > 1 } else if total > 2 { > 2 } else { > 3 }
             }",
        );
        let body = &only_route(&m).body;
        assert!(matches!(body[1].node, Stmt::For { key: Some(_), .. }));
        assert!(matches!(body[2].node, Stmt::While { .. }));
        let Stmt::If { else_body, .. } = &body[3].node else { panic!() };
        assert!(matches!(else_body[0].node, Stmt::If { .. }));
    }

    #[test]
    fn parse_switch() {
        let m = parse_str(r#"@ GET /p { switch x { case 1 { > "a" } case 2 { > "b" } default { > "c" } } }"#);
        let Stmt::Switch { cases, default, .. } = &only_route(&m).body[0].node else { panic!() };
        assert_eq!(cases.len(), 2);
        assert_eq!(default.len(), 1);
    }

    #[test]
    fn parse_match_arms() {
        let m = parse_str("@ GET /p {\n $ r = match code {\n 200 => \"ok\"\n -1 => \"neg\", n => n\n _ => null\n }\n > r\n}");
        let Stmt::Let { value, .. } = &only_route(&m).body[0].node else { panic!() };
        let Expr::Match { subject, arms } = &value.node else { panic!("expected match") };
        assert_eq!(subject.node, Expr::Var("code".into()));
        let patterns: Vec<&Pattern> = arms.iter().map(|a| &a.pattern).collect();
        assert_eq!(
            patterns,
            vec![
                &Pattern::Literal(Literal::Int(200)),
                &Pattern::Literal(Literal::Int(-1)),
                &Pattern::Binding("n".into()),
                &Pattern::Wildcard,
            ]
        );
        assert_eq!(arms[2].value.node, Expr::Var("n".into()));
    }

    #[test]
    fn parse_match_rejects_expression_pattern() {
        let errors = parse_str_errors("@ GET /p { > match x { [1] => 2 } }");
        assert_eq!(errors[0].code, "GLY-P033");
        let errors = parse_str_errors("@ GET /p { > match x { 1 2 } }");
        assert_eq!(errors[0].code, "GLY-P003");
    }

    #[test]
    fn parse_index_and_field_chain() {
        let m = parse_str("@ GET /p { > users[0].name }");
        let Stmt::Return(expr) = &only_route(&m).body[0].node else { panic!() };
        let Expr::Field { object, field } = &expr.node else { panic!() };
        assert_eq!(field, "name");
        assert!(matches!(object.node, Expr::Index { .. }));
    }

    #[test]
    fn parse_let_alias_and_type_annotation() {
        let m = parse_str("@ GET /p { let n: int = 3 > n }");
        assert!(matches!(&only_route(&m).body[0].node, Stmt::Let { ty: Some(Type::Int), .. }));
    }

    #[test]
    fn parse_object_newline_separated() {
        let m = parse_str("@ GET /p { > {a: 1\n b: 2} }");
        let Stmt::Return(expr) = &only_route(&m).body[0].node else { panic!() };
        assert!(matches!(&expr.node, Expr::Object(f) if f.len() == 2));
    }

    #[test]
    fn parse_statement_spans_cover_source() {
        let src = "@ GET /p { $ x = 1 }";
        let m = parse_str(src);
        let stmt = &only_route(&m).body[0];
        assert_eq!(&src[stmt.span.start..stmt.span.end], "$ x = 1");
    }

    #[test]
    fn parse_return_on_next_line_is_not_comparison() {
        let m = parse_str("@ GET /p {\n  $ x = 1\n  > x\n}");
        let body = &only_route(&m).body;
        assert_eq!(body.len(), 2);
        assert!(matches!(&body[0].node, Stmt::Let { value, .. } if value.node == Expr::Literal(Literal::Int(1))));
        assert!(matches!(body[1].node, Stmt::Return(_)));
    }

    #[test]
    fn parse_rejects_non_call_statement() {
        let errors = parse_str_errors("@ GET /p { 1 + 2 }");
        assert_eq!(errors[0].code, "GLY-P020");
    }

    #[test]
    fn parse_rejects_unknown_method() {
        let errors = parse_str_errors("@ FETCH /p { > 1 }");
        assert_eq!(errors[0].code, "GLY-P010");
    }

    #[test]
    fn parse_rejects_unknown_ws_event() {
        let errors = parse_str_errors("@ ws /chat { on ping { } }");
        assert_eq!(errors[0].code, "GLY-P012");
    }

    #[test]
    fn parse_recovers_at_next_item() {
        let errors = parse_str_errors("@ GET /a { > } @ GET /b { > 1 + }");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn parse_calls_only_on_names() {
        let errors = parse_str_errors("@ GET /p { > [f][0](1) }");
        assert_eq!(errors[0].code, "GLY-P021");
    }
}
