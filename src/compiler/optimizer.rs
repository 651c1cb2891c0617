//! AST-level rewrites applied before code generation.

use std::collections::{HashMap, HashSet};

use crate::ast::*;
use crate::ops;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub enum OptLevel {
    None,
    #[default]
    Basic,
    Aggressive,
}

impl std::str::FromStr for OptLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" | "none" => Ok(OptLevel::None),
            "1" | "basic" => Ok(OptLevel::Basic),
            "2" | "aggressive" => Ok(OptLevel::Aggressive),
            other => Err(format!("unknown optimization level '{}'; use none, basic or aggressive", other)),
        }
    }
}

/// Rewrite `block` for `level`. `predeclared` names are seeded by the caller
/// (path parameters, `input`, function parameters) and are never propagated.
pub fn optimize(block: &Block, level: OptLevel, predeclared: &[String]) -> Block {
    if level == OptLevel::None {
        return block.clone();
    }
    let folded = fold_block(block);
    if level < OptLevel::Aggressive {
        return folded;
    }
    let candidates = propagation_candidates(&folded, predeclared);
    if candidates.is_empty() {
        return folded;
    }
    let propagated = propagate_block(&folded, &candidates, &HashMap::new());
    fold_block(&propagated)
}

// ---- Folding ----

fn fold_block(block: &Block) -> Block {
    let mut out = Vec::with_capacity(block.len());
    for stmt in block {
        let Some(folded) = fold_stmt(stmt) else { continue };
        let terminal = matches!(folded.node, Stmt::Return(_) | Stmt::Break | Stmt::Continue);
        out.push(folded);
        if terminal {
            break;
        }
    }
    out
}

fn literal_bool(expr: &SExpr) -> Option<bool> {
    match expr.node {
        Expr::Literal(Literal::Bool(b)) => Some(b),
        _ => None,
    }
}

fn fold_stmt(stmt: &Spanned<Stmt>) -> Option<Spanned<Stmt>> {
    let node = match &stmt.node {
        Stmt::Let { name, ty, value } => Stmt::Let { name: name.clone(), ty: ty.clone(), value: fold_expr(value) },
        Stmt::Assign { name, value } => Stmt::Assign { name: name.clone(), value: fold_expr(value) },
        Stmt::Return(e) => Stmt::Return(fold_expr(e)),
        Stmt::Expr(e) => Stmt::Expr(fold_expr(e)),
        Stmt::If { condition, then_body, else_body } => {
            let condition = fold_expr(condition);
            match literal_bool(&condition) {
                Some(true) => Stmt::Block(fold_block(then_body)),
                Some(false) if else_body.is_empty() => return None,
                Some(false) => Stmt::Block(fold_block(else_body)),
                None => Stmt::If { condition, then_body: fold_block(then_body), else_body: fold_block(else_body) },
            }
        }
        Stmt::While { condition, body } => {
            let condition = fold_expr(condition);
            if literal_bool(&condition) == Some(false) {
                return None;
            }
            Stmt::While { condition, body: fold_block(body) }
        }
        Stmt::For { key, binding, iterable, body } => Stmt::For {
            key: key.clone(),
            binding: binding.clone(),
            iterable: fold_expr(iterable),
            body: fold_block(body),
        },
        Stmt::Switch { subject, cases, default } => Stmt::Switch {
            subject: fold_expr(subject),
            cases: cases
                .iter()
                .map(|c| SwitchCase { value: fold_expr(&c.value), body: fold_block(&c.body) })
                .collect(),
            default: fold_block(default),
        },
        Stmt::Block(body) => Stmt::Block(fold_block(body)),
        Stmt::Break => Stmt::Break,
        Stmt::Continue => Stmt::Continue,
    };
    Some(Spanned::new(node, stmt.span))
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Int(n) => Value::Int(*n),
        Literal::Float(x) => Value::Float(*x),
        Literal::Str(s) => Value::Str(s.clone()),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
    }
}

/// Scalar values map back to literals; non-finite floats and composites do not.
fn value_literal(v: Value) -> Option<Literal> {
    Some(match v {
        Value::Int(n) => Literal::Int(n),
        Value::Float(x) if x.is_finite() => Literal::Float(x),
        Value::Str(s) => Literal::Str(s),
        Value::Bool(b) => Literal::Bool(b),
        Value::Null => Literal::Null,
        _ => return None,
    })
}

/// Integer arithmetic that would wrap at run time is left for the VM.
fn overflows(op: BinOp, a: &Value, b: &Value) -> bool {
    let (Value::Int(x), Value::Int(y)) = (a, b) else { return false };
    match op {
        BinOp::Add => x.checked_add(*y).is_none(),
        BinOp::Sub => x.checked_sub(*y).is_none(),
        BinOp::Mul => x.checked_mul(*y).is_none(),
        BinOp::Div => x.checked_div(*y).is_none(),
        BinOp::Mod => x.checked_rem(*y).is_none(),
        _ => false,
    }
}

pub fn fold_expr(expr: &SExpr) -> SExpr {
    let span = expr.span;
    let node = match &expr.node {
        Expr::Binary { op, left, right } => {
            let (left, right) = (fold_expr(left), fold_expr(right));
            if let (Expr::Literal(a), Expr::Literal(b)) = (&left.node, &right.node) {
                let (a, b) = (literal_value(a), literal_value(b));
                if !overflows(*op, &a, &b) {
                    if let Some(lit) = ops::binary(*op, &a, &b).ok().and_then(value_literal) {
                        return Spanned::new(Expr::Literal(lit), span);
                    }
                }
            }
            Expr::Binary { op: *op, left: Box::new(left), right: Box::new(right) }
        }
        Expr::Unary { op, operand } => {
            let operand = fold_expr(operand);
            if let Expr::Literal(lit) = &operand.node {
                let v = literal_value(lit);
                let safe = !matches!((op, &v), (UnaryOp::Neg, Value::Int(i64::MIN)));
                if safe {
                    if let Some(lit) = ops::unary(*op, &v).ok().and_then(value_literal) {
                        return Spanned::new(Expr::Literal(lit), span);
                    }
                }
            }
            Expr::Unary { op: *op, operand: Box::new(operand) }
        }
        Expr::Object(fields) => Expr::Object(fields.iter().map(|(k, v)| (k.clone(), fold_expr(v))).collect()),
        Expr::Array(items) => Expr::Array(items.iter().map(fold_expr).collect()),
        Expr::Field { object, field } => Expr::Field { object: Box::new(fold_expr(object)), field: field.clone() },
        Expr::Index { object, index } => {
            Expr::Index { object: Box::new(fold_expr(object)), index: Box::new(fold_expr(index)) }
        }
        Expr::Call { callee, args } => Expr::Call { callee: callee.clone(), args: args.iter().map(fold_expr).collect() },
        Expr::Match { subject, arms } => Expr::Match {
            subject: Box::new(fold_expr(subject)),
            arms: arms.iter().map(|a| MatchArm { pattern: a.pattern.clone(), value: fold_expr(&a.value) }).collect(),
        },
        Expr::Literal(_) | Expr::Var(_) => expr.node.clone(),
    };
    Spanned::new(node, span)
}

// ---- Constant propagation ----

#[derive(Default)]
pub(super) struct BindingStats {
    pub(super) lets: HashMap<String, usize>,
    pub(super) assigned: HashSet<String>,
    pub(super) loop_bound: HashSet<String>,
}

impl BindingStats {
    pub(super) fn visit(&mut self, block: &Block) {
        for stmt in block {
            match &stmt.node {
                Stmt::Let { name, .. } => *self.lets.entry(name.clone()).or_default() += 1,
                Stmt::Assign { name, .. } => {
                    self.assigned.insert(name.clone());
                }
                Stmt::If { then_body, else_body, .. } => {
                    self.visit(then_body);
                    self.visit(else_body);
                }
                Stmt::While { body, .. } | Stmt::Block(body) => self.visit(body),
                Stmt::For { key, binding, body, .. } => {
                    self.loop_bound.insert(binding.clone());
                    if let Some(k) = key {
                        self.loop_bound.insert(k.clone());
                    }
                    self.visit(body);
                }
                Stmt::Switch { cases, default, .. } => {
                    for c in cases {
                        self.visit(&c.body);
                    }
                    self.visit(default);
                }
                Stmt::Return(_) | Stmt::Expr(_) | Stmt::Break | Stmt::Continue => {}
            }
        }
    }
}

/// Names bound exactly once, never reassigned and never a loop variable.
fn propagation_candidates(block: &Block, predeclared: &[String]) -> HashSet<String> {
    let mut stats = BindingStats::default();
    stats.visit(block);
    stats
        .lets
        .into_iter()
        .filter(|(name, count)| {
            *count == 1
                && !stats.assigned.contains(name)
                && !stats.loop_bound.contains(name)
                && !predeclared.contains(name)
        })
        .map(|(name, _)| name)
        .collect()
}

/// Substitute literal bindings into the statements that follow them in the
/// same block and in nested blocks. The binding itself is kept.
fn propagate_block(block: &Block, candidates: &HashSet<String>, inherited: &HashMap<String, Literal>) -> Block {
    let mut known = inherited.clone();
    let mut out = Vec::with_capacity(block.len());
    for stmt in block {
        let rewritten = propagate_stmt(stmt, candidates, &known);
        if let Stmt::Let { name, value, .. } = &rewritten.node {
            if let Expr::Literal(lit) = &value.node {
                if candidates.contains(name) {
                    known.insert(name.clone(), lit.clone());
                }
            }
        }
        out.push(rewritten);
    }
    out
}

fn propagate_stmt(stmt: &Spanned<Stmt>, candidates: &HashSet<String>, known: &HashMap<String, Literal>) -> Spanned<Stmt> {
    let e = |expr: &SExpr| substitute(expr, known);
    let b = |block: &Block| propagate_block(block, candidates, known);
    let node = match &stmt.node {
        // Folded right away so a chain of bindings propagates in one pass.
        Stmt::Let { name, ty, value } => Stmt::Let { name: name.clone(), ty: ty.clone(), value: fold_expr(&e(value)) },
        Stmt::Assign { name, value } => Stmt::Assign { name: name.clone(), value: e(value) },
        Stmt::Return(v) => Stmt::Return(e(v)),
        Stmt::Expr(v) => Stmt::Expr(e(v)),
        Stmt::If { condition, then_body, else_body } => {
            Stmt::If { condition: e(condition), then_body: b(then_body), else_body: b(else_body) }
        }
        Stmt::While { condition, body } => Stmt::While { condition: e(condition), body: b(body) },
        Stmt::For { key, binding, iterable, body } => Stmt::For {
            key: key.clone(),
            binding: binding.clone(),
            iterable: e(iterable),
            body: b(body),
        },
        Stmt::Switch { subject, cases, default } => Stmt::Switch {
            subject: e(subject),
            cases: cases.iter().map(|c| SwitchCase { value: e(&c.value), body: b(&c.body) }).collect(),
            default: b(default),
        },
        Stmt::Block(body) => Stmt::Block(b(body)),
        Stmt::Break => Stmt::Break,
        Stmt::Continue => Stmt::Continue,
    };
    Spanned::new(node, stmt.span)
}

fn substitute(expr: &SExpr, known: &HashMap<String, Literal>) -> SExpr {
    let span = expr.span;
    let sub = |e: &SExpr| Box::new(substitute(e, known));
    let node = match &expr.node {
        Expr::Var(name) => match known.get(name) {
            Some(lit) => Expr::Literal(lit.clone()),
            None => Expr::Var(name.clone()),
        },
        Expr::Literal(_) => expr.node.clone(),
        Expr::Binary { op, left, right } => Expr::Binary { op: *op, left: sub(left), right: sub(right) },
        Expr::Unary { op, operand } => Expr::Unary { op: *op, operand: sub(operand) },
        Expr::Object(fields) => Expr::Object(fields.iter().map(|(k, v)| (k.clone(), substitute(v, known))).collect()),
        Expr::Array(items) => Expr::Array(items.iter().map(|i| substitute(i, known)).collect()),
        Expr::Field { object, field } => Expr::Field { object: sub(object), field: field.clone() },
        Expr::Index { object, index } => Expr::Index { object: sub(object), index: sub(index) },
        Expr::Call { callee, args } => {
            Expr::Call { callee: callee.clone(), args: args.iter().map(|a| substitute(a, known)).collect() }
        }
        Expr::Match { subject, arms } => Expr::Match {
            subject: sub(subject),
            arms: arms
                .iter()
                .map(|arm| {
                    let value = match &arm.pattern {
                        // The binding hides any outer literal of the same name.
                        Pattern::Binding(name) if known.contains_key(name) => {
                            let mut inner = known.clone();
                            inner.remove(name);
                            substitute(&arm.value, &inner)
                        }
                        _ => substitute(&arm.value, known),
                    };
                    MatchArm { pattern: arm.pattern.clone(), value }
                })
                .collect(),
        },
    };
    Spanned::new(node, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn route_body(src: &str, level: OptLevel) -> Block {
        let module = parse_source(src).unwrap();
        let route = module.routes().next().unwrap();
        optimize(&route.body, level, &[])
    }

    fn returned(block: &Block) -> &Expr {
        match &block.last().unwrap().node {
            Stmt::Return(e) => &e.node,
            other => panic!("expected return, got {:?}", other),
        }
    }

    #[test]
    fn folds_arithmetic() {
        let body = route_body("@ GET /p { > 2 + 3 * 4 }", OptLevel::Basic);
        assert_eq!(*returned(&body), Expr::Literal(Literal::Int(14)));
    }

    #[test]
    fn folds_string_concat() {
        let body = route_body(r#"@ GET /p { > "a" + "b" }"#, OptLevel::Basic);
        assert_eq!(*returned(&body), Expr::Literal(Literal::Str("ab".into())));
    }

    #[test]
    fn keeps_mixed_plus_for_runtime_error() {
        let body = route_body(r#"@ GET /p { > "a" + 1 }"#, OptLevel::Basic);
        assert!(matches!(returned(&body), Expr::Binary { op: BinOp::Add, .. }));
    }

    #[test]
    fn keeps_division_by_zero() {
        let body = route_body("@ GET /p { > 1 / 0 }", OptLevel::Basic);
        assert!(matches!(returned(&body), Expr::Binary { op: BinOp::Div, .. }));
    }

    #[test]
    fn keeps_overflowing_int() {
        let body = route_body("@ GET /p { > 9223372036854775807 + 1 }", OptLevel::Basic);
        assert!(matches!(returned(&body), Expr::Binary { .. }));
    }

    #[test]
    fn none_leaves_tree_alone() {
        let body = route_body("@ GET /p { > 2 + 3 }", OptLevel::None);
        assert!(matches!(returned(&body), Expr::Binary { .. }));
    }

    #[test]
    fn elides_literal_branches() {
        let body = route_body("@ GET /p { if false { > 1 } else { > 2 } }", OptLevel::Basic);
        let Stmt::Block(inner) = &body[0].node else { panic!("expected block") };
        assert_eq!(*returned(inner), Expr::Literal(Literal::Int(2)));

        let body = route_body("@ GET /p { while false { ws.send(1) } > 0 }", OptLevel::Basic);
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn drops_unreachable_statements() {
        let body = route_body("@ GET /p {\n > 1\n > 2\n}", OptLevel::Basic);
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn aggressive_propagates_literals() {
        let src = "@ GET /p {\n $ a = 2\n $ b = a * 10\n > b + 1\n}";
        let body = route_body(src, OptLevel::Aggressive);
        assert_eq!(*returned(&body), Expr::Literal(Literal::Int(21)));
        let basic = route_body(src, OptLevel::Basic);
        assert!(matches!(returned(&basic), Expr::Binary { .. }));
    }

    #[test]
    fn aggressive_skips_reassigned_and_loop_names() {
        let src = "@ GET /p {\n $ a = 1\n a = 2\n $ s = 0\n for s2 in [1] { s = s + s2 }\n > a + s\n}";
        let body = route_body(src, OptLevel::Aggressive);
        assert!(matches!(returned(&body), Expr::Binary { .. }));
    }

    #[test]
    fn aggressive_respects_scope() {
        let src = "@ GET /p {\n if true == input { $ x = 1 }\n > x\n}";
        let body = route_body(src, OptLevel::Aggressive);
        assert_eq!(*returned(&body), Expr::Var("x".into()));
    }

    #[test]
    fn folds_inside_match_arms() {
        let body = route_body("@ GET /p { > match input { 1 => 2 * 3, n => n } }", OptLevel::Basic);
        let Expr::Match { arms, .. } = returned(&body) else { panic!("expected match") };
        assert_eq!(arms[0].value.node, Expr::Literal(Literal::Int(6)));
        assert_eq!(arms[1].value.node, Expr::Var("n".into()));
    }

    #[test]
    fn aggressive_propagates_into_match() {
        let src = "@ GET /p {\n $ k = 2\n > match input { 1 => k * 10, _ => k }\n}";
        let body = route_body(src, OptLevel::Aggressive);
        let Expr::Match { arms, .. } = returned(&body) else { panic!("expected match") };
        assert_eq!(arms[0].value.node, Expr::Literal(Literal::Int(20)));
        assert_eq!(arms[1].value.node, Expr::Literal(Literal::Int(2)));
    }

    #[test]
    fn parse_opt_level() {
        assert_eq!("aggressive".parse::<OptLevel>().unwrap(), OptLevel::Aggressive);
        assert_eq!("0".parse::<OptLevel>().unwrap(), OptLevel::None);
        assert!("fast".parse::<OptLevel>().is_err());
    }
}
