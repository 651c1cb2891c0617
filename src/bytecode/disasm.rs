use std::fmt::Write;

use super::*;
use crate::value::Value;

/// Human-readable listing of a module: constants, function table, then one
/// line per instruction with constant operands resolved.
pub fn disassemble(module: &BytecodeModule) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "constants ({}):", module.constants.len());
    for (i, c) in module.constants.iter().enumerate() {
        let _ = writeln!(out, "  #{:<4} {}", i, describe_const(c));
    }
    if !module.functions.is_empty() {
        let _ = writeln!(out, "functions ({}):", module.functions.len());
        for f in &module.functions {
            let _ = writeln!(out, "  {}({}) @ {:04}", f.name, f.params.join(", "), f.entry);
        }
    }
    let _ = writeln!(out, "code ({} bytes):", module.code.len());

    let code = &module.code;
    let mut ip = 0;
    while ip < code.len() {
        let op = code[ip];
        let Some((name, argc)) = op_info(op) else {
            let _ = writeln!(out, "  {:04}  <invalid 0x{:02x}>", ip, op);
            ip += 1;
            continue;
        };
        if let Some(f) = module.functions.iter().find(|f| f.entry as usize == ip) {
            let _ = writeln!(out, "{}:", f.name);
        }
        let operands: Vec<Option<u32>> = (0..argc).map(|i| read_u32(code, ip + 1 + 4 * i)).collect();
        let mut line = format!("  {:04}  {:<14}", ip, name);
        for operand in &operands {
            match operand {
                Some(n) => {
                    let _ = write!(line, " {}", n);
                }
                None => line.push_str(" <truncated>"),
            }
        }
        if let Some(Some(idx)) = operands.first() {
            if matches!(op, OP_PUSH | OP_LOAD | OP_STORE | OP_GET_FIELD | OP_CALL | OP_CALL_VOID) {
                if let Some(c) = module.constant(*idx) {
                    let _ = write!(line, "    ; {}", describe_const(c));
                }
            }
        }
        let _ = writeln!(out, "{}", line.trim_end());
        ip += 1 + 4 * argc;
    }
    out
}

fn describe_const(value: &Value) -> String {
    match value {
        Value::Str(s) => format!("{:?}", s),
        other => format!("{} ({})", other, other.type_name()),
    }
}
