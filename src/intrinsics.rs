/// Built-in functions.
///
/// Pure builtins live in a static dispatch table consulted by the executor
/// after user-function and CFFI lookup both miss. The stateful trio —
/// print (output buffer), rand and seed (RNG state) — is dispatched inside
/// the VM itself; this module only knows their names.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::value::Value;

pub type Intrinsic = fn(&[Value]) -> Value;

/// Builtins whose implementation needs executor state.
pub const STATEFUL_BUILTINS: &[&str] = &["print", "rand", "seed"];

pub static INTRINSICS: Lazy<HashMap<&'static str, Intrinsic>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, Intrinsic> = HashMap::new();
    m.insert("toString", intrinsic_to_string);
    m.insert("readFile", intrinsic_read_file);
    m.insert("parseInt", intrinsic_parse_int);
    m.insert("parseFloat", intrinsic_parse_float);
    m.insert("parseBool", intrinsic_parse_bool);
    m.insert("isSome", intrinsic_is_some);
    m.insert("isNone", intrinsic_is_none);
    m.insert("isOk", intrinsic_is_ok);
    m.insert("isErr", intrinsic_is_err);
    m.insert("new", intrinsic_passthrough);
    m.insert("deref", intrinsic_passthrough);
    m
});

pub fn is_builtin(name: &str) -> bool {
    STATEFUL_BUILTINS.contains(&name) || INTRINSICS.contains_key(name)
}

pub fn lookup(name: &str) -> Option<Intrinsic> {
    INTRINSICS.get(name).copied()
}

fn arg<'a>(args: &'a [Value], i: usize) -> &'a Value {
    args.get(i).unwrap_or(&Value::Nil)
}

fn intrinsic_to_string(args: &[Value]) -> Value {
    Value::Str(arg(args, 0).display())
}

fn intrinsic_read_file(args: &[Value]) -> Value {
    match arg(args, 0) {
        Value::Str(path) => match std::fs::read_to_string(path) {
            Ok(contents) => Value::Str(contents),
            Err(_) => Value::Nil,
        },
        _ => Value::Nil,
    }
}

fn intrinsic_parse_int(args: &[Value]) -> Value {
    match arg(args, 0) {
        Value::Str(s) => match s.trim().parse::<i64>() {
            Ok(n) => Value::some(Value::Int(n)),
            Err(_) => Value::None,
        },
        _ => Value::None,
    }
}

fn intrinsic_parse_float(args: &[Value]) -> Value {
    match arg(args, 0) {
        Value::Str(s) => match s.trim().parse::<f64>() {
            Ok(f) => Value::some(Value::Float(f)),
            Err(_) => Value::None,
        },
        _ => Value::None,
    }
}

fn intrinsic_parse_bool(args: &[Value]) -> Value {
    match arg(args, 0) {
        Value::Str(s) => match s.trim() {
            "true" => Value::some(Value::Bool(true)),
            "false" => Value::some(Value::Bool(false)),
            _ => Value::None,
        },
        _ => Value::None,
    }
}

fn intrinsic_is_some(args: &[Value]) -> Value {
    Value::Bool(arg(args, 0).is_some())
}

fn intrinsic_is_none(args: &[Value]) -> Value {
    Value::Bool(arg(args, 0).is_none())
}

fn intrinsic_is_ok(args: &[Value]) -> Value {
    Value::Bool(arg(args, 0).is_ok())
}

fn intrinsic_is_err(args: &[Value]) -> Value {
    Value::Bool(arg(args, 0).is_err())
}

fn intrinsic_passthrough(args: &[Value]) -> Value {
    arg(args, 0).clone()
}
