/// Runtime value model.
///
/// A discriminated union with owned payloads. Wrapped variants (Some/Ok/Err)
/// box a single inner value they own exclusively. Arrays and tables are
/// reference-counted shared containers; cloning a Value clones the handle,
/// not the storage. Equality is structural and deep; ordering exists only
/// within Int/Int, Float/Float, Char/Char, and String/String (lexical).
///
/// Arithmetic helpers are monomorphic per type pair: Int×Int, Float×Float,
/// String×String (concat), Array×Array (concat). Every other combination
/// yields Nil; the interpreter is the sole arithmetic client.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Variant tag. Doubles as the serialized kind byte and as the operand of
/// the TestTag instruction.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Nil = 0,
    Int = 1,
    Float = 2,
    Bool = 3,
    Char = 4,
    Str = 5,
    Array = 6,
    Table = 7,
    Some = 8,
    None = 9,
    Ok = 10,
    Err = 11,
}

impl Tag {
    pub fn from_u8(b: u8) -> Option<Tag> {
        if b <= Tag::Err as u8 {
            Some(unsafe { std::mem::transmute(b) })
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Tag::Nil => "nil",
            Tag::Int => "int",
            Tag::Float => "float",
            Tag::Bool => "bool",
            Tag::Char => "char",
            Tag::Str => "string",
            Tag::Array => "array",
            Tag::Table => "table",
            Tag::Some => "some",
            Tag::None => "none",
            Tag::Ok => "ok",
            Tag::Err => "err",
        }
    }
}

#[derive(Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Single byte character.
    Char(u8),
    Nil,
    Str(String),
    Array(Arc<Mutex<Vec<Value>>>),
    Table(Arc<Mutex<HashMap<String, Value>>>),
    Some(Box<Value>),
    None,
    Ok(Box<Value>),
    Err(Box<Value>),
}

impl Value {
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(Mutex::new(items)))
    }

    pub fn table(entries: HashMap<String, Value>) -> Value {
        Value::Table(Arc::new(Mutex::new(entries)))
    }

    pub fn some(inner: Value) -> Value {
        Value::Some(Box::new(inner))
    }

    pub fn ok(inner: Value) -> Value {
        Value::Ok(Box::new(inner))
    }

    pub fn err(inner: Value) -> Value {
        Value::Err(Box::new(inner))
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        match self {
            Value::Int(_) => Tag::Int,
            Value::Float(_) => Tag::Float,
            Value::Bool(_) => Tag::Bool,
            Value::Char(_) => Tag::Char,
            Value::Nil => Tag::Nil,
            Value::Str(_) => Tag::Str,
            Value::Array(_) => Tag::Array,
            Value::Table(_) => Tag::Table,
            Value::Some(_) => Tag::Some,
            Value::None => Tag::None,
            Value::Ok(_) => Tag::Ok,
            Value::Err(_) => Tag::Err,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.tag().name()
    }

    #[inline]
    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, Value::Float(_))
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    #[inline]
    pub fn is_some(&self) -> bool {
        matches!(self, Value::Some(_))
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, Value::Ok(_))
    }

    #[inline]
    pub fn is_err(&self) -> bool {
        matches!(self, Value::Err(_))
    }

    /// Nil and false are falsy; everything else is truthy.
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Extract the payload of Some. Non-matching variants yield Nil.
    pub fn unwrap_option(self) -> Value {
        match self {
            Value::Some(inner) => *inner,
            _ => Value::Nil,
        }
    }

    /// Extract the payload of Ok or Err. Non-matching variants yield Nil.
    pub fn unwrap_result(self) -> Value {
        match self {
            Value::Ok(inner) | Value::Err(inner) => *inner,
            _ => Value::Nil,
        }
    }

    /// Deep copy: arrays and tables get fresh storage. Used by the replay
    /// recorder, which must capture state immune to later mutation.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::Array(items) => {
                let copied: Vec<Value> = items.lock().iter().map(Value::deep_copy).collect();
                Value::array(copied)
            }
            Value::Table(entries) => {
                let copied: HashMap<String, Value> = entries
                    .lock()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect();
                Value::table(copied)
            }
            Value::Some(inner) => Value::some(inner.deep_copy()),
            Value::Ok(inner) => Value::ok(inner.deep_copy()),
            Value::Err(inner) => Value::err(inner.deep_copy()),
            other => other.clone(),
        }
    }

    pub fn display(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
                    format!("{:.1}", f)
                } else {
                    f.to_string()
                }
            }
            Value::Bool(b) => b.to_string(),
            Value::Char(c) => (*c as char).to_string(),
            Value::Nil => "nil".into(),
            Value::Str(s) => s.clone(),
            Value::Array(items) => {
                let parts: Vec<String> = items.lock().iter().map(|v| v.display()).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Table(entries) => {
                let mut parts: Vec<String> = entries
                    .lock()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.display()))
                    .collect();
                parts.sort();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Some(inner) => format!("some({})", inner.display()),
            Value::None => "none".into(),
            Value::Ok(inner) => format!("ok({})", inner.display()),
            Value::Err(inner) => format!("err({})", inner.display()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "Str({:?})", s),
            other => write!(f, "{}({})", other.type_name(), other.display()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// Structural, deep equality. Same variant and equal payload; Nil == Nil,
/// Some(a) == Some(b) iff a == b. Int(1) != Float(1.0).
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let la = a.lock();
                let lb = b.lock();
                *la == *lb
            }
            (Value::Table(a), Value::Table(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let la = a.lock();
                let lb = b.lock();
                *la == *lb
            }
            (Value::Some(a), Value::Some(b)) => a == b,
            (Value::Ok(a), Value::Ok(b)) => a == b,
            (Value::Err(a), Value::Err(b)) => a == b,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Monomorphic arithmetic — tag-pair dispatch, Nil on mismatch
// ---------------------------------------------------------------------------

#[inline]
pub fn arith_add(l: &Value, r: &Value) -> Value {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(*b)),
        (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
        (Value::Str(a), Value::Str(b)) => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Value::Str(s)
        }
        (Value::Array(a), Value::Array(b)) => {
            let mut items = a.lock().clone();
            items.extend(b.lock().iter().cloned());
            Value::array(items)
        }
        _ => Value::Nil,
    }
}

#[inline]
pub fn arith_sub(l: &Value, r: &Value) -> Value {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_sub(*b)),
        (Value::Float(a), Value::Float(b)) => Value::Float(a - b),
        _ => Value::Nil,
    }
}

#[inline]
pub fn arith_mul(l: &Value, r: &Value) -> Value {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_mul(*b)),
        (Value::Float(a), Value::Float(b)) => Value::Float(a * b),
        _ => Value::Nil,
    }
}

/// Division. `None` signals integer division by zero, which the dispatch
/// loop treats as fatal. Float division follows IEEE-754 (±∞/NaN).
#[inline]
pub fn arith_div(l: &Value, r: &Value) -> Option<Value> {
    match (l, r) {
        (Value::Int(_), Value::Int(0)) => None,
        (Value::Int(a), Value::Int(b)) => Some(Value::Int(a.wrapping_div(*b))),
        (Value::Float(a), Value::Float(b)) => Some(Value::Float(a / b)),
        _ => Some(Value::Nil),
    }
}

/// Remainder, same zero-divisor contract as `arith_div`.
#[inline]
pub fn arith_mod(l: &Value, r: &Value) -> Option<Value> {
    match (l, r) {
        (Value::Int(_), Value::Int(0)) => None,
        (Value::Int(a), Value::Int(b)) => Some(Value::Int(a.wrapping_rem(*b))),
        (Value::Float(a), Value::Float(b)) => Some(Value::Float(a % b)),
        _ => Some(Value::Nil),
    }
}

#[inline]
pub fn arith_pow(l: &Value, r: &Value) -> Value {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            if *b < 0 {
                Value::Float((*a as f64).powi(*b as i32))
            } else {
                Value::Int(a.wrapping_pow((*b).min(u32::MAX as i64) as u32))
            }
        }
        (Value::Float(a), Value::Float(b)) => Value::Float(a.powf(*b)),
        _ => Value::Nil,
    }
}

#[inline]
pub fn arith_neg(v: &Value) -> Value {
    match v {
        Value::Int(n) => Value::Int(n.wrapping_neg()),
        Value::Float(f) => Value::Float(-f),
        _ => Value::Nil,
    }
}

// ---------------------------------------------------------------------------
// Ordering — defined pairs only, None otherwise
// ---------------------------------------------------------------------------

#[inline]
pub fn cmp_lt(l: &Value, r: &Value) -> Option<bool> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Some(a < b),
        (Value::Float(a), Value::Float(b)) => Some(a < b),
        (Value::Char(a), Value::Char(b)) => Some(a < b),
        (Value::Str(a), Value::Str(b)) => Some(a < b),
        _ => None,
    }
}

#[inline]
pub fn cmp_le(l: &Value, r: &Value) -> Option<bool> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Some(a <= b),
        (Value::Float(a), Value::Float(b)) => Some(a <= b),
        (Value::Char(a), Value::Char(b)) => Some(a <= b),
        (Value::Str(a), Value::Str(b)) => Some(a <= b),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// Membership: arrays test element equality, strings test substring (or
/// single-char) containment, tables test string key presence. Any other
/// receiver is false.
pub fn contains(container: &Value, item: &Value) -> bool {
    match container {
        Value::Array(items) => items.lock().iter().any(|v| v == item),
        Value::Str(s) => match item {
            Value::Str(needle) => s.contains(needle.as_str()),
            Value::Char(c) => s.as_bytes().contains(c),
            _ => false,
        },
        Value::Table(entries) => match item {
            Value::Str(key) => entries.lock().contains_key(key),
            _ => false,
        },
        _ => false,
    }
}

/// Length of strings (bytes), arrays, and tables; Nil otherwise.
pub fn length(v: &Value) -> Value {
    match v {
        Value::Str(s) => Value::Int(s.len() as i64),
        Value::Array(items) => Value::Int(items.lock().len() as i64),
        Value::Table(entries) => Value::Int(entries.lock().len() as i64),
        _ => Value::Nil,
    }
}

/// Slice of an array or string over `[start, end)` with clamping; negative
/// or inverted ranges collapse to empty. Nil for other receivers.
pub fn slice(v: &Value, start: i64, end: i64) -> Value {
    let clamp = |len: usize| -> (usize, usize) {
        let s = start.max(0).min(len as i64) as usize;
        let e = end.max(0).min(len as i64) as usize;
        (s, e.max(s))
    };
    match v {
        Value::Str(s) => {
            let (a, b) = clamp(s.len());
            Value::Str(s.get(a..b).unwrap_or("").to_string())
        }
        Value::Array(items) => {
            let items = items.lock();
            let (a, b) = clamp(items.len());
            Value::array(items[a..b].to_vec())
        }
        _ => Value::Nil,
    }
}

/// Index into an array (by Int) or string (by Int, yielding Char) or table
/// (by Str). Out of bounds or wrong key type yields Nil.
pub fn index_get(container: &Value, index: &Value) -> Value {
    match (container, index) {
        (Value::Array(items), Value::Int(i)) => {
            let items = items.lock();
            if *i >= 0 && (*i as usize) < items.len() {
                items[*i as usize].clone()
            } else {
                Value::Nil
            }
        }
        (Value::Str(s), Value::Int(i)) => {
            if *i >= 0 && (*i as usize) < s.len() {
                Value::Char(s.as_bytes()[*i as usize])
            } else {
                Value::Nil
            }
        }
        (Value::Table(entries), Value::Str(key)) => {
            entries.lock().get(key).cloned().unwrap_or(Value::Nil)
        }
        _ => Value::Nil,
    }
}

/// Store into an array slot or table key. Out-of-bounds array stores and
/// mismatched receivers are silently dropped.
pub fn index_set(container: &Value, index: &Value, val: Value) {
    match (container, index) {
        (Value::Array(items), Value::Int(i)) => {
            let mut items = items.lock();
            if *i >= 0 && (*i as usize) < items.len() {
                items[*i as usize] = val;
            }
        }
        (Value::Table(entries), Value::Str(key)) => {
            entries.lock().insert(key.clone(), val);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_structural_and_variant_strict() {
        assert_eq!(Value::Int(1), Value::Int(1));
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Nil, Value::Nil);
        assert_eq!(Value::some(Value::Int(2)), Value::some(Value::Int(2)));
        assert_ne!(Value::some(Value::Int(2)), Value::ok(Value::Int(2)));
        assert_eq!(
            Value::array(vec![Value::Int(1), Value::Str("x".into())]),
            Value::array(vec![Value::Int(1), Value::Str("x".into())])
        );
    }

    #[test]
    fn arithmetic_is_monomorphic() {
        assert_eq!(arith_add(&Value::Int(2), &Value::Int(3)), Value::Int(5));
        assert_eq!(arith_add(&Value::Int(2), &Value::Float(3.0)), Value::Nil);
        assert_eq!(
            arith_add(&Value::Str("ab".into()), &Value::Str("cd".into())),
            Value::Str("abcd".into())
        );
        let cat = arith_add(
            &Value::array(vec![Value::Int(1)]),
            &Value::array(vec![Value::Int(2)]),
        );
        assert_eq!(cat, Value::array(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn int_division_by_zero_is_signalled() {
        assert_eq!(arith_div(&Value::Int(1), &Value::Int(0)), None);
        assert_eq!(
            arith_div(&Value::Int(7), &Value::Int(2)),
            Some(Value::Int(3))
        );
        // Float follows IEEE-754.
        match arith_div(&Value::Float(1.0), &Value::Float(0.0)) {
            Some(Value::Float(f)) => assert!(f.is_infinite()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unwrap_on_wrong_variant_yields_nil() {
        assert_eq!(Value::some(Value::Int(4)).unwrap_option(), Value::Int(4));
        assert_eq!(Value::Int(4).unwrap_option(), Value::Nil);
        assert_eq!(Value::err(Value::Str("e".into())).unwrap_result(), Value::Str("e".into()));
        assert_eq!(Value::None.unwrap_result(), Value::Nil);
    }

    #[test]
    fn ordering_pairs() {
        assert_eq!(cmp_lt(&Value::Int(1), &Value::Int(2)), Some(true));
        assert_eq!(
            cmp_lt(&Value::Str("a".into()), &Value::Str("b".into())),
            Some(true)
        );
        assert_eq!(cmp_lt(&Value::Int(1), &Value::Float(2.0)), None);
        assert_eq!(cmp_le(&Value::Char(b'a'), &Value::Char(b'a')), Some(true));
    }

    #[test]
    fn membership() {
        let arr = Value::array(vec![Value::Int(1), Value::Int(2)]);
        assert!(contains(&arr, &Value::Int(2)));
        assert!(!contains(&arr, &Value::Int(9)));
        assert!(contains(&Value::Str("hello".into()), &Value::Str("ell".into())));
        let mut m = HashMap::new();
        m.insert("k".to_string(), Value::Int(1));
        assert!(contains(&Value::table(m), &Value::Str("k".into())));
        assert!(!contains(&Value::Int(3), &Value::Int(3)));
    }

    #[test]
    fn deep_copy_detaches_storage() {
        let arr = Value::array(vec![Value::Int(1)]);
        let copy = arr.deep_copy();
        if let Value::Array(items) = &arr {
            items.lock().push(Value::Int(2));
        }
        assert_eq!(copy, Value::array(vec![Value::Int(1)]));
        assert_ne!(copy, arr);
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::Str(String::new()).is_truthy());
    }
}
