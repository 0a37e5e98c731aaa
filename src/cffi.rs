/// C FFI descriptor model and in-process registry.
///
/// The platform dynamic-loader glue lives outside the core: something else
/// resolves libraries and symbols, then registers an invoker here under the
/// function's mangled name. The executor dispatches through the registry
/// only; descriptors are read at registration time, never on the hot path.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiType {
    I64,
    F64,
    /// NUL-terminated byte pointer on the foreign side.
    Str,
    /// Bools cross the boundary as i32.
    Bool,
    Void,
}

impl FfiType {
    pub fn parse(s: &str) -> Option<FfiType> {
        match s {
            "i64" | "int" => Some(FfiType::I64),
            "f64" | "float" => Some(FfiType::F64),
            "str" | "string" => Some(FfiType::Str),
            "bool" => Some(FfiType::Bool),
            "void" => Some(FfiType::Void),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FfiType::I64 => "i64",
            FfiType::F64 => "f64",
            FfiType::Str => "str",
            FfiType::Bool => "bool",
            FfiType::Void => "void",
        }
    }
}

/// Marshalled argument/return value at the FFI boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum FfiValue {
    I64(i64),
    F64(f64),
    I32(i32),
    Str(CString),
    Void,
}

/// Metadata for one foreign function, keyed by mangled name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CffiDescriptor {
    pub library_name: String,
    pub resolved_path: String,
    pub symbol: String,
    pub base_name: String,
    pub param_types: Vec<FfiType>,
    pub return_type: FfiType,
}

pub type CffiInvoker = Arc<dyn Fn(&[FfiValue]) -> FfiValue + Send + Sync>;

struct Entry {
    descriptor: CffiDescriptor,
    param_types: Vec<FfiType>,
    invoker: CffiInvoker,
}

/// Explicit registry object, handed to the VM at construction. No process
/// globals; two VMs may carry two registries.
#[derive(Default)]
pub struct CffiRegistry {
    entries: HashMap<String, Entry>,
}

impl CffiRegistry {
    pub fn new() -> CffiRegistry {
        CffiRegistry::default()
    }

    pub fn register(&mut self, mangled: impl Into<String>, descriptor: CffiDescriptor, invoker: CffiInvoker) {
        let param_types = descriptor.param_types.clone();
        self.entries.insert(mangled.into(), Entry { descriptor, param_types, invoker });
    }

    pub fn contains(&self, mangled: &str) -> bool {
        self.entries.contains_key(mangled)
    }

    pub fn descriptor(&self, mangled: &str) -> Option<&CffiDescriptor> {
        self.entries.get(mangled).map(|e| &e.descriptor)
    }

    /// Marshal, invoke, unmarshal. `None` when the name is unknown or an
    /// argument cannot be represented at the boundary.
    pub fn invoke(&self, mangled: &str, args: &[Value]) -> Option<Value> {
        let entry = self.entries.get(mangled)?;
        let mut ffi_args = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let want = entry.param_types.get(i).copied().unwrap_or(FfiType::I64);
            ffi_args.push(value_to_ffi(arg, want)?);
        }
        Some(ffi_to_value((entry.invoker)(&ffi_args)))
    }
}

/// Int→i64, Float→f64, String→ptr bytes, Bool→i32. Arrays and tables are
/// unsupported at the boundary.
pub fn value_to_ffi(v: &Value, want: FfiType) -> Option<FfiValue> {
    match (v, want) {
        (Value::Int(n), FfiType::I64) => Some(FfiValue::I64(*n)),
        (Value::Float(f), FfiType::F64) => Some(FfiValue::F64(*f)),
        (Value::Bool(b), FfiType::Bool) => Some(FfiValue::I32(*b as i32)),
        (Value::Str(s), FfiType::Str) => CString::new(s.as_bytes()).ok().map(FfiValue::Str),
        _ => None,
    }
}

pub fn ffi_to_value(v: FfiValue) -> Value {
    match v {
        FfiValue::I64(n) => Value::Int(n),
        FfiValue::F64(f) => Value::Float(f),
        FfiValue::I32(n) => Value::Bool(n != 0),
        FfiValue::Str(s) => Value::Str(s.to_string_lossy().into_owned()),
        FfiValue::Void => Value::Nil,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(params: Vec<FfiType>, ret: FfiType) -> CffiDescriptor {
        CffiDescriptor {
            library_name: "libm".into(),
            resolved_path: "/usr/lib/libm.so".into(),
            symbol: "f".into(),
            base_name: "f".into(),
            param_types: params,
            return_type: ret,
        }
    }

    #[test]
    fn invoke_marshals_arguments() {
        let mut reg = CffiRegistry::new();
        reg.register(
            "add2_i64_i64",
            desc(vec![FfiType::I64, FfiType::I64], FfiType::I64),
            Arc::new(|args| match (&args[0], &args[1]) {
                (FfiValue::I64(a), FfiValue::I64(b)) => FfiValue::I64(a + b),
                _ => FfiValue::Void,
            }),
        );
        let out = reg.invoke("add2_i64_i64", &[Value::Int(2), Value::Int(40)]);
        assert_eq!(out, Some(Value::Int(42)));
    }

    #[test]
    fn arrays_are_rejected_at_boundary() {
        let v = Value::array(vec![Value::Int(1)]);
        assert!(value_to_ffi(&v, FfiType::I64).is_none());
    }

    #[test]
    fn unknown_name_is_none() {
        let reg = CffiRegistry::new();
        assert!(reg.invoke("nope", &[]).is_none());
    }
}
