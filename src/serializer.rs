/// Bytecode file (de)serialization.
///
/// Little-endian throughout, strict header checks, distinct error per
/// rejection cause. Layout:
///
/// ```text
///   magic            4 bytes  "ETCH"
///   vm_type          u8       (must be Register)
///   version          u32      (must equal BYTECODE_VERSION)
///   source_hash      32 bytes
///   compiler_ver     32 bytes, zero-padded
///   flags            u8
///   source_file      u32 len + bytes
///   entry_point      u32
///   constants        u32 count + tagged values
///   instructions     u32 count + encoded instructions
///   functions        u32 count + name/start/end/params/locals
///   cffi             u32 count + descriptors (resolved paths are
///                    machine-local and re-resolved at load, not stored)
///   lifetimes        u32 count + per-function lifetime data
/// ```
///
/// Values encode as a kind tag byte followed by the payload; wrappers
/// recurse into their inner value. Instructions encode opcode, A, an
/// operand-form byte, form-specific operands, then the debug record
/// (line 0 with an empty file marks "absent").

use std::collections::HashMap;
use std::path::Path;

use crate::bytecode::{
    ConstPool, DebugInfo, FunctionInfo, Instr, Op, Operands, Program, ProgramFlags, VmType,
    BYTECODE_VERSION,
};
use crate::cffi::{CffiDescriptor, FfiType};
use crate::errors::LoadError;
use crate::lifetime::{FunctionLifetimes, LifetimeRange};
use crate::value::{Tag, Value};

pub const MAGIC: &[u8; 4] = b"ETCH";

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

pub fn serialize(program: &Program) -> Vec<u8> {
    let mut out = Vec::with_capacity(4096);
    out.extend_from_slice(MAGIC);
    out.push(VmType::Register as u8);
    put_u32(&mut out, BYTECODE_VERSION);
    out.extend_from_slice(&program.source_hash);
    out.extend_from_slice(&padded_32(&program.compiler_version));
    out.push(program.flags.to_byte());
    put_str(&mut out, &program.source_file);
    put_u32(&mut out, program.entry_point);

    put_u32(&mut out, program.constants.len() as u32);
    for v in program.constants.values() {
        put_value(&mut out, v);
    }

    put_u32(&mut out, program.code.len() as u32);
    for instr in &program.code {
        put_instr(&mut out, instr);
    }

    let mut fn_names: Vec<&String> = program.functions.keys().collect();
    fn_names.sort();
    put_u32(&mut out, fn_names.len() as u32);
    for name in fn_names {
        let info = &program.functions[name];
        put_str(&mut out, name);
        put_u32(&mut out, info.start_pc);
        put_u32(&mut out, info.end_pc);
        put_u32(&mut out, info.param_count);
        put_u32(&mut out, info.max_register_used);
    }
    // The callable-by-index table, in index order.
    put_u32(&mut out, program.function_table.len() as u32);
    for name in &program.function_table {
        put_str(&mut out, name);
    }

    let mut cffi_names: Vec<&String> = program.cffi.keys().collect();
    cffi_names.sort();
    put_u32(&mut out, cffi_names.len() as u32);
    for name in cffi_names {
        let d = &program.cffi[name];
        put_str(&mut out, name);
        put_str(&mut out, &d.library_name);
        put_str(&mut out, &d.symbol);
        put_str(&mut out, &d.base_name);
        put_u32(&mut out, d.param_types.len() as u32);
        for t in &d.param_types {
            put_str(&mut out, t.name());
        }
        put_str(&mut out, d.return_type.name());
    }

    let mut lt_names: Vec<&String> = program.lifetimes.keys().collect();
    lt_names.sort();
    put_u32(&mut out, lt_names.len() as u32);
    for name in lt_names {
        let lt = &program.lifetimes[name];
        put_str(&mut out, name);
        put_u32(&mut out, lt.ranges.len() as u32);
        for r in &lt.ranges {
            put_str(&mut out, &r.name);
            out.push(r.register);
            put_i64(&mut out, r.decl_pc);
            put_i64(&mut out, r.def_pc);
            put_i64(&mut out, r.last_use_pc);
            put_i64(&mut out, r.end_pc);
            put_u32(&mut out, r.scope_level);
        }
        put_pc_map(&mut out, &lt.pc_to_vars);
        put_pc_map(&mut out, &lt.destructor_points);
    }

    out
}

pub fn save_file(program: &Program, path: &Path) -> Result<(), LoadError> {
    std::fs::write(path, serialize(program))?;
    Ok(())
}

fn put_pc_map(out: &mut Vec<u8>, map: &HashMap<u32, Vec<String>>) {
    let mut pcs: Vec<&u32> = map.keys().collect();
    pcs.sort();
    put_u32(out, pcs.len() as u32);
    for pc in pcs {
        put_u32(out, *pc);
        let names = &map[pc];
        put_u32(out, names.len() as u32);
        for n in names {
            put_str(out, n);
        }
    }
}

pub(crate) fn put_value(out: &mut Vec<u8>, v: &Value) {
    out.push(v.tag() as u8);
    match v {
        Value::Int(n) => put_i64(out, *n),
        Value::Float(f) => out.extend_from_slice(&f.to_bits().to_le_bytes()),
        Value::Bool(b) => out.push(*b as u8),
        Value::Char(c) => out.push(*c),
        Value::Str(s) => put_str(out, s),
        Value::Array(items) => {
            let items = items.lock();
            put_u32(out, items.len() as u32);
            for item in items.iter() {
                put_value(out, item);
            }
        }
        Value::Table(entries) => {
            let entries = entries.lock();
            let mut keys: Vec<&String> = entries.keys().collect();
            keys.sort();
            put_u32(out, keys.len() as u32);
            for key in keys {
                put_str(out, key);
                put_value(out, &entries[key]);
            }
        }
        Value::Some(inner) | Value::Ok(inner) | Value::Err(inner) => put_value(out, inner),
        Value::Nil | Value::None => {}
    }
}

fn put_instr(out: &mut Vec<u8>, instr: &Instr) {
    out.push(instr.op as u8);
    out.push(instr.a);
    out.push(instr.operands.kind());
    match instr.operands {
        Operands::Abc { b, c } => {
            out.push(b);
            out.push(c);
        }
        Operands::ABx { bx } => out.extend_from_slice(&bx.to_le_bytes()),
        Operands::AsBx { sbx } => out.extend_from_slice(&sbx.to_le_bytes()),
        Operands::Ax { ax } => put_u32(out, ax),
        Operands::Call { func, nargs, nres } => {
            out.extend_from_slice(&func.to_le_bytes());
            out.push(nargs);
            out.push(nres);
        }
    }
    match &instr.debug {
        Some(d) => {
            put_u32(out, d.line);
            put_str(out, &d.source_file);
        }
        None => {
            put_u32(out, 0);
            put_u32(out, 0);
        }
    }
}

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn padded_32(s: &str) -> [u8; 32] {
    let mut buf = [0u8; 32];
    let bytes = s.as_bytes();
    let n = bytes.len().min(32);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

pub fn deserialize(bytes: &[u8]) -> Result<Program, LoadError> {
    let mut r = Reader { data: bytes, pos: 0 };

    let magic = r.take(4, "magic")?;
    if magic != MAGIC {
        return Err(LoadError::BadMagic);
    }
    let vm_type = r.u8("vm type")?;
    if vm_type != VmType::Register as u8 {
        return Err(LoadError::WrongVmType { found: vm_type });
    }
    let version = r.u32("version")?;
    if version != BYTECODE_VERSION {
        return Err(LoadError::WrongVersion { found: version, expected: BYTECODE_VERSION });
    }

    let mut source_hash = [0u8; 32];
    source_hash.copy_from_slice(r.take(32, "source hash")?);
    let ver_raw = r.take(32, "compiler version")?;
    let compiler_version = String::from_utf8_lossy(ver_raw)
        .trim_end_matches('\0')
        .to_string();
    let flags = ProgramFlags::from_byte(r.u8("flags")?);
    let source_file = r.string("source file")?;
    let entry_point = r.u32("entry point")?;

    let const_count = r.u32("constant count")?;
    let mut constants = Vec::with_capacity(const_count as usize);
    for _ in 0..const_count {
        constants.push(read_value(&mut r)?);
    }

    let instr_count = r.u32("instruction count")?;
    let mut code = Vec::with_capacity(instr_count as usize);
    for _ in 0..instr_count {
        code.push(read_instr(&mut r)?);
    }

    let func_count = r.u32("function count")?;
    let mut functions = HashMap::with_capacity(func_count as usize);
    for _ in 0..func_count {
        let name = r.string("function name")?;
        let info = FunctionInfo {
            start_pc: r.u32("function start")?,
            end_pc: r.u32("function end")?,
            param_count: r.u32("function params")?,
            max_register_used: r.u32("function locals")?,
        };
        functions.insert(name, info);
    }
    let table_count = r.u32("function table count")?;
    let mut function_table = Vec::with_capacity(table_count as usize);
    for _ in 0..table_count {
        function_table.push(r.string("function table entry")?);
    }

    let cffi_count = r.u32("cffi count")?;
    let mut cffi = HashMap::with_capacity(cffi_count as usize);
    for _ in 0..cffi_count {
        let mangled = r.string("cffi name")?;
        let library_name = r.string("cffi library")?;
        let symbol = r.string("cffi symbol")?;
        let base_name = r.string("cffi base name")?;
        let param_count = r.u32("cffi param count")?;
        let mut param_types = Vec::with_capacity(param_count as usize);
        for _ in 0..param_count {
            param_types.push(read_ffi_type(&mut r)?);
        }
        let return_type = read_ffi_type(&mut r)?;
        cffi.insert(
            mangled,
            CffiDescriptor {
                library_name,
                resolved_path: String::new(),
                symbol,
                base_name,
                param_types,
                return_type,
            },
        );
    }

    let lt_count = r.u32("lifetime count")?;
    let mut lifetimes = HashMap::with_capacity(lt_count as usize);
    for _ in 0..lt_count {
        let fname = r.string("lifetime function name")?;
        let range_count = r.u32("lifetime range count")?;
        let mut ranges = Vec::with_capacity(range_count as usize);
        for _ in 0..range_count {
            ranges.push(LifetimeRange {
                name: r.string("range name")?,
                register: r.u8("range register")?,
                decl_pc: r.i64("range decl pc")?,
                def_pc: r.i64("range def pc")?,
                last_use_pc: r.i64("range last use pc")?,
                end_pc: r.i64("range end pc")?,
                scope_level: r.u32("range scope level")?,
            });
        }
        let pc_to_vars = read_pc_map(&mut r)?;
        let destructor_points = read_pc_map(&mut r)?;
        lifetimes.insert(fname, FunctionLifetimes { ranges, pc_to_vars, destructor_points });
    }

    Ok(Program {
        source_file,
        source_hash,
        compiler_version,
        flags,
        entry_point,
        constants: ConstPool::from_values(constants),
        code,
        functions,
        function_table,
        cffi,
        lifetimes,
    })
}

pub fn load_file(path: &Path) -> Result<Program, LoadError> {
    let bytes = std::fs::read(path)?;
    deserialize(&bytes)
}

pub(crate) struct Reader<'a> {
    pub(crate) data: &'a [u8],
    pub(crate) pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], LoadError> {
        if self.pos + n > self.data.len() {
            return Err(LoadError::UnexpectedEof { what });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self, what: &'static str) -> Result<u8, LoadError> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn u16(&mut self, what: &'static str) -> Result<u16, LoadError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn i16(&mut self, what: &'static str) -> Result<i16, LoadError> {
        let b = self.take(2, what)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self, what: &'static str) -> Result<u32, LoadError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i64(&mut self, what: &'static str) -> Result<i64, LoadError> {
        let b = self.take(8, what)?;
        Ok(i64::from_le_bytes(b.try_into().expect("slice length checked")))
    }

    pub(crate) fn f64(&mut self, what: &'static str) -> Result<f64, LoadError> {
        let b = self.take(8, what)?;
        Ok(f64::from_bits(u64::from_le_bytes(b.try_into().expect("slice length checked"))))
    }

    pub(crate) fn string(&mut self, what: &'static str) -> Result<String, LoadError> {
        let len = self.u32(what)? as usize;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| LoadError::Corrupt {
            what,
            detail: e.to_string(),
        })
    }
}

pub(crate) fn read_value(r: &mut Reader) -> Result<Value, LoadError> {
    let tag_byte = r.u8("value tag")?;
    let tag = Tag::from_u8(tag_byte).ok_or(LoadError::Corrupt {
        what: "value tag",
        detail: format!("unknown tag {}", tag_byte),
    })?;
    Ok(match tag {
        Tag::Nil => Value::Nil,
        Tag::None => Value::None,
        Tag::Int => Value::Int(r.i64("int value")?),
        Tag::Float => Value::Float(r.f64("float value")?),
        Tag::Bool => Value::Bool(r.u8("bool value")? != 0),
        Tag::Char => Value::Char(r.u8("char value")?),
        Tag::Str => Value::Str(r.string("string value")?),
        Tag::Array => {
            let count = r.u32("array count")?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(read_value(r)?);
            }
            Value::array(items)
        }
        Tag::Table => {
            let count = r.u32("table count")?;
            let mut entries = HashMap::with_capacity(count as usize);
            for _ in 0..count {
                let key = r.string("table key")?;
                entries.insert(key, read_value(r)?);
            }
            Value::table(entries)
        }
        Tag::Some => Value::some(read_value(r)?),
        Tag::Ok => Value::ok(read_value(r)?),
        Tag::Err => Value::err(read_value(r)?),
    })
}

fn read_instr(r: &mut Reader) -> Result<Instr, LoadError> {
    let op_byte = r.u8("opcode")?;
    let op = Op::from_u8(op_byte).ok_or(LoadError::Corrupt {
        what: "opcode",
        detail: format!("unknown opcode {}", op_byte),
    })?;
    let a = r.u8("operand A")?;
    let kind = r.u8("operand form")?;
    let operands = match kind {
        0 => Operands::Abc { b: r.u8("operand B")?, c: r.u8("operand C")? },
        1 => Operands::ABx { bx: r.u16("operand Bx")? },
        2 => Operands::AsBx { sbx: r.i16("operand sBx")? },
        3 => Operands::Ax { ax: r.u32("operand Ax")? },
        4 => Operands::Call {
            func: r.u16("call function index")?,
            nargs: r.u8("call arg count")?,
            nres: r.u8("call result count")?,
        },
        other => {
            return Err(LoadError::Corrupt {
                what: "operand form",
                detail: format!("unknown form {}", other),
            })
        }
    };
    let line = r.u32("debug line")?;
    let source_file = r.string("debug source file")?;
    let debug = if line == 0 && source_file.is_empty() {
        None
    } else {
        Some(DebugInfo { line, col: 0, source_file })
    };
    Ok(Instr { op, a, operands, debug })
}

fn read_ffi_type(r: &mut Reader) -> Result<FfiType, LoadError> {
    let s = r.string("ffi type")?;
    FfiType::parse(&s).ok_or(LoadError::Corrupt {
        what: "ffi type",
        detail: format!("unknown type '{}'", s),
    })
}

fn read_pc_map(r: &mut Reader) -> Result<HashMap<u32, Vec<String>>, LoadError> {
    let count = r.u32("pc map count")?;
    let mut map = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let pc = r.u32("pc map key")?;
        let name_count = r.u32("pc map name count")?;
        let mut names = Vec::with_capacity(name_count as usize);
        for _ in 0..name_count {
            names.push(r.string("pc map name")?);
        }
        map.insert(pc, names);
    }
    Ok(map)
}
