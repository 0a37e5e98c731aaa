/// Etch error taxonomy.
///
/// Three families, matching the three places a program can die:
///   CompileError — AST → bytecode lowering aborts, no program produced
///   LoadError    — bytecode file rejected at deserialization time
///   VmError      — fatal runtime conditions (recoverable ones yield Nil
///                  inside the dispatch loop and never surface here)

use thiserror::Error;

// ---------------------------------------------------------------------------
// Compile-time errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("register allocation failure in '{function}': more than 255 live registers")]
    RegisterExhausted { function: String },

    #[error("unknown function referent '{name}'")]
    UnknownFunction { name: String },

    #[error("invalid assignment target at line {line}: not a variable, field, or index")]
    InvalidAssignTarget { line: u32 },

    #[error("jump offset out of encodable range at pc {pc}")]
    JumpOutOfRange { pc: usize },

    #[error("constant pool overflow: more than 65535 constants")]
    ConstantPoolOverflow,

    #[error("incoherent AST: {message}")]
    IncoherentAst { message: String },
}

// ---------------------------------------------------------------------------
// Load-time errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("bad magic: not an etch bytecode file")]
    BadMagic,

    #[error("wrong VM type: expected register VM, found tag {found}")]
    WrongVmType { found: u8 },

    #[error("bytecode version mismatch: file has {found}, this build expects {expected}")]
    WrongVersion { found: u32, expected: u32 },

    #[error("truncated file: unexpected end of input while reading {what}")]
    UnexpectedEof { what: &'static str },

    #[error("corrupt {what}: {detail}")]
    Corrupt { what: &'static str, detail: String },

    #[error("bad replay magic: not an etch replay file")]
    BadReplayMagic,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Fatal runtime errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum VmError {
    #[error("integer division by zero at pc {pc} (line {line})")]
    DivisionByZero { pc: usize, line: u32 },

    #[error("frame stack underflow")]
    FrameStackUnderflow,

    #[error("call stack overflow: {depth} frames")]
    StackOverflow { depth: usize },

    #[error("entry point {pc} outside instruction stream (len {len})")]
    BadEntryPoint { pc: usize, len: usize },
}

impl VmError {
    /// Positive process exit code per error class. 0 and -1 are reserved for
    /// normal termination and debugger pause.
    pub fn exit_code(&self) -> i32 {
        match self {
            VmError::DivisionByZero { .. } => 3,
            VmError::FrameStackUnderflow => 4,
            VmError::StackOverflow { .. } => 5,
            VmError::BadEntryPoint { .. } => 6,
        }
    }
}
