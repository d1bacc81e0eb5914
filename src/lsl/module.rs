use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::api::API_FUNCTIONS;
use super::events::{EventKind, EVENT_TABLE_WIDTH};
use super::operators::BinEval;
use super::types::Type;

/// Bumped whenever the bytecode or module layout changes.
pub const MODULE_VERSION: u32 = 1;

/// Constant pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Integer(i32),
    Float(f64),
    String(String),
    Key(String),
    Vector([f64; 3]),
    Rotation([f64; 4]),
}

/// Variable slot addressed by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarRef {
    Local(u16),
    Global(u16),
}

/// Vector / rotation component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    X,
    Y,
    Z,
    S,
}

impl Component {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "x" => Some(Self::X),
            "y" => Some(Self::Y),
            "z" => Some(Self::Z),
            "s" => Some(Self::S),
            _ => None,
        }
    }
}

/// Bytecode instructions.
///
/// Binary operators expect the right operand below the left one: operands are
/// evaluated right first, so the left value is on top when `Binary` runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Op {
    // Stack
    PushConst(u16),
    PushDefault(Type),
    PushUndef,
    Pop,
    Dup,

    // Variables
    LoadLocal(u16),
    StoreLocal(u16),
    LoadGlobal(u16),
    StoreGlobal(u16),

    // Conversions and operators
    Cast(Type),
    /// Convert the value beneath the top of the stack.
    CastSecond(Type),
    Binary(BinEval),
    Neg,
    BitNot,
    Not,
    IsType(Type),

    // Constructors and components
    MakeList(u16),
    MakeVector,
    MakeRotation,
    GetField(Component),
    SetField(Component),

    // Arrays: ArrayGet [arr, key], ArraySet [key, value] into the variable.
    ArrayGet,
    ArraySet(VarRef),
    ArrayCount,
    ArrayKey,
    ArrayValue,

    // Control flow
    Jump(u32),
    JumpIfFalse(u32),
    JumpIfTrue(u32),
    JumpIfNoStateChange(u32),
    Call(u16),
    CallApi(u16),
    Return,

    // Memory accounting
    MemStatic(i32),
    MemIncr(VarRef),
    MemDecr(VarRef),

    // Scheduling and states
    CheckRun,
    SetState(u16),
}

/// What a compiled function is for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FunctionKind {
    Script,
    Handler { state: u16, event: EventKind },
    /// Global initializer.
    Init,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub kind: FunctionKind,
    pub params: Vec<Type>,
    pub ret: Type,
    /// Parameters, declared locals and compiler temporaries.
    pub local_count: u16,
    pub ops: Vec<Op>,
    /// Source `(line, column)` of each instruction.
    pub lines: Vec<(u32, u32)>,
}

impl Function {
    /// Source position of the instruction at `pc`, if recorded.
    pub fn position(&self, pc: usize) -> Option<(u32, u32)> {
        self.lines.get(pc).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSlot {
    pub name: String,
    pub ty: Type,
}

/// Executable result of compiling one script. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledModule {
    pub version: u32,
    pub name: String,
    /// FNV-1a hash of the source text.
    pub fingerprint: u64,
    pub arrays_enabled: bool,
    pub constants: Vec<Constant>,
    pub globals: Vec<GlobalSlot>,
    /// Function index of the global initializer.
    pub init: u16,
    pub functions: Vec<Function>,
    /// State names; index 0 is `default`.
    pub states: Vec<String>,
    /// `dispatch[state][event column]` → handler function index.
    pub dispatch: Vec<Vec<Option<u16>>>,
}

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("module version {found} but this engine runs version {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("malformed module: {0}")]
    Malformed(String),
}

pub fn fingerprint(source: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    source
        .bytes()
        .fold(OFFSET, |h, b| (h ^ u64::from(b)).wrapping_mul(PRIME))
}

impl CompiledModule {
    /// Handler for `event` in `state`, if one is declared.
    pub fn handler(&self, state: usize, event: EventKind) -> Option<u16> {
        let column = event.column()?;
        self.dispatch.get(state)?.get(column).copied().flatten()
    }

    pub fn state_index(&self, name: &str) -> Option<usize> {
        self.states.iter().position(|s| s == name)
    }

    pub fn to_json(&self) -> Result<String, ModuleError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ModuleError> {
        let module: Self = serde_json::from_str(json)?;
        if module.version != MODULE_VERSION {
            return Err(ModuleError::VersionMismatch {
                found: module.version,
                expected: MODULE_VERSION,
            });
        }
        module.validate()?;
        Ok(module)
    }

    /// Structural checks for modules that did not come straight from the compiler.
    fn validate(&self) -> Result<(), ModuleError> {
        if self.functions.get(usize::from(self.init)).is_none() {
            return Err(ModuleError::Malformed("initializer index out of range".into()));
        }
        if self.states.is_empty() || self.dispatch.len() != self.states.len() {
            return Err(ModuleError::Malformed("dispatch table does not match states".into()));
        }
        for row in &self.dispatch {
            if row.len() != EVENT_TABLE_WIDTH {
                return Err(ModuleError::Malformed("dispatch row has wrong width".into()));
            }
            if row
                .iter()
                .flatten()
                .any(|&f| self.functions.get(usize::from(f)).is_none())
            {
                return Err(ModuleError::Malformed("handler index out of range".into()));
            }
        }
        for func in &self.functions {
            if func.lines.len() != func.ops.len() {
                return Err(ModuleError::Malformed(format!("{}: line table length", func.name)));
            }
        }
        Ok(())
    }

    /// Human-readable listing of every function.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "; module {} v{} fingerprint {:016x}",
            self.name, self.version, self.fingerprint
        );
        for (i, g) in self.globals.iter().enumerate() {
            let _ = writeln!(out, "; global {i}: {} {}", g.ty, g.name);
        }
        for (i, func) in self.functions.iter().enumerate() {
            let _ = writeln!(out, "\n{i}: {} ({} locals)", func.name, func.local_count);
            for (pc, op) in func.ops.iter().enumerate() {
                let line = func.position(pc).map_or(0, |(l, _)| l);
                let _ = writeln!(out, "  {pc:>4}  [{line:>3}]  {}", self.describe(op));
            }
        }
        out
    }

    fn describe(&self, op: &Op) -> String {
        match op {
            Op::PushConst(i) => match self.constants.get(usize::from(*i)) {
                Some(c) => format!("PushConst {c:?}"),
                None => format!("PushConst #{i}"),
            },
            Op::Call(f) => match self.functions.get(usize::from(*f)) {
                Some(func) => format!("Call {}", func.name),
                None => format!("Call #{f}"),
            },
            Op::CallApi(f) => match API_FUNCTIONS.get(usize::from(*f)) {
                Some(func) => format!("CallApi {}", func.name),
                None => format!("CallApi #{f}"),
            },
            Op::LoadGlobal(g) | Op::StoreGlobal(g) => {
                let name = self.globals.get(usize::from(*g)).map_or("?", |s| s.name.as_str());
                format!("{op:?} ({name})")
            }
            Op::SetState(s) => {
                let name = self.states.get(usize::from(*s)).map_or("?", String::as_str);
                format!("SetState {name}")
            }
            other => format!("{other:?}"),
        }
    }
}
