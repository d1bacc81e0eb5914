//! Binary continuation format for moving a script instance between hosts.
//!
//! Every value is preceded by a one-byte tag. Integers are little-endian
//! `i32`, floats are `f64`, strings are a `u32` byte length followed by UTF-8.
//! Frame receivers go through a substitution table instead of being written
//! out, so a stream only ever names them by id.

use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::debug;

use super::exec::{Frame, Receiver};
use super::value::{ScriptArray, Value};
use crate::lsl::api::API_FUNCTIONS;
use crate::lsl::events::EventKind;
use crate::lsl::module::CompiledModule;
use crate::lsl::types::Type;

pub const MIGRATION_VERSION: u8 = 1;

/// Value tags. The numbering is part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    Null = 0,
    EventCode = 1,
    LslFloat = 2,
    LslInt = 3,
    LslKey = 4,
    LslList = 5,
    LslRot = 6,
    LslStr = 7,
    LslVec = 8,
    ObjArray = 9,
    SysDoub = 10,
    SysFloat = 11,
    SysInt = 12,
    SysStr = 13,
    XmrArray = 14,
    Subst = 15,
    SysBool = 16,
}

impl Tag {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Null,
            1 => Self::EventCode,
            2 => Self::LslFloat,
            3 => Self::LslInt,
            4 => Self::LslKey,
            5 => Self::LslList,
            6 => Self::LslRot,
            7 => Self::LslStr,
            8 => Self::LslVec,
            9 => Self::ObjArray,
            10 => Self::SysDoub,
            11 => Self::SysFloat,
            12 => Self::SysInt,
            13 => Self::SysStr,
            14 => Self::XmrArray,
            15 => Self::Subst,
            16 => Self::SysBool,
            _ => return None,
        })
    }
}

/// Substitution ids for frame receivers.
const SUBST_SCRIPT: i32 = 0;
const SUBST_BEAPI: i32 = 1;

#[derive(Debug, Error)]
pub enum MigrationFault {
    #[error("incoming migration version {0} but accept only {v}", v = MIGRATION_VERSION)]
    Version(u8),
    #[error("stream was written by {found}, not {expected}")]
    ModuleMismatch { expected: String, found: String },
    #[error("bad tag {found}, expected {expected}")]
    BadTag { found: u8, expected: &'static str },
    #[error("migration stream truncated")]
    Truncated,
    #[error("bad frame {index}: {message}")]
    BadFrame { index: usize, message: String },
    #[error("corrupt migration stream: {0}")]
    Corrupt(String),
    #[error("migration I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for MigrationFault {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(err)
        }
    }
}

/// Where an active handler is in the state-transition sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Running the event handler itself.
    Handler,
    /// Running the old state's `state_exit` before switching to the given state.
    Exiting(u16),
    /// Running the new state's `state_entry`.
    Entering,
}

impl Phase {
    fn code(self) -> i32 {
        match self {
            Self::Handler => -1,
            Self::Entering => -2,
            Self::Exiting(next) => i32::from(next),
        }
    }
}

/// Handler-in-progress part of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveHandler {
    pub pending_state: Option<u16>,
    pub phase: Phase,
    pub frames: Vec<Frame>,
}

/// Everything needed to rebuild an instance of a known module.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: i32,
    pub event: EventKind,
    pub mem_usage: i32,
    pub mem_limit: i32,
    pub event_args: Vec<Value>,
    pub globals: Vec<Value>,
    /// Present whenever `event` is not `None`.
    pub active: Option<ActiveHandler>,
}

// ── Writing ──────────────────────────────────────────────────────

struct StreamWriter<W: Write> {
    out: W,
}

impl<W: Write> StreamWriter<W> {
    fn tag(&mut self, tag: Tag) -> io::Result<()> {
        self.out.write_all(&[tag as u8])
    }

    fn raw_int(&mut self, v: i32) -> io::Result<()> {
        self.out.write_all(&v.to_le_bytes())
    }

    fn raw_float(&mut self, v: f64) -> io::Result<()> {
        self.out.write_all(&v.to_le_bytes())
    }

    fn raw_str(&mut self, s: &str) -> io::Result<()> {
        let len = u32::try_from(s.len()).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string too long"))?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(s.as_bytes())
    }

    fn count(&mut self, n: usize) -> io::Result<()> {
        let n = i32::try_from(n).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "collection too large"))?;
        self.raw_int(n)
    }

    fn sys_int(&mut self, v: i32) -> io::Result<()> {
        self.tag(Tag::SysInt)?;
        self.raw_int(v)
    }

    fn sys_str(&mut self, s: &str) -> io::Result<()> {
        self.tag(Tag::SysStr)?;
        self.raw_str(s)
    }

    fn event(&mut self, event: EventKind) -> io::Result<()> {
        self.tag(Tag::EventCode)?;
        self.raw_int(event.ordinal())
    }

    fn subst(&mut self, id: i32) -> io::Result<()> {
        self.tag(Tag::Subst)?;
        self.raw_int(id)
    }

    fn obj_array(&mut self, values: &[Value]) -> io::Result<()> {
        self.tag(Tag::ObjArray)?;
        self.count(values.len())?;
        values.iter().try_for_each(|v| self.value(v))
    }

    fn value(&mut self, value: &Value) -> io::Result<()> {
        match value {
            Value::Undef => self.tag(Tag::Null),
            Value::Bool(b) => {
                self.tag(Tag::SysBool)?;
                self.out.write_all(&[u8::from(*b)])
            }
            Value::Integer(i) => {
                self.tag(Tag::LslInt)?;
                self.raw_int(*i)
            }
            Value::Float(f) => {
                self.tag(Tag::LslFloat)?;
                self.raw_float(*f)
            }
            Value::String(s) => {
                self.tag(Tag::LslStr)?;
                self.raw_str(s)
            }
            Value::Key(k) => {
                self.tag(Tag::LslKey)?;
                self.raw_str(k)
            }
            Value::List(items) => {
                self.tag(Tag::LslList)?;
                self.count(items.len())?;
                items.iter().try_for_each(|v| self.value(v))
            }
            Value::Vector(v) => {
                self.tag(Tag::LslVec)?;
                v.iter().try_for_each(|f| self.raw_float(*f))
            }
            Value::Rotation(r) => {
                self.tag(Tag::LslRot)?;
                r.iter().try_for_each(|f| self.raw_float(*f))
            }
            Value::Array(array) => {
                self.tag(Tag::XmrArray)?;
                self.count(array.len())?;
                for (key, v) in array.iter() {
                    self.value(&key)?;
                    self.value(v)?;
                }
                Ok(())
            }
        }
    }

    fn frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.subst(match frame.receiver {
            Receiver::Script => SUBST_SCRIPT,
            Receiver::Api => SUBST_BEAPI,
        })?;
        self.sys_int(i32::from(frame.function))?;
        self.count(frame.pc)?;
        self.obj_array(&frame.locals)?;
        self.obj_array(&frame.operands)
    }
}

fn identity(module: &CompiledModule) -> String {
    format!("{} v{} {:016x}", module.name, module.version, module.fingerprint)
}

/// Serialize `snapshot` of an instance of `module`.
pub fn write_snapshot<W: Write>(module: &CompiledModule, snapshot: &Snapshot, out: W) -> Result<(), MigrationFault> {
    let mut w = StreamWriter { out };
    w.out.write_all(&[MIGRATION_VERSION])?;
    w.sys_str(&module.name)?;
    w.sys_int(i32::try_from(module.version).unwrap_or(i32::MAX))?;
    w.sys_str(&format!("{:016x}", module.fingerprint))?;

    w.sys_int(snapshot.state)?;
    w.event(snapshot.event)?;
    w.sys_int(snapshot.mem_usage)?;
    w.sys_int(snapshot.mem_limit)?;
    w.obj_array(&snapshot.event_args)?;
    w.obj_array(&snapshot.globals)?;

    if let Some(active) = &snapshot.active {
        w.sys_int(active.pending_state.map_or(-1, i32::from))?;
        w.sys_int(active.phase.code())?;
        w.count(active.frames.len())?;
        for frame in &active.frames {
            w.frame(frame)?;
        }
    }
    w.out.flush()?;
    debug!(
        module = %module.name,
        frames = snapshot.active.as_ref().map_or(0, |a| a.frames.len()),
        "wrote migration stream"
    );
    Ok(())
}

// ── Reading ──────────────────────────────────────────────────────

struct StreamReader<R: Read> {
    input: R,
}

impl<R: Read> StreamReader<R> {
    fn byte(&mut self) -> Result<u8, MigrationFault> {
        let mut b = [0u8; 1];
        self.input.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn tag(&mut self) -> Result<(u8, Option<Tag>), MigrationFault> {
        let b = self.byte()?;
        Ok((b, Tag::from_byte(b)))
    }

    fn expect(&mut self, tag: Tag, expected: &'static str) -> Result<(), MigrationFault> {
        let (found, parsed) = self.tag()?;
        if parsed == Some(tag) {
            Ok(())
        } else {
            Err(MigrationFault::BadTag { found, expected })
        }
    }

    fn raw_int(&mut self) -> Result<i32, MigrationFault> {
        let mut b = [0u8; 4];
        self.input.read_exact(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    fn raw_float(&mut self) -> Result<f64, MigrationFault> {
        let mut b = [0u8; 8];
        self.input.read_exact(&mut b)?;
        Ok(f64::from_le_bytes(b))
    }

    fn raw_str(&mut self) -> Result<String, MigrationFault> {
        let mut b = [0u8; 4];
        self.input.read_exact(&mut b)?;
        let len = u64::from(u32::from_le_bytes(b));
        let mut bytes = Vec::new();
        (&mut self.input).take(len).read_to_end(&mut bytes)?;
        if u64::try_from(bytes.len()).unwrap_or(u64::MAX) != len {
            return Err(MigrationFault::Truncated);
        }
        String::from_utf8(bytes).map_err(|_| MigrationFault::Corrupt("string is not UTF-8".into()))
    }

    fn count(&mut self) -> Result<usize, MigrationFault> {
        let n = self.raw_int()?;
        usize::try_from(n).map_err(|_| MigrationFault::Corrupt(format!("negative count {n}")))
    }

    fn sys_int(&mut self) -> Result<i32, MigrationFault> {
        self.expect(Tag::SysInt, "SYSINT")?;
        self.raw_int()
    }

    fn sys_str(&mut self) -> Result<String, MigrationFault> {
        self.expect(Tag::SysStr, "SYSSTR")?;
        self.raw_str()
    }

    fn event(&mut self) -> Result<EventKind, MigrationFault> {
        self.expect(Tag::EventCode, "EVENTCODE")?;
        let ordinal = self.raw_int()?;
        EventKind::from_ordinal(ordinal).ok_or_else(|| MigrationFault::Corrupt(format!("unknown event code {ordinal}")))
    }

    fn subst(&mut self) -> Result<i32, MigrationFault> {
        self.expect(Tag::Subst, "SUBST")?;
        self.raw_int()
    }

    fn obj_array(&mut self) -> Result<Vec<Value>, MigrationFault> {
        self.expect(Tag::ObjArray, "OBJARRAY")?;
        let n = self.count()?;
        let mut values = Vec::with_capacity(n.min(256));
        for _ in 0..n {
            values.push(self.value()?);
        }
        Ok(values)
    }

    fn value(&mut self) -> Result<Value, MigrationFault> {
        let (found, tag) = self.tag()?;
        Ok(match tag {
            Some(Tag::Null) => Value::Undef,
            Some(Tag::SysBool) => Value::Bool(self.byte()? != 0),
            Some(Tag::LslInt | Tag::SysInt) => Value::Integer(self.raw_int()?),
            Some(Tag::LslFloat | Tag::SysDoub) => Value::Float(self.raw_float()?),
            Some(Tag::SysFloat) => {
                let mut b = [0u8; 4];
                self.input.read_exact(&mut b)?;
                Value::Float(f64::from(f32::from_le_bytes(b)))
            }
            Some(Tag::LslStr | Tag::SysStr) => Value::String(self.raw_str()?),
            Some(Tag::LslKey) => Value::Key(self.raw_str()?),
            Some(Tag::LslList) => {
                let n = self.count()?;
                let mut items = Vec::with_capacity(n.min(256));
                for _ in 0..n {
                    items.push(self.value()?);
                }
                Value::List(items)
            }
            Some(Tag::LslVec) => Value::Vector([self.raw_float()?, self.raw_float()?, self.raw_float()?]),
            Some(Tag::LslRot) => Value::Rotation([
                self.raw_float()?,
                self.raw_float()?,
                self.raw_float()?,
                self.raw_float()?,
            ]),
            Some(Tag::XmrArray) => {
                let n = self.count()?;
                let mut array = ScriptArray::default();
                for _ in 0..n {
                    let key = self.value()?;
                    let value = self.value()?;
                    array
                        .set(&key, value)
                        .map_err(|e| MigrationFault::Corrupt(format!("array entry: {e}")))?;
                }
                Value::Array(array)
            }
            Some(Tag::EventCode | Tag::ObjArray | Tag::Subst) | None => {
                return Err(MigrationFault::BadTag {
                    found,
                    expected: "a value",
                })
            }
        })
    }

    fn frame(&mut self, module: &CompiledModule, index: usize, last: bool) -> Result<Frame, MigrationFault> {
        let bad = |message: String| MigrationFault::BadFrame { index, message };
        let receiver = match self.subst()? {
            SUBST_SCRIPT => Receiver::Script,
            SUBST_BEAPI => Receiver::Api,
            other => return Err(bad(format!("unknown receiver {other}"))),
        };
        let function = self.sys_int()?;
        let function = u16::try_from(function).map_err(|_| bad(format!("function {function} out of range")))?;
        let pc = self.count()?;
        let locals = self.obj_array()?;
        let operands = self.obj_array()?;

        match receiver {
            Receiver::Script => {
                let func = module
                    .functions
                    .get(usize::from(function))
                    .ok_or_else(|| bad(format!("function {function} out of range")))?;
                if pc > func.ops.len() {
                    return Err(bad(format!("pc {pc} past end of {}", func.name)));
                }
                if locals.len() != usize::from(func.local_count) {
                    return Err(bad(format!(
                        "{} has {} locals, stream has {}",
                        func.name,
                        func.local_count,
                        locals.len()
                    )));
                }
            }
            Receiver::Api => {
                let api = API_FUNCTIONS
                    .get(usize::from(function))
                    .ok_or_else(|| bad(format!("API function {function} out of range")))?;
                if !last || index == 0 {
                    return Err(bad(format!("{} call must be the innermost frame", api.name)));
                }
                if locals.len() != api.params.len() || pc != 0 || !operands.is_empty() {
                    return Err(bad(format!("malformed {} call", api.name)));
                }
            }
        }
        Ok(Frame {
            receiver,
            function,
            pc,
            locals,
            operands,
        })
    }
}

fn state_index(module: &CompiledModule, raw: i32, what: &str) -> Result<u16, MigrationFault> {
    u16::try_from(raw)
        .ok()
        .filter(|&s| usize::from(s) < module.states.len())
        .ok_or_else(|| MigrationFault::Corrupt(format!("{what} {raw} out of range")))
}

fn check_globals(module: &CompiledModule, globals: &[Value]) -> Result<(), MigrationFault> {
    if globals.len() != module.globals.len() {
        return Err(MigrationFault::Corrupt(format!(
            "module has {} globals, stream has {}",
            module.globals.len(),
            globals.len()
        )));
    }
    for (slot, value) in module.globals.iter().zip(globals) {
        if slot.ty != Type::Object && value.ty() != slot.ty {
            return Err(MigrationFault::Corrupt(format!(
                "global {} should be {}, stream has {}",
                slot.name,
                slot.ty,
                value.ty()
            )));
        }
    }
    Ok(())
}

/// Read a stream written by [`write_snapshot`] for the same module.
pub fn read_snapshot<R: Read>(module: &CompiledModule, input: R) -> Result<Snapshot, MigrationFault> {
    let mut r = StreamReader { input };
    let version = r.byte()?;
    if version != MIGRATION_VERSION {
        return Err(MigrationFault::Version(version));
    }
    let name = r.sys_str()?;
    let module_version = r.sys_int()?;
    let fingerprint = r.sys_str()?;
    let found = format!("{name} v{module_version} {fingerprint}");
    if found != identity(module) {
        return Err(MigrationFault::ModuleMismatch {
            expected: identity(module),
            found,
        });
    }

    let state = r.sys_int()?;
    state_index(module, state, "state")?;
    let event = r.event()?;
    if event == EventKind::Garbage {
        return Err(MigrationFault::Corrupt("stream was taken from a disposed instance".into()));
    }
    let mem_usage = r.sys_int()?;
    let mem_limit = r.sys_int()?;
    let event_args = r.obj_array()?;
    let globals = r.obj_array()?;
    check_globals(module, &globals)?;

    let active = if event == EventKind::None {
        None
    } else {
        let pending = r.sys_int()?;
        let pending_state = match pending {
            -1 => None,
            n => Some(state_index(module, n, "pending state")?),
        };
        let phase = match r.sys_int()? {
            -1 => Phase::Handler,
            -2 => Phase::Entering,
            n => Phase::Exiting(state_index(module, n, "transition target")?),
        };
        let count = r.count()?;
        let mut frames = Vec::with_capacity(count.min(256));
        for index in 0..count {
            frames.push(r.frame(module, index, index + 1 == count)?);
        }
        if frames.is_empty() {
            return Err(MigrationFault::Corrupt(format!("{} handler has no frames", event.name())));
        }
        Some(ActiveHandler {
            pending_state,
            phase,
            frames,
        })
    };

    let mut trailing = [0u8; 1];
    if r.input.read(&mut trailing)? != 0 {
        return Err(MigrationFault::Corrupt("trailing bytes after stream".into()));
    }
    debug!(module = %module.name, state, event = event.name(), "read migration stream");
    Ok(Snapshot {
        state,
        event,
        mem_usage,
        mem_limit,
        event_args,
        globals,
        active,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lsl::compile;

    fn module() -> CompiledModule {
        compile("integer n = 3;\nstring s = \"hi\";\ndefault { state_entry() { n++; } }").unwrap()
    }

    fn idle_snapshot() -> Snapshot {
        Snapshot {
            state: 0,
            event: EventKind::None,
            mem_usage: 48,
            mem_limit: 100_000,
            event_args: vec![],
            globals: vec![Value::Integer(3), Value::String("hi".into())],
            active: None,
        }
    }

    fn bytes_of(module: &CompiledModule, snapshot: &Snapshot) -> Vec<u8> {
        let mut out = Vec::new();
        write_snapshot(module, snapshot, &mut out).unwrap();
        out
    }

    #[test]
    fn stream_starts_with_version_and_identity() {
        let module = module();
        let bytes = bytes_of(&module, &idle_snapshot());
        assert_eq!(bytes[0], MIGRATION_VERSION);
        assert_eq!(bytes[1], Tag::SysStr as u8);
        assert_eq!(&bytes[2..6], &6u32.to_le_bytes());
        assert_eq!(&bytes[6..12], b"script");
        assert_eq!(bytes[12], Tag::SysInt as u8);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let module = module();
        let mut bytes = bytes_of(&module, &idle_snapshot());
        bytes[0] = 2;
        let err = read_snapshot(&module, bytes.as_slice()).unwrap_err();
        assert_eq!(err.to_string(), "incoming migration version 2 but accept only 1");
    }

    #[test]
    fn other_module_is_rejected() {
        let module = module();
        let bytes = bytes_of(&module, &idle_snapshot());
        let other = compile("integer n = 3;\nstring s = \"hi\";\ndefault { touch(integer t) { } }").unwrap();
        assert!(matches!(
            read_snapshot(&other, bytes.as_slice()),
            Err(MigrationFault::ModuleMismatch { .. })
        ));
    }

    #[test]
    fn truncated_stream_is_detected() {
        let module = module();
        let bytes = bytes_of(&module, &idle_snapshot());
        for cut in [1, 9, bytes.len() - 1] {
            assert!(
                matches!(read_snapshot(&module, &bytes[..cut]), Err(MigrationFault::Truncated)),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn values_keep_their_types() {
        let module = compile(
            "XMROption arrays;\n\
             list l; vector v; rotation r; key k; float f; array a;\n\
             default { state_entry() { } }",
        )
        .unwrap();
        let mut array = ScriptArray::default();
        array.set(&Value::String("b".into()), Value::Integer(2)).unwrap();
        array.set(&Value::Integer(1), Value::Vector([1.0, 2.0, 3.0])).unwrap();
        let snapshot = Snapshot {
            globals: vec![
                Value::List(vec![Value::Integer(1), Value::Key("k".into()), Value::Float(0.1)]),
                Value::Vector([0.5, -1.0, 2.0]),
                Value::Rotation([0.0, 0.0, 0.0, 1.0]),
                Value::Key("6ba7b810-9dad-11d1-80b4-00c04fd430c8".into()),
                Value::Float(f64::MIN_POSITIVE),
                Value::Array(array),
            ],
            ..idle_snapshot()
        };
        let bytes = bytes_of(&module, &snapshot);
        assert_eq!(read_snapshot(&module, bytes.as_slice()).unwrap(), snapshot);
    }

    #[test]
    fn frames_are_validated() {
        let module = module();
        let handler = module.handler(0, EventKind::StateEntry).unwrap();
        let good = Frame {
            receiver: Receiver::Script,
            function: handler,
            pc: 1,
            locals: vec![Value::Undef; usize::from(module.functions[usize::from(handler)].local_count)],
            operands: vec![],
        };
        let snapshot = Snapshot {
            event: EventKind::StateEntry,
            active: Some(ActiveHandler {
                pending_state: None,
                phase: Phase::Handler,
                frames: vec![good.clone()],
            }),
            ..idle_snapshot()
        };
        let bytes = bytes_of(&module, &snapshot);
        assert_eq!(read_snapshot(&module, bytes.as_slice()).unwrap(), snapshot);

        let mut bad = snapshot.clone();
        bad.active.as_mut().unwrap().frames[0].pc = 10_000;
        let bytes = bytes_of(&module, &bad);
        assert!(matches!(
            read_snapshot(&module, bytes.as_slice()),
            Err(MigrationFault::BadFrame { index: 0, .. })
        ));

        let mut api_first = snapshot;
        api_first.active.as_mut().unwrap().frames[0] = Frame {
            receiver: Receiver::Api,
            function: 0,
            pc: 0,
            locals: vec![],
            operands: vec![],
        };
        let bytes = bytes_of(&module, &api_first);
        assert!(matches!(
            read_snapshot(&module, bytes.as_slice()),
            Err(MigrationFault::BadFrame { .. })
        ));
    }

    #[test]
    fn global_types_must_match() {
        let module = module();
        let snapshot = Snapshot {
            globals: vec![Value::String("3".into()), Value::String("hi".into())],
            ..idle_snapshot()
        };
        let bytes = bytes_of(&module, &snapshot);
        assert!(matches!(read_snapshot(&module, bytes.as_slice()), Err(MigrationFault::Corrupt(_))));
    }
}
