//! Bytecode interpreter with explicit, serializable call frames.
//!
//! The whole call stack lives in [`Machine::frames`], so a suspended handler
//! is plain data: it can be resumed later or written to a migration stream.

use tracing::{debug, trace};

use super::arith;
use super::error::{ControlSignal, LocatedFault, RuntimeFault, SourceLocation};
use super::host::{HostApi, HostInterrupt};
use super::value::Value;
use crate::lsl::api::API_FUNCTIONS;
use crate::lsl::module::{CompiledModule, Component, Constant, Op, VarRef};
use crate::lsl::types::Type;

/// Whose code a frame is running. Written through the migration
/// substitution table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receiver {
    /// A compiled script function.
    Script,
    /// A backend API call waiting to be resumed.
    Api,
}

/// One activation record.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub receiver: Receiver,
    /// Function index, or API table index for [`Receiver::Api`].
    pub function: u16,
    pub pc: usize,
    pub locals: Vec<Value>,
    pub operands: Vec<Value>,
}

impl Frame {
    fn pop(&mut self) -> Result<Value, RuntimeFault> {
        self.operands
            .pop()
            .ok_or_else(|| RuntimeFault::CorruptBytecode("operand stack underflow".into()))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeFault> {
        let at = self
            .operands
            .len()
            .checked_sub(n)
            .ok_or_else(|| RuntimeFault::CorruptBytecode("operand stack underflow".into()))?;
        Ok(self.operands.split_off(at))
    }

    fn push(&mut self, value: Value) {
        self.operands.push(value);
    }

    fn local(&mut self, slot: u16) -> Result<&mut Value, RuntimeFault> {
        self.locals
            .get_mut(usize::from(slot))
            .ok_or_else(|| RuntimeFault::CorruptBytecode(format!("local {slot} out of range")))
    }
}

/// How a run of the interpreter ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecExit {
    /// The outermost frame returned.
    Completed(Value),
    /// Stopped at a checkpoint; the frames are intact.
    Suspended,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecError {
    Fault(LocatedFault),
    Signal(ControlSignal),
}

impl From<RuntimeFault> for ExecError {
    fn from(fault: RuntimeFault) -> Self {
        Self::Fault(fault.into())
    }
}

/// Mutable execution state of one script instance.
#[derive(Debug, Clone, Default)]
pub struct Machine {
    pub globals: Vec<Value>,
    pub frames: Vec<Frame>,
    pub mem_usage: i32,
    pub mem_limit: i32,
    /// Set by `state X`; consumed when the handler finishes.
    pub pending_state: Option<u16>,
    pub max_call_depth: usize,
}

impl Machine {
    pub fn new(module: &CompiledModule, mem_limit: i32, max_call_depth: usize) -> Self {
        Self {
            globals: module.globals.iter().map(|g| Value::default_for(g.ty)).collect(),
            frames: Vec::new(),
            mem_usage: 0,
            mem_limit,
            pending_state: None,
            max_call_depth,
        }
    }

    /// Run the global initializer from scratch.
    pub fn initialize(&mut self, module: &CompiledModule, host: &mut dyn HostApi) -> Result<(), ExecError> {
        self.globals = module.globals.iter().map(|g| Value::default_for(g.ty)).collect();
        self.frames.clear();
        self.pending_state = None;
        self.mem_usage = 0;
        self.enter(module, module.init, Vec::new())?;
        match self.run(module, host, &|| false)? {
            ExecExit::Completed(_) => Ok(()),
            ExecExit::Suspended => Err(RuntimeFault::CorruptBytecode("initializer suspended".into()).into()),
        }
    }

    /// Memory charged for the globals alone, as when no handler is active.
    pub fn baseline_memory(&self, module: &CompiledModule) -> i32 {
        module
            .globals
            .iter()
            .zip(&self.globals)
            .fold(0i32, |acc, (slot, value)| {
                acc.saturating_add(slot.ty.static_size()).saturating_add(value.dyn_size())
            })
    }

    /// Push a frame for function `index` with `args` bound to its parameters.
    pub fn enter(&mut self, module: &CompiledModule, index: u16, args: Vec<Value>) -> Result<(), RuntimeFault> {
        let func = module
            .functions
            .get(usize::from(index))
            .ok_or_else(|| RuntimeFault::CorruptBytecode(format!("function {index} out of range")))?;
        if self.frames.len() >= self.max_call_depth {
            return Err(RuntimeFault::CallDepth(self.max_call_depth));
        }
        let mut locals = args;
        locals.resize(usize::from(func.local_count), Value::Undef);
        self.frames.push(Frame {
            receiver: Receiver::Script,
            function: index,
            pc: 0,
            locals,
            operands: Vec::new(),
        });
        Ok(())
    }

    /// Execute until the outermost frame returns or a checkpoint suspends.
    pub fn run(
        &mut self,
        module: &CompiledModule,
        host: &mut dyn HostApi,
        should_suspend: &dyn Fn() -> bool,
    ) -> Result<ExecExit, ExecError> {
        loop {
            match self.step(module, host, should_suspend) {
                Ok(None) => {}
                Ok(Some(exit)) => return Ok(exit),
                Err(ExecError::Fault(mut fault)) => {
                    if fault.location.is_none() {
                        fault.location = self.location(module);
                    }
                    return Err(ExecError::Fault(fault));
                }
                Err(signal) => return Err(signal),
            }
        }
    }

    /// Source position of the instruction the top frame last executed.
    fn location(&self, module: &CompiledModule) -> Option<SourceLocation> {
        let frame = self.frames.last()?;
        match frame.receiver {
            Receiver::Script => {
                let func = module.functions.get(usize::from(frame.function))?;
                let (line, column) = func.position(frame.pc.saturating_sub(1)).unwrap_or((0, 0));
                Some(SourceLocation {
                    function: func.name.clone(),
                    line,
                    column,
                })
            }
            Receiver::Api => Some(SourceLocation {
                function: API_FUNCTIONS.get(usize::from(frame.function))?.name.to_string(),
                line: 0,
                column: 0,
            }),
        }
    }

    fn var(&mut self, var: VarRef) -> Result<&mut Value, RuntimeFault> {
        match var {
            VarRef::Local(slot) => self
                .frames
                .last_mut()
                .ok_or_else(|| RuntimeFault::CorruptBytecode("no active frame".into()))?
                .local(slot),
            VarRef::Global(idx) => self
                .globals
                .get_mut(usize::from(idx))
                .ok_or_else(|| RuntimeFault::CorruptBytecode(format!("global {idx} out of range"))),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn step(
        &mut self,
        module: &CompiledModule,
        host: &mut dyn HostApi,
        should_suspend: &dyn Fn() -> bool,
    ) -> Result<Option<ExecExit>, ExecError> {
        let Some(frame) = self.frames.last_mut() else {
            return Ok(Some(ExecExit::Completed(Value::Undef)));
        };
        if frame.receiver == Receiver::Api {
            return self.resume_api_call(host);
        }
        let func = module
            .functions
            .get(usize::from(frame.function))
            .ok_or_else(|| RuntimeFault::CorruptBytecode(format!("function {} out of range", frame.function)))?;
        let op = *func
            .ops
            .get(frame.pc)
            .ok_or_else(|| RuntimeFault::CorruptBytecode(format!("{}: pc {} past end", func.name, frame.pc)))?;
        frame.pc += 1;
        trace!(function = %func.name, pc = frame.pc - 1, ?op);

        match op {
            Op::PushConst(i) => {
                let c = module
                    .constants
                    .get(usize::from(i))
                    .ok_or_else(|| RuntimeFault::CorruptBytecode(format!("constant {i} out of range")))?;
                frame.push(constant_value(c));
            }
            Op::PushDefault(ty) => frame.push(Value::default_for(ty)),
            Op::PushUndef => frame.push(Value::Undef),
            Op::Pop => {
                frame.pop()?;
            }
            Op::Dup => {
                let top = frame
                    .operands
                    .last()
                    .cloned()
                    .ok_or_else(|| RuntimeFault::CorruptBytecode("operand stack underflow".into()))?;
                frame.push(top);
            }

            Op::LoadLocal(slot) => {
                let value = frame.local(slot)?.clone();
                frame.push(value);
            }
            Op::StoreLocal(slot) => {
                let value = frame.pop()?;
                *frame.local(slot)? = value;
            }
            Op::LoadGlobal(idx) => {
                let value = self
                    .globals
                    .get(usize::from(idx))
                    .cloned()
                    .ok_or_else(|| RuntimeFault::CorruptBytecode(format!("global {idx} out of range")))?;
                frame.push(value);
            }
            Op::StoreGlobal(idx) => {
                let value = frame.pop()?;
                let slot = self
                    .globals
                    .get_mut(usize::from(idx))
                    .ok_or_else(|| RuntimeFault::CorruptBytecode(format!("global {idx} out of range")))?;
                *slot = value;
            }

            Op::Cast(ty) => {
                let value = frame.pop()?;
                frame.push(value.cast_to(ty)?);
            }
            Op::CastSecond(ty) => {
                let top = frame.pop()?;
                let second = frame.pop()?;
                frame.push(second.cast_to(ty)?);
                frame.push(top);
            }
            Op::Binary(eval) => {
                let left = frame.pop()?;
                let right = frame.pop()?;
                frame.push(arith::binary(eval, left, right)?);
            }
            Op::Neg => {
                let value = frame.pop()?;
                frame.push(arith::negate(value)?);
            }
            Op::BitNot => {
                let value = frame.pop()?;
                frame.push(Value::Integer(!value.as_int()));
            }
            Op::Not => {
                let value = frame.pop()?;
                frame.push(Value::Bool(!value.truthy()));
            }
            Op::IsType(ty) => {
                let value = frame.pop()?;
                let is = !matches!(value, Value::Undef) && value.ty() == ty;
                frame.push(Value::Bool(is));
            }

            Op::MakeList(n) => {
                let items = frame.pop_n(usize::from(n))?;
                frame.push(Value::List(items));
            }
            Op::MakeVector => {
                let parts = frame.pop_n(3)?;
                let mut v = [0.0; 3];
                for (slot, part) in v.iter_mut().zip(&parts) {
                    *slot = part.as_float();
                }
                frame.push(Value::Vector(v));
            }
            Op::MakeRotation => {
                let parts = frame.pop_n(4)?;
                let mut r = [0.0; 4];
                for (slot, part) in r.iter_mut().zip(&parts) {
                    *slot = part.as_float();
                }
                frame.push(Value::Rotation(r));
            }
            Op::GetField(c) => {
                let value = frame.pop()?;
                frame.push(Value::Float(component(&value, c)?));
            }
            Op::SetField(c) => {
                let f = frame.pop()?.as_float();
                let mut value = frame.pop()?;
                set_component(&mut value, c, f)?;
                frame.push(value);
            }

            Op::ArrayGet => {
                let key = frame.pop()?;
                let array = frame.pop()?;
                frame.push(as_array(&array)?.get(&key)?);
            }
            Op::ArraySet(var) => {
                let value = frame.pop()?;
                let key = frame.pop()?;
                frame.push(value.clone());
                match self.var(var)? {
                    Value::Array(array) => array.set(&key, value)?,
                    other => {
                        return Err(RuntimeFault::BadCast {
                            from: other.ty().to_string(),
                            to: Type::Array,
                        }
                        .into())
                    }
                }
            }
            Op::ArrayCount => {
                let array = frame.pop()?;
                let n = as_array(&array)?.len();
                frame.push(Value::Integer(i32::try_from(n).unwrap_or(i32::MAX)));
            }
            Op::ArrayKey => {
                let n = frame.pop()?.as_int();
                let array = frame.pop()?;
                frame.push(as_array(&array)?.key_at(n));
            }
            Op::ArrayValue => {
                let n = frame.pop()?.as_int();
                let array = frame.pop()?;
                frame.push(as_array(&array)?.value_at(n));
            }

            Op::Jump(target) => frame.pc = jump_target(target),
            Op::JumpIfFalse(target) => {
                if !frame.pop()?.truthy() {
                    frame.pc = jump_target(target);
                }
            }
            Op::JumpIfTrue(target) => {
                if frame.pop()?.truthy() {
                    frame.pc = jump_target(target);
                }
            }
            Op::JumpIfNoStateChange(target) => {
                if self.pending_state.is_none() {
                    frame.pc = jump_target(target);
                }
            }
            Op::Call(index) => {
                let callee = module
                    .functions
                    .get(usize::from(index))
                    .ok_or_else(|| RuntimeFault::CorruptBytecode(format!("function {index} out of range")))?;
                let args = frame.pop_n(callee.params.len())?;
                self.enter(module, index, args)?;
            }
            Op::CallApi(index) => {
                let api = API_FUNCTIONS
                    .get(usize::from(index))
                    .ok_or_else(|| RuntimeFault::CorruptBytecode(format!("API function {index} out of range")))?;
                let args = frame.pop_n(api.params.len())?;
                match host.call(api, &args) {
                    Ok(value) => {
                        if api.ret != Type::Void {
                            frame.push(value);
                        }
                    }
                    Err(interrupt) => return self.host_interrupt(interrupt, index, args, api.name),
                }
            }
            Op::Return => {
                let ret = func.ret;
                let mut done = self
                    .frames
                    .pop()
                    .ok_or_else(|| RuntimeFault::CorruptBytecode("return without frame".into()))?;
                let value = if ret == Type::Void { Value::Undef } else { done.pop()? };
                match self.frames.last_mut() {
                    Some(caller) => {
                        if ret != Type::Void {
                            caller.push(value);
                        }
                    }
                    None => return Ok(Some(ExecExit::Completed(value))),
                }
            }

            Op::MemStatic(n) => self.mem_usage = self.mem_usage.saturating_add(n),
            Op::MemIncr(var) => {
                let size = self.var(var)?.dyn_size();
                self.mem_usage = self.mem_usage.saturating_add(size);
            }
            Op::MemDecr(var) => {
                let size = self.var(var)?.dyn_size();
                self.mem_usage = self.mem_usage.saturating_sub(size);
            }

            Op::CheckRun => {
                if self.mem_usage > self.mem_limit {
                    return Err(RuntimeFault::MemoryLimit {
                        usage: self.mem_usage,
                        limit: self.mem_limit,
                    }
                    .into());
                }
                if should_suspend() {
                    debug!(depth = self.frames.len(), "suspending at checkpoint");
                    return Ok(Some(ExecExit::Suspended));
                }
            }
            Op::SetState(s) => self.pending_state = Some(s),
        }
        Ok(None)
    }

    fn host_interrupt(
        &mut self,
        interrupt: HostInterrupt,
        index: u16,
        args: Vec<Value>,
        name: &str,
    ) -> Result<Option<ExecExit>, ExecError> {
        match interrupt {
            HostInterrupt::Failed(message) => Err(RuntimeFault::Host {
                function: name.to_string(),
                message,
            }
            .into()),
            HostInterrupt::Signal(signal) => {
                debug!(?signal, "{name} raised a control signal");
                Err(ExecError::Signal(signal))
            }
            HostInterrupt::Suspend => {
                debug!("{name} suspended the script");
                self.frames.push(Frame {
                    receiver: Receiver::Api,
                    function: index,
                    pc: 0,
                    locals: args,
                    operands: Vec::new(),
                });
                Ok(Some(ExecExit::Suspended))
            }
        }
    }

    /// Retry the backend call held by the top frame.
    fn resume_api_call(&mut self, host: &mut dyn HostApi) -> Result<Option<ExecExit>, ExecError> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| RuntimeFault::CorruptBytecode("no active frame".into()))?;
        let api = API_FUNCTIONS
            .get(usize::from(frame.function))
            .ok_or_else(|| RuntimeFault::CorruptBytecode(format!("API function {} out of range", frame.function)))?;
        match host.resume_call(api, &frame.locals) {
            Ok(value) => {
                let caller = self
                    .frames
                    .last_mut()
                    .ok_or_else(|| RuntimeFault::CorruptBytecode("API frame without caller".into()))?;
                if api.ret != Type::Void {
                    caller.push(value);
                }
                Ok(None)
            }
            Err(interrupt) => self.host_interrupt(interrupt, frame.function, frame.locals, api.name),
        }
    }
}

fn jump_target(target: u32) -> usize {
    usize::try_from(target).unwrap_or(usize::MAX)
}

pub fn constant_value(c: &Constant) -> Value {
    match c {
        Constant::Integer(i) => Value::Integer(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::String(s) => Value::String(s.clone()),
        Constant::Key(k) => Value::Key(k.clone()),
        Constant::Vector(v) => Value::Vector(*v),
        Constant::Rotation(r) => Value::Rotation(*r),
    }
}

fn as_array(value: &Value) -> Result<&super::value::ScriptArray, RuntimeFault> {
    match value {
        Value::Array(a) => Ok(a),
        other => Err(RuntimeFault::BadCast {
            from: other.ty().to_string(),
            to: Type::Array,
        }),
    }
}

fn component(value: &Value, c: Component) -> Result<f64, RuntimeFault> {
    match (value, c) {
        (Value::Vector([x, _, _]) | Value::Rotation([x, _, _, _]), Component::X) => Ok(*x),
        (Value::Vector([_, y, _]) | Value::Rotation([_, y, _, _]), Component::Y) => Ok(*y),
        (Value::Vector([_, _, z]) | Value::Rotation([_, _, z, _]), Component::Z) => Ok(*z),
        (Value::Rotation([_, _, _, s]), Component::S) => Ok(*s),
        _ => Err(RuntimeFault::CorruptBytecode(format!("no component {c:?} on {}", value.ty()))),
    }
}

fn set_component(value: &mut Value, c: Component, f: f64) -> Result<(), RuntimeFault> {
    let ty = value.ty();
    let slot = match (value, c) {
        (Value::Vector([x, _, _]) | Value::Rotation([x, _, _, _]), Component::X) => x,
        (Value::Vector([_, y, _]) | Value::Rotation([_, y, _, _]), Component::Y) => y,
        (Value::Vector([_, _, z]) | Value::Rotation([_, _, z, _]), Component::Z) => z,
        (Value::Rotation([_, _, _, s]), Component::S) => s,
        _ => return Err(RuntimeFault::CorruptBytecode(format!("no component {c:?} on {ty}"))),
    };
    *slot = f;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::lsl::compile;
    use crate::lsl::events::EventKind;
    use crate::runtime::host::RecordingHost;

    fn machine_for(module: &CompiledModule) -> Machine {
        let mut machine = Machine::new(module, 100_000, 64);
        machine.initialize(module, &mut RecordingHost::new()).unwrap();
        machine
    }

    /// Run the `default` handler for `event` to completion.
    fn run_handler(src: &str, event: EventKind, args: Vec<Value>) -> (Machine, RecordingHost, CompiledModule) {
        let module = compile(src).unwrap();
        let mut machine = machine_for(&module);
        let mut host = RecordingHost::new();
        let handler = module.handler(0, event).unwrap();
        machine.enter(&module, handler, args).unwrap();
        let exit = machine.run(&module, &mut host, &|| false).unwrap();
        assert_eq!(exit, ExecExit::Completed(Value::Undef));
        (machine, host, module)
    }

    fn said(host: &RecordingHost) -> Vec<String> {
        host.log
            .iter()
            .filter(|c| c.function == "llSay")
            .map(|c| c.args[1].as_str().to_string())
            .collect()
    }

    #[test]
    fn arithmetic_and_casts() {
        let (_, host, _) = run_handler(
            "default { state_entry() {\n\
               integer i = 7 / 2;\n\
               float f = i * 1.5;\n\
               llSay(0, (string)i + \" \" + (string)f);\n\
               llSay(0, (string)(<1, 2, 3> * 2));\n\
             } }",
            EventKind::StateEntry,
            vec![],
        );
        assert_eq!(said(&host), vec!["3 4.500000", "<2.00000, 4.00000, 6.00000>"]);
    }

    #[test]
    fn loops_and_functions() {
        let (_, host, _) = run_handler(
            "integer sq(integer n) { return n * n; }\n\
             default { state_entry() {\n\
               integer total;\n\
               integer i;\n\
               for (i = 1; i <= 3; i++) total += sq(i);\n\
               while (total > 10) total -= 5;\n\
               do { total++; } while (total < 12);\n\
               llSay(0, (string)total);\n\
             } }",
            EventKind::StateEntry,
            vec![],
        );
        assert_eq!(said(&host), vec!["12"]);
    }

    #[test]
    fn memory_returns_to_baseline_after_handler() {
        let (machine, _, module) = run_handler(
            "list x = [\"abc\"];\n\
             default { state_entry() {\n\
               x = [];\n\
               { string s = \"hello\"; list l = [s, s]; }\n\
             } }",
            EventKind::StateEntry,
            vec![],
        );
        assert_eq!(machine.mem_usage, 96);
        assert_eq!(machine.mem_usage, machine.baseline_memory(&module));
    }

    #[test]
    fn handler_arguments_are_accounted() {
        let (machine, _, module) = run_handler(
            "default { listen(integer c, string name, key id, string msg) { string copy = msg; } }",
            EventKind::Listen,
            vec![
                Value::Integer(1),
                Value::String("bob".into()),
                Value::Key(String::new()),
                Value::String("hi".into()),
            ],
        );
        assert_eq!(machine.mem_usage, machine.baseline_memory(&module));
    }

    #[test]
    fn jump_out_of_nested_blocks_keeps_accounting() {
        let (machine, host, module) = run_handler(
            "default { state_entry() {\n\
               integer n;\n\
               @again;\n\
               {\n\
                 string s = \"abc\";\n\
                 { list l = [s]; n++; if (n < 3) jump again; }\n\
               }\n\
               llSay(0, (string)n);\n\
             } }",
            EventKind::StateEntry,
            vec![],
        );
        assert_eq!(said(&host), vec!["3"]);
        assert_eq!(machine.mem_usage, machine.baseline_memory(&module));
    }

    #[test]
    fn division_by_zero_is_located() {
        let module = compile("default {\n state_entry() {\n  integer z;\n  integer x = 1 / z;\n }\n}").unwrap();
        let mut machine = machine_for(&module);
        let handler = module.handler(0, EventKind::StateEntry).unwrap();
        machine.enter(&module, handler, vec![]).unwrap();
        let Err(ExecError::Fault(fault)) = machine.run(&module, &mut RecordingHost::new(), &|| false) else {
            panic!("expected a fault");
        };
        assert_eq!(fault.fault, RuntimeFault::Math("division by zero"));
        let loc = fault.location.unwrap();
        assert_eq!(loc.function, "default state_entry");
        assert_eq!(loc.line, 4);
    }

    #[test]
    fn memory_limit_is_enforced_at_checkpoints() {
        let module = compile(
            "default { state_entry() { list l; while (TRUE) l += \"0123456789\"; } }",
        )
        .unwrap();
        let mut machine = Machine::new(&module, 2_000, 64);
        machine.initialize(&module, &mut RecordingHost::new()).unwrap();
        let handler = module.handler(0, EventKind::StateEntry).unwrap();
        machine.enter(&module, handler, vec![]).unwrap();
        let Err(ExecError::Fault(fault)) = machine.run(&module, &mut RecordingHost::new(), &|| false) else {
            panic!("expected a fault");
        };
        assert!(matches!(fault.fault, RuntimeFault::MemoryLimit { limit: 2_000, .. }));
    }

    #[test]
    fn recursion_depth_is_bounded() {
        let module = compile("f() { f(); }\ndefault { state_entry() { f(); } }").unwrap();
        let mut machine = Machine::new(&module, 1_000_000, 16);
        let handler = module.handler(0, EventKind::StateEntry).unwrap();
        machine.enter(&module, handler, vec![]).unwrap();
        let Err(ExecError::Fault(fault)) = machine.run(&module, &mut RecordingHost::new(), &|| false) else {
            panic!("expected a fault");
        };
        assert_eq!(fault.fault, RuntimeFault::CallDepth(16));
    }

    #[test]
    fn suspend_and_resume_at_loop_tops() {
        let module = compile(
            "default { state_entry() { integer i; while (i < 3) { llSay(0, (string)i); i++; } } }",
        )
        .unwrap();
        let mut machine = machine_for(&module);
        let mut host = RecordingHost::new();
        let handler = module.handler(0, EventKind::StateEntry).unwrap();
        machine.enter(&module, handler, vec![]).unwrap();
        let mut suspensions = 0;
        loop {
            match machine.run(&module, &mut host, &|| true).unwrap() {
                ExecExit::Suspended => suspensions += 1,
                ExecExit::Completed(_) => break,
            }
        }
        assert!(suspensions > 3);
        assert_eq!(said(&host), vec!["0", "1", "2"]);
    }

    #[test]
    fn state_change_in_function_unwinds_caller() {
        let (machine, host, _) = run_handler(
            "go() { state two; llSay(0, \"unreachable\"); }\n\
             default { state_entry() { go(); llSay(0, \"after\"); } }\n\
             state two { state_entry() { } }",
            EventKind::StateEntry,
            vec![],
        );
        assert_eq!(machine.pending_state, Some(1));
        assert!(said(&host).is_empty());
    }

    #[test]
    fn arrays_behave_like_ordered_maps() {
        let (_, host, _) = run_handler(
            "XMROption arrays;\n\
             default { state_entry() {\n\
               array a; object k; object v;\n\
               a[\"x\"] = 1; a[2] = \"two\"; a[\"x\"] = undef; a[3.5] = <1,2,3>;\n\
               llSay(0, (string)a.count);\n\
               foreach (k, v in a) llSay(0, (string)k + \"=\" + (string)v);\n\
             } }",
            EventKind::StateEntry,
            vec![],
        );
        assert_eq!(
            said(&host),
            vec!["2", "2=two", "3.500000=<1.00000, 2.00000, 3.00000>"]
        );
    }

    #[test]
    fn component_access() {
        let (_, host, _) = run_handler(
            "default { state_entry() { vector v = <1, 2, 3>; v.y = 5; v.z += 1; llSay(0, (string)(v.x + v.y + v.z)); } }",
            EventKind::StateEntry,
            vec![],
        );
        assert_eq!(said(&host), vec!["10.000000"]);
    }
}
