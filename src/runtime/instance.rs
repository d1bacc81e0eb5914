//! Script instances: event dispatch, state transitions, suspension and
//! migration around the bytecode executor.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::error::{ControlSignal, LocatedFault, RuntimeFault, SourceLocation};
use super::exec::{ExecError, ExecExit, Machine};
use super::host::{HostApi, NullHost};
use super::migration::{read_snapshot, write_snapshot, ActiveHandler, MigrationFault, Phase, Snapshot};
use super::value::Value;
use crate::lsl::events::EventKind;
use crate::lsl::module::CompiledModule;
use crate::lsl::types::Type;
use crate::settings::EngineSettings;

const DISPOSED_STATE: i32 = 12_345_678;
const DISPOSED_NUMBER: i32 = 69_696_969;
const DISPOSED_STRING: &str = "DISPOSED SCRIPT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Running,
    Suspended,
    /// Writing a migration stream.
    MigratingOut,
    Disposed,
}

impl Status {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::MigratingOut => "migrating out",
            Self::Disposed => "disposed",
        }
    }
}

type Sink = Box<dyn Write + Send>;

/// Requests that may be posted while a handler is running on another thread.
/// Only read at checkpoints.
#[derive(Clone, Default)]
pub struct Requests {
    suspend: Arc<AtomicBool>,
    migrate: Arc<AtomicBool>,
    sink: Arc<Mutex<Option<Sink>>>,
}

impl Requests {
    fn pending(&self) -> bool {
        self.suspend.load(Ordering::SeqCst) || self.migrate.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Requests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requests")
            .field("suspend", &self.suspend.load(Ordering::SeqCst))
            .field("migrate", &self.migrate.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// One running copy of a compiled script.
#[derive(Debug)]
pub struct ScriptInstance {
    module: Arc<CompiledModule>,
    machine: Machine,
    state: i32,
    event: EventKind,
    event_args: Vec<Value>,
    status: Status,
    phase: Phase,
    always_suspend: bool,
    requests: Requests,
}

impl ScriptInstance {
    /// Create an instance and run its global initializers. The instance
    /// starts idle in the default state; no `state_entry` runs yet.
    pub fn new(module: Arc<CompiledModule>, settings: &EngineSettings) -> Result<Self, LocatedFault> {
        let mut machine = Machine::new(&module, settings.memory_limit, settings.max_call_depth);
        machine.initialize(&module, &mut NullHost).map_err(into_fault)?;
        debug!(module = %module.name, mem = machine.mem_usage, "instance created");
        Ok(Self {
            module,
            machine,
            state: 0,
            event: EventKind::None,
            event_args: Vec::new(),
            status: Status::Idle,
            phase: Phase::Handler,
            always_suspend: settings.always_suspend,
            requests: Requests::default(),
        })
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn module(&self) -> &Arc<CompiledModule> {
        &self.module
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn state(&self) -> i32 {
        self.state
    }

    pub fn state_name(&self) -> Option<&str> {
        let idx = usize::try_from(self.state).ok()?;
        self.module.states.get(idx).map(String::as_str)
    }

    pub fn event(&self) -> EventKind {
        self.event
    }

    pub fn mem_usage(&self) -> i32 {
        self.machine.mem_usage
    }

    pub fn mem_limit(&self) -> i32 {
        self.machine.mem_limit
    }

    pub fn globals(&self) -> &[Value] {
        &self.machine.globals
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        let idx = self.module.globals.iter().position(|g| g.name == name)?;
        self.machine.globals.get(idx)
    }

    pub fn requests(&self) -> Requests {
        self.requests.clone()
    }

    // ── Events ───────────────────────────────────────────────────

    /// Deliver `event` to the current state's handler.
    pub fn start(
        &mut self,
        event: EventKind,
        args: Vec<Value>,
        host: &mut dyn HostApi,
    ) -> Result<Status, LocatedFault> {
        self.check_live("start")?;
        if event == EventKind::None {
            return Err(RuntimeFault::NoneEvent.into());
        }
        if self.status != Status::Idle || self.event != EventKind::None {
            return Err(RuntimeFault::HandlerActive.into());
        }
        if event.column().is_none() {
            return Err(RuntimeFault::UnknownEvent(event.name().to_string()).into());
        }
        check_event_args(event, &args)?;
        self.flush_requested_migration()?;

        self.phase = Phase::Handler;
        self.machine.pending_state = None;
        if !self.begin(event, args)? {
            debug!(event = event.name(), state = ?self.state_name(), "no handler, ignoring event");
            return Ok(self.status);
        }
        debug!(event = event.name(), state = ?self.state_name(), "dispatching event");
        self.execute(host)
    }

    /// Like [`ScriptInstance::start`], naming the event.
    pub fn start_named(
        &mut self,
        event: &str,
        args: Vec<Value>,
        host: &mut dyn HostApi,
    ) -> Result<Status, LocatedFault> {
        let kind = EventKind::from_name(event).ok_or_else(|| RuntimeFault::UnknownEvent(event.to_string()))?;
        self.start(kind, args, host)
    }

    /// Continue a suspended handler.
    pub fn resume(&mut self, host: &mut dyn HostApi) -> Result<Status, LocatedFault> {
        self.check_live("resume")?;
        if self.status != Status::Suspended {
            return Err(RuntimeFault::InvalidStatus {
                operation: "resume",
                status: self.status.name(),
            }
            .into());
        }
        debug!(event = self.event.name(), depth = self.machine.frames.len(), "resuming");
        self.status = Status::Running;
        self.execute(host)
    }

    /// Ask the running handler to suspend at its next checkpoint.
    pub fn request_suspend(&self) {
        self.requests.suspend.store(true, Ordering::SeqCst);
    }

    /// Enter the handler for `event` in the current state, if there is one.
    fn begin(&mut self, event: EventKind, args: Vec<Value>) -> Result<bool, RuntimeFault> {
        let state = usize::try_from(self.state).unwrap_or(usize::MAX);
        let Some(handler) = self.module.handler(state, event) else {
            return Ok(false);
        };
        self.event = event;
        self.event_args.clone_from(&args);
        self.machine.enter(&self.module, handler, args)?;
        self.status = Status::Running;
        Ok(true)
    }

    /// Drive the executor until the handler sequence finishes or suspends.
    fn execute(&mut self, host: &mut dyn HostApi) -> Result<Status, LocatedFault> {
        loop {
            let requests = &self.requests;
            let always = self.always_suspend;
            let outcome = self.machine.run(&self.module, host, &|| always || requests.pending());
            let result = match outcome {
                Ok(ExecExit::Suspended) => return self.suspended(),
                Ok(ExecExit::Completed(_)) => self.advance(),
                Err(ExecError::Signal(ControlSignal::Reset)) => self.reset(),
                Err(ExecError::Signal(ControlSignal::Terminate)) => {
                    info!(module = %self.module.name, "script terminated itself");
                    self.dispose();
                    return Ok(self.status);
                }
                Err(ExecError::Fault(fault)) => Err(fault),
            };
            match result {
                Ok(true) => {}
                Ok(false) => {
                    self.flush_requested_migration()?;
                    return Ok(self.status);
                }
                Err(fault) => {
                    warn!(event = self.event.name(), "handler aborted: {fault}");
                    self.abort();
                    if let Err(err) = self.flush_pending_migration() {
                        warn!(module = %self.module.name, "migration out failed: {err}");
                    }
                    return Err(fault);
                }
            }
        }
    }

    fn suspended(&mut self) -> Result<Status, LocatedFault> {
        self.status = Status::Suspended;
        self.requests.suspend.store(false, Ordering::SeqCst);
        debug!(event = self.event.name(), depth = self.machine.frames.len(), "suspended");
        self.flush_requested_migration()?;
        Ok(self.status)
    }

    /// Write a migration request posted while the handler held the instance.
    fn flush_requested_migration(&mut self) -> Result<(), LocatedFault> {
        self.flush_pending_migration()
            .map_err(|e| LocatedFault::from(RuntimeFault::Migration(e.to_string())))
    }

    /// A handler returned. Run whatever part of a state transition comes
    /// next; `true` means a new handler frame was entered.
    fn advance(&mut self) -> Result<bool, LocatedFault> {
        loop {
            match self.phase {
                Phase::Handler => match self.machine.pending_state.take() {
                    Some(next) if i32::from(next) != self.state => {
                        debug!(from = ?self.state_name(), to = next, "state transition");
                        self.phase = Phase::Exiting(next);
                        if self.begin(EventKind::StateExit, Vec::new())? {
                            return Ok(true);
                        }
                    }
                    _ => break,
                },
                Phase::Exiting(next) => {
                    if self.machine.pending_state.take().is_some() {
                        return Err(self.transition_fault("state_exit"));
                    }
                    self.state = i32::from(next);
                    self.phase = Phase::Entering;
                    if self.begin(EventKind::StateEntry, Vec::new())? {
                        return Ok(true);
                    }
                }
                Phase::Entering => {
                    if self.machine.pending_state.take().is_some() {
                        return Err(self.transition_fault("state_entry"));
                    }
                    break;
                }
            }
        }
        self.finish();
        Ok(false)
    }

    fn transition_fault(&self, handler: &'static str) -> LocatedFault {
        let state = self.state_name().unwrap_or("?");
        LocatedFault::at(
            RuntimeFault::NestedTransition(handler),
            SourceLocation {
                function: format!("{state} {handler}"),
                line: 0,
                column: 0,
            },
        )
    }

    fn finish(&mut self) {
        self.event = EventKind::None;
        self.event_args.clear();
        self.phase = Phase::Handler;
        self.status = Status::Idle;
    }

    /// Drop the active handler and return to idle with memory recomputed.
    fn abort(&mut self) {
        self.machine.frames.clear();
        self.machine.pending_state = None;
        self.machine.mem_usage = self.machine.baseline_memory(&self.module);
        self.finish();
    }

    /// Re-run global initializers and enter the default state.
    fn reset(&mut self) -> Result<bool, LocatedFault> {
        info!(module = %self.module.name, "script reset");
        self.machine.initialize(&self.module, &mut NullHost).map_err(into_fault)?;
        self.state = 0;
        self.finish();
        if self.begin(EventKind::StateEntry, Vec::new())? {
            return Ok(true);
        }
        self.finish();
        Ok(false)
    }

    // ── Disposal ─────────────────────────────────────────────────

    /// Tear the instance down. Every later operation faults.
    pub fn dispose(&mut self) {
        self.machine.frames.clear();
        self.machine.pending_state = None;
        for (slot, value) in self.module.globals.iter().zip(self.machine.globals.iter_mut()) {
            *value = match slot.ty {
                Type::Integer | Type::Bool => Value::Integer(DISPOSED_NUMBER),
                Type::Float => Value::Float(f64::from(DISPOSED_NUMBER)),
                Type::String => Value::String(DISPOSED_STRING.into()),
                Type::Key => Value::Key(DISPOSED_STRING.into()),
                ty => Value::default_for(ty),
            };
        }
        self.state = DISPOSED_STATE;
        self.event = EventKind::Garbage;
        self.event_args.clear();
        self.status = Status::Disposed;
        debug!(module = %self.module.name, "instance disposed");
    }

    fn check_live(&self, operation: &'static str) -> Result<(), RuntimeFault> {
        if self.status == Status::Disposed {
            return Err(RuntimeFault::InvalidStatus {
                operation,
                status: self.status.name(),
            });
        }
        Ok(())
    }

    // ── Migration ────────────────────────────────────────────────

    /// Capture the instance's state and stack into `sink`. A running
    /// handler writes at its next checkpoint; otherwise the write happens now.
    pub fn request_migrate_out(&mut self, sink: Sink) -> Result<(), MigrationFault> {
        if self.status == Status::Disposed {
            return Err(MigrationFault::Corrupt("cannot migrate a disposed instance".into()));
        }
        *self.requests.sink.lock() = Some(sink);
        self.requests.migrate.store(true, Ordering::SeqCst);
        self.flush_pending_migration()
    }

    /// Write a posted migration request if the instance is between runs.
    fn flush_pending_migration(&mut self) -> Result<(), MigrationFault> {
        if matches!(self.status, Status::Idle | Status::Suspended) && self.requests.migrate.load(Ordering::SeqCst) {
            self.flush_migration()?;
        }
        Ok(())
    }

    fn flush_migration(&mut self) -> Result<(), MigrationFault> {
        self.requests.migrate.store(false, Ordering::SeqCst);
        let Some(sink) = self.requests.sink.lock().take() else {
            return Ok(());
        };
        let previous = self.status;
        self.status = Status::MigratingOut;
        let result = write_snapshot(&self.module, &self.snapshot(), sink);
        self.status = previous;
        if result.is_ok() {
            info!(module = %self.module.name, status = previous.name(), "migrated out");
        }
        result
    }

    fn snapshot(&self) -> Snapshot {
        let active = (self.event != EventKind::None).then(|| ActiveHandler {
            pending_state: self.machine.pending_state,
            phase: self.phase,
            frames: self.machine.frames.clone(),
        });
        Snapshot {
            state: self.state,
            event: self.event,
            mem_usage: self.machine.mem_usage,
            mem_limit: self.machine.mem_limit,
            event_args: self.event_args.clone(),
            globals: self.machine.globals.clone(),
            active,
        }
    }

    /// Replace this instance's state with one read from `input`. On failure
    /// the instance is disposed.
    pub fn migrate_in<R: Read>(&mut self, input: R) -> Result<Status, MigrationFault> {
        if self.status != Status::Idle {
            return Err(MigrationFault::Corrupt(format!(
                "cannot migrate into a {} instance",
                self.status.name()
            )));
        }
        let snapshot = match read_snapshot(&self.module, input) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(module = %self.module.name, "migration in failed: {err}");
                self.dispose();
                return Err(err);
            }
        };
        self.state = snapshot.state;
        self.event = snapshot.event;
        self.event_args = snapshot.event_args;
        self.machine.globals = snapshot.globals;
        self.machine.mem_usage = snapshot.mem_usage;
        self.machine.mem_limit = snapshot.mem_limit;
        match snapshot.active {
            Some(active) => {
                self.machine.pending_state = active.pending_state;
                self.phase = active.phase;
                self.machine.frames = active.frames;
                self.status = Status::Suspended;
            }
            None => {
                self.machine.pending_state = None;
                self.machine.frames.clear();
                self.finish();
            }
        }
        info!(module = %self.module.name, status = self.status.name(), "migrated in");
        Ok(self.status)
    }
}

fn into_fault(err: ExecError) -> LocatedFault {
    match err {
        ExecError::Fault(fault) => fault,
        ExecError::Signal(signal) => RuntimeFault::CorruptBytecode(format!("initializer raised {signal:?}")).into(),
    }
}

fn check_event_args(event: EventKind, args: &[Value]) -> Result<(), RuntimeFault> {
    let sig = event.signature();
    let bad = |message: String| RuntimeFault::BadEventArgs {
        event: event.name().to_string(),
        message,
    };
    if args.len() != sig.len() {
        return Err(bad(format!("expected {} argument(s), got {}", sig.len(), args.len())));
    }
    for (i, (arg, &ty)) in args.iter().zip(sig).enumerate() {
        if matches!(arg, Value::Undef) || arg.ty() != ty {
            return Err(bad(format!("argument {i} should be {ty}, got {}", arg.ty())));
        }
    }
    Ok(())
}

// ── Shared handle ────────────────────────────────────────────────

/// Thread-safe handle. Suspend and migrate requests are posted without the
/// lock so they reach a handler that is running on another thread.
#[derive(Clone)]
pub struct SharedInstance {
    inner: Arc<Mutex<ScriptInstance>>,
    requests: Requests,
}

impl SharedInstance {
    pub fn new(instance: ScriptInstance) -> Self {
        let requests = instance.requests();
        Self {
            inner: Arc::new(Mutex::new(instance)),
            requests,
        }
    }

    /// Exclusive access. A migration request posted while the guard is held
    /// is written when it drops.
    pub fn lock(&self) -> InstanceGuard<'_> {
        InstanceGuard(self.inner.lock())
    }

    pub fn start(&self, event: EventKind, args: Vec<Value>, host: &mut dyn HostApi) -> Result<Status, LocatedFault> {
        let result = self.inner.lock().start(event, args, host);
        self.flush_after_unlock()?;
        result
    }

    pub fn resume(&self, host: &mut dyn HostApi) -> Result<Status, LocatedFault> {
        let result = self.inner.lock().resume(host);
        self.flush_after_unlock()?;
        result
    }

    /// A request that lost `try_lock` to the call that just returned is
    /// written here. If another caller holds the lock now, it writes it.
    fn flush_after_unlock(&self) -> Result<(), LocatedFault> {
        if !self.requests.migrate.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.inner.try_lock() {
            Some(mut instance) => instance.flush_requested_migration(),
            None => Ok(()),
        }
    }

    pub fn request_suspend(&self) {
        self.requests.suspend.store(true, Ordering::SeqCst);
    }

    /// Post a migration request. If no handler holds the instance the
    /// stream is written before this returns.
    pub fn request_migrate_out(&self, sink: Sink) -> Result<(), MigrationFault> {
        *self.requests.sink.lock() = Some(sink);
        self.requests.migrate.store(true, Ordering::SeqCst);
        match self.inner.try_lock() {
            Some(mut instance) => instance.flush_pending_migration(),
            None => Ok(()),
        }
    }
}

pub struct InstanceGuard<'a>(MutexGuard<'a, ScriptInstance>);

impl std::ops::Deref for InstanceGuard<'_> {
    type Target = ScriptInstance;

    fn deref(&self) -> &ScriptInstance {
        &self.0
    }
}

impl std::ops::DerefMut for InstanceGuard<'_> {
    fn deref_mut(&mut self) -> &mut ScriptInstance {
        &mut self.0
    }
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.0.flush_pending_migration() {
            warn!(module = %self.0.module.name, "migration out failed: {err}");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::lsl::api::ApiFunction;
    use crate::lsl::compile;
    use crate::runtime::host::{HostInterrupt, RecordingHost};

    fn settings() -> EngineSettings {
        EngineSettings::default()
    }

    fn instance(src: &str) -> ScriptInstance {
        ScriptInstance::new(Arc::new(compile(src).unwrap()), &settings()).unwrap()
    }

    fn said(host: &RecordingHost) -> Vec<String> {
        host.log
            .iter()
            .filter(|c| c.function == "llSay")
            .map(|c| c.args[1].as_str().to_string())
            .collect()
    }

    /// `Write` sink the test can read back after handing it to an instance.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn bytes(&self) -> Vec<u8> {
            self.0.lock().clone()
        }
    }

    fn migrate(inst: &mut ScriptInstance) -> ScriptInstance {
        let buf = SharedBuf::default();
        inst.request_migrate_out(Box::new(buf.clone())).unwrap();
        let mut fresh = ScriptInstance::new(Arc::clone(inst.module()), &settings()).unwrap();
        fresh.migrate_in(buf.bytes().as_slice()).unwrap();
        fresh
    }

    const TRANSITIONS: &str = "default {\n\
        state_entry() { llSay(0, \"default entry\"); }\n\
        touch_start(integer n) { llSay(0, \"touched\"); state two; }\n\
        state_exit() { llSay(0, \"default exit\"); }\n\
      }\n\
      state two {\n\
        state_entry() { llSay(0, \"two entry\"); }\n\
        touch_start(integer n) { state two; }\n\
      }";

    #[test]
    fn new_instance_is_idle_in_default() {
        let inst = instance("integer n = 4; default { state_entry() { } }");
        assert_eq!(inst.status(), Status::Idle);
        assert_eq!(inst.event(), EventKind::None);
        assert_eq!(inst.state_name(), Some("default"));
        assert_eq!(inst.global("n"), Some(&Value::Integer(4)));
        assert_eq!(inst.mem_usage(), 8);
    }

    #[test]
    fn transition_runs_exit_then_entry() {
        let mut inst = instance(TRANSITIONS);
        let mut host = RecordingHost::new();
        let status = inst.start(EventKind::TouchStart, vec![Value::Integer(1)], &mut host).unwrap();
        assert_eq!(status, Status::Idle);
        assert_eq!(said(&host), vec!["touched", "default exit", "two entry"]);
        assert_eq!(inst.state_name(), Some("two"));
        assert_eq!(inst.event(), EventKind::None);
    }

    #[test]
    fn transition_to_current_state_is_ignored() {
        let mut inst = instance(TRANSITIONS);
        let mut host = RecordingHost::new();
        inst.start(EventKind::TouchStart, vec![Value::Integer(1)], &mut host).unwrap();
        host.log.clear();
        inst.start(EventKind::TouchStart, vec![Value::Integer(1)], &mut host).unwrap();
        assert!(said(&host).is_empty());
        assert_eq!(inst.state_name(), Some("two"));
    }

    #[test]
    fn transitions_during_a_transition_are_fatal() {
        let mut inst = instance(
            "default { touch_start(integer n) { state two; } state_exit() { state three; } }\n\
             state two { }\n\
             state three { }",
        );
        let err = inst
            .start(EventKind::TouchStart, vec![Value::Integer(1)], &mut RecordingHost::new())
            .unwrap_err();
        assert_eq!(err.fault, RuntimeFault::NestedTransition("state_exit"));
        assert_eq!(inst.status(), Status::Idle);

        let mut inst = instance(
            "default { touch_start(integer n) { state two; } }\n\
             state two { state_entry() { state default; } }",
        );
        let err = inst
            .start(EventKind::TouchStart, vec![Value::Integer(1)], &mut RecordingHost::new())
            .unwrap_err();
        assert_eq!(err.fault, RuntimeFault::NestedTransition("state_entry"));
        assert!(err.to_string().starts_with("state_entry() transitioned state"));
    }

    #[test]
    fn only_one_handler_at_a_time() {
        let mut inst = instance("default { timer() { llSleep(1.0); } }");
        let mut host = RecordingHost::yielding();
        assert_eq!(inst.start(EventKind::Timer, vec![], &mut host).unwrap(), Status::Suspended);
        let err = inst.start(EventKind::Timer, vec![], &mut host).unwrap_err();
        assert_eq!(err.fault, RuntimeFault::HandlerActive);
        assert_eq!(err.to_string(), "event handler already active");
        assert_eq!(inst.resume(&mut host).unwrap(), Status::Idle);
        assert_eq!(inst.start(EventKind::Timer, vec![], &mut host).unwrap(), Status::Suspended);
    }

    #[test]
    fn start_validates_the_event() {
        let mut inst = instance("default { listen(integer c, string n, key id, string m) { } }");
        let mut host = RecordingHost::new();
        assert_eq!(
            inst.start(EventKind::None, vec![], &mut host).unwrap_err().fault,
            RuntimeFault::NoneEvent
        );
        assert!(matches!(
            inst.start_named("bogus", vec![], &mut host).unwrap_err().fault,
            RuntimeFault::UnknownEvent(_)
        ));
        let wrong = vec![Value::Integer(0), Value::String("a".into()), Value::String("k".into()), Value::String("m".into())];
        assert!(matches!(
            inst.start(EventKind::Listen, wrong, &mut host).unwrap_err().fault,
            RuntimeFault::BadEventArgs { .. }
        ));
        assert_eq!(inst.start(EventKind::Timer, vec![], &mut host).unwrap(), Status::Idle);
    }

    #[test]
    fn resume_requires_a_suspended_handler() {
        let mut inst = instance("default { }");
        let err = inst.resume(&mut RecordingHost::new()).unwrap_err();
        assert_eq!(err.to_string(), "cannot resume while idle");
    }

    #[test]
    fn fault_aborts_the_handler_but_keeps_the_instance() {
        let mut inst = instance(
            "list keep = [\"a\"];\n\
             default { touch(integer n) { list tmp = [\"xyz\"]; integer z; llSay(0, (string)(n / z)); } timer() { llSay(0, \"ok\"); } }",
        );
        let baseline = inst.mem_usage();
        let mut host = RecordingHost::new();
        let err = inst.start(EventKind::Touch, vec![Value::Integer(1)], &mut host).unwrap_err();
        assert_eq!(err.fault, RuntimeFault::Math("division by zero"));
        assert_eq!(err.location.unwrap().function, "default touch");
        assert_eq!(inst.status(), Status::Idle);
        assert_eq!(inst.mem_usage(), baseline);
        inst.start(EventKind::Timer, vec![], &mut host).unwrap();
        assert_eq!(said(&host), vec!["ok"]);
    }

    #[test]
    fn memory_tracks_globals_across_handlers() {
        let mut inst = instance(
            "list x = [\"abc\", 1];\n\
             default { touch(integer n) { x = []; } timer() { x += \"hello\"; } }",
        );
        let mut host = RecordingHost::new();
        assert_eq!(inst.mem_usage(), 96 + 40 + 6 + 8);
        inst.start(EventKind::Touch, vec![Value::Integer(0)], &mut host).unwrap();
        assert_eq!(inst.mem_usage(), 96);
        inst.start(EventKind::Timer, vec![], &mut host).unwrap();
        assert_eq!(inst.mem_usage(), 96 + 40 + 10);
    }

    #[test]
    fn reset_reinitializes_and_enters_default() {
        let mut inst = instance(
            "integer n = 5;\n\
             default { state_entry() { llSay(0, \"entry \" + (string)n); } touch(integer t) { n = 9; state other; } }\n\
             state other { touch(integer t) { llResetScript(); } }",
        );
        let mut host = RecordingHost::new();
        inst.start(EventKind::Touch, vec![Value::Integer(0)], &mut host).unwrap();
        assert_eq!(inst.state_name(), Some("other"));
        assert_eq!(inst.global("n"), Some(&Value::Integer(9)));
        inst.start(EventKind::Touch, vec![Value::Integer(0)], &mut host).unwrap();
        assert_eq!(inst.state_name(), Some("default"));
        assert_eq!(inst.global("n"), Some(&Value::Integer(5)));
        assert_eq!(said(&host), vec!["entry 5"]);
        assert_eq!(inst.status(), Status::Idle);
    }

    #[test]
    fn terminate_disposes_with_sentinels() {
        let mut inst = instance(
            "integer n = 1; float f; string s = \"x\";\n\
             default { touch(integer t) { llDie(); llSay(0, \"never\"); } }",
        );
        let mut host = RecordingHost::new();
        assert_eq!(
            inst.start(EventKind::Touch, vec![Value::Integer(0)], &mut host).unwrap(),
            Status::Disposed
        );
        assert_eq!(inst.state(), 12_345_678);
        assert_eq!(inst.event(), EventKind::Garbage);
        assert_eq!(inst.global("n"), Some(&Value::Integer(69_696_969)));
        assert_eq!(inst.global("f"), Some(&Value::Float(69_696_969.0)));
        assert_eq!(inst.global("s"), Some(&Value::String("DISPOSED SCRIPT".into())));
        assert!(said(&host).is_empty());
        let err = inst.start(EventKind::Touch, vec![Value::Integer(0)], &mut host).unwrap_err();
        assert_eq!(err.to_string(), "cannot start while disposed");
    }

    const WORKER: &str = "integer n;\n\
        default {\n\
          state_entry() {\n\
            llSay(0, \"start\");\n\
            integer i;\n\
            for (i = 0; i < 3; i++) {\n\
              n += i;\n\
              llSleep(1.0);\n\
              llSay(0, \"tick \" + (string)i);\n\
            }\n\
            state done;\n\
          }\n\
        }\n\
        state done { state_entry() { llSay(0, \"done \" + (string)n); } }";

    #[test]
    fn migration_round_trip_keeps_the_call_log() {
        let mut reference = instance(WORKER);
        let mut expected = RecordingHost::new();
        reference.start(EventKind::StateEntry, vec![], &mut expected).unwrap();
        assert_eq!(said(&expected).last().map(String::as_str), Some("done 3"));

        let mut host = RecordingHost::yielding();
        let mut inst = instance(WORKER);
        let mut status = inst.start(EventKind::StateEntry, vec![], &mut host).unwrap();
        let mut hops = 0;
        while status == Status::Suspended {
            inst = migrate(&mut inst);
            assert_eq!(inst.status(), Status::Suspended);
            status = inst.resume(&mut host).unwrap();
            hops += 1;
        }
        assert_eq!(hops, 3);
        assert_eq!(host.log, expected.log);
        assert_eq!(inst.globals(), reference.globals());
        assert_eq!(inst.state_name(), Some("done"));
        assert_eq!(inst.mem_usage(), reference.mem_usage());
    }

    #[test]
    fn migrating_at_every_checkpoint_is_transparent() {
        let mut reference = instance(WORKER);
        let mut expected = RecordingHost::new();
        reference.start(EventKind::StateEntry, vec![], &mut expected).unwrap();

        let always = EngineSettings {
            always_suspend: true,
            ..settings()
        };
        let module = Arc::new(compile(WORKER).unwrap());
        let mut inst = ScriptInstance::new(Arc::clone(&module), &always).unwrap();
        let mut host = RecordingHost::new();
        let mut status = inst.start(EventKind::StateEntry, vec![], &mut host).unwrap();
        while status == Status::Suspended {
            let buf = SharedBuf::default();
            inst.request_migrate_out(Box::new(buf.clone())).unwrap();
            inst = ScriptInstance::new(Arc::clone(&module), &always).unwrap();
            inst.migrate_in(buf.bytes().as_slice()).unwrap();
            status = inst.resume(&mut host).unwrap();
        }
        assert_eq!(host.log, expected.log);
        assert_eq!(inst.globals(), reference.globals());
    }

    #[test]
    fn idle_instance_migrates_immediately() {
        let mut inst = instance("integer n = 7; default { touch(integer t) { n++; } }");
        inst.start(EventKind::Touch, vec![Value::Integer(0)], &mut RecordingHost::new()).unwrap();
        let moved = migrate(&mut inst);
        assert_eq!(moved.status(), Status::Idle);
        assert_eq!(moved.global("n"), Some(&Value::Integer(8)));
    }

    #[test]
    fn failed_migration_disposes_the_receiver() {
        let mut inst = instance("default { }");
        let err = inst.migrate_in([2u8, 0, 0].as_slice()).unwrap_err();
        assert_eq!(err.to_string(), "incoming migration version 2 but accept only 1");
        assert_eq!(inst.status(), Status::Disposed);
    }

    /// Host that reports its first call, so a test knows the handler holds the lock.
    struct SignalingHost {
        inner: RecordingHost,
        started: Option<mpsc::Sender<()>>,
    }

    impl HostApi for SignalingHost {
        fn call(&mut self, function: &ApiFunction, args: &[Value]) -> Result<Value, HostInterrupt> {
            if let Some(tx) = self.started.take() {
                tx.send(()).unwrap();
            }
            self.inner.call(function, args)
        }
    }

    #[test]
    fn shared_instance_suspends_and_migrates_from_another_thread() {
        let shared = SharedInstance::new(instance(
            "integer n;\ndefault { timer() { llSay(0, \"go\"); while (TRUE) { n++; } } }",
        ));
        let buf = SharedBuf::default();
        let (tx, rx) = mpsc::channel();
        let worker = {
            let shared = shared.clone();
            thread::spawn(move || {
                let mut host = SignalingHost {
                    inner: RecordingHost::new(),
                    started: Some(tx),
                };
                shared.start(EventKind::Timer, vec![], &mut host)
            })
        };
        rx.recv().unwrap();
        shared.request_migrate_out(Box::new(buf.clone())).unwrap();
        let status = worker.join().unwrap().unwrap();
        assert_eq!(status, Status::Suspended);

        let module = Arc::clone(shared.lock().module());
        let mut moved = ScriptInstance::new(module, &settings()).unwrap();
        assert_eq!(moved.migrate_in(buf.bytes().as_slice()).unwrap(), Status::Suspended);
        assert_eq!(moved.event(), EventKind::Timer);

        shared.request_suspend();
        assert_eq!(shared.resume(&mut RecordingHost::new()).unwrap(), Status::Suspended);
    }

    #[test]
    fn migration_requested_under_the_lock_is_written_on_release() {
        let shared = SharedInstance::new(instance("integer n = 3;\ndefault { timer() { n++; } }"));
        let buf = SharedBuf::default();
        let guard = shared.lock();
        shared.request_migrate_out(Box::new(buf.clone())).unwrap();
        assert!(buf.bytes().is_empty());
        drop(guard);
        assert!(!buf.bytes().is_empty());

        assert_eq!(shared.start(EventKind::Timer, vec![], &mut RecordingHost::new()).unwrap(), Status::Idle);
        assert_eq!(shared.lock().global("n"), Some(&Value::Integer(4)));

        let mut moved = ScriptInstance::new(Arc::clone(shared.lock().module()), &settings()).unwrap();
        assert_eq!(moved.migrate_in(buf.bytes().as_slice()).unwrap(), Status::Idle);
        assert_eq!(moved.global("n"), Some(&Value::Integer(3)));
    }

    /// Host that parks inside its first call until the test lets it go.
    struct GatedHost {
        inner: RecordingHost,
        started: mpsc::Sender<()>,
        proceed: mpsc::Receiver<()>,
    }

    impl HostApi for GatedHost {
        fn call(&mut self, function: &ApiFunction, args: &[Value]) -> Result<Value, HostInterrupt> {
            self.started.send(()).unwrap();
            self.proceed.recv().unwrap();
            self.inner.call(function, args)
        }
    }

    #[test]
    fn migration_requested_during_a_finishing_handler_is_written() {
        let shared = SharedInstance::new(instance(
            "integer n = 1;\ndefault { touch(integer t) { n = 5; llResetScript(); } }",
        ));
        let buf = SharedBuf::default();
        let (started_tx, started_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let worker = {
            let shared = shared.clone();
            thread::spawn(move || {
                let mut host = GatedHost {
                    inner: RecordingHost::new(),
                    started: started_tx,
                    proceed: proceed_rx,
                };
                shared.start(EventKind::Touch, vec![Value::Integer(0)], &mut host)
            })
        };
        started_rx.recv().unwrap();
        shared.request_migrate_out(Box::new(buf.clone())).unwrap();
        assert!(buf.bytes().is_empty());
        proceed_tx.send(()).unwrap();

        // The reset leaves no handler to run, so the request is written as
        // the instance goes idle rather than at a checkpoint.
        assert_eq!(worker.join().unwrap().unwrap(), Status::Idle);
        assert!(!buf.bytes().is_empty());

        let mut moved = ScriptInstance::new(Arc::clone(shared.lock().module()), &settings()).unwrap();
        assert_eq!(moved.migrate_in(buf.bytes().as_slice()).unwrap(), Status::Idle);
        assert_eq!(moved.global("n"), Some(&Value::Integer(1)));
    }

    #[test]
    fn migration_posted_before_an_event_does_not_swallow_it() {
        let mut inst = instance("integer n;\ndefault { timer() { n++; } }");
        let buf = SharedBuf::default();
        let requests = inst.requests();
        let sink: Sink = Box::new(buf.clone());
        *requests.sink.lock() = Some(sink);
        requests.migrate.store(true, Ordering::SeqCst);

        let mut host = RecordingHost::new();
        assert_eq!(inst.start(EventKind::Timer, vec![], &mut host).unwrap(), Status::Idle);
        assert_eq!(inst.global("n"), Some(&Value::Integer(1)));
        assert!(!buf.bytes().is_empty());
    }
}
