use tracing::debug;

use super::error::ControlSignal;
use super::value::{float_to_int, Value, NULL_KEY};
use crate::lsl::api::ApiFunction;
use crate::lsl::types::Type;

/// Why a host call did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum HostInterrupt {
    Failed(String),
    Signal(ControlSignal),
    /// The call cannot finish yet; suspend the script and retry it with
    /// [`HostApi::resume_call`] when the instance is resumed.
    Suspend,
}

/// The world a script talks to. Arguments arrive converted to the
/// declared parameter types.
pub trait HostApi {
    fn call(&mut self, function: &ApiFunction, args: &[Value]) -> Result<Value, HostInterrupt>;

    /// Finish a call that previously answered [`HostInterrupt::Suspend`].
    fn resume_call(&mut self, function: &ApiFunction, args: &[Value]) -> Result<Value, HostInterrupt> {
        self.call(function, args)
    }
}

/// Host for code that must not reach the outside world, such as global
/// initializers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHost;

impl HostApi for NullHost {
    fn call(&mut self, function: &ApiFunction, args: &[Value]) -> Result<Value, HostInterrupt> {
        eval_pure(function.name, args).ok_or_else(|| HostInterrupt::Failed("no host attached".into()))
    }
}

/// Functions that only compute on their arguments.
pub fn eval_pure(name: &str, args: &[Value]) -> Option<Value> {
    let int = |i: usize| args.get(i).map_or(0, Value::as_int);
    let float = |i: usize| args.get(i).map_or(0.0, Value::as_float);
    let text = |i: usize| args.get(i).map_or("", Value::as_str);
    let list = |i: usize| list_arg(args, i);
    let vector = |i: usize| match args.get(i) {
        Some(Value::Vector(v)) => *v,
        _ => [0.0; 3],
    };
    let element = |i: usize| list_element(list_arg(args, i), int(i + 1));

    Some(match name {
        "llStringLength" => Value::Integer(i32::try_from(text(0).chars().count()).unwrap_or(i32::MAX)),
        "llGetSubString" => Value::String(substring(text(0), int(1), int(2))),
        "llToUpper" => Value::String(text(0).to_uppercase()),
        "llToLower" => Value::String(text(0).to_lowercase()),
        "llGetListLength" => Value::Integer(i32::try_from(list(0).len()).unwrap_or(i32::MAX)),
        "llList2String" => Value::String(element(0).map(Value::render).unwrap_or_default()),
        "llList2Integer" => Value::Integer(
            element(0)
                .and_then(|v| v.cast_to(Type::Integer).ok())
                .map_or(0, |v| v.as_int()),
        ),
        "llList2Float" => Value::Float(
            element(0)
                .and_then(|v| v.cast_to(Type::Float).ok())
                .map_or(0.0, |v| v.as_float()),
        ),
        "llList2Key" => Value::Key(element(0).map(Value::render).unwrap_or_default()),
        "llDumpList2String" => Value::String(
            list(0)
                .iter()
                .map(Value::render)
                .collect::<Vec<_>>()
                .join(text(1)),
        ),
        "llAbs" => Value::Integer(int(0).wrapping_abs()),
        "llFabs" => Value::Float(float(0).abs()),
        "llSqrt" => Value::Float(float(0).sqrt()),
        "llPow" => Value::Float(float(0).powf(float(1))),
        "llSin" => Value::Float(float(0).sin()),
        "llCos" => Value::Float(float(0).cos()),
        "llFloor" => Value::Integer(float_to_int(float(0).floor())),
        "llCeil" => Value::Integer(float_to_int(float(0).ceil())),
        "llRound" => Value::Integer(float_to_int((float(0) + 0.5).floor())),
        "llVecMag" => {
            let [x, y, z] = vector(0);
            Value::Float((x * x + y * y + z * z).sqrt())
        }
        "llVecNorm" => {
            let [x, y, z] = vector(0);
            let mag = (x * x + y * y + z * z).sqrt();
            if mag == 0.0 {
                Value::Vector([0.0; 3])
            } else {
                Value::Vector([x / mag, y / mag, z / mag])
            }
        }
        "llVecDist" => {
            let ([ax, ay, az], [bx, by, bz]) = (vector(0), vector(1));
            Value::Float(((ax - bx).powi(2) + (ay - by).powi(2) + (az - bz).powi(2)).sqrt())
        }
        _ => return None,
    })
}

fn list_arg(args: &[Value], i: usize) -> &[Value] {
    match args.get(i) {
        Some(Value::List(items)) => items,
        _ => &[],
    }
}

/// List element by index; negative indices count from the end.
fn list_element(items: &[Value], idx: i32) -> Option<&Value> {
    let len = i32::try_from(items.len()).ok()?;
    let idx = if idx < 0 { idx + len } else { idx };
    items.get(usize::try_from(idx).ok()?)
}

/// Inclusive character range; negative indices count from the end and
/// `start > end` selects everything outside the range.
fn substring(s: &str, start: i32, end: i32) -> String {
    let chars: Vec<char> = s.chars().collect();
    let len = i32::try_from(chars.len()).unwrap_or(i32::MAX);
    let norm = |i: i32| if i < 0 { i + len } else { i };
    let (start, end) = (norm(start), norm(end));
    let pick = |from: i32, to: i32| -> String {
        let from = usize::try_from(from.max(0)).unwrap_or(0);
        let to = usize::try_from((to + 1).min(len)).unwrap_or(0);
        chars.get(from..to.max(from)).map(|c| c.iter().collect()).unwrap_or_default()
    };
    if start <= end {
        pick(start, end)
    } else {
        pick(0, end) + &pick(start, len - 1)
    }
}

// ── Recording host ───────────────────────────────────────────────

/// One side-effecting call, as seen by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub function: String,
    pub args: Vec<Value>,
}

/// Deterministic in-memory host. Pure functions are evaluated; everything
/// else is logged and answered with a predictable value.
#[derive(Debug, Clone)]
pub struct RecordingHost {
    pub log: Vec<CallRecord>,
    pub object_key: String,
    pub owner_key: String,
    /// Make `llSleep` suspend the calling script until it is resumed.
    pub yield_on_sleep: bool,
    clock: f64,
    next_handle: i32,
    rng: u64,
}

impl Default for RecordingHost {
    fn default() -> Self {
        Self {
            log: Vec::new(),
            object_key: "a2e76fcd-9360-4f6d-a924-000000000001".into(),
            owner_key: "a2e76fcd-9360-4f6d-a924-000000000002".into(),
            yield_on_sleep: false,
            clock: 0.0,
            next_handle: 1,
            rng: 0x2545_f491_4f6c_dd1d,
        }
    }
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host whose `llSleep` suspends the caller once.
    pub fn yielding() -> Self {
        Self {
            yield_on_sleep: true,
            ..Self::default()
        }
    }

    /// Names of the logged calls, in order.
    pub fn call_names(&self) -> Vec<&str> {
        self.log.iter().map(|c| c.function.as_str()).collect()
    }

    fn next_random(&mut self) -> f64 {
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 7;
        self.rng ^= self.rng << 17;
        #[allow(clippy::cast_precision_loss)]
        let unit = (self.rng >> 11) as f64 / (1u64 << 53) as f64;
        unit
    }

    fn request_key(&mut self) -> String {
        let n = self.next_handle;
        self.next_handle += 1;
        format!("00000000-0000-0000-0000-{n:012x}")
    }
}

impl HostApi for RecordingHost {
    fn call(&mut self, function: &ApiFunction, args: &[Value]) -> Result<Value, HostInterrupt> {
        if let Some(value) = eval_pure(function.name, args) {
            return Ok(value);
        }
        debug!(function = function.name, "host call");
        self.log.push(CallRecord {
            function: function.name.to_string(),
            args: args.to_vec(),
        });
        Ok(match function.name {
            "llResetScript" => return Err(HostInterrupt::Signal(ControlSignal::Reset)),
            "llDie" => return Err(HostInterrupt::Signal(ControlSignal::Terminate)),
            "llSleep" if self.yield_on_sleep => return Err(HostInterrupt::Suspend),
            "llGetTime" => {
                self.clock += 0.25;
                Value::Float(self.clock)
            }
            "llGetUnixTime" => Value::Integer(1_700_000_000),
            "llFrand" => {
                let mag = args.first().map_or(1.0, Value::as_float);
                Value::Float(self.next_random() * mag)
            }
            "llListen" => {
                let handle = self.next_handle;
                self.next_handle += 1;
                Value::Integer(handle)
            }
            "llGetKey" => Value::Key(self.object_key.clone()),
            "llGetOwner" => Value::Key(self.owner_key.clone()),
            "llHTTPRequest" => Value::Key(self.request_key()),
            "llGiveMoney" => {
                let dest = args.first().map_or("", Value::as_str);
                if dest == NULL_KEY || dest.is_empty() {
                    return Err(HostInterrupt::Failed("cannot pay the null key".into()));
                }
                Value::Integer(1)
            }
            _ => Value::default_for(function.ret),
        })
    }

    fn resume_call(&mut self, function: &ApiFunction, args: &[Value]) -> Result<Value, HostInterrupt> {
        if function.name == "llSleep" {
            return Ok(Value::Undef);
        }
        self.call(function, args)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lsl::api::lookup_api;

    fn call(host: &mut RecordingHost, name: &str, args: Vec<Value>) -> Result<Value, HostInterrupt> {
        let (_, func) = lookup_api(name).unwrap();
        host.call(func, &args)
    }

    #[test]
    fn substrings() {
        assert_eq!(substring("abcdef", 1, 3), "bcd");
        assert_eq!(substring("abcdef", -2, -1), "ef");
        assert_eq!(substring("abcdef", 4, 1), "abef");
        assert_eq!(substring("abc", 1, 99), "bc");
    }

    #[test]
    fn pure_functions_are_not_logged() {
        let mut host = RecordingHost::new();
        let len = call(&mut host, "llStringLength", vec![Value::String("héllo".into())]).unwrap();
        assert_eq!(len, Value::Integer(5));
        assert!(host.log.is_empty());
    }

    #[test]
    fn list_accessors() {
        let items = Value::List(vec![Value::Integer(4), Value::String("12".into()), Value::Float(2.5)]);
        assert_eq!(eval_pure("llList2Integer", &[items.clone(), Value::Integer(1)]), Some(Value::Integer(12)));
        assert_eq!(eval_pure("llList2String", &[items.clone(), Value::Integer(-1)]), Some(Value::String("2.500000".into())));
        assert_eq!(eval_pure("llList2Float", &[items.clone(), Value::Integer(9)]), Some(Value::Float(0.0)));
        assert_eq!(
            eval_pure("llDumpList2String", &[items, Value::String("|".into())]),
            Some(Value::String("4|12|2.500000".into()))
        );
    }

    #[test]
    fn side_effects_are_logged_in_order() {
        let mut host = RecordingHost::new();
        call(&mut host, "llSay", vec![Value::Integer(0), Value::String("a".into())]).unwrap();
        let h = call(&mut host, "llListen", vec![
            Value::Integer(5),
            Value::String(String::new()),
            Value::Key(String::new()),
            Value::String(String::new()),
        ])
        .unwrap();
        assert_eq!(h, Value::Integer(1));
        assert_eq!(host.call_names(), vec!["llSay", "llListen"]);
    }

    #[test]
    fn sleep_can_yield_once() {
        let mut host = RecordingHost::yielding();
        let (_, sleep) = lookup_api("llSleep").unwrap();
        assert_eq!(host.call(sleep, &[Value::Float(1.0)]), Err(HostInterrupt::Suspend));
        assert_eq!(host.resume_call(sleep, &[Value::Float(1.0)]), Ok(Value::Undef));
        assert_eq!(host.call_names(), vec!["llSleep"]);
    }

    #[test]
    fn control_functions_raise_signals() {
        let mut host = RecordingHost::new();
        assert_eq!(
            call(&mut host, "llResetScript", vec![]),
            Err(HostInterrupt::Signal(ControlSignal::Reset))
        );
        assert_eq!(call(&mut host, "llDie", vec![]), Err(HostInterrupt::Signal(ControlSignal::Terminate)));
    }
}
