use super::types::Type;

/// Backend API function: name, signature, and a short description.
/// The code generator type-checks calls against this table and the runtime
/// hands the call to the host by index.
#[derive(Debug, Clone)]
pub struct ApiFunction {
    pub name: &'static str,
    pub params: &'static [(&'static str, Type)],
    pub ret: Type,
    pub category: &'static str,
    pub description: &'static str,
}

/// All backend API functions callable from scripts.
pub static API_FUNCTIONS: &[ApiFunction] = &[
    // ── Chat ────────────────────────────────────────────────────
    ApiFunction {
        name: "llSay", params: &[("channel", Type::Integer), ("msg", Type::String)], ret: Type::Void,
        category: "chat", description: "Say text on a channel (20m range)",
    },
    ApiFunction {
        name: "llShout", params: &[("channel", Type::Integer), ("msg", Type::String)], ret: Type::Void,
        category: "chat", description: "Shout text on a channel (100m range)",
    },
    ApiFunction {
        name: "llWhisper", params: &[("channel", Type::Integer), ("msg", Type::String)], ret: Type::Void,
        category: "chat", description: "Whisper text on a channel (10m range)",
    },
    ApiFunction {
        name: "llRegionSay", params: &[("channel", Type::Integer), ("msg", Type::String)], ret: Type::Void,
        category: "chat", description: "Say text to the whole region",
    },
    ApiFunction {
        name: "llOwnerSay", params: &[("msg", Type::String)], ret: Type::Void,
        category: "chat", description: "Send text to the object owner only",
    },
    ApiFunction {
        name: "llListen",
        params: &[("channel", Type::Integer), ("name", Type::String), ("id", Type::Key), ("msg", Type::String)],
        ret: Type::Integer,
        category: "chat", description: "Open a listener; returns its handle",
    },
    ApiFunction {
        name: "llListenRemove", params: &[("handle", Type::Integer)], ret: Type::Void,
        category: "chat", description: "Close a listener",
    },
    // ── Timers ──────────────────────────────────────────────────
    ApiFunction {
        name: "llSetTimerEvent", params: &[("sec", Type::Float)], ret: Type::Void,
        category: "time", description: "Fire the timer event every `sec` seconds (0 stops it)",
    },
    ApiFunction {
        name: "llSleep", params: &[("sec", Type::Float)], ret: Type::Void,
        category: "time", description: "Pause the script",
    },
    ApiFunction {
        name: "llGetTime", params: &[], ret: Type::Float,
        category: "time", description: "Seconds since the script started or the timer was reset",
    },
    ApiFunction {
        name: "llGetUnixTime", params: &[], ret: Type::Integer,
        category: "time", description: "Seconds since the Unix epoch",
    },
    // ── Strings ─────────────────────────────────────────────────
    ApiFunction {
        name: "llStringLength", params: &[("s", Type::String)], ret: Type::Integer,
        category: "string", description: "Number of characters in a string",
    },
    ApiFunction {
        name: "llGetSubString",
        params: &[("s", Type::String), ("start", Type::Integer), ("end", Type::Integer)],
        ret: Type::String,
        category: "string", description: "Inclusive substring; negative indices count from the end",
    },
    ApiFunction {
        name: "llToUpper", params: &[("s", Type::String)], ret: Type::String,
        category: "string", description: "Upper-case copy",
    },
    ApiFunction {
        name: "llToLower", params: &[("s", Type::String)], ret: Type::String,
        category: "string", description: "Lower-case copy",
    },
    // ── Lists ───────────────────────────────────────────────────
    ApiFunction {
        name: "llGetListLength", params: &[("src", Type::List)], ret: Type::Integer,
        category: "list", description: "Number of elements in a list",
    },
    ApiFunction {
        name: "llList2String", params: &[("src", Type::List), ("index", Type::Integer)], ret: Type::String,
        category: "list", description: "Element converted to string (empty when out of range)",
    },
    ApiFunction {
        name: "llList2Integer", params: &[("src", Type::List), ("index", Type::Integer)], ret: Type::Integer,
        category: "list", description: "Element converted to integer (0 when out of range)",
    },
    ApiFunction {
        name: "llList2Float", params: &[("src", Type::List), ("index", Type::Integer)], ret: Type::Float,
        category: "list", description: "Element converted to float (0.0 when out of range)",
    },
    ApiFunction {
        name: "llList2Key", params: &[("src", Type::List), ("index", Type::Integer)], ret: Type::Key,
        category: "list", description: "Element converted to key",
    },
    ApiFunction {
        name: "llDumpList2String", params: &[("src", Type::List), ("sep", Type::String)], ret: Type::String,
        category: "list", description: "Join elements with a separator",
    },
    // ── Math ────────────────────────────────────────────────────
    ApiFunction {
        name: "llAbs", params: &[("val", Type::Integer)], ret: Type::Integer,
        category: "math", description: "Integer absolute value",
    },
    ApiFunction {
        name: "llFabs", params: &[("val", Type::Float)], ret: Type::Float,
        category: "math", description: "Float absolute value",
    },
    ApiFunction {
        name: "llSqrt", params: &[("val", Type::Float)], ret: Type::Float,
        category: "math", description: "Square root",
    },
    ApiFunction {
        name: "llPow", params: &[("base", Type::Float), ("exp", Type::Float)], ret: Type::Float,
        category: "math", description: "Power",
    },
    ApiFunction {
        name: "llSin", params: &[("theta", Type::Float)], ret: Type::Float,
        category: "math", description: "Sine",
    },
    ApiFunction {
        name: "llCos", params: &[("theta", Type::Float)], ret: Type::Float,
        category: "math", description: "Cosine",
    },
    ApiFunction {
        name: "llFloor", params: &[("val", Type::Float)], ret: Type::Integer,
        category: "math", description: "Round down to integer",
    },
    ApiFunction {
        name: "llCeil", params: &[("val", Type::Float)], ret: Type::Integer,
        category: "math", description: "Round up to integer",
    },
    ApiFunction {
        name: "llRound", params: &[("val", Type::Float)], ret: Type::Integer,
        category: "math", description: "Round half away from zero",
    },
    ApiFunction {
        name: "llFrand", params: &[("mag", Type::Float)], ret: Type::Float,
        category: "math", description: "Pseudo-random float in [0, mag)",
    },
    // ── Vectors ─────────────────────────────────────────────────
    ApiFunction {
        name: "llVecMag", params: &[("v", Type::Vector)], ret: Type::Float,
        category: "vector", description: "Vector magnitude",
    },
    ApiFunction {
        name: "llVecNorm", params: &[("v", Type::Vector)], ret: Type::Vector,
        category: "vector", description: "Unit vector in the same direction",
    },
    ApiFunction {
        name: "llVecDist", params: &[("a", Type::Vector), ("b", Type::Vector)], ret: Type::Float,
        category: "vector", description: "Distance between two points",
    },
    // ── Object ──────────────────────────────────────────────────
    ApiFunction {
        name: "llGetKey", params: &[], ret: Type::Key,
        category: "object", description: "Key of the prim running the script",
    },
    ApiFunction {
        name: "llGetOwner", params: &[], ret: Type::Key,
        category: "object", description: "Key of the object owner",
    },
    ApiFunction {
        name: "llMessageLinked",
        params: &[("link", Type::Integer), ("num", Type::Integer), ("str", Type::String), ("id", Type::Key)],
        ret: Type::Void,
        category: "object", description: "Send a link_message event to scripts in the link set",
    },
    ApiFunction {
        name: "llGiveMoney", params: &[("dest", Type::Key), ("amount", Type::Integer)], ret: Type::Integer,
        category: "object", description: "Pay an avatar from the owner's balance",
    },
    // ── Network ─────────────────────────────────────────────────
    ApiFunction {
        name: "llHTTPRequest",
        params: &[("url", Type::String), ("params", Type::List), ("body", Type::String)],
        ret: Type::Key,
        category: "net", description: "Start an HTTP request; the reply arrives as http_response",
    },
    // ── Script control ──────────────────────────────────────────
    ApiFunction {
        name: "llResetScript", params: &[], ret: Type::Void,
        category: "control", description: "Reset globals and restart in the default state",
    },
    ApiFunction {
        name: "llDie", params: &[], ret: Type::Void,
        category: "control", description: "Delete the object and stop the script",
    },
];

/// Find an API function and its table index.
pub fn lookup_api(name: &str) -> Option<(usize, &'static ApiFunction)> {
    API_FUNCTIONS.iter().enumerate().find(|(_, f)| f.name == name)
}

// ── Named constants ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Integer(i32),
    Float(f64),
    String(&'static str),
    Key(&'static str),
    Vector([f64; 3]),
    Rotation([f64; 4]),
}

impl ConstValue {
    pub fn ty(self) -> Type {
        match self {
            Self::Integer(_) => Type::Integer,
            Self::Float(_) => Type::Float,
            Self::String(_) => Type::String,
            Self::Key(_) => Type::Key,
            Self::Vector(_) => Type::Vector,
            Self::Rotation(_) => Type::Rotation,
        }
    }
}

pub static CONSTANTS: &[(&str, ConstValue)] = &[
    ("TRUE", ConstValue::Integer(1)),
    ("FALSE", ConstValue::Integer(0)),
    ("PI", ConstValue::Float(std::f64::consts::PI)),
    ("TWO_PI", ConstValue::Float(std::f64::consts::TAU)),
    ("PI_BY_TWO", ConstValue::Float(std::f64::consts::FRAC_PI_2)),
    ("DEG_TO_RAD", ConstValue::Float(std::f64::consts::PI / 180.0)),
    ("RAD_TO_DEG", ConstValue::Float(180.0 / std::f64::consts::PI)),
    ("SQRT2", ConstValue::Float(std::f64::consts::SQRT_2)),
    ("NULL_KEY", ConstValue::Key("00000000-0000-0000-0000-000000000000")),
    ("EOF", ConstValue::String("\n\n\n")),
    ("ZERO_VECTOR", ConstValue::Vector([0.0, 0.0, 0.0])),
    ("ZERO_ROTATION", ConstValue::Rotation([0.0, 0.0, 0.0, 1.0])),
    ("PUBLIC_CHANNEL", ConstValue::Integer(0)),
    ("DEBUG_CHANNEL", ConstValue::Integer(0x7FFF_FFFF)),
    ("LINK_SET", ConstValue::Integer(-1)),
    ("LINK_ALL_OTHERS", ConstValue::Integer(-2)),
    ("LINK_THIS", ConstValue::Integer(-4)),
    ("CHANGED_INVENTORY", ConstValue::Integer(1)),
    ("CHANGED_COLOR", ConstValue::Integer(2)),
    ("CHANGED_SHAPE", ConstValue::Integer(4)),
    ("CHANGED_SCALE", ConstValue::Integer(8)),
    ("CHANGED_TEXTURE", ConstValue::Integer(16)),
    ("CHANGED_LINK", ConstValue::Integer(32)),
    ("CHANGED_ALLOWED_DROP", ConstValue::Integer(64)),
    ("CHANGED_OWNER", ConstValue::Integer(128)),
    ("CHANGED_REGION", ConstValue::Integer(256)),
    ("CHANGED_TELEPORT", ConstValue::Integer(512)),
    ("HTTP_METHOD", ConstValue::Integer(0)),
    ("HTTP_MIMETYPE", ConstValue::Integer(1)),
];

pub fn lookup_constant(name: &str) -> Option<ConstValue> {
    CONSTANTS.iter().find(|(n, _)| *n == name).map(|&(_, v)| v)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn api_names_are_unique() {
        for (i, f) in API_FUNCTIONS.iter().enumerate() {
            assert_eq!(lookup_api(f.name).map(|(idx, _)| idx), Some(i), "{}", f.name);
        }
    }

    #[test]
    fn constants_resolve_with_types() {
        assert_eq!(lookup_constant("TRUE"), Some(ConstValue::Integer(1)));
        assert_eq!(lookup_constant("ZERO_VECTOR").map(ConstValue::ty), Some(Type::Vector));
        assert_eq!(lookup_constant("NULL_KEY").map(ConstValue::ty), Some(Type::Key));
        assert_eq!(lookup_constant("nope"), None);
    }

    #[test]
    fn http_request_signature() {
        let (_, f) = lookup_api("llHTTPRequest").unwrap();
        let types: Vec<Type> = f.params.iter().map(|&(_, t)| t).collect();
        assert_eq!(types, vec![Type::String, Type::List, Type::String]);
        assert_eq!(f.ret, Type::Key);
    }
}
