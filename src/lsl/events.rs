use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::Type;

/// Number of dispatch columns per state.
pub const EVENT_TABLE_WIDTH: usize = 38;

/// Script event codes. Ordinals are stable and appear in migration streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum EventKind {
    /// No event is being processed.
    None = -1,
    Attach = 0,
    StateExit = 1,
    Timer = 2,
    Touch = 3,
    Collision = 4,
    CollisionEnd = 5,
    CollisionStart = 6,
    Control = 7,
    Dataserver = 8,
    Email = 9,
    HttpResponse = 10,
    LandCollision = 11,
    LandCollisionEnd = 12,
    LandCollisionStart = 13,
    AtTarget = 14,
    Listen = 15,
    Money = 16,
    MovingEnd = 17,
    MovingStart = 18,
    NotAtRotTarget = 19,
    NotAtTarget = 20,
    TouchStart = 21,
    ObjectRez = 22,
    RemoteData = 23,
    RunTimePermissions = 28,
    TouchEnd = 29,
    StateEntry = 30,
    AtRotTarget = 32,
    Changed = 33,
    LinkMessage = 34,
    NoSensor = 35,
    OnRez = 36,
    Sensor = 37,
    /// Written into disposed instances.
    Garbage = 12_345_678,
}

impl EventKind {
    /// Every event a handler can be declared for.
    pub const HANDLED: &'static [EventKind] = &[
        EventKind::Attach,
        EventKind::StateExit,
        EventKind::Timer,
        EventKind::Touch,
        EventKind::Collision,
        EventKind::CollisionEnd,
        EventKind::CollisionStart,
        EventKind::Control,
        EventKind::Dataserver,
        EventKind::Email,
        EventKind::HttpResponse,
        EventKind::LandCollision,
        EventKind::LandCollisionEnd,
        EventKind::LandCollisionStart,
        EventKind::AtTarget,
        EventKind::Listen,
        EventKind::Money,
        EventKind::MovingEnd,
        EventKind::MovingStart,
        EventKind::NotAtRotTarget,
        EventKind::NotAtTarget,
        EventKind::TouchStart,
        EventKind::ObjectRez,
        EventKind::RemoteData,
        EventKind::RunTimePermissions,
        EventKind::TouchEnd,
        EventKind::StateEntry,
        EventKind::AtRotTarget,
        EventKind::Changed,
        EventKind::LinkMessage,
        EventKind::NoSensor,
        EventKind::OnRez,
        EventKind::Sensor,
    ];

    pub fn ordinal(self) -> i32 {
        self as i32
    }

    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            -1 => Some(Self::None),
            12_345_678 => Some(Self::Garbage),
            n => Self::HANDLED.iter().copied().find(|e| e.ordinal() == n),
        }
    }

    /// Dispatch column, for events that can have handlers.
    pub fn column(self) -> Option<usize> {
        usize::try_from(self.ordinal())
            .ok()
            .filter(|&c| c < EVENT_TABLE_WIDTH)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Attach => "attach",
            Self::StateExit => "state_exit",
            Self::Timer => "timer",
            Self::Touch => "touch",
            Self::Collision => "collision",
            Self::CollisionEnd => "collision_end",
            Self::CollisionStart => "collision_start",
            Self::Control => "control",
            Self::Dataserver => "dataserver",
            Self::Email => "email",
            Self::HttpResponse => "http_response",
            Self::LandCollision => "land_collision",
            Self::LandCollisionEnd => "land_collision_end",
            Self::LandCollisionStart => "land_collision_start",
            Self::AtTarget => "at_target",
            Self::Listen => "listen",
            Self::Money => "money",
            Self::MovingEnd => "moving_end",
            Self::MovingStart => "moving_start",
            Self::NotAtRotTarget => "not_at_rot_target",
            Self::NotAtTarget => "not_at_target",
            Self::TouchStart => "touch_start",
            Self::ObjectRez => "object_rez",
            Self::RemoteData => "remote_data",
            Self::RunTimePermissions => "run_time_permissions",
            Self::TouchEnd => "touch_end",
            Self::StateEntry => "state_entry",
            Self::AtRotTarget => "at_rot_target",
            Self::Changed => "changed",
            Self::LinkMessage => "link_message",
            Self::NoSensor => "no_sensor",
            Self::OnRez => "on_rez",
            Self::Sensor => "sensor",
            Self::Garbage => "Garbage",
        }
    }

    /// Look up a handler-capable event by its script name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::HANDLED.iter().copied().find(|e| e.name() == name)
    }

    /// Parameter types a handler for this event must declare.
    pub fn signature(self) -> &'static [Type] {
        use Type::{Integer as I, Key as K, List as L, Rotation as R, String as S, Vector as V};
        match self {
            Self::AtRotTarget => &[I, R, R],
            Self::AtTarget => &[I, V, V],
            Self::Attach | Self::ObjectRez => &[K],
            Self::Changed
            | Self::Collision
            | Self::CollisionEnd
            | Self::CollisionStart
            | Self::OnRez
            | Self::RunTimePermissions
            | Self::Sensor
            | Self::Touch
            | Self::TouchStart
            | Self::TouchEnd => &[I],
            Self::Control => &[K, I, I],
            Self::Dataserver => &[K, S],
            Self::Email => &[S, S, S, S, I],
            Self::HttpResponse => &[K, I, L, S],
            Self::LandCollision | Self::LandCollisionEnd | Self::LandCollisionStart => &[V],
            Self::LinkMessage => &[I, I, S, K],
            Self::Listen => &[I, S, K, S],
            Self::Money => &[K, I],
            Self::RemoteData => &[I, K, K, S, I, S],
            Self::MovingEnd
            | Self::MovingStart
            | Self::NoSensor
            | Self::NotAtRotTarget
            | Self::NotAtTarget
            | Self::StateEntry
            | Self::StateExit
            | Self::Timer
            | Self::None
            | Self::Garbage => &[],
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_stable() {
        assert_eq!(EventKind::None.ordinal(), -1);
        assert_eq!(EventKind::HttpResponse.ordinal(), 10);
        assert_eq!(EventKind::RunTimePermissions.ordinal(), 28);
        assert_eq!(EventKind::StateEntry.ordinal(), 30);
        assert_eq!(EventKind::Sensor.ordinal(), 37);
        assert_eq!(EventKind::Garbage.ordinal(), 12_345_678);
    }

    #[test]
    fn every_handled_event_fits_the_table() {
        for &e in EventKind::HANDLED {
            assert!(e.column().is_some(), "{e}");
            assert_eq!(EventKind::from_name(e.name()), Some(e));
            assert_eq!(EventKind::from_ordinal(e.ordinal()), Some(e));
        }
        assert_eq!(EventKind::None.column(), None);
        assert_eq!(EventKind::Garbage.column(), None);
    }

    #[test]
    fn unknown_names_and_gaps() {
        assert_eq!(EventKind::from_name("touchy"), None);
        assert_eq!(EventKind::from_name("None"), None);
        assert_eq!(EventKind::from_ordinal(31), None);
    }

    #[test]
    fn signatures() {
        assert_eq!(
            EventKind::HttpResponse.signature(),
            &[Type::Key, Type::Integer, Type::List, Type::String]
        );
        assert_eq!(
            EventKind::Listen.signature(),
            &[Type::Integer, Type::String, Type::Key, Type::String]
        );
        assert_eq!(EventKind::Money.signature(), &[Type::Key, Type::Integer]);
        assert!(EventKind::Timer.signature().is_empty());
    }
}
