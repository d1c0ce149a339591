// src/model/events.rs
//! Static catalog of dispatchable events
//!
//! Every handler registration and every method-invocation task resolves
//! against this table. Argument name lists drive how a task's decoded
//! argument array maps onto named slots: `context` always comes first, and
//! "after" events carry the upstream outcome in a trailing `result` slot.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Event id of the timer tick event
pub const TIMER_EVENT_ID: u16 = 800;

/// Event id of the custom (tenant-defined) event
pub const CUSTOM_EVENT_ID: u16 = 900;

/// Which subsystem raises an event; decides how registration targets are
/// interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventProvider {
    /// Data store events, targeted by table name
    Data,
    /// Account lifecycle events, untargeted
    User,
    /// Scheduled timers, targeted by timer name
    Timer,
    /// Tenant-defined events, targeted by event name
    Custom,
}

/// One dispatchable event
#[derive(Debug, Clone, Copy)]
pub struct EventDescriptor {
    pub id: u16,
    pub name: &'static str,
    pub provider: EventProvider,
    /// Declared argument names, positionally matching the task's decoded
    /// argument array
    pub args: &'static [&'static str],
}

impl EventDescriptor {
    /// Whether registration targets distinguish handlers for this event
    pub fn targeted(&self) -> bool {
        !matches!(self.provider, EventProvider::User)
    }

    /// Whether the trailing argument slot carries the upstream result
    pub fn returns_result(&self) -> bool {
        self.args.last() == Some(&"result")
    }
}

/// The full event table
pub const EVENTS: &[EventDescriptor] = &[
    EventDescriptor {
        id: 1,
        name: "beforeCreate",
        provider: EventProvider::Data,
        args: &["context", "item"],
    },
    EventDescriptor {
        id: 2,
        name: "afterCreate",
        provider: EventProvider::Data,
        args: &["context", "item", "result"],
    },
    EventDescriptor {
        id: 3,
        name: "beforeFind",
        provider: EventProvider::Data,
        args: &["context", "query"],
    },
    EventDescriptor {
        id: 4,
        name: "afterFind",
        provider: EventProvider::Data,
        args: &["context", "query", "result"],
    },
    EventDescriptor {
        id: 5,
        name: "beforeUpdate",
        provider: EventProvider::Data,
        args: &["context", "item"],
    },
    EventDescriptor {
        id: 6,
        name: "afterUpdate",
        provider: EventProvider::Data,
        args: &["context", "item", "result"],
    },
    EventDescriptor {
        id: 7,
        name: "beforeRemove",
        provider: EventProvider::Data,
        args: &["context", "itemId"],
    },
    EventDescriptor {
        id: 8,
        name: "afterRemove",
        provider: EventProvider::Data,
        args: &["context", "itemId", "result"],
    },
    EventDescriptor {
        id: 9,
        name: "beforeLogin",
        provider: EventProvider::User,
        args: &["context", "login", "password"],
    },
    EventDescriptor {
        id: 10,
        name: "afterLogin",
        provider: EventProvider::User,
        args: &["context", "login", "password", "result"],
    },
    EventDescriptor {
        id: 11,
        name: "beforeRegister",
        provider: EventProvider::User,
        args: &["context", "user"],
    },
    EventDescriptor {
        id: 12,
        name: "afterRegister",
        provider: EventProvider::User,
        args: &["context", "user", "result"],
    },
    EventDescriptor {
        id: TIMER_EVENT_ID,
        name: "execute",
        provider: EventProvider::Timer,
        args: &["context"],
    },
    EventDescriptor {
        id: CUSTOM_EVENT_ID,
        name: "handleEvent",
        provider: EventProvider::Custom,
        args: &["context", "args"],
    },
];

static BY_ID: Lazy<HashMap<u16, &'static EventDescriptor>> =
    Lazy::new(|| EVENTS.iter().map(|event| (event.id, event)).collect());

static BY_NAME: Lazy<HashMap<&'static str, &'static EventDescriptor>> =
    Lazy::new(|| EVENTS.iter().map(|event| (event.name, event)).collect());

/// Look up an event by id
pub fn event_by_id(id: u16) -> Option<&'static EventDescriptor> {
    BY_ID.get(&id).copied()
}

/// Look up an event by name
pub fn event_by_name(name: &str) -> Option<&'static EventDescriptor> {
    BY_NAME.get(name).copied()
}
