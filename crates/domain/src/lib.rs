pub mod commands;
pub mod coordination;
pub mod events;
pub mod messaging;
pub mod repositories;

pub use commands::{CommandKind, CommandPayload, COMMAND_EVENT_TYPE};
pub use coordination::{CoordinationBackend, GroupEvent};
pub use events::{
    owner_of, parse_identifier, Crud, Event, RebalanceBody, Resource, ERROR_SENTINEL, WILDCARD,
};
pub use messaging::{
    EventEnvelope, EventReceiver, EventSender, InboundMessage, NotificationSource, WorkerMessage,
};
pub use repositories::{DebugFlag, DebugRegistry, GlobalDebugRepository, ScopedDebugRepository};
pub use rudder_core::{RudderError, RudderResult};
