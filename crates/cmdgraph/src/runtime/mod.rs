//! Contexts, queues, command groups and events.

mod context;
pub(crate) mod dispatch;
mod event;
mod handler;
mod queue;

pub use context::{Context, ContextBuilder};
pub use dispatch::SPEC_CONST_ARG_INDEX;
pub use event::{Event, EventStatus};
pub use handler::CommandGroupHandler;
pub use queue::{Queue, QueueId, QueueProperties};
