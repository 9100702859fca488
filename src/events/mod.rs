//! Event Backbone
//! Mission: Transactional publish, at-least-once delivery, idempotent
//! consumption, dead-lettering

pub mod bus;
pub mod dispatcher;
pub mod envelope;
pub mod outbox;
pub mod payloads;
pub mod processed;
pub mod registry;

pub use bus::{EventContext, EventHandler, InProcessBus, Subscriber};
pub use dispatcher::{wrap_handler, DispatchResult, Dispatcher};
pub use envelope::{EventEnvelope, EventMeta, EventPayloadKind};
pub use outbox::{OutboxStatus, OutboxStore};
pub use processed::{DeadLetterStore, ProcessedStore};
pub use registry::{EventPayload, EventRegistry};
