//! Command Pipeline
//! Mission: Idempotent issuance, device dispatch, reconciliation, timeouts

pub mod consumer;
pub mod gateway;
pub mod models;
pub mod service;
pub mod store;

pub use consumer::CommandDispatchConsumer;
pub use gateway::{DeviceInvokeResult, DeviceInvokeStatus, DeviceRpc, HttpDeviceGateway};
pub use models::{Command, CommandStatus, IssueCommandRequest};
pub use service::{derive_idempotency_key, CommandService, TimeoutSweeper};
pub use store::CommandStore;
