//! Automation Strategies
//! Mission: Calendar-gated periodic evaluation and command emission

pub mod engine;
pub mod models;
pub mod store;

pub use engine::StrategyEngine;
pub use models::{RunOutcome, Strategy, StrategyCalendar, StrategyRun, StrategyTemplate};
pub use store::StrategyStore;
