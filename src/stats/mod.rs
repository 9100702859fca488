//! Statistics Engine
//! Mission: Hour facts and the day/month/year rollup cascade

pub mod aggregate;
pub mod hourly;
pub mod rollup;
pub mod store;
pub mod timekey;

pub use aggregate::{StatisticAggregate, StatisticFact};
pub use hourly::HourlyStatService;
pub use rollup::{RollupOutcome, RollupService};
pub use store::StatisticStore;
pub use timekey::{truncate, Granularity, TimeKey};
