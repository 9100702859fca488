//! Statistic Aggregates
//! Mission: The fact quad and its completion lifecycle
//!
//! HOUR aggregates are the sole fact source; coarser granularities are
//! derivations and never accept external facts.

use crate::errors::CoreError;
use crate::stats::timekey::{Granularity, TimeKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatisticFact {
    pub charge_kwh: f64,
    pub discharge_kwh: f64,
    pub earnings: f64,
    pub carbon_reduction: f64,
}

impl StatisticFact {
    pub fn add(&mut self, other: &StatisticFact) {
        self.charge_kwh += other.charge_kwh;
        self.discharge_kwh += other.discharge_kwh;
        self.earnings += other.earnings;
        self.carbon_reduction += other.carbon_reduction;
    }

    /// Total throughput the settlement layer prices.
    pub fn energy_kwh(&self) -> f64 {
        self.charge_kwh + self.discharge_kwh
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let fields = [
            self.charge_kwh,
            self.discharge_kwh,
            self.earnings,
            self.carbon_reduction,
        ];
        if fields.iter().any(|v| *v < 0.0 || !v.is_finite()) {
            return Err(CoreError::validation("fact fields must be finite and >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticAggregate {
    pub subject_id: String,
    pub time_type: Granularity,
    pub time_key: String,
    pub period_start: DateTime<Utc>,
    pub statistic_id: String,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub fact: StatisticFact,
}

impl StatisticAggregate {
    /// Fresh, incomplete aggregate for the period enclosing `t`.
    pub fn new(subject_id: &str, granularity: Granularity, t: DateTime<Utc>) -> Self {
        let key = TimeKey::new(granularity, t);
        Self {
            subject_id: subject_id.to_string(),
            time_type: granularity,
            statistic_id: format!("{}:{}", granularity.as_str(), key.key),
            time_key: key.key,
            period_start: key.period_start,
            is_completed: false,
            completed_at: None,
            fact: StatisticFact::default(),
        }
    }

    /// Freeze the aggregate with its final fact.
    pub fn complete(&mut self, fact: StatisticFact, now: DateTime<Utc>) -> Result<(), CoreError> {
        fact.validate()?;
        self.fact = fact;
        self.is_completed = true;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn key(&self) -> TimeKey {
        TimeKey::new(self.time_type, self.period_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_deterministic_statistic_id() {
        let t = Utc.with_ymd_and_hms(2026, 8, 1, 13, 45, 0).unwrap();
        let agg = StatisticAggregate::new("station-S", Granularity::Hour, t);
        assert_eq!(agg.statistic_id, "HOUR:20260801T13");
        assert_eq!(agg.time_key, "20260801T13");
        assert_eq!(
            agg.period_start,
            Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap()
        );
        assert!(!agg.is_completed);
    }

    #[test]
    fn test_complete_freezes_fact() {
        let t = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();
        let mut agg = StatisticAggregate::new("station-S", Granularity::Hour, t);
        let fact = StatisticFact {
            charge_kwh: 1.0,
            discharge_kwh: 2.0,
            earnings: 0.1,
            carbon_reduction: 0.01,
        };
        agg.complete(fact, t + chrono::Duration::minutes(5)).unwrap();
        assert!(agg.is_completed);
        assert_eq!(agg.completed_at, Some(t + chrono::Duration::minutes(5)));
        assert_eq!(agg.fact.energy_kwh(), 3.0);
    }

    #[test]
    fn test_negative_fact_rejected() {
        let t = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();
        let mut agg = StatisticAggregate::new("station-S", Granularity::Hour, t);
        let bad = StatisticFact {
            charge_kwh: -1.0,
            ..Default::default()
        };
        assert!(agg.complete(bad, t).is_err());
    }

    #[test]
    fn test_fact_sum() {
        let mut total = StatisticFact::default();
        for _ in 0..24 {
            total.add(&StatisticFact {
                charge_kwh: 1.0,
                discharge_kwh: 2.0,
                earnings: 0.1,
                carbon_reduction: 0.01,
            });
        }
        assert_eq!(total.charge_kwh, 24.0);
        assert_eq!(total.discharge_kwh, 48.0);
        assert!((total.earnings - 2.4).abs() < 1e-9);
        assert!((total.carbon_reduction - 0.24).abs() < 1e-9);
    }
}
