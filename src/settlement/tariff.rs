//! Tariff Plans
//! Mission: Fixed and time-of-use pricing keyed by minute-of-day

use crate::errors::CoreError;
use serde::{Deserialize, Serialize};

pub const MINUTES_PER_DAY: u32 = 1440;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TariffMode {
    /// One price all day: a single rule covering `[0, 1440)`.
    Fixed,
    /// Time-of-use: rules partition the day by minute.
    Tou,
}

impl TariffMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TariffMode::Fixed => "fixed",
            TariffMode::Tou => "tou",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "fixed" => Ok(TariffMode::Fixed),
            "tou" => Ok(TariffMode::Tou),
            other => Err(CoreError::validation(format!("unknown tariff mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TariffRule {
    pub start_minute: u32,
    pub end_minute: u32,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TariffPlan {
    pub id: String,
    pub tenant_id: String,
    pub station_id: String,
    /// Month key `YYYYMM` this plan is pinned to; `None` is the station
    /// default used when no month-specific plan exists.
    pub month: Option<String>,
    pub mode: TariffMode,
    pub currency: String,
    pub rules: Vec<TariffRule>,
}

impl TariffPlan {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.rules.is_empty() {
            return Err(CoreError::validation("tariff plan needs at least one rule"));
        }
        match self.mode {
            TariffMode::Fixed => {
                if self.rules.len() != 1
                    || self.rules[0].start_minute != 0
                    || self.rules[0].end_minute != MINUTES_PER_DAY
                {
                    return Err(CoreError::validation(
                        "fixed tariff needs exactly one rule covering [0, 1440)",
                    ));
                }
            }
            TariffMode::Tou => {
                for rule in &self.rules {
                    if rule.start_minute >= rule.end_minute || rule.end_minute > MINUTES_PER_DAY {
                        return Err(CoreError::validation("tou rule window out of range"));
                    }
                }
            }
        }
        if self.rules.iter().any(|r| r.price < 0.0) {
            return Err(CoreError::validation("tariff price must be >= 0"));
        }
        Ok(())
    }

    /// Price at a minute-of-day, or None when no rule covers it.
    pub fn price_at_minute(&self, minute_of_day: u32) -> Option<f64> {
        self.rules
            .iter()
            .find(|r| minute_of_day >= r.start_minute && minute_of_day < r.end_minute)
            .map(|r| r.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(price: f64) -> TariffPlan {
        TariffPlan {
            id: "plan-1".into(),
            tenant_id: "t1".into(),
            station_id: "station-S".into(),
            month: None,
            mode: TariffMode::Fixed,
            currency: "CNY".into(),
            rules: vec![TariffRule {
                start_minute: 0,
                end_minute: MINUTES_PER_DAY,
                price,
            }],
        }
    }

    #[test]
    fn test_fixed_plan_covers_every_minute() {
        let plan = fixed(1.2);
        assert!(plan.validate().is_ok());
        assert_eq!(plan.price_at_minute(0), Some(1.2));
        assert_eq!(plan.price_at_minute(720), Some(1.2));
        assert_eq!(plan.price_at_minute(1439), Some(1.2));
    }

    #[test]
    fn test_fixed_plan_rejects_partial_coverage() {
        let mut plan = fixed(1.2);
        plan.rules[0].end_minute = 720;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_tou_plan_selects_by_minute() {
        let plan = TariffPlan {
            mode: TariffMode::Tou,
            rules: vec![
                TariffRule {
                    start_minute: 0,
                    end_minute: 480,
                    price: 0.3,
                },
                TariffRule {
                    start_minute: 480,
                    end_minute: 1320,
                    price: 1.1,
                },
                TariffRule {
                    start_minute: 1320,
                    end_minute: 1440,
                    price: 0.5,
                },
            ],
            ..fixed(0.0)
        };
        assert!(plan.validate().is_ok());
        assert_eq!(plan.price_at_minute(479), Some(0.3));
        assert_eq!(plan.price_at_minute(480), Some(1.1));
        assert_eq!(plan.price_at_minute(1339), Some(0.5));

        // Gaps are legal in tou mode; uncovered minutes price as None.
        let sparse = TariffPlan {
            mode: TariffMode::Tou,
            rules: vec![TariffRule {
                start_minute: 600,
                end_minute: 660,
                price: 2.0,
            }],
            ..fixed(0.0)
        };
        assert_eq!(sparse.price_at_minute(0), None);
    }
}
