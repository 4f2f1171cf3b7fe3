use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use std::str::FromStr;

/// Cron schedule for pepper rotation.
///
/// Accepts classic 5-field expressions (`min hour dom month dow`) as well as
/// the 6/7-field form with leading seconds (and trailing year).
#[derive(Debug, Clone)]
pub struct PepperSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl PepperSchedule {
    pub fn parse(expr: &str) -> anyhow::Result<Self> {
        let expr = expr.trim();
        let normalized = match expr.split_whitespace().count() {
            5 => format!("0 {expr}"),
            6 | 7 => expr.to_string(),
            n => bail!("cron expression `{expr}` has {n} fields, expected 5, 6 or 7"),
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .with_context(|| format!("invalid cron expression `{expr}`"))?;
        Ok(Self {
            expr: expr.to_string(),
            schedule,
        })
    }

    /// Next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }
}

impl std::fmt::Display for PepperSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn five_field_expression_fires_on_the_minute() {
        let schedule = PepperSchedule::parse("9 1 * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let next = schedule.next_after(start).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (1, 9, 0));
        assert_eq!(schedule.to_string(), "9 1 * * *");

        let after = schedule.next_after(next).unwrap();
        assert_eq!(after - next, chrono::Duration::days(1));
    }

    #[test]
    fn six_field_expression_passes_through() {
        let schedule = PepperSchedule::parse("*/2 * * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 1).unwrap();
        assert_eq!(schedule.next_after(start).unwrap().second(), 2);
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(PepperSchedule::parse("").is_err());
        assert!(PepperSchedule::parse("* *").is_err());
        assert!(PepperSchedule::parse("61 1 * * *").is_err());
    }
}
