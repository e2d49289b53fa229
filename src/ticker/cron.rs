//! Cron specs accepted in `on.schedule`.
//!
//! Standard 5-field Unix expressions are converted to the 6-field form the
//! `cron` crate wants. `@every <duration>` and the usual `@hourly` style
//! descriptors are accepted too.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::config::parse_duration;

#[derive(Debug, Clone)]
pub enum CronSpec {
    Cron(Box<Schedule>),
    Every(Duration),
}

fn normalize_cron_expr(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

fn descriptor(expr: &str) -> Option<&'static str> {
    match expr {
        "@yearly" | "@annually" => Some("0 0 0 1 1 *"),
        "@monthly" => Some("0 0 0 1 * *"),
        "@weekly" => Some("0 0 0 * * Sun"),
        "@daily" | "@midnight" => Some("0 0 0 * * *"),
        "@hourly" => Some("0 0 * * * *"),
        _ => None,
    }
}

impl CronSpec {
    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CronSpec::Cron(schedule) => schedule.after(&after).next(),
            CronSpec::Every(interval) => {
                chrono::Duration::from_std(*interval).ok().map(|d| after + d)
            }
        }
    }
}

impl FromStr for CronSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let expr = s.trim();
        if let Some(rest) = expr.strip_prefix("@every") {
            let interval = parse_duration(rest.trim())
                .with_context(|| format!("Invalid @every interval in '{}'", s))?;
            if interval.is_zero() {
                bail!("@every interval must be greater than zero");
            }
            return Ok(CronSpec::Every(interval));
        }

        let normalized = match descriptor(expr) {
            Some(fixed) => fixed.to_string(),
            None if expr.starts_with('@') => bail!("Unknown cron descriptor '{}'", expr),
            None => normalize_cron_expr(expr),
        };
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", s, e))?;
        Ok(CronSpec::Cron(Box::new(schedule)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_normalize_cron_expr() {
        assert_eq!(normalize_cron_expr("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron_expr("30  4 * * *"), "0 30 4 * * *");
        assert_eq!(normalize_cron_expr("0 0 * * * *"), "0 0 * * * *");
    }

    #[test]
    fn test_five_field_spec() {
        let spec: CronSpec = "30 4 * * *".parse().unwrap();
        assert_eq!(spec.next_after(at(3, 0)), Some(at(4, 30)));
        assert_eq!(
            spec.next_after(at(4, 30)),
            Some(Utc.with_ymd_and_hms(2026, 3, 11, 4, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_descriptors() {
        let hourly: CronSpec = "@hourly".parse().unwrap();
        assert_eq!(hourly.next_after(at(3, 15)), Some(at(4, 0)));

        let daily: CronSpec = "@daily".parse().unwrap();
        assert_eq!(
            daily.next_after(at(3, 15)),
            Some(Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 0).unwrap())
        );
        assert!("@fortnightly".parse::<CronSpec>().is_err());
    }

    #[test]
    fn test_every() {
        let spec: CronSpec = "@every 90m".parse().unwrap();
        assert_eq!(spec.next_after(at(1, 0)), Some(at(2, 30)));
        assert!("@every 0s".parse::<CronSpec>().is_err());
        assert!("@every soon".parse::<CronSpec>().is_err());
    }

    #[test]
    fn test_invalid() {
        assert!("not a cron".parse::<CronSpec>().is_err());
        assert!("61 * * * *".parse::<CronSpec>().is_err());
    }
}
