// src/model/timer.rs
//! Timer descriptors and their scheduling rules

use crate::utils::errors::{Result, RunnerError};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// How often a timer fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fire a single time at the start date
    Once,
    /// Fire repeatedly with a fixed period
    Every { seconds: u64 },
}

/// A validated timer registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSpec {
    pub name: String,
    pub schedule: Schedule,
    pub start: Option<DateTime<Utc>>,
    pub expire: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTimer {
    name: String,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    every_seconds: Option<u64>,
    /// Epoch milliseconds
    #[serde(default)]
    start_date: Option<i64>,
    /// Epoch milliseconds
    #[serde(default)]
    expire: Option<i64>,
}

impl TimerSpec {
    pub fn once(name: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            schedule: Schedule::Once,
            start: Some(start),
            expire: None,
        }
    }

    pub fn every(name: impl Into<String>, seconds: u64) -> Self {
        Self {
            name: name.into(),
            schedule: Schedule::Every { seconds },
            start: None,
            expire: None,
        }
    }

    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_expire(mut self, expire: DateTime<Utc>) -> Self {
        self.expire = Some(expire);
        self
    }

    /// Parse a JSON timer descriptor
    pub fn from_descriptor(text: &str) -> Result<Self> {
        let raw: RawTimer = serde_json::from_str(text).map_err(|e| {
            RunnerError::InvalidRegistration(format!("invalid timer descriptor: {}", e))
        })?;

        let schedule = match raw.schedule.as_deref() {
            Some("once") => Schedule::Once,
            Some("recurring") | None => match raw.every_seconds {
                Some(seconds) => Schedule::Every { seconds },
                None => {
                    return Err(RunnerError::InvalidRegistration(format!(
                        "timer {} has no schedule",
                        raw.name
                    )))
                }
            },
            Some(other) => {
                return Err(RunnerError::InvalidRegistration(format!(
                    "timer {} has unknown schedule: {}",
                    raw.name, other
                )))
            }
        };

        Ok(Self {
            name: raw.name,
            schedule,
            start: raw.start_date.and_then(DateTime::from_timestamp_millis),
            expire: raw.expire.and_then(DateTime::from_timestamp_millis),
        })
    }

    /// Apply the scheduling rules against a reference instant.
    ///
    /// A run-once timer needs a start date, and that date must not already
    /// have passed. An expiration date must lie in the future. A recurring
    /// timer without a start date starts now.
    pub fn validated(mut self, now: DateTime<Utc>) -> Result<Self> {
        if let Some(expire) = self.expire {
            if expire < now {
                return Err(RunnerError::InvalidRegistration(format!(
                    "timer {}: expiration date is in the past",
                    self.name
                )));
            }
        }
        match self.schedule {
            Schedule::Once => match self.start {
                None => {
                    return Err(RunnerError::InvalidRegistration(format!(
                        "timer {}: a run-once schedule requires a start date",
                        self.name
                    )))
                }
                Some(start) if start < now => {
                    return Err(RunnerError::InvalidRegistration(format!(
                        "timer {}: start date is in the past",
                        self.name
                    )))
                }
                Some(_) => {}
            },
            Schedule::Every { seconds } => {
                if seconds == 0 {
                    return Err(RunnerError::InvalidRegistration(format!(
                        "timer {}: period must be at least one second",
                        self.name
                    )));
                }
                if self.start.is_none() {
                    self.start = Some(now);
                }
            }
        }
        Ok(self)
    }
}
