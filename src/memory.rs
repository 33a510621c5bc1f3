//! Decayed-evidence memory model.
//!
//! Each attempt contributes `weight * exp(-dt / tau)` to a success or
//! failure count, with `dt` measured back from the most recent attempt:
//!
//! - theta = bias + a * ln(1 + g_s * S) - b * ln(1 + g_f * F)
//! - m_last = sigmoid(theta), the estimate at the last attempt
//! - m(now) = m_last * exp(-(now - t_last) / tau)
//!
//! With `a <= 1`, sigmoid(theta) is concave in S, so appending a correct
//! attempt can never lower the estimate, and the retention factor makes
//! the estimate non-increasing while the skill is idle. The window is
//! bounded by total weight rather than attempt count: a new attempt of
//! weight w trims at most w of the oldest evidence, so a correct answer of
//! any weight still cannot lower the estimate.

use chrono::{DateTime, Utc};

use crate::config::ModelConfig;
use crate::error::{Result, TutorError};
use crate::models::AttemptRecord;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn hours_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / MILLIS_PER_HOUR
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evidence {
    pub successes: f64,
    pub failures: f64,
}

#[derive(Debug, Clone)]
pub struct MemoryModel {
    config: ModelConfig,
}

impl MemoryModel {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    pub fn prior(&self) -> f64 {
        self.config.prior
    }

    /// Rejects out-of-order or future timestamps and unusable weights.
    pub fn validate_history(history: &[AttemptRecord], now: DateTime<Utc>) -> Result<()> {
        let mut previous: Option<DateTime<Utc>> = None;
        for attempt in history {
            if !attempt.weight.is_finite() || attempt.weight < 0.0 {
                return Err(TutorError::InvalidHistory(format!(
                    "attempt {} on '{}' has weight {}",
                    attempt.seq, attempt.skill_id, attempt.weight
                )));
            }
            if let Some(prev) = previous {
                if attempt.timestamp < prev {
                    return Err(TutorError::InvalidHistory(format!(
                        "attempt {} on '{}' at {} precedes the previous attempt at {}",
                        attempt.seq,
                        attempt.skill_id,
                        attempt.timestamp.to_rfc3339(),
                        prev.to_rfc3339()
                    )));
                }
            }
            previous = Some(attempt.timestamp);
        }
        if let Some(last) = previous {
            if last > now {
                return Err(TutorError::InvalidHistory(format!(
                    "attempt at {} is in the future (now {})",
                    last.to_rfc3339(),
                    now.to_rfc3339()
                )));
            }
        }
        Ok(())
    }

    /// Decayed counts as of the last attempt, newest first, until the
    /// attempts taken hold `window_weight` of raw weight. The attempt that
    /// crosses the limit contributes only the weight that still fits.
    pub fn evidence(&self, history: &[AttemptRecord]) -> Evidence {
        let mut acc = Evidence {
            successes: 0.0,
            failures: 0.0,
        };
        let Some(last) = history.last() else {
            return acc;
        };

        let mut remaining = self.config.window_weight;
        for a in history.iter().rev() {
            if remaining <= 0.0 {
                break;
            }
            let weight = a.weight.min(remaining);
            remaining -= weight;
            let dt = hours_between(a.timestamp, last.timestamp).max(0.0);
            let contribution = weight * (-dt / self.config.decay_tau_hours).exp();
            if a.correct {
                acc.successes += contribution;
            } else {
                acc.failures += contribution;
            }
        }
        acc
    }

    fn link(&self, evidence: Evidence) -> f64 {
        let c = &self.config;
        let theta = c.bias + c.success_exponent * (1.0 + c.success_gain * evidence.successes).ln()
            - c.failure_exponent * (1.0 + c.failure_gain * evidence.failures).ln();
        sigmoid(theta).clamp(0.0, 1.0)
    }

    /// Estimate as of the history's last attempt; the prior for an empty history.
    pub fn estimate_at_last_attempt(&self, history: &[AttemptRecord]) -> Result<f64> {
        let Some(last) = history.last() else {
            return Ok(self.config.prior);
        };
        Self::validate_history(history, last.timestamp)?;
        Ok(self.link(self.evidence(history)))
    }

    pub fn estimate(&self, history: &[AttemptRecord], now: DateTime<Utc>) -> Result<f64> {
        Self::validate_history(history, now)?;
        let Some(last) = history.last() else {
            return Ok(self.config.prior);
        };
        let at_last = self.link(self.evidence(history));
        self.decay(at_last, last.timestamp, now)
    }

    pub fn retention(&self, elapsed_hours: f64) -> f64 {
        (-elapsed_hours.max(0.0) / self.config.decay_tau_hours).exp()
    }

    /// Projects an estimate taken at `last_practiced` forward to `now`.
    pub fn decay(
        &self,
        mastery_at_last: f64,
        last_practiced: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        if last_practiced > now {
            return Err(TutorError::InvalidHistory(format!(
                "last practice at {} is in the future (now {})",
                last_practiced.to_rfc3339(),
                now.to_rfc3339()
            )));
        }
        let elapsed = hours_between(last_practiced, now);
        Ok((mastery_at_last * self.retention(elapsed)).clamp(0.0, 1.0))
    }
}
