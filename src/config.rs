use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TutorError};

pub const APP_DIR: &str = "dash-tutor";
const DEFAULT_DB_NAME: &str = "dash-tutor.db";
const DEFAULT_SKILLS_NAME: &str = "skills.json";
const DEFAULT_CONFIG_NAME: &str = "config.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TutorConfig {
    pub model: ModelConfig,
    pub cascade: CascadeConfig,
    pub recommender: RecommenderConfig,
    pub store: StoreConfig,
}

/// Parameters of the decayed-evidence memory model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Mastery reported for a skill with no attempts.
    pub prior: f64,
    /// Logit offset; sigmoid(bias) is the estimate as evidence vanishes.
    pub bias: f64,
    pub success_gain: f64,
    /// Must lie in (0, 1] so extra successes have diminishing returns.
    pub success_exponent: f64,
    pub failure_gain: f64,
    pub failure_exponent: f64,
    /// Time constant of exp(-dt / tau), in hours.
    pub decay_tau_hours: f64,
    /// Total attempt weight, newest first, that contributes evidence.
    pub window_weight: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            prior: 0.0,
            bias: -1.386,
            success_gain: 3.0,
            success_exponent: 1.0,
            failure_gain: 1.0,
            failure_exponent: 1.0,
            decay_tau_hours: 336.0,
            window_weight: 200.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Weight multiplier applied per level climbed.
    pub attenuation: f64,
    /// Ancestors whose weight would fall below this are left untouched.
    pub min_weight: f64,
    /// Whether incorrect answers also propagate to ancestors.
    pub propagate_failures: bool,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            attenuation: 0.5,
            min_weight: 0.0,
            propagate_failures: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommenderConfig {
    /// M_ready: prerequisites at or above this unlock a skill.
    pub ready_threshold: f64,
    /// M_target: skills at or above this count as mastered.
    pub target_threshold: f64,
    /// Skills at or above this are not offered even for review.
    pub mastery_ceiling: f64,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            ready_threshold: 0.6,
            target_threshold: 0.9,
            mastery_ceiling: 0.95,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 25,
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl ModelConfig {
    /// Highest estimate the model can produce: a full window of fresh
    /// successes and no failures.
    pub fn max_mastery(&self) -> f64 {
        let saturated = (1.0 + self.success_gain * self.window_weight).ln();
        sigmoid(self.bias + self.success_exponent * saturated)
    }
}

fn check(ok: bool, msg: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(TutorError::InvalidConfig(msg.to_string()))
    }
}

impl TutorConfig {
    /// Reads a JSON config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: TutorConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        check((0.0..=1.0).contains(&m.prior), "model.prior must be in [0, 1]")?;
        check(m.bias.is_finite(), "model.bias must be finite")?;
        check(
            m.prior <= sigmoid(m.bias),
            "model.prior must not exceed sigmoid(model.bias)",
        )?;
        check(
            m.success_gain.is_finite() && m.success_gain > 0.0,
            "model.success_gain must be positive",
        )?;
        check(
            m.success_exponent > 0.0 && m.success_exponent <= 1.0,
            "model.success_exponent must be in (0, 1]",
        )?;
        check(
            m.failure_gain.is_finite() && m.failure_gain >= 0.0,
            "model.failure_gain must be non-negative",
        )?;
        check(
            m.failure_exponent.is_finite() && m.failure_exponent >= 0.0,
            "model.failure_exponent must be non-negative",
        )?;
        check(
            m.decay_tau_hours.is_finite() && m.decay_tau_hours > 0.0,
            "model.decay_tau_hours must be positive",
        )?;
        check(
            m.window_weight.is_finite() && m.window_weight > 0.0,
            "model.window_weight must be positive",
        )?;

        let c = &self.cascade;
        check(
            c.attenuation >= 0.0 && c.attenuation <= 1.0,
            "cascade.attenuation must be in [0, 1]",
        )?;
        check(
            (0.0..=1.0).contains(&c.min_weight),
            "cascade.min_weight must be in [0, 1]",
        )?;

        let r = &self.recommender;
        check(
            (0.0..=1.0).contains(&r.ready_threshold),
            "recommender.ready_threshold must be in [0, 1]",
        )?;
        check(
            r.ready_threshold <= r.target_threshold && r.target_threshold <= r.mastery_ceiling,
            "recommender thresholds must satisfy ready <= target <= ceiling",
        )?;
        if r.mastery_ceiling >= m.max_mastery() {
            return Err(TutorError::InvalidConfig(format!(
                "recommender.mastery_ceiling must be below {:.5}, the highest mastery the model reaches",
                m.max_mastery()
            )));
        }
        Ok(())
    }
}

fn app_dir() -> PathBuf {
    let dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR);
    std::fs::create_dir_all(&dir).ok();
    dir
}

fn resolve(explicit: Option<PathBuf>, env_key: &str, default_name: &str) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Ok(path) = std::env::var(env_key) {
        return PathBuf::from(path);
    }
    app_dir().join(default_name)
}

pub fn db_path(explicit: Option<PathBuf>) -> PathBuf {
    resolve(explicit, "DASH_TUTOR_DB", DEFAULT_DB_NAME)
}

pub fn skills_path(explicit: Option<PathBuf>) -> PathBuf {
    resolve(explicit, "DASH_TUTOR_SKILLS", DEFAULT_SKILLS_NAME)
}

pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    resolve(explicit, "DASH_TUTOR_CONFIG", DEFAULT_CONFIG_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TutorConfig::default().validate().expect("defaults should validate");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TutorConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, TutorConfig::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "recommender": { "target_threshold": 0.8 }, "cascade": { "propagate_failures": false } }"#,
        )
        .unwrap();

        let config = TutorConfig::load(&path).unwrap();
        assert_eq!(config.recommender.target_threshold, 0.8);
        assert_eq!(config.recommender.ready_threshold, 0.6);
        assert!(!config.cascade.propagate_failures);
        assert_eq!(config.model, ModelConfig::default());
    }

    #[test]
    fn rejects_success_exponent_above_one() {
        let mut config = TutorConfig::default();
        config.model.success_exponent = 1.5;
        assert!(matches!(
            config.validate(),
            Err(TutorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_prior_above_sigmoid_bias() {
        let mut config = TutorConfig::default();
        config.model.prior = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_misordered_thresholds() {
        let mut config = TutorConfig::default();
        config.recommender.ready_threshold = 0.95;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_ceiling_leaves_headroom_below_model_maximum() {
        let config = TutorConfig::default();
        let max = config.model.max_mastery();
        assert!(max < 1.0);
        assert!(config.recommender.mastery_ceiling < max - 0.02);
    }

    #[test]
    fn rejects_ceiling_the_model_cannot_reach() {
        let mut config = TutorConfig::default();
        config.recommender.mastery_ceiling = 0.995;
        assert!(matches!(
            config.validate(),
            Err(TutorError::InvalidConfig(msg)) if msg.contains("mastery_ceiling")
        ));

        config.recommender.mastery_ceiling = 0.99;
        config.model.window_weight = 10.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_window_weight() {
        let mut config = TutorConfig::default();
        config.model.window_weight = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_file_reports_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(TutorConfig::load(&path), Err(TutorError::Json(_))));
    }

    #[test]
    fn explicit_path_wins() {
        let path = db_path(Some(PathBuf::from("/tmp/explicit.db")));
        assert_eq!(path, PathBuf::from("/tmp/explicit.db"));
    }

    #[test]
    fn default_skills_path_uses_app_dir() {
        std::env::remove_var("DASH_TUTOR_SKILLS");
        let path = skills_path(None);
        assert!(path.ends_with("dash-tutor/skills.json"));
    }
}
