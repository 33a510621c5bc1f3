use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type SkillId = String;

/// One graded answer, or an attenuated copy of it credited to an ancestor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub skill_id: SkillId,
    /// Position in this skill's history, starting at 0.
    pub seq: u32,
    pub correct: bool,
    pub timestamp: DateTime<Utc>,
    pub response_time_seconds: f64,
    /// Evidence weight: 1.0 for the answered skill, attenuated for ancestors.
    pub weight: f64,
    /// Hierarchy levels between this skill and the answered one.
    pub distance: u32,
}

impl AttemptRecord {
    pub fn is_direct(&self) -> bool {
        self.distance == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillProficiency {
    pub skill_id: SkillId,
    /// Memory model output evaluated at `last_practiced_at`.
    pub mastery_estimate: f64,
    pub attempts: Vec<AttemptRecord>,
    pub last_practiced_at: Option<DateTime<Utc>>,
}

impl SkillProficiency {
    pub fn new(skill_id: impl Into<SkillId>, prior: f64) -> Self {
        Self {
            skill_id: skill_id.into(),
            mastery_estimate: prior,
            attempts: Vec::new(),
            last_practiced_at: None,
        }
    }

    pub fn next_seq(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Trailing run of correct answers given directly on this skill.
    pub fn current_streak(&self) -> u32 {
        self.attempts
            .iter()
            .rev()
            .filter(|a| a.is_direct())
            .take_while(|a| a.correct)
            .count() as u32
    }

    pub fn times_answered(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_direct()).count()
    }

    pub fn times_correct(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.is_direct() && a.correct)
            .count()
    }

    pub fn success_rate(&self) -> f64 {
        let answered = self.times_answered();
        if answered == 0 {
            0.0
        } else {
            (self.times_correct() as f64 / answered as f64) * 100.0
        }
    }
}

pub fn mastery_label(mastery: f64) -> &'static str {
    match mastery {
        m if m >= 0.9 => "Mastered",
        m if m >= 0.75 => "Proficient",
        m if m >= 0.6 => "Ready",
        m if m >= 0.3 => "Learning",
        m if m > 0.0 => "Started",
        _ => "New",
    }
}

/// Aggregate root for everything the engine knows about one student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub user_id: String,
    pub age: Option<u32>,
    pub grade_level: Option<String>,
    pub notes: Option<String>,
    /// Only skills practiced at least once; absent skills sit at the prior.
    pub proficiency_by_skill: BTreeMap<SkillId, SkillProficiency>,
    /// Optimistic concurrency token; 0 means never persisted.
    pub version: u64,
}

impl StudentProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            age: None,
            grade_level: None,
            notes: None,
            proficiency_by_skill: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn is_new(&self) -> bool {
        self.version == 0
    }

    pub fn proficiency(&self, skill_id: &str) -> Option<&SkillProficiency> {
        self.proficiency_by_skill.get(skill_id)
    }

    pub fn total_answers(&self) -> usize {
        self.proficiency_by_skill
            .values()
            .map(SkillProficiency::times_answered)
            .sum()
    }
}

/// A grading event handed over by the question layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradedAttempt {
    pub skill_ids: Vec<SkillId>,
    pub correct: bool,
    pub response_time_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptOutcome {
    pub affected_skill_count: usize,
    /// Consecutive correct answers on the first listed skill.
    pub current_streak: u32,
    pub primary_mastery: f64,
}

// JSON output wrapper for CLI
#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
