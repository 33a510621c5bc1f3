//! Next-skill selection over the frontier of unlocked, unmastered skills.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::config::RecommenderConfig;
use crate::error::{Result, TutorError};
use crate::graph::SkillGraph;
use crate::memory::MemoryModel;
use crate::models::{SkillId, StudentProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    /// Prerequisites met, skill itself below the target threshold.
    Frontier,
    /// Nothing on the frontier; revisiting an unlocked skill below the ceiling.
    Review,
}

impl SelectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionReason::Frontier => "frontier",
            SelectionReason::Review => "review",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub skill_id: SkillId,
    pub mastery: f64,
    pub reason: SelectionReason,
    pub last_practiced_at: Option<DateTime<Utc>>,
}

/// A skill's decayed state at a given instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillStatus {
    pub skill_id: SkillId,
    pub mastery: f64,
    pub unlocked: bool,
    pub starter: bool,
    pub last_practiced_at: Option<DateTime<Utc>>,
}

pub struct Recommender<'a> {
    graph: &'a SkillGraph,
    model: &'a MemoryModel,
    config: &'a RecommenderConfig,
}

impl<'a> Recommender<'a> {
    pub fn new(
        graph: &'a SkillGraph,
        model: &'a MemoryModel,
        config: &'a RecommenderConfig,
    ) -> Self {
        Self {
            graph,
            model,
            config,
        }
    }

    pub fn mastery_now(
        &self,
        profile: &StudentProfile,
        skill_id: &str,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        match profile.proficiency(skill_id) {
            Some(p) => match p.last_practiced_at {
                Some(last) => self.model.decay(p.mastery_estimate, last, now),
                None => Ok(p.mastery_estimate),
            },
            None => Ok(self.model.prior()),
        }
    }

    /// Every skill in curriculum order with its mastery decayed to `now`.
    pub fn snapshot(&self, profile: &StudentProfile, now: DateTime<Utc>) -> Result<Vec<SkillStatus>> {
        let mut masteries = Vec::with_capacity(self.graph.len());
        for skill in self.graph.iter() {
            masteries.push(self.mastery_now(profile, &skill.skill_id, now)?);
        }

        let by_id: HashMap<&str, f64> = self
            .graph
            .iter()
            .map(|s| s.skill_id.as_str())
            .zip(masteries.iter().copied())
            .collect();
        let starters: HashSet<&str> = self
            .graph
            .starters()
            .into_iter()
            .map(|s| s.skill_id.as_str())
            .collect();

        let mut statuses = Vec::with_capacity(self.graph.len());
        for (i, skill) in self.graph.iter().enumerate() {
            let unlocked = self
                .graph
                .gating_skills(&skill.skill_id)?
                .into_iter()
                .all(|p| {
                    let m = by_id.get(p).copied().unwrap_or_else(|| self.model.prior());
                    m >= self.config.ready_threshold
                });
            statuses.push(SkillStatus {
                skill_id: skill.skill_id.clone(),
                mastery: masteries[i],
                unlocked,
                starter: starters.contains(skill.skill_id.as_str()),
                last_practiced_at: profile
                    .proficiency(&skill.skill_id)
                    .and_then(|p| p.last_practiced_at),
            });
        }
        Ok(statuses)
    }

    pub fn select(&self, profile: &StudentProfile, now: DateTime<Utc>) -> Result<Recommendation> {
        if self.graph.is_empty() {
            return Err(TutorError::NoEligibleSkill);
        }
        let statuses = self.snapshot(profile, now)?;

        // lowest mastery, then longest since practice (never practiced first), then curriculum order
        let by_need = |a: &&SkillStatus, b: &&SkillStatus| -> Ordering {
            a.mastery
                .total_cmp(&b.mastery)
                .then_with(|| a.last_practiced_at.cmp(&b.last_practiced_at))
        };

        let frontier = statuses
            .iter()
            .filter(|s| s.unlocked && s.mastery < self.config.target_threshold)
            .min_by(by_need);
        if let Some(status) = frontier {
            return Ok(self.recommend(status, SelectionReason::Frontier));
        }

        let review = statuses
            .iter()
            .filter(|s| s.unlocked && s.mastery < self.config.mastery_ceiling)
            .min_by(|a, b| b.starter.cmp(&a.starter).then_with(|| by_need(a, b)));
        match review {
            Some(status) => Ok(self.recommend(status, SelectionReason::Review)),
            None => Err(TutorError::NoEligibleSkill),
        }
    }

    fn recommend(&self, status: &SkillStatus, reason: SelectionReason) -> Recommendation {
        tracing::debug!(
            skill = %status.skill_id,
            mastery = status.mastery,
            reason = reason.as_str(),
            "skill selected"
        );
        Recommendation {
            skill_id: status.skill_id.clone(),
            mastery: status.mastery,
            reason,
            last_practiced_at: status.last_practiced_at,
        }
    }
}
