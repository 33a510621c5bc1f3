//! Applies a graded attempt to the answered skills and credits their
//! ancestors with attenuated copies of the same outcome.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::config::CascadeConfig;
use crate::error::{Result, TutorError};
use crate::graph::SkillGraph;
use crate::memory::MemoryModel;
use crate::models::{
    AttemptOutcome, AttemptRecord, GradedAttempt, SkillId, SkillProficiency, StudentProfile,
};

#[derive(Debug, Clone, PartialEq)]
pub struct CascadeStep {
    pub skill_id: SkillId,
    pub weight: f64,
    pub distance: u32,
}

pub struct CascadeUpdater<'a> {
    graph: &'a SkillGraph,
    model: &'a MemoryModel,
    config: &'a CascadeConfig,
}

impl<'a> CascadeUpdater<'a> {
    pub fn new(graph: &'a SkillGraph, model: &'a MemoryModel, config: &'a CascadeConfig) -> Self {
        Self {
            graph,
            model,
            config,
        }
    }

    fn validate(&self, attempt: &GradedAttempt) -> Result<()> {
        if attempt.skill_ids.is_empty() {
            return Err(TutorError::InvalidAttempt(
                "attempt names no skills".to_string(),
            ));
        }
        let rt = attempt.response_time_seconds;
        if !rt.is_finite() || rt < 0.0 {
            return Err(TutorError::InvalidAttempt(format!(
                "response time {} is not a non-negative number of seconds",
                rt
            )));
        }
        for skill_id in &attempt.skill_ids {
            if !self.graph.contains(skill_id) {
                return Err(TutorError::UnknownSkill(skill_id.clone()));
            }
        }
        Ok(())
    }

    /// Skills touched by an attempt: targets first, then ancestors, each once.
    pub fn plan(&self, attempt: &GradedAttempt) -> Result<Vec<CascadeStep>> {
        self.validate(attempt)?;

        let mut steps: Vec<CascadeStep> = Vec::new();
        let mut seen: HashMap<SkillId, usize> = HashMap::new();

        for skill_id in &attempt.skill_ids {
            if seen.contains_key(skill_id) {
                continue;
            }
            seen.insert(skill_id.clone(), steps.len());
            steps.push(CascadeStep {
                skill_id: skill_id.clone(),
                weight: 1.0,
                distance: 0,
            });
        }

        if !attempt.correct && !self.config.propagate_failures {
            return Ok(steps);
        }

        for skill_id in &attempt.skill_ids {
            let mut weight = 1.0;
            for (level, ancestor) in self.graph.get_ancestors(skill_id)?.into_iter().enumerate() {
                weight *= self.config.attenuation;
                if weight <= 0.0 || weight < self.config.min_weight {
                    break;
                }
                let distance = level as u32 + 1;
                match seen.get(ancestor) {
                    Some(&i) => {
                        // nearer paths win; answered skills keep their direct update
                        if steps[i].distance > distance {
                            steps[i].weight = weight;
                            steps[i].distance = distance;
                        }
                    }
                    None => {
                        seen.insert(ancestor.to_string(), steps.len());
                        steps.push(CascadeStep {
                            skill_id: ancestor.to_string(),
                            weight,
                            distance,
                        });
                    }
                }
            }
        }

        Ok(steps)
    }

    /// All-or-nothing: on error `profile` is left exactly as it was.
    pub fn apply(
        &self,
        profile: &mut StudentProfile,
        attempt: &GradedAttempt,
        at: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        let steps = self.plan(attempt)?;
        let mut working = profile.proficiency_by_skill.clone();

        for step in &steps {
            let proficiency = working
                .entry(step.skill_id.clone())
                .or_insert_with(|| SkillProficiency::new(step.skill_id.clone(), self.model.prior()));

            let record = AttemptRecord {
                skill_id: step.skill_id.clone(),
                seq: proficiency.next_seq(),
                correct: attempt.correct,
                timestamp: at,
                response_time_seconds: attempt.response_time_seconds,
                weight: step.weight,
                distance: step.distance,
            };
            proficiency.attempts.push(record);
            proficiency.mastery_estimate = self.model.estimate_at_last_attempt(&proficiency.attempts)?;
            proficiency.last_practiced_at = Some(at);

            tracing::trace!(
                skill = %step.skill_id,
                weight = step.weight,
                distance = step.distance,
                mastery = proficiency.mastery_estimate,
                "cascade step applied"
            );
        }

        let primary = &attempt.skill_ids[0];
        let (current_streak, primary_mastery) = working
            .get(primary)
            .map(|p| (p.current_streak(), p.mastery_estimate))
            .unwrap_or((0, self.model.prior()));

        profile.proficiency_by_skill = working;

        Ok(AttemptOutcome {
            affected_skill_count: steps.len(),
            current_streak,
            primary_mastery,
        })
    }
}
