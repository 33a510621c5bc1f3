//! The two entry points collaborators call: record a graded attempt and ask
//! for the next skill. Writes for one student are serialized by a per-student
//! lock; reads go straight to the store and may be one update behind.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cascade::CascadeUpdater;
use crate::config::TutorConfig;
use crate::db::ProficiencyStore;
use crate::error::{Result, TutorError};
use crate::graph::SkillGraph;
use crate::memory::MemoryModel;
use crate::models::{AttemptOutcome, GradedAttempt, SkillId, StudentProfile};
use crate::recommender::{Recommendation, Recommender, SkillStatus};

pub struct Tutor {
    graph: SkillGraph,
    store: ProficiencyStore,
    model: MemoryModel,
    config: TutorConfig,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Optional demographic changes; `None` leaves a field as stored.
#[derive(Debug, Clone, Default)]
pub struct StudentUpdate {
    pub age: Option<u32>,
    pub grade_level: Option<String>,
    pub notes: Option<String>,
}

fn latest_practice(profile: &StudentProfile) -> Option<DateTime<Utc>> {
    profile
        .proficiency_by_skill
        .values()
        .filter_map(|p| p.last_practiced_at)
        .max()
}

// The wall clock can step backwards; history must not.
fn clamp_to_history(profile: &StudentProfile, now: DateTime<Utc>) -> DateTime<Utc> {
    match latest_practice(profile) {
        Some(latest) if latest > now => {
            tracing::debug!(
                user = %profile.user_id,
                now = %now.to_rfc3339(),
                latest = %latest.to_rfc3339(),
                "clock behind stored history, clamping"
            );
            latest
        }
        _ => now,
    }
}

impl Tutor {
    pub fn new(graph: SkillGraph, store: ProficiencyStore, config: TutorConfig) -> Result<Self> {
        config.validate()?;
        store.init()?;
        Ok(Self {
            model: MemoryModel::new(config.model.clone()),
            graph,
            store,
            config,
            user_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn graph(&self) -> &SkillGraph {
        &self.graph
    }

    pub fn store(&self) -> &ProficiencyStore {
        &self.store
    }

    pub fn model(&self) -> &MemoryModel {
        &self.model
    }

    pub fn config(&self) -> &TutorConfig {
        &self.config
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.user_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` holding the student's write lock. The entry is dropped from
    /// the table once no other caller holds or waits on it.
    fn with_user_lock<T>(&self, user_id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self
            .lock_table()
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _held = lock.lock().unwrap_or_else(|p| p.into_inner());
            f()
        };

        // clones are only taken under the table lock, so the count is stable here
        let mut table = self.lock_table();
        if Arc::strong_count(&lock) == 2 {
            table.remove(user_id);
        }
        result
    }

    fn recommender(&self) -> Recommender<'_> {
        Recommender::new(&self.graph, &self.model, &self.config.recommender)
    }

    /// Records an attempt stamped with the current time.
    pub fn record_attempt(
        &self,
        user_id: &str,
        skill_ids: &[SkillId],
        correct: bool,
        response_time_seconds: f64,
    ) -> Result<AttemptOutcome> {
        let attempt = GradedAttempt {
            skill_ids: skill_ids.to_vec(),
            correct,
            response_time_seconds,
        };
        self.record(user_id, &attempt, None)
    }

    /// Records an attempt at an explicit time; it must not precede stored history.
    pub fn record_attempt_at(
        &self,
        user_id: &str,
        skill_ids: &[SkillId],
        correct: bool,
        response_time_seconds: f64,
        at: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        let attempt = GradedAttempt {
            skill_ids: skill_ids.to_vec(),
            correct,
            response_time_seconds,
        };
        self.record(user_id, &attempt, Some(at))
    }

    fn record(
        &self,
        user_id: &str,
        attempt: &GradedAttempt,
        at: Option<DateTime<Utc>>,
    ) -> Result<AttemptOutcome> {
        let updater = CascadeUpdater::new(&self.graph, &self.model, &self.config.cascade);
        // reject bad input before touching storage
        updater.plan(attempt)?;

        self.with_user_lock(user_id, || self.apply_and_save(user_id, &updater, attempt, at))
    }

    fn apply_and_save(
        &self,
        user_id: &str,
        updater: &CascadeUpdater<'_>,
        attempt: &GradedAttempt,
        at: Option<DateTime<Utc>>,
    ) -> Result<AttemptOutcome> {
        // Another process sharing the database can still win the race.
        let mut tries: u32 = 0;
        loop {
            tries += 1;
            let mut profile = self.store.load(user_id)?;
            let at = at.unwrap_or_else(|| clamp_to_history(&profile, Utc::now()));

            let outcome = updater.apply(&mut profile, attempt, at)?;
            match self.store.save(&profile) {
                Ok(version) => {
                    tracing::info!(
                        user = %user_id,
                        skills = ?attempt.skill_ids,
                        correct = attempt.correct,
                        affected = outcome.affected_skill_count,
                        version,
                        "attempt recorded"
                    );
                    return Ok(outcome);
                }
                Err(TutorError::Conflict(_)) if tries <= self.config.store.max_retries => {
                    tracing::warn!(user = %user_id, tries, "profile changed underneath, reapplying");
                }
                Err(e) => {
                    tracing::error!(user = %user_id, error = %e, "attempt not recorded");
                    return Err(e);
                }
            }
        }
    }

    /// Changes profile attributes; proficiencies are untouched.
    pub fn update_student(&self, user_id: &str, update: StudentUpdate) -> Result<StudentProfile> {
        self.with_user_lock(user_id, || {
            let mut profile = self.store.load(user_id)?;
            if update.age.is_some() {
                profile.age = update.age;
            }
            if update.grade_level.is_some() {
                profile.grade_level = update.grade_level;
            }
            if update.notes.is_some() {
                profile.notes = update.notes;
            }
            profile.version = self.store.save(&profile)?;
            Ok(profile)
        })
    }

    pub fn profile(&self, user_id: &str) -> Result<StudentProfile> {
        self.store.load(user_id)
    }

    pub fn recommend(&self, user_id: &str, now: DateTime<Utc>) -> Result<Recommendation> {
        let profile = self.store.load(user_id)?;
        self.recommender().select(&profile, now)
    }

    pub fn recommend_next_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<SkillId> {
        self.recommend(user_id, now).map(|r| r.skill_id)
    }

    /// Recommendation as of the current time.
    pub fn recommend_now(&self, user_id: &str) -> Result<Recommendation> {
        let profile = self.store.load(user_id)?;
        let now = clamp_to_history(&profile, Utc::now());
        self.recommender().select(&profile, now)
    }

    /// `NoEligibleSkill` here means the curriculum is complete.
    pub fn recommend_next(&self, user_id: &str) -> Result<SkillId> {
        self.recommend_now(user_id).map(|r| r.skill_id)
    }

    /// Every skill with the student's mastery decayed to `now`.
    pub fn skill_statuses(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<SkillStatus>> {
        let profile = self.store.load(user_id)?;
        let now = clamp_to_history(&profile, now);
        self.recommender().snapshot(&profile, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::graph::Skill;
    use crate::models::SkillProficiency;
    use chrono::{Duration, TimeZone};
    use std::thread;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 8, 0, 0).unwrap()
    }

    fn ids(skills: &[&str]) -> Vec<SkillId> {
        skills.iter().map(|s| s.to_string()).collect()
    }

    fn arithmetic() -> SkillGraph {
        let mut subtract = Skill::new("math_1.subtract", None);
        subtract.prerequisites = ids(&["math_1.add"]);
        SkillGraph::new(vec![Skill::new("math_1.add", None), subtract]).unwrap()
    }

    fn fractions() -> SkillGraph {
        SkillGraph::new(vec![
            Skill::new("math_8", None),
            Skill::new("math_8_1", Some("math_8")),
            Skill::new("math_8_1.1", Some("math_8_1")),
            Skill::new("math_8_1.2", Some("math_8_1")),
        ])
        .unwrap()
    }

    fn memory_tutor(graph: SkillGraph) -> Tutor {
        let store = ProficiencyStore::open_in_memory(StoreConfig::default()).unwrap();
        Tutor::new(graph, store, TutorConfig::default()).unwrap()
    }

    fn seed(tutor: &Tutor, user: &str, skill: &str, mastery: f64, at: DateTime<Utc>) {
        let mut profile = tutor.profile(user).unwrap();
        let mut p = SkillProficiency::new(skill, 0.0);
        p.mastery_estimate = mastery;
        p.last_practiced_at = Some(at);
        profile.proficiency_by_skill.insert(skill.to_string(), p);
        tutor.store().save(&profile).unwrap();
    }

    mod scenario_tests {
        use super::*;

        #[test]
        fn new_student_starts_at_root() {
            let tutor = memory_tutor(arithmetic());
            assert_eq!(tutor.recommend_next("fresh").unwrap(), "math_1.add");
        }

        #[test]
        fn five_correct_answers_build_a_streak() {
            let tutor = memory_tutor(arithmetic());
            let mut last = tutor.model().prior();
            let mut outcome = None;
            for _ in 0..5 {
                let o = tutor
                    .record_attempt_at("u1", &ids(&["math_1.add"]), true, 4.0, t0())
                    .unwrap();
                assert!(o.primary_mastery > last);
                last = o.primary_mastery;
                outcome = Some(o);
            }
            let outcome = outcome.unwrap();
            assert_eq!(outcome.current_streak, 5);
            assert_eq!(outcome.affected_skill_count, 1);

            let stored = tutor.profile("u1").unwrap();
            assert_eq!(stored.version, 5);
            assert_eq!(stored.proficiency("math_1.add").unwrap().mastery_estimate, last);
        }

        #[test]
        fn mastered_prerequisite_unlocks_dependent() {
            let tutor = memory_tutor(arithmetic());
            seed(&tutor, "u1", "math_1.add", 0.95, t0());
            assert_eq!(tutor.recommend_next_at("u1", t0()).unwrap(), "math_1.subtract");
        }

        #[test]
        fn fully_mastered_single_skill_is_terminal() {
            let tutor = memory_tutor(SkillGraph::new(vec![Skill::new("math_1.add", None)]).unwrap());
            seed(&tutor, "u1", "math_1.add", 1.0, t0());
            let err = tutor.recommend_next_at("u1", t0()).unwrap_err();
            assert!(err.is_curriculum_complete());
        }

        #[test]
        fn hourly_practice_completes_a_single_skill_curriculum() {
            let tutor = memory_tutor(SkillGraph::new(vec![Skill::new("math_1.add", None)]).unwrap());
            let mut at = t0();
            let mut completed_after = None;
            for n in 1..=60 {
                tutor
                    .record_attempt_at("u1", &ids(&["math_1.add"]), true, 4.0, at)
                    .unwrap();
                if let Err(e) = tutor.recommend_next_at("u1", at) {
                    assert!(e.is_curriculum_complete());
                    completed_after = Some(n);
                    break;
                }
                at += Duration::hours(1);
            }
            let n = completed_after.expect("curriculum never completed");
            assert!(n <= 40, "needed {} attempts", n);

            // a day away drops it back under the ceiling
            let rec = tutor.recommend("u1", at + Duration::days(1)).unwrap();
            assert_eq!(rec.skill_id, "math_1.add");
        }

        #[test]
        fn practice_moves_student_along_the_frontier() {
            let tutor = memory_tutor(arithmetic());
            for _ in 0..12 {
                tutor
                    .record_attempt_at("u1", &ids(&["math_1.add"]), true, 3.0, t0())
                    .unwrap();
            }
            let rec = tutor.recommend("u1", t0()).unwrap();
            assert_eq!(rec.skill_id, "math_1.subtract");
        }
    }

    mod write_tests {
        use super::*;

        #[test]
        fn cascade_reaches_every_ancestor() {
            let tutor = memory_tutor(fractions());
            let outcome = tutor
                .record_attempt_at("u1", &ids(&["math_8_1.1"]), true, 9.0, t0())
                .unwrap();
            assert_eq!(outcome.affected_skill_count, 3);

            let profile = tutor.profile("u1").unwrap();
            let leaf = profile.proficiency("math_8_1.1").unwrap().mastery_estimate;
            let parent = profile.proficiency("math_8_1").unwrap().mastery_estimate;
            let root = profile.proficiency("math_8").unwrap().mastery_estimate;
            assert!(leaf > parent && parent > root && root > 0.0);
            assert!(profile.proficiency("math_8_1.2").is_none());
        }

        #[test]
        fn unknown_skill_persists_nothing() {
            let tutor = memory_tutor(fractions());
            let err = tutor
                .record_attempt_at("u1", &ids(&["math_8_1.1", "ghost"]), true, 2.0, t0())
                .unwrap_err();
            assert!(matches!(err, TutorError::UnknownSkill(_)));
            assert!(tutor.store().list_students().unwrap().is_empty());
        }

        #[test]
        fn out_of_order_explicit_time_is_rejected() {
            let tutor = memory_tutor(arithmetic());
            tutor
                .record_attempt_at("u1", &ids(&["math_1.add"]), true, 2.0, t0())
                .unwrap();
            let err = tutor
                .record_attempt_at("u1", &ids(&["math_1.add"]), true, 2.0, t0() - Duration::hours(1))
                .unwrap_err();
            assert!(matches!(err, TutorError::InvalidHistory(_)));
            assert_eq!(tutor.profile("u1").unwrap().version, 1);
        }

        #[test]
        fn wall_clock_attempts_after_future_history_are_clamped() {
            let tutor = memory_tutor(arithmetic());
            let ahead = Utc::now() + Duration::hours(2);
            tutor
                .record_attempt_at("u1", &ids(&["math_1.add"]), true, 2.0, ahead)
                .unwrap();
            tutor.record_attempt("u1", &ids(&["math_1.add"]), true, 2.0).unwrap();

            let profile = tutor.profile("u1").unwrap();
            let attempts = &profile.proficiency("math_1.add").unwrap().attempts;
            assert_eq!(attempts.len(), 2);
            assert_eq!(attempts[1].timestamp, ahead);
            assert!(tutor.recommend_next("u1").is_ok());
        }

        #[test]
        fn failure_mid_cascade_leaves_no_trace() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("tutor.db");
            let store = ProficiencyStore::open(&path, StoreConfig::default()).unwrap();
            let tutor = Tutor::new(fractions(), store, TutorConfig::default()).unwrap();

            tutor
                .record_attempt_at("u1", &ids(&["math_8_1.2"]), true, 5.0, t0())
                .unwrap();
            let before = tutor.profile("u1").unwrap();

            // rows are written in key order, so both ancestors land before the leaf fails
            let side = rusqlite::Connection::open(&path).unwrap();
            side.execute_batch(
                r#"
                CREATE TRIGGER fail_on_leaf BEFORE INSERT ON attempts
                WHEN NEW.skill_id = 'math_8_1.1'
                BEGIN SELECT RAISE(ABORT, 'injected failure'); END;
                "#,
            )
            .unwrap();
            drop(side);

            let later = t0() + Duration::minutes(1);
            let result = tutor.record_attempt_at("u1", &ids(&["math_8_1.1"]), true, 5.0, later);
            assert!(matches!(result, Err(TutorError::Storage(_))));

            let after = tutor.profile("u1").unwrap();
            assert_eq!(after, before);
            assert!(after.proficiency("math_8_1.1").is_none());
        }

        #[test]
        fn update_student_keeps_proficiencies() {
            let tutor = memory_tutor(arithmetic());
            tutor
                .record_attempt_at("u1", &ids(&["math_1.add"]), false, 12.0, t0())
                .unwrap();
            let profile = tutor
                .update_student(
                    "u1",
                    StudentUpdate {
                        age: Some(7),
                        grade_level: Some("2".to_string()),
                        notes: None,
                    },
                )
                .unwrap();
            assert_eq!(profile.version, 2);

            let stored = tutor.profile("u1").unwrap();
            assert_eq!(stored.age, Some(7));
            assert_eq!(stored.grade_level.as_deref(), Some("2"));
            assert_eq!(stored.total_answers(), 1);
        }
    }

    mod concurrency_tests {
        use super::*;

        fn file_tutor(dir: &tempfile::TempDir, graph: SkillGraph) -> Tutor {
            let store =
                ProficiencyStore::open(dir.path().join("tutor.db"), StoreConfig::default()).unwrap();
            Tutor::new(graph, store, TutorConfig::default()).unwrap()
        }

        #[test]
        fn concurrent_attempts_for_one_student_are_all_kept() {
            let dir = tempfile::tempdir().unwrap();
            let tutor = Arc::new(file_tutor(&dir, fractions()));
            let threads = 8;
            let per_thread = 5;

            let handles: Vec<_> = (0..threads)
                .map(|i| {
                    let tutor = Arc::clone(&tutor);
                    thread::spawn(move || {
                        for _ in 0..per_thread {
                            tutor
                                .record_attempt("u1", &ids(&["math_8_1.1"]), i % 2 == 0, 3.0)
                                .unwrap();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let profile = tutor.profile("u1").unwrap();
            let total = threads * per_thread;
            assert_eq!(profile.version, total as u64);
            assert_eq!(profile.proficiency("math_8_1.1").unwrap().attempts.len(), total);
            assert_eq!(profile.proficiency("math_8").unwrap().attempts.len(), total);
        }

        #[test]
        fn different_students_proceed_independently() {
            let dir = tempfile::tempdir().unwrap();
            let tutor = Arc::new(file_tutor(&dir, arithmetic()));

            let handles: Vec<_> = ["ana", "ben", "cai", "dev"]
                .into_iter()
                .map(|user| {
                    let tutor = Arc::clone(&tutor);
                    thread::spawn(move || {
                        for _ in 0..4 {
                            tutor.record_attempt(user, &ids(&["math_1.add"]), true, 1.0).unwrap();
                            tutor.recommend_next(user).unwrap();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let students = tutor.store().list_students().unwrap();
            assert_eq!(students.len(), 4);
            assert_eq!(tutor.store().get_stats().unwrap().total_answers, 16);
        }

        #[test]
        fn lock_table_is_empty_after_writes() {
            let dir = tempfile::tempdir().unwrap();
            let tutor = Arc::new(file_tutor(&dir, arithmetic()));

            tutor.record_attempt("solo", &ids(&["math_1.add"]), true, 1.0).unwrap();
            tutor.update_student("solo", StudentUpdate::default()).unwrap();
            assert!(tutor.lock_table().is_empty());

            let handles: Vec<_> = (0..6)
                .map(|i| {
                    let tutor = Arc::clone(&tutor);
                    thread::spawn(move || {
                        let user = format!("user-{}", i % 3);
                        for _ in 0..5 {
                            tutor.record_attempt(&user, &ids(&["math_1.add"]), true, 1.0).unwrap();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert!(tutor.lock_table().is_empty());
            assert_eq!(tutor.store().get_stats().unwrap().total_answers, 31);
        }

        #[test]
        fn failed_write_releases_its_lock_entry() {
            let tutor = memory_tutor(arithmetic());
            tutor
                .record_attempt_at("u1", &ids(&["math_1.add"]), true, 2.0, t0())
                .unwrap();
            let earlier = t0() - Duration::hours(1);
            assert!(tutor
                .record_attempt_at("u1", &ids(&["math_1.add"]), true, 2.0, earlier)
                .is_err());
            assert!(tutor.lock_table().is_empty());
        }

        #[test]
        fn two_tutors_on_one_database_do_not_lose_updates() {
            let dir = tempfile::tempdir().unwrap();
            let a = Arc::new(file_tutor(&dir, arithmetic()));
            let b = Arc::new(file_tutor(&dir, arithmetic()));

            let handles: Vec<_> = [a.clone(), b.clone()]
                .into_iter()
                .map(|tutor| {
                    thread::spawn(move || {
                        for _ in 0..3 {
                            tutor.record_attempt("u1", &ids(&["math_1.add"]), true, 1.0).unwrap();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(a.profile("u1").unwrap().total_answers(), 6);
        }
    }
}
