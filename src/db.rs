use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::config::StoreConfig;
use crate::error::{Result, TutorError};
use crate::models::{AttemptRecord, SkillProficiency, StudentProfile};

const SCHEMA_VERSION: i64 = 1;

/// SQLite-backed store holding one profile per student.
///
/// File databases get a second connection for reads so a load never waits
/// behind a save in progress; in-memory databases share one connection.
pub struct ProficiencyStore {
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
    config: StoreConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentSummary {
    pub user_id: String,
    pub age: Option<u32>,
    pub grade_level: Option<String>,
    pub skills_practiced: i64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total_students: i64,
    pub total_answers: i64,
    pub skills_practiced: i64,
    /// Mean of the cached estimates, each as of its skill's last practice.
    /// No forgetting is applied, so this can sit above the decayed values
    /// a profile shows.
    pub avg_mastery_at_last_practice: f64,
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    // a panicked holder cannot leave a half-applied transaction behind
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Failures that may clear on their own: contention, I/O hiccups, a full
/// disk being cleaned up, or a file briefly unavailable.
fn is_transient(err: &TutorError) -> bool {
    match err {
        TutorError::Storage(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::CannotOpen
        ),
        _ => false,
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TutorError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

fn configure(conn: &Connection) -> Result<()> {
    // in-memory databases answer "memory" here and stay that way
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

impl ProficiencyStore {
    pub fn open<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let writer = Connection::open(&path)?;
        configure(&writer)?;
        let reader = Connection::open(&path)?;
        configure(&reader)?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
            config,
        })
    }

    pub fn open_in_memory(config: StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self {
            writer: Mutex::new(conn),
            reader: None,
            config,
        })
    }

    fn read_conn(&self) -> &Mutex<Connection> {
        self.reader.as_ref().unwrap_or(&self.writer)
    }

    pub fn init(&self) -> Result<()> {
        let conn = lock(&self.writer);
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS students (
                user_id TEXT PRIMARY KEY,
                age INTEGER,
                grade_level TEXT,
                notes TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS proficiencies (
                user_id TEXT NOT NULL,
                skill_id TEXT NOT NULL,
                mastery_estimate REAL NOT NULL,
                last_practiced_at TEXT,
                PRIMARY KEY (user_id, skill_id),
                FOREIGN KEY (user_id) REFERENCES students(user_id) ON DELETE CASCADE
            );

            -- Append-only; seq is the position within one student's skill history
            CREATE TABLE IF NOT EXISTS attempts (
                user_id TEXT NOT NULL,
                skill_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                correct INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                response_time_seconds REAL NOT NULL,
                weight REAL NOT NULL DEFAULT 1.0,
                distance INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, skill_id, seq),
                FOREIGN KEY (user_id, skill_id)
                    REFERENCES proficiencies(user_id, skill_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_proficiencies_skill ON proficiencies(skill_id);
            CREATE INDEX IF NOT EXISTS idx_attempts_direct ON attempts(distance);
            "#,
        )?;

        Self::migrate(&conn)?;
        Ok(())
    }

    // Stamp fresh databases; refuse ones written by a newer build.
    fn migrate(conn: &Connection) -> Result<()> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(TutorError::Corrupt(format!(
                "database schema version {} is newer than supported {}",
                version, SCHEMA_VERSION
            )));
        }
        if version < SCHEMA_VERSION {
            conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;
        }
        Ok(())
    }

    /// Runs `op`, retrying transient failures with jittered backoff.
    fn with_retry<T>(
        &self,
        conn: &Mutex<Connection>,
        what: &str,
        mut op: impl FnMut(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = {
                let mut guard = lock(conn);
                op(&mut guard)
            };
            match result {
                Err(err) if is_transient(&err) => {
                    if attempt > self.config.max_retries {
                        tracing::error!(op = what, attempts = attempt, "storage retries exhausted");
                        return match err {
                            TutorError::Storage(source) => Err(TutorError::StorageExhausted {
                                attempts: attempt,
                                source,
                            }),
                            other => Err(other),
                        };
                    }
                    let base = self.config.retry_backoff_ms.saturating_mul(1 << (attempt - 1).min(6));
                    let jitter = rand::thread_rng().gen_range(0..=self.config.retry_backoff_ms);
                    tracing::warn!(op = what, attempt, error = %err, "transient storage failure, retrying");
                    std::thread::sleep(Duration::from_millis(base + jitter));
                }
                other => return other,
            }
        }
    }

    /// Stored profile, or a fresh prior-initialised one for an unknown student.
    pub fn load(&self, user_id: &str) -> Result<StudentProfile> {
        self.with_retry(self.read_conn(), "load", |conn| Self::load_from(conn, user_id))
    }

    fn load_from(conn: &mut Connection, user_id: &str) -> Result<StudentProfile> {
        // one read transaction so a concurrent save is seen entirely or not at all
        let tx = conn.transaction()?;

        let student = tx.query_row(
            "SELECT age, grade_level, notes, version FROM students WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok((
                    row.get::<_, Option<u32>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        );
        let (age, grade_level, notes, version) = match student {
            Ok(s) => s,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(StudentProfile::new(user_id)),
            Err(e) => return Err(e.into()),
        };

        let mut proficiency_by_skill = BTreeMap::new();
        {
            let mut stmt = tx.prepare(
                r#"
                SELECT skill_id, mastery_estimate, last_practiced_at
                FROM proficiencies
                WHERE user_id = ?1
                "#,
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            for row in rows {
                let (skill_id, mastery_estimate, last) = row?;
                let last_practiced_at = last.as_deref().map(parse_timestamp).transpose()?;
                proficiency_by_skill.insert(
                    skill_id.clone(),
                    SkillProficiency {
                        skill_id,
                        mastery_estimate,
                        attempts: Vec::new(),
                        last_practiced_at,
                    },
                );
            }

            let mut stmt = tx.prepare(
                r#"
                SELECT skill_id, seq, correct, timestamp, response_time_seconds, weight, distance
                FROM attempts
                WHERE user_id = ?1
                ORDER BY skill_id, seq
                "#,
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, u32>(6)?,
                ))
            })?;
            for row in rows {
                let (skill_id, seq, correct, timestamp, response_time_seconds, weight, distance) =
                    row?;
                let proficiency = proficiency_by_skill.get_mut(&skill_id).ok_or_else(|| {
                    TutorError::Corrupt(format!(
                        "attempt for '{}' without a proficiency row",
                        skill_id
                    ))
                })?;
                if seq as usize != proficiency.attempts.len() {
                    return Err(TutorError::Corrupt(format!(
                        "gap in attempt history of '{}' at seq {}",
                        skill_id, seq
                    )));
                }
                proficiency.attempts.push(AttemptRecord {
                    skill_id,
                    seq,
                    correct,
                    timestamp: parse_timestamp(&timestamp)?,
                    response_time_seconds,
                    weight,
                    distance,
                });
            }
        }
        tx.commit()?;

        Ok(StudentProfile {
            user_id: user_id.to_string(),
            age,
            grade_level,
            notes,
            proficiency_by_skill,
            version: version as u64,
        })
    }

    /// Atomically replaces the stored profile and returns its new version.
    ///
    /// Fails with `Conflict` when the stored version no longer matches the
    /// one the profile was loaded at.
    pub fn save(&self, profile: &StudentProfile) -> Result<u64> {
        self.with_retry(&self.writer, "save", |conn| Self::save_to(conn, profile))
    }

    fn save_to(conn: &mut Connection, profile: &StudentProfile) -> Result<u64> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().to_rfc3339();

        let new_version = if profile.is_new() {
            let inserted = tx.execute(
                r#"
                INSERT INTO students (user_id, age, grade_level, notes, version, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
                "#,
                params![
                    profile.user_id,
                    profile.age,
                    profile.grade_level,
                    profile.notes,
                    now
                ],
            );
            match inserted {
                Ok(_) => 1,
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    return Err(TutorError::Conflict(profile.user_id.clone()));
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            let updated = tx.execute(
                r#"
                UPDATE students
                SET age = ?1, grade_level = ?2, notes = ?3,
                    version = version + 1, updated_at = ?4
                WHERE user_id = ?5 AND version = ?6
                "#,
                params![
                    profile.age,
                    profile.grade_level,
                    profile.notes,
                    now,
                    profile.user_id,
                    profile.version as i64
                ],
            )?;
            if updated == 0 {
                return Err(TutorError::Conflict(profile.user_id.clone()));
            }
            profile.version + 1
        };

        for proficiency in profile.proficiency_by_skill.values() {
            tx.execute(
                r#"
                INSERT INTO proficiencies (user_id, skill_id, mastery_estimate, last_practiced_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(user_id, skill_id) DO UPDATE SET
                    mastery_estimate = excluded.mastery_estimate,
                    last_practiced_at = excluded.last_practiced_at
                "#,
                params![
                    profile.user_id,
                    proficiency.skill_id,
                    proficiency.mastery_estimate,
                    proficiency.last_practiced_at.map(|t| t.to_rfc3339())
                ],
            )?;

            let stored: i64 = tx.query_row(
                "SELECT COUNT(*) FROM attempts WHERE user_id = ?1 AND skill_id = ?2",
                params![profile.user_id, proficiency.skill_id],
                |row| row.get(0),
            )?;

            for attempt in proficiency.attempts.iter().skip(stored as usize) {
                tx.execute(
                    r#"
                    INSERT INTO attempts
                        (user_id, skill_id, seq, correct, timestamp, response_time_seconds, weight, distance)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                    params![
                        profile.user_id,
                        attempt.skill_id,
                        attempt.seq,
                        attempt.correct,
                        attempt.timestamp.to_rfc3339(),
                        attempt.response_time_seconds,
                        attempt.weight,
                        attempt.distance
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(new_version)
    }

    pub fn list_students(&self) -> Result<Vec<StudentSummary>> {
        self.with_retry(self.read_conn(), "list_students", |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT s.user_id, s.age, s.grade_level, COUNT(p.skill_id), s.updated_at
                FROM students s
                LEFT JOIN proficiencies p ON s.user_id = p.user_id
                GROUP BY s.user_id
                ORDER BY s.user_id
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(StudentSummary {
                    user_id: row.get(0)?,
                    age: row.get(1)?,
                    grade_level: row.get(2)?,
                    skills_practiced: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn get_stats(&self) -> Result<Stats> {
        self.with_retry(self.read_conn(), "stats", |conn| {
            let total_students: i64 =
                conn.query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))?;

            let total_answers: i64 = conn.query_row(
                "SELECT COUNT(*) FROM attempts WHERE distance = 0",
                [],
                |row| row.get(0),
            )?;

            let skills_practiced: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT skill_id) FROM proficiencies",
                [],
                |row| row.get(0),
            )?;

            let avg_mastery_at_last_practice: f64 = conn.query_row(
                "SELECT COALESCE(AVG(mastery_estimate), 0.0) FROM proficiencies",
                [],
                |row| row.get(0),
            )?;

            Ok(Stats {
                total_students,
                total_answers,
                skills_practiced,
                avg_mastery_at_last_practice,
            })
        })
    }
}
