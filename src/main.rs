use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use std::path::{Path, PathBuf};

use dash_tutor::config::{self, TutorConfig};
use dash_tutor::db::ProficiencyStore;
use dash_tutor::graph::{Skill, SkillGraph};
use dash_tutor::logging;
use dash_tutor::models::{mastery_label, JsonOutput};
use dash_tutor::{StudentUpdate, Tutor, TutorError};

const COMPLETE_MESSAGE: &str = "You've mastered everything available";

// Written by `init` when no skills file exists yet.
const STARTER_SKILLS: &str = r#"[
  {"skill_id": "math_1.add", "name": "Addition", "starter": true},
  {"skill_id": "math_1.subtract", "name": "Subtraction", "prerequisites": ["math_1.add"]},
  {"skill_id": "math_1.multiply", "name": "Multiplication", "prerequisites": ["math_1.add"]},
  {"skill_id": "math_1.divide", "name": "Division", "prerequisites": ["math_1.multiply", "math_1.subtract"]},
  {"skill_id": "math_8", "name": "Fractions", "prerequisites": ["math_1.divide"]},
  {"skill_id": "math_8_1", "parent_id": "math_8", "name": "Equivalent fractions", "prerequisites": ["math_1.divide"]},
  {"skill_id": "math_8_1.1", "parent_id": "math_8_1", "name": "Simplifying fractions", "prerequisites": ["math_8_1"]}
]
"#;

#[derive(Parser)]
#[command(name = "dash-tutor")]
#[command(about = "Adaptive practice: tracks skill mastery and picks what to practice next")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Database file (default: $DASH_TUTOR_DB or the user config dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Skill graph JSON file (default: $DASH_TUTOR_SKILLS or the user config dir)
    #[arg(long = "skills", id = "skills_file", value_name = "SKILLS", global = true)]
    skills: Option<PathBuf>,

    /// Tuning parameters JSON file (default: $DASH_TUTOR_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and write a starter skill graph if none exists
    Init,

    /// List the skill tree
    Skills,

    /// Show skill details
    Skill {
        /// Skill ID
        id: String,
    },

    /// Record a graded answer
    #[command(group(ArgGroup::new("outcome").required(true).args(["correct", "incorrect"])))]
    Attempt {
        /// Student ID
        user: String,

        /// Skills the question exercised
        #[arg(required = true)]
        skills: Vec<String>,

        /// The answer was right
        #[arg(long, short)]
        correct: bool,

        /// The answer was wrong
        #[arg(long, short)]
        incorrect: bool,

        /// Response time in seconds
        #[arg(long, short, default_value_t = 0.0)]
        time: f64,
    },

    /// Get the next skill to practice
    Next {
        /// Student ID
        user: String,
    },

    /// Show a student's mastery across practiced skills
    Profile {
        /// Student ID
        user: String,
    },

    /// Set student details
    Student {
        /// Student ID
        user: String,

        #[arg(long, short)]
        age: Option<u32>,

        #[arg(long, short)]
        grade: Option<String>,

        #[arg(long, short)]
        notes: Option<String>,
    },

    /// Show practice statistics
    Stats,
}

fn main() {
    let _log_guard = logging::init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        if e.downcast_ref::<TutorError>().is_some_and(TutorError::is_retryable) {
            eprintln!("This is temporary; run the command again.");
        }
        std::process::exit(1);
    }
}

fn open_tutor(db_path: &Path, skills_path: &Path, config_path: &Path) -> dash_tutor::Result<Tutor> {
    let config = TutorConfig::load(config_path)?;
    let graph = SkillGraph::load(skills_path)?;
    let store = ProficiencyStore::open(db_path, config.store.clone())?;
    Tutor::new(graph, store, config)
}

fn print_json<T: serde::Serialize>(data: T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string(&JsonOutput::ok(data))?);
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let db_path = config::db_path(cli.db);
    let skills_path = config::skills_path(cli.skills);
    let config_path = config::config_path(cli.config);

    let wrote_skills = match cli.command {
        Commands::Init if !skills_path.exists() => {
            std::fs::write(&skills_path, STARTER_SKILLS)?;
            true
        }
        _ => false,
    };

    // opening the tutor creates the schema, which is all `init` needs
    let tutor = open_tutor(&db_path, &skills_path, &config_path)?;

    match cli.command {
        Commands::Init => {
            let skill_count = tutor.graph().len();
            if cli.json {
                print_json(serde_json::json!({
                    "db": db_path,
                    "skills": skills_path,
                    "skill_count": skill_count,
                    "wrote_starter_skills": wrote_skills
                }))?;
            } else {
                println!("Database initialized at: {}", db_path.display());
                if wrote_skills {
                    println!("Starter skill graph written to: {}", skills_path.display());
                }
                println!("{} skills loaded.", skill_count);
            }
        }

        Commands::Skills => {
            let graph = tutor.graph();
            if cli.json {
                print_json(graph.iter().collect::<Vec<_>>())?;
            } else if graph.is_empty() {
                println!("No skills found.");
            } else {
                let mut stack: Vec<(&Skill, usize)> =
                    graph.roots().into_iter().rev().map(|s| (s, 0)).collect();
                while let Some((skill, depth)) = stack.pop() {
                    let marker = if graph.is_starter(&skill.skill_id) { "*" } else { " " };
                    println!(
                        "{}{}{:<24} {}",
                        marker,
                        "  ".repeat(depth),
                        skill.skill_id,
                        truncate(skill.display_name(), 40)
                    );
                    for child in graph.children(&skill.skill_id)?.into_iter().rev() {
                        stack.push((child, depth + 1));
                    }
                }
                println!();
                println!("* starter skill");
            }
        }

        Commands::Skill { id } => {
            let graph = tutor.graph();
            let Some(skill) = graph.get_skill(&id) else {
                if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string(&JsonOutput::<()>::err("Skill not found"))?
                    );
                } else {
                    println!("Skill not found.");
                }
                return Ok(());
            };
            let breadcrumb = graph.breadcrumb(&id)?;
            let prerequisites = graph.prerequisites_of(&id)?;
            let children: Vec<&str> = graph
                .children(&id)?
                .into_iter()
                .map(|c| c.skill_id.as_str())
                .collect();

            if cli.json {
                print_json(serde_json::json!({
                    "skill": skill,
                    "breadcrumb": breadcrumb,
                    "prerequisites": prerequisites,
                    "children": children,
                    "starter": graph.is_starter(&id)
                }))?;
            } else {
                println!("Skill: {}", skill.display_name());
                println!("ID: {}", skill.skill_id);
                println!("Path: {}", breadcrumb.join(" > "));
                if let Some(desc) = &skill.description {
                    println!("Description: {}", desc);
                }
                println!(
                    "Prerequisites: {}",
                    if prerequisites.is_empty() {
                        "-".to_string()
                    } else {
                        prerequisites.join(", ")
                    }
                );
                if !children.is_empty() {
                    println!("Sub-skills: {}", children.join(", "));
                }
                if graph.is_starter(&id) {
                    println!("Starter skill");
                }
            }
        }

        Commands::Attempt {
            user,
            skills,
            correct,
            incorrect: _,
            time,
        } => {
            let outcome = tutor.record_attempt(&user, &skills, correct, time)?;

            if cli.json {
                print_json(&outcome)?;
            } else {
                println!(
                    "Recorded {} answer for {} ({} skills updated).",
                    if correct { "correct" } else { "incorrect" },
                    user,
                    outcome.affected_skill_count
                );
                println!(
                    "{}: {} ({:.0}%)",
                    skills[0],
                    mastery_label(outcome.primary_mastery),
                    outcome.primary_mastery * 100.0
                );
                println!("Current streak: {}", outcome.current_streak);
            }
        }

        Commands::Next { user } => match tutor.recommend_now(&user) {
            Ok(rec) => {
                if cli.json {
                    print_json(&rec)?;
                } else {
                    let name = tutor
                        .graph()
                        .get_skill(&rec.skill_id)
                        .map(|s| s.display_name().to_string())
                        .unwrap_or_else(|| rec.skill_id.clone());
                    println!("=== Next Skill ===");
                    println!();
                    println!("Skill: {} ({})", name, rec.skill_id);
                    println!(
                        "Current mastery: {} ({:.0}%)",
                        mastery_label(rec.mastery),
                        rec.mastery * 100.0
                    );
                    println!("Reason: {}", rec.reason.as_str());
                    println!();
                    println!("After answering, record it with:");
                    println!(
                        "  dash-tutor attempt {} {} --correct|--incorrect",
                        user, rec.skill_id
                    );
                }
            }
            Err(e) if e.is_curriculum_complete() => {
                if cli.json {
                    print_json(serde_json::json!({
                        "skill_id": null,
                        "complete": true,
                        "message": COMPLETE_MESSAGE
                    }))?;
                } else {
                    println!("{}!", COMPLETE_MESSAGE);
                }
            }
            Err(e) => return Err(e.into()),
        },

        Commands::Profile { user } => {
            let profile = tutor.profile(&user)?;
            let statuses = tutor.skill_statuses(&user, Utc::now())?;
            let practiced: Vec<_> = statuses
                .iter()
                .filter(|s| profile.proficiency(&s.skill_id).is_some())
                .collect();

            if cli.json {
                print_json(serde_json::json!({
                    "profile": profile,
                    "mastery_now": practiced
                }))?;
            } else {
                println!("Student: {}", profile.user_id);
                if let Some(age) = profile.age {
                    println!("Age: {}", age);
                }
                if let Some(grade) = &profile.grade_level {
                    println!("Grade: {}", grade);
                }
                if let Some(notes) = &profile.notes {
                    println!("Notes: {}", notes);
                }
                println!("Answers: {}", profile.total_answers());
                println!();

                if practiced.is_empty() {
                    println!("No skills practiced yet.");
                } else {
                    println!(
                        "{:<24} {:>8} {:<11} {:>8} {:>8}",
                        "SKILL", "MASTERY", "LEVEL", "ANSWERS", "SUCCESS"
                    );
                    println!("{}", "-".repeat(64));
                    for status in practiced {
                        let Some(p) = profile.proficiency(&status.skill_id) else {
                            continue;
                        };
                        println!(
                            "{:<24} {:>7.0}% {:<11} {:>8} {:>7.0}%",
                            truncate(&status.skill_id, 24),
                            status.mastery * 100.0,
                            mastery_label(status.mastery),
                            p.times_answered(),
                            p.success_rate()
                        );
                    }
                }
            }
        }

        Commands::Student {
            user,
            age,
            grade,
            notes,
        } => {
            let update = StudentUpdate {
                age,
                grade_level: grade,
                notes,
            };
            let profile = if update.age.is_none()
                && update.grade_level.is_none()
                && update.notes.is_none()
            {
                tutor.profile(&user)?
            } else {
                tutor.update_student(&user, update)?
            };

            if cli.json {
                print_json(serde_json::json!({
                    "user_id": profile.user_id,
                    "age": profile.age,
                    "grade_level": profile.grade_level,
                    "notes": profile.notes,
                    "version": profile.version
                }))?;
            } else {
                println!("Student: {}", profile.user_id);
                println!(
                    "Age: {}",
                    profile.age.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
                );
                println!("Grade: {}", profile.grade_level.as_deref().unwrap_or("-"));
                println!("Notes: {}", profile.notes.as_deref().unwrap_or("-"));
            }
        }

        Commands::Stats => {
            let stats = tutor.store().get_stats()?;
            let students = tutor.store().list_students()?;
            if cli.json {
                print_json(serde_json::json!({
                    "stats": stats,
                    "students": students
                }))?;
            } else {
                println!("=== Practice Statistics ===");
                println!("Students: {}", stats.total_students);
                println!("Answers recorded: {}", stats.total_answers);
                println!("Skills practiced: {} of {}", stats.skills_practiced, tutor.graph().len());
                println!(
                    "Average mastery at last practice: {:.0}%",
                    stats.avg_mastery_at_last_practice * 100.0
                );
                if !students.is_empty() {
                    println!();
                    println!("{:<20} {:<8} {:>7}  UPDATED", "STUDENT", "GRADE", "SKILLS");
                    println!("{}", "-".repeat(60));
                    for s in students {
                        println!(
                            "{:<20} {:<8} {:>7}  {}",
                            truncate(&s.user_id, 20),
                            s.grade_level.as_deref().unwrap_or("-"),
                            s.skills_practiced,
                            s.updated_at
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
