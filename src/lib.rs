//! Skill-mastery tracking and next-skill selection for adaptive practice.
//!
//! Collaborators hold a [`Tutor`] and call [`Tutor::record_attempt`] after
//! grading an answer and [`Tutor::recommend_next`] when picking a question.

pub mod cascade;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod graph;
pub mod logging;
pub mod memory;
pub mod models;
pub mod recommender;

pub use engine::{StudentUpdate, Tutor};
pub use error::{Result, TutorError};
