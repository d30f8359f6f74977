//! deckflow - queue-driven slide deck processing
//!
//! This crate provides:
//! - An ingestion dispatcher that fans an uploaded deck out into per-image
//!   and per-slide jobs, deduplicating repeated images by perceptual hash
//! - Image analysis, explanation, embedding and summary workers that join
//!   back together through atomic counters in SQLite
//! - Bounded retries with a dead-letter sink for jobs that keep failing
//! - CLI commands to upload decks, watch their progress and run workers

pub mod blob;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod deck;
pub mod dedupe;
pub mod embed;
pub mod embedding_backend;
pub mod error;
pub mod lecture;
pub mod llm;
pub mod messages;
pub mod meta;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod workers;

pub use config::Config;
pub use error::{Error, Result};
