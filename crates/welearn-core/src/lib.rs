//! # WeLearn Core
//!
//! Runtime-agnostic logic for the WeLearn API: wire models, vector
//! arithmetic, re-ranking, data-quality deduplication, prompt templates,
//! syllabus checks, language detection and the storage traits.
//!
//! This crate contains no tokio, sqlx, HTTP client or filesystem I/O. The
//! `welearn-api` crate provides the Qdrant, Postgres and LLM backends.

pub mod lang;
pub mod models;
pub mod prompts;
pub mod quality;
pub mod ranking;
pub mod store;
pub mod syllabus;
pub mod vector;
