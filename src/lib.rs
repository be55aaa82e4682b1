//! # WeLearn API
//!
//! Retrieval-augmented HTTP API over a corpus of learning resources
//! classified by Sustainable Development Goal (SDG).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  HTTP routes │──▶│   Services   │──▶│    Qdrant    │
//! │ search / qna │   │ search, chat │   │  (vectors)   │
//! │ tutor / ...  │   │ agent, tutor │   └──────────────┘
//! └──────┬───────┘   └──────┬───────┘   ┌──────────────┐
//!        │                  ├──────────▶│   Postgres   │
//!   middleware              │           │  (metadata)  │
//!   CORS, API key,          ▼           └──────────────┘
//!   monitoring       ┌──────────────┐
//!                    │  LLM (Azure/ │
//!                    │   OpenAI)    │
//!                    └──────────────┘
//! ```
//!
//! Pure domain logic (models, prompts, ranking, language detection,
//! data-quality dedup, syllabus checks, in-memory stores) lives in the
//! `welearn-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, env overrides, validation |
//! | [`error`] | `ApiError` and its JSON rendering |
//! | [`db`] | Postgres pool |
//! | [`pg_store`] | `MetadataStore` over Postgres |
//! | [`qdrant`] | `VectorStore` over the Qdrant REST API |
//! | [`embedding`] | Embedding providers and the query cache |
//! | [`llm`] | Chat-completion client with retry |
//! | [`search`] | Collection resolution, filtered search, re-ranking |
//! | [`chat`] | Reformulation, sourced answers, rephrasing |
//! | [`agent`] | Tool-calling conversational agent |
//! | [`extract`] | Text extraction from uploads |
//! | [`tutor`] | Theme extraction and the syllabus pipeline |
//! | [`micro_learning`] | SDG learning journeys |
//! | [`data_collection`] | Campaign-gated chat and click recording |
//! | [`middleware`] | CORS, process time, API key, request monitor |
//! | [`routes`] | `/api/v1` handlers |
//! | [`server`] | App state, router, serve loop |

pub mod agent;
pub mod chat;
pub mod config;
pub mod data_collection;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod llm;
pub mod micro_learning;
pub mod middleware;
pub mod pg_store;
pub mod qdrant;
pub mod routes;
pub mod search;
pub mod server;
pub mod tutor;
