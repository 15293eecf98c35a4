//! # Clausebase
//!
//! A contract document processing backend. Uploaded contracts (PDF, DOCX)
//! are stored, then processed asynchronously by a bounded worker pool along
//! two independent branches:
//!
//! ```text
//! ┌────────┐   ┌─────────┐   ┌───────────────────────────┐
//! │ Upload │──▶│  Queue   │──▶│ download + extract text   │
//! └────────┘   └─────────┘   └────────────┬──────────────┘
//!                                 ┌───────┴────────┐
//!                                 ▼                ▼
//!                          ┌────────────┐   ┌─────────────┐
//!                          │  vector     │   │  metadata    │
//!                          │ chunk+embed │   │ LLM extract  │
//!                          └─────┬──────┘   └──────┬──────┘
//!                                ▼                 ▼
//!                             SQLite (index, metadata, errors)
//! ```
//!
//! Each branch tracks its own `pending → processing → completed | failed`
//! status on the file record; failures append error rows and can be retried
//! through the API. An HTTP server exposes uploads, queries, and retry
//! actions, plus a WebSocket that streams processing events.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`store`] | Record store (files, metadata, errors) |
//! | [`storage`] | Object storage for uploaded bytes |
//! | [`extract`] | PDF/DOCX text extraction |
//! | [`chunk`] | Sliding-window text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_store`] | Chunk vector persistence and similarity search |
//! | [`error`] | Pipeline stage error taxonomy |
//! | [`metadata`] | LLM contract field extraction and risk scoring |
//! | [`queue`] | Asynchronous processing queue |
//! | [`events`] | Broadcast event bus |
//! | [`server`] | HTTP and WebSocket API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod events;
pub mod extract;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod server;
pub mod storage;
pub mod store;
pub mod vector_store;
