//! # Document RAG
//!
//! Upload documents, turn them into embedded, vector-indexed fragments, and
//! answer natural-language questions grounded in those fragments.
//!
//! ## Architecture
//!
//! ```text
//!  upload ──▶ BlobStore + MetadataStore
//!
//!  process ─▶ ┌─────────┐  ┌─────────┐  ┌──────────┐  ┌─────────────┐
//!             │ Extract │─▶│  Chunk  │─▶│ Embedder │─▶│ VectorIndex │
//!             └─────────┘  └─────────┘  └──────────┘  └──────┬──────┘
//!                                                            │
//!  ask ─────▶ Embedder ─▶ VectorIndex.search ─▶ prompt ─▶ ChatModel
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docrag init
//! docrag upload ./handbook.md
//! docrag process <doc_id>
//! docrag ask "How many vacation days do I get?"
//! docrag serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Pipeline error taxonomy |
//! | [`guard`] | Timeouts and cancellation for external calls |
//! | [`models`] | Core data types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Metadata schema migrations |
//! | [`metadata`] | Sessions, documents and the chunk mirror |
//! | [`blob`] | Local, S3 and Azure blob storage |
//! | [`extract`] | Text extraction (txt, md, pdf, docx) |
//! | [`chunk`] | Sliding-window chunking |
//! | [`http`] | Retrying transport for remote APIs |
//! | [`embedding`] | Embedding providers and the [`embedding::Embedder`] |
//! | [`index`] | Vector index backends |
//! | [`chat`] | Chat completion clients |
//! | [`ingest`] | Ingestion pipeline |
//! | [`query`] | Query pipeline |
//! | [`app`] | Dependency wiring |
//! | [`server`] | HTTP API |

pub mod app;
pub mod blob;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod guard;
pub mod http;
pub mod index;
pub mod ingest;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod query;
pub mod server;
