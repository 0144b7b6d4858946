//! # clinrag
//!
//! Indexing and retrieval-augmented query service for clinical practice
//! records.
//!
//! clinrag pulls records (appointments, prescriptions, patient profiles,
//! condition codes) from an external practice-management system, flattens
//! them into embeddable narratives, stores the vectors in a local SQLite
//! index, and answers natural-language questions by retrieving relevant
//! chunks and calling an external generative model — with session-aware
//! multi-turn chat on top.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   ┌────────────────────┐   ┌───────────┐
//! │ Practice System│──▶│  ETL Pipeline       │──▶│  SQLite   │
//! │ (sync API)     │   │ Flatten+Chunk+Embed │   │ vectors   │
//! └────────────────┘   └────────────────────┘   └─────┬─────┘
//!                                                     │
//!                          ┌──────────────────────────┤
//!                          ▼                          ▼
//!                    ┌──────────┐              ┌────────────┐
//!                    │   CLI    │              │  HTTP API  │
//!                    │(clinrag) │              │ query/chat │
//!                    └──────────┘              └─────┬──────┘
//!                                                    ▼
//!                                             ┌────────────┐
//!                                             │ Generative │
//!                                             │   model    │
//!                                             └────────────┘
//! ```
//!
//! Indexing and querying are independent paths against the same store and
//! run concurrently; the (kind, record, chunk) upsert key keeps re-indexing
//! idempotent.
//!
//! ## Quick Start
//!
//! ```bash
//! clinrag init                          # create database
//! clinrag index                         # incremental sync of default kinds
//! clinrag index --kind condition        # bulk-load the code list
//! clinrag query "latest BP readings for P-2024-011" --patient P-2024-011
//! clinrag serve                         # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`connector`] | Practice-system sync API client |
//! | [`registry`] | Source-kind registry |
//! | [`flatten`] | Per-kind record linearization |
//! | [`chunk`] | Word-window text chunking |
//! | [`embedding`] | Embedding client + vector utilities |
//! | [`store`] | Vector store (upsert, similarity search, raw fetch) |
//! | [`watermark`] | Per-kind sync watermarks |
//! | [`etl`] | Indexing pipeline orchestration |
//! | [`generation`] | Generative-model client with fallback |
//! | [`session`] | TTL-bounded chat session cache |
//! | [`rag`] | Query/chat orchestration |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod connector;
pub mod db;
pub mod embedding;
pub mod etl;
pub mod flatten;
pub mod generation;
pub mod migrate;
pub mod models;
pub mod rag;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod watermark;
