//! # Appealdesk
//!
//! A document understanding and retrieval pipeline for insurance appeal
//! drafting.
//!
//! Appealdesk ingests denied-claim paperwork (denial letters, clinical notes,
//! imaging reports), extracts text with an OCR fallback, chunks and embeds
//! payer policies for semantic retrieval, and runs a staged generation
//! pipeline that turns a case file into a policy-grounded appeal draft with
//! verifiable citations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────┐
//! │  Documents   │──▶│   Extract     │──▶│  SQLite    │
//! │ PDF/TXT/OCR  │   │ Chunk+Embed  │   │ Cases+Vec │
//! └──────────────┘   └──────────────┘   └────┬──────┘
//!                                            │
//!                      ┌─────────────────────┤
//!                      ▼                     ▼
//!                ┌───────────┐       ┌─────────────┐
//!                │ Retrieval │──────▶│  Pipeline    │
//!                │  (cosine) │       │ Stages 1–4  │
//!                └───────────┘       └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! apd init                        # create database
//! apd seed                        # load demo policies and cases
//! apd index policy.pdf --name "BCBS Imaging" --payer "Blue Cross Blue Shield" --state CA
//! apd search "prior authorization for MRI"
//! apd serve                       # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Document text extraction with OCR fallback |
//! | [`ocr`] | Tesseract subprocess wrapper |
//! | [`chunk`] | Policy text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`indexer`] | Policy chunking + embedding + storage |
//! | [`search`] | Cosine-similarity retrieval with metadata filters |
//! | [`llm`] | Generation provider abstraction |
//! | [`pipeline`] | Staged appeal generation (facts, matches, analysis, draft) |
//! | [`store`] | Case, document, policy, and audit persistence |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`seed`] | Demo corpus loader |
//! | [`stats`] | Corpus statistics |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod indexer;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod search;
pub mod seed;
pub mod server;
pub mod stats;
pub mod store;
