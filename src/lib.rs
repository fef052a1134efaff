//! # LedgerBox
//!
//! An invoice assistant: upload invoice documents, have them parsed by an
//! external document-AI service, and ask questions about your spending
//! through a chat interface backed by keyword classification and
//! embedding-based similarity search.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────┐
//! │ Uploads  │──▶│   Pipeline    │──▶│  SQLite   │
//! │ PDF/img  │   │ Parse+Embed  │   │ JSON+Vec │
//! └──────────┘   └──────────────┘   └────┬─────┘
//!                                        │
//!                    ┌───────────────────┤
//!                    ▼                   ▼
//!               ┌──────────┐       ┌──────────┐
//!               │   CLI    │       │   HTTP   │
//!               │  (lbx)   │       │ SSE chat │
//!               └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! lbx init                      # create database
//! lbx serve                     # start the API server
//! lbx stats                     # inspect the database
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`auth`] | Passwords, session tokens, provider linking |
//! | [`parser`] | External invoice-parsing service client |
//! | [`amounts`] | Tolerant amount/date/field extraction |
//! | [`classify`] | Keyword classification of chat prompts |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`invoices`] | Upload pipeline, search, export |
//! | [`dashboard`] | Spending aggregation |
//! | [`chat`] | Sessions, messages, reply building |
//! | [`gmail`] | Gmail invoice import |
//! | [`server`] | HTTP API server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod amounts;
pub mod auth;
pub mod chat;
pub mod classify;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod embedding;
pub mod gmail;
pub mod invoices;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod server;
pub mod stats;
