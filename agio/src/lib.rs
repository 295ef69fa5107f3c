#![cfg_attr(docsrs, feature(doc_cfg))]
//! Agio is an agent orchestration runtime: it drives LLM dialogues through
//! multi-step tool-calling loops and composite workflows, persisting every
//! step of a run in a session transcript and emitting a typed event stream
//! for transports and tracing.
//!
//! # Overview
//!
//! A *run* turns one user query into an ordered, persisted sequence of
//! steps: the coordinator assembles context from prior steps, streams the
//! model's answer while assembling the canonical assistant step, dispatches
//! requested tool calls with bounded parallelism and per-call timeouts,
//! persists the results in call order, and loops until the model stops
//! calling tools (or a budget, deadline, or cancel intervenes). Runs nest:
//! an agent or workflow registered as a tool opens a child run on the same
//! event bus.
//!
//! # Example
//!
//! ```rust,ignore
//! use agio::prelude::*;
//! use std::sync::Arc;
//!
//! let agent = Agent::builder("helper")
//!     .model("gpt-4o")
//!     .provider(provider)
//!     .tool(MyTool)
//!     .build()?;
//!
//! let store: SharedStore = Arc::new(SqliteStore::open("agio.db")?);
//! let outcome = Runner::run(&agent, "What is 2+2?", RunConfig::new(store)).await?;
//! println!("{}", outcome.output);
//! ```

// Data model and adapters
pub mod error;
pub mod message;
pub mod run;
pub mod step;
pub mod usage;

// Engine
pub mod agent;
pub mod config;
pub mod context;
pub mod controller;
pub mod dispatch;
pub mod event;
pub mod executor;
pub mod runner;
pub mod stream;
pub mod tool;
pub mod workflow;

// Providers and persistence
pub mod provider;
pub mod store;

// Observability and lifecycle
pub mod checkpoint;
pub mod trace;

pub mod prelude;

pub use error::{Error, Result, ToolError};
pub use run::{RunOutcome, RunStatus, TerminationReason};
pub use runner::{RunConfig, Runner};
