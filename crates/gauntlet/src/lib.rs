// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Admission-controlled, resilient execution core for source-code validation.
//!
//! This crate is the engine room of a multi-language validation service: it
//! takes [`ValidationRequest`][verdict::ValidationRequest]s and drives them
//! through an ordered chain of middleware around a language-specific
//! validator, while enforcing resource quotas, circuit breakers, retries,
//! result caching, and telemetry.
//!
//! # Architecture
//!
//! ```text
//! request ──▶ Pipeline ──▶ cache (single-flight) ──▶ admission ──▶ chain ──▶ validator
//!                │                                      ▲            │
//!                │           sampler ───────────────────┘            │
//!                └─────────── metrics ◀──────────────────────────────┘
//!                                │
//!                              alerts
//! ```
//!
//! - [`Pipeline`] is the entry point; build one with [`Pipeline::builder`].
//! - [`registry::Validator`] is the capability the core consumes; concrete
//!   per-language validators live elsewhere.
//! - [`chain::Middleware`] stages add cross-cutting behavior around the
//!   validator call and are protected per-stage by circuit breakers, retry
//!   policies, and deadlines.
//! - The [`admission`] controller bounds queueing and concurrency, reserves
//!   capacity for critical requests, and adapts the concurrency cap to the
//!   CPU trend measured by the [`sampler`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gauntlet::Pipeline;
//! use gauntlet::registry::ValidatorMetadata;
//! use gauntlet::testing::FnValidator;
//! use verdict::ValidationRequest;
//!
//! # async fn example() -> Result<(), verdict::ValidateError> {
//! let pipeline = Pipeline::builder().build();
//! pipeline.register_validator(Arc::new(FnValidator::valid("py")), ValidatorMetadata::default())?;
//!
//! let result = pipeline.validate(ValidationRequest::new("x = 1", "py")).await?;
//! assert!(result.is_valid);
//! # Ok(())
//! # }
//! ```
//!
//! # Teardown
//!
//! Background tasks (sampler, throttle, pruning, health checks, discovery)
//! are owned by the pipeline and stop on [`Pipeline::shutdown`] or when the
//! last clone is dropped. There is no implicit global state.

pub mod admission;
pub mod alerts;
pub mod breaker;
pub mod cache;
pub mod chain;
pub mod config;
pub mod discovery;
pub mod history;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod sampler;
pub mod testing;

mod pipeline;
pub use pipeline::{Pipeline, PipelineBuilder};

#[doc(inline)]
pub use config::PipelineOptions;
