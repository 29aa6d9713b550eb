//! An agent-to-agent (A2A) authentication core: services embed it to admit
//! or reject inbound requests from autonomous peer agents, each identified
//! by a cryptographic key pair and, optionally, by role credentials issued
//! as W3C Verifiable Credentials.
//!
//! One call does the work: [`Authenticator::authenticate`] runs rate
//! limiting, registry lookup, bearer-token verification, permission
//! checking, and, when a role is required, a two-message Verifiable
//! Presentation exchange with the peer, returning an immutable
//! [`AuthContext`] or one error from a closed taxonomy. Every external
//! dependency (registry store, DID resolver, peer messaging) sits behind a
//! named circuit breaker, and the sliding-window rate limiter degrades
//! gracefully from its shared store to process memory.
//!
//! The host supplies the outside world through the [`provider::Provider`]
//! traits and adapts the returned errors to its own request model; the
//! core has no web framework, storage engine, or transport of its own.

pub mod agent;
pub mod breaker;
pub mod config;
pub mod core;
pub mod did;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod provider;
pub mod rate_limit;
pub mod registry;
pub mod role_exchange;
pub mod token;
pub mod w3c_vc;

pub use crate::config::Config;
pub use crate::core::{Kind, OneMany};
pub use crate::error::{Error, ErrorResponse, Result};
pub use crate::pipeline::{AuthContext, AuthOptions, AuthOutcome, Authenticator};
pub use crate::provider::Provider;
