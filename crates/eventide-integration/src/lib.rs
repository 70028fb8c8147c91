//! Downstream integration calls for stored events.
//!
//! [`IntegrationClient`] performs the HTTP call that processes an event and
//! hands the outcome to the event store's processing logger, so every
//! attempt leaves a log row without the caller wiring it up. [`TokenCache`]
//! and [`TokenProvider`] supply OAuth2 client-credentials tokens for APIs
//! that need them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use eventide_core::EventId;
//! use eventide_integration::{
//!     ClientConfig, HttpMethod, IntegrationClient, IntegrationRequest,
//! };
//! use eventide_store::{Config, EventStore};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let store = EventStore::from_config(&config)?;
//! let client = IntegrationClient::new(ClientConfig::from_store_config(&config))?
//!     .with_logger(store.logger().clone());
//!
//! let request = IntegrationRequest::new(HttpMethod::Post, "https://erp.example.com/orders")
//!     .with_body(json!({"order": 42}));
//! let report = client.call(EventId(7), request).await;
//! println!("{}", report.outcome.status);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod client;

pub use auth::{ClientCredentials, TokenCache, TokenProvider, DEFAULT_TOKEN_TTL};
pub use client::{CallReport, ClientConfig, HttpMethod, IntegrationClient, IntegrationRequest};
