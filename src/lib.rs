//! Gateway Core - Reliability and Routing Engine for an OpenAI-Compatible Gateway
//!
//! This crate is the headless core of a model gateway: it decides which
//! backend provider serves each request, contains provider failures, and
//! presents every result in the OpenAI wire format regardless of the
//! transport that produced it. It has no HTTP server of its own; a serving
//! layer drives it through [`Gateway`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Serving Layer                            │
//! │        (HTTP framework, CLI, tests — not this crate)          │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ wire types in / out
//! ┌──────────────────────────────┼───────────────────────────────┐
//! │                       GATEWAY CORE                            │
//! │  ┌───────────────────────────┴────────────────────────────┐  │
//! │  │                       Gateway                           │  │
//! │  │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌────────────┐ │  │
//! │  │  │ Facade   │ │ Fallback │ │ Breakers │ │  Health    │ │  │
//! │  │  │cache+queue│ │ Engine  │ │ Registry │ │  Monitor   │ │  │
//! │  │  └──────────┘ └──────────┘ └──────────┘ └────────────┘ │  │
//! │  │  ┌────────────────────────────────────────────────────┐ │  │
//! │  │  │     Adapters: sandbox · http · proxy · local       │ │  │
//! │  │  └────────────────────────────────────────────────────┘ │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Gateway`]: the assembled routing core
//! - [`GatewayError`]: the unified error taxonomy with its fixed wire mapping
//! - [`provider::Provider`]: a configured backend with its model mappings
//! - [`adapter::ProviderAdapter`]: the transport seam the four adapters implement
//! - [`routing`]: breakers, queue, cache, pool, health, fallback, facade
//!
//! # Quick Start
//!
//! ```ignore
//! use gateway_core::{Gateway, config::load_config_or_default};
//! use gateway_core::provider::{InMemoryDirectory, StaticCredentials};
//! use gateway_core::wire::{ChatCompletionRequest, ChatMessage};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config_or_default(None)?;
//!     let directory = Arc::new(InMemoryDirectory::new(config.providers.clone()));
//!     let credentials = Arc::new(StaticCredentials::new(config.credentials.clone()));
//!
//!     let gateway = Gateway::new(&config, directory, credentials);
//!     let _background = gateway.spawn_background();
//!
//!     let response = gateway
//!         .chat_completion(ChatCompletionRequest {
//!             model: "gpt-4".into(),
//!             messages: vec![ChatMessage::user("hello")],
//!             max_tokens: None,
//!             temperature: None,
//!             top_p: None,
//!             stop: None,
//!             stream: false,
//!             user: None,
//!         })
//!         .await?;
//!     println!("{}", response.choices[0].message.content);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod adapter;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod provider;
pub mod routing;
pub mod wire;

pub use config::{load_config, load_config_or_default, GatewayConfig};
pub use error::GatewayError;
pub use events::{EventSink, GatewayEvent};
pub use orchestrator::Gateway;
