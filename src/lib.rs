//! Tollgate - request governance for agent services
//!
//! Tollgate sits between clients and an expensive, rate-limited AI agent.
//! Every call goes through a [`RequestGovernor`], which applies in order:
//!
//! 1. per-client admission control ([`RateLimiter`], token buckets)
//! 2. a response cache keyed on normalized request parameters ([`ResponseCache`])
//! 3. a token-budget check that rejects oversized requests before any upstream
//!    cost is incurred ([`TokenBudgetManager`])
//! 4. the agent call itself, under a bounded retry policy ([`RetryExecutor`])
//! 5. atomic persistence of produced artifacts ([`StorageRouter`])
//!
//! and records exactly one outcome per request in a [`MetricsCollector`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tollgate::governor::GovernedRequest;
//! use tollgate::types::{AgentQuery, ChatRequest};
//! use tollgate::{HttpAgentClient, RequestGovernor, StorageRouter};
//!
//! #[tokio::main]
//! async fn main() -> tollgate::Result<()> {
//!     let governor = RequestGovernor::builder()
//!         .agent(Arc::new(HttpAgentClient::new("http://localhost:2024")?))
//!         .storage(StorageRouter::new("/tmp/tollgate/reports", "/tmp/tollgate/memories")?)
//!         .build()?;
//!
//!     let chat = ChatRequest::new("Find 3-bedroom homes in Austin under $500k");
//!     let request = GovernedRequest::new("127.0.0.1", "example", AgentQuery::from_chat(&chat));
//!     let response = governor.handle(request).await?;
//!
//!     println!("{}", response.result.reply().unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `server` (default): the axum HTTP surface in [`server`] and the
//!   `tollgated` binary.

pub mod agent;
pub mod budget;
pub mod cache;
pub mod config;
pub mod error;
pub mod governor;
pub mod monitor;
pub mod ratelimit;
pub mod retry;
#[cfg(feature = "server")]
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod types;

/// Package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export main types at crate root
pub use agent::{AgentInvoker, HttpAgentClient};
pub use budget::{BudgetConfig, BudgetRejection, TokenBudget, TokenBudgetManager};
pub use cache::{CacheBackend, CacheConfig, CacheKey, MemoryBackend, ResponseCache};
pub use config::Config;
pub use error::{Result, TollgateError};
pub use governor::{GovernedRequest, GovernedResponse, RequestGovernor};
pub use monitor::{MetricsCollector, MetricsSnapshot};
pub use ratelimit::{Admission, RateLimitConfig, RateLimiter};
pub use retry::{RetryConfig, RetryExecutor};
pub use storage::{Category, Format, StorageRouter};
