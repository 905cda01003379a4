//! # Resilience Module
//!
//! Retry support for async operations outside the task queue, such as writes to
//! a state persistence backend.
//!
//! ## Usage
//!
//! ```rust
//! use review_orchestrator::models::RetryPolicy;
//! use review_orchestrator::orchestration::errors::TaskError;
//! use review_orchestrator::resilience::RetryHandler;
//!
//! # async fn example() -> Result<(), TaskError> {
//! let handler = RetryHandler::new();
//! let value = handler
//!     .execute_with_retry("load_config", &RetryPolicy::default_transient(), |_attempt| async {
//!         Ok::<_, TaskError>(42)
//!     })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

pub mod retry;

pub use retry::{RetryHandler, RetryRecord, RetryStats};
