//! Watch/Reconcile Core
//!
//! Shared plumbing for the VIP controllers:
//!
//! - [`ResourceStore`]: the only door to the orchestration API, with a
//!   kube-backed implementation and (behind `test-util`) an in-memory one
//! - [`WatchLoop`]: list-then-watch loop that resumes from its cursor,
//!   relists when the cursor expires and filters by namespace
//! - [`EventHandler`]: the per-kind reaction seam reconcilers implement
//! - probe/metrics endpoint, signal handling and logging setup
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use crds::Vip;
//! use reconcile_core::{EventHandler, KubeStore, NamespaceFilter, ResourceEvent, WatchLoop};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl EventHandler<Vip> for Printer {
//!     async fn handle(&self, event: ResourceEvent<Vip>) {
//!         println!("{}", event.kind());
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let token = CancellationToken::new();
//! WatchLoop::<Vip>::new(
//!     Arc::new(KubeStore::<Vip>::new(client)),
//!     Arc::new(Printer),
//!     NamespaceFilter::new(["default"]),
//!     token,
//! )
//! .run()
//! .await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod cursor;
pub mod error;
pub mod event;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod watcher;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use backoff::FibonacciBackoff;
pub use cursor::WatchCursor;
pub use error::StoreError;
pub use event::{EventHandler, ResourceEvent, WatchEvent, WatchFault};
pub use metrics::Metrics;
pub use server::Readiness;
pub use store::{EventStream, KubeStore, Listing, ResourceStore};
pub use watcher::{NamespaceFilter, WatchLoop};

#[cfg(any(test, feature = "test-util"))]
pub use mock::MemoryStore;
