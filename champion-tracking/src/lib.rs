//! # Champion Tracking
//!
//! HTTP backend for champion discovery and artifact resolution: an
//! [`MlflowTrackingClient`] that implements
//! [`champion_core::tracking::TrackingService`] against the MLflow REST API.
//!
//! ```no_run
//! use champion_core::tracking::{RunQuery, TrackingService};
//! use champion_tracking::MlflowTrackingClient;
//!
//! # async fn demo() -> Result<(), champion_core::error::TrackingError> {
//! let client = MlflowTrackingClient::new("http://localhost:5000", vec!["1".into()])?;
//! let runs = client
//!     .search_runs(&RunQuery::new(50).with_tag("champion.study_key_hash", "abc"))
//!     .await?;
//! println!("{} runs", runs.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod models;

pub use client::{MlflowTrackingClient, build_filter};
