//! Typed async client for the external RGB Lightning wallet node.
//!
//! The node is a black-box HTTP server exposing address / UTXO / channel /
//! transfer primitives. This crate owns the wire contract: the serde models,
//! the [`NodeApi`] trait the rest of the workspace programs against, and the
//! reqwest-backed [`NodeClient`] with identity headers, bearer auth, and
//! retry on transient failures.
//!
//! [`NodeApi`]: crate::def::NodeApi
//! [`NodeClient`]: crate::client::NodeClient

pub mod client;
pub mod def;
pub mod error;
pub mod models;

pub use client::NodeClient;
pub use def::NodeApi;
pub use error::NodeApiError;
