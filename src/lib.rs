//! Dockgate - a reverse-proxy control plane for Docker
//!
//! Watches a Docker network for containers that carry a hostname label and
//! keeps an external serving engine (nginx/OpenResty) in step with them:
//! - Discovers labeled containers and their upstream address on the network
//! - Collapses lifecycle events into single reconciliation passes
//! - Renders the engine configuration from a versioned route table
//! - Validates every candidate configuration before an atomic swap and reload
//! - Resolves a certificate per hostname, falling back to a shared or
//!   self-signed certificate while ACME acquisition is pending or failing

pub mod acme;
pub mod admin;
pub mod certs;
pub mod config;
pub mod docker;
pub mod error;
pub mod labels;
pub mod reconciler;
pub mod reload;
pub mod render;
pub mod routes;
pub mod runtime;
pub mod shutdown;
pub mod watcher;
