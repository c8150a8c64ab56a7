//! Provision a complete runtime topology for a containerized service behind a
//! public TLS edge: an isolated network, segmented trust groups, a
//! health-checked load balancer, DNS-validated certificates, a
//! content-delivery front door, and an auto-scaled container service,
//! repeated identically per deployment stage.

pub mod aws;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
