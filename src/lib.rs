// deptnet: per-department network fabric for multi-tenant virtualization hosts
// Each department gets a Linux bridge, a dnsmasq instance and a NAT rule,
// kept in line with the tenant records by the reconciler.

pub mod config;
pub mod diagnostics;
pub mod network;
pub mod reconciler;
pub mod store;
pub mod utils;

#[cfg(test)]
mod testing;

pub use config::ReconcilerConfig;
pub use reconciler::{Reconciler, ReconcileError, ReconcileResult};
