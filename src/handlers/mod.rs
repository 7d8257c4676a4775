//! HTTP handlers for tenant lookup and provisioning.

pub mod provisioning;
pub mod tenant;

pub use provisioning::*;
pub use tenant::*;
