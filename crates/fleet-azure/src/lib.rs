//! Azure Resource Manager backend for the fleet orchestrator
//!
//! Implements [`fleet_upgrade::ScaleSetClient`] for Azure virtual machine
//! scale sets using a service principal.

#![deny(missing_docs)]

pub mod auth;
pub mod client;
pub mod model;

pub use auth::AzureCredentials;
pub use client::{AzureEndpoints, AzureScaleSetClient};
