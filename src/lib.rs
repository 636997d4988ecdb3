//! Unattended OS package upgrades for Kubernetes nodes.
//!
//! Every node runs one instance. A fleet-wide lock annotation on a shared
//! daemonset makes sure at most one node upgrades (and possibly drains and
//! reboots) at a time, and node conditions report the outcome.

pub mod cluster;
pub mod conditions;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod host;
pub mod k8s;
pub mod lock;
pub mod logging;
pub mod node;
pub mod retry;
pub mod scheduler;
pub mod types;
pub mod upgrader;

#[cfg(test)]
mod testing;
