//! Distributor - a multi-tenant edge router and deployment controller
//!
//! This library provides:
//! - A registry of tenant workers keyed by `worker_id.owner_id`
//! - Host header resolution for `*.worker.<domain>` traffic
//! - A reverse router forwarding tenant traffic to in-cluster services
//! - A reconciler converging Deployments, Services and IngressRoutes
//! - A control API for registering and removing workers

pub mod api;
pub mod config;
pub mod error;
pub mod k8s;
pub mod pool;
pub mod proxy;
pub mod reconciler;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod worker;
