//! Scalegate - a reverse proxy that autoscales a pool of identical workers
//!
//! This library provides a single-tenant reverse proxy that:
//! - Manages a dynamic pool of stateless HTTP backend workers
//! - Supports both local processes and Docker containers as workers
//! - Routes each request to the least-loaded healthy worker
//! - Monitors worker health via periodic HTTP probes
//! - Spawns and retires workers within configured bounds based on load
//! - Reclaims orphaned containers from a previous controller lifetime
//! - Streams request and response bodies end-to-end

pub mod autoscaler;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod docker;
pub mod error;
pub mod prober;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod worker;
