//! Sentry Gate - JSON-RPC and WebSocket gateway for blockchain nodes
//!
//! This crate implements a reverse proxy that sits in front of a node
//! cluster. Transaction submissions go to a sentry node, reads go to origin
//! nodes, and a few cheap calls are answered locally. Clients are held to
//! per-IP fixed-window quotas that survive restarts through snapshots.

pub mod collab;
pub mod config;
pub mod error;
pub mod identity;
pub mod proxy;
pub mod ratelimit;
pub mod rpc;
