//! Hakoniwa - an on-demand workspace gateway
//!
//! This library provides a single HTTP entry point in front of a Kubernetes
//! cluster that:
//! - Lets authenticated users launch ephemeral sandbox pods ("instances")
//! - Reverse-proxies HTTP and WebSocket traffic to the user's active instance
//! - Tracks traffic as activity and evicts instances idle past a timeout
//! - Reconciles its in-memory instance registry against the cluster
//! - Enforces global, per-user, and per-user-per-type admission quotas
//! - Issues and verifies JWT sessions (anonymous and OpenID Connect logins)

pub mod api;
pub mod assets;
pub mod auth;
pub mod catalog;
pub mod cleaner;
pub mod config;
pub mod docs;
pub mod error;
pub mod gateway;
pub mod instance;
pub mod kubernetes;
pub mod lifecycle;
pub mod proxy;
pub mod reconciler;
pub mod services;
