//! Proxyvisor - supervises local API-proxy processes and balances traffic across them
//!
//! This library provides:
//! - A process supervisor that owns at most one process per configured backend
//! - Credential inspection that reports which account each backend is logged in as
//! - A JSON control API for start/stop/login/logout and status queries
//! - A round-robin HTTP load balancer over every configured backend port
//! - Connection pooling for efficient backend communication

pub mod balancer;
pub mod config;
pub mod control;
pub mod credentials;
pub mod dashboard;
pub mod error;
pub mod login;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod registry;
