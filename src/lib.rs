//! Proxyfleet - A control plane for a fleet of Caddy-compatible reverse proxies
//!
//! This library provides:
//! - A registry of proxy servers and of JSON configuration documents
//! - Local structural validation of configurations (listen conflicts, proxy warnings)
//! - Deployment of a configuration to many servers with per-target outcomes
//! - Supersession bookkeeping so each server has at most one live configuration
//! - Periodic and on-demand health probing of every server's admin endpoint
//! - SQLite and JSON document storage backends behind one repository trait

pub mod api;
pub mod config;
pub mod db;
pub mod deploy;
pub mod docstore;
pub mod error;
pub mod fleet;
pub mod gateway;
pub mod health;
pub mod models;
pub mod repository;
pub mod validator;
