//! Gatehouse - a process supervisor and prefix-routing reverse proxy
//!
//! This library provides a small front server that:
//! - Launches a fixed set of backend services as child processes
//! - Waits for every service to answer HTTP on its loopback port before
//!   opening the public listener
//! - Routes each request to one service by URL prefix, redirecting bare
//!   prefixes to their trailing-slash form
//! - Streams requests and responses through without buffering and turns
//!   upstream failures into 502 responses
//! - Kills every service and exits on SIGTERM/SIGINT, or exits non-zero when
//!   a service dies

pub mod app;
pub mod config;
pub mod error;
pub mod launcher;
pub mod pool;
pub mod probe;
pub mod proxy;
pub mod routing;
pub mod shutdown;
pub mod supervisor;
