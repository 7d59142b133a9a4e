//! Sidecar that supervises an agent gateway process, fronts its HTTP port and
//! keeps the gateway's durable state.

pub mod cli;
pub mod config;
pub mod gateway_logs;
pub mod gateway_proxy;
pub mod paths;
pub mod persist;
pub mod router;
pub mod supervisor;
pub mod workspace;
