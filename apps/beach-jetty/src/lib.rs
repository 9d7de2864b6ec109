//! Beach Jetty routes public sandbox URLs to sandbox ports.
//!
//! The control plane turns the sandbox registry into cluster and route
//! resources and pushes them to proxies over aggregated discovery, served as
//! gRPC. The edge answers traffic the proxies could not deliver and carries
//! WebSocket upgrades for the lifetime of each connection.

pub mod ads;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod edge;
pub mod generator;
pub mod health;
pub mod registry;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod wake;
pub mod websocket;
