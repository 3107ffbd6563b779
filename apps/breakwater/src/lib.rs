//! Breakwater relay server: accepts public HTTP requests on behalf of
//! targets behind a firewall and relays them over a long-lived tunnel link
//! to connector processes.

pub mod config;
pub mod context;
pub mod dispatch;
pub mod ingress;
pub mod statistics;
