//! Edge reconciler: keeps the task containers of an edge node converged with the desired
//! state published by a remote center.

pub mod center;
pub mod config;
pub mod container;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod kind;
pub mod model;
pub mod node;
pub mod pool;
pub mod ports;
pub mod store;

#[cfg(test)]
mod testing;
