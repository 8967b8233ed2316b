//! Types shared by the graph and every backend.

pub mod error;
pub mod name;
