//! Driver-independent connection helpers.

pub mod tls;
