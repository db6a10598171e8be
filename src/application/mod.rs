//! Application services: render coordination and error reporting.

pub mod error;
pub mod render;
