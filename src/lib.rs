//! Sonare: a speech rendering server that deduplicates work by content.
//!
//! Every distinct input text is rendered by the configured speech engine at
//! most once; the resulting artifact is stored under its content key and
//! reused by every later request for the same text.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
mod util;
