//! Capture, inspect and replay webhooks locally.

pub mod capture;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod replay;
pub mod signing;
pub mod templates;
pub mod types;
