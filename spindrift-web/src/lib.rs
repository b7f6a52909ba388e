//! HTTP delivery surface for Spindrift.
//!
//! Exposes streaming with byte-range support, server-sent progress
//! events, and media management over the core download session manager.

pub mod handlers;
pub mod server;

pub use server::{AppState, router, run_server};
