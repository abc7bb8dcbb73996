//! Client for the Copilot-style upstream.

pub mod client;
pub mod request;

pub use client::{CopilotClient, read_body};
