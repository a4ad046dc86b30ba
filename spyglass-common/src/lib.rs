//! Shared plumbing for the spyglass services.

pub mod rate;

pub use rate::RateLimiter;
