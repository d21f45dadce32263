//! Unit tests module organization

pub mod cors;
pub mod routing;

// Test utilities and helpers
pub mod helpers;
