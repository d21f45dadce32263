//! Endpoint handlers

pub mod docs;
pub mod health;
pub mod proxy;

pub use docs::DocsHandlers;
pub use health::HealthHandlers;
pub use proxy::ProxyHandlers;
