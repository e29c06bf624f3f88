//! litfetch-common — Shared identifiers, errors, and the HTTP client used across litfetch crates.

pub mod error;
pub mod http;
pub mod identifiers;

// Re-export commonly used types
pub use error::{LitfetchError, Result};
pub use http::{HttpSettings, PoliteClient, BROWSER_USER_AGENT};
pub use identifiers::{IdentifierField, IdentifierSet};
