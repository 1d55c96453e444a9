//! Secret handling utilities.
//!
//! Re-exports secrecy types used for the breaking-service credential.
//! Account auth tokens stay plain strings (they round-trip through the
//! store) and are masked with [`redact`] wherever they are shown.

pub use secrecy::{ExposeSecret, SecretString};

/// Mask all but the last four characters, for log lines that must identify
/// a credential without leaking it.
pub fn redact(value: &str) -> String {
    let count = value.chars().count();
    if count <= 4 {
        return "*".repeat(count);
    }
    let tail: String = value.chars().skip(count - 4).collect();
    format!("{}{tail}", "*".repeat(count - 4))
}
