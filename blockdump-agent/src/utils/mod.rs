//! Utility modules for the backup agent.

pub mod errors;
pub mod logger;

pub use errors::{AgentError, ErrorDetail, ErrorKind, Result};

/// Make an identifier safe to use as a single path component.
pub fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}
