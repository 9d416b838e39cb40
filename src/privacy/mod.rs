//! Secret redaction
//!
//! Error messages and log lines can carry credentials echoed back by a
//! backend or adapter. Everything that leaves the dispatch boundary is
//! passed through [`redact_secrets`] first.

mod redact;

pub use redact::{mask_token, redact_secrets, Redactor};
