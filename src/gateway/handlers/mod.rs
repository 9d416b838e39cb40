//! Method handlers
//!
//! Handlers receive schema-validated, typed params and return the JSON
//! result of the response frame. Dispatch lives in [`super::dispatch`].

pub mod chat;
pub mod nodes;
pub mod system;
