//! Chat run registry and cancellation
//!
//! One [`ChatRunEntry`] per in-flight agent invocation. Each run moves
//! through
//!
//! ```text
//! pending ──first delta──▶ streaming ──completion──▶ final
//!    │                         │
//!    ├──────── failure ────────┴──────────────────▶ error
//!    └──────── cancel (any non-terminal) ─────────▶ aborted
//! ```
//!
//! At most one active run exists per `(sessionKey, clientRunId)`; a second
//! start for the same pair returns the existing run. Cancelled runs are
//! remembered in a short-lived side table so late backend events are
//! swallowed instead of delivered.

mod event;
mod registry;
mod run;
pub mod runner;

pub use event::{ChatEvent, ChatEventState};
pub use registry::{
    CancelOutcome, ChatRunRegistry, CreateOutcome, Delivery, DropReason, Ingest, RunRegistryConfig,
};
pub use run::{ChatRunEntry, RunEvent, RunHandle, RunState, RunSummary};
