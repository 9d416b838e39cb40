//! Gateway wire protocol
//!
//! JSON frames over a persistent WebSocket connection:
//!
//! ```text
//! {"type":"req","id":"1","method":"chat.send","params":{...}}
//! {"type":"res","id":"1","ok":true,"result":{...}}
//! {"type":"event","event":"chat","data":{...},"seq":42,"stateVersion":{"presence":3,"health":7}}
//! ```
//!
//! Decoding is strict: unknown top-level properties, missing required
//! properties and wrongly typed values are rejected with `INVALID_REQUEST`
//! naming the offending field(s). Method params are validated against a
//! fixed per-method [`ParamSchema`] before any handler runs.

mod frame;
pub mod methods;
pub mod params;
mod schema;

pub use frame::{
    decode_frame, encode_frame, DecodeError, ErrorCode, ErrorShape, EventFrame, Frame,
    RequestFrame, ResponseFrame, StateVersion, PROTOCOL_VERSION,
};
pub use methods::{MethodAccess, MethodSpec, GATEWAY_EVENTS, GATEWAY_METHODS};
pub use params::{parse_params, ClientMode, ClientRole};
pub use schema::{FieldKind, FieldSpec, ParamSchema};
