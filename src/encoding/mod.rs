//! Binary data encodings.
//!
//! - bincode: used for Raft command payloads (contract and branch diffs).
pub mod bincode;
