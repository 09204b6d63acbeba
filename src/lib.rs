#![warn(clippy::all)]
#![allow(clippy::type_complexity)]

pub mod branch;
pub mod contract;
pub mod coordinator;
pub mod encoding;
pub mod error;
pub mod region;
pub mod table;

pub use coordinator::{BranchDiff, ContractDiff, Coordinator};
pub use error::{Error, Result};
