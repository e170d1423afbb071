//! # machina-core
//!
//! Value and type system for the machina runtime: tagged deep values,
//! type terms with default construction and conformance checking, process
//! and machine identity, and host-supplied foreign types.
//!
//! This crate is pure data — no locks, no scheduling. The runtime lives in
//! the `machina` crate.

#![warn(missing_docs)]

mod foreign;
mod id;
mod types;
mod value;

pub use foreign::{ForeignData, ForeignResolver, ForeignValue, ForeignVtable};
pub use id::{MachineId, ProcessGuid};
pub use types::Type;
pub use value::{payload_from_args, Arg, NamedTuple, Value, ValueError, ValueMap, ValueSet};
