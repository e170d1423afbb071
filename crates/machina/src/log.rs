//! Host-facing log records.
//!
//! The runtime reports its observable steps — sends, dequeues, state
//! entries, machine creation, halts — through the process's log callback.
//! Each record carries a [`MachineState`] snapshot of the machine it
//! concerns. The same points also emit `tracing` events for in-process
//! diagnostics.

use machina_core::{MachineId, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A point-in-time snapshot of a machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    /// The machine's id.
    pub machine: MachineId,
    /// Name of the machine declaration.
    pub machine_name: String,
    /// Index of the current state.
    pub state: u32,
    /// Name of the current state.
    pub state_name: String,
}

/// What a log record reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    /// A machine instance was created.
    Create,
    /// An event was enqueued to a machine.
    Send,
    /// An event was dequeued for handling.
    Dequeue,
    /// A state was entered (initial entry, transition, or goto).
    Enter,
    /// A machine halted.
    Halt,
}

/// A single log record.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// What happened.
    pub kind: LogKind,
    /// The event involved, if any.
    pub event: Option<u32>,
    /// The payload involved, if any.
    pub payload: Option<Value>,
    /// Snapshot of the machine the record concerns.
    pub machine: MachineState,
    /// Snapshot of the sender, for send records that have one.
    pub sender: Option<MachineState>,
}

/// The host's log callback.
pub type LogFn = Arc<dyn Fn(&LogRecord) + Send + Sync>;
