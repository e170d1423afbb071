//! # machina
//!
//! A runtime core for programs of communicating state machines: an
//! in-process scheduler, machine-instance lifecycle manager, per-instance
//! event queues, and a dispatch engine.
//!
//! A program is a static declaration tree of events, machines, states,
//! transitions, and handler functions ([`Program`]). The runtime brings the
//! declarations to life: [`Process::mk_machine`] creates instances,
//! [`Process::send`] routes events into their queues, and host threads
//! drive handler execution through [`Process::run`] or [`Process::step`].
//!
//! # Quick start
//!
//! ```ignore
//! use machina::{Process, Program, SchedulingPolicy, StepResult};
//! use machina_core::ProcessGuid;
//! use std::sync::Arc;
//!
//! let mut program = Program::new();
//! // ... declare events, machines, states, handlers ...
//! program.initialize()?;
//!
//! let process = Process::start(
//!     ProcessGuid::new(1, 0, 0, 0),
//!     Arc::new(program),
//!     Arc::new(|code, state, msg| eprintln!("{code}: {msg}")),
//!     Arc::new(|record| { /* feed a log sink */ }),
//! );
//!
//! let client = process.mk_machine(0, vec![])?;
//! while process.step() == StepResult::More {}
//! process.stop();
//! ```
//!
//! # Concurrency model
//!
//! Host threads cooperate through explicit locks and semaphores; there is
//! no hidden runtime thread. At most one worker executes handlers of a
//! given instance at a time, sends from one machine to another preserve
//! program order, and a handler body never suspends except at a declared
//! receive.

#![warn(missing_docs)]

mod context;
mod dispatcher;
mod error;
mod eventset;
mod log;
mod machine;
mod process;
mod program;
mod queue;
mod scheduler;

pub use context::{Context, Flow};
pub use error::{ErrorCode, ErrorFn, MachineError};
pub use eventset::EventSet;
pub use log::{LogFn, LogKind, LogRecord, MachineState};
pub use machine::{LastOperation, Machine, MachineStatus};
pub use process::{Process, ProcessOptions};
pub use program::{
    CaseDecl, DoDecl, EventDecl, ForeignTypeDecl, FunDecl, HandlerImpl, MachineDecl, Program,
    ProgramError, ReceiveDecl, StateDecl, TransDecl, VarDecl, EVENT_HALT, EVENT_NULL,
};
pub use scheduler::{SchedulingPolicy, StepResult};

// Re-export the value layer so hosts depend on one crate.
pub use machina_core::{
    payload_from_args, Arg, ForeignData, ForeignResolver, ForeignValue, ForeignVtable, MachineId,
    NamedTuple, ProcessGuid, Type, Value, ValueError, ValueMap, ValueSet,
};
