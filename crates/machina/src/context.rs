//! The execution context handler functions run against.
//!
//! A [`Context`] is passed to every handler body. It exposes the machine's
//! variables and locals, the trigger payload, and the runtime services a
//! handler may use: sending events, creating machines, asserting, and
//! calling nested functions. Control flow out of a handler — raise, goto,
//! pop, receive — is expressed by returning a [`Flow`], never by unwinding.
//!
//! Payload ownership: [`Context::payload`] is a borrow for the duration of
//! the handler. A handler that needs to retain the payload clones it.

use crate::dispatcher;
use crate::error::{ErrorCode, MachineError};
use crate::log::MachineState;
use crate::machine::{ExecState, Machine};
use crate::process::Process;
use machina_core::{Arg, Value};
use std::sync::Arc;

/// The control-flow result of a handler body.
#[derive(Clone, Debug)]
pub enum Flow {
    /// Fell through to the end of the handler.
    Done,
    /// Dispatch `event` immediately, bypassing the queue.
    Raise {
        /// Event declaration index.
        event: u32,
        /// The payload the raised event carries.
        payload: Value,
    },
    /// Leave the current state for `state`, carrying a payload to its entry.
    Goto {
        /// Destination state index.
        state: u32,
        /// Payload handed to the destination's entry function.
        payload: Value,
    },
    /// Return to the caller of the current state. Only meaningful when push
    /// semantics are compiled in; otherwise fatal.
    Pop,
    /// Park the machine until an event in the receive's case set arrives.
    Receive {
        /// Index of the receive declaration within the current function.
        receive_index: u16,
    },
}

/// The API surface available to a handler body.
pub struct Context<'a> {
    pub(crate) process: &'a Process,
    pub(crate) machine: &'a Arc<Machine>,
    pub(crate) exec: &'a mut ExecState,
}

impl Context<'_> {
    /// This machine's id as a machine-id value.
    pub fn self_id(&self) -> Value {
        self.machine.id_value()
    }

    /// The event that triggered the current handler.
    pub fn trigger_event(&self) -> u32 {
        self.exec.trigger.event
    }

    /// Borrows the trigger payload for the duration of the handler.
    pub fn payload(&self) -> &Value {
        &self.exec.trigger.payload
    }

    /// Index of the current state.
    pub fn current_state(&self) -> u32 {
        self.exec.current_state
    }

    /// Borrows a machine variable by its declaration slot.
    pub fn var(&self, index: usize) -> Result<&Value, MachineError> {
        self.exec
            .variables
            .get(index)
            .ok_or_else(|| MachineError::new(ErrorCode::BadIndex, format!("variable {index}")))
    }

    /// Mutably borrows a machine variable by its declaration slot.
    pub fn var_mut(&mut self, index: usize) -> Result<&mut Value, MachineError> {
        self.exec
            .variables
            .get_mut(index)
            .ok_or_else(|| MachineError::new(ErrorCode::BadIndex, format!("variable {index}")))
    }

    /// Borrows a local of the current function activation.
    pub fn local(&self, index: usize) -> Result<&Value, MachineError> {
        self.exec
            .call_stack
            .last()
            .and_then(|frame| frame.locals.get(index))
            .ok_or_else(|| MachineError::new(ErrorCode::BadIndex, format!("local {index}")))
    }

    /// Mutably borrows a local of the current function activation.
    pub fn local_mut(&mut self, index: usize) -> Result<&mut Value, MachineError> {
        self.exec
            .call_stack
            .last_mut()
            .and_then(|frame| frame.locals.get_mut(index))
            .ok_or_else(|| MachineError::new(ErrorCode::BadIndex, format!("local {index}")))
    }

    /// Language-level assertion. Failure terminates the process.
    pub fn ensure(&self, condition: bool, message: &str) -> Result<(), MachineError> {
        if condition {
            Ok(())
        } else {
            Err(MachineError::assertion(message))
        }
    }

    /// Snapshots this machine's current state.
    pub fn snapshot(&self) -> MachineState {
        self.machine.snapshot_at(self.exec.current_state)
    }

    /// Sends an event to the machine identified by `target`.
    ///
    /// The sender snapshot is captured from this machine first. Failures
    /// (bad target, type mismatch, queue bounds) are reported through the
    /// process's error callback; the handler keeps running.
    pub fn send(&mut self, target: &Value, event: &Value, args: Vec<Arg<'_>>) {
        let sender = self.snapshot();
        if let Ok(receiver) = self.process.machine(target) {
            self.process.send(Some(&sender), &receiver, event, args);
        }
    }

    /// Creates a machine through this machine's link-map row.
    ///
    /// `ior_m` selects the interface-or-machine slot; the child's symbolic
    /// name is resolved through the link map and its concrete declaration
    /// through the def map. Returns the new machine's id value.
    pub fn new_machine(&mut self, ior_m: u32, args: Vec<Arg<'_>>) -> Result<Value, MachineError> {
        let symbolic = self
            .process
            .program()
            .link_target(self.machine.symbolic_name(), ior_m)
            .ok_or_else(|| {
                MachineError::new(
                    ErrorCode::BadIndex,
                    format!("link map slot {ior_m} of machine {}", self.machine.id()),
                )
            })?;
        let machine = self.process.mk_machine(symbolic, args)?;
        Ok(machine.id_value())
    }

    /// Calls a nested function with the given parameters.
    ///
    /// The callee runs in a fresh activation frame; its control-flow result
    /// is returned for the caller to propagate.
    pub fn call(&mut self, fun: u32, params: Vec<Value>) -> Result<Flow, MachineError> {
        dispatcher::invoke_fun(self.process, self.machine, self.exec, fun, params)
    }
}
