//! The stepper: advances one machine by one bounded unit of work.
//!
//! A step is one of: run the pending entry function, dequeue and handle one
//! event (the handling includes any transition's exit and transition
//! function), or service one parked receive. The cursor ([`NextOp`]) lives
//! in the machine's exec state, so a raise or a staged entry survives
//! between steps and is always processed before the next dequeue.
//!
//! Control-flow signals returned by handlers are applied here:
//!
//! - `Raise` stores the raised trigger and yields a handle step, bypassing
//!   the queue;
//! - `Goto` runs the current exit and stages entry of the target with the
//!   carried payload;
//! - `Receive` parks the machine on the declared case set;
//! - `Pop` runs the exit and aborts — push semantics are not compiled in.
//!
//! Entry runs exactly once per state visit, exit exactly once per departure,
//! strictly before the next entry.

use crate::context::{Context, Flow};
use crate::error::{ErrorCode, MachineError};
use crate::log::{LogKind, LogRecord};
use crate::machine::{ExecState, Frame, Machine, NextOp, ReceiveWait, Trigger};
use crate::process::Process;
use crate::program::{StateDecl, EVENT_HALT, EVENT_NULL};
use crate::queue::QueueEntry;
use machina_core::{Type, Value};
use std::sync::Arc;

/// What a step accomplished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    /// A unit of work ran.
    Progress,
    /// The queue held nothing admissible.
    NoWork,
}

/// Advances a claimed machine by one step and releases it.
pub(crate) fn step(process: &Process, machine: &Arc<Machine>) -> StepOutcome {
    let mut exec = machine.lock_exec();
    let outcome = match step_inner(process, machine, &mut exec) {
        Ok(outcome) => outcome,
        Err(err) => {
            handle_error(process, machine, &mut exec, err);
            StepOutcome::Progress
        }
    };
    let pending = exec.next_op != NextOp::Dequeue;
    drop(exec);
    machine.release(pending);
    outcome
}

fn step_inner(
    process: &Process,
    machine: &Arc<Machine>,
    exec: &mut ExecState,
) -> Result<StepOutcome, MachineError> {
    match exec.next_op {
        NextOp::EnterState => {
            run_entry(process, machine, exec)?;
            Ok(StepOutcome::Progress)
        }
        NextOp::HandleEvent => {
            handle_trigger(process, machine, exec)?;
            Ok(StepOutcome::Progress)
        }
        NextOp::Dequeue => {
            let defers = state_decl(machine, exec.current_state)?.defers.clone();
            match machine.dequeue(&defers) {
                None => Ok(StepOutcome::NoWork),
                Some((entry, Some(wait))) => {
                    service_receive(process, machine, exec, entry, wait)?;
                    Ok(StepOutcome::Progress)
                }
                Some((entry, None)) => {
                    log_dequeue(process, machine, exec, &entry);
                    exec.trigger = Trigger {
                        event: entry.event,
                        payload: entry.payload,
                    };
                    handle_trigger(process, machine, exec)?;
                    Ok(StepOutcome::Progress)
                }
            }
        }
    }
}

/// Resolves the trigger in the current state: transition, do-handler, or
/// unhandled.
fn handle_trigger(
    process: &Process,
    machine: &Arc<Machine>,
    exec: &mut ExecState,
) -> Result<(), MachineError> {
    let event = exec.trigger.event;
    let state = state_decl(machine, exec.current_state)?;

    if state.trans_set.contains(event) {
        let trans = state
            .transitions
            .iter()
            .find(|t| t.trigger_event == event)
            .ok_or_else(|| invariant("transition record missing for trigger"))?;
        let mut dest = trans.dest_state;
        let trans_fun = trans.trans_fun;

        run_exit(process, machine, exec)?;
        if let Some(fun) = trans_fun {
            match invoke_fun(process, machine, exec, fun, Vec::new())? {
                Flow::Done => {}
                // The target is entered first (entry runs once per visit);
                // the raised event is handled before any dequeue.
                Flow::Raise { event, payload } => exec.raised.push(Trigger { event, payload }),
                // A goto in a transition function redirects the transition.
                Flow::Goto { state, payload } => {
                    dest = state;
                    exec.trigger = Trigger {
                        event: EVENT_NULL,
                        payload,
                    };
                }
                Flow::Receive { .. } => {
                    return Err(invariant("receive in a transition function"))
                }
                Flow::Pop => return Err(invariant("pop in a transition function")),
            }
        }
        change_state(machine, exec, dest)?;
        exec.next_op = NextOp::EnterState;
        Ok(())
    } else if state.do_set.contains(event) {
        let decl = state
            .dos
            .iter()
            .find(|d| d.trigger_event == event)
            .ok_or_else(|| invariant("do record missing for trigger"))?;
        let fun = decl.do_fun;
        let flow = invoke_fun(process, machine, exec, fun, Vec::new())?;
        apply_flow(process, machine, exec, flow, fun)
    } else if event == EVENT_HALT {
        halt_machine(process, machine, exec);
        Ok(())
    } else {
        let snapshot = machine.snapshot_at(exec.current_state);
        let name = machine
            .program()
            .event(event)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| event.to_string());
        process.report(
            ErrorCode::UnhandledEvent,
            Some(&snapshot),
            &format!("event `{}` in state `{}`", name, snapshot.state_name),
        );
        halt_machine(process, machine, exec);
        Ok(())
    }
}

/// Runs the current state's entry function with the staged trigger.
fn run_entry(
    process: &Process,
    machine: &Arc<Machine>,
    exec: &mut ExecState,
) -> Result<(), MachineError> {
    let entry_fun = state_decl(machine, exec.current_state)?.entry_fun;
    process.log_record(&LogRecord {
        kind: LogKind::Enter,
        event: Some(exec.trigger.event),
        payload: Some(exec.trigger.payload.clone()),
        machine: machine.snapshot_at(exec.current_state),
        sender: None,
    });
    tracing::trace!(
        machine = %machine.id(),
        state = exec.current_state,
        "entering state"
    );
    match entry_fun {
        Some(fun) => {
            let flow = invoke_fun(process, machine, exec, fun, Vec::new())?;
            apply_flow(process, machine, exec, flow, fun)
        }
        None => {
            finish_handler(exec);
            Ok(())
        }
    }
}

/// Runs a parked receive's selected case for the dequeued event.
fn service_receive(
    process: &Process,
    machine: &Arc<Machine>,
    exec: &mut ExecState,
    entry: QueueEntry,
    wait: ReceiveWait,
) -> Result<(), MachineError> {
    log_dequeue(process, machine, exec, &entry);
    let case = wait
        .cases
        .iter()
        .find(|c| c.trigger_event == entry.event)
        .ok_or_else(|| invariant("dequeued event outside the receive case set"))?;
    let fun = case.fun;
    exec.trigger = Trigger {
        event: entry.event,
        payload: entry.payload,
    };
    let flow = invoke_fun(process, machine, exec, fun, Vec::new())?;
    apply_flow(process, machine, exec, flow, fun)
}

/// Applies a handler's control-flow result.
fn apply_flow(
    process: &Process,
    machine: &Arc<Machine>,
    exec: &mut ExecState,
    flow: Flow,
    fun: u32,
) -> Result<(), MachineError> {
    match flow {
        Flow::Done => {
            finish_handler(exec);
            Ok(())
        }
        Flow::Raise { event, payload } => {
            exec.trigger = Trigger { event, payload };
            exec.next_op = NextOp::HandleEvent;
            Ok(())
        }
        Flow::Goto { state, payload } => {
            run_exit(process, machine, exec)?;
            exec.trigger = Trigger {
                event: EVENT_NULL,
                payload,
            };
            change_state(machine, exec, state)?;
            exec.next_op = NextOp::EnterState;
            Ok(())
        }
        Flow::Receive { receive_index } => {
            let decl = machine
                .program()
                .machine(machine.instance_of())
                .and_then(|m| m.fun(fun))
                .and_then(|f| f.receives.iter().find(|r| r.receive_index == receive_index))
                .ok_or_else(|| invariant("receive declaration missing"))?;
            machine.park_receive(ReceiveWait {
                case_set: decl.case_set.clone(),
                cases: decl.cases.clone(),
            });
            exec.next_op = NextOp::Dequeue;
            Ok(())
        }
        Flow::Pop => {
            run_exit(process, machine, exec)?;
            Err(invariant("pop without a state stack"))
        }
    }
}

/// After a handler completes: a staged raise preempts the queue, otherwise
/// the machine goes back to dequeuing.
fn finish_handler(exec: &mut ExecState) {
    if let Some(trigger) = exec.raised.pop() {
        exec.trigger = trigger;
        exec.next_op = NextOp::HandleEvent;
    } else {
        exec.next_op = NextOp::Dequeue;
    }
}

/// Runs the current state's exit function, which must run to completion.
fn run_exit(
    process: &Process,
    machine: &Arc<Machine>,
    exec: &mut ExecState,
) -> Result<(), MachineError> {
    let exit_fun = state_decl(machine, exec.current_state)?.exit_fun;
    match exit_fun {
        Some(fun) => match invoke_fun(process, machine, exec, fun, Vec::new())? {
            Flow::Done => Ok(()),
            _ => Err(invariant("control flow escaped an exit function")),
        },
        None => Ok(()),
    }
}

/// Calls a function in a fresh activation frame.
///
/// Locals are the parameters, then defaults from the declared locals type,
/// padded with null up to `max_locals`.
pub(crate) fn invoke_fun(
    process: &Process,
    machine: &Arc<Machine>,
    exec: &mut ExecState,
    fun: u32,
    params: Vec<Value>,
) -> Result<Flow, MachineError> {
    let decl = machine
        .program()
        .machine(machine.instance_of())
        .and_then(|m| m.fun(fun))
        .ok_or_else(|| MachineError::new(ErrorCode::BadIndex, format!("function {fun}")))?;
    if params.len() != decl.params as usize {
        return Err(MachineError::new(
            ErrorCode::BadIndex,
            format!(
                "function `{}` takes {} parameters, got {}",
                decl.name,
                decl.params,
                params.len()
            ),
        ));
    }
    let mut locals = params;
    if let Some(Type::NamedTuple(fields)) = &decl.locals_type {
        for (_, ty) in fields.iter().skip(locals.len()) {
            locals.push(machine.program().default_value(ty)?);
        }
    }
    while locals.len() < decl.max_locals as usize {
        locals.push(Value::Null);
    }
    let implementation = decl.implementation.clone();

    exec.call_stack.push(Frame { fun, locals });
    let mut ctx = Context {
        process,
        machine,
        exec: &mut *exec,
    };
    let result = implementation(&mut ctx);
    exec.call_stack.pop();
    result
}

fn change_state(
    machine: &Arc<Machine>,
    exec: &mut ExecState,
    dest: u32,
) -> Result<(), MachineError> {
    if machine
        .program()
        .machine(machine.instance_of())
        .and_then(|m| m.state(dest))
        .is_none()
    {
        return Err(MachineError::new(
            ErrorCode::BadIndex,
            format!("goto target state {dest}"),
        ));
    }
    exec.current_state = dest;
    machine.note_state_change(dest);
    Ok(())
}

/// Halts the machine: logs the halt, drops the queue, clears execution
/// state. Variables stay readable.
fn halt_machine(process: &Process, machine: &Arc<Machine>, exec: &mut ExecState) {
    process.log_record(&LogRecord {
        kind: LogKind::Halt,
        event: None,
        payload: None,
        machine: machine.snapshot_at(exec.current_state),
        sender: None,
    });
    tracing::debug!(machine = %machine.id(), "machine halted");
    machine.mark_halted();
    exec.call_stack.clear();
    exec.raised.clear();
    exec.next_op = NextOp::Dequeue;
}

/// Routes a handler failure per the error taxonomy: recoverable errors halt
/// the instance, assertions terminate the process, invariants abort.
fn handle_error(process: &Process, machine: &Arc<Machine>, exec: &mut ExecState, err: MachineError) {
    let snapshot = machine.snapshot_at(exec.current_state);
    process.report(err.code, Some(&snapshot), &err.message);
    match err.code {
        ErrorCode::InternalInvariant => panic!("internal invariant violated: {}", err.message),
        ErrorCode::AssertionFailed => process.begin_terminate(),
        _ => halt_machine(process, machine, exec),
    }
}

fn log_dequeue(process: &Process, machine: &Arc<Machine>, exec: &ExecState, entry: &QueueEntry) {
    process.log_record(&LogRecord {
        kind: LogKind::Dequeue,
        event: Some(entry.event),
        payload: Some(entry.payload.clone()),
        machine: machine.snapshot_at(exec.current_state),
        sender: entry.sender.clone(),
    });
    tracing::trace!(
        machine = %machine.id(),
        event = entry.event,
        "dequeued event"
    );
}

fn state_decl<'m>(machine: &'m Arc<Machine>, state: u32) -> Result<&'m StateDecl, MachineError> {
    machine
        .program()
        .machine(machine.instance_of())
        .and_then(|m| m.state(state))
        .ok_or_else(|| invariant("current state missing from the machine declaration"))
}

fn invariant(message: &str) -> MachineError {
    MachineError::new(ErrorCode::InternalInvariant, message)
}
