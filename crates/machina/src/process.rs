//! The process container.
//!
//! A [`Process`] owns everything with a lifetime: the machine table, the
//! scheduler state, and the host callbacks. The program declaration tree is
//! shared read-only. One coarse lock guards the table, the terminating
//! flag, and scheduler bookkeeping; per-instance locks stay below it, and
//! the dispatcher holds no process lock while a handler body runs.

use crate::dispatcher;
use crate::error::{ErrorCode, ErrorFn, MachineError};
use crate::log::{LogFn, LogKind, LogRecord, MachineState};
use crate::machine::Machine;
use crate::program::{Program, EVENT_NULL};
use crate::scheduler::{CooperativeScheduler, SchedulingPolicy, StepResult};
use machina_core::{payload_from_args, Arg, MachineId, ProcessGuid, Value};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Tunable process behavior.
#[derive(Clone, Copy, Debug)]
pub struct ProcessOptions {
    /// Reject machine-id lookups whose GUID belongs to another process.
    /// Defaults to `true`; mismatches report `BadIndex`.
    pub require_guid_match: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            require_guid_match: true,
        }
    }
}

struct ProcessInner {
    machines: Vec<Arc<Machine>>,
    terminating: bool,
    policy: SchedulingPolicy,
    coop: Option<Arc<CooperativeScheduler>>,
    threads_waiting: u32,
    last_stepped: usize,
}

/// A running process: machine table, scheduler, callbacks.
pub struct Process {
    guid: ProcessGuid,
    program: Arc<Program>,
    options: ProcessOptions,
    error_fun: ErrorFn,
    log_fun: LogFn,
    inner: Mutex<ProcessInner>,
    /// Task-neutral idle waiters park here; enqueues and `stop` notify.
    work_cond: Condvar,
}

impl Process {
    /// Constructs a process with default options.
    ///
    /// The program must have been initialized.
    pub fn start(
        guid: ProcessGuid,
        program: Arc<Program>,
        error_fun: ErrorFn,
        log_fun: LogFn,
    ) -> Arc<Self> {
        Self::start_with(guid, program, error_fun, log_fun, ProcessOptions::default())
    }

    /// Constructs a process with explicit options.
    pub fn start_with(
        guid: ProcessGuid,
        program: Arc<Program>,
        error_fun: ErrorFn,
        log_fun: LogFn,
        options: ProcessOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            guid,
            program,
            options,
            error_fun,
            log_fun,
            inner: Mutex::new(ProcessInner {
                machines: Vec::new(),
                terminating: false,
                policy: SchedulingPolicy::TaskNeutral,
                coop: None,
                threads_waiting: 0,
                last_stepped: 0,
            }),
            work_cond: Condvar::new(),
        })
    }

    /// The process GUID.
    pub fn guid(&self) -> ProcessGuid {
        self.guid
    }

    /// The program this process runs.
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Returns `true` once termination has been requested.
    pub fn is_terminating(&self) -> bool {
        self.inner.lock().terminating
    }

    /// Selects the scheduling policy. Setting the current policy again is a
    /// no-op; switching to cooperative allocates the semaphore pair,
    /// switching away destroys it.
    pub fn set_scheduling_policy(&self, policy: SchedulingPolicy) {
        let mut inner = self.inner.lock();
        if inner.policy == policy {
            return;
        }
        inner.policy = policy;
        inner.coop = match policy {
            SchedulingPolicy::Cooperative => Some(Arc::new(CooperativeScheduler::new())),
            SchedulingPolicy::TaskNeutral => None,
        };
    }

    /// Creates a machine from a symbolic name, runs its initial entry with
    /// the constructor payload, and keeps stepping it until it goes idle,
    /// blocks, or halts.
    pub fn mk_machine(
        &self,
        symbolic_name: u32,
        args: Vec<Arg<'_>>,
    ) -> Result<Arc<Machine>, MachineError> {
        let instance_of = match self.program.def_target(symbolic_name) {
            Some(index) => index,
            None => {
                let err = MachineError::new(
                    ErrorCode::BadIndex,
                    format!("symbolic machine name {symbolic_name}"),
                );
                self.report(err.code, None, &err.message);
                return Err(err);
            }
        };
        let decl = self
            .program
            .machine(instance_of)
            .expect("validated def map");
        let payload_type = decl
            .state(decl.init_state)
            .and_then(|state| state.entry_fun)
            .and_then(|fun| decl.fun(fun))
            .and_then(|fun| fun.payload_type.as_ref());
        let payload = match payload_from_args(args, payload_type) {
            Ok(payload) => payload,
            Err(err) => {
                let err = MachineError::from(err);
                self.report(err.code, None, &err.message);
                return Err(err);
            }
        };

        let created = {
            let mut inner = self.inner.lock();
            let index = inner.machines.len() as u32 + 1;
            let id = MachineId::new(self.guid, index, decl.name.clone());
            Machine::new(
                self.program.clone(),
                symbolic_name,
                instance_of,
                id,
                payload,
            )
            .map(|machine| {
                inner.machines.push(machine.clone());
                machine
            })
        };
        let machine = match created {
            Ok(machine) => machine,
            Err(err) => {
                self.report(err.code, None, &err.message);
                return Err(err);
            }
        };

        self.log_record(&LogRecord {
            kind: LogKind::Create,
            event: None,
            payload: None,
            machine: machine.snapshot(),
            sender: None,
        });
        tracing::debug!(machine = %machine.id(), "created machine");
        self.run_to_quiescence(&machine);
        Ok(machine)
    }

    /// Enqueues `event` with a payload built from `args` to `receiver`.
    ///
    /// Failures — a non-event value, the null event, a payload that does not
    /// conform to the event's declared type, queue bounds, a halted
    /// receiver — are reported through the error callback and the send is
    /// dropped; the receiver is left untouched.
    pub fn send(
        &self,
        sender: Option<&MachineState>,
        receiver: &Machine,
        event: &Value,
        args: Vec<Arg<'_>>,
    ) {
        let event_index = match event.as_event() {
            Some(index) => index,
            None => {
                self.report(
                    ErrorCode::TypeMismatch,
                    Some(&receiver.snapshot()),
                    &format!("send requires an event value, got a {}", event.kind()),
                );
                return;
            }
        };
        if event_index == EVENT_NULL {
            self.report(
                ErrorCode::IllegalSend,
                Some(&receiver.snapshot()),
                "the null event cannot be sent",
            );
            return;
        }
        let decl = match self.program.event(event_index) {
            Some(decl) => decl,
            None => {
                self.report(
                    ErrorCode::BadIndex,
                    Some(&receiver.snapshot()),
                    &format!("event {event_index} out of range"),
                );
                return;
            }
        };
        let payload = match payload_from_args(args, Some(&decl.payload_type)) {
            Ok(payload) => payload,
            Err(err) => {
                let err = MachineError::from(err);
                self.report(err.code, Some(&receiver.snapshot()), &err.message);
                return;
            }
        };
        if !payload.conforms_to(&decl.payload_type) {
            self.report(
                ErrorCode::TypeMismatch,
                Some(&receiver.snapshot()),
                &format!(
                    "payload of kind {} for event `{}`",
                    payload.kind(),
                    decl.name
                ),
            );
            return;
        }

        let record_payload = payload.clone();
        match receiver.enqueue(decl, payload, sender.cloned()) {
            Err(code) => {
                self.report(code, Some(&receiver.snapshot()), &format!("event `{}`", decl.name));
            }
            Ok(notify) => {
                self.log_record(&LogRecord {
                    kind: LogKind::Send,
                    event: Some(event_index),
                    payload: Some(record_payload),
                    machine: receiver.snapshot(),
                    sender: sender.cloned(),
                });
                tracing::trace!(
                    machine = %receiver.id(),
                    event = event_index,
                    "enqueued event"
                );
                if notify {
                    self.schedule_work();
                }
            }
        }
    }

    /// Looks up a machine by a machine-id value.
    ///
    /// The value kind, the GUID (when `require_guid_match` is set), and the
    /// index range are validated; failures report `BadIndex`.
    pub fn machine(&self, id: &Value) -> Result<Arc<Machine>, MachineError> {
        let mid = match id.as_machine() {
            Some(mid) => mid,
            None => {
                let err = MachineError::new(
                    ErrorCode::BadIndex,
                    format!("machine lookup on a {} value", id.kind()),
                );
                self.report(err.code, None, &err.message);
                return Err(err);
            }
        };
        if self.options.require_guid_match && mid.process != self.guid {
            let err = MachineError::new(
                ErrorCode::BadIndex,
                format!("machine id {mid} belongs to another process"),
            );
            self.report(err.code, None, &err.message);
            return Err(err);
        }
        let inner = self.inner.lock();
        let index = mid.index as usize;
        if index == 0 || index > inner.machines.len() {
            drop(inner);
            let err = MachineError::new(
                ErrorCode::BadIndex,
                format!("machine id {} out of range", mid.index),
            );
            self.report(err.code, None, &err.message);
            return Err(err);
        }
        Ok(inner.machines[index - 1].clone())
    }

    /// Snapshots a machine's (id, name, state id, state name).
    pub fn machine_state(&self, machine: &Machine) -> MachineState {
        machine.snapshot()
    }

    /// Advances one runnable machine by one step.
    ///
    /// Selection is round-robin over the table, starting after the last
    /// stepped index.
    pub fn step(&self) -> StepResult {
        let (machines, start) = {
            let inner = self.inner.lock();
            if inner.terminating {
                return StepResult::Terminating;
            }
            (inner.machines.clone(), inner.last_stepped)
        };
        if machines.is_empty() {
            return StepResult::Idle;
        }
        let n = machines.len();
        for offset in 1..=n {
            let index = (start + offset) % n;
            let machine = &machines[index];
            if machine.claim() {
                dispatcher::step(self, machine);
                self.inner.lock().last_stepped = index;
                return StepResult::More;
            }
        }
        StepResult::Idle
    }

    /// Drives stepping on the calling thread until the process terminates.
    ///
    /// Under the cooperative policy the caller becomes one of the worker
    /// pool; under task-neutral it is the single logical worker, parking on
    /// the process condvar while nothing is runnable.
    pub fn run(&self) {
        loop {
            match self.step() {
                StepResult::Terminating => return,
                StepResult::More => std::thread::yield_now(),
                StepResult::Idle => {
                    let cooperative = self.inner.lock().coop.is_some();
                    let terminating = if cooperative {
                        self.wait_for_work()
                    } else {
                        self.wait_task_neutral()
                    };
                    if terminating {
                        return;
                    }
                }
            }
        }
    }

    /// Cooperative-only: blocks until an enqueue or termination wakes the
    /// worker. Returns the terminating flag.
    ///
    /// The last waiting worker to observe termination signals the
    /// all-threads-stopped semaphore `stop` waits on.
    pub fn wait_for_work(&self) -> bool {
        let info = {
            let mut inner = self.inner.lock();
            if inner.terminating {
                return true;
            }
            if inner.policy != SchedulingPolicy::Cooperative {
                let terminating = inner.terminating;
                drop(inner);
                self.report(
                    ErrorCode::InternalInvariant,
                    None,
                    "wait_for_work requires the cooperative policy",
                );
                return terminating;
            }
            let info = inner.coop.clone().expect("cooperative scheduler state");
            inner.threads_waiting += 1;
            info
        };

        info.work_available.acquire();

        let (terminating, waiting) = {
            let mut inner = self.inner.lock();
            inner.threads_waiting -= 1;
            (inner.terminating, inner.threads_waiting)
        };
        if terminating && waiting == 0 {
            info.all_threads_stopped.release();
        }
        terminating
    }

    fn wait_task_neutral(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.terminating {
            return true;
        }
        // Recheck under the lock: an enqueue between the idle step and here
        // would otherwise be missed, and its notify cannot land before the
        // wait starts.
        if !inner.machines.iter().any(|m| m.has_work()) {
            self.work_cond.wait(&mut inner);
        }
        inner.terminating
    }

    /// Terminates the process: wakes every waiting worker, waits for the
    /// cooperative pool to drain, then halts and drops all instances.
    pub fn stop(&self) {
        let (info, wait_for_threads) = {
            let mut inner = self.inner.lock();
            inner.terminating = true;
            let mut wait = false;
            if let Some(info) = &inner.coop {
                let count = inner.threads_waiting;
                if count > 0 {
                    wait = true;
                    for _ in 0..count {
                        info.work_available.release();
                    }
                }
            }
            (inner.coop.clone(), wait)
        };
        self.work_cond.notify_all();

        if wait_for_threads {
            info.expect("cooperative scheduler state")
                .all_threads_stopped
                .acquire();
        }

        let machines = std::mem::take(&mut self.inner.lock().machines);
        for machine in &machines {
            machine.mark_halted();
        }
        tracing::debug!(guid = %self.guid, "process stopped");
    }

    /// Flips the terminating flag and wakes every waiter, without the
    /// teardown `stop` performs. Used by assertion failures.
    pub(crate) fn begin_terminate(&self) {
        let (info, waiting) = {
            let mut inner = self.inner.lock();
            inner.terminating = true;
            (inner.coop.clone(), inner.threads_waiting)
        };
        if let Some(info) = info {
            for _ in 0..waiting {
                info.work_available.release();
            }
        }
        self.work_cond.notify_all();
    }

    /// Wakes the scheduler after an enqueue made an instance runnable.
    pub(crate) fn schedule_work(&self) {
        let info = self.inner.lock().coop.clone();
        if let Some(info) = info {
            info.work_available.release();
        }
        self.work_cond.notify_all();
    }

    /// Reports an error to the host and the trace stream.
    pub(crate) fn report(&self, code: ErrorCode, machine: Option<&MachineState>, message: &str) {
        tracing::warn!(
            code = %code,
            machine = %machine.map(|m| m.machine.to_string()).unwrap_or_default(),
            message,
            "runtime error"
        );
        (self.error_fun)(code, machine, message);
    }

    /// Emits a log record to the host.
    pub(crate) fn log_record(&self, record: &LogRecord) {
        (self.log_fun)(record);
    }

    fn run_to_quiescence(&self, machine: &Arc<Machine>) {
        while !self.is_terminating() && machine.claim() {
            dispatcher::step(self, machine);
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").field("guid", &self.guid).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{MachineDecl, StateDecl};
    use machina_core::Type;

    fn empty_program() -> Arc<Program> {
        let mut program = Program::new();
        program.machines.push(MachineDecl {
            decl_index: 0,
            name: "M".into(),
            vars: vec![crate::program::VarDecl::new("x", Type::Int)],
            states: vec![StateDecl::new("Init")],
            funs: vec![],
            init_state: 0,
            max_queue_size: 0,
        });
        program.machine_def_map = vec![0];
        program.initialize().unwrap();
        Arc::new(program)
    }

    fn quiet_process(program: Arc<Program>) -> Arc<Process> {
        Process::start(
            ProcessGuid::new(1, 2, 3, 4),
            program,
            Arc::new(|_, _, _| {}),
            Arc::new(|_| {}),
        )
    }

    #[test]
    fn test_step_with_no_machines_is_idle() {
        let process = quiet_process(empty_program());
        assert_eq!(process.step(), StepResult::Idle);
    }

    #[test]
    fn test_step_after_stop_is_terminating() {
        let process = quiet_process(empty_program());
        process.stop();
        assert_eq!(process.step(), StepResult::Terminating);
    }

    #[test]
    fn test_set_policy_is_idempotent() {
        let process = quiet_process(empty_program());
        process.set_scheduling_policy(SchedulingPolicy::Cooperative);
        let first = process.inner.lock().coop.clone().unwrap();
        process.set_scheduling_policy(SchedulingPolicy::Cooperative);
        let second = process.inner.lock().coop.clone().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        process.set_scheduling_policy(SchedulingPolicy::TaskNeutral);
        assert!(process.inner.lock().coop.is_none());
    }

    #[test]
    fn test_machine_lookup_validates() {
        let program = empty_program();
        let process = quiet_process(program);
        let machine = process.mk_machine(0, vec![]).unwrap();

        // A good id round-trips.
        let found = process.machine(&machine.id_value()).unwrap();
        assert!(Arc::ptr_eq(&found, &machine));

        // Wrong kind.
        assert!(process.machine(&Value::Int(1)).is_err());

        // Out of range.
        let bad = Value::Machine(MachineId::new(process.guid(), 9, "M"));
        assert!(process.machine(&bad).is_err());

        // Foreign GUID is rejected by default.
        let foreign = Value::Machine(MachineId::new(ProcessGuid::new(9, 9, 9, 9), 1, "M"));
        assert!(process.machine(&foreign).is_err());
    }

    #[test]
    fn test_guid_check_is_configurable() {
        let program = empty_program();
        let process = Process::start_with(
            ProcessGuid::new(1, 2, 3, 4),
            program,
            Arc::new(|_, _, _| {}),
            Arc::new(|_| {}),
            ProcessOptions {
                require_guid_match: false,
            },
        );
        let machine = process.mk_machine(0, vec![]).unwrap();
        let foreign_id = Value::Machine(MachineId::new(
            ProcessGuid::new(9, 9, 9, 9),
            1,
            "M",
        ));
        let found = process.machine(&foreign_id).unwrap();
        assert!(Arc::ptr_eq(&found, &machine));
    }

    #[test]
    fn test_mk_machine_bad_symbolic_name() {
        let process = quiet_process(empty_program());
        let err = process.mk_machine(7, vec![]).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadIndex);
    }
}
