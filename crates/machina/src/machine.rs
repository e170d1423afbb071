//! Machine instances.
//!
//! A [`Machine`] is a live incarnation of a machine declaration. Its runtime
//! state is split across two locks matching the producer/consumer split:
//!
//! - the **queue side** (`QueueState`) is touched by senders and by the
//!   scheduler claiming the instance: the event queue, the running and
//!   halted flags, the receive wait, and scheduling hints;
//! - the **exec side** (`ExecState`) belongs to the single worker stepping
//!   the instance: current state, variables, call stack, and the pending
//!   operation cursor.
//!
//! At most one worker holds the running flag at a time, so the exec lock is
//! uncontended in steady state; it exists to make the single-writer
//! invariant a compiler-checked fact rather than a protocol.

use crate::error::{ErrorCode, MachineError};
use crate::eventset::EventSet;
use crate::log::MachineState;
use crate::program::{CaseDecl, EventDecl, Program, EVENT_NULL};
use crate::queue::{EventQueue, QueueEntry};
use machina_core::{MachineId, Value};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Lifecycle of a machine instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineStatus {
    /// Created, initial entry not yet run.
    Fresh,
    /// Has pending work or is being stepped.
    Running,
    /// Waiting for an admissible event.
    Idle,
    /// Terminal.
    Halted,
}

/// The last queue operation on an instance, for the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LastOperation {
    /// No queue operation yet.
    None,
    /// An event was enqueued.
    Enqueued,
    /// An event was dequeued.
    Dequeued,
    /// A receive was satisfied by the null event.
    NullReceived,
}

/// A parked receive: the machine is blocked until an event in `case_set`
/// arrives.
#[derive(Clone, Debug)]
pub(crate) struct ReceiveWait {
    pub case_set: EventSet,
    pub cases: Vec<CaseDecl>,
}

/// One function activation.
#[derive(Debug)]
pub(crate) struct Frame {
    pub fun: u32,
    pub locals: Vec<Value>,
}

/// What the dispatcher does on the next step of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NextOp {
    /// Run the current state's entry function with the stored trigger.
    EnterState,
    /// Dequeue the next admissible event.
    Dequeue,
    /// Resolve the stored trigger in the current state.
    HandleEvent,
}

/// The event being handled, with its payload.
#[derive(Clone, Debug)]
pub(crate) struct Trigger {
    pub event: u32,
    pub payload: Value,
}

pub(crate) struct QueueState {
    pub queue: EventQueue,
    /// True while a worker is stepping this instance.
    pub running: bool,
    pub halted: bool,
    /// True when the queue may hold an admissible event. Set by enqueues,
    /// state changes, and receive parks; cleared by a scan that finds
    /// nothing.
    pub dirty: bool,
    /// True when the exec side has staged work that needs no dequeue.
    pub pending_exec: bool,
    pub receive: Option<ReceiveWait>,
    pub status: MachineStatus,
    pub last_operation: LastOperation,
    /// Mirror of the exec side's current state, for lock-free-ish snapshots.
    pub state_hint: u32,
}

pub(crate) struct ExecState {
    pub current_state: u32,
    pub variables: Vec<Value>,
    pub call_stack: Vec<Frame>,
    pub next_op: NextOp,
    pub trigger: Trigger,
    /// Raises staged behind a pending entry, handled LIFO.
    pub raised: Vec<Trigger>,
}

/// A machine instance, owned by its process.
pub struct Machine {
    id: MachineId,
    instance_of: u32,
    symbolic_name: u32,
    program: Arc<Program>,
    queue: Mutex<QueueState>,
    exec: Mutex<ExecState>,
}

impl Machine {
    /// Allocates an instance in its initial state with the constructor
    /// payload staged as the first entry trigger.
    pub(crate) fn new(
        program: Arc<Program>,
        symbolic_name: u32,
        instance_of: u32,
        id: MachineId,
        payload: Value,
    ) -> Result<Arc<Self>, MachineError> {
        let decl = program
            .machine(instance_of)
            .ok_or_else(|| MachineError::new(ErrorCode::BadIndex, "machine declaration"))?;
        let variables = decl
            .vars
            .iter()
            .map(|var| program.default_value(&var.ty))
            .collect::<Result<Vec<_>, _>>()?;
        let init_state = decl.init_state;
        let max_queue_size = decl.max_queue_size;

        Ok(Arc::new(Self {
            id,
            instance_of,
            symbolic_name,
            program,
            queue: Mutex::new(QueueState {
                queue: EventQueue::new(max_queue_size),
                running: false,
                halted: false,
                dirty: false,
                pending_exec: true,
                receive: None,
                status: MachineStatus::Fresh,
                last_operation: LastOperation::None,
                state_hint: init_state,
            }),
            exec: Mutex::new(ExecState {
                current_state: init_state,
                variables,
                call_stack: Vec::new(),
                next_op: NextOp::EnterState,
                trigger: Trigger {
                    event: EVENT_NULL,
                    payload,
                },
                raised: Vec::new(),
            }),
        }))
    }

    /// The instance's id.
    pub fn id(&self) -> &MachineId {
        &self.id
    }

    /// The instance's id as a machine-id value.
    pub fn id_value(&self) -> Value {
        Value::Machine(self.id.clone())
    }

    /// Index of the machine declaration this instance runs.
    pub fn instance_of(&self) -> u32 {
        self.instance_of
    }

    /// The symbolic name the instance was created under.
    pub fn symbolic_name(&self) -> u32 {
        self.symbolic_name
    }

    /// Current lifecycle status.
    pub fn status(&self) -> MachineStatus {
        self.queue.lock().status
    }

    /// Returns `true` once the instance has halted.
    pub fn is_halted(&self) -> bool {
        self.queue.lock().halted
    }

    /// The last queue operation, for diagnostics.
    pub fn last_operation(&self) -> LastOperation {
        self.queue.lock().last_operation
    }

    /// Number of events currently queued.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().queue.len()
    }

    /// Returns a copy of a variable by its declaration slot.
    pub fn variable(&self, index: usize) -> Option<Value> {
        self.exec.lock().variables.get(index).cloned()
    }

    /// Snapshots (machine id, machine name, state id, state name).
    ///
    /// Reads the queue side's state mirror, so it never contends with a
    /// running handler.
    pub fn snapshot(&self) -> MachineState {
        let state = self.queue.lock().state_hint;
        self.snapshot_at(state)
    }

    pub(crate) fn snapshot_at(&self, state: u32) -> MachineState {
        let decl = self
            .program
            .machine(self.instance_of)
            .expect("validated machine declaration");
        let state_name = decl
            .state(state)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        MachineState {
            machine: self.id.clone(),
            machine_name: decl.name.clone(),
            state,
            state_name,
        }
    }

    /// Enqueues an event.
    ///
    /// Returns `Ok(notify)` where `notify` says the instance was not running
    /// and the scheduler should be woken. Admission failures return the
    /// error code for the caller to report.
    pub(crate) fn enqueue(
        &self,
        decl: &EventDecl,
        payload: Value,
        sender: Option<MachineState>,
    ) -> Result<bool, ErrorCode> {
        let mut queue = self.queue.lock();
        if queue.halted {
            return Err(ErrorCode::IllegalSend);
        }
        queue.queue.admit(decl.decl_index, decl.max_instances)?;
        queue.queue.push(QueueEntry {
            event: decl.decl_index,
            payload,
            sender,
        });
        queue.last_operation = LastOperation::Enqueued;
        queue.dirty = true;
        if queue.status == MachineStatus::Idle {
            queue.status = MachineStatus::Running;
        }
        Ok(!queue.running)
    }

    /// Claims the instance for one step. Returns `false` when it is already
    /// running, halted, or has no work.
    pub(crate) fn claim(&self) -> bool {
        let mut queue = self.queue.lock();
        let has_work = queue.pending_exec || (queue.dirty && !queue.queue.is_empty());
        if queue.running || queue.halted || !has_work {
            return false;
        }
        queue.running = true;
        queue.status = MachineStatus::Running;
        true
    }

    /// Cheap claimability probe for idle-wait rechecks.
    pub(crate) fn has_work(&self) -> bool {
        let queue = self.queue.lock();
        !queue.halted
            && !queue.running
            && (queue.pending_exec || (queue.dirty && !queue.queue.is_empty()))
    }

    /// Releases the instance after a step.
    pub(crate) fn release(&self, pending_exec: bool) {
        let mut queue = self.queue.lock();
        queue.running = false;
        queue.pending_exec = pending_exec && !queue.halted;
        queue.status = if queue.halted {
            MachineStatus::Halted
        } else if queue.pending_exec || (queue.dirty && !queue.queue.is_empty()) {
            MachineStatus::Running
        } else {
            MachineStatus::Idle
        };
    }

    /// Dequeues the first admissible event.
    ///
    /// While a receive wait is parked, admissibility is membership in its
    /// case set (a receive widens admissibility past the defer set);
    /// otherwise it is absence from `defers`. A scan that finds nothing
    /// clears the dirty hint so the scheduler stops reclaiming the instance
    /// until the queue changes.
    pub(crate) fn dequeue(
        &self,
        defers: &EventSet,
    ) -> Option<(QueueEntry, Option<ReceiveWait>)> {
        let mut queue = self.queue.lock();
        if let Some(wait) = queue.receive.clone() {
            match queue.queue.dequeue_where(|e| wait.case_set.contains(e)) {
                Some(entry) => {
                    queue.receive = None;
                    queue.last_operation = if entry.event == EVENT_NULL {
                        LastOperation::NullReceived
                    } else {
                        LastOperation::Dequeued
                    };
                    Some((entry, Some(wait)))
                }
                None => {
                    queue.dirty = false;
                    None
                }
            }
        } else {
            match queue.queue.dequeue_where(|e| !defers.contains(e)) {
                Some(entry) => {
                    queue.last_operation = LastOperation::Dequeued;
                    Some((entry, None))
                }
                None => {
                    queue.dirty = false;
                    None
                }
            }
        }
    }

    /// Parks a receive wait. Already-queued case events must be rescanned,
    /// so the dirty hint is set.
    pub(crate) fn park_receive(&self, wait: ReceiveWait) {
        let mut queue = self.queue.lock();
        queue.receive = Some(wait);
        queue.dirty = true;
    }

    /// Records a state change on the queue side. Formerly deferred events
    /// may have become admissible, so the dirty hint is set.
    pub(crate) fn note_state_change(&self, state: u32) {
        let mut queue = self.queue.lock();
        queue.state_hint = state;
        queue.dirty = true;
    }

    /// Halts the instance: terminal, queue dropped, receive cleared.
    /// Variables stay readable.
    pub(crate) fn mark_halted(&self) {
        let mut queue = self.queue.lock();
        queue.halted = true;
        queue.status = MachineStatus::Halted;
        queue.queue.clear();
        queue.receive = None;
        queue.pending_exec = false;
        queue.dirty = false;
    }

    pub(crate) fn lock_exec(&self) -> MutexGuard<'_, ExecState> {
        self.exec.lock()
    }

    pub(crate) fn program(&self) -> &Arc<Program> {
        &self.program
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("instance_of", &self.instance_of)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{EventDecl, MachineDecl, StateDecl};
    use machina_core::{ProcessGuid, Type};

    fn test_machine() -> Arc<Machine> {
        let mut program = Program::new();
        program.events.push(EventDecl::new("tick", Type::Null).max_instances(2));
        program.machines.push(MachineDecl {
            decl_index: 0,
            name: "M".into(),
            vars: vec![crate::program::VarDecl::new("count", Type::Int)],
            states: vec![StateDecl::new("Init")],
            funs: vec![],
            init_state: 0,
            max_queue_size: 0,
        });
        program.machine_def_map = vec![0];
        program.initialize().unwrap();
        let id = MachineId::new(ProcessGuid::new(1, 0, 0, 0), 1, "M");
        Machine::new(Arc::new(program), 0, 0, id, Value::Null).unwrap()
    }

    fn tick_decl(machine: &Machine) -> EventDecl {
        machine.program().event(2).unwrap().clone()
    }

    #[test]
    fn test_fresh_instance() {
        let machine = test_machine();
        assert_eq!(machine.status(), MachineStatus::Fresh);
        assert_eq!(machine.last_operation(), LastOperation::None);
        assert_eq!(machine.variable(0), Some(Value::Int(0)));
        assert_eq!(machine.queue_len(), 0);
    }

    #[test]
    fn test_enqueue_notify_and_bounds() {
        let machine = test_machine();
        let tick = tick_decl(&machine);
        assert_eq!(machine.enqueue(&tick, Value::Null, None), Ok(true));
        assert_eq!(machine.enqueue(&tick, Value::Null, None), Ok(true));
        // max_instances = 2
        assert_eq!(
            machine.enqueue(&tick, Value::Null, None),
            Err(ErrorCode::QueueFull)
        );
        assert_eq!(machine.queue_len(), 2);
        assert_eq!(machine.last_operation(), LastOperation::Enqueued);
    }

    #[test]
    fn test_halted_rejects_sends() {
        let machine = test_machine();
        let tick = tick_decl(&machine);
        machine.enqueue(&tick, Value::Null, None).unwrap();
        machine.mark_halted();
        assert_eq!(machine.queue_len(), 0);
        assert_eq!(
            machine.enqueue(&tick, Value::Null, None),
            Err(ErrorCode::IllegalSend)
        );
        assert!(machine.is_halted());
        // Variables survive the halt.
        assert_eq!(machine.variable(0), Some(Value::Int(0)));
    }

    #[test]
    fn test_claim_release_cycle() {
        let machine = test_machine();
        // Fresh instance has pending exec work (its initial entry).
        assert!(machine.claim());
        // Second claim fails while running.
        assert!(!machine.claim());
        machine.release(false);
        // No pending exec, empty queue: nothing to claim.
        assert!(!machine.claim());
        assert_eq!(machine.status(), MachineStatus::Idle);

        let tick = tick_decl(&machine);
        machine.enqueue(&tick, Value::Null, None).unwrap();
        assert_eq!(machine.status(), MachineStatus::Running);
        assert!(machine.claim());
        machine.release(false);
    }

    #[test]
    fn test_failed_scan_clears_dirty() {
        let machine = test_machine();
        machine.release(false);
        let tick = tick_decl(&machine);
        machine.enqueue(&tick, Value::Null, None).unwrap();

        // Defer the only queued event: the scan fails and clears the hint.
        let defers = EventSet::from_events(&[2]);
        assert!(machine.claim());
        assert!(machine.dequeue(&defers).is_none());
        machine.release(false);
        assert!(!machine.claim());

        // A state change makes the queue worth rescanning.
        machine.note_state_change(0);
        assert!(machine.claim());
        let (entry, wait) = machine.dequeue(&EventSet::new()).unwrap();
        assert_eq!(entry.event, 2);
        assert!(wait.is_none());
        machine.release(false);
    }

    #[test]
    fn test_receive_widens_admissibility() {
        let machine = test_machine();
        machine.release(false);
        let tick = tick_decl(&machine);
        machine.enqueue(&tick, Value::Null, None).unwrap();

        // Park a receive whose case set includes the deferred event.
        machine.park_receive(ReceiveWait {
            case_set: EventSet::from_events(&[2]),
            cases: vec![CaseDecl {
                trigger_event: 2,
                fun: 0,
            }],
        });
        // The defer set would hold the event back; the receive admits it.
        let defers = EventSet::from_events(&[2]);
        let (entry, wait) = machine.dequeue(&defers).unwrap();
        assert_eq!(entry.event, 2);
        assert!(wait.is_some());
        assert_eq!(machine.last_operation(), LastOperation::Dequeued);
    }
}
