//! The program declaration tree.
//!
//! A [`Program`] is the immutable description of everything the runtime can
//! execute: events, machines with their states and handler functions, the
//! foreign-type table, and the link/def maps that resolve symbolic machine
//! names. Hosts build the tree once, call [`Program::initialize`], and hand
//! it to the process behind an `Arc`; nothing mutates it afterwards.
//!
//! Handler functions are closures over the handler [`Context`]; their result
//! is a [`Flow`] control-flow signal.

use crate::context::{Context, Flow};
use crate::error::MachineError;
use crate::eventset::EventSet;
use machina_core::{ForeignResolver, ForeignVtable, Type, Value, ValueError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Declaration index of the reserved null event.
pub const EVENT_NULL: u32 = 0;

/// Declaration index of the reserved halt event.
///
/// Dequeuing `halt` with no matching handler halts the machine cleanly.
pub const EVENT_HALT: u32 = 1;

/// A handler function body.
pub type HandlerImpl = Arc<dyn Fn(&mut Context<'_>) -> Result<Flow, MachineError> + Send + Sync>;

/// Errors detected while initializing a program.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProgramError {
    /// The reserved null and halt events are missing.
    #[error("program must declare the reserved null and halt events")]
    MissingReservedEvents,

    /// A machine's initial state index is out of range.
    #[error("machine `{machine}`: initial state {state} out of range")]
    BadInitialState {
        /// Machine name.
        machine: String,
        /// The offending state index.
        state: u32,
    },

    /// A state references a function index out of range.
    #[error("machine `{machine}`, state `{state}`: function index {fun} out of range")]
    BadFunIndex {
        /// Machine name.
        machine: String,
        /// State name.
        state: String,
        /// The offending function index.
        fun: u32,
    },

    /// A state references an event index out of range.
    #[error("machine `{machine}`, state `{state}`: event {event} out of range")]
    BadEventIndex {
        /// Machine name.
        machine: String,
        /// State name.
        state: String,
        /// The offending event index.
        event: u32,
    },

    /// A transition's destination state is out of range.
    #[error("machine `{machine}`, state `{state}`: destination state {dest} out of range")]
    BadDestState {
        /// Machine name.
        machine: String,
        /// State name.
        state: String,
        /// The offending destination index.
        dest: u32,
    },

    /// A transition or do record whose trigger is missing from the state's
    /// corresponding trigger set.
    #[error("machine `{machine}`, state `{state}`: trigger {event} missing from its trigger set")]
    InconsistentTriggerSet {
        /// Machine name.
        machine: String,
        /// State name.
        state: String,
        /// The offending trigger.
        event: u32,
    },

    /// A def-map entry referencing a machine declaration out of range.
    #[error("def map entry {entry} refers to machine {machine} out of range")]
    BadDefMap {
        /// Symbolic name (def-map slot).
        entry: u32,
        /// The offending machine index.
        machine: u32,
    },

    /// A link-map entry referencing a symbolic name out of range.
    #[error("link map entry refers to symbolic name {name} out of range")]
    BadLinkMap {
        /// The offending symbolic name.
        name: u32,
    },
}

/// An event declaration.
#[derive(Clone, Debug)]
pub struct EventDecl {
    /// Index of this event in the program; filled by `initialize`.
    pub decl_index: u32,
    /// Event name.
    pub name: String,
    /// Maximum in-queue occurrences per instance; 0 means unbounded.
    pub max_instances: u32,
    /// Type of the payload carried by this event.
    pub payload_type: Type,
}

impl EventDecl {
    /// Creates an event with an unbounded instance count.
    pub fn new(name: impl Into<String>, payload_type: Type) -> Self {
        Self {
            decl_index: 0,
            name: name.into(),
            max_instances: 0,
            payload_type,
        }
    }

    /// Caps the in-queue occurrences of this event.
    pub fn max_instances(mut self, bound: u32) -> Self {
        self.max_instances = bound;
        self
    }

    fn null_event() -> Self {
        Self::new("null", Type::Null)
    }

    fn halt_event() -> Self {
        Self::new("halt", Type::Null)
    }
}

/// A machine variable declaration.
#[derive(Clone, Debug)]
pub struct VarDecl {
    /// Variable name.
    pub name: String,
    /// Variable type; determines the default value.
    pub ty: Type,
}

impl VarDecl {
    /// Creates a variable declaration.
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// One arm of a receive.
#[derive(Clone, Debug)]
pub struct CaseDecl {
    /// The event this case matches.
    pub trigger_event: u32,
    /// Function to run when the case is selected.
    pub fun: u32,
}

/// A receive point declared inside a function body.
#[derive(Clone, Debug)]
pub struct ReceiveDecl {
    /// Index of this receive within its function.
    pub receive_index: u16,
    /// Union of the case triggers; admissibility while blocked.
    pub case_set: EventSet,
    /// The cases, in declaration order.
    pub cases: Vec<CaseDecl>,
}

impl ReceiveDecl {
    /// Creates a receive declaration from its cases.
    pub fn new(receive_index: u16, cases: Vec<CaseDecl>) -> Self {
        let case_set =
            EventSet::from_events(&cases.iter().map(|c| c.trigger_event).collect::<Vec<_>>());
        Self {
            receive_index,
            case_set,
            cases,
        }
    }
}

/// A function declaration.
#[derive(Clone)]
pub struct FunDecl {
    /// Function name.
    pub name: String,
    /// The body.
    pub implementation: HandlerImpl,
    /// Number of parameters expected by nested calls.
    pub params: u32,
    /// Number of local slots, parameters included.
    pub max_locals: u32,
    /// Payload type, for handler functions that take one.
    pub payload_type: Option<Type>,
    /// Named-tuple type of the locals, used to default-initialize them.
    pub locals_type: Option<Type>,
    /// Receive points in the body.
    pub receives: Vec<ReceiveDecl>,
}

impl FunDecl {
    /// Creates a function declaration with no parameters, locals, or
    /// receives.
    pub fn new(name: impl Into<String>, implementation: HandlerImpl) -> Self {
        Self {
            name: name.into(),
            implementation,
            params: 0,
            max_locals: 0,
            payload_type: None,
            locals_type: None,
            receives: Vec::new(),
        }
    }

    /// Sets the parameter and local-slot counts.
    pub fn locals(mut self, params: u32, max_locals: u32) -> Self {
        self.params = params;
        self.max_locals = max_locals;
        self
    }

    /// Sets the payload type.
    pub fn payload(mut self, ty: Type) -> Self {
        self.payload_type = Some(ty);
        self
    }

    /// Attaches the function's receive points.
    pub fn receives(mut self, receives: Vec<ReceiveDecl>) -> Self {
        self.receives = receives;
        self
    }
}

impl fmt::Debug for FunDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunDecl")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("max_locals", &self.max_locals)
            .field("receives", &self.receives.len())
            .finish_non_exhaustive()
    }
}

/// A transition record.
#[derive(Clone, Debug)]
pub struct TransDecl {
    /// Index of the owning state.
    pub owner_state: u32,
    /// The trigger event.
    pub trigger_event: u32,
    /// Destination state index.
    pub dest_state: u32,
    /// Optional function to run between exit and the state change.
    pub trans_fun: Option<u32>,
}

/// A do-handler record.
#[derive(Clone, Debug)]
pub struct DoDecl {
    /// Index of the owning state.
    pub owner_state: u32,
    /// The trigger event.
    pub trigger_event: u32,
    /// The handler function.
    pub do_fun: u32,
}

/// A state declaration.
#[derive(Clone, Debug)]
pub struct StateDecl {
    /// State name.
    pub name: String,
    /// Events held in the queue while the machine is in this state.
    pub defers: EventSet,
    /// Events that trigger a transition out of this state.
    pub trans_set: EventSet,
    /// Events handled in place by a do-handler.
    pub do_set: EventSet,
    /// Transition records, in declaration order.
    pub transitions: Vec<TransDecl>,
    /// Do records, in declaration order.
    pub dos: Vec<DoDecl>,
    /// Entry function, if any.
    pub entry_fun: Option<u32>,
    /// Exit function, if any.
    pub exit_fun: Option<u32>,
}

impl StateDecl {
    /// Creates a state with no handlers.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            defers: EventSet::new(),
            trans_set: EventSet::new(),
            do_set: EventSet::new(),
            transitions: Vec::new(),
            dos: Vec::new(),
            entry_fun: None,
            exit_fun: None,
        }
    }

    /// Sets the entry function.
    pub fn entry(mut self, fun: u32) -> Self {
        self.entry_fun = Some(fun);
        self
    }

    /// Sets the exit function.
    pub fn exit(mut self, fun: u32) -> Self {
        self.exit_fun = Some(fun);
        self
    }

    /// Adds a transition on `event` to `dest`, with an optional transition
    /// function.
    pub fn on_goto(mut self, event: u32, dest: u32, trans_fun: Option<u32>) -> Self {
        self.trans_set.insert(event);
        self.transitions.push(TransDecl {
            owner_state: 0,
            trigger_event: event,
            dest_state: dest,
            trans_fun,
        });
        self
    }

    /// Adds a do-handler on `event`.
    pub fn on_do(mut self, event: u32, fun: u32) -> Self {
        self.do_set.insert(event);
        self.dos.push(DoDecl {
            owner_state: 0,
            trigger_event: event,
            do_fun: fun,
        });
        self
    }

    /// Defers `event` while in this state.
    pub fn deferring(mut self, event: u32) -> Self {
        self.defers.insert(event);
        self
    }
}

/// A machine declaration.
#[derive(Clone, Debug)]
pub struct MachineDecl {
    /// Index of this machine in the program; filled by `initialize`.
    pub decl_index: u32,
    /// Machine name.
    pub name: String,
    /// Variable declarations, in slot order.
    pub vars: Vec<VarDecl>,
    /// State declarations.
    pub states: Vec<StateDecl>,
    /// Function declarations shared by the machine's states.
    pub funs: Vec<FunDecl>,
    /// Index of the initial state.
    pub init_state: u32,
    /// Queue capacity; 0 means unbounded.
    pub max_queue_size: u32,
}

impl MachineDecl {
    /// Returns a state declaration by index.
    pub fn state(&self, index: u32) -> Option<&StateDecl> {
        self.states.get(index as usize)
    }

    /// Returns a function declaration by index.
    pub fn fun(&self, index: u32) -> Option<&FunDecl> {
        self.funs.get(index as usize)
    }
}

/// A foreign-type declaration.
#[derive(Clone, Debug)]
pub struct ForeignTypeDecl {
    /// Index of this foreign type in the program; filled by `initialize`.
    pub decl_index: u32,
    /// Type name.
    pub name: String,
    /// The host callbacks implementing the type.
    pub vtable: Arc<ForeignVtable>,
}

/// The program declaration tree.
#[derive(Clone, Debug)]
pub struct Program {
    /// Event declarations; indices 0 and 1 are the reserved null and halt
    /// events.
    pub events: Vec<EventDecl>,
    /// Machine declarations.
    pub machines: Vec<MachineDecl>,
    /// Foreign-type declarations.
    pub foreign_types: Vec<ForeignTypeDecl>,
    /// Per-creator resolution of interface-or-machine slots to the symbolic
    /// name a created child will carry.
    pub link_map: Vec<Vec<u32>>,
    /// Resolution of symbolic names to machine declaration indices.
    pub machine_def_map: Vec<u32>,
}

impl Program {
    /// Creates an empty program with the reserved null and halt events.
    pub fn new() -> Self {
        Self {
            events: vec![EventDecl::null_event(), EventDecl::halt_event()],
            machines: Vec::new(),
            foreign_types: Vec::new(),
            link_map: Vec::new(),
            machine_def_map: Vec::new(),
        }
    }

    /// Fills declaration indices and validates cross-references.
    ///
    /// Must be called once, before the program is handed to a process.
    pub fn initialize(&mut self) -> Result<(), ProgramError> {
        if self.events.len() < 2 {
            return Err(ProgramError::MissingReservedEvents);
        }
        for (i, event) in self.events.iter_mut().enumerate() {
            event.decl_index = i as u32;
        }
        for (i, foreign) in self.foreign_types.iter_mut().enumerate() {
            foreign.decl_index = i as u32;
        }

        let n_events = self.events.len() as u32;
        for (i, machine) in self.machines.iter_mut().enumerate() {
            machine.decl_index = i as u32;
            let machine_name = machine.name.clone();
            if machine.init_state as usize >= machine.states.len() {
                return Err(ProgramError::BadInitialState {
                    machine: machine_name,
                    state: machine.init_state,
                });
            }
            let n_states = machine.states.len() as u32;
            let n_funs = machine.funs.len() as u32;
            for (s, state) in machine.states.iter_mut().enumerate() {
                let state_name = state.name.clone();
                let bad_fun = |fun: u32| ProgramError::BadFunIndex {
                    machine: machine_name.clone(),
                    state: state_name.clone(),
                    fun,
                };
                if let Some(fun) = state.entry_fun {
                    if fun >= n_funs {
                        return Err(bad_fun(fun));
                    }
                }
                if let Some(fun) = state.exit_fun {
                    if fun >= n_funs {
                        return Err(bad_fun(fun));
                    }
                }
                for trans in &mut state.transitions {
                    trans.owner_state = s as u32;
                    if trans.trigger_event >= n_events {
                        return Err(ProgramError::BadEventIndex {
                            machine: machine_name.clone(),
                            state: state_name.clone(),
                            event: trans.trigger_event,
                        });
                    }
                    if trans.dest_state >= n_states {
                        return Err(ProgramError::BadDestState {
                            machine: machine_name.clone(),
                            state: state_name.clone(),
                            dest: trans.dest_state,
                        });
                    }
                    if let Some(fun) = trans.trans_fun {
                        if fun >= n_funs {
                            return Err(bad_fun(fun));
                        }
                    }
                }
                for decl in &mut state.dos {
                    decl.owner_state = s as u32;
                    if decl.trigger_event >= n_events {
                        return Err(ProgramError::BadEventIndex {
                            machine: machine_name.clone(),
                            state: state_name.clone(),
                            event: decl.trigger_event,
                        });
                    }
                    if decl.do_fun >= n_funs {
                        return Err(bad_fun(decl.do_fun));
                    }
                }
                for trans in &state.transitions {
                    if !state.trans_set.contains(trans.trigger_event) {
                        return Err(ProgramError::InconsistentTriggerSet {
                            machine: machine_name.clone(),
                            state: state_name.clone(),
                            event: trans.trigger_event,
                        });
                    }
                }
                for decl in &state.dos {
                    if !state.do_set.contains(decl.trigger_event) {
                        return Err(ProgramError::InconsistentTriggerSet {
                            machine: machine_name.clone(),
                            state: state_name.clone(),
                            event: decl.trigger_event,
                        });
                    }
                }
            }
            for fun in &machine.funs {
                for receive in &fun.receives {
                    for case in &receive.cases {
                        if case.trigger_event >= n_events {
                            return Err(ProgramError::BadEventIndex {
                                machine: machine_name.clone(),
                                state: fun.name.clone(),
                                event: case.trigger_event,
                            });
                        }
                        if case.fun >= n_funs {
                            return Err(ProgramError::BadFunIndex {
                                machine: machine_name.clone(),
                                state: fun.name.clone(),
                                fun: case.fun,
                            });
                        }
                    }
                }
            }
        }

        let n_symbolic = self.machine_def_map.len() as u32;
        for (entry, &machine) in self.machine_def_map.iter().enumerate() {
            if machine as usize >= self.machines.len() {
                return Err(ProgramError::BadDefMap {
                    entry: entry as u32,
                    machine,
                });
            }
        }
        for row in &self.link_map {
            for &name in row {
                if name >= n_symbolic {
                    return Err(ProgramError::BadLinkMap { name });
                }
            }
        }
        Ok(())
    }

    /// Returns an event declaration by index.
    pub fn event(&self, index: u32) -> Option<&EventDecl> {
        self.events.get(index as usize)
    }

    /// Returns a machine declaration by index.
    pub fn machine(&self, index: u32) -> Option<&MachineDecl> {
        self.machines.get(index as usize)
    }

    /// Resolves a symbolic name to its machine declaration index.
    pub fn def_target(&self, symbolic: u32) -> Option<u32> {
        self.machine_def_map.get(symbolic as usize).copied()
    }

    /// Resolves, through a creator's link-map row, the symbolic name a
    /// created child will carry.
    pub fn link_target(&self, creator_symbolic: u32, ior_m: u32) -> Option<u32> {
        self.link_map
            .get(creator_symbolic as usize)?
            .get(ior_m as usize)
            .copied()
    }

    /// Constructs the default value of a type, resolving foreign types
    /// through this program's declarations.
    pub fn default_value(&self, ty: &Type) -> Result<Value, ValueError> {
        Value::default_of(ty, self)
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl ForeignResolver for Program {
    fn vtable(&self, index: u32) -> Option<Arc<ForeignVtable>> {
        self.foreign_types
            .get(index as usize)
            .map(|decl| decl.vtable.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> HandlerImpl {
        Arc::new(|_ctx: &mut Context| Ok(Flow::Done))
    }

    fn single_machine_program(states: Vec<StateDecl>, funs: Vec<FunDecl>) -> Program {
        let mut program = Program::new();
        program.events.push(EventDecl::new("ping", Type::Int));
        program.machines.push(MachineDecl {
            decl_index: 0,
            name: "M".into(),
            vars: vec![VarDecl::new("count", Type::Int)],
            states,
            funs,
            init_state: 0,
            max_queue_size: 0,
        });
        program.machine_def_map = vec![0];
        program.link_map = vec![vec![0]];
        program
    }

    #[test]
    fn test_initialize_fills_indices() {
        let mut program = single_machine_program(
            vec![StateDecl::new("Init").entry(0)],
            vec![FunDecl::new("init", noop())],
        );
        program.initialize().unwrap();
        assert_eq!(program.events[2].decl_index, 2);
        assert_eq!(program.machines[0].decl_index, 0);
        assert_eq!(program.event(EVENT_NULL).unwrap().name, "null");
        assert_eq!(program.event(EVENT_HALT).unwrap().name, "halt");
    }

    #[test]
    fn test_initialize_rejects_bad_initial_state() {
        let mut program = single_machine_program(vec![StateDecl::new("Init")], vec![]);
        program.machines[0].init_state = 3;
        assert!(matches!(
            program.initialize(),
            Err(ProgramError::BadInitialState { .. })
        ));
    }

    #[test]
    fn test_initialize_rejects_bad_fun_index() {
        let mut program =
            single_machine_program(vec![StateDecl::new("Init").entry(5)], vec![]);
        assert!(matches!(
            program.initialize(),
            Err(ProgramError::BadFunIndex { .. })
        ));
    }

    #[test]
    fn test_initialize_rejects_bad_transition_dest() {
        let mut program = single_machine_program(
            vec![StateDecl::new("Init").on_goto(2, 9, None)],
            vec![],
        );
        assert!(matches!(
            program.initialize(),
            Err(ProgramError::BadDestState { .. })
        ));
    }

    #[test]
    fn test_initialize_rejects_bad_def_map() {
        let mut program = single_machine_program(vec![StateDecl::new("Init")], vec![]);
        program.machine_def_map = vec![4];
        assert!(matches!(
            program.initialize(),
            Err(ProgramError::BadDefMap { .. })
        ));
    }

    #[test]
    fn test_state_builder_keeps_sets_consistent() {
        let state = StateDecl::new("S")
            .on_goto(2, 0, None)
            .on_do(3, 0)
            .deferring(4);
        assert!(state.trans_set.contains(2));
        assert!(state.do_set.contains(3));
        assert!(state.defers.contains(4));
        assert!(!state.trans_set.contains(3));
    }

    #[test]
    fn test_receive_decl_builds_case_set() {
        let receive = ReceiveDecl::new(
            0,
            vec![
                CaseDecl {
                    trigger_event: 2,
                    fun: 0,
                },
                CaseDecl {
                    trigger_event: 5,
                    fun: 0,
                },
            ],
        );
        assert!(receive.case_set.contains(2));
        assert!(receive.case_set.contains(5));
        assert!(!receive.case_set.contains(3));
    }

    #[test]
    fn test_link_resolution() {
        let mut program = single_machine_program(vec![StateDecl::new("Init")], vec![]);
        program.initialize().unwrap();
        assert_eq!(program.link_target(0, 0), Some(0));
        assert_eq!(program.link_target(0, 7), None);
        assert_eq!(program.def_target(0), Some(0));
        assert_eq!(program.def_target(9), None);
    }
}
