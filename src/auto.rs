// released under MIT License

use cranelift_entity::{entity_impl, PrimaryMap};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Index;
use thiserror::Error;

/// Direction of an action as seen from the component that declares it.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum ActionKind {
    Input,
    Output,
    Internal,
}

impl ActionKind {
    /// suffix used when printing actions, following the usual IA notation
    pub fn suffix(&self) -> &'static str {
        match self {
            ActionKind::Input => "?",
            ActionKind::Output => "!",
            ActionKind::Internal => "",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Input => write!(f, "input"),
            ActionKind::Output => write!(f, "output"),
            ActionKind::Internal => write!(f, "internal"),
        }
    }
}

/// An action of an interface automaton. Two actions match for synchronization
/// iff they carry the same name and one is an input while the other is an
/// output. Internal actions never synchronize.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Action {
    name: String,
    kind: ActionKind,
}

impl Action {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.kind.suffix())
    }
}

#[derive(Clone, Copy, Hash, PartialEq, Eq, Default)]
pub struct StateId(u32);
entity_impl!(StateId, "state");

#[derive(Clone, Copy, Hash, PartialEq, Eq, Default)]
pub struct ActionId(u32);
entity_impl!(ActionId, "action");

/// A state only has an identity (its display name) and outgoing transitions.
/// Source locations and other annotations live outside the model, keyed by
/// the display name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct State {
    name: String,
    trans: Vec<Tran>,
}

/// transition to `to`, labeled with `action`
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct Tran {
    pub action: ActionId,
    pub to: StateId,
}

/// Structural invariant violation in an input model. Fatal to the requested
/// operation; the model is rejected before any algorithm runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedModelError {
    #[error("automaton '{automaton}' has no initial state")]
    NoInitialState { automaton: String },
    #[error("automaton '{automaton}' references a state that is not part of the model")]
    DanglingState { automaton: String },
    #[error("automaton '{automaton}' references an action that is not part of the model")]
    DanglingAction { automaton: String },
    #[error("automaton '{automaton}' declares action '{action}' with conflicting directions")]
    DirectionConflict { automaton: String, action: String },
    #[error(
        "automaton '{automaton}' has more than one transition for input '{action}' from state '{state}'"
    )]
    DuplicateInputTransition {
        automaton: String,
        state: String,
        action: String,
    },
}

/// One interface automaton: states, actions partitioned by direction, labeled
/// transitions and one initial state. Immutable after construction; checkers
/// only ever read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Automaton {
    name: String,
    states: PrimaryMap<StateId, State>,
    actions: PrimaryMap<ActionId, Action>,
    action_by_name: FxHashMap<String, ActionId>,
    init: StateId,
}

impl Automaton {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial(&self) -> StateId {
        self.init
    }

    pub fn state_ids(&self) -> impl Iterator<Item = StateId> + '_ {
        self.states.keys()
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn state_name(&self, state: StateId) -> &str {
        &self.states[state].name
    }

    pub fn action_ids(&self) -> impl Iterator<Item = ActionId> + '_ {
        self.actions.keys()
    }

    pub fn lookup_action(&self, name: &str) -> Option<ActionId> {
        self.action_by_name.get(name).copied()
    }

    /// all outgoing transitions of a state, in insertion order
    pub fn outgoing(&self, state: StateId) -> &[Tran] {
        &self.states[state].trans
    }

    /// outgoing transitions filtered by action direction
    pub fn outgoing_of_kind(
        &self,
        state: StateId,
        kind: ActionKind,
    ) -> impl Iterator<Item = &Tran> + '_ {
        self.states[state]
            .trans
            .iter()
            .filter(move |t| self.actions[t.action].kind == kind)
    }

    pub fn enables(&self, state: StateId, action: ActionId) -> bool {
        self.states[state].trans.iter().any(|t| t.action == action)
    }

    /// all successor states of `state` under `action`
    pub fn targets(&self, state: StateId, action: ActionId) -> impl Iterator<Item = StateId> + '_ {
        self.states[state]
            .trans
            .iter()
            .filter(move |t| t.action == action)
            .map(|t| t.to)
    }

    /// successors under the action with the given name and direction,
    /// for matching states across two different models
    pub fn targets_by_name<'a>(
        &'a self,
        state: StateId,
        name: &'a str,
        kind: ActionKind,
    ) -> impl Iterator<Item = StateId> + 'a {
        self.states[state]
            .trans
            .iter()
            .filter(move |t| {
                let a = &self.actions[t.action];
                a.kind == kind && a.name == name
            })
            .map(|t| t.to)
    }

    /// unique successor under an input action (input-determinism invariant)
    pub fn input_successor(&self, state: StateId, name: &str) -> Option<StateId> {
        self.targets_by_name(state, name, ActionKind::Input).next()
    }

    /// states reachable from the initial state, in BFS order
    pub fn reachable(&self) -> Vec<StateId> {
        let mut order = vec![self.init];
        let mut seen: FxHashSet<StateId> = FxHashSet::default();
        seen.insert(self.init);
        let mut queue = VecDeque::from([self.init]);
        while let Some(st) = queue.pop_front() {
            for tran in self.outgoing(st) {
                if seen.insert(tran.to) {
                    order.push(tran.to);
                    queue.push_back(tran.to);
                }
            }
        }
        order
    }
}

impl Index<ActionId> for Automaton {
    type Output = Action;

    fn index(&self, index: ActionId) -> &Self::Output {
        &self.actions[index]
    }
}

impl Index<&ActionId> for Automaton {
    type Output = Action;

    fn index(&self, index: &ActionId) -> &Self::Output {
        &self.actions[*index]
    }
}

/// Incrementally assembles an `Automaton` and checks the structural
/// invariants on `build`. No partially validated automaton ever escapes.
pub struct AutomatonBuilder {
    name: String,
    states: PrimaryMap<StateId, State>,
    state_by_name: FxHashMap<String, StateId>,
    actions: PrimaryMap<ActionId, Action>,
    action_by_name: FxHashMap<String, ActionId>,
    init: Option<StateId>,
}

impl AutomatonBuilder {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            states: PrimaryMap::new(),
            state_by_name: FxHashMap::default(),
            actions: PrimaryMap::new(),
            action_by_name: FxHashMap::default(),
            init: None,
        }
    }

    /// add a state, returning the existing id if the name is already taken
    pub fn add_state(&mut self, name: impl ToString) -> StateId {
        let name = name.to_string();
        if let Some(id) = self.state_by_name.get(&name) {
            return *id;
        }
        let id = self.states.push(State {
            name: name.clone(),
            trans: Vec::default(),
        });
        self.state_by_name.insert(name, id);
        id
    }

    /// declare an action, returning the existing id when the same name was
    /// already declared with the same direction
    pub fn add_action(
        &mut self,
        name: impl ToString,
        kind: ActionKind,
    ) -> Result<ActionId, MalformedModelError> {
        let name = name.to_string();
        if let Some(id) = self.action_by_name.get(&name) {
            if self.actions[*id].kind != kind {
                return Err(MalformedModelError::DirectionConflict {
                    automaton: self.name.clone(),
                    action: name,
                });
            }
            return Ok(*id);
        }
        let id = self.actions.push(Action {
            name: name.clone(),
            kind,
        });
        self.action_by_name.insert(name, id);
        Ok(id)
    }

    pub fn add_transition(
        &mut self,
        src: StateId,
        action: ActionId,
        dst: StateId,
    ) -> Result<(), MalformedModelError> {
        if !self.states.is_valid(src) || !self.states.is_valid(dst) {
            return Err(MalformedModelError::DanglingState {
                automaton: self.name.clone(),
            });
        }
        if !self.actions.is_valid(action) {
            return Err(MalformedModelError::DanglingAction {
                automaton: self.name.clone(),
            });
        }
        self.states[src].trans.push(Tran { action, to: dst });
        Ok(())
    }

    pub fn set_initial(&mut self, state: StateId) {
        self.init = Some(state);
    }

    pub fn build(self) -> Result<Automaton, MalformedModelError> {
        let init = self
            .init
            .ok_or_else(|| MalformedModelError::NoInitialState {
                automaton: self.name.clone(),
            })?;

        // at most one outgoing transition per state and input action
        for (_, state) in self.states.iter() {
            let mut seen: FxHashSet<ActionId> = FxHashSet::default();
            for tran in &state.trans {
                let action = &self.actions[tran.action];
                if action.kind == ActionKind::Input && !seen.insert(tran.action) {
                    return Err(MalformedModelError::DuplicateInputTransition {
                        automaton: self.name.clone(),
                        state: state.name.clone(),
                        action: action.name.clone(),
                    });
                }
            }
        }

        Ok(Automaton {
            name: self.name,
            states: self.states,
            actions: self.actions,
            action_by_name: self.action_by_name,
            init,
        })
    }
}
