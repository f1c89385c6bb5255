// released under MIT License

use crate::auto::{ActionKind, Automaton, AutomatonBuilder, MalformedModelError, StateId};
use crate::cancel::{CancelToken, Outcome};
use cranelift_entity::SecondaryMap;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

/// Composition input where two automata declare the same action name in a
/// way that cannot synchronize. Fatal to the composition call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionConflictError {
    #[error("action '{action}' is declared as {kind} by both '{first}' and '{second}'")]
    SameDirection {
        action: String,
        kind: ActionKind,
        first: String,
        second: String,
    },
    #[error("internal action '{action}' of '{owner}' collides with an action of '{other}'")]
    InternalClash {
        action: String,
        owner: String,
        other: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComposeError {
    #[error("composition requires at least two automata, got {0}")]
    TooFewComponents(usize),
    #[error(transparent)]
    Conflict(#[from] ActionConflictError),
    #[error(transparent)]
    Malformed(#[from] MalformedModelError),
}

/// An output some component may perform in a global state while no other
/// component currently accepts the matching input. Seeds the error set of
/// the compatibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreceivedOutput {
    /// name of the output action
    pub action: String,
    /// index of the emitting component, in supply order
    pub sender: usize,
}

/// The synchronous product of two or more interface automata, restricted to
/// the global states reachable from the tuple of initial states. Owned by a
/// single validation pass; never mutated after construction.
#[derive(Debug, Clone)]
pub struct Composition {
    product: Automaton,
    components: Vec<String>,
    tuples: SecondaryMap<StateId, Vec<StateId>>,
    illegal: FxHashMap<StateId, UnreceivedOutput>,
}

impl Composition {
    pub fn product(&self) -> &Automaton {
        &self.product
    }

    /// the product automaton, for further composition
    pub fn into_product(self) -> Automaton {
        self.product
    }

    /// component automaton names, in supply order
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// component states making up a global product state
    pub fn tuple(&self, state: StateId) -> &[StateId] {
        &self.tuples[state]
    }

    /// global states with an unreceived output (before backward closure)
    pub fn is_illegal_seed(&self, state: StateId) -> bool {
        self.illegal.contains_key(&state)
    }

    pub fn unreceived(&self, state: StateId) -> Option<&UnreceivedOutput> {
        self.illegal.get(&state)
    }

    pub fn num_illegal_seeds(&self) -> usize {
        self.illegal.len()
    }

    pub fn illegal_seeds(&self) -> impl Iterator<Item = StateId> + '_ {
        self.illegal.keys().copied()
    }
}

/// name → (sender component, receiver component) for every action shared
/// between two components
type SharedActions = FxHashMap<String, (usize, usize)>;

fn declared_kinds(component: &Automaton) -> FxHashMap<&str, ActionKind> {
    component
        .action_ids()
        .map(|id| (component[id].name(), component[id].kind()))
        .collect()
}

/// Reject shared names that cannot synchronize and collect the rest. After
/// this check each shared name has exactly one sender and one receiver
/// (pairwise synchronization).
fn check_composable(
    components: &[&Automaton],
) -> Result<SharedActions, ActionConflictError> {
    let decls: Vec<_> = components.iter().map(|c| declared_kinds(c)).collect();
    let mut shared = SharedActions::default();
    for i in 0..components.len() {
        for j in (i + 1)..components.len() {
            for (&name, &kind_i) in &decls[i] {
                let Some(&kind_j) = decls[j].get(name) else {
                    continue;
                };
                match (kind_i, kind_j) {
                    (ActionKind::Input, ActionKind::Output) => {
                        shared.insert(name.to_string(), (j, i));
                    }
                    (ActionKind::Output, ActionKind::Input) => {
                        shared.insert(name.to_string(), (i, j));
                    }
                    (ActionKind::Input, ActionKind::Input)
                    | (ActionKind::Output, ActionKind::Output) => {
                        return Err(ActionConflictError::SameDirection {
                            action: name.to_string(),
                            kind: kind_i,
                            first: components[i].name().to_string(),
                            second: components[j].name().to_string(),
                        });
                    }
                    (ActionKind::Internal, _) => {
                        return Err(ActionConflictError::InternalClash {
                            action: name.to_string(),
                            owner: components[i].name().to_string(),
                            other: components[j].name().to_string(),
                        });
                    }
                    (_, ActionKind::Internal) => {
                        return Err(ActionConflictError::InternalClash {
                            action: name.to_string(),
                            owner: components[j].name().to_string(),
                            other: components[i].name().to_string(),
                        });
                    }
                }
            }
        }
    }
    Ok(shared)
}

fn tuple_name(components: &[&Automaton], tuple: &[StateId]) -> String {
    let names: Vec<&str> = components
        .iter()
        .zip(tuple)
        .map(|(c, st)| c.state_name(*st))
        .collect();
    format!("({})", names.join(","))
}

struct ProductBuilder<'a> {
    components: &'a [&'a Automaton],
    builder: AutomatonBuilder,
    tuples: SecondaryMap<StateId, Vec<StateId>>,
    visited: FxHashMap<Vec<StateId>, StateId>,
    queue: VecDeque<StateId>,
}

impl<'a> ProductBuilder<'a> {
    fn intern(&mut self, tuple: Vec<StateId>) -> StateId {
        if let Some(id) = self.visited.get(&tuple) {
            return *id;
        }
        let id = self.builder.add_state(tuple_name(self.components, &tuple));
        self.visited.insert(tuple.clone(), id);
        self.tuples[id] = tuple;
        self.queue.push_back(id);
        id
    }

    fn add_step(
        &mut self,
        src: StateId,
        name: &str,
        kind: ActionKind,
        dst_tuple: Vec<StateId>,
    ) -> Result<(), MalformedModelError> {
        let dst = self.intern(dst_tuple);
        let action = self.builder.add_action(name, kind)?;
        debug!(action = name, "add product step");
        self.builder.add_transition(src, action, dst)
    }
}

/// Build the synchronous product of the given automata, breadth-first from
/// the tuple of initial states. Shared action pairs move synchronously and
/// are hidden (internal) in the product; internal and unshared actions move
/// one component independently. Global states where some enabled output has
/// no current receiver are recorded as illegal seeds for the compatibility
/// check.
pub fn compose(
    components: &[&Automaton],
    cancel: &CancelToken,
) -> Result<Outcome<Composition>, ComposeError> {
    if components.len() < 2 {
        return Err(ComposeError::TooFewComponents(components.len()));
    }
    let shared = check_composable(components)?;
    if cancel.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }

    let name = {
        let names: Vec<&str> = components.iter().map(|c| c.name()).collect();
        format!("Product_{}", names.join("_"))
    };
    let mut pb = ProductBuilder {
        components,
        builder: AutomatonBuilder::new(name),
        tuples: SecondaryMap::new(),
        visited: FxHashMap::default(),
        queue: VecDeque::new(),
    };
    let mut illegal: FxHashMap<StateId, UnreceivedOutput> = FxHashMap::default();

    // the product inherits every declared component action, used or not;
    // synchronized names are hidden
    for comp in components {
        for id in comp.action_ids() {
            let action = &comp[id];
            let kind = if shared.contains_key(action.name()) {
                ActionKind::Internal
            } else {
                action.kind()
            };
            pb.builder.add_action(action.name(), kind)?;
        }
    }

    let init_tuple: Vec<StateId> = components.iter().map(|c| c.initial()).collect();
    let init = pb.intern(init_tuple);
    pb.builder.set_initial(init);

    while let Some(src) = pb.queue.pop_front() {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let tuple = pb.tuples[src].clone();
        for (k, comp) in components.iter().enumerate() {
            for tran in comp.outgoing(tuple[k]) {
                let action = &comp[tran.action];
                let name = action.name();
                match action.kind() {
                    ActionKind::Internal => {
                        let mut dst = tuple.clone();
                        dst[k] = tran.to;
                        pb.add_step(src, name, ActionKind::Internal, dst)?;
                    }
                    ActionKind::Input => {
                        // shared inputs only move jointly with their sender
                        if !shared.contains_key(name) {
                            let mut dst = tuple.clone();
                            dst[k] = tran.to;
                            pb.add_step(src, name, ActionKind::Input, dst)?;
                        }
                    }
                    ActionKind::Output => {
                        if let Some(&(_, receiver)) = shared.get(name) {
                            match components[receiver].input_successor(tuple[receiver], name) {
                                Some(recv_dst) => {
                                    let mut dst = tuple.clone();
                                    dst[k] = tran.to;
                                    dst[receiver] = recv_dst;
                                    pb.add_step(src, name, ActionKind::Internal, dst)?;
                                }
                                None => {
                                    // receiver cannot take the output right now
                                    illegal.entry(src).or_insert(UnreceivedOutput {
                                        action: name.to_string(),
                                        sender: k,
                                    });
                                }
                            }
                        } else {
                            // no declared consumer among the composed
                            // components; the state is illegal but the
                            // independent move still exists in the product
                            illegal.entry(src).or_insert(UnreceivedOutput {
                                action: name.to_string(),
                                sender: k,
                            });
                            let mut dst = tuple.clone();
                            dst[k] = tran.to;
                            pb.add_step(src, name, ActionKind::Output, dst)?;
                        }
                    }
                }
            }
        }
    }

    let product = pb.builder.build()?;
    debug!(
        states = product.num_states(),
        seeds = illegal.len(),
        "product construction finished"
    );
    Ok(Outcome::Done(Composition {
        product,
        components: components.iter().map(|c| c.name().to_string()).collect(),
        tuples: pb.tuples,
        illegal,
    }))
}
