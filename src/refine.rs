// released under MIT License

use crate::auto::{ActionKind, Automaton, StateId};
use crate::cancel::{CancelToken, Outcome};
use crate::diagnostic::{Finding, FindingCode};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

/// implementation state paired with a specification state
type Pair = (StateId, StateId);

/// Why the check declared non-refinement at a particular state pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefinementCause {
    /// the specification requires an input the implementation does not accept
    MissingInput { action: String },
    /// the implementation may emit an output the specification forbids
    ExtraOutput { action: String },
}

/// Minimal counterexample: the state pair at which the local refinement
/// condition fails, and the unmatched action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counterexample {
    pub impl_state: String,
    pub spec_state: String,
    pub cause: RefinementCause,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinementResult {
    pub refines: bool,
    pub counterexample: Option<Counterexample>,
    pub findings: Vec<Finding>,
}

/// Why a pair left the candidate relation. Dependent removals point at the
/// previously removed pair they relied on, so a chain from the initial pair
/// always ends at a direct cause.
#[derive(Debug, Clone)]
enum Removal {
    MissingInput { action: String },
    ExtraOutput { action: String },
    BadInputTarget { next: Pair },
    BadOutputTarget { next: Pair },
    BadInternalTarget { next: Pair },
}

/// Spec states reachable from `state` by internal moves only, `state` first.
/// An internal move of the implementation may be answered by the spec
/// staying put or moving through its own internal transitions.
fn internal_closure(spec: &Automaton, state: StateId) -> Vec<StateId> {
    let mut order = vec![state];
    let mut seen: FxHashSet<StateId> = FxHashSet::default();
    seen.insert(state);
    let mut cursor = 0;
    while cursor < order.len() {
        let st = order[cursor];
        cursor += 1;
        for tran in spec.outgoing_of_kind(st, ActionKind::Internal) {
            if seen.insert(tran.to) {
                order.push(tran.to);
            }
        }
    }
    order
}

/// Check the local alternating-simulation condition for one pair against the
/// current relation. Returns the reason the pair must leave, if any.
fn find_violation(
    imp: &Automaton,
    spec: &Automaton,
    pair: Pair,
    spec_closure: &[StateId],
    relation: &FxHashSet<Pair>,
) -> Option<Removal> {
    let (i, s) = pair;

    // every input the spec enables must be accepted, with related targets
    for tran in spec.outgoing_of_kind(s, ActionKind::Input) {
        let action = &spec[tran.action];
        match imp.input_successor(i, action.name()) {
            None => {
                return Some(Removal::MissingInput {
                    action: action.name().to_string(),
                });
            }
            Some(i2) => {
                if !relation.contains(&(i2, tran.to)) {
                    return Some(Removal::BadInputTarget { next: (i2, tran.to) });
                }
            }
        }
    }

    // every output the implementation may emit must be allowed, with some
    // related target
    for tran in imp.outgoing_of_kind(i, ActionKind::Output) {
        let action = &imp[tran.action];
        let mut candidates = spec
            .targets_by_name(s, action.name(), ActionKind::Output)
            .peekable();
        if candidates.peek().is_none() {
            return Some(Removal::ExtraOutput {
                action: action.name().to_string(),
            });
        }
        let mut first = None;
        let mut matched = false;
        for s2 in candidates {
            if relation.contains(&(tran.to, s2)) {
                matched = true;
                break;
            }
            first.get_or_insert((tran.to, s2));
        }
        if !matched {
            // first is always set: peek saw at least one candidate
            if let Some(next) = first {
                return Some(Removal::BadOutputTarget { next });
            }
        }
    }

    // internal moves keep the spec within the internal closure of s
    for tran in imp.outgoing_of_kind(i, ActionKind::Internal) {
        let related = spec_closure
            .iter()
            .any(|&s2| relation.contains(&(tran.to, s2)));
        if !related {
            return Some(Removal::BadInternalTarget { next: (tran.to, s) });
        }
    }

    None
}

/// Alphabet-level precondition: the implementation must declare at least the
/// specification's inputs and at most its outputs.
fn alphabet_violation(imp: &Automaton, spec: &Automaton) -> Option<RefinementCause> {
    for id in spec.action_ids() {
        let action = &spec[id];
        if action.kind() == ActionKind::Input
            && imp
                .lookup_action(action.name())
                .map(|a| imp[a].kind() != ActionKind::Input)
                .unwrap_or(true)
        {
            return Some(RefinementCause::MissingInput {
                action: action.name().to_string(),
            });
        }
    }
    for id in imp.action_ids() {
        let action = &imp[id];
        if action.kind() == ActionKind::Output
            && spec
                .lookup_action(action.name())
                .map(|a| spec[a].kind() != ActionKind::Output)
                .unwrap_or(true)
        {
            return Some(RefinementCause::ExtraOutput {
                action: action.name().to_string(),
            });
        }
    }
    None
}

/// Walk removal chains from the initial pair down to a direct cause.
fn trace_counterexample(
    imp: &Automaton,
    spec: &Automaton,
    removals: &FxHashMap<Pair, Removal>,
    start: Pair,
) -> Option<Counterexample> {
    let mut cursor = start;
    loop {
        match removals.get(&cursor)? {
            Removal::MissingInput { action } => {
                return Some(Counterexample {
                    impl_state: imp.state_name(cursor.0).to_string(),
                    spec_state: spec.state_name(cursor.1).to_string(),
                    cause: RefinementCause::MissingInput {
                        action: action.clone(),
                    },
                });
            }
            Removal::ExtraOutput { action } => {
                return Some(Counterexample {
                    impl_state: imp.state_name(cursor.0).to_string(),
                    spec_state: spec.state_name(cursor.1).to_string(),
                    cause: RefinementCause::ExtraOutput {
                        action: action.clone(),
                    },
                });
            }
            Removal::BadInputTarget { next }
            | Removal::BadOutputTarget { next }
            | Removal::BadInternalTarget { next } => {
                cursor = *next;
            }
        }
    }
}

fn refinement_finding(cex: &Counterexample) -> Finding {
    match &cex.cause {
        RefinementCause::MissingInput { action } => {
            let message = format!(
                "missing input: {} (required by specification state {}, not accepted by implementation state {})",
                action, cex.spec_state, cex.impl_state
            );
            Finding::new(FindingCode::RefinementMissingInput, message)
                .with_state(&cex.impl_state)
                .with_action(action)
        }
        RefinementCause::ExtraOutput { action } => {
            let message = format!(
                "extra output: {} (offered by implementation state {}, not allowed by specification state {})",
                action, cex.impl_state, cex.spec_state
            );
            Finding::new(FindingCode::RefinementExtraOutput, message)
                .with_state(&cex.impl_state)
                .with_action(action)
        }
    }
}

fn result_for(cex: Option<Counterexample>) -> RefinementResult {
    let findings = cex.iter().map(refinement_finding).collect();
    RefinementResult {
        refines: cex.is_none(),
        counterexample: cex,
        findings,
    }
}

/// Compute the greatest alternating-simulation relation between `imp` and
/// `spec` and decide whether the pair of initial states survives. The
/// relation starts from all pairs of reachable states and shrinks by
/// repeated sweeps until stable (greatest fixed point).
pub fn check_refinement(
    imp: &Automaton,
    spec: &Automaton,
    cancel: &CancelToken,
) -> Outcome<RefinementResult> {
    if cancel.is_cancelled() {
        return Outcome::Cancelled;
    }

    if let Some(cause) = alphabet_violation(imp, spec) {
        let cex = Counterexample {
            impl_state: imp.state_name(imp.initial()).to_string(),
            spec_state: spec.state_name(spec.initial()).to_string(),
            cause,
        };
        return Outcome::Done(result_for(Some(cex)));
    }

    let imp_reach = imp.reachable();
    let spec_reach = spec.reachable();
    let closures: FxHashMap<StateId, Vec<StateId>> = spec_reach
        .iter()
        .map(|&s| (s, internal_closure(spec, s)))
        .collect();
    let mut relation: FxHashSet<Pair> = FxHashSet::default();
    for &i in &imp_reach {
        for &s in &spec_reach {
            relation.insert((i, s));
        }
    }

    let mut removals: FxHashMap<Pair, Removal> = FxHashMap::default();
    loop {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        let mut to_remove: Vec<(Pair, Removal)> = Vec::new();
        for &pair in &relation {
            if let Some(removal) = find_violation(imp, spec, pair, &closures[&pair.1], &relation) {
                to_remove.push((pair, removal));
            }
        }
        if to_remove.is_empty() {
            break;
        }
        debug!(removed = to_remove.len(), "refinement sweep");
        for (pair, removal) in to_remove {
            relation.remove(&pair);
            removals.insert(pair, removal);
        }
    }

    let init = (imp.initial(), spec.initial());
    if relation.contains(&init) {
        return Outcome::Done(result_for(None));
    }
    let cex = trace_counterexample(imp, spec, &removals, init);
    Outcome::Done(result_for(cex))
}
