// released under MIT License

use crate::auto::{ActionKind, Automaton, AutomatonBuilder, MalformedModelError, StateId};
use crate::cancel::{CancelToken, Outcome};
use crate::compose::Composition;
use crate::diagnostic::{Finding, FindingCode};
use cranelift_entity::SecondaryMap;
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

/// One step of a witness path, starting from the initial product state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WitnessStep {
    /// formatted action label, e.g. `req!`
    pub action: String,
    /// product state reached by the step
    pub target: String,
}

/// Shortest path from the initial product state to a directly illegal state,
/// demonstrating how the unreceivable output becomes reachable. An empty
/// step list means the initial state itself is illegal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WitnessPath {
    pub steps: Vec<WitnessStep>,
    /// product state with the unreceived output
    pub illegal_state: String,
    /// name of the unreceived output action
    pub action: String,
    /// component that offers the output
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityResult {
    pub compatible: bool,
    /// size of the error set after backward closure
    pub num_error_states: usize,
    pub witness: Option<WitnessPath>,
    pub findings: Vec<Finding>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PruneError {
    #[error("invalid result automaton of product (init state is pruned)")]
    InitialStatePruned,
    #[error(transparent)]
    Malformed(#[from] MalformedModelError),
}

/// Backward closure of the illegal seeds over autonomous transitions. A
/// state joins the error set when one of its output or internal transitions
/// leads into the set; input transitions never propagate illegality because
/// the environment is free to withhold the input.
fn error_closure(comp: &Composition, cancel: &CancelToken) -> Outcome<FxHashSet<StateId>> {
    let product = comp.product();

    // reverse adjacency restricted to autonomous edges
    let mut rev: SecondaryMap<StateId, Vec<StateId>> = SecondaryMap::new();
    for src in product.state_ids() {
        for tran in product.outgoing(src) {
            if product[tran.action].kind() != ActionKind::Input {
                rev[tran.to].push(src);
            }
        }
    }

    let mut set: FxHashSet<StateId> = comp.illegal_seeds().collect();
    let mut queue: VecDeque<StateId> = set.iter().copied().collect();
    while let Some(state) = queue.pop_front() {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        for &pred in &rev[state] {
            if set.insert(pred) {
                queue.push_back(pred);
            }
        }
    }
    debug!(error_states = set.len(), "error closure finished");
    Outcome::Done(set)
}

/// Shortest path from the initial state to the nearest illegal seed, BFS in
/// stored transition order so ties resolve by component supply order.
fn find_witness(comp: &Composition) -> Option<WitnessPath> {
    let product = comp.product();
    let init = product.initial();

    let mut parent: FxHashMap<StateId, (StateId, String)> = FxHashMap::default();
    let mut seen: FxHashSet<StateId> = FxHashSet::default();
    seen.insert(init);
    let mut queue = VecDeque::from([init]);
    let mut found = None;
    if comp.is_illegal_seed(init) {
        found = Some(init);
    }
    while found.is_none() {
        let src = queue.pop_front()?;
        for tran in product.outgoing(src) {
            if seen.insert(tran.to) {
                parent.insert(tran.to, (src, product[tran.action].to_string()));
                if comp.is_illegal_seed(tran.to) {
                    found = Some(tran.to);
                    break;
                }
                queue.push_back(tran.to);
            }
        }
    }

    let illegal = found?;
    let mut steps = Vec::new();
    let mut cursor = illegal;
    while let Some((src, action)) = parent.get(&cursor) {
        steps.push(WitnessStep {
            action: action.clone(),
            target: product.state_name(cursor).to_string(),
        });
        cursor = *src;
    }
    steps.reverse();

    let unreceived = comp.unreceived(illegal)?;
    Some(WitnessPath {
        steps,
        illegal_state: product.state_name(illegal).to_string(),
        action: unreceived.action.clone(),
        sender: comp.components()[unreceived.sender].clone(),
    })
}

fn incompatibility_finding(witness: &WitnessPath) -> Finding {
    let message = format!(
        "incompatible composition: output '{}!' from '{}' cannot be received in state {}",
        witness.action, witness.sender, witness.illegal_state
    );
    Finding::new(FindingCode::IncompatibleComposition, message)
        .with_state(&witness.illegal_state)
        .with_action(&witness.action)
}

/// Decide compatibility of a composition: compute the error closure and
/// check whether the initial product state survives. On incompatibility the
/// result carries a minimal witness path for diagnostics.
pub fn check_compatibility(
    comp: &Composition,
    cancel: &CancelToken,
) -> Outcome<CompatibilityResult> {
    if cancel.is_cancelled() {
        return Outcome::Cancelled;
    }
    let errors = match error_closure(comp, cancel) {
        Outcome::Done(set) => set,
        Outcome::Cancelled => return Outcome::Cancelled,
    };

    let compatible = !errors.contains(&comp.product().initial());
    let witness = if compatible { None } else { find_witness(comp) };
    let findings = witness.iter().map(incompatibility_finding).collect();
    Outcome::Done(CompatibilityResult {
        compatible,
        num_error_states: errors.len(),
        witness,
        findings,
    })
}

fn rebuild_without(
    comp: &Composition,
    errors: &FxHashSet<StateId>,
) -> Result<Automaton, PruneError> {
    let product = comp.product();
    let mut builder = AutomatonBuilder::new(product.name());
    let mut remap: FxHashMap<StateId, StateId> = FxHashMap::default();
    for state in product.state_ids() {
        if !errors.contains(&state) {
            remap.insert(state, builder.add_state(product.state_name(state)));
        }
    }
    builder.set_initial(remap[&product.initial()]);

    // the pruned automaton keeps the full product alphabet even when every
    // transition using an action is dropped
    for id in product.action_ids() {
        let action = &product[id];
        builder.add_action(action.name(), action.kind())?;
    }

    for state in product.state_ids() {
        // drop outgoing transitions of error states
        let Some(&src) = remap.get(&state) else {
            continue;
        };
        for tran in product.outgoing(state) {
            // drop incoming transitions to error states
            let Some(&dst) = remap.get(&tran.to) else {
                continue;
            };
            let action = &product[tran.action];
            let id = builder.add_action(action.name(), action.kind())?;
            builder.add_transition(src, id, dst)?;
        }
    }
    Ok(builder.build()?)
}

/// Remove the error closure from the product, dropping every transition into
/// or out of an error state. Fails when the initial state itself is in the
/// closure, since no valid automaton remains.
pub fn prune(comp: &Composition, cancel: &CancelToken) -> Outcome<Result<Automaton, PruneError>> {
    if cancel.is_cancelled() {
        return Outcome::Cancelled;
    }
    let errors = match error_closure(comp, cancel) {
        Outcome::Done(set) => set,
        Outcome::Cancelled => return Outcome::Cancelled,
    };
    if errors.contains(&comp.product().initial()) {
        return Outcome::Done(Err(PruneError::InitialStatePruned));
    }
    Outcome::Done(rebuild_without(comp, &errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto::tests::{build_client, build_server};
    use crate::auto::AutomatonBuilder;
    use crate::compose::compose;

    fn composed(components: &[&Automaton]) -> Composition {
        compose(components, &CancelToken::new())
            .unwrap()
            .into_done()
            .unwrap()
    }

    /// `A` emits `alert!` with no consumer anywhere
    fn alert_pair() -> (Automaton, Automaton) {
        let mut b = AutomatonBuilder::new("A");
        let a0 = b.add_state("a0");
        let a1 = b.add_state("a1");
        let alert = b.add_action("alert", ActionKind::Output).unwrap();
        b.add_transition(a0, alert, a1).unwrap();
        b.set_initial(a0);
        let a = b.build().unwrap();

        let mut b = AutomatonBuilder::new("B");
        let b0 = b.add_state("b0");
        b.set_initial(b0);
        (a, b.build().unwrap())
    }

    #[test]
    fn matched_pair_is_compatible() {
        let client = build_client();
        let server = build_server();
        let comp = composed(&[&client, &server]);
        let result = check_compatibility(&comp, &CancelToken::new())
            .into_done()
            .unwrap();
        assert!(result.compatible);
        assert_eq!(result.num_error_states, 0);
        assert!(result.witness.is_none());
        assert!(result.findings.is_empty());
    }

    #[test]
    fn unconsumed_output_gives_zero_length_witness() {
        let (a, passive) = alert_pair();
        let comp = composed(&[&a, &passive]);
        let result = check_compatibility(&comp, &CancelToken::new())
            .into_done()
            .unwrap();
        assert!(!result.compatible);

        let witness = result.witness.unwrap();
        assert!(witness.steps.is_empty());
        assert_eq!(witness.illegal_state, "(a0,b0)");
        assert_eq!(witness.action, "alert");
        assert_eq!(witness.sender, "A");

        assert_eq!(result.findings.len(), 1);
        let finding = &result.findings[0];
        assert_eq!(finding.code, FindingCode::IncompatibleComposition);
        assert_eq!(
            finding.message,
            "incompatible composition: output 'alert!' from 'A' cannot be received in state (a0,b0)"
        );
        assert_eq!(finding.state.as_deref(), Some("(a0,b0)"));
    }

    #[test]
    fn illegality_propagates_backward_over_autonomous_steps() {
        // sender can emit `msg!` twice, receiver accepts only once; the
        // illegal state is reached by a forced synchronization
        let mut b = AutomatonBuilder::new("S");
        let s0 = b.add_state("s0");
        let s1 = b.add_state("s1");
        let msg = b.add_action("msg", ActionKind::Output).unwrap();
        b.add_transition(s0, msg, s1).unwrap();
        b.add_transition(s1, msg, s1).unwrap();
        b.set_initial(s0);
        let sender = b.build().unwrap();

        let mut b = AutomatonBuilder::new("R");
        let r0 = b.add_state("r0");
        let r1 = b.add_state("r1");
        let msg = b.add_action("msg", ActionKind::Input).unwrap();
        b.add_transition(r0, msg, r1).unwrap();
        b.set_initial(r0);
        let receiver = b.build().unwrap();

        let comp = composed(&[&sender, &receiver]);
        let result = check_compatibility(&comp, &CancelToken::new())
            .into_done()
            .unwrap();
        assert!(!result.compatible);
        assert_eq!(result.num_error_states, 2);

        let witness = result.witness.unwrap();
        assert_eq!(witness.steps.len(), 1);
        assert_eq!(witness.steps[0].action, "msg");
        assert_eq!(witness.steps[0].target, "(s1,r1)");
        assert_eq!(witness.illegal_state, "(s1,r1)");
    }

    #[test]
    fn input_steps_do_not_propagate_illegality() {
        // the only way into the illegal state is an input the environment
        // can withhold, so the initial state stays legal
        let mut b = AutomatonBuilder::new("A");
        let a0 = b.add_state("a0");
        let a1 = b.add_state("a1");
        let a2 = b.add_state("a2");
        let go = b.add_action("go", ActionKind::Input).unwrap();
        let bad = b.add_action("bad", ActionKind::Output).unwrap();
        b.add_transition(a0, go, a1).unwrap();
        b.add_transition(a1, bad, a2).unwrap();
        b.set_initial(a0);
        let a = b.build().unwrap();

        let mut b = AutomatonBuilder::new("B");
        let b0 = b.add_state("b0");
        b.set_initial(b0);
        let passive = b.build().unwrap();

        let comp = composed(&[&a, &passive]);
        let result = check_compatibility(&comp, &CancelToken::new())
            .into_done()
            .unwrap();
        assert!(result.compatible);
        assert_eq!(result.num_error_states, 1);
    }

    #[test]
    fn error_set_is_monotonic_under_extra_components() {
        let (a, passive) = alert_pair();
        let sub = composed(&[&a, &passive]);
        let sub_result = check_compatibility(&sub, &CancelToken::new())
            .into_done()
            .unwrap();
        assert!(sub_result.num_error_states > 0);

        let mut b = AutomatonBuilder::new("C");
        let c0 = b.add_state("c0");
        let tick = b.add_action("tick", ActionKind::Input).unwrap();
        b.add_transition(c0, tick, c0).unwrap();
        b.set_initial(c0);
        let c = b.build().unwrap();

        let full = composed(&[&a, &passive, &c]);
        let full_result = check_compatibility(&full, &CancelToken::new())
            .into_done()
            .unwrap();
        assert!(full_result.num_error_states >= sub_result.num_error_states);
        assert!(!full_result.compatible);
    }

    #[test]
    fn prune_keeps_a_compatible_product_intact() {
        let client = build_client();
        let server = build_server();
        let comp = composed(&[&client, &server]);
        let pruned = prune(&comp, &CancelToken::new())
            .into_done()
            .unwrap()
            .unwrap();
        assert_eq!(pruned.num_states(), comp.product().num_states());
    }

    #[test]
    fn prune_drops_error_states_and_their_edges() {
        let mut b = AutomatonBuilder::new("A");
        let a0 = b.add_state("a0");
        let a1 = b.add_state("a1");
        let a2 = b.add_state("a2");
        let go = b.add_action("go", ActionKind::Input).unwrap();
        let bad = b.add_action("bad", ActionKind::Output).unwrap();
        b.add_transition(a0, go, a1).unwrap();
        b.add_transition(a1, bad, a2).unwrap();
        b.set_initial(a0);
        let a = b.build().unwrap();

        let mut b = AutomatonBuilder::new("B");
        let b0 = b.add_state("b0");
        b.set_initial(b0);
        let passive = b.build().unwrap();

        let comp = composed(&[&a, &passive]);
        let pruned = prune(&comp, &CancelToken::new())
            .into_done()
            .unwrap()
            .unwrap();
        // (a1,b0) is illegal; both its incoming and outgoing edges vanish
        assert_eq!(pruned.num_states(), 2);
        for state in pruned.state_ids() {
            assert!(pruned.outgoing(state).is_empty());
        }
        // the alphabet survives even though no transition uses it anymore
        let go = pruned.lookup_action("go").unwrap();
        assert_eq!(pruned[go].kind(), ActionKind::Input);
        let bad = pruned.lookup_action("bad").unwrap();
        assert_eq!(pruned[bad].kind(), ActionKind::Output);
    }

    #[test]
    fn prune_rejects_pruned_initial_state() {
        let (a, passive) = alert_pair();
        let comp = composed(&[&a, &passive]);
        let result = prune(&comp, &CancelToken::new()).into_done().unwrap();
        assert_eq!(result, Err(PruneError::InitialStatePruned));
    }

    #[test]
    fn cancelled_before_any_exploration() {
        let client = build_client();
        let server = build_server();
        let comp = composed(&[&client, &server]);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(check_compatibility(&comp, &cancel).is_cancelled());
        assert!(prune(&comp, &cancel).is_cancelled());
    }
}
