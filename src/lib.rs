// released under MIT License

//! Semantic validation engine for interface-automata specifications:
//! synchronous-product composition, optimistic compatibility checking and
//! alternating-refinement checking over in-memory automaton models. Parsing
//! and editor integration live outside this crate; it consumes validated
//! models and produces structured findings.

pub mod auto;
pub mod cancel;
pub mod compat;
pub mod compose;
pub mod diagnostic;
pub mod refine;
