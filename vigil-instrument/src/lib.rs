#![forbid(unsafe_code)]

//! Contract instrumentation for Python syntax trees.
//!
//! [`RuleSet`] decides which guards a node earns; [`Transformer`] splices them
//! into a [`vigil_ast::Module`] in one depth-first pass.

mod rules;
mod transform;

pub use rules::{Assertion, GuardKind, RuleConfig, RuleSet};
pub use transform::{Insertion, Instrumented, Transformer};
