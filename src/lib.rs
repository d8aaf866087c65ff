//! Latent-variable PCFG induction by split/merge EM.
//!
//! This crate provides:
//! - Substate-annotated binary/unary rules with sparse score tensors
//! - A smoothed word-emission lexicon with unknown-word signatures
//! - The grammar: indexing, tallying, normalization, split/merge, unary closure
//! - A scaled inside-outside engine over binarized training trees
//! - Merge evaluation from posterior node scores
//! - The split/merge/smooth EM refinement driver
//! - Plain-text export of trained models

pub mod export;
pub mod grammar;
pub mod inout;
pub mod lexicon;
pub mod merger;
pub mod rules;
pub mod scaling;
pub mod symbol;
pub mod trainer;
pub mod tree;

// Re-exports for convenience
pub use export::{write_grammar, write_lexicon};
pub use grammar::{Grammar, NoSmoothing, Smoother, SubstateInterpolation, DIRECT_RULE};
pub use inout::{tree_log_likelihood, ArrayParser, SpanScores};
pub use lexicon::Lexicon;
pub use merger::{
    compute_merge_likelihood_deltas, select_merge_pairs, substate_conditional_probs, Combined,
    LikelihoodLoss, MergeObjective, RuleCountSavings,
};
pub use rules::{BinaryRule, MergeMap, UnaryRule};
pub use symbol::{StateId, TagSet};
pub use trainer::{em_iteration, init_model, train, EmStats, TrainerConfig, TrainingResult};
pub use tree::{annotate, resize_substates, StateSet, Tree, TreeError};
