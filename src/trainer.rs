//! The split/merge/smooth EM refinement driver.
//!
//! Starting from a one-substate grammar and lexicon tallied off the raw
//! corpus, each refinement cycle doubles every state's substates, runs EM
//! to convergence, merges back the half of the substate pairs that are
//! cheapest to collapse, re-runs EM, and finishes with a smoothed EM phase.
//! The E-step is a rayon map-reduce: the current model is read-only while
//! per-worker accumulators collect expected counts, which a reduction then
//! combines; the M-step normalizes single-threaded.

use crate::grammar::{Grammar, NoSmoothing, Smoother, SubstateInterpolation};
use crate::inout::{tree_log_likelihood, ArrayParser};
use crate::lexicon::Lexicon;
use crate::merger::{
    compute_merge_likelihood_deltas, select_merge_pairs, substate_conditional_probs,
    MergeObjective,
};
use crate::tree::{
    alloc_tree_scores, release_tree_scores, resize_substates, StateSet, Tree, TreeError,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{info, warn};

/// All knobs of a training run. The trainer never reads configuration from
/// anywhere else.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Number of split/merge/smooth refinement cycles.
    pub cycles: usize,
    /// EM iterations after a split.
    pub em_iterations: usize,
    /// EM iterations after a merge.
    pub merge_em_iterations: usize,
    /// EM iterations in the smoothed phase that ends a cycle.
    pub smooth_em_iterations: usize,
    /// Fraction of substate pairs to merge back each cycle.
    pub merge_fraction: f64,
    /// Rule probabilities below this are pruned to zero at the M-step.
    pub rule_floor: f64,
    /// Interpolation weight of the substate-mean smoother.
    pub smoothing_alpha: f64,
    /// Symmetric perturbation (percent) applied when splitting.
    pub split_randomness: f64,
    pub seed: u64,
    /// Words at or below this corpus count score through their signature.
    pub rare_word_threshold: f64,
    /// [seen-word interpolation, signature additive smoothing].
    pub lexicon_smoothing: [f64; 2],
    /// Tolerated per-iteration likelihood decrease before warning.
    pub em_tolerance: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            cycles: 6,
            em_iterations: 50,
            merge_em_iterations: 20,
            smooth_em_iterations: 10,
            merge_fraction: 0.5,
            rule_floor: 1e-30,
            smoothing_alpha: 0.01,
            split_randomness: 1.0,
            seed: 2,
            rare_word_threshold: 20.0,
            lexicon_smoothing: [0.5, 0.1],
            em_tolerance: 1e-4,
        }
    }
}

/// Outcome of one EM iteration over the corpus.
#[derive(Debug, Clone)]
pub struct EmStats {
    pub log_likelihood: f64,
    /// Trees whose likelihood under the current model was non-finite;
    /// skipped and counted, never fatal.
    pub trees_skipped: usize,
}

/// Final model plus the per-iteration likelihood trajectory.
pub struct TrainingResult {
    pub grammar: Grammar,
    pub lexicon: Lexicon,
    pub likelihood_trajectory: Vec<f64>,
}

/// Per-worker E-step accumulator.
struct EmAccumulator {
    grammar: Grammar,
    lexicon: Lexicon,
    log_likelihood: f64,
    trees_skipped: usize,
}

impl EmAccumulator {
    fn like(grammar: &Grammar, lexicon: &Lexicon) -> Self {
        EmAccumulator {
            grammar: grammar.counts_like(),
            lexicon: lexicon.counts_like(),
            log_likelihood: 0.0,
            trees_skipped: 0,
        }
    }

    fn combine(mut self, other: EmAccumulator) -> Self {
        self.grammar.merge_counts(&other.grammar);
        self.lexicon.merge_counts(&other.lexicon);
        self.log_likelihood += other.log_likelihood;
        self.trees_skipped += other.trees_skipped;
        self
    }
}

/// Tally the one-substate model off the raw corpus: every tree counts 1
/// at substate 0, then the counts normalize into the starting grammar and
/// the lexicon learns its vocabulary and signature statistics.
pub fn init_model<R: rand::Rng>(
    trees: &[Tree<StateSet>],
    n_states: usize,
    config: &TrainerConfig,
    rng: &mut R,
) -> (Grammar, Lexicon) {
    let mut grammar = Grammar::new(vec![1; n_states]);
    let mut lexicon = Lexicon::new(
        vec![1; n_states],
        config.rare_word_threshold,
        config.lexicon_smoothing,
    );
    for tree in trees {
        grammar.tally_uninitialized_tree(tree);
        lexicon.tally_uninitialized_tree(tree);
    }
    lexicon.register_unseen_stats();
    lexicon.cache_signatures(trees);
    grammar.optimize(0.0, rng, &NoSmoothing, config.rule_floor);
    (grammar, lexicon)
}

/// One full EM iteration: parallel E-step over the trees, then a
/// single-threaded M-step. Returns the re-estimated model.
///
/// The tree slice is mutable only for its transient score vectors; shapes
/// and labels are untouched. A `TreeError` here means a malformed tree
/// reached the trainer and is fatal.
pub fn em_iteration<R: rand::Rng>(
    grammar: &Grammar,
    lexicon: &Lexicon,
    trees: &mut [Tree<StateSet>],
    smoother: &dyn Smoother,
    rule_floor: f64,
    rng: &mut R,
) -> Result<(Grammar, Lexicon, EmStats), TreeError> {
    let acc = trees
        .par_iter_mut()
        .try_fold(
            || EmAccumulator::like(grammar, lexicon),
            |mut acc, tree| -> Result<EmAccumulator, TreeError> {
                alloc_tree_scores(tree);
                let parser = ArrayParser::new(grammar, lexicon);
                parser.compute_inside_outside(tree, false, None)?;
                let ll = tree_log_likelihood(tree);
                if !ll.is_finite() {
                    acc.trees_skipped += 1;
                    release_tree_scores(tree);
                    return Ok(acc);
                }
                let tree_prob = tree.label.inside()[0];
                let tree_scale = tree.label.inside_scale;
                acc.grammar.tally_tree(tree, grammar, tree_prob, tree_scale);
                acc.lexicon.tally_tree(tree, tree_prob, tree_scale);
                acc.log_likelihood += ll;
                release_tree_scores(tree);
                Ok(acc)
            },
        )
        .try_reduce(
            || EmAccumulator::like(grammar, lexicon),
            |a, b| Ok(a.combine(b)),
        )?;

    let EmAccumulator {
        grammar: mut new_grammar,
        lexicon: mut new_lexicon,
        log_likelihood,
        trees_skipped,
    } = acc;
    new_grammar.optimize(0.0, rng, smoother, rule_floor);
    new_lexicon.optimize();
    Ok((
        new_grammar,
        new_lexicon,
        EmStats {
            log_likelihood,
            trees_skipped,
        },
    ))
}

/// Run the complete refinement schedule and return the final model with
/// its unary closures computed.
pub fn train(
    trees: &mut [Tree<StateSet>],
    n_states: usize,
    config: &TrainerConfig,
    objective: &dyn MergeObjective,
) -> Result<TrainingResult, TreeError> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let (mut grammar, mut lexicon) = init_model(trees, n_states, config, &mut rng);
    let mut trajectory = Vec::new();

    for cycle in 0..config.cycles {
        info!(cycle, substates = ?grammar.num_substates(), "starting refinement cycle");

        // Split.
        grammar = grammar.split_all_states(config.split_randomness, &mut rng);
        lexicon = lexicon.split_states(config.split_randomness, &mut rng);
        for tree in trees.iter_mut() {
            resize_substates(tree, grammar.num_substates());
        }
        run_em(
            &mut grammar,
            &mut lexicon,
            trees,
            config.em_iterations,
            &NoSmoothing,
            config,
            &mut rng,
            &mut trajectory,
            "split",
        )?;

        // Merge: one scoring pass retains the posterior vectors the
        // evaluator reads.
        trees.par_iter_mut().try_for_each(|tree| {
            alloc_tree_scores(tree);
            ArrayParser::new(&grammar, &lexicon).compute_inside_outside(tree, false, None)
        })?;
        let cond = substate_conditional_probs(trees, &grammar);
        let deltas = compute_merge_likelihood_deltas(&grammar, &cond, trees);
        let pairs = select_merge_pairs(&deltas, config.merge_fraction, objective, &grammar);
        let (merged, maps) = grammar.merge_states(&pairs, &cond);
        grammar = merged;
        lexicon = lexicon.merge_states(&maps);
        for tree in trees.iter_mut() {
            resize_substates(tree, grammar.num_substates());
        }
        run_em(
            &mut grammar,
            &mut lexicon,
            trees,
            config.merge_em_iterations,
            &NoSmoothing,
            config,
            &mut rng,
            &mut trajectory,
            "merge",
        )?;

        // Smooth.
        lexicon.tie_rare_word_stats();
        let smoother = SubstateInterpolation {
            alpha: config.smoothing_alpha,
        };
        run_em(
            &mut grammar,
            &mut lexicon,
            trees,
            config.smooth_em_iterations,
            &smoother,
            config,
            &mut rng,
            &mut trajectory,
            "smooth",
        )?;
    }

    grammar.compute_pairs_of_unaries();
    Ok(TrainingResult {
        grammar,
        lexicon,
        likelihood_trajectory: trajectory,
    })
}

#[allow(clippy::too_many_arguments)]
fn run_em(
    grammar: &mut Grammar,
    lexicon: &mut Lexicon,
    trees: &mut [Tree<StateSet>],
    iterations: usize,
    smoother: &dyn Smoother,
    config: &TrainerConfig,
    rng: &mut StdRng,
    trajectory: &mut Vec<f64>,
    phase: &str,
) -> Result<(), TreeError> {
    let mut previous: Option<f64> = None;
    for iteration in 0..iterations {
        let (g, l, stats) =
            em_iteration(grammar, lexicon, trees, smoother, config.rule_floor, rng)?;
        *grammar = g;
        *lexicon = l;
        info!(
            phase,
            iteration,
            log_likelihood = stats.log_likelihood,
            skipped = stats.trees_skipped,
            "EM iteration"
        );
        if let Some(prev) = previous {
            if stats.log_likelihood < prev - config.em_tolerance {
                warn!(
                    phase,
                    iteration,
                    drop = prev - stats.log_likelihood,
                    "log-likelihood decreased"
                );
            }
        }
        previous = Some(stats.log_likelihood);
        trajectory.push(stats.log_likelihood);
    }
    Ok(())
}
