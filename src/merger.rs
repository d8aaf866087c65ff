//! Merge evaluation: estimating which substate pairs can be collapsed at
//! the least cost in corpus likelihood.
//!
//! After a split round, each state's substates come in even/odd sibling
//! pairs. Collapsing a pair is scored node-locally from the inside/outside
//! vectors already computed for the E-step: at every tree node the pair's
//! posterior mass is replaced by the mass it would carry after merging, and
//! the log ratio accumulates into that pair's likelihood loss. No re-parse
//! is needed.

use crate::grammar::Grammar;
use crate::scaling::scale_factor;
use crate::symbol::StateId;
use crate::tree::{StateSet, Tree};
use ordered_float::OrderedFloat;
use tracing::{debug, info};

/// Ranking contract for merge candidates. `cost` orders candidates; the
/// lowest-cost fraction is merged. Swapping the objective never changes the
/// merge mechanics, only which pairs are chosen.
pub trait MergeObjective {
    fn cost(&self, state: StateId, pair: usize, likelihood_loss: f64, grammar: &Grammar) -> f64;
}

/// Rank purely by estimated corpus log-likelihood loss.
pub struct LikelihoodLoss;

impl MergeObjective for LikelihoodLoss {
    fn cost(&self, _state: StateId, _pair: usize, likelihood_loss: f64, _grammar: &Grammar) -> f64 {
        likelihood_loss
    }
}

/// Rank by how many active rule tensor slots the merge would retire,
/// ignoring likelihood. More slots touched means a cheaper merge.
pub struct RuleCountSavings;

impl MergeObjective for RuleCountSavings {
    fn cost(&self, state: StateId, _pair: usize, _likelihood_loss: f64, grammar: &Grammar) -> f64 {
        -(state_slot_load(grammar, state))
    }
}

/// Linear combination of likelihood loss with the slot-count proxy.
pub struct Combined {
    pub likelihood_weight: f64,
    pub rule_count_weight: f64,
}

impl MergeObjective for Combined {
    fn cost(&self, state: StateId, _pair: usize, likelihood_loss: f64, grammar: &Grammar) -> f64 {
        self.likelihood_weight * likelihood_loss
            - self.rule_count_weight * state_slot_load(grammar, state)
    }
}

/// Active tensor slots per substate for every rule mentioning the state.
/// A rule mentioning the state in several positions counts once.
fn state_slot_load(grammar: &Grammar, state: StateId) -> f64 {
    let mut slots = 0usize;
    for rule in grammar.binary_rules_by_parent(state) {
        slots += rule.active_slots();
    }
    for rule in grammar.binary_rules_by_left(state) {
        if rule.parent != state {
            slots += rule.active_slots();
        }
    }
    for rule in grammar.binary_rules_by_right(state) {
        if rule.parent != state && rule.left != state {
            slots += rule.active_slots();
        }
    }
    for rule in grammar.unary_rules_by_parent(state) {
        slots += rule.active_slots();
    }
    for rule in grammar.unary_rules_by_child(state) {
        if rule.parent != state {
            slots += rule.active_slots();
        }
    }
    let n = grammar.num_substates()[state.as_usize()].max(1) as f64;
    slots as f64 / n
}

/// Expected substate occupancy per state, normalized to a distribution,
/// from the posterior node masses of already-parsed trees. Trees with a
/// non-positive root inside score contribute nothing.
pub fn substate_conditional_probs(trees: &[Tree<StateSet>], grammar: &Grammar) -> Vec<Vec<f64>> {
    let mut probs: Vec<Vec<f64>> = grammar
        .num_substates()
        .iter()
        .map(|&c| vec![0.0; c as usize])
        .collect();

    for tree in trees {
        let (tree_prob, tree_scale) = match root_inside(tree) {
            Some(p) => p,
            None => continue,
        };
        tree.postorder(&mut |t| {
            if t.is_leaf() {
                return;
            }
            // Each node carries its own inside/outside exponents, so the
            // posterior mass must be brought back to the tree's scale before
            // nodes are summed against each other.
            let sf = scale_factor(t.label.inside_scale + t.label.outside_scale - tree_scale);
            let acc = &mut probs[t.label.state.as_usize()];
            for (sub, (&i, &o)) in t.label.inside().iter().zip(t.label.outside()).enumerate() {
                let mass = i * o / tree_prob * sf;
                if mass.is_finite() && mass > 0.0 {
                    acc[sub] += mass;
                }
            }
        });
    }

    for dist in probs.iter_mut() {
        let total: f64 = dist.iter().sum();
        if total > 0.0 {
            for p in dist.iter_mut() {
                *p /= total;
            }
        } else {
            // A state never observed keeps a uniform distribution so its
            // merge weights stay well-defined.
            let n = dist.len().max(1) as f64;
            for p in dist.iter_mut() {
                *p = 1.0 / n;
            }
        }
    }
    probs
}

/// Estimated corpus log-likelihood loss for merging each even/odd substate
/// pair, indexed `[state][pair]`. Positive means the merge hurts.
pub fn compute_merge_likelihood_deltas(
    grammar: &Grammar,
    cond_probs: &[Vec<f64>],
    trees: &[Tree<StateSet>],
) -> Vec<Vec<f64>> {
    let mut deltas: Vec<Vec<f64>> = grammar
        .num_substates()
        .iter()
        .map(|&c| vec![0.0; c as usize / 2])
        .collect();

    for tree in trees {
        if root_inside(tree).is_none() {
            continue;
        }
        tree.postorder(&mut |t| {
            if t.is_leaf() {
                return;
            }
            let si = t.label.state.as_usize();
            let n_pairs = deltas[si].len();
            if n_pairs == 0 {
                return;
            }
            let inside = t.label.inside();
            let outside = t.label.outside();
            let node_total: f64 = inside.iter().zip(outside).map(|(i, o)| i * o).sum();
            if !node_total.is_finite() || node_total <= 0.0 {
                return;
            }
            for pair in 0..n_pairs {
                let (a, b) = (2 * pair, 2 * pair + 1);
                let (w1, w2) = pair_weights(cond_probs[si][a], cond_probs[si][b]);
                let merged_in = w1 * inside[a] + w2 * inside[b];
                let merged_out = outside[a] + outside[b];
                let separate = inside[a] * outside[a] + inside[b] * outside[b];
                let combined = node_total - separate + merged_in * merged_out;
                if combined > 0.0 {
                    deltas[si][pair] += (node_total / combined).ln();
                }
            }
        });
    }
    deltas
}

/// Within-pair shares of the merged substate's mass. A degenerate pair
/// (zero or non-finite sum) splits evenly rather than raising.
fn pair_weights(p1: f64, p2: f64) -> (f64, f64) {
    let sum = p1 + p2;
    if sum > 0.0 && sum.is_finite() {
        (p1 / sum, p2 / sum)
    } else {
        (0.5, 0.5)
    }
}

/// Choose which pairs to merge: rank every candidate by the objective and
/// keep the cheapest `merge_fraction` of them. Returns per-state pair
/// flags shaped for [`Grammar::merge_states`].
pub fn select_merge_pairs(
    deltas: &[Vec<f64>],
    merge_fraction: f64,
    objective: &dyn MergeObjective,
    grammar: &Grammar,
) -> Vec<Vec<bool>> {
    let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
    for (si, pairs) in deltas.iter().enumerate() {
        for (pair, &loss) in pairs.iter().enumerate() {
            let cost = objective.cost(StateId::from_usize(si), pair, loss, grammar);
            candidates.push((cost, si, pair));
        }
    }

    let mut flags: Vec<Vec<bool>> = deltas.iter().map(|p| vec![false; p.len()]).collect();
    if candidates.is_empty() {
        return flags;
    }

    let mut costs: Vec<OrderedFloat<f64>> =
        candidates.iter().map(|&(c, _, _)| OrderedFloat(c)).collect();
    costs.sort();
    let keep = ((candidates.len() as f64) * merge_fraction).floor() as usize;
    if keep == 0 {
        info!(candidates = candidates.len(), merged = 0, "no pairs merged");
        return flags;
    }
    let threshold = costs[keep.min(costs.len()) - 1];

    let mut merged = 0usize;
    for &(cost, si, pair) in &candidates {
        if OrderedFloat(cost) <= threshold && merged < keep {
            flags[si][pair] = true;
            merged += 1;
            debug!(state = si, pair, cost, "merging substate pair");
        }
    }
    info!(
        candidates = candidates.len(),
        merged,
        threshold = threshold.0,
        "selected merge pairs"
    );
    flags
}

fn root_inside(tree: &Tree<StateSet>) -> Option<(f64, i32)> {
    let p = tree.label.inside().first().copied()?;
    if p.is_finite() && p > 0.0 {
        Some((p, tree.label.inside_scale))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inout::ArrayParser;
    use crate::lexicon::Lexicon;
    use crate::rules::{BinaryRule, UnaryRule};
    use crate::symbol::TagSet;
    use crate::tree::{alloc_tree_scores, annotate, resize_substates};

    /// A one-node corpus: a root over a single split state whose inside and
    /// outside vectors are given directly.
    fn scored_tree(inside: Vec<f64>, outside: Vec<f64>) -> Tree<StateSet> {
        let n = inside.len() as u16;
        let total: f64 = inside.iter().zip(&outside).map(|(i, o)| i * o).sum();

        let mut node = StateSet::new(StateId::from_usize(1), n, 0, 1);
        node.alloc_scores();
        node.set_inside(inside, 0);
        node.set_outside(outside, 0);

        let mut root = StateSet::new(StateId::ROOT, 1, 0, 1);
        root.alloc_scores();
        root.set_inside(vec![total], 0);
        root.set_outside(vec![1.0], 0);

        let leaf = Tree::leaf(StateSet::leaf(StateId::from_usize(1), "w", 0));
        Tree::node(root, vec![Tree::node(node, vec![leaf])])
    }

    fn split_grammar() -> Grammar {
        Grammar::new(vec![1, 2])
    }

    #[test]
    fn test_conditional_probs_normalize() {
        let g = split_grammar();
        let trees = vec![scored_tree(vec![0.4, 0.1], vec![0.5, 0.1])];
        let probs = substate_conditional_probs(&trees, &g);
        let sum: f64 = probs[1].iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(probs[1][0] > probs[1][1]);
    }

    #[test]
    fn test_identical_substates_merge_for_free() {
        // Daughters that stayed exact clones after a zero-randomness split
        // carry no information; the merge loss must vanish.
        let g = split_grammar();
        let trees = vec![scored_tree(vec![0.2, 0.2], vec![0.3, 0.3])];
        let probs = substate_conditional_probs(&trees, &g);
        let deltas = compute_merge_likelihood_deltas(&g, &probs, &trees);
        assert!(deltas[1][0].abs() < 1e-12);
    }

    #[test]
    fn test_divergent_substates_cost_more() {
        let g = split_grammar();
        let clones = vec![scored_tree(vec![0.2, 0.2], vec![0.3, 0.3])];
        let skewed = vec![scored_tree(vec![0.4, 0.01], vec![0.5, 0.9])];

        let d_clones = compute_merge_likelihood_deltas(
            &g,
            &substate_conditional_probs(&clones, &g),
            &clones,
        );
        let d_skewed = compute_merge_likelihood_deltas(
            &g,
            &substate_conditional_probs(&skewed, &g),
            &skewed,
        );
        assert!(d_skewed[1][0].abs() > d_clones[1][0].abs());
    }

    #[test]
    fn test_conditional_probs_survive_rescaling() {
        // A 60-token right-branching chain with a tiny chain probability
        // spreads the nodes' scale exponents across a rescaling boundary.
        // Occupancy must weight every node equally, so it has to match the
        // average of the node-local posterior shares, which never see a
        // scale exponent at all.
        let q = 1e-9;
        let n = 60usize;

        let mut tags = TagSet::new("ROOT");
        let x = tags.intern("X");
        let p = tags.intern("P");
        let mut g = Grammar::new(vec![1, 2, 1]);
        let mut root_rule = UnaryRule::empty(StateId::ROOT, x, 2);
        root_rule.slot_mut(0, 1)[0] = 1.0;
        root_rule.slot_mut(1, 1)[0] = 1.0;
        g.insert_unary(root_rule);
        let mut chain = BinaryRule::empty(x, p, x, 1, 2);
        {
            let slot = chain.slot_mut(0, 0, 2);
            slot[0] = q; // X_0 -> P X_0
            slot[1] = q / 3.0; // X_1 -> P X_0
        }
        {
            let slot = chain.slot_mut(0, 1, 2);
            slot[0] = q / 2.0; // X_0 -> P X_1
            slot[1] = q; // X_1 -> P X_1
        }
        g.insert_binary(chain);
        let mut stop = UnaryRule::empty(x, p, 1);
        {
            let slot = stop.slot_mut(0, 2);
            slot[0] = 0.7;
            slot[1] = 0.35;
        }
        g.insert_unary(stop);

        let mut lex = Lexicon::new(vec![1, 2, 1], 0.0, [0.1, 0.1]);
        let pre = Tree::node(
            StateSet::new(p, 1, 0, 1),
            vec![Tree::leaf(StateSet::leaf(p, "w", 0))],
        );
        lex.tally_uninitialized_tree(&pre);
        lex.register_unseen_stats();

        let preterm = |_: usize| Tree::node("P".to_string(), vec![Tree::leaf("w".to_string())]);
        let mut chain_tree = Tree::node("X".to_string(), vec![preterm(n - 1)]);
        for i in (0..n - 1).rev() {
            chain_tree = Tree::node("X".to_string(), vec![preterm(i), chain_tree]);
        }
        let string_tree = Tree::node("ROOT".to_string(), vec![chain_tree]);

        let mut tree = annotate(&string_tree, &mut tags).unwrap();
        resize_substates(&mut tree, &[1, 2, 1]);
        alloc_tree_scores(&mut tree);
        let parser = ArrayParser::new(&g, &lex);
        parser.compute_inside_outside(&mut tree, true, None).unwrap();

        let trees = vec![tree];
        let probs = substate_conditional_probs(&trees, &g);

        let tree = &trees[0];
        let tree_scale = tree.label.inside_scale;
        let mut off_boundary = 0usize;
        let mut expect = vec![0.0f64; 2];
        let mut x_nodes = 0usize;
        tree.postorder(&mut |t| {
            if t.is_leaf() || t.label.state != x {
                return;
            }
            if t.label.inside_scale + t.label.outside_scale != tree_scale {
                off_boundary += 1;
            }
            let node_total: f64 = t
                .label
                .inside()
                .iter()
                .zip(t.label.outside())
                .map(|(i, o)| i * o)
                .sum();
            for (sub, (&i, &o)) in t.label.inside().iter().zip(t.label.outside()).enumerate() {
                expect[sub] += i * o / node_total;
            }
            x_nodes += 1;
        });

        // The chain is long enough that some nodes sit a scale step away
        // from the root; those must still carry their full weight.
        assert!(off_boundary > 0);
        assert!((probs[1][0] + probs[1][1] - 1.0).abs() < 1e-12);
        for sub in 0..2 {
            let want = expect[sub] / x_nodes as f64;
            assert!(
                (probs[1][sub] - want).abs() < 1e-9,
                "sub {sub}: {} vs {want}",
                probs[1][sub]
            );
        }
        // The substates genuinely differ, so a mis-weighted node total
        // would have shifted the distribution.
        assert!((probs[1][0] - probs[1][1]).abs() > 1e-3);
    }

    #[test]
    fn test_unparsable_tree_is_ignored() {
        let g = split_grammar();
        let mut dead = scored_tree(vec![0.2, 0.2], vec![0.3, 0.3]);
        dead.label.set_inside(vec![0.0], 0);
        let probs = substate_conditional_probs(&[dead.clone()], &g);
        // Never-observed state falls back to uniform.
        assert!((probs[1][0] - 0.5).abs() < 1e-12);
        let deltas = compute_merge_likelihood_deltas(&g, &probs, &[dead]);
        assert_eq!(deltas[1][0], 0.0);
    }

    #[test]
    fn test_select_cheapest_fraction() {
        // Four candidate pairs across two states; fraction 0.5 keeps the
        // two cheapest.
        let g = Grammar::new(vec![1, 4, 4]);
        let deltas = vec![vec![], vec![0.1, 5.0], vec![0.2, 9.0]];
        let flags = select_merge_pairs(&deltas, 0.5, &LikelihoodLoss, &g);
        assert_eq!(flags[1], vec![true, false]);
        assert_eq!(flags[2], vec![true, false]);
    }

    #[test]
    fn test_rule_count_objective_prefers_loaded_states() {
        // State 1 appears in three rules, state 2 in one; with equal
        // likelihood losses the slot-count objective merges state 1 first.
        let mut g = Grammar::new(vec![1, 2, 2]);
        let one = StateId::from_usize(1);
        let two = StateId::from_usize(2);
        let mut b = BinaryRule::empty(one, one, two, 2, 2);
        b.slot_mut(0, 0, 2)[0] = 0.5;
        g.insert_binary(b);
        let mut u = UnaryRule::empty(one, two, 2);
        u.slot_mut(0, 2)[0] = 0.5;
        g.insert_unary(u);
        let mut v = UnaryRule::empty(StateId::ROOT, one, 2);
        v.slot_mut(0, 1)[0] = 1.0;
        g.insert_unary(v);

        assert!(state_slot_load(&g, one) > state_slot_load(&g, two));

        let deltas = vec![vec![], vec![0.1], vec![0.1]];
        let flags = select_merge_pairs(&deltas, 0.5, &RuleCountSavings, &g);
        assert!(flags[1][0]);
        assert!(!flags[2][0]);
    }

    #[test]
    fn test_zero_fraction_merges_nothing() {
        let g = Grammar::new(vec![1, 2]);
        let deltas = vec![vec![], vec![0.1]];
        let flags = select_merge_pairs(&deltas, 0.0, &LikelihoodLoss, &g);
        assert!(!flags[1][0]);
    }

    #[test]
    fn test_degenerate_pair_weights_split_evenly() {
        assert_eq!(pair_weights(0.0, 0.0), (0.5, 0.5));
        assert_eq!(pair_weights(f64::NAN, 1.0), (0.5, 0.5));
        let (w1, w2) = pair_weights(3.0, 1.0);
        assert!((w1 - 0.75).abs() < 1e-12 && (w2 - 0.25).abs() < 1e-12);
    }
}
