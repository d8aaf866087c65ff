//! Inside-outside dynamic program over substate-annotated trees.
//!
//! Given a grammar, a lexicon, and a binarized training tree, computes the
//! per-node inside score vector bottom-up and the outside score vector
//! top-down, with explicit power-of-two rescaling (see [`crate::scaling`]).
//! Inside entries that are exactly zero never contribute and are skipped,
//! as are structurally absent rule slots.

use crate::grammar::Grammar;
use crate::lexicon::Lexicon;
use crate::scaling::{rescale, scaled_ln};
use crate::symbol::StateId;
use crate::tree::{StateSet, Tree, TreeError};

/// Externally supplied per-span multiplicative penalties, indexed by a
/// state-equivalence class. Spans without an entry are unpenalized.
#[derive(Debug, Clone)]
pub struct SpanScores {
    /// `scores[from][to]` -> per-class penalty factors.
    scores: Vec<Vec<Vec<f64>>>,
    class_of_state: Vec<usize>,
}

impl SpanScores {
    pub fn new(scores: Vec<Vec<Vec<f64>>>, class_of_state: Vec<usize>) -> Self {
        SpanScores {
            scores,
            class_of_state,
        }
    }

    fn penalty(&self, from: u16, to: u16, state: StateId) -> f64 {
        let class = self.class_of_state[state.as_usize()];
        self.scores
            .get(from as usize)
            .and_then(|row| row.get(to as usize))
            .and_then(|cell| cell.get(class))
            .copied()
            .unwrap_or(1.0)
    }
}

/// The inside-outside engine. Holds read-only references to the model; all
/// mutation happens in the tree's transient score vectors.
pub struct ArrayParser<'a> {
    grammar: &'a Grammar,
    lexicon: &'a Lexicon,
}

impl<'a> ArrayParser<'a> {
    pub fn new(grammar: &'a Grammar, lexicon: &'a Lexicon) -> Self {
        ArrayParser { grammar, lexicon }
    }

    /// Run both passes over a tree whose score vectors have been allocated.
    ///
    /// The top symbol must be unsplit; a split root is a usage error.
    pub fn compute_inside_outside(
        &self,
        tree: &mut Tree<StateSet>,
        no_smoothing: bool,
        spans: Option<&SpanScores>,
    ) -> Result<(), TreeError> {
        if tree.label.num_sub != 1 {
            return Err(TreeError::SplitRoot {
                num_sub: tree.label.num_sub,
            });
        }
        if tree.children.is_empty() {
            return Err(TreeError::EmptyTree);
        }
        self.inside(tree, no_smoothing, spans)?;
        set_root_outside_score(tree);
        self.outside(tree, false, spans);
        Ok(())
    }

    fn inside(
        &self,
        t: &mut Tree<StateSet>,
        no_smoothing: bool,
        spans: Option<&SpanScores>,
    ) -> Result<(), TreeError> {
        if t.is_leaf() {
            return Ok(());
        }
        if t.children.len() > 2 {
            return Err(TreeError::TooManyChildren {
                arity: t.children.len(),
            });
        }
        for child in &mut t.children {
            self.inside(child, no_smoothing, spans)?;
        }

        if t.is_preterminal() {
            let leaf = &t.children[0].label;
            let word = leaf.word.as_deref().unwrap_or_default();
            let scores = self
                .lexicon
                .score(word, t.label.state, leaf.from, no_smoothing, false);
            t.label.set_inside(scores, 0);
            return Ok(());
        }

        match t.children.len() {
            1 => {
                let child = &t.children[0].label;
                let np = t.label.num_sub as usize;
                let mut v = vec![0.0; np];
                if let Some(rule) = self.grammar.get_unary(t.label.state, child.state) {
                    for (j, &cin) in child.inside().iter().enumerate() {
                        if cin == 0.0 {
                            continue;
                        }
                        let Some(slot) = rule.slot(j) else { continue };
                        for (i, &s) in slot.iter().enumerate() {
                            v[i] += s * cin;
                        }
                    }
                }
                let scale = rescale(&mut v, child.inside_scale);
                t.label.set_inside(v, scale);
            }
            2 => {
                let left = &t.children[0].label;
                let right = &t.children[1].label;
                let np = t.label.num_sub as usize;
                let mut v = vec![0.0; np];
                if let Some(rule) = self.grammar.get_binary(t.label.state, left.state, right.state) {
                    for (j, &lin) in left.inside().iter().enumerate() {
                        if lin == 0.0 {
                            continue;
                        }
                        for (k, &rin) in right.inside().iter().enumerate() {
                            if rin == 0.0 {
                                continue;
                            }
                            let Some(slot) = rule.slot(j, k) else { continue };
                            let lr = lin * rin;
                            for (i, &s) in slot.iter().enumerate() {
                                v[i] += s * lr;
                            }
                        }
                    }
                }
                if let Some(spans) = spans {
                    let p = spans.penalty(t.label.from, t.label.to, t.label.state);
                    for x in v.iter_mut() {
                        *x *= p;
                    }
                }
                let scale = rescale(&mut v, left.inside_scale + right.inside_scale);
                t.label.set_inside(v, scale);
            }
            _ => unreachable!("arity checked above"),
        }
        Ok(())
    }

    fn outside(&self, t: &mut Tree<StateSet>, unary_above: bool, spans: Option<&SpanScores>) {
        if t.is_leaf() || t.is_preterminal() {
            return;
        }

        match t.children.len() {
            1 => {
                let parent = t.label.clone_scores_view();
                let child = &mut t.children[0];
                let nc = child.label.num_sub as usize;
                let mut v = vec![0.0; nc];
                if let Some(rule) = self.grammar.get_unary(t.label.state, child.label.state) {
                    for (j, x) in v.iter_mut().enumerate() {
                        let Some(slot) = rule.slot(j) else { continue };
                        for (i, &s) in slot.iter().enumerate() {
                            *x += parent.outside[i] * s;
                        }
                    }
                }
                let scale = rescale(&mut v, parent.outside_scale);
                child.label.set_outside(v, scale);
                self.outside(child, true, spans);
            }
            2 => {
                // Span penalties hit the outside vector in place before it
                // is pushed down, unless a unary rule sits directly above
                // (the penalty was already applied on that node's span).
                if !unary_above {
                    if let Some(spans) = spans {
                        let p = spans.penalty(t.label.from, t.label.to, t.label.state);
                        for x in t.label.outside_mut().iter_mut() {
                            *x *= p;
                        }
                    }
                }

                let parent = t.label.clone_scores_view();
                let (left_half, right_half) = t.children.split_at_mut(1);
                let left = &mut left_half[0];
                let right = &mut right_half[0];
                let nl = left.label.num_sub as usize;
                let nr = right.label.num_sub as usize;
                let mut left_v = vec![0.0; nl];
                let mut right_v = vec![0.0; nr];
                if let Some(rule) =
                    self.grammar
                        .get_binary(t.label.state, left.label.state, right.label.state)
                {
                    // Both children accumulate in one pass over (j, k, i).
                    for (j, &lin) in left.label.inside().iter().enumerate() {
                        for (k, &rin) in right.label.inside().iter().enumerate() {
                            let Some(slot) = rule.slot(j, k) else { continue };
                            for (i, &s) in slot.iter().enumerate() {
                                let po = parent.outside[i] * s;
                                left_v[j] += po * rin;
                                right_v[k] += po * lin;
                            }
                        }
                    }
                }
                let ls = rescale(&mut left_v, parent.outside_scale + right.label.inside_scale);
                left.label.set_outside(left_v, ls);
                let rs = rescale(&mut right_v, parent.outside_scale + left.label.inside_scale);
                right.label.set_outside(right_v, rs);
                self.outside(left, false, spans);
                self.outside(right, false, spans);
            }
            _ => {}
        }
    }
}

/// Initialize the root's outside vector: probability 1 at substate 0.
pub fn set_root_outside_score(tree: &mut Tree<StateSet>) {
    let n = tree.label.num_sub as usize;
    let mut v = vec![0.0; n];
    if n > 0 {
        v[0] = 1.0;
    }
    tree.label.set_outside(v, 0);
}

/// Log-likelihood of a parsed tree from its root inside score and scale.
/// An unparsable tree (all-zero root inside) yields `-inf`; callers skip
/// such trees rather than failing the EM pass.
pub fn tree_log_likelihood(tree: &Tree<StateSet>) -> f64 {
    let root = &tree.label;
    if root.inside().is_empty() {
        return f64::NEG_INFINITY;
    }
    scaled_ln(root.inside()[0], root.inside_scale)
}

/// Snapshot of a node's outside vector and scale, taken before mutating
/// its children in the same traversal step.
struct ScoresView {
    outside: Vec<f64>,
    outside_scale: i32,
}

impl StateSet {
    fn clone_scores_view(&self) -> ScoresView {
        ScoresView {
            outside: self.outside().to_vec(),
            outside_scale: self.outside_scale,
        }
    }
}
