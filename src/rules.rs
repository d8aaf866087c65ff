//! Binary and unary rule records with substate score tensors.
//!
//! A rule's identity is the tuple of coarse state ids; the score tensor is
//! mutable payload and takes no part in equality or hashing. Tensor slots
//! are `Option<Vec<f64>>`: `None` means the substate combination is
//! structurally absent ("never occurs"), which is distinct from a present
//! slot holding numeric zeros. Split and merge must preserve that
//! distinction.

use crate::symbol::StateId;
use rand::Rng;
use std::hash::{Hash, Hasher};

/// Within-pair normalized parent weights plus the substate renumbering used
/// when collapsing merged substates. `map[old_sub]` is the surviving index;
/// `weight[old_sub]` is the share of the collapsed parent mass (1.0 for
/// substates that are not merged).
#[derive(Debug, Clone)]
pub struct MergeMap {
    pub map: Vec<usize>,
    pub weight: Vec<f64>,
    pub new_len: usize,
}

impl MergeMap {
    /// Identity mapping for a state that keeps all of its substates.
    pub fn identity(n: usize) -> Self {
        MergeMap {
            map: (0..n).collect(),
            weight: vec![1.0; n],
            new_len: n,
        }
    }

    /// Build a map from per-pair merge flags and raw substate weights.
    ///
    /// `merge_pair[n]` collapses substates `2n` and `2n+1`. A pair whose
    /// weight sum is zero or non-finite is clamped to uniform shares rather
    /// than raising.
    pub fn from_pairs(merge_pair: &[bool], raw_weight: &[f64]) -> Self {
        let n = raw_weight.len();
        let mut map = vec![0usize; n];
        let mut weight = vec![1.0f64; n];
        let mut next = 0usize;
        let mut i = 0usize;
        while i < n {
            let paired = i + 1 < n && merge_pair.get(i / 2).copied().unwrap_or(false);
            if paired {
                let mut sum = raw_weight[i] + raw_weight[i + 1];
                if sum == 0.0 || !sum.is_finite() {
                    sum = 1.0;
                }
                map[i] = next;
                map[i + 1] = next;
                weight[i] = raw_weight[i] / sum;
                weight[i + 1] = raw_weight[i + 1] / sum;
                next += 1;
                i += 2;
            } else {
                map[i] = next;
                next += 1;
                i += 1;
            }
        }
        MergeMap {
            map,
            weight,
            new_len: next,
        }
    }
}

/// A binary rule `parent -> left right` with a 3-D substate score tensor,
/// `scores[left_sub][right_sub]` -> dense vector over parent substates.
#[derive(Debug, Clone)]
pub struct BinaryRule {
    pub parent: StateId,
    pub left: StateId,
    pub right: StateId,
    pub scores: Vec<Vec<Option<Vec<f64>>>>,
}

impl BinaryRule {
    /// A rule whose slots are all structurally absent.
    pub fn empty(parent: StateId, left: StateId, right: StateId, n_left: usize, n_right: usize) -> Self {
        BinaryRule {
            parent,
            left,
            right,
            scores: vec![vec![None; n_right]; n_left],
        }
    }

    /// A rule whose slots are all present and zero-filled. This is the
    /// shape returned for lookups of rules the grammar does not contain.
    pub fn dense_zero(
        parent: StateId,
        left: StateId,
        right: StateId,
        n_left: usize,
        n_right: usize,
        n_parent: usize,
    ) -> Self {
        BinaryRule {
            parent,
            left,
            right,
            scores: vec![vec![Some(vec![0.0; n_parent]); n_right]; n_left],
        }
    }

    pub fn slot(&self, left_sub: usize, right_sub: usize) -> Option<&[f64]> {
        self.scores[left_sub][right_sub].as_deref()
    }

    /// Materialize a slot for accumulation, zero-filled on first touch.
    pub fn slot_mut(&mut self, left_sub: usize, right_sub: usize, n_parent: usize) -> &mut Vec<f64> {
        self.scores[left_sub][right_sub].get_or_insert_with(|| vec![0.0; n_parent])
    }

    /// Total mass per parent substate, summed over all child combinations.
    pub fn parent_mass(&self, n_parent: usize) -> Vec<f64> {
        let mut mass = vec![0.0; n_parent];
        for row in &self.scores {
            for slot in row.iter().flatten() {
                for (m, &s) in mass.iter_mut().zip(slot.iter()) {
                    *m += s;
                }
            }
        }
        mass
    }

    /// Number of present (non-absent) tensor slots.
    pub fn active_slots(&self) -> usize {
        self.scores
            .iter()
            .map(|row| row.iter().filter(|s| s.is_some()).count())
            .sum()
    }

    /// Double the substate dimensions of every split state.
    ///
    /// Child dimensions redistribute mass evenly over their cross product;
    /// the parent dimension copies it with a symmetric +/- perturbation so
    /// the daughters diverge under subsequent EM. Zero randomness yields
    /// exact shares. Absent slots stay absent except where the cross
    /// product of an existing slot expands.
    pub fn split<R: Rng>(
        &self,
        split_parent: bool,
        split_left: bool,
        split_right: bool,
        randomness: f64,
        rng: &mut R,
    ) -> BinaryRule {
        let n_left = self.scores.len();
        let n_right = if n_left > 0 { self.scores[0].len() } else { 0 };
        let new_left = if split_left { n_left * 2 } else { n_left };
        let new_right = if split_right { n_right * 2 } else { n_right };
        let child_factor = (if split_left { 2.0 } else { 1.0 }) * (if split_right { 2.0 } else { 1.0 });

        let mut out = BinaryRule::empty(self.parent, self.left, self.right, new_left, new_right);
        for (j, row) in self.scores.iter().enumerate() {
            for (k, slot) in row.iter().enumerate() {
                let Some(old) = slot else { continue };
                let new_slot = split_parent_vec(old, split_parent, child_factor, randomness, rng);
                for jj in expand(j, split_left) {
                    for kk in expand(k, split_right) {
                        out.scores[jj][kk] = Some(new_slot.clone());
                    }
                }
            }
        }
        out
    }

    /// Collapse substates according to the per-state merge maps. Child
    /// dimensions sum; the parent dimension combines by its weights.
    pub fn merge(&self, parent: &MergeMap, left: &MergeMap, right: &MergeMap) -> BinaryRule {
        let mut out = BinaryRule::empty(self.parent, self.left, self.right, left.new_len, right.new_len);
        for (j, row) in self.scores.iter().enumerate() {
            for (k, slot) in row.iter().enumerate() {
                let Some(old) = slot else { continue };
                let target = out.slot_mut(left.map[j], right.map[k], parent.new_len);
                for (i, &v) in old.iter().enumerate() {
                    target[parent.map[i]] += parent.weight[i] * v;
                }
            }
        }
        out
    }
}

impl PartialEq for BinaryRule {
    fn eq(&self, other: &Self) -> bool {
        self.parent == other.parent && self.left == other.left && self.right == other.right
    }
}

impl Eq for BinaryRule {}

impl Hash for BinaryRule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parent.hash(state);
        self.left.hash(state);
        self.right.hash(state);
    }
}

/// A unary rule `parent -> child` with a 2-D substate score tensor,
/// `scores[child_sub]` -> dense vector over parent substates. A rule with
/// `parent == child` is a self-loop used to seed the unary closure.
#[derive(Debug, Clone)]
pub struct UnaryRule {
    pub parent: StateId,
    pub child: StateId,
    pub scores: Vec<Option<Vec<f64>>>,
}

impl UnaryRule {
    pub fn empty(parent: StateId, child: StateId, n_child: usize) -> Self {
        UnaryRule {
            parent,
            child,
            scores: vec![None; n_child],
        }
    }

    pub fn dense_zero(parent: StateId, child: StateId, n_child: usize, n_parent: usize) -> Self {
        UnaryRule {
            parent,
            child,
            scores: vec![Some(vec![0.0; n_parent]); n_child],
        }
    }

    /// Identity self-loop: probability 1 on matching substates.
    pub fn identity(state: StateId, n_sub: usize) -> Self {
        let mut rule = UnaryRule::empty(state, state, n_sub);
        for j in 0..n_sub {
            let mut v = vec![0.0; n_sub];
            v[j] = 1.0;
            rule.scores[j] = Some(v);
        }
        rule
    }

    pub fn is_self_loop(&self) -> bool {
        self.parent == self.child
    }

    pub fn slot(&self, child_sub: usize) -> Option<&[f64]> {
        self.scores[child_sub].as_deref()
    }

    pub fn slot_mut(&mut self, child_sub: usize, n_parent: usize) -> &mut Vec<f64> {
        self.scores[child_sub].get_or_insert_with(|| vec![0.0; n_parent])
    }

    pub fn parent_mass(&self, n_parent: usize) -> Vec<f64> {
        let mut mass = vec![0.0; n_parent];
        for slot in self.scores.iter().flatten() {
            for (m, &s) in mass.iter_mut().zip(slot.iter()) {
                *m += s;
            }
        }
        mass
    }

    pub fn active_slots(&self) -> usize {
        self.scores.iter().filter(|s| s.is_some()).count()
    }

    /// Sum of all present scores; used to rank closure paths.
    pub fn total_mass(&self) -> f64 {
        self.scores
            .iter()
            .flatten()
            .map(|v| v.iter().sum::<f64>())
            .sum()
    }

    pub fn split<R: Rng>(
        &self,
        split_parent: bool,
        split_child: bool,
        randomness: f64,
        rng: &mut R,
    ) -> UnaryRule {
        let n_child = self.scores.len();
        let new_child = if split_child { n_child * 2 } else { n_child };
        let child_factor = if split_child { 2.0 } else { 1.0 };

        let mut out = UnaryRule::empty(self.parent, self.child, new_child);
        for (j, slot) in self.scores.iter().enumerate() {
            let Some(old) = slot else { continue };
            let new_slot = split_parent_vec(old, split_parent, child_factor, randomness, rng);
            for jj in expand(j, split_child) {
                out.scores[jj] = Some(new_slot.clone());
            }
        }
        out
    }

    pub fn merge(&self, parent: &MergeMap, child: &MergeMap) -> UnaryRule {
        let mut out = UnaryRule::empty(self.parent, self.child, child.new_len);
        for (j, slot) in self.scores.iter().enumerate() {
            let Some(old) = slot else { continue };
            let target = out.slot_mut(child.map[j], parent.new_len);
            for (i, &v) in old.iter().enumerate() {
                target[parent.map[i]] += parent.weight[i] * v;
            }
        }
        out
    }
}

impl PartialEq for UnaryRule {
    fn eq(&self, other: &Self) -> bool {
        self.parent == other.parent && self.child == other.child
    }
}

impl Eq for UnaryRule {}

impl Hash for UnaryRule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parent.hash(state);
        self.child.hash(state);
    }
}

fn expand(index: usize, split: bool) -> std::ops::Range<usize> {
    if split {
        (2 * index)..(2 * index + 2)
    } else {
        index..(index + 1)
    }
}

/// Split the parent dimension of one slot: each old value becomes two
/// perturbed copies (or one unperturbed copy when the parent is not split),
/// after dividing out the child redistribution factor.
fn split_parent_vec<R: Rng>(
    old: &[f64],
    split_parent: bool,
    child_factor: f64,
    randomness: f64,
    rng: &mut R,
) -> Vec<f64> {
    if !split_parent {
        return old.iter().map(|&v| v / child_factor).collect();
    }
    let mut out = Vec::with_capacity(old.len() * 2);
    for &v in old {
        let base = v / child_factor;
        let eps = (rng.gen::<f64>() - 0.5) * randomness / 100.0;
        out.push(base * (1.0 + eps));
        out.push(base * (1.0 - eps));
    }
    out
}
