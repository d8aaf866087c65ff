//! The substate-annotated grammar: rule ownership, indexing, EM count
//! tallying, normalization, smoothing, substate split/merge, and unary
//! closure.
//!
//! Split and merge are functional (they return a new `Grammar`); smoothing
//! and normalization mutate in place. During a parallel E-step the grammar
//! is read-only; tallying goes into separate accumulator grammars built via
//! [`Grammar::counts_like`] and combined with [`Grammar::merge_counts`].

use crate::rules::{BinaryRule, MergeMap, UnaryRule};
use crate::scaling::scale_factor;
use crate::symbol::StateId;
use crate::tree::{StateSet, Tree};
use ordered_float::OrderedFloat;
use rand::Rng;
use rustc_hash::FxHashMap;

pub type BinaryKey = (StateId, StateId, StateId);
pub type UnaryKey = (StateId, StateId);

/// Sentinel in the best-intermediate table: the best unary path is the
/// direct rule, with no intermediate state.
pub const DIRECT_RULE: i32 = -1;

/// Post-normalization smoothing over a rule slot's parent-substate vector.
pub trait Smoother: Send + Sync {
    fn smooth_slot(&self, slot: &mut [f64]);
}

/// Leaves scores untouched.
pub struct NoSmoothing;

impl Smoother for NoSmoothing {
    fn smooth_slot(&self, _slot: &mut [f64]) {}
}

/// Interpolates each parent substate's score toward the mean across its
/// siblings: `(1 - alpha) * s[i] + alpha * mean(s)`. Preserves per-parent
/// normalization because the redistribution is symmetric.
pub struct SubstateInterpolation {
    pub alpha: f64,
}

impl Smoother for SubstateInterpolation {
    fn smooth_slot(&self, slot: &mut [f64]) {
        if slot.len() < 2 {
            return;
        }
        let mean = slot.iter().sum::<f64>() / slot.len() as f64;
        for s in slot.iter_mut() {
            *s = (1.0 - self.alpha) * *s + self.alpha * mean;
        }
    }
}

#[derive(Clone)]
pub struct Grammar {
    num_substates: Vec<u16>,
    binary: FxHashMap<BinaryKey, BinaryRule>,
    unary: FxHashMap<UnaryKey, UnaryRule>,
    binary_by_parent: Vec<Vec<BinaryKey>>,
    binary_by_left: Vec<Vec<BinaryKey>>,
    binary_by_right: Vec<Vec<BinaryKey>>,
    unary_by_parent: Vec<Vec<UnaryKey>>,
    unary_by_child: Vec<Vec<UnaryKey>>,
    closed_sum: FxHashMap<UnaryKey, UnaryRule>,
    closed_viterbi: FxHashMap<UnaryKey, UnaryRule>,
    best_intermediate: FxHashMap<UnaryKey, i32>,
}

impl Grammar {
    pub fn new(num_substates: Vec<u16>) -> Self {
        let n = num_substates.len();
        Grammar {
            num_substates,
            binary: FxHashMap::default(),
            unary: FxHashMap::default(),
            binary_by_parent: vec![Vec::new(); n],
            binary_by_left: vec![Vec::new(); n],
            binary_by_right: vec![Vec::new(); n],
            unary_by_parent: vec![Vec::new(); n],
            unary_by_child: vec![Vec::new(); n],
            closed_sum: FxHashMap::default(),
            closed_viterbi: FxHashMap::default(),
            best_intermediate: FxHashMap::default(),
        }
    }

    pub fn num_substates(&self) -> &[u16] {
        &self.num_substates
    }

    pub fn n_states(&self) -> usize {
        self.num_substates.len()
    }

    fn n_sub(&self, state: StateId) -> usize {
        self.num_substates[state.as_usize()] as usize
    }

    /// An empty grammar with the same substate shape, used as an E-step
    /// count accumulator.
    pub fn counts_like(&self) -> Grammar {
        Grammar::new(self.num_substates.clone())
    }

    // ------------------------------------------------------------------
    // Rule access and indexing
    // ------------------------------------------------------------------

    fn binary_entry(&mut self, parent: StateId, left: StateId, right: StateId) -> &mut BinaryRule {
        let key = (parent, left, right);
        if !self.binary.contains_key(&key) {
            let rule = BinaryRule::empty(parent, left, right, self.n_sub(left), self.n_sub(right));
            self.insert_binary(rule);
        }
        self.binary.get_mut(&key).unwrap()
    }

    fn unary_entry(&mut self, parent: StateId, child: StateId) -> &mut UnaryRule {
        let key = (parent, child);
        if !self.unary.contains_key(&key) {
            let rule = UnaryRule::empty(parent, child, self.n_sub(child));
            self.insert_unary(rule);
        }
        self.unary.get_mut(&key).unwrap()
    }

    pub fn insert_binary(&mut self, rule: BinaryRule) {
        let key = (rule.parent, rule.left, rule.right);
        if self.binary.insert(key, rule).is_none() {
            self.binary_by_parent[key.0.as_usize()].push(key);
            self.binary_by_left[key.1.as_usize()].push(key);
            self.binary_by_right[key.2.as_usize()].push(key);
        }
    }

    pub fn insert_unary(&mut self, rule: UnaryRule) {
        let key = (rule.parent, rule.child);
        if self.unary.insert(key, rule).is_none() {
            self.unary_by_parent[key.0.as_usize()].push(key);
            self.unary_by_child[key.1.as_usize()].push(key);
        }
    }

    pub fn get_binary(&self, parent: StateId, left: StateId, right: StateId) -> Option<&BinaryRule> {
        self.binary.get(&(parent, left, right))
    }

    pub fn get_unary(&self, parent: StateId, child: StateId) -> Option<&UnaryRule> {
        self.unary.get(&(parent, child))
    }

    /// Lookup that never fails: absent rules come back as a zero-filled
    /// tensor of the correct shape, so callers do not branch on absence.
    pub fn binary_rule(&self, parent: StateId, left: StateId, right: StateId) -> BinaryRule {
        self.get_binary(parent, left, right).cloned().unwrap_or_else(|| {
            BinaryRule::dense_zero(
                parent,
                left,
                right,
                self.n_sub(left),
                self.n_sub(right),
                self.n_sub(parent),
            )
        })
    }

    /// See [`Grammar::binary_rule`].
    pub fn unary_rule(&self, parent: StateId, child: StateId) -> UnaryRule {
        self.get_unary(parent, child).cloned().unwrap_or_else(|| {
            UnaryRule::dense_zero(parent, child, self.n_sub(child), self.n_sub(parent))
        })
    }

    pub fn binary_rules(&self) -> impl Iterator<Item = &BinaryRule> {
        self.binary.values()
    }

    pub fn unary_rules(&self) -> impl Iterator<Item = &UnaryRule> {
        self.unary.values()
    }

    pub fn binary_rules_by_parent(&self, parent: StateId) -> impl Iterator<Item = &BinaryRule> {
        self.binary_by_parent[parent.as_usize()]
            .iter()
            .map(move |k| &self.binary[k])
    }

    pub fn binary_rules_by_left(&self, left: StateId) -> impl Iterator<Item = &BinaryRule> {
        self.binary_by_left[left.as_usize()]
            .iter()
            .map(move |k| &self.binary[k])
    }

    pub fn binary_rules_by_right(&self, right: StateId) -> impl Iterator<Item = &BinaryRule> {
        self.binary_by_right[right.as_usize()]
            .iter()
            .map(move |k| &self.binary[k])
    }

    pub fn unary_rules_by_parent(&self, parent: StateId) -> impl Iterator<Item = &UnaryRule> {
        self.unary_by_parent[parent.as_usize()]
            .iter()
            .map(move |k| &self.unary[k])
    }

    pub fn unary_rules_by_child(&self, child: StateId) -> impl Iterator<Item = &UnaryRule> {
        self.unary_by_child[child.as_usize()]
            .iter()
            .map(move |k| &self.unary[k])
    }

    // ------------------------------------------------------------------
    // Tallying (E-step)
    // ------------------------------------------------------------------

    /// First-pass tally over a raw tree: every observed rule gets count 1
    /// at substate (0, 0, 0). Preterminal emissions belong to the lexicon.
    pub fn tally_uninitialized_tree(&mut self, tree: &Tree<StateSet>) {
        if tree.is_leaf() || tree.is_preterminal() {
            return;
        }
        let p = tree.label.state;
        match tree.children.len() {
            1 => {
                let c = tree.children[0].label.state;
                self.unary_entry(p, c).slot_mut(0, 1)[0] += 1.0;
            }
            2 => {
                let l = tree.children[0].label.state;
                let r = tree.children[1].label.state;
                self.binary_entry(p, l, r).slot_mut(0, 0, 1)[0] += 1.0;
            }
            _ => {}
        }
        for child in &tree.children {
            self.tally_uninitialized_tree(child);
        }
    }

    /// E-step tally: accumulate expected rule counts weighted by
    /// outside(parent) x inside(children) / tree probability, with the
    /// tree-relative scale correction. `old` supplies the rule scores the
    /// expectations are taken under.
    pub fn tally_tree(&mut self, tree: &Tree<StateSet>, old: &Grammar, tree_prob: f64, tree_scale: i32) {
        if tree.is_leaf() || tree.is_preterminal() {
            return;
        }
        let p = &tree.label;
        match tree.children.len() {
            1 => {
                let c = &tree.children[0].label;
                if let Some(rule) = old.get_unary(p.state, c.state) {
                    let sf = scale_factor(c.inside_scale + p.outside_scale - tree_scale);
                    let np = p.num_sub as usize;
                    let target = self.unary_entry(p.state, c.state);
                    for (j, &cin) in c.inside().iter().enumerate() {
                        if cin == 0.0 {
                            continue;
                        }
                        let Some(slot) = rule.slot(j) else { continue };
                        let acc = target.slot_mut(j, np);
                        for (i, &s) in slot.iter().enumerate() {
                            let w = s * cin * p.outside()[i] / tree_prob * sf;
                            if w.is_finite() && w > 0.0 {
                                acc[i] += w;
                            }
                        }
                    }
                }
            }
            2 => {
                let l = &tree.children[0].label;
                let r = &tree.children[1].label;
                if let Some(rule) = old.get_binary(p.state, l.state, r.state) {
                    let sf =
                        scale_factor(l.inside_scale + r.inside_scale + p.outside_scale - tree_scale);
                    let np = p.num_sub as usize;
                    let target = self.binary_entry(p.state, l.state, r.state);
                    for (j, &lin) in l.inside().iter().enumerate() {
                        if lin == 0.0 {
                            continue;
                        }
                        for (k, &rin) in r.inside().iter().enumerate() {
                            if rin == 0.0 {
                                continue;
                            }
                            let Some(slot) = rule.slot(j, k) else { continue };
                            let acc = target.slot_mut(j, k, np);
                            for (i, &s) in slot.iter().enumerate() {
                                let w = s * lin * rin * p.outside()[i] / tree_prob * sf;
                                if w.is_finite() && w > 0.0 {
                                    acc[i] += w;
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        for child in &tree.children {
            self.tally_tree(child, old, tree_prob, tree_scale);
        }
    }

    /// Combine another accumulator's counts into this one (parallel-reduce
    /// step). Absent slots in the source stay absent in the target.
    pub fn merge_counts(&mut self, other: &Grammar) {
        for rule in other.binary.values() {
            let np = self.n_sub(rule.parent);
            let target = self.binary_entry(rule.parent, rule.left, rule.right);
            for (j, row) in rule.scores.iter().enumerate() {
                for (k, slot) in row.iter().enumerate() {
                    let Some(src) = slot else { continue };
                    let dst = target.slot_mut(j, k, np);
                    for (d, &s) in dst.iter_mut().zip(src.iter()) {
                        *d += s;
                    }
                }
            }
        }
        for rule in other.unary.values() {
            let np = self.n_sub(rule.parent);
            let target = self.unary_entry(rule.parent, rule.child);
            for (j, slot) in rule.scores.iter().enumerate() {
                let Some(src) = slot else { continue };
                let dst = target.slot_mut(j, np);
                for (d, &s) in dst.iter_mut().zip(src.iter()) {
                    *d += s;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Normalization and smoothing (M-step)
    // ------------------------------------------------------------------

    /// Total outgoing mass per (state, parent substate) over all rules.
    pub fn parent_totals(&self) -> Vec<Vec<f64>> {
        let mut totals: Vec<Vec<f64>> = self
            .num_substates
            .iter()
            .map(|&c| vec![0.0; c as usize])
            .collect();
        for rule in self.binary.values() {
            let np = self.n_sub(rule.parent);
            let mass = rule.parent_mass(np);
            for (t, m) in totals[rule.parent.as_usize()].iter_mut().zip(mass) {
                *t += m;
            }
        }
        for rule in self.unary.values() {
            let np = self.n_sub(rule.parent);
            let mass = rule.parent_mass(np);
            for (t, m) in totals[rule.parent.as_usize()].iter_mut().zip(mass) {
                *t += m;
            }
        }
        totals
    }

    /// M-step: optional symmetry-breaking jitter on raw counts, then
    /// per-(state, parent substate) normalization with `floor` pruning,
    /// then smoothing. After this every parent substate's outgoing mass
    /// sums to 1 (or 0 if it never occurred).
    pub fn optimize<R: Rng>(&mut self, randomness: f64, rng: &mut R, smoother: &dyn Smoother, floor: f64) {
        if randomness > 0.0 {
            self.for_each_slot(|slot| {
                for s in slot.iter_mut() {
                    *s += randomness / 100.0 * rng.gen::<f64>();
                }
            });
        }

        let totals = self.parent_totals();
        for rule in self.binary.values_mut() {
            let t = &totals[rule.parent.as_usize()];
            for row in rule.scores.iter_mut() {
                for slot in row.iter_mut().flatten() {
                    normalize_slot(slot, t, floor);
                }
            }
        }
        for rule in self.unary.values_mut() {
            let t = &totals[rule.parent.as_usize()];
            for slot in rule.scores.iter_mut().flatten() {
                normalize_slot(slot, t, floor);
            }
        }

        self.for_each_slot(|slot| smoother.smooth_slot(slot));
    }

    fn for_each_slot(&mut self, mut f: impl FnMut(&mut Vec<f64>)) {
        for rule in self.binary.values_mut() {
            for row in rule.scores.iter_mut() {
                for slot in row.iter_mut().flatten() {
                    f(slot);
                }
            }
        }
        for rule in self.unary.values_mut() {
            for slot in rule.scores.iter_mut().flatten() {
                f(slot);
            }
        }
    }

    // ------------------------------------------------------------------
    // Split and merge
    // ------------------------------------------------------------------

    /// Double every state's substate count except ROOT, redistributing each
    /// rule's mass over the split cross product with a symmetric random
    /// perturbation. Returns a new grammar; closures are not carried over
    /// and must be recomputed.
    pub fn split_all_states<R: Rng>(&self, randomness: f64, rng: &mut R) -> Grammar {
        let split: Vec<bool> = (0..self.n_states())
            .map(|i| StateId::from_usize(i) != StateId::ROOT)
            .collect();
        let new_counts: Vec<u16> = self
            .num_substates
            .iter()
            .zip(&split)
            .map(|(&c, &s)| if s { c * 2 } else { c })
            .collect();

        let mut out = Grammar::new(new_counts);
        for rule in self.binary.values() {
            out.insert_binary(rule.split(
                split[rule.parent.as_usize()],
                split[rule.left.as_usize()],
                split[rule.right.as_usize()],
                randomness,
                rng,
            ));
        }
        for rule in self.unary.values() {
            out.insert_unary(rule.split(
                split[rule.parent.as_usize()],
                split[rule.child.as_usize()],
                randomness,
                rng,
            ));
        }
        out
    }

    /// Collapse the designated sibling substate pairs, combining parent
    /// mass by `substate_weights` and renumbering the survivors
    /// contiguously. Returns the merged grammar and the per-state maps so
    /// the lexicon and training trees can follow the same renumbering.
    pub fn merge_states(
        &self,
        pairs_to_merge: &[Vec<bool>],
        substate_weights: &[Vec<f64>],
    ) -> (Grammar, Vec<MergeMap>) {
        let maps: Vec<MergeMap> = (0..self.n_states())
            .map(|i| MergeMap::from_pairs(&pairs_to_merge[i], &substate_weights[i]))
            .collect();
        let new_counts: Vec<u16> = maps.iter().map(|m| m.new_len as u16).collect();

        let mut out = Grammar::new(new_counts);
        for rule in self.binary.values() {
            out.insert_binary(rule.merge(
                &maps[rule.parent.as_usize()],
                &maps[rule.left.as_usize()],
                &maps[rule.right.as_usize()],
            ));
        }
        for rule in self.unary.values() {
            out.insert_unary(rule.merge(&maps[rule.parent.as_usize()], &maps[rule.child.as_usize()]));
        }
        (out, maps)
    }

    // ------------------------------------------------------------------
    // Unary closure
    // ------------------------------------------------------------------

    /// Build, for every (parent, child) state pair reachable by unary
    /// chains of length at most two, the sum closure (total mass over all
    /// interleaving paths) and the Viterbi closure (the single best path),
    /// recording which intermediate state realizes the best path
    /// ([`DIRECT_RULE`] for a direct rule). Self-loop identities seed both
    /// tables.
    pub fn compute_pairs_of_unaries(&mut self) {
        self.closed_sum.clear();
        self.closed_viterbi.clear();
        self.best_intermediate.clear();

        for i in 0..self.n_states() {
            let s = StateId::from_usize(i);
            let n = self.n_sub(s);
            self.closed_sum.insert((s, s), UnaryRule::identity(s, n));
            self.closed_viterbi.insert((s, s), UnaryRule::identity(s, n));
            self.best_intermediate.insert((s, s), DIRECT_RULE);
        }

        // Direct rules.
        for rule in self.unary.values() {
            if rule.is_self_loop() {
                continue;
            }
            let key = (rule.parent, rule.child);
            add_rule_into(self.closed_sum.entry(key).or_insert_with(|| {
                UnaryRule::empty(rule.parent, rule.child, rule.scores.len())
            }), rule);
            self.closed_viterbi.insert(key, rule.clone());
            self.best_intermediate.insert(key, DIRECT_RULE);
        }

        // Chains with one intermediate: parent -> mid -> child.
        let keys: Vec<UnaryKey> = self.unary.keys().copied().collect();
        for &(parent, mid) in &keys {
            if parent == mid {
                continue;
            }
            for &(mid2, child) in &keys {
                if mid2 != mid || child == parent || child == mid {
                    continue;
                }
                let top = &self.unary[&(parent, mid)];
                let bottom = &self.unary[&(mid, child)];
                let comp = compose_unaries(top, bottom, self.n_sub(parent), self.n_sub(mid));

                let key = (parent, child);
                add_rule_into(
                    self.closed_sum.entry(key).or_insert_with(|| {
                        UnaryRule::empty(parent, child, comp.scores.len())
                    }),
                    &comp,
                );

                let best = self
                    .closed_viterbi
                    .get(&key)
                    .map(|r| OrderedFloat(r.total_mass()))
                    .unwrap_or(OrderedFloat(0.0));
                if OrderedFloat(comp.total_mass()) > best {
                    self.closed_viterbi.insert(key, comp);
                    self.best_intermediate.insert(key, mid.as_u32() as i32);
                }
            }
        }
    }

    /// Sum-closure rule for a state pair, if any chain connects them.
    pub fn closed_sum_rule(&self, parent: StateId, child: StateId) -> Option<&UnaryRule> {
        self.closed_sum.get(&(parent, child))
    }

    /// Best-single-path closure rule for a state pair.
    pub fn closed_viterbi_rule(&self, parent: StateId, child: StateId) -> Option<&UnaryRule> {
        self.closed_viterbi.get(&(parent, child))
    }

    /// Intermediate state realizing the best path, or [`DIRECT_RULE`].
    pub fn best_intermediate_state(&self, parent: StateId, child: StateId) -> Option<i32> {
        self.best_intermediate.get(&(parent, child)).copied()
    }
}

fn normalize_slot(slot: &mut [f64], totals: &[f64], floor: f64) {
    for (i, s) in slot.iter_mut().enumerate() {
        let t = totals[i];
        let ratio = if t > 0.0 { *s / t } else { 0.0 };
        *s = if ratio.is_finite() && ratio >= floor { ratio } else { 0.0 };
    }
}

fn add_rule_into(target: &mut UnaryRule, src: &UnaryRule) {
    for (j, slot) in src.scores.iter().enumerate() {
        let Some(s) = slot else { continue };
        let dst = target.slot_mut(j, s.len());
        for (d, &v) in dst.iter_mut().zip(s.iter()) {
            *d += v;
        }
    }
}

/// Compose `parent -> mid` over `mid -> child` into a `parent -> child`
/// tensor: `out[c][p] = sum_m bottom[c][m] * top[m][p]`.
fn compose_unaries(top: &UnaryRule, bottom: &UnaryRule, n_parent: usize, n_mid: usize) -> UnaryRule {
    let n_child = bottom.scores.len();
    let mut out = UnaryRule::empty(top.parent, bottom.child, n_child);
    for (c, b_slot) in bottom.scores.iter().enumerate() {
        let Some(b) = b_slot else { continue };
        debug_assert_eq!(b.len(), n_mid);
        let mut acc: Option<Vec<f64>> = None;
        for (m, &bv) in b.iter().enumerate() {
            if bv == 0.0 {
                continue;
            }
            let Some(t) = top.slot(m) else { continue };
            let dst = acc.get_or_insert_with(|| vec![0.0; n_parent]);
            for (p, &tv) in t.iter().enumerate() {
                dst[p] += bv * tv;
            }
        }
        out.scores[c] = acc;
    }
    out
}
