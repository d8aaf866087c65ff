//! Smoothed word-emission model.
//!
//! Maps (word or unknown-word signature, tag, substate) to a probability,
//! keeping separate statistics for seen and unseen/rare tokens. Words whose
//! corpus count falls at or below the rare-word threshold are scored
//! through their spelling signature, whose per-substate distribution is
//! estimated from the rare tokens observed during training.

use crate::rules::MergeMap;
use crate::scaling::scale_factor;
use crate::symbol::StateId;
use crate::tree::{StateSet, Tree};
use rand::Rng;
use rustc_hash::FxHashMap;
use std::borrow::Cow;

/// Counts below this are dropped during `optimize` to bound table growth.
const COUNT_FLOOR: f64 = 1e-30;

#[derive(Debug, Clone)]
pub struct Lexicon {
    num_substates: Vec<u16>,
    /// Per state: word -> substate-indexed expected counts.
    word_tag_counts: Vec<FxHashMap<Box<str>, Vec<f64>>>,
    /// Per (state, substate): total seen mass.
    tag_counts: Vec<Vec<f64>>,
    /// Per state: signature -> substate-indexed counts from rare tokens.
    unseen_word_tag_counts: Vec<FxHashMap<Box<str>, Vec<f64>>>,
    /// Per (state, substate): total rare-token mass.
    unseen_tag_counts: Vec<Vec<f64>>,
    /// Raw corpus occurrence count per word; fixed after the corpus pass.
    word_counter: FxHashMap<Box<str>, f64>,
    total_tokens: f64,
    /// Memoized signatures keyed by (word, sentence-initial flag).
    sig_cache: FxHashMap<(Box<str>, bool), Box<str>>,
    pub rare_word_threshold: f64,
    /// [seen-word interpolation, signature additive smoothing].
    pub smoothing: [f64; 2],
}

impl Lexicon {
    pub fn new(num_substates: Vec<u16>, rare_word_threshold: f64, smoothing: [f64; 2]) -> Self {
        let n = num_substates.len();
        Lexicon {
            word_tag_counts: vec![FxHashMap::default(); n],
            tag_counts: num_substates.iter().map(|&c| vec![0.0; c as usize]).collect(),
            unseen_word_tag_counts: vec![FxHashMap::default(); n],
            unseen_tag_counts: num_substates.iter().map(|&c| vec![0.0; c as usize]).collect(),
            word_counter: FxHashMap::default(),
            total_tokens: 0.0,
            sig_cache: FxHashMap::default(),
            rare_word_threshold,
            smoothing,
            num_substates,
        }
    }

    pub fn num_substates(&self) -> &[u16] {
        &self.num_substates
    }

    /// Fresh zeroed count tables sharing this lexicon's vocabulary
    /// statistics, signature cache, and hyperparameters. The E-step tallies
    /// into accumulators built this way.
    pub fn counts_like(&self) -> Lexicon {
        let mut out = Lexicon::new(
            self.num_substates.clone(),
            self.rare_word_threshold,
            self.smoothing,
        );
        out.word_counter = self.word_counter.clone();
        out.total_tokens = self.total_tokens;
        out.sig_cache = self.sig_cache.clone();
        out
    }

    /// Combine another accumulator's counts into this one (parallel-reduce
    /// step; the vocabulary statistics are shared and left alone).
    pub fn merge_counts(&mut self, other: &Lexicon) {
        for (state, table) in other.word_tag_counts.iter().enumerate() {
            for (word, counts) in table {
                add_into(
                    self.word_tag_counts[state]
                        .entry(word.clone())
                        .or_insert_with(|| vec![0.0; counts.len()]),
                    counts,
                );
            }
            add_into(&mut self.tag_counts[state], &other.tag_counts[state]);
            add_into(&mut self.unseen_tag_counts[state], &other.unseen_tag_counts[state]);
            for (sig, counts) in &other.unseen_word_tag_counts[state] {
                add_into(
                    self.unseen_word_tag_counts[state]
                        .entry(sig.clone())
                        .or_insert_with(|| vec![0.0; counts.len()]),
                    counts,
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Signatures
    // ------------------------------------------------------------------

    /// Deterministic unknown-word class from spelling features, memoized
    /// per (word, sentence-initial flag).
    pub fn signature(&self, word: &str, is_first: bool) -> Cow<'_, str> {
        if let Some(sig) = self.sig_cache.get(&(Box::from(word), is_first)) {
            return Cow::Borrowed(sig);
        }
        Cow::Owned(self.compute_signature(word, is_first))
    }

    /// Prefill the signature cache for every token in the corpus; call once
    /// before parallel passes so `score` never misses.
    pub fn cache_signatures(&mut self, trees: &[Tree<StateSet>]) {
        let mut pending: Vec<(Box<str>, bool)> = Vec::new();
        for tree in trees {
            tree.postorder(&mut |t| {
                if let Some(word) = t.label.word.as_deref() {
                    pending.push((word.into(), t.label.from == 0));
                }
            });
        }
        for (word, is_first) in pending {
            if !self.sig_cache.contains_key(&(word.clone(), is_first)) {
                let sig = self.compute_signature(&word, is_first);
                self.sig_cache.insert((word, is_first), sig.into());
            }
        }
    }

    fn compute_signature(&self, word: &str, is_first: bool) -> String {
        let mut sig = String::from("UNK");
        let mut chars = word.chars();
        let first = chars.next();

        let has_digit = word.chars().any(|c| c.is_ascii_digit());
        let has_dash = word.contains('-');
        let has_lower = word.chars().any(|c| c.is_lowercase());

        if let Some(c) = first {
            if c.is_uppercase() {
                let lowered = word.to_lowercase();
                if is_first && self.word_counter.contains_key(lowered.as_str()) {
                    // Sentence-initial capitalization of a known word.
                    sig.push_str("-INITC");
                } else if has_lower {
                    sig.push_str("-CAP");
                } else {
                    sig.push_str("-CAPS");
                }
            } else if !c.is_alphanumeric() && has_lower {
                sig.push_str("-SYM");
            }
        }
        if has_digit {
            sig.push_str("-NUM");
        }
        if has_dash {
            sig.push_str("-DASH");
        }

        const SUFFIXES: &[&str] = &[
            "ing", "ed", "ion", "er", "est", "ly", "ity", "al", "s", "y",
        ];
        if word.len() >= 3 && word.chars().all(|c| c.is_alphabetic()) {
            let lowered = word.to_lowercase();
            for suffix in SUFFIXES {
                if lowered.ends_with(suffix) {
                    sig.push('-');
                    sig.push_str(suffix);
                    break;
                }
            }
        }
        sig
    }

    // ------------------------------------------------------------------
    // Scoring
    // ------------------------------------------------------------------

    /// Per-substate emission probability vector for `word` under `state`.
    ///
    /// Seen words (corpus count above the rare-word threshold) get a
    /// Bayesian estimate interpolated toward the signature model; rare and
    /// unknown words fall back to the signature model entirely.
    /// `no_smoothing` bypasses both interpolations, and `is_signature`
    /// scores `word` directly as a signature string.
    pub fn score(
        &self,
        word: &str,
        state: StateId,
        position: u16,
        no_smoothing: bool,
        is_signature: bool,
    ) -> Vec<f64> {
        let si = state.as_usize();
        let n = self.num_substates[si] as usize;

        let sig: Cow<'_, str> = if is_signature {
            Cow::Borrowed(word)
        } else {
            self.signature(word, position == 0)
        };
        let sig_counts = self.unseen_word_tag_counts[si].get(sig.as_ref());
        let sig_types = self.unseen_word_tag_counts[si].len().max(1) as f64;

        let mut sig_est = vec![0.0; n];
        for (sub, est) in sig_est.iter_mut().enumerate() {
            let c_sig = sig_counts.map(|v| v[sub]).unwrap_or(0.0);
            let c_uts = self.unseen_tag_counts[si][sub];
            *est = if no_smoothing {
                if c_uts > 0.0 {
                    c_sig / c_uts
                } else {
                    0.0
                }
            } else {
                (c_sig + self.smoothing[1]) / (c_uts + self.smoothing[1] * sig_types)
            };
        }

        let c_w = self.word_counter.get(word).copied().unwrap_or(0.0);
        if is_signature || c_w <= self.rare_word_threshold {
            return sig_est;
        }

        let word_counts = self.word_tag_counts[si].get(word);
        let mut res = vec![0.0; n];
        for (sub, r) in res.iter_mut().enumerate() {
            let c_ws = word_counts.map(|v| v[sub]).unwrap_or(0.0);
            let c_ts = self.tag_counts[si][sub];
            *r = if no_smoothing {
                if c_ts > 0.0 {
                    c_ws / c_ts
                } else {
                    0.0
                }
            } else {
                (c_ws + self.smoothing[0] * sig_est[sub]) / (c_ts + self.smoothing[0])
            };
        }
        res
    }

    // ------------------------------------------------------------------
    // Tallying (E-step) and normalization (M-step)
    // ------------------------------------------------------------------

    /// First-pass tally over a raw, untrained tree: count 1 per token at
    /// substate 0 and record corpus word occurrences.
    pub fn tally_uninitialized_tree(&mut self, tree: &Tree<StateSet>) {
        tree.postorder(&mut |t| {
            if !t.is_preterminal() {
                return;
            }
            let word = t.children[0].label.word.as_deref().unwrap_or_default();
            let si = t.label.state.as_usize();
            let n = self.num_substates[si] as usize;
            self.word_tag_counts[si]
                .entry(word.into())
                .or_insert_with(|| vec![0.0; n])[0] += 1.0;
            self.tag_counts[si][0] += 1.0;
            *self.word_counter.entry(word.into()).or_insert(0.0) += 1.0;
            self.total_tokens += 1.0;
        });
    }

    /// After the corpus pass, fold every rare word's counts into the
    /// signature tables so unknown words have something to fall back on.
    pub fn register_unseen_stats(&mut self) {
        for si in 0..self.num_substates.len() {
            let rare: Vec<(Box<str>, Vec<f64>)> = self.word_tag_counts[si]
                .iter()
                .filter(|(w, _)| {
                    self.word_counter.get(w.as_ref()).copied().unwrap_or(0.0)
                        <= self.rare_word_threshold
                })
                .map(|(w, c)| (w.clone(), c.clone()))
                .collect();
            for (word, counts) in rare {
                let sig: Box<str> = self.compute_signature(&word, false).into();
                add_into(
                    self.unseen_word_tag_counts[si]
                        .entry(sig)
                        .or_insert_with(|| vec![0.0; counts.len()]),
                    &counts,
                );
                add_into(&mut self.unseen_tag_counts[si], &counts);
            }
        }
    }

    /// E-step tally: add each preterminal's posterior substate mass to the
    /// word/tag tables, with the tree-relative scale correction. Rare
    /// tokens also feed the signature tables.
    pub fn tally_tree(&mut self, tree: &Tree<StateSet>, tree_prob: f64, tree_scale: i32) {
        let mut nodes: Vec<(&Tree<StateSet>,)> = Vec::new();
        tree.postorder(&mut |t| {
            if t.is_preterminal() {
                nodes.push((t,));
            }
        });
        for (t,) in nodes {
            let leaf = &t.children[0].label;
            let word = leaf.word.as_deref().unwrap_or_default();
            let si = t.label.state.as_usize();
            let n = self.num_substates[si] as usize;
            let sf = scale_factor(t.label.inside_scale + t.label.outside_scale - tree_scale);

            let rare = self.word_counter.get(word).copied().unwrap_or(0.0)
                <= self.rare_word_threshold;
            let sig: Option<Box<str>> = if rare {
                Some(self.signature(word, leaf.from == 0).into_owned().into())
            } else {
                None
            };

            for sub in 0..n {
                let gamma = t.label.inside()[sub] * t.label.outside()[sub] / tree_prob * sf;
                if !gamma.is_finite() || gamma <= 0.0 {
                    continue;
                }
                self.word_tag_counts[si]
                    .entry(word.into())
                    .or_insert_with(|| vec![0.0; n])[sub] += gamma;
                self.tag_counts[si][sub] += gamma;
                if let Some(sig) = &sig {
                    self.unseen_word_tag_counts[si]
                        .entry(sig.clone())
                        .or_insert_with(|| vec![0.0; n])[sub] += gamma;
                    self.unseen_tag_counts[si][sub] += gamma;
                }
            }
        }
    }

    /// M-step housekeeping: drop vanishing counts and zero non-finite ones.
    /// Scores are computed from counts on demand, so there is nothing else
    /// to normalize here.
    pub fn optimize(&mut self) {
        for table in self
            .word_tag_counts
            .iter_mut()
            .chain(self.unseen_word_tag_counts.iter_mut())
        {
            for counts in table.values_mut() {
                for c in counts.iter_mut() {
                    if !c.is_finite() || *c < COUNT_FLOOR {
                        *c = 0.0;
                    }
                }
            }
            table.retain(|_, counts| counts.iter().any(|&c| c > 0.0));
        }
        for totals in self.tag_counts.iter_mut().chain(self.unseen_tag_counts.iter_mut()) {
            for c in totals.iter_mut() {
                if !c.is_finite() || *c < COUNT_FLOOR {
                    *c = 0.0;
                }
            }
        }
    }

    /// Redistribute each rare word's observed substate mass according to
    /// its tag's aggregate unseen distribution, stabilizing estimates that
    /// rest on a handful of tokens.
    pub fn tie_rare_word_stats(&mut self) {
        for si in 0..self.num_substates.len() {
            let unseen_total: f64 = self.unseen_tag_counts[si].iter().sum();
            if unseen_total <= 0.0 {
                continue;
            }
            let dist: Vec<f64> = self.unseen_tag_counts[si]
                .iter()
                .map(|&c| c / unseen_total)
                .collect();
            let threshold = self.rare_word_threshold;
            let counter = &self.word_counter;
            for (word, counts) in self.word_tag_counts[si].iter_mut() {
                if counter.get(word.as_ref()).copied().unwrap_or(0.0) > threshold {
                    continue;
                }
                let mass: f64 = counts.iter().sum();
                for (c, &d) in counts.iter_mut().zip(dist.iter()) {
                    *c = mass * d;
                }
            }
        }
        self.recompute_totals();
    }

    // ------------------------------------------------------------------
    // Substate transformations
    // ------------------------------------------------------------------

    /// Double every state's substate count (ROOT exempt), mirroring the
    /// grammar's split over every per-word count vector.
    pub fn split_states<R: Rng>(&self, randomness: f64, rng: &mut R) -> Lexicon {
        let new_counts: Vec<u16> = self
            .num_substates
            .iter()
            .enumerate()
            .map(|(i, &c)| if StateId::from_usize(i) == StateId::ROOT { c } else { c * 2 })
            .collect();
        let mut out = Lexicon::new(new_counts, self.rare_word_threshold, self.smoothing);
        out.word_counter = self.word_counter.clone();
        out.total_tokens = self.total_tokens;
        out.sig_cache = self.sig_cache.clone();

        for si in 0..self.num_substates.len() {
            let split = StateId::from_usize(si) != StateId::ROOT;
            for (word, counts) in &self.word_tag_counts[si] {
                out.word_tag_counts[si].insert(word.clone(), split_vec(counts, split, randomness, rng));
            }
            for (sig, counts) in &self.unseen_word_tag_counts[si] {
                out.unseen_word_tag_counts[si].insert(sig.clone(), split_vec(counts, split, randomness, rng));
            }
        }
        out.recompute_totals();
        out
    }

    /// Collapse substates per the same merge maps the grammar used; counts
    /// are joint with the word, so the pair's counts simply sum.
    pub fn merge_states(&self, maps: &[MergeMap]) -> Lexicon {
        let new_counts: Vec<u16> = maps.iter().map(|m| m.new_len as u16).collect();
        let mut out = Lexicon::new(new_counts, self.rare_word_threshold, self.smoothing);
        out.word_counter = self.word_counter.clone();
        out.total_tokens = self.total_tokens;
        out.sig_cache = self.sig_cache.clone();

        for si in 0..self.num_substates.len() {
            let map = &maps[si];
            for (word, counts) in &self.word_tag_counts[si] {
                out.word_tag_counts[si].insert(word.clone(), merge_vec(counts, map));
            }
            for (sig, counts) in &self.unseen_word_tag_counts[si] {
                out.unseen_word_tag_counts[si].insert(sig.clone(), merge_vec(counts, map));
            }
        }
        out.recompute_totals();
        out
    }

    fn recompute_totals(&mut self) {
        for si in 0..self.num_substates.len() {
            let n = self.num_substates[si] as usize;
            let mut seen = vec![0.0; n];
            for counts in self.word_tag_counts[si].values() {
                add_into(&mut seen, counts);
            }
            self.tag_counts[si] = seen;

            let mut unseen = vec![0.0; n];
            for counts in self.unseen_word_tag_counts[si].values() {
                add_into(&mut unseen, counts);
            }
            self.unseen_tag_counts[si] = unseen;
        }
    }

    // ------------------------------------------------------------------
    // Read access for export and diagnostics
    // ------------------------------------------------------------------

    pub fn words(&self, state: StateId) -> impl Iterator<Item = (&str, &[f64])> {
        self.word_tag_counts[state.as_usize()]
            .iter()
            .map(|(w, c)| (w.as_ref(), c.as_slice()))
    }

    pub fn tag_total(&self, state: StateId, sub: usize) -> f64 {
        self.tag_counts[state.as_usize()][sub]
    }

    pub fn word_count(&self, word: &str) -> f64 {
        self.word_counter.get(word).copied().unwrap_or(0.0)
    }
}

fn add_into(dst: &mut [f64], src: &[f64]) {
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d += s;
    }
}

fn split_vec<R: Rng>(counts: &[f64], split: bool, randomness: f64, rng: &mut R) -> Vec<f64> {
    if !split {
        return counts.to_vec();
    }
    let mut out = Vec::with_capacity(counts.len() * 2);
    for &c in counts {
        let eps = (rng.gen::<f64>() - 0.5) * randomness / 100.0;
        out.push(c / 2.0 * (1.0 + eps));
        out.push(c / 2.0 * (1.0 - eps));
    }
    out
}

fn merge_vec(counts: &[f64], map: &MergeMap) -> Vec<f64> {
    let mut out = vec![0.0; map.new_len];
    for (i, &c) in counts.iter().enumerate() {
        out[map.map[i]] += c;
    }
    out
}
