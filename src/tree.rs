//! Constituency trees and substate-annotated nodes.
//!
//! Training trees arrive from an external loader as string-labeled,
//! already-binarized trees. [`annotate`] converts them once into
//! `Tree<StateSet>` with interned state ids and token spans; the per-node
//! inside/outside score vectors are transient, allocated before a parse
//! pass and released afterward.

use crate::symbol::{StateId, TagSet};
use thiserror::Error;

/// Errors raised by tree-shape contract violations. Both variants are
/// fatal: they indicate a broken upstream collaborator, not bad data.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TreeError {
    #[error("tree node has {arity} children; binarized trees allow at most 2")]
    TooManyChildren { arity: usize },
    #[error("top symbol has {num_sub} substates; the root must be unsplit")]
    SplitRoot { num_sub: u16 },
    #[error("tree has no children under the root")]
    EmptyTree,
}

/// A binary-or-unary branching tree with labels of type `L`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree<L> {
    pub label: L,
    pub children: Vec<Tree<L>>,
}

impl<L> Tree<L> {
    pub fn leaf(label: L) -> Self {
        Tree {
            label,
            children: Vec::new(),
        }
    }

    pub fn node(label: L, children: Vec<Tree<L>>) -> Self {
        Tree { label, children }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// A preterminal dominates exactly one leaf.
    pub fn is_preterminal(&self) -> bool {
        self.children.len() == 1 && self.children[0].is_leaf()
    }

    /// Visit every node bottom-up (children before parents).
    pub fn postorder<'a>(&'a self, visit: &mut impl FnMut(&'a Tree<L>)) {
        for child in &self.children {
            child.postorder(visit);
        }
        visit(self);
    }

    /// Visit every node top-down (parents before children).
    pub fn preorder<'a>(&'a self, visit: &mut impl FnMut(&'a Tree<L>)) {
        visit(self);
        for child in &self.children {
            child.preorder(visit);
        }
    }

    pub fn leaves(&self) -> Vec<&L> {
        let mut out = Vec::new();
        self.postorder(&mut |t| {
            if t.is_leaf() {
                out.push(&t.label);
            }
        });
        out
    }
}

/// A substate-annotated tree node: state id, substate count, token span,
/// and transient inside/outside score vectors with their scale exponents.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSet {
    pub state: StateId,
    pub num_sub: u16,
    pub from: u16,
    pub to: u16,
    /// The literal surface token; set only on leaves.
    pub word: Option<Box<str>>,
    inside: Vec<f64>,
    outside: Vec<f64>,
    pub inside_scale: i32,
    pub outside_scale: i32,
}

impl StateSet {
    pub fn new(state: StateId, num_sub: u16, from: u16, to: u16) -> Self {
        StateSet {
            state,
            num_sub,
            from,
            to,
            word: None,
            inside: Vec::new(),
            outside: Vec::new(),
            inside_scale: 0,
            outside_scale: 0,
        }
    }

    pub fn leaf(state: StateId, word: &str, position: u16) -> Self {
        let mut s = StateSet::new(state, 0, position, position + 1);
        s.word = Some(word.into());
        s
    }

    /// Allocate zeroed score vectors; must precede a parse/tally pass.
    pub fn alloc_scores(&mut self) {
        self.inside = vec![0.0; self.num_sub as usize];
        self.outside = vec![0.0; self.num_sub as usize];
        self.inside_scale = 0;
        self.outside_scale = 0;
    }

    /// Release the score vectors after a pass; they are per-tree scratch.
    pub fn release_scores(&mut self) {
        self.inside = Vec::new();
        self.outside = Vec::new();
    }

    pub fn inside(&self) -> &[f64] {
        &self.inside
    }

    pub fn inside_mut(&mut self) -> &mut Vec<f64> {
        &mut self.inside
    }

    pub fn set_inside(&mut self, scores: Vec<f64>, scale: i32) {
        self.inside = scores;
        self.inside_scale = scale;
    }

    pub fn outside(&self) -> &[f64] {
        &self.outside
    }

    pub fn outside_mut(&mut self) -> &mut Vec<f64> {
        &mut self.outside
    }

    pub fn set_outside(&mut self, scores: Vec<f64>, scale: i32) {
        self.outside = scores;
        self.outside_scale = scale;
    }
}

/// Convert a string-labeled binarized tree into a substate-annotated tree,
/// interning labels and assigning token spans. Every state starts with one
/// substate; leaves keep the literal token and take the preterminal state.
pub fn annotate(tree: &Tree<String>, tags: &mut TagSet) -> Result<Tree<StateSet>, TreeError> {
    let mut position = 0u16;
    annotate_inner(tree, tags, &mut position)
}

fn annotate_inner(
    tree: &Tree<String>,
    tags: &mut TagSet,
    position: &mut u16,
) -> Result<Tree<StateSet>, TreeError> {
    if tree.children.len() > 2 {
        return Err(TreeError::TooManyChildren {
            arity: tree.children.len(),
        });
    }
    if tree.is_leaf() {
        // A bare leaf at the top is malformed; leaves are handled by their
        // preterminal parent below.
        return Err(TreeError::EmptyTree);
    }

    let state = tags.intern(&tree.label);

    if tree.is_preterminal() {
        let from = *position;
        *position += 1;
        let leaf = Tree::leaf(StateSet::leaf(state, &tree.children[0].label, from));
        return Ok(Tree::node(StateSet::new(state, 1, from, from + 1), vec![leaf]));
    }

    let from = *position;
    let children = tree
        .children
        .iter()
        .map(|c| annotate_inner(c, tags, position))
        .collect::<Result<Vec<_>, _>>()?;
    let to = *position;
    Ok(Tree::node(StateSet::new(state, 1, from, to), children))
}

/// Update every node's substate count after a grammar split or merge,
/// dropping any stale score vectors.
pub fn resize_substates(tree: &mut Tree<StateSet>, num_substates: &[u16]) {
    if !tree.is_leaf() {
        tree.label.num_sub = num_substates[tree.label.state.as_usize()];
        tree.label.release_scores();
    }
    for child in &mut tree.children {
        resize_substates(child, num_substates);
    }
}

/// Allocate scratch score vectors on every non-leaf node.
pub fn alloc_tree_scores(tree: &mut Tree<StateSet>) {
    if !tree.is_leaf() {
        tree.label.alloc_scores();
    }
    for child in &mut tree.children {
        alloc_tree_scores(child);
    }
}

/// Release scratch score vectors on every node.
pub fn release_tree_scores(tree: &mut Tree<StateSet>) {
    tree.label.release_scores();
    for child in &mut tree.children {
        release_tree_scores(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_tree() -> Tree<String> {
        // (ROOT (S (NP (D the) (N dog)) (VP (V barks))))
        Tree::node(
            "ROOT".into(),
            vec![Tree::node(
                "S".into(),
                vec![
                    Tree::node(
                        "NP".into(),
                        vec![
                            Tree::node("D".into(), vec![Tree::leaf("the".into())]),
                            Tree::node("N".into(), vec![Tree::leaf("dog".into())]),
                        ],
                    ),
                    Tree::node("VP".into(), vec![Tree::node("V".into(), vec![Tree::leaf("barks".into())])]),
                ],
            )],
        )
    }

    #[test]
    fn test_annotate_spans_and_states() {
        let mut tags = TagSet::new("ROOT");
        let tree = annotate(&string_tree(), &mut tags).unwrap();

        assert_eq!(tree.label.state, StateId::ROOT);
        assert_eq!((tree.label.from, tree.label.to), (0, 3));

        let s = &tree.children[0];
        assert_eq!((s.label.from, s.label.to), (0, 3));
        let np = &s.children[0];
        assert_eq!((np.label.from, np.label.to), (0, 2));
        let vp = &s.children[1];
        assert_eq!((vp.label.from, vp.label.to), (2, 3));

        let words: Vec<_> = tree
            .leaves()
            .iter()
            .map(|l| l.word.as_deref().unwrap().to_string())
            .collect();
        assert_eq!(words, vec!["the", "dog", "barks"]);
    }

    #[test]
    fn test_annotate_rejects_wide_nodes() {
        let wide = Tree::node(
            "ROOT".into(),
            vec![
                Tree::node("A".into(), vec![Tree::leaf("a".into())]),
                Tree::node("B".into(), vec![Tree::leaf("b".into())]),
                Tree::node("C".into(), vec![Tree::leaf("c".into())]),
            ],
        );
        let mut tags = TagSet::new("ROOT");
        assert_eq!(
            annotate(&wide, &mut tags),
            Err(TreeError::TooManyChildren { arity: 3 })
        );
    }

    #[test]
    fn test_resize_and_scores_lifecycle() {
        let mut tags = TagSet::new("ROOT");
        let mut tree = annotate(&string_tree(), &mut tags).unwrap();

        let mut counts = vec![2u16; tags.len()];
        counts[StateId::ROOT.as_usize()] = 1;
        resize_substates(&mut tree, &counts);
        assert_eq!(tree.label.num_sub, 1);
        assert_eq!(tree.children[0].label.num_sub, 2);

        alloc_tree_scores(&mut tree);
        assert_eq!(tree.children[0].label.inside().len(), 2);
        release_tree_scores(&mut tree);
        assert!(tree.children[0].label.inside().is_empty());
    }
}
