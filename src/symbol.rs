//! Tag numbering: mapping nonterminal labels to small integer state ids.
//!
//! Every component that needs to translate between label strings and state
//! ids receives an explicit `TagSet` rather than consulting process-global
//! state. The table is constructed once per training run, populated during
//! the corpus pass, and frozen afterward.

use rustc_hash::FxHashMap;

/// Interned state id for a coarse nonterminal category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u32);

impl StateId {
    /// The designated ROOT state. It always keeps exactly one substate.
    pub const ROOT: StateId = StateId(0);

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Construct from a raw index. Callers are responsible for the index
    /// being a valid slot in the owning `TagSet`.
    pub fn from_usize(i: usize) -> Self {
        StateId(i as u32)
    }
}

/// Bidirectional label <-> state id table.
#[derive(Debug, Clone)]
pub struct TagSet {
    str_to_id: FxHashMap<Box<str>, StateId>,
    id_to_str: Vec<Box<str>>,
    frozen: bool,
}

impl TagSet {
    /// Create a table with the given root label pre-interned as state 0.
    pub fn new(root_label: &str) -> Self {
        let mut tags = TagSet {
            str_to_id: FxHashMap::default(),
            id_to_str: Vec::new(),
            frozen: false,
        };
        let root = tags.intern(root_label);
        debug_assert_eq!(root, StateId::ROOT);
        tags
    }

    /// Intern a label, returning its state id.
    ///
    /// Panics if the table has been frozen and the label is new; after the
    /// corpus pass no component may invent states.
    pub fn intern(&mut self, label: &str) -> StateId {
        if let Some(&id) = self.str_to_id.get(label) {
            return id;
        }
        assert!(!self.frozen, "cannot intern {label:?}: tag set is frozen");

        let id = StateId(self.id_to_str.len() as u32);
        let boxed: Box<str> = label.into();
        self.str_to_id.insert(boxed.clone(), id);
        self.id_to_str.push(boxed);
        id
    }

    /// Look up a label without interning.
    pub fn lookup(&self, label: &str) -> Option<StateId> {
        self.str_to_id.get(label).copied()
    }

    /// Resolve a state id back to its label.
    pub fn resolve(&self, id: StateId) -> &str {
        &self.id_to_str[id.0 as usize]
    }

    pub fn contains(&self, label: &str) -> bool {
        self.str_to_id.contains_key(label)
    }

    /// Number of distinct states.
    pub fn len(&self) -> usize {
        self.id_to_str.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_str.is_empty()
    }

    /// Freeze the table; subsequent `intern` calls for unseen labels panic.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Iterate over all state ids in numbering order.
    pub fn ids(&self) -> impl Iterator<Item = StateId> {
        (0..self.id_to_str.len() as u32).map(StateId)
    }
}
