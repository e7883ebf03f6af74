//! Record kinds and per-kind change sets.
//!
//! Every kind of record lives in its own store. A [`RecordSet`] collects
//! additions and removals for all kinds at once and hands each kind's
//! changes to the updater.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::key::BlockKey;
use crate::update::KeyChange;

/// Kind of record, one store each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Point features.
    Node,
    /// Ordered node lists.
    Way,
    /// Member lists.
    Relation,
    /// Closed areas derived from ways and relations.
    Area,
    /// Computed features.
    Derived,
    /// Superseded node versions.
    AtticNode,
    /// Superseded way versions.
    AtticWay,
    /// Superseded relation versions.
    AtticRelation,
}

impl RecordKind {
    /// Every kind, in store order.
    pub const ALL: [Self; 8] = [
        Self::Node,
        Self::Way,
        Self::Relation,
        Self::Area,
        Self::Derived,
        Self::AtticNode,
        Self::AtticWay,
        Self::AtticRelation,
    ];

    /// File trunk of the kind's store.
    pub const fn trunk(self) -> &'static str {
        match self {
            Self::Node => "nodes",
            Self::Way => "ways",
            Self::Relation => "relations",
            Self::Area => "areas",
            Self::Derived => "derived",
            Self::AtticNode => "nodes_attic",
            Self::AtticWay => "ways_attic",
            Self::AtticRelation => "relations_attic",
        }
    }

    /// Whether the kind holds superseded versions.
    pub const fn is_attic(self) -> bool {
        matches!(self, Self::AtticNode | Self::AtticWay | Self::AtticRelation)
    }

    /// Attic counterpart, if the kind has one.
    pub const fn attic(self) -> Option<Self> {
        match self {
            Self::Node => Some(Self::AtticNode),
            Self::Way => Some(Self::AtticWay),
            Self::Relation => Some(Self::AtticRelation),
            _ => None,
        }
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

/// One keyed record of a given kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record<K> {
    /// Node record.
    Node(K, Vec<u8>),
    /// Way record.
    Way(K, Vec<u8>),
    /// Relation record.
    Relation(K, Vec<u8>),
    /// Area record.
    Area(K, Vec<u8>),
    /// Derived record.
    Derived(K, Vec<u8>),
    /// Attic node record.
    AtticNode(K, Vec<u8>),
    /// Attic way record.
    AtticWay(K, Vec<u8>),
    /// Attic relation record.
    AtticRelation(K, Vec<u8>),
}

impl<K> Record<K> {
    /// Kind of the record.
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::Node(..) => RecordKind::Node,
            Self::Way(..) => RecordKind::Way,
            Self::Relation(..) => RecordKind::Relation,
            Self::Area(..) => RecordKind::Area,
            Self::Derived(..) => RecordKind::Derived,
            Self::AtticNode(..) => RecordKind::AtticNode,
            Self::AtticWay(..) => RecordKind::AtticWay,
            Self::AtticRelation(..) => RecordKind::AtticRelation,
        }
    }

    /// Split into key and payload.
    pub fn into_parts(self) -> (K, Vec<u8>) {
        match self {
            Self::Node(k, v)
            | Self::Way(k, v)
            | Self::Relation(k, v)
            | Self::Area(k, v)
            | Self::Derived(k, v)
            | Self::AtticNode(k, v)
            | Self::AtticWay(k, v)
            | Self::AtticRelation(k, v) => (k, v),
        }
    }
}

/// Pending changes for every record kind.
#[derive(Debug, Clone)]
pub struct RecordSet<K> {
    changes: [BTreeMap<K, KeyChange>; 8],
}

impl<K: BlockKey> Default for RecordSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: BlockKey> RecordSet<K> {
    /// Empty set.
    pub fn new() -> Self {
        Self {
            changes: std::array::from_fn(|_| BTreeMap::new()),
        }
    }

    /// Queue `record` for insertion into its kind's store.
    pub fn append(&mut self, record: Record<K>) {
        match record {
            Record::Node(key, value) => self.push_insert(RecordKind::Node, key, value),
            Record::Way(key, value) => self.push_insert(RecordKind::Way, key, value),
            Record::Relation(key, value) => self.push_insert(RecordKind::Relation, key, value),
            Record::Area(key, value) => self.push_insert(RecordKind::Area, key, value),
            Record::Derived(key, value) => self.push_insert(RecordKind::Derived, key, value),
            Record::AtticNode(key, value) => self.push_insert(RecordKind::AtticNode, key, value),
            Record::AtticWay(key, value) => self.push_insert(RecordKind::AtticWay, key, value),
            Record::AtticRelation(key, value) => {
                self.push_insert(RecordKind::AtticRelation, key, value);
            }
        }
    }

    /// Queue removal of one stored occurrence of `record`.
    pub fn remove(&mut self, record: Record<K>) {
        let kind = record.kind();
        let (key, value) = record.into_parts();
        self.changes[kind.slot()]
            .entry(key)
            .or_default()
            .delete
            .push(value);
    }

    /// Queue removal of everything stored under `key`.
    pub fn clear_key(&mut self, kind: RecordKind, key: K) {
        self.changes[kind.slot()].entry(key).or_default().clear = true;
    }

    /// Changes queued for `kind`.
    pub fn changes(&self, kind: RecordKind) -> &BTreeMap<K, KeyChange> {
        &self.changes[kind.slot()]
    }

    /// Take the changes queued for `kind`, leaving none.
    pub fn take_changes(&mut self, kind: RecordKind) -> BTreeMap<K, KeyChange> {
        std::mem::take(&mut self.changes[kind.slot()])
    }

    /// Keys with queued changes across all kinds.
    pub fn len(&self) -> usize {
        self.changes.iter().map(BTreeMap::len).sum()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.changes.iter().all(BTreeMap::is_empty)
    }

    fn push_insert(&mut self, kind: RecordKind, key: K, value: Vec<u8>) {
        self.changes[kind.slot()]
            .entry(key)
            .or_default()
            .insert
            .push(value);
    }
}
