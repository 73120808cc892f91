use std::collections::HashMap;

use tracing::warn;

use confdb_store::{Database, Handle, ObjectId, ObjectRegistry};
use confdb_types::{Oid, Value, ValueType};

use crate::document::InstanceEntry;
use crate::error::Error;

/// One desired instance parsed from a backup document.
#[derive(Debug)]
pub struct DesiredEntry {
    pub oid: Oid,
    pub object: ObjectId,
    pub value: Option<Value>,
    /// Live handle, resolved lazily; stale after deletions until the
    /// restore loop re-resolves it.
    pub handle: Option<Handle>,
    /// Set once the live store holds this entry with the desired value.
    pub added: bool,
    pub father: Option<usize>,
    pub first_son: Option<usize>,
    pub next_brother: Option<usize>,
}

/// The desired state of one backup operation.
///
/// Entries live in an arena indexed by position; family links and the walk
/// order refer to entries by index. The arena owns every descriptor and its
/// values for the lifetime of the operation.
#[derive(Debug, Default)]
pub struct DesiredState {
    entries: Vec<DesiredEntry>,
    by_oid: HashMap<Oid, usize>,
    order: Vec<usize>,
}

impl DesiredState {
    /// Builds descriptors from document entries in document order,
    /// resolving handles against the live store and parsing values under
    /// the object types.
    pub fn build(db: &Database, entries: &[InstanceEntry]) -> Result<Self, Error> {
        let mut state = DesiredState::default();
        for entry in entries {
            if !entry.oid.is_instance_oid() {
                return Err(Error::invalid(format!(
                    "'{}' is not an instance identifier",
                    entry.oid
                )));
            }
            let object_id = db
                .registry()
                .object_for_instance(&entry.oid)
                .ok_or_else(|| {
                    Error::not_found(format!("no object class for instance '{}'", entry.oid))
                })?;
            let object = db.registry().get(object_id);

            let value = match (&entry.value, object.value_type) {
                (Some(text), ValueType::None) => {
                    return Err(Error::invalid(format!(
                        "instance '{}' has value '{text}' but '{}' is valueless",
                        entry.oid, object.oid
                    )));
                }
                (Some(text), vtype) => Some(vtype.parse(text).map_err(Error::Db)?),
                (None, vtype) if vtype.is_valueless() => None,
                (None, _) => {
                    return Err(Error::not_found(format!(
                        "instance '{}' has no value in the backup",
                        entry.oid
                    )));
                }
            };

            let index = state.entries.len();
            state.entries.push(DesiredEntry {
                oid: entry.oid.clone(),
                object: object_id,
                value,
                handle: db.instances().find(&entry.oid),
                added: false,
                father: None,
                first_son: None,
                next_brother: None,
            });
            state.by_oid.insert(entry.oid.clone(), index);
            state.order.push(index);
        }
        Ok(state)
    }

    /// Fills the father/son/brother links from the identifiers alone.
    ///
    /// Entries are visited in child-first order, so every entry follows its
    /// whole ancestor chain. A depth counter then picks the father: one
    /// level down from the previous entry means the previous entry is the
    /// father; the same level or shallower means climbing the previous
    /// entry's father chain; deeper than one level means an intermediate
    /// level is missing from the document.
    pub fn link_families(&mut self) -> Result<(), Error> {
        let mut sorted: Vec<usize> = (0..self.entries.len()).collect();
        sorted.sort_by(|a, b| self.entries[*a].oid.child_first_cmp(&self.entries[*b].oid));

        let mut previous: Option<usize> = None;
        for index in sorted {
            let depth = self.entries[index].oid.depth();
            let father = match previous {
                None => {
                    if depth > 1 {
                        return Err(self.no_immediate_parent(index));
                    }
                    None
                }
                Some(prev) => {
                    let prev_depth = self.entries[prev].oid.depth();
                    if depth == prev_depth + 1 {
                        Some(prev)
                    } else if depth <= prev_depth {
                        let mut cursor = Some(prev);
                        for _ in 0..(prev_depth - depth + 1) {
                            cursor = cursor.and_then(|at| self.entries[at].father);
                        }
                        if cursor.is_none() && depth > 1 {
                            return Err(self.no_immediate_parent(index));
                        }
                        cursor
                    } else {
                        return Err(self.no_immediate_parent(index));
                    }
                }
            };

            if let Some(father) = father {
                // the candidate must actually enclose the child
                if !self.entries[father]
                    .oid
                    .is_prefix_of(&self.entries[index].oid)
                {
                    return Err(self.no_immediate_parent(index));
                }
                self.entries[index].next_brother = self.entries[father].first_son;
                self.entries[father].first_son = Some(index);
                self.entries[index].father = Some(father);
            }
            previous = Some(index);
        }
        Ok(())
    }

    fn no_immediate_parent(&self, index: usize) -> Error {
        Error::invalid(format!(
            "instance '{}' has no immediate parent in the backup",
            self.entries[index].oid
        ))
    }

    /// Orders the walk by ascending object ordinal: providers come first,
    /// dependants after them, parents before children. The sort is stable,
    /// so document order survives within one ordinal.
    pub fn sort_topological(&mut self, registry: &ObjectRegistry) {
        let entries = &self.entries;
        self.order
            .sort_by_key(|index| registry.get(entries[*index].object).ordinal);

        let mut last = 0u32;
        for index in &self.order {
            let ordinal = registry.get(entries[*index].object).ordinal;
            if ordinal < last {
                warn!(
                    oid = %entries[*index].oid,
                    "desired-state order is not monotone after the sort"
                );
            }
            last = ordinal;
        }
    }

    /// Number of desired entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the desired state is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The walk order as arena indices.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Borrows an entry by arena index.
    pub fn entry(&self, index: usize) -> &DesiredEntry {
        &self.entries[index]
    }

    /// Borrows an entry mutably by arena index.
    pub fn entry_mut(&mut self, index: usize) -> &mut DesiredEntry {
        &mut self.entries[index]
    }

    /// Whether an identifier is desired.
    pub fn contains(&self, oid: &Oid) -> bool {
        self.by_oid.contains_key(oid)
    }

    /// Iterates the entries in document order.
    pub fn iter(&self) -> impl Iterator<Item = &DesiredEntry> {
        self.entries.iter()
    }

    /// Whether every entry has converged.
    pub fn all_added(&self) -> bool {
        self.entries.iter().all(|entry| entry.added)
    }
}
