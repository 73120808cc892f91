use std::collections::HashMap;
use std::fmt;

use confdb_types::{Oid, Value};

use crate::object::ObjectId;

/// Opaque stable identifier of a live instance.
///
/// A handle stays valid until its instance is deleted; a reused slot gets a
/// new sequence number, so stale handles resolve to nothing instead of to a
/// stranger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    slot: u32,
    seq: u32,
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.seq)
    }
}

/// A live entry of the configuration tree.
#[derive(Debug, PartialEq)]
pub struct Instance {
    pub oid: Oid,
    pub object: ObjectId,
    pub value: Option<Value>,
    /// False while the entry exists only as a locally buffered write; a
    /// COMMIT of an enclosing identifier flips it.
    pub committed: bool,
    pub father: Option<Handle>,
    pub first_son: Option<Handle>,
    pub next_brother: Option<Handle>,
}

#[derive(Debug)]
struct Slot {
    seq: u32,
    entry: Option<Instance>,
}

/// The live instance arena.
///
/// Slots keep their index for the lifetime of the store, which makes an
/// enumeration a stable snapshot even while instances come and go.
#[derive(Debug)]
pub struct InstanceStore {
    slots: Vec<Slot>,
    by_oid: HashMap<Oid, Handle>,
    free: Vec<u32>,
    len: usize,
}

impl InstanceStore {
    /// A store holding only the root instance, bound to `root_object`.
    pub fn new(root_object: ObjectId) -> Self {
        let root = Instance {
            oid: Oid::root_instance(),
            object: root_object,
            value: None,
            committed: true,
            father: None,
            first_son: None,
            next_brother: None,
        };
        let handle = Handle { slot: 0, seq: 0 };
        let mut by_oid = HashMap::new();
        by_oid.insert(Oid::root_instance(), handle);
        InstanceStore {
            slots: vec![Slot {
                seq: 0,
                entry: Some(root),
            }],
            by_oid,
            free: Vec::new(),
            len: 1,
        }
    }

    /// The root instance, present from construction on.
    pub fn root(&self) -> Handle {
        Handle { slot: 0, seq: 0 }
    }

    /// Looks a live instance up by identifier.
    pub fn find(&self, oid: &Oid) -> Option<Handle> {
        self.by_oid.get(oid).copied()
    }

    /// Resolves a handle, returning `None` when it went stale.
    pub fn get(&self, handle: Handle) -> Option<&Instance> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.seq != handle.seq {
            return None;
        }
        slot.entry.as_ref()
    }

    pub(crate) fn get_mut(&mut self, handle: Handle) -> Option<&mut Instance> {
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.seq != handle.seq {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Number of live instances, root included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether only the root instance is live.
    pub fn is_empty(&self) -> bool {
        self.len == 1
    }

    /// A stable-index snapshot of every live instance.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &Instance)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let entry = slot.entry.as_ref()?;
            Some((
                Handle {
                    slot: index as u32,
                    seq: slot.seq,
                },
                entry,
            ))
        })
    }

    /// The direct sons of an instance, leftmost first.
    pub fn sons(&self, handle: Handle) -> Vec<Handle> {
        let mut out = Vec::new();
        let mut next = self.get(handle).and_then(|inst| inst.first_son);
        while let Some(son) = next {
            out.push(son);
            next = self.get(son).and_then(|inst| inst.next_brother);
        }
        out
    }

    /// Inserts an instance whose `father` field is already set, linking it
    /// as the father's leftmost son.
    pub(crate) fn insert(&mut self, mut instance: Instance) -> Handle {
        let father = instance.father;
        let oid = instance.oid.clone();
        if let Some(f) = father {
            instance.next_brother = self.get(f).and_then(|inst| inst.first_son);
        }

        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(instance);
                Handle {
                    slot: index,
                    seq: slot.seq,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    seq: 0,
                    entry: Some(instance),
                });
                Handle { slot: index, seq: 0 }
            }
        };

        self.by_oid.insert(oid, handle);
        if let Some(f) = father {
            if let Some(parent) = self.get_mut(f) {
                parent.first_son = Some(handle);
            }
        }
        self.len += 1;
        handle
    }

    /// Removes an instance together with whatever remains of its subtree,
    /// returning how many entries went away. Stale handles remove nothing.
    pub(crate) fn remove_subtree(&mut self, handle: Handle) -> usize {
        let Some(instance) = self.get(handle) else {
            return 0;
        };

        // unlink the subtree root from the father's son chain
        let father = instance.father;
        let next_brother = instance.next_brother;
        if let Some(f) = father {
            let first = self.get(f).and_then(|inst| inst.first_son);
            if first == Some(handle) {
                if let Some(parent) = self.get_mut(f) {
                    parent.first_son = next_brother;
                }
            } else {
                let mut cursor = first;
                while let Some(brother) = cursor {
                    let following = self.get(brother).and_then(|inst| inst.next_brother);
                    if following == Some(handle) {
                        if let Some(entry) = self.get_mut(brother) {
                            entry.next_brother = next_brother;
                        }
                        break;
                    }
                    cursor = following;
                }
            }
        }

        let mut doomed = Vec::new();
        let mut stack = vec![handle];
        while let Some(current) = stack.pop() {
            doomed.push(current);
            stack.extend(self.sons(current));
        }

        for victim in &doomed {
            if let Some(entry) = self.slots[victim.slot as usize].entry.take() {
                self.by_oid.remove(&entry.oid);
                self.slots[victim.slot as usize].seq += 1;
                self.free.push(victim.slot);
                self.len -= 1;
            }
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confdb_types::Oid;

    fn oid(text: &str) -> Oid {
        Oid::new(text).unwrap()
    }

    fn root_object() -> ObjectId {
        crate::object::ObjectRegistry::new().root()
    }

    fn store_with(entries: &[&str]) -> InstanceStore {
        let mut store = InstanceStore::new(root_object());
        for text in entries {
            let parsed = oid(text);
            let father = match parsed.parent() {
                None => store.root(),
                Some(p) => store.find(&p).expect("parent listed first"),
            };
            store.insert(Instance {
                oid: parsed,
                object: root_object(),
                value: None,
                committed: true,
                father: Some(father),
                first_son: None,
                next_brother: None,
            });
        }
        store
    }

    #[test]
    fn family_links_mirror_the_hierarchy() {
        let store = store_with(&["/a:1", "/a:1/b:1", "/a:1/b:2"]);
        let a = store.find(&oid("/a:1")).unwrap();
        let sons = store.sons(a);
        let names: Vec<&str> = sons
            .iter()
            .map(|h| store.get(*h).unwrap().oid.as_str())
            .collect();
        // newest son links leftmost
        assert_eq!(names, ["/a:1/b:2", "/a:1/b:1"]);
        assert_eq!(store.get(sons[0]).unwrap().father, Some(a));
    }

    #[test]
    fn removal_collapses_the_subtree_and_stales_handles() {
        let mut store = store_with(&["/a:1", "/a:1/b:1", "/a:1/b:1/c:1", "/a:2"]);
        let a1 = store.find(&oid("/a:1")).unwrap();
        let c1 = store.find(&oid("/a:1/b:1/c:1")).unwrap();

        assert_eq!(store.remove_subtree(a1), 3);
        assert_eq!(store.get(a1), None);
        assert_eq!(store.get(c1), None);
        assert_eq!(store.find(&oid("/a:1/b:1")), None);
        assert!(store.find(&oid("/a:2")).is_some());
        assert_eq!(store.len(), 2);

        // a stale handle removes nothing
        assert_eq!(store.remove_subtree(c1), 0);
    }

    #[test]
    fn slots_are_reused_with_fresh_sequence_numbers() {
        let mut store = store_with(&["/a:1"]);
        let old = store.find(&oid("/a:1")).unwrap();
        store.remove_subtree(old);

        let root = store.root();
        let new = store.insert(Instance {
            oid: oid("/a:2"),
            object: root_object(),
            value: None,
            committed: true,
            father: Some(root),
            first_son: None,
            next_brother: None,
        });
        assert_eq!(store.get(old), None);
        assert_eq!(store.get(new).unwrap().oid, oid("/a:2"));
    }
}
