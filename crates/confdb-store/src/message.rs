use tracing::{debug, trace};

use confdb_types::{Error, Oid, Value, ValueType};

use crate::instance::{Handle, Instance, InstanceStore};
use crate::object::{Access, DepScope, ObjectDef, ObjectRegistry};

/// A request consumed by the database layer.
///
/// Every payload owns its strings; nothing points back into the caller.
#[derive(Debug, Clone)]
pub enum Message {
    /// Registers an object class.
    Register(ObjectDef),
    /// Adds a dependency edge from `dependant` to `provider`.
    AddDependency {
        dependant: Oid,
        provider: Oid,
        object_wide: bool,
    },
    /// Creates an instance.
    Add {
        oid: Oid,
        value: Option<Value>,
        local: bool,
    },
    /// Overwrites an instance value.
    Set {
        handle: Handle,
        value: Value,
        local: bool,
    },
    /// Deletes an instance (and whatever remains of its subtree).
    Del { handle: Handle, local: bool },
    /// Flushes the locally buffered writes under an identifier.
    Commit { oid: Oid },
}

/// The message surface of the database layer.
///
/// Readers borrow the database directly; every mutation travels as a
/// [`Message`]. Wrappers (test recorders, tracing shims) implement this on
/// top of a [`Database`].
pub trait Bus {
    /// The live database behind this surface.
    fn database(&self) -> &Database;
    /// The live database, mutably; reserved for collaborators that write on
    /// the agents' behalf rather than through messages.
    fn database_mut(&mut self) -> &mut Database;
    /// Submits one request and blocks until the store replies.
    fn process(&mut self, message: Message, synchronous: bool) -> Result<(), Error>;
}

#[derive(Debug)]
struct JournalEntry {
    oid: Oid,
    /// Set when the buffered write created the instance.
    added: Option<Handle>,
}

/// The configuration database: object schema plus live instance mirror.
///
/// Single writer of live state; the backup engine and every other client
/// mutate it only through [`Bus::process`].
#[derive(Debug)]
pub struct Database {
    registry: ObjectRegistry,
    instances: InstanceStore,
    journal: Vec<JournalEntry>,
}

impl Database {
    /// An empty database: the root object and the root instance.
    pub fn new() -> Self {
        let registry = ObjectRegistry::new();
        let instances = InstanceStore::new(registry.root());
        Database {
            registry,
            instances,
            journal: Vec::new(),
        }
    }

    /// The object class registry.
    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// The live instance store.
    pub fn instances(&self) -> &InstanceStore {
        &self.instances
    }

    fn add(&mut self, oid: Oid, value: Option<Value>, local: bool) -> Result<(), Error> {
        if !oid.is_instance_oid() {
            return Err(Error::Invalid(format!(
                "'{oid}' is not an instance identifier"
            )));
        }
        let object_id = self
            .registry
            .object_for_instance(&oid)
            .ok_or_else(|| Error::NotFound(format!("no object class for instance '{oid}'")))?;
        let object = self.registry.get(object_id);
        if object.access == Access::ReadOnly {
            return Err(Error::Forbidden(format!(
                "instances of read-only object '{}' cannot be added",
                object.oid
            )));
        }
        if self.instances.find(&oid).is_some() {
            return Err(Error::AlreadyExists(format!(
                "instance '{oid}' already exists"
            )));
        }
        let father = match oid.parent() {
            None => self.instances.root(),
            Some(parent) => self.instances.find(&parent).ok_or_else(|| {
                Error::NotFound(format!("parent instance '{parent}' of '{oid}' does not exist"))
            })?,
        };

        let value = match value {
            Some(given) => {
                if object.value_type == ValueType::None {
                    return Err(Error::Invalid(format!(
                        "instance '{oid}' carries a value but '{}' is valueless",
                        object.oid
                    )));
                }
                if !given.matches(object.value_type) {
                    return Err(Error::Invalid(format!(
                        "value of instance '{oid}' does not match type '{}'",
                        object.value_type
                    )));
                }
                Some(given)
            }
            None => match object.value_type {
                ValueType::None | ValueType::Unspecified => None,
                _ => match &object.default_value {
                    Some(default) => Some(default.clone()),
                    None => {
                        return Err(Error::NotFound(format!(
                            "instance '{oid}' needs a value and '{}' has no default",
                            object.oid
                        )));
                    }
                },
            },
        };

        let handle = self.instances.insert(Instance {
            oid: oid.clone(),
            object: object_id,
            value,
            committed: !local,
            father: Some(father),
            first_son: None,
            next_brother: None,
        });
        if local {
            self.journal.push(JournalEntry {
                oid,
                added: Some(handle),
            });
        }
        Ok(())
    }

    fn set(&mut self, handle: Handle, value: Value, local: bool) -> Result<(), Error> {
        let instance = self
            .instances
            .get(handle)
            .ok_or_else(|| Error::NotFound(format!("handle {handle} resolves to nothing")))?;
        let object = self.registry.get(instance.object);
        if object.access == Access::ReadOnly {
            return Err(Error::Forbidden(format!(
                "instances of read-only object '{}' cannot be written",
                object.oid
            )));
        }
        if object.value_type == ValueType::None {
            return Err(Error::Invalid(format!(
                "instance '{}' carries no value",
                instance.oid
            )));
        }
        if !value.matches(object.value_type) {
            return Err(Error::Invalid(format!(
                "value of instance '{}' does not match type '{}'",
                instance.oid, object.value_type
            )));
        }
        let oid = instance.oid.clone();
        if let Some(entry) = self.instances.get_mut(handle) {
            entry.value = Some(value);
        }
        if local {
            self.journal.push(JournalEntry { oid, added: None });
        }
        Ok(())
    }

    fn del(&mut self, handle: Handle, local: bool) -> Result<(), Error> {
        let instance = self
            .instances
            .get(handle)
            .ok_or_else(|| Error::NotFound(format!("handle {handle} resolves to nothing")))?;
        let object = self.registry.get(instance.object);
        if object.access == Access::ReadOnly {
            return Err(Error::Forbidden(format!(
                "instances of read-only object '{}' cannot be deleted",
                object.oid
            )));
        }
        if instance.oid == Oid::root_instance() {
            return Err(Error::Forbidden("the root instance is not deletable".into()));
        }
        let oid = instance.oid.clone();
        let removed = self.instances.remove_subtree(handle);
        if removed > 1 {
            debug!(%oid, removed, "delete collapsed a subtree");
        }
        if local {
            self.journal.push(JournalEntry { oid, added: None });
        }
        Ok(())
    }

    fn commit(&mut self, oid: &Oid) -> Result<(), Error> {
        let mut kept = Vec::new();
        let mut flushed = 0usize;
        for entry in self.journal.drain(..) {
            if oid.is_prefix_of(&entry.oid) {
                if let Some(handle) = entry.added {
                    if let Some(instance) = self.instances.get_mut(handle) {
                        instance.committed = true;
                    }
                }
                flushed += 1;
            } else {
                kept.push(entry);
            }
        }
        self.journal = kept;
        if flushed == 0 {
            debug!(%oid, "commit had nothing to flush");
        } else {
            debug!(%oid, flushed, "committed buffered writes");
        }
        Ok(())
    }
}

impl Default for Database {
    fn default() -> Self {
        Database::new()
    }
}

impl Bus for Database {
    fn database(&self) -> &Database {
        self
    }

    fn database_mut(&mut self) -> &mut Database {
        self
    }

    fn process(&mut self, message: Message, synchronous: bool) -> Result<(), Error> {
        trace!(?message, synchronous, "processing request");
        match message {
            Message::Register(def) => self.registry.register(def).map(|_| ()),
            Message::AddDependency {
                dependant,
                provider,
                object_wide,
            } => {
                let id = self.registry.find(&dependant).ok_or_else(|| {
                    Error::NotFound(format!("dependant object '{dependant}' is not registered"))
                })?;
                let scope = if object_wide {
                    DepScope::Object
                } else {
                    DepScope::Instance
                };
                self.registry.add_dependency(id, &provider, scope)
            }
            Message::Add { oid, value, local } => self.add(oid, value, local),
            Message::Set {
                handle,
                value,
                local,
            } => self.set(handle, value, local),
            Message::Del { handle, local } => self.del(handle, local),
            Message::Commit { oid } => self.commit(&oid),
        }
    }
}
