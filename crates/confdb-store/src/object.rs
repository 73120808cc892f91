use std::collections::HashMap;

use tracing::warn;

use confdb_types::{Error, Oid, Value, ValueType};

/// Access discipline of an object class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Instances appear and disappear on the agent's initiative only.
    ReadOnly,
    /// Instances can be added, written and deleted.
    ReadCreate,
    /// Instances can be written but not created or deleted.
    ReadWrite,
}

impl Access {
    /// Parses the wire name of an access mode.
    pub fn from_wire(name: &str) -> Result<Self, Error> {
        match name {
            "read_only" => Ok(Access::ReadOnly),
            "read_create" => Ok(Access::ReadCreate),
            "read_write" => Ok(Access::ReadWrite),
            other => Err(Error::Invalid(format!("unknown access mode '{other}'"))),
        }
    }

    /// The wire name of this access mode.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Access::ReadOnly => "read_only",
            Access::ReadCreate => "read_create",
            Access::ReadWrite => "read_write",
        }
    }
}

/// Scope of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepScope {
    /// Any instance of the provider firing may invalidate the dependant.
    Instance,
    /// The whole provider class affects the dependant.
    Object,
}

/// A dependency edge from a dependant object to its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    /// The object this dependant relies on.
    pub provider: ObjectId,
    /// How wide the edge fires.
    pub scope: DepScope,
    /// Whether this is the implicit edge on the parent object; implicit
    /// edges are not emitted into backup documents.
    pub parent: bool,
}

/// Identifier of an object class; stable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(u32);

/// Payload of a REGISTER request.
#[derive(Debug, Clone)]
pub struct ObjectDef {
    pub oid: Oid,
    pub value_type: ValueType,
    pub access: Access,
    pub volatile: bool,
    pub unit: bool,
    /// Suppresses the implicit dependency on the parent object.
    pub no_parent_dep: bool,
    pub default_value: Option<String>,
    /// Reserved; accepted and stored, never acted upon.
    pub substitution: bool,
}

impl ObjectDef {
    /// A definition with the given identity and everything else off.
    pub fn new(oid: Oid, value_type: ValueType, access: Access) -> Self {
        ObjectDef {
            oid,
            value_type,
            access,
            volatile: false,
            unit: false,
            no_parent_dep: false,
            default_value: None,
            substitution: false,
        }
    }
}

/// An object class: a schema node of the configuration tree.
#[derive(Debug)]
pub struct Object {
    pub oid: Oid,
    pub value_type: ValueType,
    pub access: Access,
    pub volatile: bool,
    pub unit: bool,
    /// Derived: some ancestor of this object is a unit.
    pub unit_part: bool,
    pub default_value: Option<Value>,
    pub substitution: bool,
    /// Topological rank; strictly above every provider's ordinal.
    pub ordinal: u32,
    pub parent: Option<ObjectId>,
    pub first_child: Option<ObjectId>,
    pub next_sibling: Option<ObjectId>,
    depends: Vec<Dependency>,
    dependants: Vec<ObjectId>,
}

impl Object {
    /// The dependency edges of this object, implicit parent edge included.
    pub fn depends(&self) -> &[Dependency] {
        &self.depends
    }

    /// Whether any object (a child or an explicit dependant) relies on this
    /// one; changes to such an object may fire cascades elsewhere.
    pub fn has_dependants(&self) -> bool {
        !self.dependants.is_empty()
    }

    /// The objects relying on this one.
    pub fn dependants(&self) -> &[ObjectId] {
        &self.dependants
    }
}

/// The schema of object classes, keyed by identifier and organised as a
/// tree with dependency edges on top.
#[derive(Debug)]
pub struct ObjectRegistry {
    objects: Vec<Object>,
    by_oid: HashMap<Oid, ObjectId>,
}

impl ObjectRegistry {
    /// A registry holding only the root object.
    pub fn new() -> Self {
        let root = Object {
            oid: Oid::root(),
            value_type: ValueType::None,
            access: Access::ReadOnly,
            volatile: false,
            unit: false,
            unit_part: false,
            default_value: None,
            substitution: false,
            ordinal: 0,
            parent: None,
            first_child: None,
            next_sibling: None,
            depends: Vec::new(),
            dependants: Vec::new(),
        };
        let mut by_oid = HashMap::new();
        by_oid.insert(Oid::root(), ObjectId(0));
        ObjectRegistry {
            objects: vec![root],
            by_oid,
        }
    }

    /// The root object, present from construction on.
    pub fn root(&self) -> ObjectId {
        ObjectId(0)
    }

    /// Looks an object up by its identifier.
    pub fn find(&self, oid: &Oid) -> Option<ObjectId> {
        self.by_oid.get(oid).copied()
    }

    /// The object class an instance identifier belongs to.
    pub fn object_for_instance(&self, inst_oid: &Oid) -> Option<ObjectId> {
        self.find(&inst_oid.object_oid())
    }

    /// Borrows an object by identifier.
    pub fn get(&self, id: ObjectId) -> &Object {
        &self.objects[id.0 as usize]
    }

    fn get_mut(&mut self, id: ObjectId) -> &mut Object {
        &mut self.objects[id.0 as usize]
    }

    /// Number of registered objects, root included.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether only the root object is registered.
    pub fn is_empty(&self) -> bool {
        self.objects.len() == 1
    }

    /// The direct children of an object, in registration order.
    pub fn children(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut out = Vec::new();
        let mut next = self.get(id).first_child;
        while let Some(child) = next {
            out.push(child);
            next = self.get(child).next_sibling;
        }
        out
    }

    /// Registers a new object class.
    ///
    /// The provisional ordinal places the object right above its parent;
    /// later dependency edges may bump it further. With `no_parent_dep` the
    /// parent contributes neither a dependency edge nor an ordinal floor.
    pub fn register(&mut self, def: ObjectDef) -> Result<ObjectId, Error> {
        if !def.oid.is_object_oid() {
            return Err(Error::Invalid(format!(
                "'{}' is not an object identifier",
                def.oid
            )));
        }
        if def.oid.is_root() {
            return Err(Error::Invalid("the root object is built in".into()));
        }
        if self.by_oid.contains_key(&def.oid) {
            return Err(Error::Invalid(format!(
                "object '{}' is already registered",
                def.oid
            )));
        }

        let parent_oid = def.oid.parent().unwrap_or_else(Oid::root);
        let parent = self.find(&parent_oid).ok_or_else(|| {
            Error::NotFound(format!(
                "parent object '{parent_oid}' of '{}' is not registered",
                def.oid
            ))
        })?;

        let default_value = match &def.default_value {
            None => None,
            Some(_) if def.value_type == ValueType::None => {
                return Err(Error::Invalid(format!(
                    "object '{}' declares a default but carries no value",
                    def.oid
                )));
            }
            Some(text) => Some(def.value_type.parse(text)?),
        };

        let id = ObjectId(self.objects.len() as u32);
        let parent_obj = self.get(parent);
        let unit_part = parent_obj.unit || parent_obj.unit_part;
        let ordinal = if def.no_parent_dep {
            1
        } else {
            parent_obj.ordinal + 1
        };

        self.objects.push(Object {
            oid: def.oid.clone(),
            value_type: def.value_type,
            access: def.access,
            volatile: def.volatile,
            unit: def.unit,
            unit_part,
            default_value,
            substitution: def.substitution,
            ordinal,
            parent: Some(parent),
            first_child: None,
            next_sibling: None,
            depends: Vec::new(),
            dependants: Vec::new(),
        });
        self.by_oid.insert(def.oid, id);

        // append to the parent's child chain to keep registration order
        match self.children(parent).last().copied() {
            Some(last) => self.get_mut(last).next_sibling = Some(id),
            None => self.get_mut(parent).first_child = Some(id),
        }

        if !def.no_parent_dep {
            self.get_mut(id).depends.push(Dependency {
                provider: parent,
                scope: DepScope::Instance,
                parent: true,
            });
            self.get_mut(parent).dependants.push(id);
        }

        Ok(id)
    }

    /// Adds a dependency edge from `dependant` to the object named by
    /// `provider_oid`, restoring ordinal monotonicity if the new edge broke
    /// it.
    pub fn add_dependency(
        &mut self,
        dependant: ObjectId,
        provider_oid: &Oid,
        scope: DepScope,
    ) -> Result<(), Error> {
        let provider = self.find(provider_oid).ok_or_else(|| {
            Error::NotFound(format!("dependency provider '{provider_oid}' is not registered"))
        })?;
        if provider == dependant {
            return Err(Error::Invalid(format!(
                "object '{}' cannot depend on itself",
                self.get(dependant).oid
            )));
        }
        if self
            .get(dependant)
            .depends
            .iter()
            .any(|dep| dep.provider == provider)
        {
            return Err(Error::AlreadyExists(format!(
                "'{}' already depends on '{provider_oid}'",
                self.get(dependant).oid
            )));
        }

        self.get_mut(dependant).depends.push(Dependency {
            provider,
            scope,
            parent: false,
        });
        self.get_mut(provider).dependants.push(dependant);

        if self.get(dependant).ordinal <= self.get(provider).ordinal {
            let floor = self.get(provider).ordinal;
            self.get_mut(dependant).ordinal = floor + 1;
            self.bump_dependants(dependant);
        }

        Ok(())
    }

    /// Relaxes ordinals over the dependants of `start` until every edge is
    /// monotone again. The work budget bounds the walk on a cyclic graph,
    /// where the invariant cannot be restored.
    fn bump_dependants(&mut self, start: ObjectId) {
        let mut work = vec![start];
        let mut budget = self.objects.len() * self.objects.len() + 1;
        while let Some(id) = work.pop() {
            if budget == 0 {
                warn!(
                    object = %self.get(id).oid,
                    "dependency loop suspected, ordinal invariant left unrestored"
                );
                break;
            }
            budget -= 1;
            let floor = self.get(id).ordinal;
            for dependant in self.get(id).dependants.clone() {
                if self.get(dependant).ordinal <= floor {
                    self.get_mut(dependant).ordinal = floor + 1;
                    work.push(dependant);
                }
            }
        }
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        ObjectRegistry::new()
    }
}
