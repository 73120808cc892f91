//! Shared fixtures for the engine tests: a schema loader and a bus wrapper
//! that records every mutating message the engine issues.

use confdb_store::{Access, Bus, Database, Message, ObjectDef};
use confdb_types::{Error as DbError, Oid, ValueType};

/// Registers a batch of object classes.
pub fn schema(db: &mut Database, objects: &[(&str, ValueType, Access)]) {
    for (text, value_type, access) in objects {
        let def = ObjectDef::new(Oid::new(*text).unwrap(), *value_type, *access);
        db.process(Message::Register(def), true).unwrap();
    }
}

/// Adds one committed instance, parsing the value under the class type.
pub fn add(db: &mut Database, text: &str, value: Option<&str>) {
    let oid = Oid::new(text).unwrap();
    let value = value.map(|text| {
        let object = db
            .registry()
            .object_for_instance(&oid)
            .map(|id| db.registry().get(id))
            .expect("object registered");
        object.value_type.parse(text).unwrap()
    });
    db.process(
        Message::Add {
            oid,
            value,
            local: false,
        },
        true,
    )
    .unwrap();
}

/// One mutating message the engine issued, reduced to what the tests
/// assert on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issued {
    Add { oid: String, local: bool },
    Set { oid: String, local: bool },
    Del { oid: String },
    Commit { oid: String },
}

/// A bus wrapper recording every mutating message that succeeded.
pub struct Recorder {
    pub db: Database,
    pub log: Vec<Issued>,
}

impl Recorder {
    pub fn new(db: Database) -> Self {
        Recorder {
            db,
            log: Vec::new(),
        }
    }

    /// Number of recorded writes (adds, sets and deletes; commits do not
    /// count).
    pub fn writes(&self) -> usize {
        self.log
            .iter()
            .filter(|entry| !matches!(entry, Issued::Commit { .. }))
            .count()
    }

    /// The recorded log as compact `"op oid"` strings.
    pub fn trace(&self) -> Vec<String> {
        self.log
            .iter()
            .map(|entry| match entry {
                Issued::Add { oid, local: false } => format!("add {oid}"),
                Issued::Add { oid, local: true } => format!("add(local) {oid}"),
                Issued::Set { oid, local: false } => format!("set {oid}"),
                Issued::Set { oid, local: true } => format!("set(local) {oid}"),
                Issued::Del { oid } => format!("del {oid}"),
                Issued::Commit { oid } => format!("commit {oid}"),
            })
            .collect()
    }
}

impl Bus for Recorder {
    fn database(&self) -> &Database {
        &self.db
    }

    fn database_mut(&mut self) -> &mut Database {
        &mut self.db
    }

    fn process(&mut self, message: Message, synchronous: bool) -> Result<(), DbError> {
        let record = match &message {
            Message::Add { oid, local, .. } => Some(Issued::Add {
                oid: oid.to_string(),
                local: *local,
            }),
            Message::Set { handle, local, .. } => {
                self.db.instances().get(*handle).map(|instance| Issued::Set {
                    oid: instance.oid.to_string(),
                    local: *local,
                })
            }
            Message::Del { handle, .. } => {
                self.db.instances().get(*handle).map(|instance| Issued::Del {
                    oid: instance.oid.to_string(),
                })
            }
            Message::Commit { oid } => Some(Issued::Commit {
                oid: oid.to_string(),
            }),
            _ => None,
        };
        let result = self.db.process(message, synchronous);
        if result.is_ok() {
            if let Some(record) = record {
                self.log.push(record);
            }
        }
        result
    }
}
