use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use tracing::{debug, info};

use confdb_store::{Access, Bus, Database, Message};
use confdb_types::oid::subtree_contains;
use confdb_types::Oid;

use crate::desired::DesiredState;
use crate::document::{self, BackupDoc};
use crate::error::Error;
use crate::restore;
use crate::{AgentSync, EngineSettings};

/// The backup operations understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOp {
    /// Compare the live state against a backup document.
    Verify,
    /// Reconcile the live state onto a backup document.
    RestoreNoHistory,
    /// Snapshot the live state into a backup document.
    Create,
    /// Verify, restore on divergence, then verify again.
    VerifyAndRestore,
}

/// A backup request addressed to the database layer.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub op: BackupOp,
    pub filename: PathBuf,
    /// Subtrees the operation is restricted to; empty means everything.
    pub subtrees: Vec<Oid>,
}

impl BackupRequest {
    /// A whole-tree request.
    pub fn new(op: BackupOp, filename: impl Into<PathBuf>) -> Self {
        BackupRequest {
            op,
            filename: filename.into(),
            subtrees: Vec::new(),
        }
    }
}

/// Executes one backup request against the live database.
pub fn process(
    bus: &mut dyn Bus,
    sync: &mut dyn AgentSync,
    settings: &EngineSettings,
    request: &BackupRequest,
) -> Result<(), Error> {
    debug!(op = ?request.op, file = %request.filename.display(), "backup operation");
    match request.op {
        BackupOp::Create => create(bus.database(), settings, request),
        BackupOp::Verify => verify(bus.database(), settings, request),
        BackupOp::RestoreNoHistory => restore_from_file(bus, sync, settings, request),
        BackupOp::VerifyAndRestore => match verify(bus.database(), settings, request) {
            Ok(()) => Ok(()),
            Err(Error::Diverged { oid }) => {
                info!(%oid, "live state diverges from the backup, restoring");
                restore_from_file(bus, sync, settings, request)?;
                verify(bus.database(), settings, request)
            }
            Err(err) => Err(err),
        },
    }
}

fn read_document(request: &BackupRequest) -> Result<BackupDoc, Error> {
    let file = fs::File::open(&request.filename)?;
    document::read_backup(BufReader::new(file))
}

fn create(db: &Database, settings: &EngineSettings, request: &BackupRequest) -> Result<(), Error> {
    let file = fs::File::create(&request.filename)?;
    let mut writer = BufWriter::new(file);
    document::write_backup(db, &request.subtrees, &settings.agent_subtree, &mut writer)?;
    writer.flush()?;
    Ok(())
}

/// Compares the live state against the document, reporting the first
/// divergence: a desired instance that is missing or carries another
/// value, or a live `read_create` instance the document does not want.
fn verify(db: &Database, settings: &EngineSettings, request: &BackupRequest) -> Result<(), Error> {
    let doc = read_document(request)?;
    let desired = DesiredState::build(db, &doc.instances)?;

    for entry in desired.iter() {
        if entry.oid.object_oid() == settings.agent_subtree {
            continue;
        }
        if !subtree_contains(&request.subtrees, &entry.oid) {
            continue;
        }
        let object = db.registry().get(entry.object);
        let live = entry.handle.and_then(|handle| db.instances().get(handle));
        match live {
            Some(instance) => {
                if !object.value_type.is_valueless() && instance.value != entry.value {
                    return Err(Error::Diverged {
                        oid: entry.oid.clone(),
                    });
                }
            }
            None => {
                return Err(Error::Diverged {
                    oid: entry.oid.clone(),
                });
            }
        }
    }

    for (_, instance) in db.instances().iter() {
        if instance.oid == Oid::root_instance() {
            continue;
        }
        if !instance.committed {
            continue;
        }
        let object = db.registry().get(instance.object);
        if object.access != Access::ReadCreate || object.volatile {
            continue;
        }
        if settings.agent_subtree.is_prefix_of(&instance.oid.object_oid()) {
            continue;
        }
        if !subtree_contains(&request.subtrees, &instance.oid) {
            continue;
        }
        if !desired.contains(&instance.oid) {
            return Err(Error::Diverged {
                oid: instance.oid.clone(),
            });
        }
    }
    Ok(())
}

fn restore_from_file(
    bus: &mut dyn Bus,
    sync: &mut dyn AgentSync,
    settings: &EngineSettings,
    request: &BackupRequest,
) -> Result<(), Error> {
    let doc = read_document(request)?;
    load_schema(bus, &doc)?;
    let mut desired = DesiredState::build(bus.database(), &doc.instances)?;
    desired.link_families()?;
    desired.sort_topological(bus.database().registry());
    restore::restore(bus, sync, &mut desired, &request.subtrees, settings)
}

/// Registers the object entries the registry does not know yet, together
/// with their dependency edges. Entries that are already registered stay
/// untouched; an edge both sides already share is not an error.
fn load_schema(bus: &mut dyn Bus, doc: &BackupDoc) -> Result<(), Error> {
    for entry in &doc.objects {
        if bus.database().registry().find(&entry.def.oid).is_none() {
            bus.process(Message::Register(entry.def.clone()), true)?;
        }
        for dep in &entry.depends {
            let message = Message::AddDependency {
                dependant: entry.def.oid.clone(),
                provider: dep.provider.clone(),
                object_wide: dep.object_wide,
            };
            match bus.process(message, true) {
                Ok(()) => {}
                Err(confdb_types::Error::AlreadyExists(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}
