use tracing::warn;

use confdb_store::{Access, Bus, Handle, Message};
use confdb_types::oid::subtree_contains;
use confdb_types::Oid;

use crate::desired::DesiredState;
use crate::error::Error;

/// Deletes every live instance that the desired state no longer wants.
///
/// Candidates are the committed `read_create` instances inside the subtree
/// filter; the agent mirror never appears in backup documents and is left
/// alone. Candidates go away in descending ordinal order, so instances of a
/// dependant class are gone before instances of the class they rely on.
/// `deps_might_fire` is raised when any deleted class has dependants, which
/// tells the restore loop that an agent resync is due.
pub fn delete_undesired(
    bus: &mut dyn Bus,
    desired: &DesiredState,
    subtrees: &[Oid],
    agent_subtree: &Oid,
    deps_might_fire: &mut bool,
) -> Result<(), Error> {
    struct Candidate {
        handle: Handle,
        oid: Oid,
        ordinal: u32,
    }

    let mut candidates = Vec::new();
    {
        let db = bus.database();
        for (handle, instance) in db.instances().iter() {
            if instance.oid == Oid::root_instance() {
                continue;
            }
            if !instance.committed {
                continue;
            }
            if agent_subtree.is_prefix_of(&instance.oid.object_oid()) {
                continue;
            }
            let object = db.registry().get(instance.object);
            if object.access != Access::ReadCreate {
                continue;
            }
            if !subtree_contains(subtrees, &instance.oid) {
                continue;
            }
            candidates.push(Candidate {
                handle,
                oid: instance.oid.clone(),
                ordinal: object.ordinal,
            });
        }
    }
    candidates.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));

    for candidate in candidates {
        if desired.contains(&candidate.oid) {
            continue;
        }
        delete_with_children(bus, candidate.handle, &candidate.oid, deps_might_fire)?;
    }
    Ok(())
}

/// Deletes one instance after its children, son-first.
///
/// A candidate that is already gone was collapsed by an earlier delete of
/// an enclosing subtree; that is warned about and still reported to the
/// caller rather than silently swallowed.
fn delete_with_children(
    bus: &mut dyn Bus,
    handle: Handle,
    oid: &Oid,
    deps_might_fire: &mut bool,
) -> Result<(), Error> {
    let (volatile, access, has_dependants, sons) = {
        let db = bus.database();
        let Some(instance) = db.instances().get(handle) else {
            warn!(%oid, "instance scheduled for deletion is already gone");
            return Err(Error::not_found(format!(
                "instance '{oid}' was already collapsed"
            )));
        };
        let object = db.registry().get(instance.object);
        let sons: Vec<(Handle, Oid)> = db
            .instances()
            .sons(handle)
            .into_iter()
            .filter_map(|son| {
                db.instances()
                    .get(son)
                    .map(|instance| (son, instance.oid.clone()))
            })
            .collect();
        (
            object.volatile,
            object.access,
            object.has_dependants(),
            sons,
        )
    };

    if volatile {
        return Ok(());
    }
    if access != Access::ReadCreate {
        return Ok(());
    }
    if has_dependants {
        *deps_might_fire = true;
    }

    for (son, son_oid) in sons {
        delete_with_children(bus, son, &son_oid, deps_might_fire)?;
    }

    bus.process(
        Message::Del {
            handle,
            local: false,
        },
        true,
    )
    .map_err(|err| {
        if err.is_not_found() {
            warn!(%oid, "delete reported a missing instance");
        }
        Error::from(err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::DesiredState;
    use crate::document::InstanceEntry;
    use crate::testutil::{self, Issued, Recorder};
    use confdb_store::Database;
    use confdb_types::ValueType;

    fn oid(text: &str) -> Oid {
        Oid::new(text).unwrap()
    }

    fn agent() -> Oid {
        crate::EngineSettings::default().agent_subtree
    }

    fn desired_of(db: &Database, texts: &[(&str, Option<&str>)]) -> DesiredState {
        let entries: Vec<InstanceEntry> = texts
            .iter()
            .map(|(text, value)| InstanceEntry {
                oid: oid(text),
                value: value.map(str::to_owned),
            })
            .collect();
        DesiredState::build(db, &entries).unwrap()
    }

    #[test]
    fn empty_backup_clears_the_live_state() {
        let mut db = Database::new();
        testutil::schema(&mut db, &[("/a", ValueType::String, Access::ReadCreate)]);
        testutil::add(&mut db, "/a:x", Some("old"));

        let desired = desired_of(&db, &[]);
        let mut recorder = Recorder::new(db);
        let mut fired = false;
        delete_undesired(&mut recorder, &desired, &[], &agent(), &mut fired).unwrap();

        assert_eq!(
            recorder.log,
            vec![Issued::Del {
                oid: "/a:x".into()
            }]
        );
        assert!(recorder.db.instances().is_empty());
        assert!(!fired);
    }

    #[test]
    fn desired_instances_survive() {
        let mut db = Database::new();
        testutil::schema(&mut db, &[("/a", ValueType::Int, Access::ReadCreate)]);
        testutil::add(&mut db, "/a:keep", Some("1"));
        testutil::add(&mut db, "/a:drop", Some("2"));

        let desired = desired_of(&db, &[("/a:keep", Some("1"))]);
        let mut recorder = Recorder::new(db);
        let mut fired = false;
        delete_undesired(&mut recorder, &desired, &[], &agent(), &mut fired).unwrap();

        assert_eq!(
            recorder.log,
            vec![Issued::Del {
                oid: "/a:drop".into()
            }]
        );
        assert!(recorder.db.instances().find(&oid("/a:keep")).is_some());
    }

    #[test]
    fn deletion_runs_dependants_first() {
        let mut db = Database::new();
        testutil::schema(
            &mut db,
            &[
                ("/iface", ValueType::None, Access::ReadCreate),
                ("/route", ValueType::None, Access::ReadCreate),
            ],
        );
        {
            db.process(
                Message::AddDependency {
                    dependant: oid("/route"),
                    provider: oid("/iface"),
                    object_wide: false,
                },
                true,
            )
            .unwrap();
        }
        testutil::add(&mut db, "/iface:eth0", None);
        testutil::add(&mut db, "/route:default", None);

        let desired = desired_of(&db, &[]);
        let mut recorder = Recorder::new(db);
        let mut fired = false;
        delete_undesired(&mut recorder, &desired, &[], &agent(), &mut fired).unwrap();

        // the dependant route goes before the interface it relies on, and
        // the fired dependency asks for a resync
        assert_eq!(
            recorder.trace(),
            vec!["del /route:default", "del /iface:eth0"]
        );
        assert!(fired);
    }

    #[test]
    fn subtrees_and_special_classes_are_left_alone() {
        let mut db = Database::new();
        testutil::schema(
            &mut db,
            &[
                ("/a", ValueType::None, Access::ReadCreate),
                ("/ro", ValueType::Int, Access::ReadOnly),
                ("/agent", ValueType::None, Access::ReadCreate),
            ],
        );
        let mut def = confdb_store::ObjectDef::new(
            oid("/vol"),
            ValueType::Int,
            Access::ReadCreate,
        );
        def.volatile = true;
        db.process(Message::Register(def), true).unwrap();

        testutil::add(&mut db, "/a:in", None);
        testutil::add(&mut db, "/vol:v", Some("1"));
        testutil::add(&mut db, "/agent:left", None);

        let desired = desired_of(&db, &[]);
        let mut recorder = Recorder::new(db);
        let mut fired = false;
        // filter selects a subtree that holds nothing undesired
        delete_undesired(&mut recorder, &desired, &[oid("/b:x")], &agent(), &mut fired).unwrap();
        assert!(recorder.log.is_empty());

        // unfiltered: the volatile instance and the agent mirror survive
        delete_undesired(&mut recorder, &desired, &[], &agent(), &mut fired).unwrap();
        assert_eq!(recorder.trace(), vec!["del /a:in"]);
        assert!(recorder.db.instances().find(&oid("/vol:v")).is_some());
        assert!(recorder.db.instances().find(&oid("/agent:left")).is_some());
    }

    #[test]
    fn children_collapse_with_their_father() {
        let mut db = Database::new();
        testutil::schema(
            &mut db,
            &[
                ("/a", ValueType::None, Access::ReadCreate),
                ("/a/b", ValueType::None, Access::ReadCreate),
            ],
        );
        testutil::add(&mut db, "/a:1", None);
        testutil::add(&mut db, "/a:1/b:1", None);
        testutil::add(&mut db, "/a:1/b:2", None);

        let desired = desired_of(&db, &[]);
        let mut recorder = Recorder::new(db);
        let mut fired = false;
        delete_undesired(&mut recorder, &desired, &[], &agent(), &mut fired).unwrap();

        // deeper classes rank higher, so sons go before their father
        assert_eq!(
            recorder.trace(),
            vec!["del /a:1/b:1", "del /a:1/b:2", "del /a:1"]
        );
        assert!(recorder.db.instances().is_empty());
    }
}
