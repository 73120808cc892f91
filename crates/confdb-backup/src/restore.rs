use tracing::{debug, warn};

use confdb_store::{Bus, Message};
use confdb_types::Oid;

use crate::delete::delete_undesired;
use crate::desired::DesiredState;
use crate::error::Error;
use crate::{AgentSync, EngineSettings};

#[derive(Debug, Default)]
struct PassFlags {
    /// An add or set took effect during the current inner pass.
    change_made: bool,
    /// A prerequisite was missing during the current inner pass.
    need_retry: bool,
    /// A touched class has dependants; an agent resync is due before the
    /// state can be trusted again.
    deps_might_fire: bool,
}

/// Converges the live store onto the desired state.
///
/// Two nested loops do the work. The inner loop walks the topologically
/// sorted entries, adding and updating against one fixed live snapshot;
/// entries whose prerequisites are missing are retried as long as some
/// other entry still makes progress, which absorbs orderings the sort
/// cannot see. The outer loop reruns deletion, the inner loop and an agent
/// resync for as long as touched dependencies may have invalidated state
/// elsewhere, up to the configured pass bound.
pub fn restore(
    bus: &mut dyn Bus,
    sync: &mut dyn AgentSync,
    desired: &mut DesiredState,
    subtrees: &[Oid],
    settings: &EngineSettings,
) -> Result<(), Error> {
    let order = desired.order().to_vec();
    let mut passes = 0u32;
    loop {
        passes += 1;
        if passes > settings.max_passes {
            warn!(
                limit = settings.max_passes,
                "loop dependency suspected, giving up on convergence"
            );
            return if desired.all_added() {
                Ok(())
            } else {
                Err(Error::not_found(
                    "desired instances kept flipping and never all converged",
                ))
            };
        }
        debug!(pass = passes, "reconciliation pass");

        let mut flags = PassFlags::default();
        delete_undesired(
            bus,
            desired,
            subtrees,
            &settings.agent_subtree,
            &mut flags.deps_might_fire,
        )?;

        let stuck = loop {
            flags.change_made = false;
            flags.need_retry = false;
            for index in &order {
                restore_entry(bus, desired, *index, &mut flags, settings)?;
            }
            if !flags.need_retry {
                break false;
            }
            if !flags.change_made {
                break true;
            }
        };
        if stuck {
            return Err(Error::not_found(
                "desired instances could not be created; their prerequisites never appeared",
            ));
        }

        if !flags.deps_might_fire {
            return Ok(());
        }
        sync.sync(bus.database_mut(), &Oid::root_instance())?;
    }
}

/// Restores one desired entry: a plain add-or-set for ordinary entries, a
/// buffered subtree walk plus a single commit for unit roots. Entries that
/// belong to a unit converge through their root and are skipped here.
fn restore_entry(
    bus: &mut dyn Bus,
    desired: &mut DesiredState,
    index: usize,
    flags: &mut PassFlags,
    settings: &EngineSettings,
) -> Result<(), Error> {
    if desired.entry(index).added {
        return Ok(());
    }
    let (unit, unit_part) = {
        let object = bus.database().registry().get(desired.entry(index).object);
        (object.unit, object.unit_part)
    };
    if unit_part {
        return Ok(());
    }
    if unit {
        return restore_unit(bus, desired, index, flags, settings);
    }
    match add_or_set(bus, desired, index, false, flags, settings) {
        Ok(()) => {
            desired.entry_mut(index).added = true;
            Ok(())
        }
        Err(err) if err.is_not_found() => {
            flags.need_retry = true;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Restores a unit root: every write under it is buffered locally, then one
/// commit flushes the whole subtree. A missing prerequisite leaves the root
/// unconverged so the next pass replays the entire unit.
fn restore_unit(
    bus: &mut dyn Bus,
    desired: &mut DesiredState,
    index: usize,
    flags: &mut PassFlags,
    settings: &EngineSettings,
) -> Result<(), Error> {
    match add_or_set(bus, desired, index, true, flags, settings) {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {
            flags.need_retry = true;
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    let first = desired.entry(index).first_son;
    let complete = descend_unit(bus, desired, first, flags, settings)?;
    if complete {
        let oid = desired.entry(index).oid.clone();
        bus.process(Message::Commit { oid }, true)?;
        desired.entry_mut(index).added = true;
    } else {
        flags.need_retry = true;
    }
    Ok(())
}

fn descend_unit(
    bus: &mut dyn Bus,
    desired: &mut DesiredState,
    first: Option<usize>,
    flags: &mut PassFlags,
    settings: &EngineSettings,
) -> Result<bool, Error> {
    let mut complete = true;
    let mut cursor = first;
    while let Some(index) = cursor {
        cursor = desired.entry(index).next_brother;
        match add_or_set(bus, desired, index, true, flags, settings) {
            Ok(()) => {
                desired.entry_mut(index).added = true;
                let sons = desired.entry(index).first_son;
                if !descend_unit(bus, desired, sons, flags, settings)? {
                    complete = false;
                }
            }
            Err(err) if err.is_not_found() => {
                flags.need_retry = true;
                complete = false;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(complete)
}

/// Adds a missing instance or updates a diverging one.
///
/// Agent roots succeed without action; a live instance whose class is
/// valueless or whose value already matches costs nothing. Classes with
/// dependants raise `deps_might_fire` before the write goes out.
fn add_or_set(
    bus: &mut dyn Bus,
    desired: &mut DesiredState,
    index: usize,
    local: bool,
    flags: &mut PassFlags,
    settings: &EngineSettings,
) -> Result<(), Error> {
    // agents are managed out of band
    if desired.entry(index).oid.object_oid() == settings.agent_subtree {
        return Ok(());
    }

    let handle = {
        let db = bus.database();
        desired
            .entry(index)
            .handle
            .filter(|live| db.instances().get(*live).is_some())
            .or_else(|| db.instances().find(&desired.entry(index).oid))
    };
    desired.entry_mut(index).handle = handle;

    match handle {
        Some(live) => {
            let (valueless, equal, has_dependants) = {
                let db = bus.database();
                let Some(instance) = db.instances().get(live) else {
                    return Err(Error::not_found(format!(
                        "instance '{}' vanished while restoring",
                        desired.entry(index).oid
                    )));
                };
                let object = db.registry().get(instance.object);
                (
                    object.value_type.is_valueless(),
                    instance.value == desired.entry(index).value,
                    object.has_dependants(),
                )
            };
            if valueless || equal {
                return Ok(());
            }
            let value = desired.entry(index).value.clone().ok_or_else(|| {
                Error::invalid(format!(
                    "no desired value for instance '{}'",
                    desired.entry(index).oid
                ))
            })?;
            if has_dependants {
                flags.deps_might_fire = true;
            }
            bus.process(
                Message::Set {
                    handle: live,
                    value,
                    local,
                },
                true,
            )?;
            flags.change_made = true;
        }
        None => {
            let has_dependants = {
                let db = bus.database();
                db.registry().get(desired.entry(index).object).has_dependants()
            };
            if has_dependants {
                flags.deps_might_fire = true;
            }
            bus.process(
                Message::Add {
                    oid: desired.entry(index).oid.clone(),
                    value: desired.entry(index).value.clone(),
                    local,
                },
                true,
            )?;
            flags.change_made = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::DesiredState;
    use crate::document::InstanceEntry;
    use crate::testutil::{self, Issued, Recorder};
    use crate::NoAgents;
    use confdb_store::{Access, Database, ObjectDef};
    use confdb_types::{Error as DbError, Value, ValueType};

    fn oid(text: &str) -> Oid {
        Oid::new(text).unwrap()
    }

    fn desired_of(db: &Database, texts: &[(&str, Option<&str>)]) -> DesiredState {
        let entries: Vec<InstanceEntry> = texts
            .iter()
            .map(|(text, value)| InstanceEntry {
                oid: oid(text),
                value: value.map(str::to_owned),
            })
            .collect();
        let mut desired = DesiredState::build(db, &entries).unwrap();
        desired.link_families().unwrap();
        desired.sort_topological(db.registry());
        desired
    }

    fn run(
        recorder: &mut Recorder,
        sync: &mut dyn AgentSync,
        desired: &mut DesiredState,
        settings: &EngineSettings,
    ) -> Result<(), Error> {
        restore(recorder, sync, desired, &[], settings)
    }

    #[test]
    fn pure_add_issues_one_message() {
        let mut db = Database::new();
        testutil::schema(&mut db, &[("/a", ValueType::Int, Access::ReadCreate)]);

        let mut desired = desired_of(&db, &[("/a:1", Some("7"))]);
        let mut recorder = Recorder::new(db);
        run(&mut recorder, &mut NoAgents, &mut desired, &EngineSettings::default()).unwrap();

        assert_eq!(recorder.trace(), vec!["add /a:1"]);
        assert!(desired.all_added());
        let handle = recorder.db.instances().find(&oid("/a:1")).unwrap();
        assert_eq!(
            recorder.db.instances().get(handle).unwrap().value,
            Some(Value::Int(7))
        );
    }

    #[test]
    fn matching_state_issues_nothing() {
        let mut db = Database::new();
        testutil::schema(&mut db, &[("/a", ValueType::Int, Access::ReadCreate)]);
        testutil::add(&mut db, "/a:1", Some("7"));

        let mut desired = desired_of(&db, &[("/a:1", Some("7"))]);
        let mut recorder = Recorder::new(db);
        run(&mut recorder, &mut NoAgents, &mut desired, &EngineSettings::default()).unwrap();

        assert!(recorder.log.is_empty());
        assert!(desired.all_added());
    }

    #[test]
    fn diverging_value_is_set() {
        let mut db = Database::new();
        testutil::schema(&mut db, &[("/a", ValueType::Int, Access::ReadCreate)]);
        testutil::add(&mut db, "/a:1", Some("1"));

        let mut desired = desired_of(&db, &[("/a:1", Some("2"))]);
        let mut recorder = Recorder::new(db);
        run(&mut recorder, &mut NoAgents, &mut desired, &EngineSettings::default()).unwrap();

        assert_eq!(recorder.trace(), vec!["set /a:1"]);
    }

    #[test]
    fn late_parent_is_absorbed_by_the_inner_loop() {
        let mut db = Database::new();
        testutil::schema(&mut db, &[("/p", ValueType::None, Access::ReadCreate)]);
        let mut child = ObjectDef::new(oid("/p/c"), ValueType::Int, Access::ReadCreate);
        // the child class does not rank above its parent, so the sorted
        // walk can meet the child first and must retry it
        child.no_parent_dep = true;
        {
            db.process(Message::Register(child), true).unwrap();
        }

        let mut desired = desired_of(&db, &[("/p:1/c:1", Some("5")), ("/p:1", None)]);
        let mut recorder = Recorder::new(db);
        run(&mut recorder, &mut NoAgents, &mut desired, &EngineSettings::default()).unwrap();

        // the child's first add failed on the missing parent and was
        // replayed by a second inner pass
        assert_eq!(recorder.trace(), vec!["add /p:1", "add /p:1/c:1"]);
        assert!(desired.all_added());
    }

    #[test]
    fn never_appearing_parent_fails_the_operation() {
        let mut db = Database::new();
        testutil::schema(&mut db, &[("/p", ValueType::None, Access::ReadCreate)]);
        let mut child = ObjectDef::new(oid("/p/c"), ValueType::Int, Access::ReadCreate);
        child.no_parent_dep = true;
        {
            db.process(Message::Register(child), true).unwrap();
        }

        // build without family linking so the absent parent goes unnoticed
        // until the store rejects the add
        let mut desired = DesiredState::build(
            &db,
            &[InstanceEntry {
                oid: oid("/p:9/c:1"),
                value: Some("5".into()),
            }],
        )
        .unwrap();
        desired.sort_topological(db.registry());

        let mut recorder = Recorder::new(db);
        let err = run(
            &mut recorder,
            &mut NoAgents,
            &mut desired,
            &EngineSettings::default(),
        )
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn unit_subtrees_commit_once() {
        let mut db = Database::new();
        let mut unit = ObjectDef::new(oid("/u"), ValueType::None, Access::ReadCreate);
        unit.unit = true;
        {
            db.process(Message::Register(unit), true).unwrap();
        }
        testutil::schema(
            &mut db,
            &[
                ("/u/x", ValueType::Int, Access::ReadCreate),
                ("/u/y", ValueType::Int, Access::ReadCreate),
            ],
        );

        let mut desired = desired_of(
            &db,
            &[
                ("/u:1", None),
                ("/u:1/x:1", Some("1")),
                ("/u:1/y:1", Some("2")),
            ],
        );
        let mut recorder = Recorder::new(db);
        run(&mut recorder, &mut NoAgents, &mut desired, &EngineSettings::default()).unwrap();

        // everything under the unit is buffered, then flushed exactly once
        let trace = recorder.trace();
        assert_eq!(trace[0], "add(local) /u:1");
        assert_eq!(trace.last().unwrap(), "commit /u:1");
        assert_eq!(trace.len(), 4);
        assert!(trace[1].starts_with("add(local) /u:1/"));
        assert!(trace[2].starts_with("add(local) /u:1/"));
        assert!(desired.all_added());

        let root = recorder.db.instances().find(&oid("/u:1")).unwrap();
        assert!(recorder.db.instances().get(root).unwrap().committed);
        let x = recorder.db.instances().find(&oid("/u:1/x:1")).unwrap();
        assert!(recorder.db.instances().get(x).unwrap().committed);
    }

    /// Scripted synchroniser: runs a closure per resync call.
    struct Scripted<F: FnMut(&mut Database, u32)> {
        calls: u32,
        script: F,
    }

    impl<F: FnMut(&mut Database, u32)> Scripted<F> {
        fn new(script: F) -> Self {
            Scripted { calls: 0, script }
        }
    }

    impl<F: FnMut(&mut Database, u32)> AgentSync for Scripted<F> {
        fn sync(&mut self, db: &mut Database, _prefix: &Oid) -> Result<(), DbError> {
            self.calls += 1;
            (self.script)(db, self.calls);
            Ok(())
        }
    }

    fn dependent_pair() -> Database {
        let mut db = Database::new();
        testutil::schema(
            &mut db,
            &[
                ("/a", ValueType::Int, Access::ReadCreate),
                ("/b", ValueType::Int, Access::ReadCreate),
            ],
        );
        {
            db.process(
                Message::AddDependency {
                    dependant: oid("/b"),
                    provider: oid("/a"),
                    object_wide: false,
                },
                true,
            )
            .unwrap();
        }
        db
    }

    #[test]
    fn fired_dependency_triggers_a_resync_and_second_pass() {
        let mut db = dependent_pair();
        testutil::add(&mut db, "/a:1", Some("1"));
        testutil::add(&mut db, "/b:1", Some("1"));

        // the backup changes /a:1, whose class /b depends on
        let mut desired = desired_of(&db, &[("/a:1", Some("2")), ("/b:1", Some("1"))]);
        let mut recorder = Recorder::new(db);
        let mut sync = Scripted::new(|_db, _call| {});
        run(&mut recorder, &mut sync, &mut desired, &EngineSettings::default()).unwrap();

        assert_eq!(recorder.trace(), vec!["set /a:1"]);
        assert_eq!(sync.calls, 1);
    }

    #[test]
    fn oscillating_dependencies_hit_the_pass_bound() {
        let mut db = dependent_pair();
        testutil::add(&mut db, "/a:1", Some("1"));

        // every resync recreates an undesired instance of a class with
        // dependants, so every pass deletes it again and asks for another
        // sync
        let mut desired = desired_of(&db, &[("/a:1", Some("2"))]);
        let mut recorder = Recorder::new(db);
        let mut sync = Scripted::new(|db, _call| {
            db.process(
                Message::Add {
                    oid: Oid::new("/a:ghost").unwrap(),
                    value: Some(Value::Int(0)),
                    local: false,
                },
                true,
            )
            .unwrap();
        });

        let settings = EngineSettings::default();
        run(&mut recorder, &mut sync, &mut desired, &settings).unwrap();

        // bounded: the engine warned and stopped after max_passes rounds,
        // and every desired entry had long converged
        assert_eq!(sync.calls, settings.max_passes);
        assert!(desired.all_added());
        let deletes = recorder
            .log
            .iter()
            .filter(|entry| matches!(entry, Issued::Del { .. }))
            .count();
        assert_eq!(deletes as u32, settings.max_passes - 1);
    }

    #[test]
    fn restoring_twice_issues_no_second_writes() {
        let mut db = Database::new();
        testutil::schema(
            &mut db,
            &[
                ("/a", ValueType::Int, Access::ReadCreate),
                ("/a/b", ValueType::String, Access::ReadCreate),
            ],
        );

        let plan = [
            ("/a:1", Some("7")),
            ("/a:1/b:1", Some("x")),
            ("/a:2", Some("9")),
        ];
        let mut desired = desired_of(&db, &plan);
        let mut recorder = Recorder::new(db);
        run(&mut recorder, &mut NoAgents, &mut desired, &EngineSettings::default()).unwrap();
        assert_eq!(recorder.writes(), 3);

        let mut desired = desired_of(&recorder.db, &plan);
        recorder.log.clear();
        run(&mut recorder, &mut NoAgents, &mut desired, &EngineSettings::default()).unwrap();
        assert_eq!(recorder.writes(), 0);
    }

    #[test]
    fn restore_order_is_monotone_in_ordinals() {
        let mut db = dependent_pair();
        testutil::schema(&mut db, &[("/a/sub", ValueType::Int, Access::ReadCreate)]);

        let mut desired = desired_of(
            &db,
            &[
                ("/b:1", Some("1")),
                ("/a:1/sub:1", Some("2")),
                ("/a:1", Some("3")),
            ],
        );
        let mut recorder = Recorder::new(db);
        run(&mut recorder, &mut NoAgents, &mut desired, &EngineSettings::default()).unwrap();

        // ordinals never decrease along the walk: the provider goes first,
        // its child and its dependant share a rank in document order
        assert_eq!(
            recorder.trace(),
            vec!["add /a:1", "add /b:1", "add /a:1/sub:1"]
        );
    }
}
