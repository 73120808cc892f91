use std::io::{Read, Write};

use xml::attribute::OwnedAttribute;
use xml::reader::{EventReader, ParserConfig, XmlEvent};
use xml::writer::{EmitterConfig, EventWriter, XmlEvent as Emit};

use confdb_store::{Access, Database, DepScope, Handle, ObjectDef, ObjectId, ObjectRegistry};
use confdb_types::oid::subtree_contains;
use confdb_types::{Oid, ValueType};

use crate::error::Error;

/// A `<depends>` sub-entry of an object entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DependsEntry {
    pub provider: Oid,
    pub object_wide: bool,
}

/// An `<object>` entry read from a backup document.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub def: ObjectDef,
    pub depends: Vec<DependsEntry>,
}

/// An `<instance>` entry read from a backup document.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceEntry {
    pub oid: Oid,
    pub value: Option<String>,
}

/// A parsed backup document: object entries first, instance entries after.
#[derive(Debug, Clone, Default)]
pub struct BackupDoc {
    pub objects: Vec<ObjectEntry>,
    pub instances: Vec<InstanceEntry>,
}

fn reader<R: Read>(input: R) -> EventReader<R> {
    ParserConfig::new()
        .ignore_comments(true)
        .cdata_to_characters(true)
        .create_reader(input)
}

fn skip_to_root<R: Read>(events: &mut EventReader<R>, tag: &str) -> Result<(), Error> {
    loop {
        match events.next()? {
            XmlEvent::StartDocument { .. }
            | XmlEvent::Whitespace(_)
            | XmlEvent::ProcessingInstruction { .. } => continue,
            XmlEvent::StartElement { name, .. } => {
                if name.local_name == tag {
                    return Ok(());
                }
                return Err(Error::invalid(format!(
                    "expected <{tag}> root element, found <{}>",
                    name.local_name
                )));
            }
            _ => return Err(Error::invalid(format!("expected <{tag}> root element"))),
        }
    }
}

fn expect_clean_end<R: Read>(events: &mut EventReader<R>) -> Result<(), Error> {
    loop {
        match events.next()? {
            XmlEvent::EndDocument => return Ok(()),
            XmlEvent::Whitespace(_) => continue,
            _ => return Err(Error::invalid("content after the document root")),
        }
    }
}

fn parse_bool(attribute: &str, value: &str) -> Result<bool, Error> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(Error::invalid(format!(
            "attribute '{attribute}' has value '{other}', expected 'true' or 'false'"
        ))),
    }
}

/// Reads the backup form.
pub fn read_backup<R: Read>(input: R) -> Result<BackupDoc, Error> {
    let mut events = reader(input);
    skip_to_root(&mut events, "backup")?;

    let mut doc = BackupDoc::default();
    loop {
        match events.next()? {
            XmlEvent::Whitespace(_) => continue,
            XmlEvent::StartElement {
                name, attributes, ..
            } => match name.local_name.as_str() {
                "object" => {
                    if !doc.instances.is_empty() {
                        return Err(Error::invalid(
                            "object entry after the first instance entry",
                        ));
                    }
                    doc.objects.push(read_object(&mut events, attributes)?);
                }
                "instance" => {
                    doc.instances.push(read_instance(&mut events, attributes)?);
                }
                other => {
                    return Err(Error::invalid(format!(
                        "unexpected element <{other}> in backup document"
                    )));
                }
            },
            XmlEvent::EndElement { .. } => break,
            XmlEvent::Characters(text) => {
                return Err(Error::invalid(format!(
                    "stray text '{}' in backup document",
                    text.trim()
                )));
            }
            XmlEvent::EndDocument => {
                return Err(Error::invalid("truncated backup document"));
            }
            _ => continue,
        }
    }
    expect_clean_end(&mut events)?;
    Ok(doc)
}

fn read_object<R: Read>(
    events: &mut EventReader<R>,
    attributes: Vec<OwnedAttribute>,
) -> Result<ObjectEntry, Error> {
    let mut oid = None;
    let mut access = None;
    let mut value_type = ValueType::None;
    let mut default_value = None;
    let mut volatile = false;
    let mut unit = false;
    let mut no_parent_dep = false;
    let mut substitution = false;

    for attribute in attributes {
        let value = attribute.value;
        match attribute.name.local_name.as_str() {
            "oid" => oid = Some(Oid::new(value).map_err(Error::Db)?),
            "access" => access = Some(Access::from_wire(&value).map_err(Error::Db)?),
            "type" => value_type = ValueType::from_wire(&value).map_err(Error::Db)?,
            "default" => default_value = Some(value),
            "volatile" => volatile = parse_bool("volatile", &value)?,
            "unit" => unit = parse_bool("unit", &value)?,
            "substitution" => substitution = parse_bool("substitution", &value)?,
            "parent-dep" => {
                no_parent_dep = match value.as_str() {
                    "no" => true,
                    "yes" => false,
                    other => {
                        return Err(Error::invalid(format!(
                            "attribute 'parent-dep' has value '{other}', expected 'yes' or 'no'"
                        )));
                    }
                }
            }
            other => {
                return Err(Error::invalid(format!(
                    "unknown attribute '{other}' on <object>"
                )));
            }
        }
    }

    let oid = oid.ok_or_else(|| Error::invalid("<object> entry without an oid"))?;
    let access =
        access.ok_or_else(|| Error::invalid(format!("<object oid=\"{oid}\"> has no access mode")))?;

    let mut def = ObjectDef::new(oid, value_type, access);
    def.default_value = default_value;
    def.volatile = volatile;
    def.unit = unit;
    def.no_parent_dep = no_parent_dep;
    def.substitution = substitution;

    let mut depends = Vec::new();
    loop {
        match events.next()? {
            XmlEvent::Whitespace(_) => continue,
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                if name.local_name != "depends" {
                    return Err(Error::invalid(format!(
                        "unexpected element <{}> under <object>",
                        name.local_name
                    )));
                }
                depends.push(read_depends(events, attributes)?);
            }
            XmlEvent::EndElement { .. } => break,
            XmlEvent::Characters(text) => {
                return Err(Error::invalid(format!(
                    "stray text '{}' under <object>",
                    text.trim()
                )));
            }
            XmlEvent::EndDocument => return Err(Error::invalid("truncated backup document")),
            _ => continue,
        }
    }
    Ok(ObjectEntry { def, depends })
}

fn read_depends<R: Read>(
    events: &mut EventReader<R>,
    attributes: Vec<OwnedAttribute>,
) -> Result<DependsEntry, Error> {
    let mut provider = None;
    let mut object_wide = false;
    for attribute in attributes {
        let value = attribute.value;
        match attribute.name.local_name.as_str() {
            "oid" => provider = Some(Oid::new(value).map_err(Error::Db)?),
            "scope" => {
                object_wide = match value.as_str() {
                    "object" => true,
                    "instance" => false,
                    other => {
                        return Err(Error::invalid(format!(
                            "attribute 'scope' has value '{other}', expected 'object' or 'instance'"
                        )));
                    }
                }
            }
            other => {
                return Err(Error::invalid(format!(
                    "unknown attribute '{other}' on <depends>"
                )));
            }
        }
    }
    let provider = provider.ok_or_else(|| Error::invalid("<depends> entry without an oid"))?;

    // a <depends> entry carries no content
    loop {
        match events.next()? {
            XmlEvent::Whitespace(_) => continue,
            XmlEvent::EndElement { .. } => break,
            XmlEvent::EndDocument => return Err(Error::invalid("truncated backup document")),
            _ => return Err(Error::invalid("<depends> entries have no content")),
        }
    }
    Ok(DependsEntry {
        provider,
        object_wide,
    })
}

fn read_instance<R: Read>(
    events: &mut EventReader<R>,
    attributes: Vec<OwnedAttribute>,
) -> Result<InstanceEntry, Error> {
    let mut oid = None;
    let mut value = None;
    for attribute in attributes {
        match attribute.name.local_name.as_str() {
            "oid" => oid = Some(Oid::new(attribute.value).map_err(Error::Db)?),
            "value" => value = Some(attribute.value),
            other => {
                return Err(Error::invalid(format!(
                    "unknown attribute '{other}' on <instance>"
                )));
            }
        }
    }
    let oid = oid.ok_or_else(|| Error::invalid("<instance> entry without an oid"))?;

    loop {
        match events.next()? {
            XmlEvent::Whitespace(_) => continue,
            XmlEvent::EndElement { .. } => break,
            XmlEvent::EndDocument => return Err(Error::invalid("truncated backup document")),
            _ => return Err(Error::invalid("<instance> entries have no content")),
        }
    }
    Ok(InstanceEntry { oid, value })
}

/// Reads the filter form: a list of subtree identifiers for partial
/// operations.
pub fn read_filters<R: Read>(input: R) -> Result<Vec<Oid>, Error> {
    let mut events = reader(input);
    skip_to_root(&mut events, "filters")?;

    let mut subtrees = Vec::new();
    loop {
        match events.next()? {
            XmlEvent::Whitespace(_) => continue,
            XmlEvent::StartElement { name, .. } => {
                if name.local_name != "subtree" {
                    return Err(Error::invalid(format!(
                        "unexpected element <{}> in filter document",
                        name.local_name
                    )));
                }
                let mut text = String::new();
                loop {
                    match events.next()? {
                        XmlEvent::Characters(chunk) => text.push_str(&chunk),
                        XmlEvent::Whitespace(_) => continue,
                        XmlEvent::EndElement { .. } => break,
                        XmlEvent::EndDocument => {
                            return Err(Error::invalid("truncated filter document"));
                        }
                        _ => return Err(Error::invalid("<subtree> entries hold only text")),
                    }
                }
                subtrees.push(Oid::new(text.trim()).map_err(Error::Db)?);
            }
            XmlEvent::EndElement { .. } => break,
            XmlEvent::Characters(text) => {
                return Err(Error::invalid(format!(
                    "stray text '{}' in filter document",
                    text.trim()
                )));
            }
            XmlEvent::EndDocument => return Err(Error::invalid("truncated filter document")),
            _ => continue,
        }
    }
    expect_clean_end(&mut events)?;
    Ok(subtrees)
}

/// Writes the backup form for the current live state.
///
/// The root object and instance stay implicit; volatile instances and the
/// agent subtree are left out, and an instance outside `subtrees` is
/// skipped without cutting off its descendants.
pub fn write_backup<W: Write>(
    db: &Database,
    subtrees: &[Oid],
    agent_subtree: &Oid,
    output: W,
) -> Result<(), Error> {
    let mut writer = EmitterConfig::new()
        .perform_indent(true)
        .create_writer(output);
    writer.write(Emit::start_element("backup"))?;
    for child in db.registry().children(db.registry().root()) {
        write_object(db.registry(), child, &mut writer)?;
    }
    for son in db.instances().sons(db.instances().root()) {
        write_instance(db, son, subtrees, agent_subtree, &mut writer)?;
    }
    writer.write(Emit::end_element())?;
    Ok(())
}

fn write_object<W: Write>(
    registry: &ObjectRegistry,
    id: ObjectId,
    writer: &mut EventWriter<W>,
) -> Result<(), Error> {
    let object = registry.get(id);
    let default_text = object.default_value.as_ref().map(|value| value.to_string());
    let has_parent_edge = object.depends().iter().any(|dep| dep.parent);

    let mut element = Emit::start_element("object")
        .attr("oid", object.oid.as_str())
        .attr("access", object.access.as_wire())
        .attr("type", object.value_type.as_wire());
    if let Some(text) = &default_text {
        element = element.attr("default", text);
    }
    if object.volatile {
        element = element.attr("volatile", "true");
    }
    if object.unit {
        element = element.attr("unit", "true");
    }
    if object.substitution {
        element = element.attr("substitution", "true");
    }
    if !has_parent_edge {
        element = element.attr("parent-dep", "no");
    }
    writer.write(element)?;

    // the implicit parent edge is re-derived on registration
    for dep in object.depends() {
        if dep.parent {
            continue;
        }
        let provider = registry.get(dep.provider);
        let mut entry = Emit::start_element("depends").attr("oid", provider.oid.as_str());
        if dep.scope == DepScope::Object {
            entry = entry.attr("scope", "object");
        }
        writer.write(entry)?;
        writer.write(Emit::end_element())?;
    }
    writer.write(Emit::end_element())?;

    for child in registry.children(id) {
        write_object(registry, child, writer)?;
    }
    Ok(())
}

fn write_instance<W: Write>(
    db: &Database,
    handle: Handle,
    subtrees: &[Oid],
    agent_subtree: &Oid,
    writer: &mut EventWriter<W>,
) -> Result<(), Error> {
    let Some(instance) = db.instances().get(handle) else {
        return Ok(());
    };
    // agents are mirrored here, not owned; their subtree stays out
    if agent_subtree.is_prefix_of(&instance.oid.object_oid()) {
        return Ok(());
    }
    let object = db.registry().get(instance.object);
    if !object.volatile && subtree_contains(subtrees, &instance.oid) {
        let value_text = instance.value.as_ref().map(|value| value.to_string());
        let mut element = Emit::start_element("instance").attr("oid", instance.oid.as_str());
        if let Some(text) = &value_text {
            element = element.attr("value", text);
        }
        writer.write(element)?;
        writer.write(Emit::end_element())?;
    }
    for son in db.instances().sons(handle) {
        write_instance(db, son, subtrees, agent_subtree, writer)?;
    }
    Ok(())
}
