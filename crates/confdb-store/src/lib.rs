//! The database layer of confdb: object schema and live instance mirror.
//!
//! The [`ObjectRegistry`] holds the immutable schema of object classes, the
//! [`InstanceStore`] the live set of instances, and [`Database`] ties the two
//! together behind the message surface ([`Bus`]) through which every
//! mutation travels.

/// The live instance arena and its handles.
pub mod instance;
/// The message surface and the database facade behind it.
pub mod message;
/// The object class registry and its dependency graph.
pub mod object;

pub use instance::{Handle, Instance, InstanceStore};
pub use message::{Bus, Database, Message};
pub use object::{Access, DepScope, Dependency, Object, ObjectDef, ObjectId, ObjectRegistry};
