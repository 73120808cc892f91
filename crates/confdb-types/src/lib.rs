//! Core types shared by every confdb crate.
//!
//! This crate defines the object identifier algebra ([`Oid`]), the typed
//! value codec ([`Value`] / [`ValueType`]) and the error type carried by the
//! database message surface.

pub mod error;
pub mod oid;
pub mod value;

pub use error::Error;
pub use oid::Oid;
pub use value::{Value, ValueType};
