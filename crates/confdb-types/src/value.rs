use std::fmt;
use std::net::IpAddr;

use crate::error::Error;

/// Value type an object declares for its instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Instances carry no value.
    None,
    /// Signed 32-bit integer.
    Int,
    /// Free-form text.
    String,
    /// IPv4 or IPv6 address.
    Address,
    /// No declared type; values are neither checked nor compared.
    Unspecified,
}

impl ValueType {
    /// Parses the wire name of a value type.
    pub fn from_wire(name: &str) -> Result<Self, Error> {
        match name {
            "none" => Ok(ValueType::None),
            "int" => Ok(ValueType::Int),
            "string" => Ok(ValueType::String),
            "address" => Ok(ValueType::Address),
            "unspecified" => Ok(ValueType::Unspecified),
            other => Err(Error::Invalid(format!("unknown value type '{other}'"))),
        }
    }

    /// The wire name of this value type.
    pub fn as_wire(&self) -> &'static str {
        match self {
            ValueType::None => "none",
            ValueType::Int => "int",
            ValueType::String => "string",
            ValueType::Address => "address",
            ValueType::Unspecified => "unspecified",
        }
    }

    /// Whether instances of this type carry no comparable value.
    pub fn is_valueless(&self) -> bool {
        matches!(self, ValueType::None | ValueType::Unspecified)
    }

    /// Parses a textual value under this type.
    pub fn parse(&self, text: &str) -> Result<Value, Error> {
        match self {
            ValueType::None => Err(Error::Invalid(format!(
                "value '{text}' given for a valueless type"
            ))),
            ValueType::Int => text
                .parse::<i32>()
                .map(Value::Int)
                .map_err(|err| Error::Invalid(format!("bad integer '{text}': {err}"))),
            ValueType::Address => text
                .parse::<IpAddr>()
                .map(Value::Address)
                .map_err(|err| Error::Invalid(format!("bad address '{text}': {err}"))),
            // Unspecified values are kept verbatim; nothing compares them.
            ValueType::String | ValueType::Unspecified => {
                Ok(Value::String(text.to_owned()))
            }
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// A typed configuration value.
///
/// Equality is the codec's value comparison; `Display` is its
/// stringification. Dropping a value releases whatever it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i32),
    String(String),
    Address(IpAddr),
}

impl Value {
    /// The declared type this value satisfies.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::String(_) => ValueType::String,
            Value::Address(_) => ValueType::Address,
        }
    }

    /// Whether this value is acceptable for an object of type `vtype`.
    pub fn matches(&self, vtype: ValueType) -> bool {
        match vtype {
            ValueType::None => false,
            ValueType::Unspecified => true,
            other => self.value_type() == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::Address(v) => write!(f, "{v}"),
        }
    }
}
