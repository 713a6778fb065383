// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Static descriptors of the resource schema.
//!
//! Every resource type is described by a [`ResourceType`]: its parent types, properties and
//! references. Children and back-references are not declared; the [`crate::Registry`] derives them
//! by inverting parents and references. Complex property values are described by
//! [`ComplexType`]s, validated recursively by [`crate::validate`].

pub mod catalog;
pub mod complex;

use serde_json::Value;

/// Restrictions on scalar values.
#[derive(Debug, Clone, Copy)]
pub enum SimpleType {
    String,
    Integer { min: Option<i64>, max: Option<i64> },
    Boolean,
    Enum(&'static [&'static str]),
    Uuid,
    MacAddress,
    IpAddress,
    /// A string checked by a dedicated function.
    Custom(fn(&str) -> Result<(), String>),
    Any,
}

#[derive(Debug, Clone, Copy)]
pub enum PropType {
    Simple(SimpleType),
    Complex(&'static ComplexType),
    SimpleList(SimpleType),
    ComplexList(&'static ComplexType),
}

#[derive(Debug)]
pub struct FieldDesc {
    pub name: &'static str,
    pub ty: PropType,
}

/// A nested record type.
#[derive(Debug)]
pub struct ComplexType {
    pub name: &'static str,
    pub fields: &'static [FieldDesc],
}

impl ComplexType {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&'static FieldDesc> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Properties updatable element-wise with prop-collection-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    None,
    /// `{wrapper: [elem, ...]}` addressed by position.
    List { wrapper: &'static str },
    /// `{wrapper: [elem, ...]}` addressed by the `key` field of each element.
    Map {
        wrapper: &'static str,
        key: &'static str,
    },
}

#[derive(Debug)]
pub struct PropDesc {
    pub name: &'static str,
    pub ty: PropType,
    pub required: bool,
    pub collection: Collection,
}

#[derive(Debug)]
pub struct RefDesc {
    /// Resource type of the peer.
    pub to: &'static str,
    pub attr: Option<&'static ComplexType>,
    /// Edges created by the system rather than by clients; they never block deletion.
    pub derived: bool,
}

#[derive(Debug)]
pub struct ResourceType {
    /// Hyphenated name as used in URLs, e.g. `virtual-network`.
    pub name: &'static str,
    /// Allowed parent types. Empty means the resource sits directly under the root.
    pub parents: &'static [&'static str],
    pub props: &'static [PropDesc],
    pub refs: &'static [RefDesc],
    /// Child of its parent as a derived (system managed) child.
    pub derived_child: bool,
    /// Names of this type may contain ':'.
    pub colon_allowed: bool,
    /// Counted against project quota.
    pub quota: bool,
}

pub(crate) const fn prop(name: &'static str, ty: PropType) -> PropDesc {
    PropDesc {
        name,
        ty,
        required: false,
        collection: Collection::None,
    }
}

pub(crate) const fn required(name: &'static str, ty: PropType) -> PropDesc {
    PropDesc {
        name,
        ty,
        required: true,
        collection: Collection::None,
    }
}

pub(crate) const fn list_prop(
    name: &'static str,
    ty: &'static ComplexType,
    wrapper: &'static str,
) -> PropDesc {
    PropDesc {
        name,
        ty: PropType::Complex(ty),
        required: false,
        collection: Collection::List { wrapper },
    }
}

pub(crate) const fn map_prop(
    name: &'static str,
    ty: &'static ComplexType,
    wrapper: &'static str,
    key: &'static str,
) -> PropDesc {
    PropDesc {
        name,
        ty: PropType::Complex(ty),
        required: false,
        collection: Collection::Map { wrapper, key },
    }
}

pub(crate) const fn field(name: &'static str, ty: PropType) -> FieldDesc {
    FieldDesc { name, ty }
}

pub(crate) const fn to(target: &'static str) -> RefDesc {
    RefDesc {
        to: target,
        attr: None,
        derived: false,
    }
}

pub(crate) const fn to_with(target: &'static str, attr: &'static ComplexType) -> RefDesc {
    RefDesc {
        to: target,
        attr: Some(attr),
        derived: false,
    }
}

pub(crate) const fn derived_to(target: &'static str) -> RefDesc {
    RefDesc {
        to: target,
        attr: None,
        derived: true,
    }
}

pub(crate) const STR: PropType = PropType::Simple(SimpleType::String);
pub(crate) const INT: PropType = PropType::Simple(SimpleType::Integer {
    min: None,
    max: None,
});
pub(crate) const BOOL: PropType = PropType::Simple(SimpleType::Boolean);
pub(crate) const UUID: PropType = PropType::Simple(SimpleType::Uuid);
pub(crate) const IP: PropType = PropType::Simple(SimpleType::IpAddress);
pub(crate) const MAC: PropType = PropType::Simple(SimpleType::MacAddress);
pub(crate) const ANY: PropType = PropType::Simple(SimpleType::Any);
pub(crate) const STR_LIST: PropType = PropType::SimpleList(SimpleType::String);
pub(crate) const ACCESS: PropType = PropType::Simple(SimpleType::Integer {
    min: Some(0),
    max: Some(7),
});

pub(crate) const fn int_range(min: i64, max: i64) -> PropType {
    PropType::Simple(SimpleType::Integer {
        min: Some(min),
        max: Some(max),
    })
}

pub(crate) const fn one_of(values: &'static [&'static str]) -> PropType {
    PropType::Simple(SimpleType::Enum(values))
}

pub(crate) const fn complex(ty: &'static ComplexType) -> PropType {
    PropType::Complex(ty)
}

/// JSON value helpers shared by hooks and adapters.
#[must_use]
pub fn is_falsy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => !b,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(Value::Number(n)) => n.as_i64() == Some(0) || n.as_u64() == Some(0),
    }
}
