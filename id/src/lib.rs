// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Resource identifiers.
//!
//! Every configuration object is keyed by a 128-bit [`Uuid`]. Identifiers supplied by clients must
//! be in canonical hyphenated form; [`parse_canonical`] is the single place enforcing that.
//!
//! [`Id<T>`] tags a [`Uuid`] with a compile-time type so that ids of cached adapter records (pods,
//! namespaces, services, ...) cannot be conflated with each other.

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

use core::fmt::{Debug, Formatter};
use std::cmp::Ordering;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::str::FromStr;
use thiserror::Error;
pub use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid UUID format: {0}")]
    NotCanonical(String),
}

/// Parse a client-supplied identifier. Only the 36-character hyphenated form is accepted.
///
/// # Errors
/// Returns [`IdError::NotCanonical`] for anything else, including simple (undashed) and braced forms.
pub fn parse_canonical(input: &str) -> Result<Uuid, IdError> {
    if input.len() != 36 {
        return Err(IdError::NotCanonical(input.to_string()));
    }
    Uuid::parse_str(input).map_err(|_| IdError::NotCanonical(input.to_string()))
}

/// Parse an identifier given with or without dashes, as tenant ids from identity services are.
///
/// # Errors
/// Returns [`IdError::NotCanonical`] when the input is neither form.
pub fn parse_lenient(input: &str) -> Result<Uuid, IdError> {
    match input.len() {
        32 | 36 => Uuid::parse_str(input).map_err(|_| IdError::NotCanonical(input.to_string())),
        _ => Err(IdError::NotCanonical(input.to_string())),
    }
}

/// The undashed rendering used for owner and tenant ids in sharing metadata.
#[must_use]
pub fn undashed(uuid: &Uuid) -> String {
    uuid.simple().to_string()
}

/// Namespace for ids derived from external natural keys.
pub const NAMESPACE_UUID: Uuid = Uuid::from_u128(0x6c4b_2a7e_91d3_4f58_a0c2_5d17_e3b9_4f21);

/// A [`Uuid`] tagged with the type it identifies.
#[repr(transparent)]
pub struct Id<T: ?Sized>(Uuid, PhantomData<T>);

impl<T: ?Sized> Copy for Id<T> {}

impl<T: ?Sized> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T: ?Sized> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: ?Sized> Eq for Id<T> {}

impl<T: ?Sized> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ?Sized> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl<T: ?Sized> Display for Id<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl<T: ?Sized> Debug for Id<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl<T: ?Sized> AsRef<Uuid> for Id<T> {
    fn as_ref(&self) -> &Uuid {
        &self.0
    }
}

impl<T: ?Sized> Id<T> {
    /// A fresh random (v4) id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4(), PhantomData)
    }

    /// Tag a [`Uuid`] received in a context where its type is known.
    #[must_use]
    pub const fn from_raw(uuid: Uuid) -> Self {
        Self(uuid, PhantomData)
    }

    #[must_use]
    pub const fn into_raw(self) -> Uuid {
        self.0
    }

    #[must_use]
    pub const fn as_raw(&self) -> &Uuid {
        &self.0
    }

    /// A stable id derived from a natural key. Equal keys always give equal ids.
    #[must_use]
    pub fn from_key(key: impl AsRef<[u8]>) -> Self {
        Self(Uuid::new_v5(&NAMESPACE_UUID, key.as_ref()), PhantomData)
    }
}

impl<T: ?Sized> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> From<Id<T>> for Uuid {
    fn from(value: Id<T>) -> Self {
        value.0
    }
}

impl<T: ?Sized> FromStr for Id<T> {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_canonical(s).map(Self::from_raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Pod;
    struct Namespace;

    #[test]
    fn canonical_form_only() {
        let id = "4f5b2d2a-8ab4-4d0b-bb9b-4b0a3c6a7f10";
        assert_eq!(parse_canonical(id).map(|u| u.to_string()), Ok(id.to_string()));
        assert!(parse_canonical("4f5b2d2a8ab44d0bbb9b4b0a3c6a7f10").is_err());
        assert!(parse_canonical("{4f5b2d2a-8ab4-4d0b-bb9b-4b0a3c6a7f10}").is_err());
        assert!(parse_canonical("not-a-uuid").is_err());
        assert!(parse_canonical("").is_err());
    }

    #[test]
    fn lenient_accepts_undashed() {
        let dashed = parse_lenient("4f5b2d2a-8ab4-4d0b-bb9b-4b0a3c6a7f10");
        let plain = parse_lenient("4f5b2d2a8ab44d0bbb9b4b0a3c6a7f10");
        assert_eq!(dashed, plain);
        let uuid = plain.expect("Should succeed");
        assert_eq!(undashed(&uuid), "4f5b2d2a8ab44d0bbb9b4b0a3c6a7f10");
    }

    #[test]
    fn keyed_ids_are_stable() {
        let a = Id::<Pod>::from_key("k8s:default:web-0");
        let b = Id::<Pod>::from_key("k8s:default:web-0");
        let c = Id::<Pod>::from_key("k8s:default:web-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        let ns = Id::<Namespace>::from_raw(a.into_raw());
        assert_eq!(ns.as_raw(), a.as_raw());
    }

    #[test]
    fn typed_parse_rejects_garbage() {
        assert!("nope".parse::<Id<Pod>>().is_err());
        let id = Id::<Pod>::new();
        assert_eq!(id.to_string().parse::<Id<Pod>>(), Ok(id));
    }
}
