// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Fully-qualified names.

use crate::errors::ApiError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// An ordered sequence of name segments locating a resource in the containment hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FqName(Vec<String>);

/// Characters the XML 1.0 character set does not allow.
fn is_illegal_xml(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}' | '\u{fffe}' | '\u{ffff}')
}

impl FqName {
    #[must_use]
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parse the `a:b:c` rendering. The last segment of names whose type permits it may
    /// carry ':' itself, so `depth` bounds the split.
    #[must_use]
    pub fn parse(input: &str, depth: Option<usize>) -> Self {
        match depth {
            Some(n) if n > 0 => Self::new(input.splitn(n, ':')),
            _ => Self::new(input.split(':')),
        }
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The last segment.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.last().map_or("", String::as_str)
    }

    /// The fq-name of the parent, empty for top-level resources.
    #[must_use]
    pub fn parent(&self) -> FqName {
        match self.0.split_last() {
            Some((_, rest)) => Self(rest.to_vec()),
            None => Self::default(),
        }
    }

    #[must_use]
    pub fn child(&self, name: impl Into<String>) -> FqName {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    #[must_use]
    pub fn starts_with(&self, prefix: &FqName) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Reject names whose last segment carries control characters or the ':' separator.
    ///
    /// # Errors
    /// Returns a validation error describing the offending name.
    pub fn check_name(&self, colon_allowed: bool) -> Result<(), ApiError> {
        if self.0.is_empty() || self.0.iter().any(String::is_empty) {
            return Err(ApiError::bad_request("Bad Request, no fq_name in POST body"));
        }
        let name = self.name();
        if name.chars().any(is_illegal_xml) {
            return Err(ApiError::bad_request(
                "Bad Request, name has illegal xml characters",
            ));
        }
        if !colon_allowed && name.contains(':') {
            return Err(ApiError::bad_request(
                "Bad Request, name has one of invalid chars {':'}",
            ));
        }
        Ok(())
    }
}

impl Display for FqName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(":"))
    }
}

impl From<Vec<String>> for FqName {
    fn from(value: Vec<String>) -> Self {
        Self(value)
    }
}

impl From<&[&str]> for FqName {
    fn from(value: &[&str]) -> Self {
        Self::new(value.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parent_and_child() {
        let fq = FqName::from(&["default-domain", "p1", "vnA"][..]);
        assert_eq!(fq.to_string(), "default-domain:p1:vnA");
        assert_eq!(fq.name(), "vnA");
        assert_eq!(fq.parent(), FqName::from(&["default-domain", "p1"][..]));
        assert_eq!(fq.parent().child("vnA"), fq);
        assert!(fq.starts_with(&fq.parent()));
    }

    #[test]
    fn name_checks() {
        assert!(FqName::new(["d", "p", "ok-name"]).check_name(false).is_ok());
        assert!(FqName::new(["d", "p", "bad:name"]).check_name(false).is_err());
        assert!(FqName::new(["target:64512:8000001"]).check_name(true).is_ok());
        assert!(FqName::new(["d", "p", "bell\u{7}"]).check_name(true).is_err());
        assert!(FqName::new(Vec::<String>::new()).check_name(false).is_err());
    }

    #[test]
    fn bounded_parse_keeps_colons_in_last_segment() {
        let fq = FqName::parse("target:64512:1", Some(1));
        assert_eq!(fq.segments(), &["target:64512:1".to_string()]);
        assert_eq!(FqName::parse("a:b:c", None).len(), 3);
    }
}
