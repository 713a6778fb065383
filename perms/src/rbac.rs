// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Role based access rules, as held in api-access-list resources.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Crud {
    #[strum(serialize = "C")]
    Create,
    #[strum(serialize = "R")]
    Read,
    #[strum(serialize = "U")]
    Update,
    #[strum(serialize = "D")]
    Delete,
}

impl Crud {
    fn letter(self) -> char {
        match self {
            Crud::Create => 'C',
            Crud::Read => 'R',
            Crud::Update => 'U',
            Crud::Delete => 'D',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbacPerm {
    pub role_name: String,
    pub role_crud: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbacRule {
    pub rule_object: String,
    #[serde(default)]
    pub rule_field: String,
    #[serde(default)]
    pub rule_perms: Vec<RbacPerm>,
}

impl RbacRule {
    fn new(object: &str, crud: &str) -> Self {
        Self {
            rule_object: object.to_string(),
            rule_field: String::new(),
            rule_perms: vec![RbacPerm {
                role_name: "*".to_string(),
                role_crud: crud.to_string(),
            }],
        }
    }

    /// Rules of an `api_access_list_entries` value.
    #[must_use]
    pub fn from_entries(entries: &Value) -> Vec<RbacRule> {
        entries
            .get("rbac_rule")
            .and_then(|r| serde_json::from_value(r.clone()).ok())
            .unwrap_or_default()
    }

    fn object_matches(&self, object: &str) -> bool {
        self.rule_object == "*"
            || self.rule_object == object
            || self.rule_object.replace('_', "-") == object.replace('_', "-")
    }

    fn field_matches(&self, fields: &[&str]) -> bool {
        self.rule_field.is_empty()
            || self.rule_field == "*"
            || fields.contains(&self.rule_field.as_str())
    }
}

/// Rules installed when role based access is first enabled.
#[must_use]
pub fn default_rules() -> Vec<RbacRule> {
    vec![
        RbacRule::new("fqname-to-id", "CRUD"),
        RbacRule::new("id-to-fqname", "CRUD"),
        RbacRule::new("useragent-kv", "CRUD"),
        RbacRule::new("documentation", "R"),
        RbacRule::new("/", "R"),
    ]
}

/// Add the `wanted` rules missing from `current`. Existing rules are never removed or narrowed.
/// Returns whether anything was added.
pub fn merge_rules(current: &mut Vec<RbacRule>, wanted: &[RbacRule]) -> bool {
    let mut added = false;
    for rule in wanted {
        if !current.contains(rule) {
            current.push(rule.clone());
            added = true;
        }
    }
    added
}

pub(crate) fn rbac_allowed(
    rules: &[RbacRule],
    roles: &[String],
    object: &str,
    fields: &[&str],
    op: Crud,
) -> bool {
    rules
        .iter()
        .filter(|r| r.object_matches(object) && r.field_matches(fields))
        .flat_map(|r| r.rule_perms.iter())
        .any(|p| {
            (p.role_name == "*" || roles.iter().any(|r| r.eq_ignore_ascii_case(&p.role_name)))
                && p.role_crud.contains(op.letter())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn rules_match_object_role_and_op() {
        let mut rules = default_rules();
        rules.extend(RbacRule::from_entries(&json!({"rbac_rule": [
            {"rule_object": "virtual-network", "rule_field": "", "rule_perms": [
                {"role_name": "member", "role_crud": "CRUD"}]},
            {"rule_object": "*", "rule_field": "", "rule_perms": [
                {"role_name": "reader", "role_crud": "R"}]},
        ]})));
        let member = vec!["Member".to_string()];
        let reader = vec!["reader".to_string()];
        assert!(rbac_allowed(&rules, &member, "virtual_network", &[], Crud::Create));
        assert!(!rbac_allowed(&rules, &member, "project", &[], Crud::Read));
        assert!(rbac_allowed(&rules, &reader, "project", &[], Crud::Read));
        assert!(!rbac_allowed(&rules, &reader, "project", &[], Crud::Delete));
        assert!(rbac_allowed(&rules, &[], "fqname-to-id", &[], Crud::Create));
    }

    #[test]
    fn merging_only_adds() {
        let mut current = vec![RbacRule::new("project", "R")];
        assert!(merge_rules(&mut current, &default_rules()));
        assert_eq!(current.len(), 6);
        assert!(!merge_rules(&mut current, &default_rules()));
        assert_eq!(current[0], RbacRule::new("project", "R"));
    }
}
