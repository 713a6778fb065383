// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Process-wide table of resource types.
//!
//! The table is built once from the static catalog. Children and back-references are derived
//! here: a child field exists on every allowed parent of a type, and a back-reference field
//! exists on every target of a reference.

use crate::errors::{ApiError, ApiResult};
use crate::fqname::FqName;
use crate::schema::catalog::{CATALOG, COMMON_PROPS, CONFIG_ROOT};
use crate::schema::{PropDesc, RefDesc, ResourceType};
use ordermap::OrderMap;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

/// Types whose instances get a `default-<type>` child created with their parent.
pub const DEFAULT_CHILD_TYPES: &[&str] = &[
    "namespace",
    "project",
    "virtual-network",
    "network-ipam",
];

#[must_use]
pub fn object_type(resource_type: &str) -> String {
    resource_type.replace('-', "_")
}

#[derive(Debug)]
pub struct RefField {
    /// JSON field holding the references, e.g. `network_ipam_refs`.
    pub field: String,
    pub desc: &'static RefDesc,
}

#[derive(Debug)]
pub struct ChildField {
    /// JSON field holding the children, e.g. `virtual_networks`.
    pub field: String,
    pub child_type: &'static str,
    pub derived: bool,
}

#[derive(Debug)]
pub struct BackrefField {
    /// JSON field holding the back-references, e.g. `virtual_machine_interface_back_refs`.
    pub field: String,
    pub from_type: &'static str,
    pub derived: bool,
}

/// Everything the server knows about one resource type.
#[derive(Debug)]
pub struct ResourceDesc {
    pub ty: &'static ResourceType,
    pub object_type: String,
    pub plural: String,
    pub props: Vec<&'static PropDesc>,
    pub refs: Vec<RefField>,
    pub children: Vec<ChildField>,
    pub backrefs: Vec<BackrefField>,
}

impl ResourceDesc {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.ty.name
    }
    #[must_use]
    pub fn prop(&self, name: &str) -> Option<&'static PropDesc> {
        self.props.iter().copied().find(|p| p.name == name)
    }
    #[must_use]
    pub fn ref_to(&self, target: &str) -> Option<&RefField> {
        self.refs.iter().find(|r| r.desc.to == target)
    }
    #[must_use]
    pub fn ref_field(&self, field: &str) -> Option<&RefField> {
        self.refs.iter().find(|r| r.field == field)
    }
    #[must_use]
    pub fn child(&self, child_type: &str) -> Option<&ChildField> {
        self.children.iter().find(|c| c.child_type == child_type)
    }
    #[must_use]
    pub fn backref_from(&self, from_type: &str) -> Option<&BackrefField> {
        self.backrefs.iter().find(|b| b.from_type == from_type)
    }
    /// Real parent types, without the root pseudo type.
    pub fn parent_types(&self) -> impl Iterator<Item = &'static str> {
        self.ty.parents.iter().copied().filter(|p| *p != CONFIG_ROOT)
    }
    /// Whether an instance may sit directly under the root.
    #[must_use]
    pub fn root_allowed(&self) -> bool {
        self.ty.parents.is_empty() || self.ty.parents.contains(&CONFIG_ROOT)
    }
    /// Whether the type counts against project quota.
    #[must_use]
    pub fn quota_tracked(&self) -> bool {
        self.ty.quota
    }
    #[must_use]
    pub fn has_default_child(&self) -> bool {
        DEFAULT_CHILD_TYPES.contains(&self.ty.name)
    }

    /// Decide the parent type of a new instance from an optional `parent_type` and its fq-name.
    ///
    /// Returns `None` for instances placed under the root.
    ///
    /// # Errors
    /// Fails if the requested parent is not allowed or if the parent cannot be inferred.
    pub fn resolve_parent_type(
        &self,
        requested: Option<&str>,
        fq_name: &FqName,
    ) -> ApiResult<Option<&'static str>> {
        let allowed: Vec<&'static str> = self.ty.parents.to_vec();
        match requested {
            Some(req) => {
                let req = req.replace('_', "-");
                if req == CONFIG_ROOT && self.root_allowed() {
                    return Ok(None);
                }
                self.parent_types()
                    .find(|p| *p == req)
                    .map(Some)
                    .ok_or_else(|| {
                        ApiError::bad_request(format!(
                            "Invalid parent type: {req}. Allowed types: {allowed:?}"
                        ))
                    })
            }
            None => {
                let parents: Vec<&'static str> = self.parent_types().collect();
                match (parents.as_slice(), self.root_allowed()) {
                    ([], _) => Ok(None),
                    ([single], false) => Ok(Some(*single)),
                    (_, true) if fq_name.len() <= 1 => Ok(None),
                    ([single], true) => Ok(Some(*single)),
                    _ => Err(ApiError::bad_request(format!(
                        "Missing parent type: None. Allowed types: {allowed:?}"
                    ))),
                }
            }
        }
    }
}

/// The registry of all resource types.
pub struct Registry {
    types: OrderMap<&'static str, ResourceDesc>,
    by_plural: HashMap<String, &'static str>,
    by_object_type: HashMap<String, &'static str>,
}

impl Registry {
    fn build(catalog: &'static [ResourceType]) -> Self {
        let mut types = OrderMap::new();
        for ty in catalog {
            let refs = ty
                .refs
                .iter()
                .map(|desc| RefField {
                    field: format!("{}_refs", object_type(desc.to)),
                    desc,
                })
                .collect();
            let props = COMMON_PROPS.iter().chain(ty.props.iter()).collect();
            types.insert(
                ty.name,
                ResourceDesc {
                    ty,
                    object_type: object_type(ty.name),
                    plural: format!("{}s", ty.name),
                    props,
                    refs,
                    children: Vec::new(),
                    backrefs: Vec::new(),
                },
            );
        }
        for ty in catalog {
            for parent in ty.parents {
                if let Some(parent) = types.get_mut(parent) {
                    parent.children.push(ChildField {
                        field: format!("{}s", object_type(ty.name)),
                        child_type: ty.name,
                        derived: ty.derived_child,
                    });
                }
            }
            for desc in ty.refs {
                if let Some(target) = types.get_mut(desc.to) {
                    target.backrefs.push(BackrefField {
                        field: format!("{}_back_refs", object_type(ty.name)),
                        from_type: ty.name,
                        derived: desc.derived,
                    });
                }
            }
        }
        let by_plural = types
            .values()
            .map(|d| (d.plural.clone(), d.ty.name))
            .collect();
        let by_object_type = types
            .values()
            .map(|d| (d.object_type.clone(), d.ty.name))
            .collect();
        debug!("Resource registry holds {} types", types.len());
        Self {
            types,
            by_plural,
            by_object_type,
        }
    }

    /// Look up a type by its hyphenated name.
    ///
    /// # Errors
    /// Returns a 404 if the type is unknown.
    pub fn get(&self, resource_type: &str) -> ApiResult<&ResourceDesc> {
        self.lookup(resource_type)
            .ok_or_else(|| ApiError::NotFound(format!("Unknown resource type {resource_type}")))
    }

    /// Look up a type given either its hyphenated or underscored name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&ResourceDesc> {
        self.types.get(name).or_else(|| {
            self.by_object_type
                .get(name)
                .and_then(|name| self.types.get(name))
        })
    }

    #[must_use]
    pub fn from_plural(&self, plural: &str) -> Option<&ResourceDesc> {
        self.by_plural
            .get(plural)
            .and_then(|name| self.types.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceDesc> {
        self.types.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The process-wide registry.
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry::build(CATALOG))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn children_and_backrefs_are_inverted() {
        let reg = registry();
        let vn = reg.get("virtual-network").expect("Should succeed");
        let ri = vn.child("routing-instance").expect("Should succeed");
        assert_eq!(ri.field, "routing_instances");
        assert!(ri.derived);
        let back = vn
            .backref_from("virtual-machine-interface")
            .expect("Should succeed");
        assert_eq!(back.field, "virtual_machine_interface_back_refs");
        assert!(!back.derived);
        let ipam = vn.ref_to("network-ipam").expect("Should succeed");
        assert_eq!(ipam.field, "network_ipam_refs");
        assert!(ipam.desc.attr.is_some());
    }

    #[test]
    fn names_and_plurals() {
        let reg = registry();
        assert_eq!(
            reg.from_plural("virtual-networks").map(ResourceDesc::name),
            Some("virtual-network")
        );
        assert_eq!(
            reg.lookup("virtual_machine_interface").map(ResourceDesc::name),
            Some("virtual-machine-interface")
        );
        assert!(reg.get("bogus").is_err());
        let vn = reg.get("virtual-network").expect("Should succeed");
        assert!(vn.prop("id_perms").is_some());
        assert!(vn.prop("perms2").is_some());
        assert!(vn.has_default_child());
    }

    #[test]
    fn parent_resolution() {
        let reg = registry();
        let vn = reg.get("virtual-network").expect("Should succeed");
        let fq = FqName::from(&["d", "p", "vn"][..]);
        assert_eq!(vn.resolve_parent_type(None, &fq), Ok(Some("project")));
        assert_eq!(
            vn.resolve_parent_type(Some("project"), &fq),
            Ok(Some("project"))
        );
        assert!(vn.resolve_parent_type(Some("domain"), &fq).is_err());

        let tag = reg.get("tag").expect("Should succeed");
        let global = FqName::from(&["application=web"][..]);
        assert_eq!(tag.resolve_parent_type(None, &global), Ok(None));
        let scoped = FqName::from(&["d", "p", "application=web"][..]);
        assert_eq!(tag.resolve_parent_type(None, &scoped), Ok(Some("project")));

        let domain = reg.get("domain").expect("Should succeed");
        assert_eq!(
            domain.resolve_parent_type(None, &FqName::from(&["d"][..])),
            Ok(None)
        );

        let vmi = reg
            .get("virtual-machine-interface")
            .expect("Should succeed");
        let err = vmi
            .resolve_parent_type(None, &fq)
            .expect_err("Should fail");
        assert!(err.to_string().contains("Missing parent type"));
    }
}
