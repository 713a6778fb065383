// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The request envelope posted by the Neutron plugin: `{context, data}`.

use crate::errors::{NeutronError, NeutronResult};
use id::Uuid;
use mgmt::RequestContext;
use perms::Identity;
use serde::Deserialize;
use serde_json::{Map, Value};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    #[serde(rename = "READALL")]
    #[strum(serialize = "READALL")]
    ReadAll,
    #[serde(rename = "READCOUNT")]
    #[strum(serialize = "READCOUNT")]
    ReadCount,
    #[serde(rename = "ADDINTERFACE")]
    #[strum(serialize = "ADDINTERFACE")]
    AddInterface,
    #[serde(rename = "DELINTERFACE")]
    #[strum(serialize = "DELINTERFACE")]
    DelInterface,
}

/// Resources served under `/neutron/{resource}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Resource {
    Network,
    Subnet,
    Port,
    Router,
    #[strum(serialize = "floatingip")]
    FloatingIp,
    SecurityGroup,
    SecurityGroupRule,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NeutronContext {
    pub operation: Operation,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestData {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub resource: Map<String, Value>,
    #[serde(default)]
    pub filters: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NeutronRequest {
    pub context: NeutronContext,
    #[serde(default)]
    pub data: RequestData,
}

fn unparsable() -> NeutronError {
    NeutronError::bad_request("request", "Unable to parse request data")
}

impl NeutronRequest {
    /// Parse a request body. `tenant` and `tenant_id` must agree when both are given; either
    /// one fills the other.
    pub fn parse(body: &[u8]) -> NeutronResult<Self> {
        let mut req: NeutronRequest = serde_json::from_slice(body).map_err(|_| unparsable())?;
        let ctx = &mut req.context;
        match (&ctx.tenant_id, &ctx.tenant) {
            (Some(a), Some(b)) if a != b => return Err(unparsable()),
            (Some(a), None) => ctx.tenant = Some(a.clone()),
            (None, Some(b)) => ctx.tenant_id = Some(b.clone()),
            _ => {}
        }
        Ok(req)
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        self.context.operation
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.context.is_admin
    }

    /// The caller's tenant, dashed.
    #[must_use]
    pub fn tenant(&self) -> Option<Uuid> {
        self.context
            .tenant_id
            .as_deref()
            .and_then(|t| id::parse_lenient(t).ok())
    }

    /// The id the operation targets.
    pub fn id(&self) -> NeutronResult<Uuid> {
        let text = self
            .data
            .id
            .as_deref()
            .ok_or_else(|| NeutronError::bad_request("request", "id is required"))?;
        id::parse_lenient(text).map_err(|_| NeutronError::NotFound {
            msg: format!("{text} could not be found"),
        })
    }

    /// The raw id string, for error messages.
    #[must_use]
    pub fn id_str(&self) -> String {
        self.data.id.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn resource(&self) -> &Map<String, Value> {
        &self.data.resource
    }

    #[must_use]
    pub fn filters(&self) -> Filters<'_> {
        Filters(&self.data.filters)
    }

    /// The context core calls run with: system privileges, the caller's tenant as owner.
    #[must_use]
    pub fn core_ctx(&self) -> RequestContext {
        let mut identity = Identity {
            user_id: self.context.user_id.clone(),
            roles: self.context.roles.clone(),
            ..Identity::default()
        };
        if self.context.is_admin && !identity.has_role("admin") {
            identity.roles.push("admin".to_string());
        }
        if let Some(tenant) = self.context.tenant_id.as_deref() {
            identity = identity.with_project_id(tenant);
        }
        let ctx = RequestContext::new(identity);
        let ctx = match self.context.request_id.as_deref() {
            Some(request_id) => ctx.with_request_id(request_id),
            None => ctx,
        };
        ctx.as_internal()
    }
}

/// List filters: every key maps to a list of accepted values, or a single value.
#[derive(Debug, Clone, Copy)]
pub struct Filters<'a>(&'a Map<String, Value>);

fn same(have: &Value, want: &Value) -> bool {
    match (have, want) {
        (Value::String(h), Value::String(w)) => h == w || h.replace('-', "") == w.replace('-', ""),
        (Value::Bool(h), Value::String(w)) => w.eq_ignore_ascii_case(&h.to_string()),
        _ => have == want,
    }
}

impl<'a> Filters<'a> {
    #[must_use]
    pub fn values(&self, key: &str) -> Vec<&'a Value> {
        match self.0.get(key) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().collect(),
            Some(one) => vec![one],
        }
    }

    #[must_use]
    pub fn strings(&self, key: &str) -> Vec<String> {
        self.values(key)
            .into_iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        !self.values(key).is_empty()
    }

    /// Whether `have` passes the filter on `key`. Absent filters pass everything.
    #[must_use]
    pub fn accepts(&self, key: &str, have: &Value) -> bool {
        let wanted = self.values(key);
        wanted.is_empty() || wanted.iter().any(|w| same(have, w))
    }

    /// Whether a rendered Neutron resource passes every filter given as a plain field.
    #[must_use]
    pub fn accepts_all(&self, item: &Map<String, Value>, keys: &[&str]) -> bool {
        keys.iter()
            .all(|key| self.accepts(key, item.get(*key).unwrap_or(&Value::Null)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> NeutronResult<NeutronRequest> {
        NeutronRequest::parse(v.to_string().as_bytes())
    }

    #[test]
    fn tenant_fields_fill_each_other() {
        let req = parse(json!({
            "context": {"operation": "READALL", "tenant": "0123456789abcdef0123456789abcdef"},
            "data": {}
        }))
        .unwrap();
        assert_eq!(req.operation(), Operation::ReadAll);
        assert_eq!(
            req.context.tenant_id.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
        assert!(req.tenant().is_some());
    }

    #[test]
    fn tenant_mismatch_is_refused() {
        let err = parse(json!({
            "context": {"operation": "CREATE", "tenant": "a", "tenant_id": "b"},
            "data": {}
        }))
        .unwrap_err();
        assert_eq!(err.status(), 400);
        assert!(err.to_string().contains("Unable to parse request data"));
    }

    #[test]
    fn unknown_operation_is_refused() {
        assert!(parse(json!({"context": {"operation": "FROB"}})).is_err());
    }

    #[test]
    fn resources_parse_from_path() {
        assert_eq!("floatingip".parse::<Resource>().unwrap(), Resource::FloatingIp);
        assert_eq!(
            "security_group_rule".parse::<Resource>().unwrap(),
            Resource::SecurityGroupRule
        );
        assert!("loadbalancer".parse::<Resource>().is_err());
    }

    #[test]
    fn filters_accept_lists_and_scalars() {
        let filters = json!({"name": ["a", "b"], "shared": [true], "tenant_id": "ab-cd"});
        let filters = Filters(filters.as_object().unwrap());
        assert!(filters.accepts("name", &json!("b")));
        assert!(!filters.accepts("name", &json!("c")));
        assert!(filters.accepts("shared", &json!(true)));
        assert!(filters.accepts("tenant_id", &json!("abcd")));
        assert!(filters.accepts("missing", &json!("anything")));
    }
}
