// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Property and reference validators.
//!
//! Validation normalizes values in place: integers given as strings are converted and subnet
//! prefixes are rewritten to their network address.

use crate::errors::{ApiError, ApiResult};
use crate::registry::ResourceDesc;
use crate::schema::{Collection, ComplexType, PropDesc, PropType, SimpleType, is_falsy};
use ipnet::IpNet;
use serde_json::{Map, Value};
use std::net::IpAddr;
use std::str::FromStr;

fn check_simple(name: &str, ty: SimpleType, value: &mut Value) -> Result<(), String> {
    if value.is_null() {
        return Ok(());
    }
    match ty {
        SimpleType::Integer { min, max } => {
            let int = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            }
            .ok_or_else(|| format!("{name}: integer value expected instead of {value}"))?;
            let lo = min.unwrap_or(i64::MIN);
            let hi = max.unwrap_or(i64::MAX);
            if int < lo || int > hi {
                return Err(format!("{name}: value must be between {lo} and {hi}"));
            }
            *value = Value::from(int);
        }
        SimpleType::Boolean => {
            if !value.is_boolean() {
                return Err(format!("{name}: true/false expected instead of {value}"));
            }
        }
        SimpleType::Any => {}
        _ => {
            let Some(s) = value.as_str() else {
                return Err(format!("{name}: string value expected instead of {value}"));
            };
            match ty {
                SimpleType::Enum(allowed) if !allowed.contains(&s) => {
                    return Err(format!("{name}: value must be one of {allowed:?}"));
                }
                SimpleType::Uuid => {
                    id::parse_canonical(s).map_err(|e| format!("{name}: {e}"))?;
                }
                SimpleType::MacAddress => {
                    mac_address::MacAddress::from_str(s)
                        .map_err(|_| format!("{name}: invalid mac address {s}"))?;
                }
                SimpleType::IpAddress => {
                    IpAddr::from_str(s).map_err(|_| format!("{name}: invalid IP address {s}"))?;
                }
                SimpleType::Custom(check) => check(s)?,
                _ => {}
            }
        }
    }
    Ok(())
}

/// Normalize a `SubnetType` value to its network address.
fn check_subnet(subnet: &mut Value) -> Result<(), String> {
    let Some(obj) = subnet.as_object_mut() else {
        return Err("Subnet type is invalid".to_string());
    };
    let prefix = obj.get("ip_prefix").and_then(Value::as_str);
    let len = obj.get("ip_prefix_len").and_then(|v| match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    });
    let (Some(prefix), Some(len)) = (prefix, len) else {
        return Err("Subnet type is invalid".to_string());
    };
    let cidr = format!("{prefix}/{len}");
    let net = IpNet::from_str(&cidr).map_err(|_| format!("Subnet type '{cidr}' is invalid"))?;
    obj.insert(
        "ip_prefix".to_string(),
        Value::String(net.network().to_string()),
    );
    obj.insert("ip_prefix_len".to_string(), Value::from(net.prefix_len()));
    Ok(())
}

/// Active/standby pairs cannot cover more than a /24 (IPv4) or a /120 (IPv6).
fn check_allowed_address_pair(pair: &Value) -> Result<(), String> {
    if pair.get("address_mode").and_then(Value::as_str) != Some("active-standby") {
        return Ok(());
    }
    let ip = pair.get("ip");
    let prefix = ip
        .and_then(|ip| ip.get("ip_prefix"))
        .and_then(Value::as_str)
        .and_then(|p| IpAddr::from_str(p).ok());
    let len = ip
        .and_then(|ip| ip.get("ip_prefix_len"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    match prefix {
        Some(IpAddr::V6(_)) if len < 120 => {
            Err("IPv6 Prefix length lesser than 120 is not acceptable".to_string())
        }
        Some(IpAddr::V4(_)) if len < 24 => {
            Err("IPv4 Prefix length lesser than 24 is not acceptable".to_string())
        }
        _ => Ok(()),
    }
}

/// Validate a record against its complex type, recursively.
///
/// # Errors
/// Returns a message naming the offending field.
pub fn check_complex(ct: &ComplexType, value: &mut Value) -> Result<(), String> {
    let Some(obj) = value.as_object_mut() else {
        if value.is_null() {
            return Ok(());
        }
        return Err(format!("{} expects an object, got {value}", ct.name));
    };
    for (key, item) in obj.iter_mut() {
        let Some(field) = ct.field(key) else {
            return Err(format!("class {} does not have field {key}", ct.name));
        };
        if is_falsy(Some(item)) && !item.is_boolean() && !item.is_number() {
            continue;
        }
        check_typed(key, field.ty, item)?;
    }
    Ok(())
}

fn check_typed(name: &str, ty: PropType, value: &mut Value) -> Result<(), String> {
    match ty {
        PropType::Simple(simple) => check_simple(name, simple, value),
        PropType::Complex(ct) => check_complex_elem(ct, value),
        PropType::SimpleList(simple) => {
            let Some(items) = value.as_array_mut() else {
                return Err(format!(
                    "Field {name} must be a list. Received value: {value}"
                ));
            };
            items
                .iter_mut()
                .try_for_each(|item| check_simple(name, simple, item))
        }
        PropType::ComplexList(ct) => {
            let Some(items) = value.as_array_mut() else {
                return Err(format!(
                    "Field {name} must be a list. Received value: {value}"
                ));
            };
            items
                .iter_mut()
                .try_for_each(|item| check_complex_elem(ct, item))
        }
    }
}

fn check_complex_elem(ct: &ComplexType, value: &mut Value) -> Result<(), String> {
    match ct.name {
        "SubnetType" => check_subnet(value)?,
        "AllowedAddressPair" => check_allowed_address_pair(value)?,
        _ => {}
    }
    check_complex(ct, value)
}

/// Validate one element of a list or map property, as given to prop-collection-update.
///
/// # Errors
/// Returns a validation error if the element does not match the property type.
pub fn check_collection_element(desc: &PropDesc, value: &mut Value) -> ApiResult<()> {
    match desc.ty {
        PropType::Complex(ct) | PropType::ComplexList(ct) => check_complex_elem(ct, value),
        PropType::Simple(simple) | PropType::SimpleList(simple) => {
            check_simple(desc.name, simple, value)
        }
    }
    .map_err(|e| ApiError::bad_request(format!("Error validating property {}: {e}", desc.name)))
}

/// A whole list or map property: `{wrapper: [elem, ...]}`, each element checked on its own.
fn check_collection(desc: &PropDesc, wrapper: &str, value: &mut Value) -> ApiResult<()> {
    let Some(outer) = value.as_object_mut() else {
        return Err(ApiError::bad_request(format!(
            "Error in property {} value of {value} ",
            desc.name
        )));
    };
    if let Some(field) = outer.keys().find(|k| k.as_str() != wrapper) {
        return Err(ApiError::bad_request(format!(
            "Error validating property {}: unexpected field {field}",
            desc.name
        )));
    }
    match outer.get_mut(wrapper) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Array(items)) => items
            .iter_mut()
            .try_for_each(|item| check_collection_element(desc, item)),
        Some(other) => Err(ApiError::bad_request(format!(
            "Error validating property {}: {wrapper} must be a list. Received value: {other}",
            desc.name
        ))),
    }
}

/// Validate the properties present in a request body.
///
/// Missing required properties are only an error on create.
///
/// # Errors
/// Returns a validation error naming the first offending property.
pub fn validate_props(desc: &ResourceDesc, obj: &mut Map<String, Value>, create: bool) -> ApiResult<()> {
    for prop in &desc.props {
        let present = !is_falsy(obj.get(prop.name))
            || obj.get(prop.name).is_some_and(|v| v.is_boolean() || v.is_number());
        if !present {
            if create && prop.required {
                return Err(ApiError::bad_request(format!(
                    "{} property is missing",
                    prop.name
                )));
            }
            continue;
        }
        let Some(value) = obj.get_mut(prop.name) else {
            continue;
        };
        if let Collection::List { wrapper } | Collection::Map { wrapper, .. } = prop.collection {
            check_collection(prop, wrapper, value)?;
            continue;
        }
        match prop.ty {
            PropType::Simple(_) | PropType::SimpleList(_) => check_typed(prop.name, prop.ty, value)
                .map_err(|e| ApiError::bad_request(format!("Error validating property {e}")))?,
            PropType::Complex(ct) | PropType::ComplexList(ct) => {
                if !value.is_object() && !value.is_array() {
                    return Err(ApiError::bad_request(format!(
                        "Error in property {} type {} value of {value} ",
                        prop.name, ct.name
                    )));
                }
                let shown = value.to_string();
                check_typed(prop.name, prop.ty, value).map_err(|e| {
                    ApiError::bad_request(format!(
                        "Error validating property {} value {shown} {e}",
                        prop.name
                    ))
                })?;
            }
        }
    }
    Ok(())
}

/// Validate the edge attributes of every reference present in a request body.
///
/// # Errors
/// Returns a validation error naming the offending reference.
pub fn validate_refs(desc: &ResourceDesc, obj: &mut Map<String, Value>) -> ApiResult<()> {
    for field in &desc.refs {
        let Some(refs) = obj.get_mut(&field.field) else {
            continue;
        };
        if refs.is_null() {
            continue;
        }
        let Some(refs) = refs.as_array_mut() else {
            return Err(ApiError::bad_request(format!(
                "Bad Request, {} must be a list",
                field.field
            )));
        };
        let Some(attr) = field.desc.attr else {
            continue;
        };
        for reference in refs.iter_mut() {
            let shown = reference.to_string();
            if let Some(value) = reference.get_mut("attr") {
                check_complex_elem(attr, value).map_err(|e| {
                    ApiError::bad_request(format!(
                        "Error validating reference {} value {shown} {e}",
                        field.field
                    ))
                })?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::registry;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn integers_are_coerced_and_ranged() {
        let desc = registry().get("security-group").expect("Should succeed");
        let mut body = obj(json!({"configured_security_group_id": "42"}));
        validate_props(desc, &mut body, true).expect("Should succeed");
        assert_eq!(body["configured_security_group_id"], json!(42));

        let mut body = obj(json!({"configured_security_group_id": 9_000_000}));
        let err = validate_props(desc, &mut body, true).expect_err("Should fail");
        assert!(err.to_string().contains("value must be between 0 and 7999999"));
    }

    #[test]
    fn enums_and_booleans() {
        let desc = registry().get("virtual-network").expect("Should succeed");
        let mut body = obj(json!({"router_external": "yes"}));
        assert!(validate_props(desc, &mut body, true).is_err());
        let mut body = obj(json!({"virtual_network_properties": {"forwarding_mode": "l4"}}));
        assert!(validate_props(desc, &mut body, true).is_err());
        let mut body = obj(json!({"virtual_network_properties": {"forwarding_mode": "l2", "rpf": "enable"}}));
        assert!(validate_props(desc, &mut body, true).is_ok());
    }

    #[test]
    fn wrapped_collections_check_each_element() {
        let desc = registry().get("virtual-network").expect("Should succeed");
        let mut body = obj(json!({
            "annotations": {"key_value_pair": [{"key": "k", "value": "v"}]}
        }));
        validate_props(desc, &mut body, true).expect("Should succeed");

        let mut body = obj(json!({"annotations": {"key_value_pair": null}}));
        validate_props(desc, &mut body, false).expect("Should succeed");

        let mut body = obj(json!({
            "annotations": {"key_value_pair": [{"key": "k", "bogus": "v"}]}
        }));
        let err = validate_props(desc, &mut body, false).expect_err("Should fail");
        assert!(err.to_string().contains("does not have field bogus"));

        let mut body = obj(json!({"annotations": {"key_value_pair": {"key": "k"}}}));
        let err = validate_props(desc, &mut body, false).expect_err("Should fail");
        assert!(err.to_string().contains("must be a list"));

        let vmi = registry().get("virtual-machine-interface").expect("Should succeed");
        let mut body = obj(json!({
            "virtual_machine_interface_bindings": {
                "key_value_pair": [{"key": "host_id", "value": "compute-1"}]
            }
        }));
        validate_props(vmi, &mut body, false).expect("Should succeed");
    }

    #[test]
    fn unknown_complex_field_rejected() {
        let desc = registry().get("virtual-network").expect("Should succeed");
        let mut body = obj(json!({"virtual_network_properties": {"bogus": 1}}));
        let err = validate_props(desc, &mut body, false).expect_err("Should fail");
        assert!(err.to_string().contains("does not have field bogus"));
    }

    #[test]
    fn subnets_are_normalized() {
        let desc = registry().get("virtual-network").expect("Should succeed");
        let mut body = obj(json!({
            "network_ipam_refs": [{"to": ["d", "p", "ipam"], "attr": {"ipam_subnets": [
                {"subnet": {"ip_prefix": "10.1.2.3", "ip_prefix_len": 24}}
            ]}}]
        }));
        validate_refs(desc, &mut body).expect("Should succeed");
        assert_eq!(
            body["network_ipam_refs"][0]["attr"]["ipam_subnets"][0]["subnet"]["ip_prefix"],
            json!("10.1.2.0")
        );
        let mut body = obj(json!({
            "network_ipam_refs": [{"to": ["d", "p", "ipam"], "attr": {"ipam_subnets": [
                {"subnet": {"ip_prefix": "10.1.2.300", "ip_prefix_len": 24}}
            ]}}]
        }));
        assert!(validate_refs(desc, &mut body).is_err());
    }

    #[test]
    fn active_standby_pairs_need_narrow_prefixes() {
        let desc = registry()
            .get("virtual-machine-interface")
            .expect("Should succeed");
        let pair = |len: u8| {
            obj(json!({"virtual_machine_interface_allowed_address_pairs": {"allowed_address_pair": [
                {"ip": {"ip_prefix": "10.0.0.0", "ip_prefix_len": len}, "address_mode": "active-standby"}
            ]}}))
        };
        assert!(validate_props(desc, &mut pair(16), false).is_err());
        assert!(validate_props(desc, &mut pair(24), false).is_ok());
    }

    #[test]
    fn sub_interface_vlan_tag_range() {
        let desc = registry()
            .get("virtual-machine-interface")
            .expect("Should succeed");
        let mut body = obj(json!({"virtual_machine_interface_properties": {"sub_interface_vlan_tag": 4096}}));
        assert!(validate_props(desc, &mut body, false).is_err());
        let mut body = obj(json!({"virtual_machine_interface_properties": {"sub_interface_vlan_tag": 100}}));
        assert!(validate_props(desc, &mut body, false).is_ok());
    }

    #[test]
    fn required_on_create_only() {
        let desc = registry().get("service-template").expect("Should succeed");
        let mut body = Map::new();
        assert_eq!(
            validate_props(desc, &mut body, true),
            Err(ApiError::bad_request(
                "service_template_properties property is missing"
            ))
        );
        assert!(validate_props(desc, &mut body, false).is_ok());
    }
}
