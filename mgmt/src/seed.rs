// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Resources every cluster starts with.
//!
//! Each step looks the resource up by fq-name first, so running the seed again converges
//! instead of failing.

use crate::context::RequestContext;
use crate::hooks::{IP_FABRIC_VN, LINK_LOCAL_VN, PREDEFINED_TAG_TYPES};
use crate::server::ApiServer;
use config::{ApiResult, FqName};
use id::Uuid;
use perms::{PERMS_R, PERMS_X, Perms2, RbacRule, default_rules, merge_rules};
use serde_json::{Map, Value, json};
use store::{ReadOptions, RefOp};
use tracing::{debug, info, warn};

use tracectl::trace_target;
trace_target!("seed", LevelFilter::INFO, &["pipeline"]);

pub const GLOBAL_SYSTEM_CONFIG: &[&str] = &["default-global-system-config"];
pub const DEFAULT_PROJECT: &[&str] = &["default-domain", "default-project"];
pub const DEFAULT_IPAM: &[&str] = &["default-domain", "default-project", "default-network-ipam"];
pub const DEFAULT_API_ACCESS_LIST: &[&str] =
    &["default-global-system-config", "default-api-access-list"];

fn body(fq: &[&str], parent_type: Option<&str>, props: Value) -> Map<String, Value> {
    let mut out = match props {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    out.insert("fq_name".into(), json!(fq));
    if let Some(parent_type) = parent_type {
        out.insert("parent_type".into(), json!(parent_type));
    }
    out
}

async fn ensure(
    api: &ApiServer,
    ctx: &RequestContext,
    resource_type: &'static str,
    fq: &[&str],
    parent_type: Option<&str>,
    props: Value,
) -> ApiResult<Uuid> {
    let uuid = api
        .get_or_create(ctx, resource_type, body(fq, parent_type, props))
        .await?;
    debug!("Seeded {resource_type} {}", FqName::from(fq));
    Ok(uuid)
}

/// Plant the default resources. Safe to run on every start.
pub async fn run(api: &ApiServer) -> ApiResult<()> {
    let ctx = RequestContext::internal().with_request_id("seed");
    ensure(
        api,
        &ctx,
        "global-system-config",
        GLOBAL_SYSTEM_CONFIG,
        None,
        json!({ "autonomous_system": crate::hooks::DEFAULT_ASN }),
    )
    .await?;
    let gvc = ensure(
        api,
        &ctx,
        "global-vrouter-config",
        &["default-global-system-config", "default-global-vrouter-config"],
        Some("global-system-config"),
        json!({}),
    )
    .await?;
    ensure(api, &ctx, "domain", &["default-domain"], None, json!({})).await?;
    ensure(api, &ctx, "project", DEFAULT_PROJECT, Some("domain"), json!({})).await?;

    let ipam = ensure(api, &ctx, "network-ipam", DEFAULT_IPAM, Some("project"), json!({})).await?;
    share_globally(api, &ipam)?;
    ensure(
        api,
        &ctx,
        "virtual-network",
        &["default-domain", "default-project", "default-virtual-network"],
        Some("project"),
        json!({}),
    )
    .await?;
    ensure(
        api,
        &ctx,
        "virtual-network",
        IP_FABRIC_VN,
        Some("project"),
        json!({ "is_provider_network": true }),
    )
    .await?;
    ensure(api, &ctx, "virtual-network", LINK_LOCAL_VN, Some("project"), json!({})).await?;

    ensure(
        api,
        &ctx,
        "policy-management",
        &["default-policy-management"],
        None,
        json!({}),
    )
    .await?;
    let aps = ensure(
        api,
        &ctx,
        "application-policy-set",
        &["default-policy-management", "default-application-policy-set"],
        Some("policy-management"),
        json!({ "all_applications": true }),
    )
    .await?;
    if let Err(e) = api
        .db()
        .ref_update(&aps, "global-vrouter-config", &gvc, None, RefOp::Add, false)
    {
        warn!("Cannot reference global vrouter config {gvc} from application policy set {aps}: {e}");
    }

    ensure(
        api,
        &ctx,
        "alarm",
        &["default-global-system-config", "system-defined-bottle-request-size-limit"],
        Some("global-system-config"),
        json!({
            "alarm_rules": {"or_list": [{"and_list": [{
                "operand1": "UveConfigReq.err_info.*.",
                "operation": "==",
                "operand2": {"json_value": "True"}
            }]}]},
            "alarm_severity": 1,
            "id_perms": {"description": "Request size limit exceeded."},
            "uve_keys": {"uve_key": ["config-node"]}
        }),
    )
    .await?;

    ensure(
        api,
        &ctx,
        "security-group",
        &["default-domain", "default-project", "__no_rule__"],
        Some("project"),
        json!({
            "id_perms": {"user_visible": false},
            "security_group_entries": {"policy_rule": []}
        }),
    )
    .await?;
    ensure(
        api,
        &ctx,
        "network-ipam",
        &["default-domain", "default-project", "service-chain-flat-ipam"],
        Some("project"),
        json!({
            "ipam_subnet_method": "flat-subnet",
            "ipam_subnets": {"subnets": [
                {"subnet": {"ip_prefix": "0.0.0.0", "ip_prefix_len": 8}},
                {"subnet": {"ip_prefix": "::ffff", "ip_prefix_len": 104}}
            ]}
        }),
    )
    .await?;

    for (name, _) in PREDEFINED_TAG_TYPES {
        ensure(
            api,
            &ctx,
            "tag-type",
            &[*name],
            None,
            json!({ "id_perms": {"user_visible": false} }),
        )
        .await?;
    }

    if api.perms().is_rbac() {
        default_rbac_rules(api).await?;
    }
    info!("Default resources in place");
    Ok(())
}

/// Let every tenant read a resource, e.g. the default ipam.
fn share_globally(api: &ApiServer, uuid: &Uuid) -> ApiResult<()> {
    let current = api.db().read(uuid, &ReadOptions::shallow())?;
    let mut perms = Perms2::of(&current);
    let wanted = PERMS_R | PERMS_X;
    if perms.global_access == wanted {
        return Ok(());
    }
    perms.global_access = wanted;
    let mut patch = Map::new();
    patch.insert("perms2".into(), perms.to_value());
    api.db().update(uuid, &patch)?;
    api.cache().invalidate(uuid);
    Ok(())
}

/// Make sure the global access list carries the rules every user needs. Rules an operator added
/// are kept.
pub async fn default_rbac_rules(api: &ApiServer) -> ApiResult<()> {
    let ctx = RequestContext::internal().with_request_id("seed-rbac");
    let fq = FqName::from(DEFAULT_API_ACCESS_LIST);
    let wanted = default_rules();
    if let Ok(acl) = api.db().uuid_of("api-access-list", &fq) {
        let current = api.db().read(&acl, &ReadOptions::shallow())?;
        let mut rules = current
            .get("api_access_list_entries")
            .map(RbacRule::from_entries)
            .unwrap_or_default();
        if merge_rules(&mut rules, &wanted) {
            let mut patch = Map::new();
            patch.insert(
                "api_access_list_entries".into(),
                json!({ "rbac_rule": rules }),
            );
            api.update(&ctx, "api-access-list", &acl, patch).await?;
            info!("Default access rules added to {fq}");
        }
        return Ok(());
    }
    ensure(
        api,
        &ctx,
        "api-access-list",
        DEFAULT_API_ACCESS_LIST,
        Some("global-system-config"),
        json!({ "api_access_list_entries": { "rbac_rule": wanted } }),
    )
    .await?;
    info!("Default access rules created");
    Ok(())
}
