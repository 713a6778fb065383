// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! End to end behavior of the pipeline, driven in process.

use config::FqName;
use coord::{Coordinator, MemCoordinator};
use pretty_assertions::assert_eq;
use serde_json::{Map, json};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use store::{Backend, MemBackend};
use vnc_mgmt::actions::{DraftAction, IpAlloc, IpFree, SubnetIpCount};
use vnc_mgmt::testing::TestServer;
use vnc_mgmt::{ListParams, Status, seed};

#[tokio::test]
async fn seeding_twice_converges() {
    let server = TestServer::new().await.unwrap();
    let before = server.api.db().len();
    seed::run(&server.api).await.unwrap();
    assert_eq!(server.api.db().len(), before);
    let domains = server
        .api
        .list(&server.ctx(), "domain", &ListParams::default())
        .unwrap();
    assert_eq!(domains.body["domains"].as_array().unwrap().len(), 1);
    let ipam = server
        .api
        .uuid_of("network-ipam", &FqName::from(seed::DEFAULT_IPAM))
        .unwrap();
    assert_eq!(server.body(&ipam).unwrap()["perms2"]["global_access"], 5);
}

#[tokio::test]
async fn draft_commit_publishes_staged_resources() {
    let server = TestServer::new().await.unwrap();
    let ctx = server.ctx();
    let project = server.project("p1").await.unwrap();
    let mut patch = Map::new();
    patch.insert("enable_security_policy_draft".into(), json!(true));
    server.api.update(&ctx, "project", &project, patch).await.unwrap();

    let mut body = Map::new();
    body.insert("fq_name".into(), json!(["default-domain", "p1", "ag1"]));
    body.insert("parent_type".into(), json!("project"));
    let staged = server.api.create(&ctx, "address-group", body).await.unwrap();
    assert_eq!(staged.status, Status::Accepted);
    let live_fq = FqName::from(&["default-domain", "p1", "ag1"][..]);
    assert!(server.api.uuid_of("address-group", &live_fq).is_err());

    let commit = DraftAction {
        scope_uuid: Some(project.to_string()),
        action: Some("commit".to_string()),
    };
    server.api.security_policy_draft(&ctx, &commit).await.unwrap();
    assert!(server.api.uuid_of("address-group", &live_fq).is_ok());
    let draft_fq = FqName::from(&["default-domain", "p1", "draft-policy-management", "ag1"][..]);
    assert!(server.api.uuid_of("address-group", &draft_fq).is_err());

    // nothing left to publish
    server.api.security_policy_draft(&ctx, &commit).await.unwrap();
    assert!(server.api.uuid_of("address-group", &live_fq).is_ok());
}

#[tokio::test]
async fn addresses_come_from_the_network_subnets() {
    let server = TestServer::new().await.unwrap();
    let ctx = server.ctx();
    server.project("p1").await.unwrap();
    let vn = server.network("p1", "vn", "10.1.0.0/24").await.unwrap();

    let allocated = server
        .api
        .ip_alloc(
            &ctx,
            &vn,
            &IpAlloc {
                count: Some(2),
                ..IpAlloc::default()
            },
        )
        .unwrap();
    let addrs: Vec<IpAddr> = allocated["ip_addr"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a.as_str().unwrap().parse().unwrap())
        .collect();
    assert_eq!(addrs.len(), 2);
    assert_ne!(addrs[0], addrs[1]);
    let net: ipnet::IpNet = "10.1.0.0/24".parse().unwrap();
    assert!(addrs.iter().all(|a| net.contains(a)));

    let counted = server
        .api
        .subnet_ip_count(
            &ctx,
            &vn,
            &SubnetIpCount {
                subnet_list: vec!["10.1.0.0/24".to_string()],
            },
        )
        .unwrap();
    let before = counted["ip_count_list"][0].as_u64().unwrap();
    assert!(before >= 2);

    server
        .api
        .ip_free(
            &ctx,
            &vn,
            &IpFree {
                ip_addr: addrs.iter().map(ToString::to_string).collect(),
            },
        )
        .unwrap();
    let counted = server
        .api
        .subnet_ip_count(
            &ctx,
            &vn,
            &SubnetIpCount {
                subnet_list: vec!["10.1.0.0/24".to_string()],
            },
        )
        .unwrap();
    assert_eq!(counted["ip_count_list"][0].as_u64().unwrap(), before - 2);
}

#[tokio::test]
async fn enabling_rbac_plants_default_rules() {
    let server = TestServer::new().await.unwrap();
    let acl = FqName::from(seed::DEFAULT_API_ACCESS_LIST);
    assert!(server.api.uuid_of("api-access-list", &acl).is_err());
    let reply = server
        .api
        .set_aaa_mode(&server.ctx(), &json!({"aaa-mode": "rbac"}))
        .await
        .unwrap();
    assert_eq!(reply["aaa-mode"], "rbac");
    let uuid = server.api.uuid_of("api-access-list", &acl).unwrap();
    let rules = &server.body(&uuid).unwrap()["api_access_list_entries"]["rbac_rule"];
    assert!(!rules.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn failed_create_releases_its_network_id() {
    let server = TestServer::new().await.unwrap();
    server.project("p1").await.unwrap();
    let before = server.api.ids().vn.count();

    // overlapping subnets are found after the network id is taken
    let result = server
        .create(
            "virtual-network",
            json!({
                "fq_name": ["default-domain", "p1", "bad"],
                "parent_type": "project",
                "network_ipam_refs": [{
                    "to": ["default-domain", "default-project", "default-network-ipam"],
                    "attr": {"ipam_subnets": [
                        {"subnet": {"ip_prefix": "10.0.0.0", "ip_prefix_len": 16}},
                        {"subnet": {"ip_prefix": "10.0.1.0", "ip_prefix_len": 24}}
                    ]}
                }]
            }),
        )
        .await;
    assert!(result.is_err());
    assert_eq!(server.api.ids().vn.count(), before);
    assert_eq!(server.api.ids().vn.id_of("default-domain:p1:bad"), None);
    let fq = FqName::from(&["default-domain", "p1", "bad"][..]);
    assert!(server.api.uuid_of("virtual-network", &fq).is_err());

    // the name is free for a valid network
    server.network("p1", "bad", "10.0.0.0/16").await.unwrap();
    assert_eq!(server.api.ids().vn.count(), before + 1);
}

#[tokio::test]
async fn annotations_are_accepted_on_create_and_update() {
    let server = TestServer::new().await.unwrap();
    let ctx = server.ctx();
    server.project("p1").await.unwrap();
    let vn = server
        .create(
            "virtual-network",
            json!({
                "fq_name": ["default-domain", "p1", "tagged"],
                "parent_type": "project",
                "annotations": {"key_value_pair": [{"key": "k", "value": "v"}]}
            }),
        )
        .await
        .unwrap();
    assert_eq!(
        server.body(&vn).unwrap()["annotations"]["key_value_pair"],
        json!([{"key": "k", "value": "v"}])
    );

    let mut patch = Map::new();
    patch.insert(
        "annotations".into(),
        json!({"key_value_pair": [{"key": "k", "value": "w"}, {"key": "x", "value": "y"}]}),
    );
    server.api.update(&ctx, "virtual-network", &vn, patch).await.unwrap();
    let pairs = &server.body(&vn).unwrap()["annotations"]["key_value_pair"];
    assert_eq!(pairs.as_array().unwrap().len(), 2);

    let mut patch = Map::new();
    patch.insert(
        "annotations".into(),
        json!({"key_value_pair": [{"key": "k", "colour": "w"}]}),
    );
    let err = server
        .api
        .update(&ctx, "virtual-network", &vn, patch)
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);
}

#[tokio::test]
async fn startup_reclaims_ids_of_missing_owners() {
    let coord = Arc::new(MemCoordinator::new());
    coord
        .create_node("/id/virtual-networks/0000000042", "default-domain:p1:ghost")
        .await
        .unwrap();
    let server = TestServer::restarted(coord.clone(), Arc::new(MemBackend::new()))
        .await
        .unwrap();
    assert_eq!(server.api.ids().vn.id_of("default-domain:p1:ghost"), None);
    assert!(!server.api.ids().vn.is_allocated(42));
    assert_eq!(
        coord.read_node("/id/virtual-networks/0000000042").await.unwrap(),
        None
    );
    // the reserved security group id survives
    assert!(server.api.ids().sg.is_allocated(0));
}

#[tokio::test]
async fn restart_keeps_resources_and_their_ids() {
    let coord: Arc<dyn Coordinator> = Arc::new(MemCoordinator::new());
    let backend: Arc<dyn Backend> = Arc::new(MemBackend::new());
    let fq = FqName::from(&["default-domain", "p1", "vn"][..]);

    let first = TestServer::restarted(coord.clone(), backend.clone())
        .await
        .unwrap();
    first.project("p1").await.unwrap();
    let vn = first.network("p1", "vn", "10.2.0.0/24").await.unwrap();
    let vn_id = first.body(&vn).unwrap()["virtual_network_network_id"].clone();
    let resources = first.api.db().len();
    drop(first);

    let second = TestServer::restarted(coord, backend).await.unwrap();
    assert_eq!(second.api.db().len(), resources);
    assert_eq!(second.api.uuid_of("virtual-network", &fq).unwrap(), vn);
    assert_eq!(second.body(&vn).unwrap()["virtual_network_network_id"], vn_id);
    assert_eq!(
        second.api.ids().vn.id_of("default-domain:p1:vn"),
        vn_id.as_u64().and_then(|id| u32::try_from(id).ok())
    );
    // the name is still taken
    assert!(second.network("p1", "vn", "10.3.0.0/24").await.is_err());
}

#[tokio::test]
async fn blocked_draft_commit_applies_nothing() {
    let server = TestServer::new().await.unwrap();
    let ctx = server.ctx();
    let project = server.project("p1").await.unwrap();
    let ag1 = server
        .create(
            "address-group",
            json!({"fq_name": ["default-domain", "p1", "ag1"], "parent_type": "project"}),
        )
        .await
        .unwrap();
    server
        .create(
            "firewall-rule",
            json!({
                "fq_name": ["default-domain", "p1", "fr1"],
                "parent_type": "project",
                "endpoint_1": {"address_group": "default-domain:p1:ag1"},
                "endpoint_2": {"any": true}
            }),
        )
        .await
        .unwrap();
    let mut patch = Map::new();
    patch.insert("enable_security_policy_draft".into(), json!(true));
    server.api.update(&ctx, "project", &project, patch).await.unwrap();

    let mut body = Map::new();
    body.insert("fq_name".into(), json!(["default-domain", "p1", "ag2"]));
    body.insert("parent_type".into(), json!("project"));
    let staged = server.api.create(&ctx, "address-group", body).await.unwrap();
    assert_eq!(staged.status, Status::Accepted);
    let staged = server.api.delete(&ctx, "address-group", &ag1).await.unwrap();
    assert_eq!(staged.status, Status::Accepted);

    let commit = DraftAction {
        scope_uuid: Some(project.to_string()),
        action: Some("commit".to_string()),
    };
    let err = server
        .api
        .security_policy_draft(&ctx, &commit)
        .await
        .unwrap_err();
    assert_eq!(err.status(), 409);
    assert!(err.to_string().contains("firewall-rule"));

    let live = |name: &str| FqName::from(&["default-domain", "p1", name][..]);
    let draft = |name: &str| {
        FqName::from(&["default-domain", "p1", "draft-policy-management", name][..])
    };
    assert!(server.api.uuid_of("address-group", &live("ag2")).is_err());
    assert_eq!(server.api.uuid_of("address-group", &live("ag1")).unwrap(), ag1);
    assert!(server.api.uuid_of("address-group", &draft("ag2")).is_ok());
    assert!(server.api.uuid_of("address-group", &draft("ag1")).is_ok());
}

#[tokio::test]
async fn failed_draft_commit_takes_back_applied_changes() {
    let server = TestServer::new().await.unwrap();
    let ctx = server.ctx();
    let project = server.project("p1").await.unwrap();
    let rule = |name: &str| {
        json!({
            "fq_name": ["default-domain", "p1", name],
            "parent_type": "project",
            "endpoint_1": {"any": true},
            "endpoint_2": {"any": true}
        })
    };
    server.create("firewall-rule", rule("fr1")).await.unwrap();
    let mut patch = Map::new();
    patch.insert("quota".into(), json!({"firewall_rule": 1}));
    patch.insert("enable_security_policy_draft".into(), json!(true));
    server.api.update(&ctx, "project", &project, patch).await.unwrap();

    // drafts sit outside the project quota, their live copies do not
    let mut body = Map::new();
    body.insert("fq_name".into(), json!(["default-domain", "p1", "ag2"]));
    body.insert("parent_type".into(), json!("project"));
    server.api.create(&ctx, "address-group", body).await.unwrap();
    let serde_json::Value::Object(fr2) = rule("fr2") else {
        unreachable!()
    };
    let staged = server.api.create(&ctx, "firewall-rule", fr2).await.unwrap();
    assert_eq!(staged.status, Status::Accepted);

    let commit = DraftAction {
        scope_uuid: Some(project.to_string()),
        action: Some("commit".to_string()),
    };
    let err = server
        .api
        .security_policy_draft(&ctx, &commit)
        .await
        .unwrap_err();
    assert_eq!(err.status(), 412);

    let live = |name: &str| FqName::from(&["default-domain", "p1", name][..]);
    assert!(server.api.uuid_of("address-group", &live("ag2")).is_err());
    assert!(server.api.uuid_of("firewall-rule", &live("fr2")).is_err());
    let draft = FqName::from(&["default-domain", "p1", "draft-policy-management", "ag2"][..]);
    assert!(server.api.uuid_of("address-group", &draft).is_ok());
}

#[tokio::test]
async fn draft_commit_waits_for_the_scope_lock() {
    let config = args::ServerConfig {
        zk_lock_timeout_secs: 1,
        ..args::ServerConfig::default()
    };
    let server = TestServer::with_config(config).await.unwrap();
    let ctx = server.ctx();
    let project = server.project("p1").await.unwrap();
    let mut patch = Map::new();
    patch.insert("enable_security_policy_draft".into(), json!(true));
    server.api.update(&ctx, "project", &project, patch).await.unwrap();
    let mut body = Map::new();
    body.insert("fq_name".into(), json!(["default-domain", "p1", "ag1"]));
    body.insert("parent_type".into(), json!("project"));
    server.api.create(&ctx, "address-group", body).await.unwrap();

    let held = server
        .api
        .coord()
        .lock("/lock/security/project/default-domain:p1", Duration::from_secs(1))
        .await
        .unwrap();
    let commit = DraftAction {
        scope_uuid: Some(project.to_string()),
        action: Some("commit".to_string()),
    };
    let err = server
        .api
        .security_policy_draft(&ctx, &commit)
        .await
        .unwrap_err();
    assert_eq!(err.status(), 503);
    drop(held);

    server.api.security_policy_draft(&ctx, &commit).await.unwrap();
    let live = FqName::from(&["default-domain", "p1", "ag1"][..]);
    assert!(server.api.uuid_of("address-group", &live).is_ok());
}
