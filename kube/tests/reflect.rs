// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Orchestrator events reflected into a seeded in-process server.

use args::{KubernetesConfig, ServerConfig};
use config::FqName;
use coord::{Coordinator, MemCoordinator};
use id::Uuid;
use ipnet::IpNet;
use mgmt::testing::TestServer;
use mgmt::{ApiServer, ApiServerParamsBuilder};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use vnc_kube::{EventType, KubeEvent, KubeManager, Kind};

fn kube_config() -> ServerConfig {
    ServerConfig {
        kubernetes: KubernetesConfig {
            enabled: true,
            pod_subnets: vec!["10.32.0.0/12".parse().unwrap()],
            service_subnets: vec!["10.96.0.0/12".parse().unwrap()],
            ..KubernetesConfig::default()
        },
        ..ServerConfig::default()
    }
}

async fn provisioned() -> (TestServer, KubeManager) {
    let server = TestServer::with_config(kube_config()).await.unwrap();
    let mut manager = KubeManager::new(server.api.clone());
    manager.reflector_mut().rebuild();
    manager.reflector_mut().provision().await.unwrap();
    (server, manager)
}

fn event(event_type: EventType, kind: &str, namespace: &str, name: &str, rest: Value) -> KubeEvent {
    let mut object = json!({
        "kind": kind,
        "metadata": {"name": name, "namespace": namespace, "uid": format!("{name}-uid")},
    });
    if let (Some(object), Value::Object(rest)) = (object.as_object_mut(), rest) {
        for (key, value) in rest {
            if key == "metadata" {
                let meta = object["metadata"].as_object_mut().unwrap();
                meta.extend(value.as_object().unwrap().clone());
            } else {
                object.insert(key, value);
            }
        }
    }
    KubeEvent::new(event_type, object)
}

fn pod(name: &str, labels: Value) -> KubeEvent {
    event(
        EventType::Added,
        "Pod",
        "default",
        name,
        json!({"metadata": {"labels": labels}, "spec": {}, "status": {}}),
    )
}

fn find(server: &TestServer, resource_type: &str, fq: &FqName) -> Option<Uuid> {
    server.api.db().uuid_of(resource_type, fq).ok()
}

fn address(server: &TestServer, iip: &Uuid) -> IpAddr {
    server.body(iip).unwrap()["instance_ip_address"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap()
}

fn ref_list(body: &serde_json::Map<String, Value>, field: &str) -> Vec<String> {
    body.get(field)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| r["uuid"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn provisioning_plants_cluster_networks() {
    let (server, mut manager) = provisioned().await;
    let names = manager.reflector().names().clone();
    assert!(find(&server, "project", &names.project("kube-system")).is_some());
    let pod_network = find(&server, "virtual-network", &names.pod_network()).unwrap();
    assert_eq!(
        server.body(&pod_network).unwrap()["address_allocation_mode"],
        "flat-subnet-only"
    );
    assert!(find(&server, "virtual-network", &names.service_network()).is_some());

    // provisioning again converges
    let before = server.api.db().len();
    manager.reflector_mut().provision().await.unwrap();
    assert_eq!(server.api.db().len(), before);
}

#[tokio::test]
async fn isolated_namespace_gets_its_own_network() {
    let (server, mut manager) = provisioned().await;
    let names = manager.reflector().names().clone();
    let queue = manager.queue();
    queue.push(event(
        EventType::Added,
        "Namespace",
        "",
        "prod",
        json!({"metadata": {"namespace": null, "annotations": {"opencontrail.org/isolation": "true"}}}),
    ));
    assert_eq!(manager.process_pending().await, 1);
    let project = find(&server, "project", &names.project("prod")).unwrap();
    let network = names.namespace_pod_network("prod");
    assert!(find(&server, "virtual-network", &network).is_some());
    let key = names.annotated("prod", Kind::Namespace, "prod");
    assert_eq!(server.api.db().uuid_by_annotation("project", &key), Some(project));

    queue.push(event(
        EventType::Deleted,
        "Namespace",
        "",
        "prod",
        json!({"metadata": {"namespace": null}}),
    ));
    manager.process_pending().await;
    assert!(find(&server, "virtual-network", &network).is_none());
    assert!(find(&server, "project", &names.project("prod")).is_none());
}

#[tokio::test]
async fn pod_gets_an_interface_in_the_pod_subnet() {
    let (server, mut manager) = provisioned().await;
    let names = manager.reflector().names().clone();
    let queue = manager.queue();
    queue.push(pod("web", json!({"app": "web"})));
    manager.process_pending().await;

    let instance = "web__web-uid";
    let vm = find(&server, "virtual-machine", &FqName::new([instance])).unwrap();
    assert_eq!(server.body(&vm).unwrap()["server_type"], "container");
    let vmi = find(
        &server,
        "virtual-machine-interface",
        &names.project("default").child(instance),
    )
    .unwrap();
    let iip = find(&server, "instance-ip", &FqName::new([instance])).unwrap();
    let pods: IpNet = "10.32.0.0/12".parse().unwrap();
    assert!(pods.contains(&address(&server, &iip)));
    assert_eq!(
        ref_list(&server.body(&iip).unwrap(), "virtual_machine_interface_refs"),
        vec![vmi.to_string()]
    );

    // a repeated event changes nothing
    let before = server.api.db().len();
    queue.push(pod("web", json!({"app": "web"})));
    manager.process_pending().await;
    assert_eq!(server.api.db().len(), before);

    queue.push(event(EventType::Deleted, "Pod", "default", "web", json!({})));
    manager.process_pending().await;
    assert!(!server.api.db().exists(&vm));
    assert!(!server.api.db().exists(&vmi));
    assert!(!server.api.db().exists(&iip));
}

#[tokio::test]
async fn service_and_endpoints_make_a_balancer() {
    let (server, mut manager) = provisioned().await;
    let names = manager.reflector().names().clone();
    let queue = manager.queue();
    queue.push(event(
        EventType::Added,
        "Service",
        "default",
        "web",
        json!({"spec": {
            "clusterIP": "10.96.0.10",
            "ports": [{"name": "http", "port": 80, "protocol": "TCP", "targetPort": 8080}],
        }}),
    ));
    queue.push(event(
        EventType::Added,
        "Endpoints",
        "default",
        "web",
        json!({"subsets": [{
            "addresses": [{"ip": "10.32.0.4"}, {"ip": "10.32.0.5"}],
            "ports": [{"name": "http", "port": 8080}],
        }]}),
    ));
    assert_eq!(manager.process_pending().await, 2);

    let key = names.annotated("default", Kind::Service, "web");
    let lb = server.api.db().uuid_by_annotation("loadbalancer", &key).unwrap();
    let body = server.body(&lb).unwrap();
    let props = &body["loadbalancer_properties"];
    assert_eq!(props["vip_address"], "10.96.0.10");
    assert_eq!(props["provisioning_status"], "ACTIVE");

    let project = names.project("default");
    let listener = find(&server, "loadbalancer-listener", &project.child("web__web-uid-tcp-80"))
        .unwrap();
    assert_eq!(
        server.body(&listener).unwrap()["loadbalancer_listener_properties"]["protocol_port"],
        80
    );
    let pool_fq = project.child("web__web-uid-tcp-80-pool");
    assert!(find(&server, "loadbalancer-pool", &pool_fq).is_some());
    let member = find(&server, "loadbalancer-member", &pool_fq.child("10.32.0.4-8080")).unwrap();
    assert_eq!(
        server.body(&member).unwrap()["loadbalancer_member_properties"]["address"],
        "10.32.0.4"
    );

    // one endpoint goes away
    queue.push(event(
        EventType::Modified,
        "Endpoints",
        "default",
        "web",
        json!({"subsets": [{
            "addresses": [{"ip": "10.32.0.5"}],
            "ports": [{"name": "http", "port": 8080}],
        }]}),
    ));
    manager.process_pending().await;
    assert!(!server.api.db().exists(&member));
    assert!(find(&server, "loadbalancer-member", &pool_fq.child("10.32.0.5-8080")).is_some());

    queue.push(event(EventType::Deleted, "Service", "default", "web", json!({})));
    manager.process_pending().await;
    assert!(!server.api.db().exists(&lb));
    assert!(!server.api.db().exists(&listener));
    assert!(find(&server, "loadbalancer-pool", &pool_fq).is_none());
}

#[tokio::test]
async fn network_policy_guards_selected_pods() {
    let (server, mut manager) = provisioned().await;
    let names = manager.reflector().names().clone();
    let queue = manager.queue();
    queue.push(pod("web", json!({"app": "web"})));
    queue.push(pod("db", json!({"app": "db"})));
    queue.push(event(
        EventType::Added,
        "NetworkPolicy",
        "default",
        "allow-http",
        json!({"spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "ingress": [{"ports": [{"protocol": "TCP", "port": 80}]}],
        }}),
    ));
    manager.process_pending().await;

    let group = find(
        &server,
        "security-group",
        &names.policy_group("default", "allow-http"),
    )
    .unwrap();
    let project = names.project("default");
    let web = find(&server, "virtual-machine-interface", &project.child("web__web-uid")).unwrap();
    let db = find(&server, "virtual-machine-interface", &project.child("db__db-uid")).unwrap();
    assert!(ref_list(&server.body(&web).unwrap(), "security_group_refs").contains(&group.to_string()));
    assert!(!ref_list(&server.body(&db).unwrap(), "security_group_refs").contains(&group.to_string()));

    // relabelled pod leaves the policy
    queue.push(pod("web", json!({"app": "other"})));
    manager.process_pending().await;
    assert!(!ref_list(&server.body(&web).unwrap(), "security_group_refs").contains(&group.to_string()));

    queue.push(event(
        EventType::Deleted,
        "NetworkPolicy",
        "default",
        "allow-http",
        json!({}),
    ));
    manager.process_pending().await;
    assert!(!server.api.db().exists(&group));
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for {what}");
}

#[tokio::test]
async fn session_loss_pauses_reflection_until_reelected() {
    let coord = Arc::new(MemCoordinator::new());
    let params = ApiServerParamsBuilder::default()
        .config(kube_config())
        .coord(coord.clone() as Arc<dyn Coordinator>)
        .build()
        .unwrap();
    let api = ApiServer::new(params);
    let bus = api.db().bus().clone();
    tokio::spawn(async move { bus.run_publisher().await });
    api.startup().await.unwrap();

    let manager = KubeManager::new(api.clone());
    let names = manager.reflector().names().clone();
    let queue = manager.queue();
    tokio::spawn(manager.run());

    let ns = |name: &str| {
        event(
            EventType::Added,
            "Namespace",
            "",
            name,
            json!({"metadata": {"namespace": null}}),
        )
    };
    queue.push(ns("alpha"));
    let alpha = names.project("alpha");
    eventually("alpha", || api.db().uuid_of("project", &alpha).is_ok()).await;

    coord.expire_session();
    queue.push(ns("beta"));
    let beta = names.project("beta");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(api.db().uuid_of("project", &beta).is_err());
    assert!(!queue.is_empty());

    coord.reconnect();
    eventually("beta", || api.db().uuid_of("project", &beta).is_ok()).await;
    assert!(queue.is_empty());
}
