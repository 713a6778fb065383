// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Adapter tests against an in-process server.

use args::ServerConfig;
use id::Uuid;
use mgmt::testing::TestServer;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use vnc_neutron::{NeutronError, NeutronPlugin, NeutronRequest, NeutronResult, Resource};

struct Tenant {
    plugin: NeutronPlugin,
    tenant: String,
    admin: bool,
}

impl Tenant {
    fn new(server: &TestServer, project: &Uuid) -> Self {
        Self {
            plugin: NeutronPlugin::new(server.api.clone()),
            tenant: id::undashed(project),
            admin: false,
        }
    }

    fn admin(mut self) -> Self {
        self.admin = true;
        self
    }

    async fn send(
        &self,
        resource: Resource,
        operation: &str,
        id: Option<&str>,
        data: Value,
    ) -> NeutronResult<Value> {
        let mut body = json!({
            "context": {
                "operation": operation,
                "tenant_id": self.tenant,
                "is_admin": self.admin,
            },
            "data": {}
        });
        if let Some(id) = id {
            body["data"]["id"] = json!(id);
        }
        match operation {
            "READALL" | "READCOUNT" => body["data"]["filters"] = data,
            _ => body["data"]["resource"] = data,
        }
        let req = NeutronRequest::parse(body.to_string().as_bytes())?;
        self.plugin.handle(resource, &req).await
    }

    async fn create(&self, resource: Resource, data: Value) -> Value {
        self.send(resource, "CREATE", None, data).await.unwrap()
    }
}

fn id_of(view: &Value) -> String {
    view["id"].as_str().unwrap().to_string()
}

async fn network_with_subnet(t: &Tenant, name: &str, cidr: &str) -> (String, String) {
    let net = t.create(Resource::Network, json!({ "name": name })).await;
    let subnet = t
        .create(
            Resource::Subnet,
            json!({ "network_id": id_of(&net), "cidr": cidr, "ip_version": 4 }),
        )
        .await;
    (id_of(&net), id_of(&subnet))
}

#[tokio::test]
async fn network_lifecycle() {
    let server = TestServer::new().await.unwrap();
    let project = server.project("demo").await.unwrap();
    let t = Tenant::new(&server, &project);

    let net = t.create(Resource::Network, json!({ "name": "blue" })).await;
    assert_eq!(net["name"], json!("blue"));
    assert_eq!(net["tenant_id"], json!(id::undashed(&project)));
    assert_eq!(net["status"], json!("ACTIVE"));
    assert_eq!(net["shared"], json!(false));
    assert_eq!(net["subnets"], json!([]));

    let id = id_of(&net);
    let read = t.send(Resource::Network, "READ", Some(&id), json!({})).await.unwrap();
    assert_eq!(read["id"], json!(id));

    let listed = t.send(Resource::Network, "READALL", None, json!({})).await.unwrap();
    assert!(listed.as_array().unwrap().iter().any(|n| n["id"] == json!(id)));

    let renamed = t
        .send(Resource::Network, "UPDATE", Some(&id), json!({ "name": "green" }))
        .await
        .unwrap();
    assert_eq!(renamed["name"], json!("green"));

    t.send(Resource::Network, "DELETE", Some(&id), json!({})).await.unwrap();
    let gone = t.send(Resource::Network, "READ", Some(&id), json!({})).await.unwrap_err();
    assert_eq!(gone.name(), "NetworkNotFound");
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn other_tenants_network_is_hidden() {
    let server = TestServer::new().await.unwrap();
    let red = server.project("red").await.unwrap();
    let black = server.project("black").await.unwrap();
    let owner = Tenant::new(&server, &red);
    let other = Tenant::new(&server, &black);

    let net = owner.create(Resource::Network, json!({ "name": "private" })).await;
    let err = other
        .send(Resource::Network, "READ", Some(&id_of(&net)), json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.name(), "NetworkNotFound");

    let err = other
        .send(
            Resource::Network,
            "CREATE",
            None,
            json!({ "name": "sneaky", "tenant_id": id::undashed(&red) }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 403);
}

#[tokio::test]
async fn subnet_gets_gateway_and_port_an_address() {
    let server = TestServer::new().await.unwrap();
    let project = server.project("demo").await.unwrap();
    let t = Tenant::new(&server, &project);

    let net = t.create(Resource::Network, json!({ "name": "web" })).await;
    let subnet = t
        .create(
            Resource::Subnet,
            json!({ "network_id": id_of(&net), "cidr": "10.1.0.0/24", "ip_version": 4 }),
        )
        .await;
    assert_eq!(subnet["cidr"], json!("10.1.0.0/24"));
    assert_eq!(subnet["gateway_ip"], json!("10.1.0.1"));

    let port = t
        .create(
            Resource::Port,
            json!({ "network_id": id_of(&net), "mac_address": "02:AA:BB:CC:DD:EE" }),
        )
        .await;
    assert_eq!(port["mac_address"], json!("02:aa:bb:cc:dd:ee"));
    let fixed = port["fixed_ips"].as_array().unwrap();
    assert_eq!(fixed.len(), 1);
    assert_eq!(fixed[0]["subnet_id"], subnet["id"]);
    assert!(fixed[0]["ip_address"].as_str().unwrap().starts_with("10.1.0."));
    assert_eq!(port["security_groups"].as_array().unwrap().len(), 1);

    let err = t
        .send(
            Resource::Port,
            "CREATE",
            None,
            json!({ "network_id": id_of(&net), "mac_address": "02:aa:bb:cc:dd:ee" }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.name(), "MacAddressInUse");
    assert_eq!(err.status(), 409);

    let err = t
        .send(Resource::Subnet, "DELETE", Some(&id_of(&subnet)), json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.name(), "SubnetInUse");

    t.send(Resource::Port, "DELETE", Some(&id_of(&port)), json!({})).await.unwrap();
    let err = t
        .send(Resource::Port, "READ", Some(&id_of(&port)), json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.name(), "PortNotFound");
}

#[tokio::test]
async fn duplicate_subnet_cidr_is_rejected() {
    let server = TestServer::new().await.unwrap();
    let project = server.project("demo").await.unwrap();
    let t = Tenant::new(&server, &project);
    let (net, _) = network_with_subnet(&t, "dup", "10.2.0.0/24").await;

    let err = t
        .send(
            Resource::Subnet,
            "CREATE",
            None,
            json!({ "network_id": net, "cidr": "10.2.0.0/24", "ip_version": 4 }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);
}

#[tokio::test]
async fn default_security_group() {
    let server = TestServer::new().await.unwrap();
    let project = server.project("demo").await.unwrap();
    let t = Tenant::new(&server, &project);

    let groups = t.send(Resource::SecurityGroup, "READALL", None, json!({})).await.unwrap();
    let groups = groups.as_array().unwrap();
    assert_eq!(groups.len(), 1);
    let default = &groups[0];
    assert_eq!(default["name"], json!("default"));
    let rules = default["security_group_rules"].as_array().unwrap();
    assert_eq!(rules.len(), 4);
    let ingress: Vec<&Value> = rules.iter().filter(|r| r["direction"] == json!("ingress")).collect();
    assert_eq!(ingress.len(), 2);
    assert!(ingress.iter().all(|r| r["remote_group_id"] == default["id"]));

    let err = t
        .send(Resource::SecurityGroup, "CREATE", None, json!({ "name": "default" }))
        .await
        .unwrap_err();
    assert_eq!(err.name(), "SecurityGroupAlreadyExists");

    let err = t
        .send(Resource::SecurityGroup, "DELETE", Some(&id_of(default)), json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.name(), "SecurityGroupCannotRemoveDefault");
}

#[tokio::test]
async fn security_group_rules() {
    let server = TestServer::new().await.unwrap();
    let project = server.project("demo").await.unwrap();
    let t = Tenant::new(&server, &project);

    let sg = t.create(Resource::SecurityGroup, json!({ "name": "web" })).await;
    let sg_id = id_of(&sg);
    let before = sg["security_group_rules"].as_array().unwrap().len();

    let ssh = json!({
        "security_group_id": sg_id,
        "direction": "ingress",
        "ethertype": "IPv4",
        "protocol": "tcp",
        "port_range_min": 22,
        "port_range_max": 22,
        "remote_ip_prefix": "10.0.0.0/8",
    });
    let rule = t.create(Resource::SecurityGroupRule, ssh.clone()).await;
    assert_eq!(rule["port_range_min"], json!(22));
    assert_eq!(rule["security_group_id"], json!(sg_id));

    let err = t
        .send(Resource::SecurityGroupRule, "CREATE", None, ssh)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "SecurityGroupRuleExists");

    let err = t
        .send(
            Resource::SecurityGroupRule,
            "CREATE",
            None,
            json!({
                "security_group_id": sg_id,
                "direction": "ingress",
                "protocol": "gre-ish",
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.name(), "SecurityGroupRuleInvalidProtocol");

    let err = t
        .send(
            Resource::SecurityGroupRule,
            "CREATE",
            None,
            json!({
                "security_group_id": sg_id,
                "direction": "egress",
                "protocol": "udp",
                "port_range_min": 100,
                "port_range_max": 70000,
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);

    t.send(Resource::SecurityGroupRule, "DELETE", Some(&id_of(&rule)), json!({}))
        .await
        .unwrap();
    let after = t
        .send(Resource::SecurityGroup, "READ", Some(&sg_id), json!({}))
        .await
        .unwrap();
    assert_eq!(after["security_group_rules"].as_array().unwrap().len(), before);
    let err = t
        .send(Resource::SecurityGroupRule, "READ", Some(&id_of(&rule)), json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.name(), "SecurityGroupRuleNotFound");
}

#[tokio::test]
async fn busy_security_group_rejects_rule_changes() {
    let config = ServerConfig {
        zk_lock_timeout_secs: 1,
        ..ServerConfig::default()
    };
    let server = TestServer::with_config(config).await.unwrap();
    let project = server.project("demo").await.unwrap();
    let t = Tenant::new(&server, &project);

    let sg = t.create(Resource::SecurityGroup, json!({ "name": "busy" })).await;
    let sg_uuid = Uuid::parse_str(&id_of(&sg)).unwrap();
    let rule = json!({
        "security_group_id": id_of(&sg),
        "direction": "ingress",
        "protocol": "tcp",
        "port_range_min": 443,
        "port_range_max": 443,
    });
    let created = t.create(Resource::SecurityGroupRule, rule.clone()).await;

    let held = server.api.security_group_lock(&sg_uuid).await.unwrap();
    let err = t
        .send(Resource::SecurityGroupRule, "CREATE", None, rule)
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);
    assert_eq!(err.name(), "BadRequest");
    let err = t
        .send(Resource::SecurityGroupRule, "DELETE", Some(&id_of(&created)), json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);
    assert!(err.to_string().contains("could not be deleted"));
    drop(held);

    t.send(Resource::SecurityGroupRule, "DELETE", Some(&id_of(&created)), json!({}))
        .await
        .unwrap();
}

#[tokio::test]
async fn router_interfaces() {
    let server = TestServer::new().await.unwrap();
    let project = server.project("demo").await.unwrap();
    let t = Tenant::new(&server, &project);
    let (_, subnet) = network_with_subnet(&t, "inside", "10.3.0.0/24").await;

    let router = t.create(Resource::Router, json!({ "name": "r1" })).await;
    let router_id = id_of(&router);
    let added = t
        .send(
            Resource::Router,
            "ADDINTERFACE",
            Some(&router_id),
            json!({ "subnet_id": subnet }),
        )
        .await
        .unwrap();
    assert_eq!(added["subnet_id"], json!(subnet));
    let port_id = added["port_id"].as_str().unwrap().to_string();

    let port = t
        .send(Resource::Port, "READ", Some(&port_id), json!({}))
        .await
        .unwrap();
    assert_eq!(port["device_owner"], json!("network:router_interface"));
    assert_eq!(port["device_id"], json!(router_id));
    assert_eq!(port["fixed_ips"][0]["ip_address"], json!("10.3.0.1"));

    let err = t
        .send(Resource::Router, "ADDINTERFACE", Some(&router_id), json!({ "subnet_id": subnet }))
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);

    let err = t
        .send(Resource::Port, "DELETE", Some(&port_id), json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.name(), "L3PortInUse");

    let err = t
        .send(Resource::Router, "DELETE", Some(&router_id), json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.name(), "RouterInUse");

    t.send(Resource::Router, "DELINTERFACE", Some(&router_id), json!({ "port_id": port_id }))
        .await
        .unwrap();
    let err = t
        .send(Resource::Port, "READ", Some(&port_id), json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.name(), "PortNotFound");
    t.send(Resource::Router, "DELETE", Some(&router_id), json!({}))
        .await
        .unwrap();
}

#[tokio::test]
async fn strict_floating_ip_needs_a_router() {
    let config = ServerConfig {
        strict_compliance: true,
        ..ServerConfig::default()
    };
    let server = TestServer::with_config(config).await.unwrap();
    let project = server.project("demo").await.unwrap();
    let t = Tenant::new(&server, &project);
    let admin = Tenant::new(&server, &project).admin();

    let public = admin
        .create(Resource::Network, json!({ "name": "public", "router:external": true }))
        .await;
    admin
        .create(
            Resource::Subnet,
            json!({ "network_id": id_of(&public), "cidr": "192.0.2.0/24", "ip_version": 4 }),
        )
        .await;
    let (private, subnet) = network_with_subnet(&t, "private", "10.4.0.0/24").await;
    let port = t.create(Resource::Port, json!({ "network_id": private })).await;

    let fip = t
        .create(Resource::FloatingIp, json!({ "floating_network_id": id_of(&public) }))
        .await;
    assert!(fip["floating_ip_address"].as_str().unwrap().starts_with("192.0.2."));
    assert_eq!(fip["port_id"], Value::Null);
    let fip_id = id_of(&fip);

    let err = t
        .send(Resource::FloatingIp, "UPDATE", Some(&fip_id), json!({ "port_id": id_of(&port) }))
        .await
        .unwrap_err();
    assert_eq!(err.name(), "ExternalGatewayForFloatingIPNotFound");
    assert_eq!(err.status(), 404);

    let router = t
        .create(
            Resource::Router,
            json!({ "name": "edge", "external_gateway_info": { "network_id": id_of(&public) } }),
        )
        .await;
    t.send(Resource::Router, "ADDINTERFACE", Some(&id_of(&router)), json!({ "subnet_id": subnet }))
        .await
        .unwrap();

    let associated = t
        .send(Resource::FloatingIp, "UPDATE", Some(&fip_id), json!({ "port_id": id_of(&port) }))
        .await
        .unwrap();
    assert_eq!(associated["port_id"], json!(id_of(&port)));
    assert_eq!(associated["router_id"], json!(id_of(&router)));
    assert_eq!(associated["fixed_ip_address"], port["fixed_ips"][0]["ip_address"]);
}

#[tokio::test]
async fn subnet_host_routes_become_port_route_tables() {
    let config = ServerConfig {
        apply_subnet_host_routes: true,
        ..ServerConfig::default()
    };
    let server = TestServer::with_config(config).await.unwrap();
    let project = server.project("demo").await.unwrap();
    let t = Tenant::new(&server, &project);

    let net = t.create(Resource::Network, json!({ "name": "routed" })).await;
    let subnet = t
        .create(
            Resource::Subnet,
            json!({
                "network_id": id_of(&net),
                "cidr": "10.5.0.0/24",
                "ip_version": 4,
                "host_routes": [
                    { "destination": "172.16.0.0/16", "nexthop": "10.5.0.9" },
                    { "destination": "172.17.0.0/16", "nexthop": "172.16.0.1" },
                    { "destination": "172.18.0.0/16", "nexthop": "10.5.0.20" },
                ],
            }),
        )
        .await;
    let port = t
        .create(
            Resource::Port,
            json!({
                "network_id": id_of(&net),
                "fixed_ips": [{ "subnet_id": id_of(&subnet), "ip_address": "10.5.0.9" }],
            }),
        )
        .await;

    let vmi = Uuid::parse_str(&id_of(&port)).unwrap();
    let body = server.body(&vmi).unwrap();
    let refs = body["interface_route_table_refs"].as_array().unwrap();
    assert_eq!(refs.len(), 1);
    let table = Uuid::parse_str(refs[0]["uuid"].as_str().unwrap()).unwrap();
    let table_body = server.body(&table).unwrap();
    let routes: Vec<&str> = table_body["interface_route_table_routes"]["route"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["prefix"].as_str().unwrap())
        .collect();
    assert_eq!(routes, vec!["172.16.0.0/16", "172.17.0.0/16"]);

    // new host routes replace the port's table
    t.send(
        Resource::Subnet,
        "UPDATE",
        Some(&id_of(&subnet)),
        json!({ "host_routes": [{ "destination": "192.168.0.0/16", "nexthop": "10.5.0.9" }] }),
    )
    .await
    .unwrap();
    assert!(!server.api.db().exists(&table));
    let body = server.body(&vmi).unwrap();
    let refs = body["interface_route_table_refs"].as_array().unwrap();
    assert_eq!(refs.len(), 1);
    let table = Uuid::parse_str(refs[0]["uuid"].as_str().unwrap()).unwrap();
    assert_eq!(
        server.body(&table).unwrap()["interface_route_table_routes"]["route"][0]["prefix"],
        json!("192.168.0.0/16")
    );

    t.send(Resource::Port, "DELETE", Some(&id_of(&port)), json!({})).await.unwrap();
    assert!(!server.api.db().exists(&table));
}

#[test]
fn error_body_carries_exception_name() {
    let err = NeutronError::NetworkNotFound {
        net_id: "abc".to_string(),
    };
    let body = err.body();
    assert_eq!(body["exception"], json!("NetworkNotFound"));
    assert_eq!(body["net_id"], json!("abc"));
    assert_eq!(body["msg"], json!("Network abc could not be found."));
}

async fn post(addr: SocketAddr, path: &str, body: &Value) -> (u16, Value) {
    let payload = body.to_string();
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{payload}",
        payload.len()
    );
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8(raw).unwrap();
    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let status = head
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap();
    (status, serde_json::from_str(body).unwrap())
}

#[tokio::test]
async fn served_over_http() {
    let server = TestServer::new().await.unwrap();
    let project = server.project("demo").await.unwrap();
    let plugin = Arc::new(NeutronPlugin::new(server.api.clone()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let api = server.api.clone();
    tokio::spawn(async move {
        mgmt::launch::serve(api, listener, Some(vnc_neutron::router(plugin)))
            .await
            .unwrap();
    });

    let context = json!({ "operation": "CREATE", "tenant_id": id::undashed(&project) });
    let (status, body) = post(
        addr,
        "/neutron/network",
        &json!({ "context": context, "data": { "resource": { "name": "wire" } } }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["name"], json!("wire"));

    let (status, body) = post(
        addr,
        "/neutron/network",
        &json!({
            "context": { "operation": "READ", "tenant_id": id::undashed(&project) },
            "data": { "id": Uuid::new_v4().to_string() }
        }),
    )
    .await;
    assert_eq!(status, 404);
    assert_eq!(body["exception"], json!("NetworkNotFound"));
}
