// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! REST smoke tests over a real socket, speaking plain HTTP/1.1.

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use vnc_mgmt::testing::TestServer;

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Value,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn call(
    addr: SocketAddr,
    method: &str,
    path: &str,
    body: Option<&Value>,
    extra: &[(&str, &str)],
) -> Reply {
    let payload = body.map(Value::to_string).unwrap_or_default();
    let mut request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n",
        payload.len()
    );
    for (name, value) in extra {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    request.push_str(&payload);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8(raw).unwrap();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap();
    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    let body = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body).unwrap()
    };
    Reply {
        status,
        headers,
        body,
    }
}

async fn post(addr: SocketAddr, path: &str, body: Value) -> Reply {
    call(addr, "POST", path, Some(&body), &[]).await
}

async fn get(addr: SocketAddr, path: &str) -> Reply {
    call(addr, "GET", path, None, &[]).await
}

async fn start() -> (TestServer, SocketAddr) {
    let server = TestServer::new().await.unwrap();
    let addr = server.listen().await.unwrap();
    (server, addr)
}

async fn project(addr: SocketAddr, name: &str) -> String {
    let reply = post(
        addr,
        "/projects",
        json!({"project": {"fq_name": ["default-domain", name], "parent_type": "domain"}}),
    )
    .await;
    assert_eq!(reply.status, 200, "{}", reply.body);
    reply.body["project"]["uuid"].as_str().unwrap().to_string()
}

async fn network(addr: SocketAddr, project: &str, name: &str) -> Reply {
    post(
        addr,
        "/virtual-networks",
        json!({"virtual-network": {
            "fq_name": ["default-domain", project, name],
            "parent_type": "project"
        }}),
    )
    .await
}

#[tokio::test]
async fn home_page_lists_links() {
    let (_server, addr) = start().await;
    let reply = get(addr, "/").await;
    assert_eq!(reply.status, 200);
    let links = reply.body["links"].as_array().unwrap();
    assert!(links.iter().any(|l| l["link"]["name"] == "virtual-network"));
    assert!(links.iter().any(|l| l["link"]["rel"] == "action"));
}

#[tokio::test]
async fn network_create_read_delete() {
    let (_server, addr) = start().await;
    project(addr, "p1").await;
    let created = network(addr, "p1", "vnA").await;
    assert_eq!(created.status, 200, "{}", created.body);
    let vn = &created.body["virtual-network"];
    let uuid = vn["uuid"].as_str().unwrap().to_string();
    assert!(vn["href"].as_str().unwrap().ends_with(&format!("/virtual-network/{uuid}")));

    let read = get(addr, &format!("/virtual-network/{uuid}")).await;
    assert_eq!(read.status, 200);
    let body = &read.body["virtual-network"];
    assert_eq!(body["fq_name"], json!(["default-domain", "p1", "vnA"]));
    assert!(body["virtual_network_network_id"].as_u64().unwrap() > 0);

    let etag = read.header("etag").unwrap().to_string();
    let cached = call(
        addr,
        "GET",
        &format!("/virtual-network/{uuid}"),
        None,
        &[("If-None-Match", &etag)],
    )
    .await;
    assert_eq!(cached.status, 304);

    let deleted = call(addr, "DELETE", &format!("/virtual-network/{uuid}"), None, &[]).await;
    assert_eq!(deleted.status, 200);
    let gone = get(addr, &format!("/virtual-network/{uuid}")).await;
    assert_eq!(gone.status, 404);
    assert_eq!(gone.body["exception"], "NotFoundError");
}

#[tokio::test]
async fn duplicate_fq_name_conflicts() {
    let (_server, addr) = start().await;
    project(addr, "p1").await;
    assert_eq!(network(addr, "p1", "vnA").await.status, 200);
    assert_eq!(network(addr, "p1", "vnA").await.status, 409);
}

#[tokio::test]
async fn referenced_network_is_not_deleted() {
    let (_server, addr) = start().await;
    project(addr, "p1").await;
    let vn = network(addr, "p1", "vnA").await;
    let vn_uuid = vn.body["virtual-network"]["uuid"].as_str().unwrap().to_string();
    let port = post(
        addr,
        "/virtual-machine-interfaces",
        json!({"virtual-machine-interface": {
            "fq_name": ["default-domain", "p1", "port1"],
            "parent_type": "project",
            "virtual_network_refs": [{"to": ["default-domain", "p1", "vnA"]}]
        }}),
    )
    .await;
    assert_eq!(port.status, 200, "{}", port.body);
    let port_uuid = port.body["virtual-machine-interface"]["uuid"].as_str().unwrap();

    let refused = call(addr, "DELETE", &format!("/virtual-network/{vn_uuid}"), None, &[]).await;
    assert_eq!(refused.status, 409);
    let msg = refused.body["msg"].as_str().unwrap();
    assert!(msg.contains("/virtual-machine-interface/"));
    assert!(msg.contains(port_uuid));
}

#[tokio::test]
async fn ref_update_is_idempotent() {
    let (_server, addr) = start().await;
    project(addr, "p1").await;
    network(addr, "p1", "vnA").await;
    let port = post(
        addr,
        "/virtual-machine-interfaces",
        json!({"virtual-machine-interface": {
            "fq_name": ["default-domain", "p1", "port1"],
            "parent_type": "project",
            "virtual_network_refs": [{"to": ["default-domain", "p1", "vnA"]}]
        }}),
    )
    .await;
    let port_uuid = port.body["virtual-machine-interface"]["uuid"]
        .as_str()
        .unwrap()
        .to_string();
    let sg = post(
        addr,
        "/security-groups",
        json!({"security-group": {
            "fq_name": ["default-domain", "p1", "web"],
            "parent_type": "project"
        }}),
    )
    .await;
    assert_eq!(sg.status, 200, "{}", sg.body);

    let update = |operation: &str| {
        json!({
            "type": "virtual-machine-interface",
            "uuid": port_uuid,
            "ref-type": "security-group",
            "operation": operation,
            "ref-fq-name": ["default-domain", "p1", "web"]
        })
    };
    for _ in 0..2 {
        let reply = post(addr, "/ref-update", update("ADD")).await;
        assert_eq!(reply.status, 200, "{}", reply.body);
        assert_eq!(reply.body["uuid"], json!(port_uuid));
    }
    let read = get(addr, &format!("/virtual-machine-interface/{port_uuid}")).await;
    assert_eq!(
        read.body["virtual-machine-interface"]["security_group_refs"]
            .as_array()
            .unwrap()
            .len(),
        1
    );
    for _ in 0..2 {
        let reply = post(addr, "/ref-update", update("DELETE")).await;
        assert_eq!(reply.status, 200, "{}", reply.body);
    }
}

#[tokio::test]
async fn project_quota_caps_networks() {
    let (_server, addr) = start().await;
    let uuid = project(addr, "p1").await;
    let reply = call(
        addr,
        "PUT",
        &format!("/project/{uuid}"),
        Some(&json!({"project": {"quota": {"virtual_network": 2}}})),
        &[],
    )
    .await;
    assert_eq!(reply.status, 200, "{}", reply.body);
    assert_eq!(network(addr, "p1", "a").await.status, 200);
    assert_eq!(network(addr, "p1", "b").await.status, 200);
    let third = network(addr, "p1", "c").await;
    assert_eq!(third.status, 412);
    assert_eq!(third.body["exception"], "OverQuota");
}

#[tokio::test]
async fn lookup_actions() {
    let (_server, addr) = start().await;
    let uuid = project(addr, "p1").await;
    let reply = post(
        addr,
        "/fqname-to-id",
        json!({"type": "project", "fq_name": ["default-domain", "p1"]}),
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["uuid"], json!(uuid));

    let reply = post(addr, "/id-to-fqname", json!({"uuid": uuid})).await;
    assert_eq!(reply.body["fq_name"], json!(["default-domain", "p1"]));
    assert_eq!(reply.body["type"], "project");

    let reply = post(
        addr,
        "/fqname-to-id",
        json!({"type": "project", "fq_name": ["default-domain", "nope"]}),
    )
    .await;
    assert_eq!(reply.status, 404);
}

#[tokio::test]
async fn useragent_store_and_retrieve() {
    let (_server, addr) = start().await;
    let reply = post(
        addr,
        "/useragent-kv",
        json!({"operation": "STORE", "key": "k", "value": "v"}),
    )
    .await;
    assert_eq!(reply.status, 200);
    let reply = post(addr, "/useragent-kv", json!({"operation": "RETRIEVE", "key": "k"})).await;
    assert_eq!(reply.body["value"], "v");
    let reply = post(
        addr,
        "/useragent-kv",
        json!({"operation": "RETRIEVE", "key": "missing"}),
    )
    .await;
    assert_eq!(reply.status, 404);
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let (_server, addr) = start().await;
    let reply = call(
        addr,
        "POST",
        "/virtual-networks",
        Some(&json!("not an object")),
        &[],
    )
    .await;
    assert_eq!(reply.status, 400);
    assert_eq!(get(addr, "/no-such-things").await.status, 404);
    let reply = get(addr, "/virtual-networks?page_limit=0").await;
    assert_eq!(reply.status, 400);
    let reply = post(addr, "/execute-job", json!({"job_template_id": "x"})).await;
    assert_eq!(reply.status, 405);
}

#[tokio::test]
async fn list_returns_created_networks() {
    let (_server, addr) = start().await;
    project(addr, "p1").await;
    network(addr, "p1", "a").await;
    network(addr, "p1", "b").await;
    let reply = get(
        addr,
        "/virtual-networks?parent_fq_name_str=default-domain:p1&parent_type=project",
    )
    .await;
    assert_eq!(reply.status, 200, "{}", reply.body);
    assert_eq!(reply.body["virtual-networks"].as_array().unwrap().len(), 2);
    let reply = get(
        addr,
        "/virtual-networks?parent_fq_name_str=default-domain:p1&parent_type=project&count=true",
    )
    .await;
    assert_eq!(reply.body["virtual-networks"]["count"], 2);
}
