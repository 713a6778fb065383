// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Watch events and the queue feeding the reflectors.
//!
//! The queue hands out events by kind priority, so that a namespace is reflected before the
//! pods it holds and a service before its endpoints. Events of one kind keep arrival order.

use crate::errors::{KubeError, KubeResult};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// Reflected object kinds, in processing order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, EnumIter,
)]
pub enum Kind {
    Namespace,
    #[strum(serialize = "NetworkAttachmentDefinition")]
    Network,
    Pod,
    Service,
    Endpoints,
    Ingress,
    NetworkPolicy,
}

impl Kind {
    /// Collection path on the orchestrator API.
    #[must_use]
    pub fn api_path(self) -> &'static str {
        match self {
            Kind::Namespace => "/api/v1/namespaces",
            Kind::Network => "/apis/k8s.cni.cncf.io/v1/network-attachment-definitions",
            Kind::Pod => "/api/v1/pods",
            Kind::Service => "/api/v1/services",
            Kind::Endpoints => "/api/v1/endpoints",
            Kind::Ingress => "/apis/networking.k8s.io/v1/ingresses",
            Kind::NetworkPolicy => "/apis/networking.k8s.io/v1/networkpolicies",
        }
    }

    pub fn all() -> impl Iterator<Item = Kind> {
        Kind::iter()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KubeEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub object: Value,
}

impl KubeEvent {
    #[must_use]
    pub fn new(event_type: EventType, object: Value) -> Self {
        Self { event_type, object }
    }

    /// Parse one line of a watch stream. `kind` fills in objects that do not name theirs.
    pub fn parse_line(line: &[u8], kind: Kind) -> KubeResult<Self> {
        let mut event: KubeEvent = serde_json::from_slice(line)?;
        if let Some(object) = event.object.as_object_mut() {
            object
                .entry("kind")
                .or_insert_with(|| Value::String(kind.to_string()));
        }
        Ok(event)
    }

    pub fn kind(&self) -> KubeResult<Kind> {
        self.object
            .get("kind")
            .and_then(Value::as_str)
            .and_then(|k| k.parse().ok())
            .ok_or_else(|| KubeError::Malformed(self.describe(), "a known kind"))
    }

    fn metadata(&self, key: &str) -> Option<&str> {
        self.object.get("metadata")?.get(key)?.as_str()
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.metadata("name")
    }

    /// The namespace; namespaces are their own.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.metadata("namespace").or_else(|| {
            (self.object.get("kind").and_then(Value::as_str) == Some("Namespace"))
                .then(|| self.name())
                .flatten()
        })
    }

    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.metadata("uid")
    }

    pub fn require_name(&self) -> KubeResult<&str> {
        self.name()
            .ok_or_else(|| KubeError::Malformed(self.describe(), "metadata.name"))
    }

    pub fn require_namespace(&self) -> KubeResult<&str> {
        self.namespace()
            .ok_or_else(|| KubeError::Malformed(self.describe(), "metadata.namespace"))
    }

    pub fn require_uid(&self) -> KubeResult<&str> {
        self.uid()
            .ok_or_else(|| KubeError::Malformed(self.describe(), "metadata.uid"))
    }

    #[must_use]
    pub fn labels(&self) -> Map<String, Value> {
        self.object
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.object
            .pointer("/metadata/annotations")?
            .get(key)?
            .as_str()
    }

    #[must_use]
    pub fn spec(&self) -> &Value {
        self.object.get("spec").unwrap_or(&Value::Null)
    }

    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{} {}/{}",
            self.object.get("kind").and_then(Value::as_str).unwrap_or("?"),
            self.metadata("namespace").unwrap_or("-"),
            self.name().unwrap_or("?")
        )
    }
}

struct Pending {
    next: u64,
    events: BTreeMap<(Kind, u64), KubeEvent>,
}

impl Default for Pending {
    // leaves room below for requeued events
    fn default() -> Self {
        Self {
            next: 1 << 32,
            events: BTreeMap::new(),
        }
    }
}

/// Events waiting for a reflector.
#[derive(Default)]
pub struct EventQueue {
    pending: Mutex<Pending>,
    arrived: Notify,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event. Events without a known kind are dropped.
    pub fn push(&self, event: KubeEvent) {
        let kind = match event.kind() {
            Ok(kind) => kind,
            Err(e) => {
                debug!("Dropping event: {e}");
                return;
            }
        };
        let mut pending = self.pending.lock();
        let seq = pending.next;
        pending.next += 1;
        pending.events.insert((kind, seq), event);
        drop(pending);
        self.arrived.notify_one();
    }

    /// Put back an event whose processing was interrupted, ahead of the ones of its kind.
    pub fn requeue(&self, event: KubeEvent) {
        let Ok(kind) = event.kind() else {
            return;
        };
        let mut pending = self.pending.lock();
        let first = pending
            .events
            .range((kind, 0)..=(kind, u64::MAX))
            .next()
            .map_or(pending.next, |((_, seq), _)| *seq);
        let Some(seq) = first.checked_sub(1) else {
            return;
        };
        pending.events.insert((kind, seq), event);
        drop(pending);
        self.arrived.notify_one();
    }

    #[must_use]
    pub fn try_pop(&self) -> Option<KubeEvent> {
        self.pending.lock().events.pop_first().map(|(_, e)| e)
    }

    /// Wait for the next event.
    pub async fn pop(&self) -> KubeEvent {
        loop {
            let arrived = self.arrived.notified();
            if let Some(event) = self.try_pop() {
                return event;
            }
            arrived.await;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn event(kind: &str, name: &str) -> KubeEvent {
        KubeEvent::new(
            EventType::Added,
            json!({"kind": kind, "metadata": {"name": name, "namespace": "ns", "uid": name}}),
        )
    }

    #[test]
    fn kinds_come_out_in_processing_order() {
        let queue = EventQueue::new();
        queue.push(event("NetworkPolicy", "np"));
        queue.push(event("Pod", "p1"));
        queue.push(event("Service", "svc"));
        queue.push(event("Namespace", "ns"));
        queue.push(event("Pod", "p2"));
        queue.push(event("Endpoints", "svc"));
        let order: Vec<String> = std::iter::from_fn(|| queue.try_pop())
            .map(|e| e.name().unwrap_or_default().to_string())
            .collect();
        assert_eq!(order, vec!["ns", "p1", "p2", "svc", "svc", "np"]);
    }

    #[test]
    fn requeued_event_goes_first_within_its_kind() {
        let queue = EventQueue::new();
        queue.push(event("Pod", "p1"));
        queue.push(event("Pod", "p2"));
        let first = queue.try_pop().unwrap();
        queue.requeue(first);
        assert_eq!(queue.try_pop().unwrap().name(), Some("p1"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn unknown_kinds_are_dropped() {
        let queue = EventQueue::new();
        queue.push(event("ConfigMap", "cm"));
        assert!(queue.is_empty());
    }

    #[test]
    fn watch_line_gets_its_kind() {
        let line = br#"{"type":"DELETED","object":{"metadata":{"name":"web","namespace":"prod"}}}"#;
        let event = KubeEvent::parse_line(line, Kind::Service).unwrap();
        assert_eq!(event.event_type, EventType::Deleted);
        assert_eq!(event.kind().unwrap(), Kind::Service);
        assert_eq!(event.namespace(), Some("prod"));
    }

    #[test]
    fn namespace_is_its_own() {
        let ns = KubeEvent::new(
            EventType::Added,
            json!({"kind": "Namespace", "metadata": {"name": "prod"}}),
        );
        assert_eq!(ns.namespace(), Some("prod"));
    }

    #[tokio::test]
    async fn pop_waits_for_a_push() {
        let queue = std::sync::Arc::new(EventQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(event("Namespace", "late"));
        let got = waiter.await.unwrap();
        assert_eq!(got.name(), Some("late"));
    }
}
