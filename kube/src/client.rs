// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Orchestrator API client: lists each reflected kind, then follows its watch stream and feeds
//! the events to the queue.

use crate::errors::{KubeError, KubeResult};
use crate::event::{EventQueue, EventType, Kind, KubeEvent};
use args::KubernetesConfig;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay before a broken watch is restarted.
const RESTART_DELAY: Duration = Duration::from_secs(3);

/// Splits a chunked body into newline-terminated records.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk, returning the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.partial.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                lines.push(line);
            }
        }
        lines
    }
}

pub struct KubeClient {
    http: reqwest::Client,
    base: String,
}

impl KubeClient {
    pub fn new(config: &KubernetesConfig) -> KubeResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base: format!("http://{}:{}", config.api_server, config.api_port),
        })
    }

    async fn get(&self, url: &str) -> KubeResult<reqwest::Response> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(KubeError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    /// The current objects of a kind as ADDED events, with the version to watch from.
    pub async fn list(&self, kind: Kind) -> KubeResult<(Vec<KubeEvent>, String)> {
        let url = format!("{}{}", self.base, kind.api_path());
        let body: Value = self.get(&url).await?.json().await?;
        let version = body
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let events = body
            .get("items")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .cloned()
            .map(|mut item| {
                if let Some(object) = item.as_object_mut() {
                    object.insert("kind".into(), Value::String(kind.to_string()));
                }
                KubeEvent::new(EventType::Added, item)
            })
            .collect();
        Ok((events, version))
    }

    /// Follow the watch stream of a kind from `version` until it ends or fails.
    pub async fn watch(&self, kind: Kind, version: &str, queue: &EventQueue) -> KubeResult<()> {
        let url = format!(
            "{}{}?watch=true&resourceVersion={version}",
            self.base,
            kind.api_path()
        );
        let mut response = self.get(&url).await?;
        let mut lines = LineBuffer::default();
        while let Some(chunk) = response.chunk().await? {
            for line in lines.push(&chunk) {
                match KubeEvent::parse_line(&line, kind) {
                    Ok(event) => {
                        debug!("{} {}", event.event_type, event.describe());
                        queue.push(event);
                    }
                    Err(e) => warn!("Ignoring {kind} watch record: {e}"),
                }
            }
        }
        Ok(())
    }

    /// List then watch a kind forever, starting over whenever the stream breaks.
    pub async fn follow(self: Arc<Self>, kind: Kind, queue: Arc<EventQueue>) {
        loop {
            match self.list(kind).await {
                Ok((events, version)) => {
                    info!("Listed {} {kind} objects", events.len());
                    for event in events {
                        queue.push(event);
                    }
                    match self.watch(kind, &version, &queue).await {
                        Ok(()) => debug!("Watch of {kind} ended"),
                        Err(e) => warn!("Watch of {kind} failed: {e}"),
                    }
                }
                Err(e) => warn!("Listing {kind} failed: {e}"),
            }
            tokio::time::sleep(RESTART_DELAY).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lines_span_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(br#"{"type":"ADD"#).is_empty());
        let lines = buf.push(b"ED\"}\r\n\n{\"a\":1}\n{\"b\"");
        assert_eq!(lines, vec![br#"{"type":"ADDED"}"#.to_vec(), br#"{"a":1}"#.to_vec()]);
        assert_eq!(buf.push(b":2}\n"), vec![br#"{"b":2}"#.to_vec()]);
    }

    #[test]
    fn client_targets_configured_server() {
        let config = KubernetesConfig {
            api_server: "10.0.0.5".to_string(),
            api_port: 6443,
            ..KubernetesConfig::default()
        };
        let client = KubeClient::new(&config).unwrap();
        assert_eq!(client.base, "http://10.0.0.5:6443");
    }
}
