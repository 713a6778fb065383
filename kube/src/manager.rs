// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The adapter's control loop.
//!
//! Only the elected worker reflects events. Standby workers keep their local mirror current
//! from the bus. On election the mirror is rebuilt and the cluster objects provisioned before
//! the first event is taken. Losing the session interrupts the event in flight, which goes
//! back to the queue, and drops the pending re-evaluations.

use crate::event::{EventQueue, KubeEvent};
use crate::reflector::Reflector;
use coord::Leadership;
use id::Uuid;
use mgmt::ApiServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Delay before retrying a failed campaign or provisioning.
const RETRY: Duration = Duration::from_secs(1);

/// Resolves once the session behind `lost` is gone.
async fn wait_lost(lost: &mut watch::Receiver<bool>) {
    while !*lost.borrow_and_update() {
        if lost.changed().await.is_err() {
            return;
        }
    }
}

pub struct KubeManager {
    api: Arc<ApiServer>,
    queue: Arc<EventQueue>,
    reflector: Reflector,
    candidate: String,
}

impl KubeManager {
    #[must_use]
    pub fn new(api: Arc<ApiServer>) -> Self {
        let candidate = format!("worker-{}-{}", api.config().worker_id, Uuid::new_v4());
        Self {
            queue: Arc::new(EventQueue::new()),
            reflector: Reflector::new(api.clone()),
            api,
            candidate,
        }
    }

    #[must_use]
    pub fn queue(&self) -> Arc<EventQueue> {
        self.queue.clone()
    }

    #[must_use]
    pub fn reflector(&self) -> &Reflector {
        &self.reflector
    }

    pub fn reflector_mut(&mut self) -> &mut Reflector {
        &mut self.reflector
    }

    fn election_path(&self) -> String {
        format!("{}/kube-manager", self.api.config().cluster_prefix())
    }

    /// Reflect one event, then fold in what it caused and re-evaluate linked records.
    pub async fn process(&mut self, event: &KubeEvent) {
        if let Err(e) = self.reflector.reflect(event).await {
            warn!("Reflecting {} failed: {e}", event.describe());
        }
        self.reflector.catch_up();
        self.reflector.reevaluate().await;
    }

    /// Process every queued event. Returns how many there were.
    pub async fn process_pending(&mut self) -> usize {
        let mut count = 0;
        while let Some(event) = self.queue.try_pop() {
            self.process(&event).await;
            count += 1;
        }
        count
    }

    async fn provision(&mut self) {
        while let Err(e) = self.reflector.provision().await {
            warn!("Provisioning failed, retrying: {e}");
            tokio::time::sleep(RETRY).await;
        }
    }

    /// Run forever.
    pub async fn run(mut self) {
        if self.api.config().kubernetes.nested_mode {
            info!("Nested mode: running without election");
            self.reflector.rebuild();
            self.provision().await;
            let (_session, mut lost) = watch::channel(false);
            self.lead(&mut lost).await;
            return;
        }
        loop {
            let mut leadership = self.standby().await;
            info!("{} is the adapter leader", self.candidate);
            self.reflector.rebuild();
            match self.reflector.provision().await {
                Ok(()) => self.lead(&mut leadership.lost).await,
                Err(e) => {
                    warn!("Provisioning failed, stepping down: {e}");
                    tokio::time::sleep(RETRY).await;
                }
            }
            self.reflector.clear_dirty();
            self.resign(leadership).await;
        }
    }

    async fn resign(&self, leadership: Leadership) {
        if leadership.is_lost() {
            warn!("{} lost its leadership", self.candidate);
        }
        self.api.coord().resign(leadership).await;
    }

    /// Campaign until elected, following the bus meanwhile.
    async fn standby(&mut self) -> Leadership {
        let coord = self.api.coord().clone();
        let path = self.election_path();
        let candidate = self.candidate.clone();
        let (_, mut bus) = self.api.db().bus().subscribe(u64::MAX);
        let mut bus_open = true;
        let mut campaign = coord.campaign(&path, &candidate);
        loop {
            tokio::select! {
                elected = &mut campaign => match elected {
                    Ok(leadership) => return leadership,
                    Err(e) => {
                        warn!("Campaign for {path} failed: {e}");
                        tokio::time::sleep(RETRY).await;
                        campaign = coord.campaign(&path, &candidate);
                    }
                },
                record = bus.recv(), if bus_open => match record {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        self.reflector.catch_up();
                        self.reflector.clear_dirty();
                    }
                    Err(RecvError::Closed) => bus_open = false,
                },
            }
        }
    }

    /// Take events until `lost` fires.
    async fn lead(&mut self, lost: &mut watch::Receiver<bool>) {
        let queue = self.queue.clone();
        let (_, mut bus) = self.api.db().bus().subscribe(u64::MAX);
        let mut bus_open = true;
        loop {
            tokio::select! {
                biased;
                () = wait_lost(lost) => return,
                record = bus.recv(), if bus_open => match record {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        self.reflector.catch_up();
                        self.reflector.reevaluate().await;
                    }
                    Err(RecvError::Closed) => bus_open = false,
                },
                event = queue.pop() => {
                    tokio::select! {
                        biased;
                        () = wait_lost(lost) => {
                            debug!("Requeueing {}", event.describe());
                            queue.requeue(event);
                            return;
                        }
                        () = self.process(&event) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use mgmt::testing::TestServer;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn failed_event_is_logged_and_dropped() {
        let server = TestServer::new().await.unwrap();
        let mut manager = KubeManager::new(server.api.clone());
        manager.queue().push(KubeEvent::new(
            EventType::Added,
            json!({
                "kind": "NetworkAttachmentDefinition",
                "metadata": {"name": "blue", "namespace": "prod", "uid": "u1"},
            }),
        ));
        assert_eq!(manager.process_pending().await, 1);
        assert!(manager.queue().is_empty());
        assert!(logs_contain("misses a valid opencontrail.org/cidr"));
    }

    #[tokio::test]
    async fn wait_lost_fires_on_dropped_session() {
        let (session, mut lost) = watch::channel(false);
        drop(session);
        wait_lost(&mut lost).await;
        let (session, mut lost) = watch::channel(false);
        session.send(true).unwrap();
        wait_lost(&mut lost).await;
    }
}
