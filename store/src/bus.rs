// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Change notifications.
//!
//! Writers enqueue records while committing, so sequence numbers follow commit order. A
//! publisher task moves records from the queue to the retained log and to live subscribers;
//! the number of records waiting for the publisher is the backpressure indicator.

use config::FqName;
use id::Uuid;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use strum::{Display, EnumString};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ChangeOper {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub seq: u64,
    pub oper: ChangeOper,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub uuid: Uuid,
    pub fq_name: FqName,
    pub attrs: Value,
}

pub struct MessageBus {
    next_seq: AtomicU64,
    pending: AtomicUsize,
    queue_tx: mpsc::UnboundedSender<ChangeRecord>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<ChangeRecord>>>,
    log: Mutex<VecDeque<ChangeRecord>>,
    log_capacity: usize,
    live: broadcast::Sender<ChangeRecord>,
}

impl MessageBus {
    /// `log_capacity` bounds the records retained for replay.
    #[must_use]
    pub fn new(log_capacity: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (live, _) = broadcast::channel(1024);
        Self {
            next_seq: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            log: Mutex::new(VecDeque::new()),
            log_capacity,
            live,
        }
    }

    /// Enqueue a record. Must be called while the write it describes is being committed.
    pub(crate) fn enqueue(
        &self,
        oper: ChangeOper,
        resource_type: &str,
        uuid: Uuid,
        fq_name: &FqName,
        attrs: Value,
    ) {
        let record = ChangeRecord {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            oper,
            resource_type: resource_type.to_string(),
            uuid,
            fq_name: fq_name.clone(),
            attrs,
        };
        debug!("enqueue {} {} {}", record.oper, record.resource_type, record.uuid);
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(record).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Records enqueued and not yet published.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn publish(&self, record: ChangeRecord) {
        let mut log = self.log.lock();
        if log.len() >= self.log_capacity {
            log.pop_front();
        }
        log.push_back(record.clone());
        // no subscriber is fine
        let _ = self.live.send(record);
        drop(log);
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Publish everything queued so far without a publisher task.
    pub fn drain(&self) -> usize {
        let mut rx = self.queue_rx.lock();
        let Some(rx) = rx.as_mut() else {
            return 0;
        };
        let mut published = 0;
        while let Ok(record) = rx.try_recv() {
            self.publish(record);
            published += 1;
        }
        published
    }

    /// Run the publisher until every sender is gone. Only one publisher may run.
    pub async fn run_publisher(&self) {
        let Some(mut rx) = self.queue_rx.lock().take() else {
            return;
        };
        info!("Message bus publisher started");
        while let Some(record) = rx.recv().await {
            self.publish(record);
        }
    }

    /// Records published after `after_seq`, plus a receiver for the ones to come.
    ///
    /// No record is missed or duplicated between the two.
    pub fn subscribe(
        &self,
        after_seq: u64,
    ) -> (Vec<ChangeRecord>, broadcast::Receiver<ChangeRecord>) {
        let log = self.log.lock();
        let replay = log.iter().filter(|r| r.seq > after_seq).cloned().collect();
        let rx = self.live.subscribe();
        drop(log);
        (replay, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fq() -> FqName {
        FqName::from(&["d", "p", "vn"][..])
    }

    #[test]
    fn pending_until_drained() {
        let bus = MessageBus::new(16);
        let uuid = Uuid::new_v4();
        bus.enqueue(ChangeOper::Create, "virtual-network", uuid, &fq(), json!({}));
        bus.enqueue(ChangeOper::Update, "virtual-network", uuid, &fq(), json!({}));
        assert_eq!(bus.pending(), 2);
        assert_eq!(bus.drain(), 2);
        assert_eq!(bus.pending(), 0);
        let (replay, _) = bus.subscribe(0);
        let opers: Vec<ChangeOper> = replay.iter().map(|r| r.oper).collect();
        assert_eq!(opers, vec![ChangeOper::Create, ChangeOper::Update]);
        let (replay, _) = bus.subscribe(1);
        assert_eq!(replay.len(), 1);
    }

    #[test]
    fn retained_log_is_bounded() {
        let bus = MessageBus::new(2);
        for _ in 0..3 {
            bus.enqueue(ChangeOper::Create, "tag", Uuid::new_v4(), &fq(), json!({}));
        }
        bus.drain();
        let (replay, _) = bus.subscribe(0);
        assert_eq!(replay.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn publisher_task_feeds_subscribers() {
        let bus = std::sync::Arc::new(MessageBus::new(16));
        let (_, mut rx) = bus.subscribe(0);
        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.run_publisher().await })
        };
        let uuid = Uuid::new_v4();
        bus.enqueue(ChangeOper::Delete, "project", uuid, &fq(), json!({}));
        let record = rx.recv().await.expect("Should receive");
        assert_eq!(record.uuid, uuid);
        assert_eq!(record.oper, ChangeOper::Delete);
        assert_eq!(bus.pending(), 0);
        publisher.abort();
    }
}
