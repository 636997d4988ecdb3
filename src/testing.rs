//! In-memory cluster objects and host used by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::broadcast;

use crate::cluster::{CoordinationObject, Drainer, NodeObject};
use crate::error::{HostUpgradesError, Result};
use crate::host::{Host, HostConfig, HostInfo, UpgradeStatus};
use crate::types::{Condition, ConditionType, NodeRecord, NodeUpdate, ObjectEvent, ObjectRecord};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn conflict(what: &str) -> HostUpgradesError {
    HostUpgradesError::Conflict(what.to_string(), "the object has been modified".to_string())
}

struct ObjectInner {
    record: ObjectRecord,
    version: u64,
    conflicts: u32,
    writes: u32,
    scripted: VecDeque<Vec<ObjectEvent>>,
}

impl ObjectInner {
    fn bump(&mut self) {
        self.version += 1;
        self.record.resource_version = Some(self.version.to_string());
    }
}

/// A coordination object with compare-and-set semantics and live watches.
pub struct FakeObject {
    name: String,
    inner: Mutex<ObjectInner>,
    events: broadcast::Sender<ObjectEvent>,
}

impl FakeObject {
    pub fn new(name: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        let mut inner = ObjectInner {
            record: ObjectRecord {
                name: name.to_string(),
                ..Default::default()
            },
            version: 0,
            conflicts: 0,
            writes: 0,
            scripted: VecDeque::new(),
        };
        inner.bump();

        Self {
            name: name.to_string(),
            inner: Mutex::new(inner),
            events,
        }
    }

    pub fn with_annotation(self, key: &str, value: &str) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .record
                .annotations
                .insert(key.to_string(), value.to_string());
            inner.bump();
        }
        self
    }

    pub fn annotation(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().record.annotations.get(key).cloned()
    }

    /// Fail the next `n` writes with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.inner.lock().unwrap().conflicts = n;
    }

    /// Serve the next watch from a fixed list of events instead of live
    /// updates. The stream ends after the last event.
    pub fn script_watch(&self, events: Vec<ObjectEvent>) {
        self.inner.lock().unwrap().scripted.push_back(events);
    }

    /// Successful writes so far.
    pub fn writes(&self) -> u32 {
        self.inner.lock().unwrap().writes
    }

    /// Write made by another fleet member.
    pub fn set_externally(&self, key: &str, value: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        match value {
            Some(value) => {
                inner
                    .record
                    .annotations
                    .insert(key.to_string(), value.to_string());
            }
            None => {
                inner.record.annotations.remove(key);
            }
        }
        inner.bump();
        let _ = self.events.send(ObjectEvent::Modified(inner.record.clone()));
    }
}

#[async_trait]
impl CoordinationObject for FakeObject {
    fn describe(&self) -> String {
        format!("test/daemonsets/{}", self.name)
    }

    async fn get(&self) -> Result<ObjectRecord> {
        Ok(self.inner.lock().unwrap().record.clone())
    }

    async fn update_annotation(
        &self,
        resource_version: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<ObjectRecord> {
        let mut inner = self.inner.lock().unwrap();

        if inner.conflicts > 0 {
            inner.conflicts -= 1;
            return Err(conflict(&self.describe()));
        }
        if inner.record.version() != resource_version {
            return Err(conflict(&self.describe()));
        }

        match value {
            Some(value) => {
                inner
                    .record
                    .annotations
                    .insert(key.to_string(), value.to_string());
            }
            None => {
                inner.record.annotations.remove(key);
            }
        }
        inner.bump();
        inner.writes += 1;

        let _ = self.events.send(ObjectEvent::Modified(inner.record.clone()));
        Ok(inner.record.clone())
    }

    async fn watch(&self, resource_version: &str) -> Result<BoxStream<'static, ObjectEvent>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(events) = inner.scripted.pop_front() {
            return Ok(stream::iter(events).boxed());
        }

        let rx = self.events.subscribe();
        let missed = (inner.record.version() != resource_version)
            .then(|| ObjectEvent::Modified(inner.record.clone()));

        let live = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::iter(missed).chain(live).boxed())
    }
}

struct NodeInner {
    record: NodeRecord,
    version: u64,
    conflicts: u32,
    status_failures: u32,
    status_writes: u32,
}

impl NodeInner {
    fn bump(&mut self) {
        self.version += 1;
        self.record.resource_version = Some(self.version.to_string());
    }

    fn check(&mut self, resource_version: &str) -> Result<()> {
        if self.conflicts > 0 {
            self.conflicts -= 1;
            return Err(conflict(&self.record.name));
        }
        if self.record.version() != resource_version {
            return Err(conflict(&self.record.name));
        }
        Ok(())
    }
}

/// A node object with compare-and-set semantics.
pub struct FakeNode {
    inner: Mutex<NodeInner>,
    name: String,
}

impl FakeNode {
    pub fn new(name: &str) -> Self {
        let mut inner = NodeInner {
            record: NodeRecord {
                name: name.to_string(),
                ..Default::default()
            },
            version: 0,
            conflicts: 0,
            status_failures: 0,
            status_writes: 0,
        };
        inner.bump();

        Self {
            inner: Mutex::new(inner),
            name: name.to_string(),
        }
    }

    pub fn with_annotation(self, key: &str, value: &str) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .record
                .annotations
                .insert(key.to_string(), value.to_string());
            inner.bump();
        }
        self
    }

    pub fn with_condition(self, condition: Condition) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.record.conditions.push(condition);
            inner.bump();
        }
        self
    }

    pub fn with_unschedulable(self) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.record.unschedulable = true;
            inner.bump();
        }
        self
    }

    pub fn record(&self) -> NodeRecord {
        self.inner.lock().unwrap().record.clone()
    }

    pub fn annotation(&self, key: &str) -> Option<String> {
        self.record().annotations.get(key).cloned()
    }

    pub fn condition(&self, type_: ConditionType) -> Option<Condition> {
        self.record().condition(type_).cloned()
    }

    pub fn inject_conflicts(&self, n: u32) {
        self.inner.lock().unwrap().conflicts = n;
    }

    /// Fail the next `n` status writes with a connection error.
    pub fn fail_status_updates(&self, n: u32) {
        self.inner.lock().unwrap().status_failures = n;
    }

    pub fn status_writes(&self) -> u32 {
        self.inner.lock().unwrap().status_writes
    }

    /// Cordon without compare-and-set, as a drain would.
    pub fn cordon(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.record.unschedulable = true;
        inner.bump();
    }
}

#[async_trait]
impl NodeObject for FakeNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> Result<NodeRecord> {
        Ok(self.record())
    }

    async fn update(&self, resource_version: &str, update: &NodeUpdate) -> Result<NodeRecord> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(resource_version)?;
        update.apply(&mut inner.record);
        inner.bump();
        Ok(inner.record.clone())
    }

    async fn update_conditions(
        &self,
        resource_version: &str,
        conditions: &[Condition],
    ) -> Result<NodeRecord> {
        let mut inner = self.inner.lock().unwrap();

        if inner.status_failures > 0 {
            inner.status_failures -= 1;
            return Err(HostUpgradesError::Connection(
                format!("nodes/{}/status", inner.record.name),
                "connection refused".to_string(),
            ));
        }

        inner.check(resource_version)?;
        inner.record.conditions = conditions.to_vec();
        inner.bump();
        inner.status_writes += 1;
        Ok(inner.record.clone())
    }
}

/// Records drains and cordons the fake node.
pub struct FakeDrainer {
    drained: Mutex<Vec<String>>,
    node: Option<std::sync::Arc<FakeNode>>,
    fail: bool,
}

impl FakeDrainer {
    pub fn new(node: std::sync::Arc<FakeNode>) -> Self {
        Self {
            drained: Mutex::new(Vec::new()),
            node: Some(node),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            drained: Mutex::new(Vec::new()),
            node: None,
            fail: true,
        }
    }

    pub fn drained(&self) -> Vec<String> {
        self.drained.lock().unwrap().clone()
    }
}

#[async_trait]
impl Drainer for FakeDrainer {
    async fn drain(&self, node: &str) -> Result<()> {
        if self.fail {
            return Err(HostUpgradesError::Drain(
                node.to_string(),
                "Cannot evict pod as it would violate the pod's disruption budget".to_string(),
            ));
        }
        if let Some(fake) = &self.node {
            fake.cordon();
        }
        self.drained.lock().unwrap().push(node.to_string());
        Ok(())
    }
}

/// Scripted upgrade result.
#[derive(Debug, Clone)]
pub enum FakeUpgrade {
    Status(UpgradeStatus),
    Fail(String),
}

pub struct FakeHost {
    info: HostInfo,
    outcome: FakeUpgrade,
    delay: Option<Duration>,
    upgrades: AtomicU32,
    reboots: AtomicU32,
}

impl FakeHost {
    pub fn new(boot_time: DateTime<Utc>, outcome: FakeUpgrade) -> Self {
        Self {
            info: HostInfo {
                operating_system: "Ubuntu".to_string(),
                operating_system_release: "22.04".to_string(),
                kernel: "Linux".to_string(),
                kernel_release: "6.8.0-45-generic".to_string(),
                boot_time,
            },
            outcome,
            delay: None,
            upgrades: AtomicU32::new(0),
            reboots: AtomicU32::new(0),
        }
    }

    pub fn up_to_date(boot_time: DateTime<Utc>) -> Self {
        Self::new(
            boot_time,
            FakeUpgrade::Status(UpgradeStatus {
                upgrade_log: "0 upgraded".to_string(),
                ..Default::default()
            }),
        )
    }

    pub fn reboot_required(boot_time: DateTime<Utc>, since: DateTime<Utc>) -> Self {
        Self::new(
            boot_time,
            FakeUpgrade::Status(UpgradeStatus {
                reboot_required: true,
                reboot_required_since: Some(since),
                reboot_required_message: "*** System restart required ***".to_string(),
                upgrade_log: "1 upgraded".to_string(),
            }),
        )
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn upgrades(&self) -> u32 {
        self.upgrades.load(Ordering::SeqCst)
    }

    pub fn reboots(&self) -> u32 {
        self.reboots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Host for FakeHost {
    fn info(&self) -> &HostInfo {
        &self.info
    }

    async fn configure(&mut self, _config: &HostConfig) -> Result<()> {
        Ok(())
    }

    async fn upgrade(&self) -> Result<UpgradeStatus> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.outcome {
            FakeUpgrade::Status(status) => Ok(status.clone()),
            FakeUpgrade::Fail(message) => Err(HostUpgradesError::Upgrade(message.clone())),
        }
    }

    async fn reboot(&self) -> Result<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
