use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::AmResult;

pub const ROLE_MASTER: &str = "master";
pub const ROLE_WORKER: &str = "worker";

/// Milliseconds since the epoch, the time unit of every timestamp
/// in the cluster description.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterPhase {
    Created,
    Submitted,
    Live,
    Stopped,
    Destroyed,
    Incomplete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Requested,
    Submitted,
    Live,
    Stopped,
    Destroyed,
}

/// One process instance in the cluster, keyed by its container identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub name: String,
    pub role: String,
    pub state: NodeState,
    pub host: String,
    /// The effective launch command, joined by spaces.
    pub command: String,
    pub diagnostics: String,
    pub exit_code: Option<i32>,
    /// Recent stdout/stderr lines, bounded.
    pub output: Vec<String>,
}

impl ClusterNode {
    pub fn new(name: impl Into<String>, role: &str, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.to_string(),
            state: NodeState::Requested,
            host: host.into(),
            command: String::new(),
            diagnostics: String::new(),
            exit_code: None,
            output: vec![],
        }
    }
}

/// The single authoritative document of desired and observed cluster
/// state. The JSON field names and their spelling are an external
/// contract consumed by control clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDescription {
    pub name: String,
    pub state: ClusterPhase,
    pub create_time: u64,
    pub start_time: u64,
    pub status_time: u64,
    /// Desired master count, 0 or 1.
    pub masters: u32,
    /// Desired worker count.
    pub workers: u32,
    pub master_heap: u32,
    pub worker_heap: u32,
    pub root_path: String,
    pub zk_hosts: String,
    pub zk_port: u16,
    pub zk_path: String,
    /// Backing-service properties copied from the staged site file,
    /// in file order.
    pub client_properties: IndexMap<String, String>,
    pub master_nodes: Vec<ClusterNode>,
    pub worker_nodes: Vec<ClusterNode>,
    pub requested_nodes: Vec<ClusterNode>,
    pub completed_nodes: Vec<ClusterNode>,
    pub failed_nodes: Vec<ClusterNode>,
}

impl ClusterDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ClusterPhase::Created,
            create_time: now_millis(),
            start_time: 0,
            status_time: 0,
            masters: 0,
            workers: 0,
            master_heap: 0,
            worker_heap: 0,
            root_path: String::new(),
            zk_hosts: String::new(),
            zk_port: 0,
            zk_path: String::new(),
            client_properties: IndexMap::new(),
            master_nodes: vec![],
            worker_nodes: vec![],
            requested_nodes: vec![],
            completed_nodes: vec![],
            failed_nodes: vec![],
        }
    }

    /// Refreshes `statusTime`, which must never move backwards.
    pub fn touch(&mut self) {
        self.status_time = self.status_time.max(now_millis());
    }

    pub fn to_json(&self) -> AmResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> AmResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClusterDescription {
        let mut description = ClusterDescription::new("test");
        description.state = ClusterPhase::Live;
        description.masters = 1;
        description.workers = 2;
        description.master_heap = 256;
        description.worker_heap = 512;
        description.zk_hosts = "zk1.example.com".to_string();
        description.zk_port = 2181;
        description.zk_path = "/regiondb".to_string();
        description.root_path = "file:///data/regiondb".to_string();
        description
            .client_properties
            .insert("regiondb.rootdir".to_string(), "file:///data/regiondb".to_string());
        description.worker_nodes.push(ClusterNode {
            state: NodeState::Live,
            command: "regiondb regionserver start".to_string(),
            ..ClusterNode::new("container_01_000002", ROLE_WORKER, "node1.example.com")
        });
        description
    }

    #[test]
    fn test_json_round_trip() {
        let description = sample();
        let json = description.to_json().unwrap();
        let parsed = ClusterDescription::from_json(&json).unwrap();
        assert_eq!(parsed, description);
    }

    #[test]
    fn test_json_field_names_are_stable() {
        let json = sample().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["state"], "LIVE");
        assert_eq!(value["workerHeap"], 512);
        assert_eq!(value["zkPort"], 2181);
        assert_eq!(value["workerNodes"][0]["state"], "LIVE");
        assert_eq!(value["workerNodes"][0]["exitCode"], serde_json::Value::Null);
        assert!(value["clientProperties"].is_object());
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut description = sample();
        description.touch();
        let first = description.status_time;
        description.touch();
        assert!(description.status_time >= first);
        assert!(first > 0);
    }
}
