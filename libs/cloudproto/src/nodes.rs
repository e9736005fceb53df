//! Node-facing types: static node descriptions, per-node-type unit
//! configuration, run requests, and monitoring/alert payloads.

use serde::{Deserialize, Serialize};

use crate::status::InstanceIdent;

/// Static description of a node as reported by its service manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    #[serde(rename = "nodeID")]
    pub node_id: String,
    pub node_type: String,
    #[serde(default)]
    pub total_ram: u64,
    #[serde(default)]
    pub num_cpus: u64,
}

/// A device a node exposes to service instances.
///
/// `shared_count` is the number of simultaneous allocations the device
/// supports. A zero count marks a device that is present but not subject to
/// allocation accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    #[serde(default)]
    pub shared_count: u64,
}

/// Per-node-type configuration from the unit config: scheduling priority
/// and the labels, resources, and devices instances may require.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUnitConfig {
    pub node_type: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

/// A device requirement in a service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDevice {
    pub name: String,
    #[serde(default)]
    pub permissions: String,
}

/// Storage and state quota limits for a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceQuotas {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_limit: Option<u64>,
}

/// Runtime requirements of a service, from its image configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Runner the service needs; empty selects the default runner.
    #[serde(default)]
    pub runner: String,
    #[serde(default)]
    pub devices: Vec<ServiceDevice>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub allowed_connections: Vec<String>,
    #[serde(default)]
    pub quotas: ServiceQuotas,
}

/// Network parameters assigned to an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkParameters {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub subnet: String,
    #[serde(rename = "dnsServers", default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub expose_ports: Vec<String>,
    #[serde(default)]
    pub allow_connections: Vec<String>,
}

/// Service payload of a run request sent to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRunInfo {
    pub id: String,
    pub aos_version: u64,
    pub url: String,
    #[serde(default)]
    pub gid: u32,
}

/// Layer payload of a run request sent to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerRunInfo {
    pub id: String,
    pub digest: String,
    pub aos_version: u64,
    pub url: String,
}

/// Fully resolved launch parameters for one instance on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    #[serde(flatten)]
    pub ident: InstanceIdent,
    pub uid: u32,
    pub priority: u64,
    #[serde(default)]
    pub storage_path: String,
    #[serde(default)]
    pub state_path: String,
    #[serde(default)]
    pub network_parameters: NetworkParameters,
}

/// Live resource usage of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMonitoringData {
    /// RAM in use, bytes.
    pub ram: u64,
    /// CPU in use, percent summed over cores.
    pub cpu: u64,
}

/// The resource axis a quota alert fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertParameter {
    Cpu,
    Ram,
}

/// Raised by a node when a system resource quota is exceeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemQuotaAlert {
    #[serde(rename = "nodeID")]
    pub node_id: String,
    pub parameter: AlertParameter,
}
