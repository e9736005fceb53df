//! Cloud protocol data model for the convoy unit control plane.
//!
//! These are the wire-facing types exchanged between a unit and the fleet
//! cloud: the desired state the cloud pushes down and the unit status the
//! unit reports back. The transport itself (message framing, crypto,
//! service discovery) lives outside this crate; everything here is plain
//! data with serde representations.
//!
//! Conventions:
//!
//! - JSON field names are camelCase to match the cloud schema.
//! - Status groups are unordered sets compared by entity identity;
//!   emission order carries no meaning.
//! - `Vec<u8>` fields (hashes, keys) serialize as JSON byte arrays.

mod desired;
mod nodes;
mod status;

pub use desired::{
    Certificate, CertificateChain, ComponentInfo, DecryptionInfo, DesiredStatus, DownloadPackage,
    InstanceRequest, LayerInfo, ScheduleRule, ServiceInfo, Signs, SlotTime, TimeSlot,
    TimetableEntry, UpdateType,
};
pub use nodes::{
    AlertParameter, DeviceInfo, InstanceSpec, LayerRunInfo, NetworkParameters, NodeInfo,
    NodeMonitoringData, NodeUnitConfig, ServiceConfig, ServiceDevice, ServiceQuotas,
    ServiceRunInfo, SystemQuotaAlert,
};
pub use status::{
    ComponentStatus, EntityStatus, ErrorInfo, InstanceIdent, InstanceRunState, InstanceStatus,
    LayerStatus, ServiceStatus, UnitConfigStatus, UnitStatus,
};
