//! Desired unit state pushed by the cloud.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::status::InstanceIdent;

/// How an update run is gated once its artifacts are downloaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateType {
    /// Apply as soon as the download finishes.
    #[default]
    ForceUpdate,
    /// Apply only after an explicit start-update trigger.
    TriggerUpdate,
    /// Apply inside the next permitted timetable window.
    TimetableUpdate,
}

/// One permitted window within a day. The boundary values carry only a
/// time of day; a non-zero date part is rejected during validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlot {
    pub start: SlotTime,
    pub finish: SlotTime,
}

/// Weekly timetable entry. `day_of_week` is ISO: 1 = Monday .. 7 = Sunday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableEntry {
    pub day_of_week: u32,
    #[serde(default)]
    pub time_slots: Vec<TimeSlot>,
}

/// A time-of-day value as transmitted by the cloud.
///
/// The wire form is `"HH:MM:SS"`; the cloud may also send a full timestamp,
/// which is preserved so validation can reject a non-zero date part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotTime(pub NaiveDateTime);

impl SlotTime {
    /// The zero date used for pure time-of-day values.
    fn zero_date() -> NaiveDate {
        // Year zero keeps ordering intact for any real timestamp.
        NaiveDate::from_ymd_opt(0, 1, 1).unwrap_or_default()
    }

    pub fn from_time(time: NaiveTime) -> Self {
        Self(NaiveDateTime::new(Self::zero_date(), time))
    }

    pub fn from_hms(hour: u32, min: u32, sec: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, min, sec).map(Self::from_time)
    }

    /// True when the value carries more than a time of day.
    pub fn has_date_part(&self) -> bool {
        self.0.date() != Self::zero_date()
    }

    pub fn time(&self) -> NaiveTime {
        self.0.time()
    }
}

impl Serialize for SlotTime {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.has_date_part() {
            serializer.serialize_str(&self.0.format("%Y-%m-%dT%H:%M:%S").to_string())
        } else {
            serializer.serialize_str(&self.0.format("%H:%M:%S").to_string())
        }
    }
}

impl<'de> Deserialize<'de> for SlotTime {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;

        if let Ok(time) = NaiveTime::parse_from_str(&raw, "%H:%M:%S") {
            return Ok(Self::from_time(time));
        }

        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S")
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Update gating rule attached to a desired status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRule {
    #[serde(rename = "type", default)]
    pub update_type: UpdateType,
    #[serde(default)]
    pub timetable: Vec<TimetableEntry>,
    /// Seconds the update may stay pending before it times out.
    #[serde(rename = "ttl", skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

/// Decryption parameters for a downloaded package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptionInfo {
    pub block_alg: String,
    #[serde(default)]
    pub block_iv: Vec<u8>,
    #[serde(default)]
    pub block_key: Vec<u8>,
    pub asym_alg: String,
}

/// Signature over a package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signs {
    pub chain_name: String,
    pub alg: String,
    #[serde(default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub trusted_timestamp: String,
}

/// A certificate referenced by a signature chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    #[serde(default)]
    pub certificate: Vec<u8>,
    pub fingerprint: String,
}

/// A named chain of certificate fingerprints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateChain {
    pub name: String,
    #[serde(default)]
    pub fingerprints: Vec<String>,
}

/// Download, integrity, and decryption metadata for one artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadPackage {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub sha256: Vec<u8>,
    #[serde(default)]
    pub sha512: Vec<u8>,
    #[serde(default)]
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decryption_info: Option<DecryptionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signs: Option<Signs>,
}

/// Target version of a firmware component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentInfo {
    pub id: String,
    pub vendor_version: String,
    #[serde(flatten)]
    pub package: DownloadPackage,
}

/// Target version of a container layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    pub id: String,
    pub digest: String,
    pub aos_version: u64,
    #[serde(flatten)]
    pub package: DownloadPackage,
}

/// Target version of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub id: String,
    pub aos_version: u64,
    #[serde(rename = "providerID", default)]
    pub provider_id: String,
    #[serde(flatten)]
    pub package: DownloadPackage,
}

/// Desired run counts for a service + subject pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRequest {
    #[serde(rename = "serviceID")]
    pub service_id: String,
    #[serde(rename = "subjectID")]
    pub subject_id: String,
    pub priority: u64,
    pub num_instances: u64,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl InstanceRequest {
    /// True when `ident` names one of the instances this request asks for.
    pub fn covers(&self, ident: &InstanceIdent) -> bool {
        self.service_id == ident.service_id
            && self.subject_id == ident.subject_id
            && ident.instance < self.num_instances
    }
}

/// The declarative goal the cloud pushes for a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_config: Option<serde_json::Value>,
    #[serde(default)]
    pub components: Vec<ComponentInfo>,
    #[serde(default)]
    pub layers: Vec<LayerInfo>,
    #[serde(default)]
    pub services: Vec<ServiceInfo>,
    #[serde(default)]
    pub instances: Vec<InstanceRequest>,
    #[serde(default)]
    pub certificates: Vec<Certificate>,
    #[serde(default)]
    pub certificate_chains: Vec<CertificateChain>,
    #[serde(rename = "fotaSchedule", default)]
    pub fota_schedule: ScheduleRule,
    #[serde(rename = "sotaSchedule", default)]
    pub sota_schedule: ScheduleRule,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_time_parses_time_of_day() {
        let slot: SlotTime = serde_json::from_str("\"08:30:00\"").unwrap();
        assert!(!slot.has_date_part());
        assert_eq!(slot.time(), NaiveTime::from_hms_opt(8, 30, 0).unwrap());
    }

    #[test]
    fn slot_time_keeps_date_part() {
        let slot: SlotTime = serde_json::from_str("\"2024-03-01T08:30:00\"").unwrap();
        assert!(slot.has_date_part());
    }

    #[test]
    fn schedule_rule_defaults_to_force_update() {
        let rule: ScheduleRule = serde_json::from_str("{}").unwrap();
        assert_eq!(rule.update_type, UpdateType::ForceUpdate);
        assert!(rule.timetable.is_empty());
        assert!(rule.ttl_seconds.is_none());
    }

    #[test]
    fn desired_status_round_trip() {
        let desired = DesiredStatus {
            unit_config: Some(serde_json::json!({"vendorVersion": "1.1"})),
            components: vec![ComponentInfo {
                id: "comp1".to_string(),
                vendor_version: "2.0".to_string(),
                package: DownloadPackage {
                    urls: vec!["https://cloud/comp1".to_string()],
                    sha256: vec![1, 2, 3],
                    size: 1024,
                    ..Default::default()
                },
            }],
            instances: vec![InstanceRequest {
                service_id: "svc".to_string(),
                subject_id: "subj".to_string(),
                priority: 100,
                num_instances: 2,
                labels: vec!["label1".to_string()],
            }],
            ..Default::default()
        };

        let json = serde_json::to_string(&desired).unwrap();
        let parsed: DesiredStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, desired);
    }

    #[test]
    fn instance_request_covers_indexes_below_count() {
        let request = InstanceRequest {
            service_id: "svc".to_string(),
            subject_id: "subj".to_string(),
            priority: 0,
            num_instances: 2,
            labels: vec![],
        };

        let ident = |instance| InstanceIdent {
            service_id: "svc".to_string(),
            subject_id: "subj".to_string(),
            instance,
        };

        assert!(request.covers(&ident(0)));
        assert!(request.covers(&ident(1)));
        assert!(!request.covers(&ident(2)));
    }
}
