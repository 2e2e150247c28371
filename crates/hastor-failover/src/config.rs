//! Persisted failover configuration.

use std::collections::{BTreeMap, BTreeSet};

use hastor_sys::{PoolInfo, ValidationErrors};
use serde::{Deserialize, Serialize};

/// Default VRRP grace timeout.
pub const DEFAULT_GRACE_TIMEOUT_SEC: u32 = 2;

/// One storage volume under failover control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Pool name.
    pub name: String,
    /// Pool GUID, used for import.
    pub guid: String,
    /// Last known status; refreshed from the pool service on every event.
    #[serde(default = "offline")]
    pub status: String,
}

fn offline() -> String {
    "OFFLINE".to_string()
}

impl Volume {
    /// A volume in state `OFFLINE`.
    pub fn new(name: impl Into<String>, guid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guid: guid.into(),
            status: offline(),
        }
    }

    /// Whether the pool is currently imported.
    pub fn is_imported(&self) -> bool {
        PoolInfo {
            name: self.name.clone(),
            guid: self.guid.clone(),
            status: self.status.clone(),
        }
        .is_imported()
    }
}

/// Failover configuration singleton. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Failover disabled by the administrator.
    pub disabled: bool,
    /// This node is the preferred master when failover is disabled.
    #[serde(alias = "master")]
    pub master_preferred: bool,
    /// Seconds without advertisements before the peer is presumed gone.
    pub grace_timeout_sec: u32,
    /// Heartbeat interfaces between the two controllers.
    pub internal_interfaces: BTreeSet<String>,
    /// Critical interface groups, keyed by group id.
    pub critical_groups: BTreeMap<u32, BTreeSet<String>>,
    /// Interfaces whose state changes never trigger failover.
    pub non_critical_interfaces: BTreeSet<String>,
    /// Volumes imported on promotion, in order.
    pub volumes: Vec<Volume>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            disabled: true,
            master_preferred: false,
            grace_timeout_sec: DEFAULT_GRACE_TIMEOUT_SEC,
            internal_interfaces: BTreeSet::new(),
            critical_groups: BTreeMap::new(),
            non_critical_interfaces: BTreeSet::new(),
            volumes: Vec::new(),
        }
    }
}

impl FailoverConfig {
    /// Whether `ifname` is a heartbeat interface.
    pub fn is_internal(&self, ifname: &str) -> bool {
        self.internal_interfaces.contains(ifname)
    }

    /// Whether `ifname` is marked non-critical.
    pub fn is_non_critical(&self, ifname: &str) -> bool {
        self.non_critical_interfaces.contains(ifname)
    }

    /// Other members of every critical group containing `ifname`.
    pub fn siblings(&self, ifname: &str) -> BTreeSet<String> {
        self.critical_groups
            .values()
            .filter(|members| members.contains(ifname))
            .flat_map(|members| members.iter())
            .filter(|m| m.as_str() != ifname)
            .cloned()
            .collect()
    }

    /// Validate the configuration as a whole.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let schema = "failover";

        if self.grace_timeout_sec == 0 {
            errors.add(format!("{schema}.grace_timeout_sec"), "Timeout must be at least one second.");
        }

        let critical: BTreeSet<&String> = self.critical_groups.values().flatten().collect();
        if !self.disabled && critical.is_empty() {
            errors.add(
                format!("{schema}.disabled"),
                "At least one critical interface group is required to enable failover.",
            );
        }
        for (group, members) in &self.critical_groups {
            if members.is_empty() {
                errors.add(format!("{schema}.critical_groups.{group}"), "Critical group has no interfaces.");
            }
        }
        for ifname in critical {
            if self.is_internal(ifname) {
                errors.add(
                    format!("{schema}.critical_groups"),
                    format!("{ifname} is an internal interface and cannot be critical."),
                );
            }
            if self.is_non_critical(ifname) {
                errors.add(
                    format!("{schema}.non_critical_interfaces"),
                    format!("{ifname} is in a critical group and cannot also be non-critical."),
                );
            }
        }

        let mut seen = BTreeSet::new();
        for (i, vol) in self.volumes.iter().enumerate() {
            if vol.name.is_empty() || vol.guid.is_empty() {
                errors.add(format!("{schema}.volumes.{i}"), "Volume name and guid are required.");
            }
            if !seen.insert(vol.guid.as_str()) {
                errors.add(format!("{schema}.volumes.{i}.guid"), format!("Duplicate volume guid {}.", vol.guid));
            }
        }
        errors.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enabled() -> FailoverConfig {
        FailoverConfig {
            disabled: false,
            internal_interfaces: BTreeSet::from(["eth2".to_string()]),
            critical_groups: BTreeMap::from([(1, BTreeSet::from(["eth0".to_string(), "eth1".to_string()]))]),
            volumes: vec![Volume::new("tank", "0xAB")],
            ..FailoverConfig::default()
        }
    }

    #[test]
    fn test_default_is_disabled_and_valid() {
        let cfg = FailoverConfig::default();
        assert!(cfg.disabled);
        assert_eq!(cfg.grace_timeout_sec, 2);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_enable_requires_critical_group() {
        let cfg = FailoverConfig {
            disabled: false,
            ..FailoverConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.errors()[0].attribute, "failover.disabled");
        enabled().validate().unwrap();
    }

    #[test]
    fn test_critical_overlap_rejected() {
        let mut cfg = enabled();
        cfg.internal_interfaces.insert("eth0".into());
        cfg.non_critical_interfaces.insert("eth1".into());
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.len(), 2);
    }

    #[test]
    fn test_duplicate_guid_rejected() {
        let mut cfg = enabled();
        cfg.volumes.push(Volume::new("tank2", "0xAB"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_siblings() {
        let mut cfg = enabled();
        cfg.critical_groups
            .insert(2, BTreeSet::from(["eth0".to_string(), "eth3".to_string()]));
        let sib: Vec<String> = cfg.siblings("eth0").into_iter().collect();
        assert_eq!(sib, vec!["eth1", "eth3"]);
        assert!(cfg.siblings("eth2").is_empty());
    }

    #[test]
    fn test_deserialize_legacy_master_field() {
        let cfg: FailoverConfig = serde_json::from_value(json!({
            "disabled": true,
            "master": true,
            "volumes": [{"name": "tank", "guid": "0xAB"}]
        }))
        .unwrap();
        assert!(cfg.master_preferred);
        assert_eq!(cfg.volumes[0].status, "OFFLINE");
        assert!(!cfg.volumes[0].is_imported());
    }
}
