use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use url::Url;

/// The grid always has exactly this many slots.
pub const SLOT_COUNT: usize = 4;

/// One entry of the camera file as written by the operator. Absent and
/// `null` fields read the same.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraRecord {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub path: Option<String>,
    pub full_url: Option<String>,
}

/// Immutable per-slot camera settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    pub slot: usize,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub path: String,
    pub full_url: Option<String>,
}

impl CameraConfig {
    fn from_record(slot: usize, record: CameraRecord) -> Self {
        Self {
            slot,
            host: record.ip.unwrap_or_default().trim().to_owned(),
            port: record.port.unwrap_or_default(),
            username: record.username.unwrap_or_default(),
            password: record.password.unwrap_or_default(),
            path: record.path.unwrap_or_default(),
            full_url: record
                .full_url
                .map(|url| url.trim().to_owned())
                .filter(|url| !url.is_empty()),
        }
    }

    /// Placeholder for a slot the operator did not configure.
    pub fn placeholder(slot: usize) -> Self {
        Self::from_record(slot, CameraRecord::default())
    }

    pub fn is_disabled(&self) -> bool {
        self.full_url.is_none() && (self.host.is_empty() || self.port == 0)
    }

    /// Short name shown in the slot's placeholder and title.
    pub fn label(&self) -> String {
        if !self.host.is_empty() {
            return self.host.clone();
        }
        self.full_url
            .as_deref()
            .and_then(|raw| Url::parse(raw).ok())
            .and_then(|parsed| parsed.host_str().map(str::to_owned))
            .unwrap_or_else(|| format!("camera {}", self.slot + 1))
    }
}

pub fn load_cameras(path: &Path) -> Result<[CameraConfig; SLOT_COUNT]> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading camera config at {}", path.display()))?;
    parse_cameras(&raw).with_context(|| format!("invalid camera config at {}", path.display()))
}

pub fn parse_cameras(raw: &str) -> Result<[CameraConfig; SLOT_COUNT]> {
    let value = serde_json::from_str::<serde_json::Value>(raw)
        .context("camera config is not valid JSON")?;
    if !value.is_array() {
        return Err(anyhow!(
            "camera config must be a JSON array of camera records"
        ));
    }

    let records = serde_json::from_value::<Vec<CameraRecord>>(value)
        .context("failed parsing camera records")?;
    if records.is_empty() {
        return Err(anyhow!(
            "camera config must contain at least one camera record"
        ));
    }

    Ok(assign_slots(records))
}

/// Pads with disabled placeholders or truncates so exactly [`SLOT_COUNT`] slots exist.
pub fn assign_slots(records: Vec<CameraRecord>) -> [CameraConfig; SLOT_COUNT] {
    let mut records = records.into_iter();
    std::array::from_fn(|slot| match records.next() {
        Some(record) => CameraConfig::from_record(slot, record),
        None => CameraConfig::placeholder(slot),
    })
}

#[cfg(test)]
mod tests {
    use super::{CameraRecord, SLOT_COUNT, assign_slots, parse_cameras};

    fn record(ip: &str, port: u16) -> CameraRecord {
        CameraRecord {
            ip: Some(ip.to_owned()),
            port: Some(port),
            ..CameraRecord::default()
        }
    }

    #[test]
    fn short_configs_are_padded_with_disabled_slots() {
        for enabled in 1..=SLOT_COUNT {
            let records = (0..enabled)
                .map(|idx| record(&format!("10.0.0.{}", idx + 1), 554))
                .collect();
            let slots = assign_slots(records);

            assert_eq!(slots.len(), SLOT_COUNT);
            for (idx, slot) in slots.iter().enumerate() {
                assert_eq!(slot.slot, idx);
                assert_eq!(slot.is_disabled(), idx >= enabled);
            }
        }
    }

    #[test]
    fn extra_records_are_dropped() {
        let records = (0..6).map(|idx| record(&format!("10.0.0.{idx}"), 554)).collect();
        let slots = assign_slots(records);
        assert_eq!(slots[3].host, "10.0.0.3");
    }

    #[test]
    fn missing_host_or_port_disables_a_slot() {
        let slots = assign_slots(vec![record("", 554), record("10.0.0.2", 0), record("  ", 554)]);
        assert!(slots.iter().all(|slot| slot.is_disabled()));
    }

    #[test]
    fn full_url_alone_enables_a_slot() {
        let slots = parse_cameras(r#"[{"full_url": "rtsp://cam.local:8554/live"}]"#)
            .expect("valid config");
        assert!(!slots[0].is_disabled());
        assert_eq!(slots[0].label(), "cam.local");
    }

    #[test]
    fn end_to_end_example_config() {
        let slots =
            parse_cameras(r#"[{"ip": "10.0.0.5", "port": 554}, {}, {}, {}]"#).expect("valid");
        assert!(!slots[0].is_disabled());
        assert_eq!(slots[0].label(), "10.0.0.5");
        assert!(slots[1..].iter().all(|slot| slot.is_disabled()));
        assert_eq!(slots[2].label(), "camera 3");
    }

    #[test]
    fn null_fields_read_as_absent() {
        let slots = parse_cameras(
            r#"[{"ip": "10.0.0.5", "port": 554}, {"ip": null, "port": null, "path": null}]"#,
        )
        .expect("nulls are tolerated");
        assert!(!slots[0].is_disabled());
        assert!(slots[1].is_disabled());
        assert_eq!(slots[1].host, "");
        assert_eq!(slots[1].port, 0);
    }

    #[test]
    fn empty_or_malformed_configs_are_rejected() {
        assert!(parse_cameras("[]").is_err());
        assert!(parse_cameras(r#"{"ip": "10.0.0.5"}"#).is_err());
        assert!(parse_cameras("not json").is_err());
        assert!(parse_cameras(r#"[{"ip": "10.0.0.5", "port": 70000}]"#).is_err());
    }
}
