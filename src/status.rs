//! Remote GPU status payload parsing
//!
//! Turns the XML document produced by `nvidia-smi -q -x` into a normalized
//! per-device snapshot:
//! - One `DeviceReading` per `<gpu>` element, in host device-index order
//! - Memory fields are strict `"<integer> MiB"` strings; anything else is a
//!   parse error, never a silent default
//! - Pure parsing, no I/O

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default remote status query, matching the documented schema.
pub const DEFAULT_QUERY_COMMAND: &str = "nvidia-smi -q -x";

/// Payload parse failure. The snapshot is all-or-nothing: a single bad
/// device entry fails the whole payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed status payload: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("device {index} has no memory usage section")]
    MissingMemorySection { index: usize },
    #[error("device {index} memory usage has no '{field}' field")]
    MissingField { index: usize, field: &'static str },
    #[error("device {index} '{field}' value {value:?} is not of the form \"<integer> MiB\"")]
    BadMemoryValue {
        index: usize,
        field: &'static str,
        value: String,
    },
}

/// Memory usage reported by one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceReading {
    pub used_mib: u64,
    pub free_mib: u64,
}

impl DeviceReading {
    /// A device with zero used memory counts as idle.
    pub fn is_idle(&self) -> bool {
        self.used_mib == 0
    }
}

/// All device readings captured in one poll, in the order the host
/// reported them. Tick-scoped; no history is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSnapshot {
    pub devices: Vec<DeviceReading>,
}

impl ClusterSnapshot {
    pub fn total(&self) -> usize {
        self.devices.len()
    }

    pub fn idle_count(&self) -> usize {
        self.devices.iter().filter(|d| d.is_idle()).count()
    }
}

/// Recognized status payload schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSchema {
    /// `nvidia-smi -q -x`: `<gpu>` elements with an `fb_memory_usage` child.
    #[default]
    NvidiaSmiXml,
}

/// The remote command to run plus the schema its output is parsed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusQuery {
    pub command: String,
    pub schema: StatusSchema,
}

impl Default for StatusQuery {
    fn default() -> Self {
        Self {
            command: DEFAULT_QUERY_COMMAND.to_string(),
            schema: StatusSchema::default(),
        }
    }
}

impl StatusQuery {
    pub fn parse(&self, payload: &str) -> Result<ClusterSnapshot, PayloadError> {
        match self.schema {
            StatusSchema::NvidiaSmiXml => parse_nvidia_smi_xml(payload),
        }
    }
}

/// Parse an `nvidia-smi -q -x` document into a snapshot.
pub fn parse_nvidia_smi_xml(payload: &str) -> Result<ClusterSnapshot, PayloadError> {
    let doc = roxmltree::Document::parse(payload)?;
    let root = doc.root_element();

    let mut devices = Vec::new();
    for (index, gpu) in root
        .children()
        .filter(|n| n.has_tag_name("gpu"))
        .enumerate()
    {
        let mem = gpu
            .children()
            .find(|n| n.has_tag_name("fb_memory_usage"))
            .ok_or(PayloadError::MissingMemorySection { index })?;

        devices.push(DeviceReading {
            used_mib: parse_mem_field(&mem, index, "used")?,
            free_mib: parse_mem_field(&mem, index, "free")?,
        });
    }

    Ok(ClusterSnapshot { devices })
}

fn parse_mem_field(
    mem: &roxmltree::Node<'_, '_>,
    index: usize,
    field: &'static str,
) -> Result<u64, PayloadError> {
    let raw = mem
        .children()
        .find(|n| n.has_tag_name(field))
        .and_then(|n| n.text())
        .ok_or(PayloadError::MissingField { index, field })?;

    parse_mem_str(raw).ok_or_else(|| PayloadError::BadMemoryValue {
        index,
        field,
        value: raw.to_string(),
    })
}

/// Strip the fixed `" MiB"` suffix and convert the remainder to an integer.
fn parse_mem_str(raw: &str) -> Option<u64> {
    raw.trim().strip_suffix(" MiB")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(gpus: &[(&str, &str)]) -> String {
        let mut xml = String::from("<nvidia_smi_log>");
        for (used, free) in gpus {
            xml.push_str(&format!(
                "<gpu id=\"x\"><product_name>Test</product_name>\
                 <fb_memory_usage><total>16000 MiB</total>\
                 <used>{used}</used><free>{free}</free></fb_memory_usage></gpu>"
            ));
        }
        xml.push_str("</nvidia_smi_log>");
        xml
    }

    #[test]
    fn parses_devices_in_document_order() {
        let xml = payload(&[("0 MiB", "8000 MiB"), ("4000 MiB", "4000 MiB"), ("0 MiB", "8000 MiB")]);
        let snapshot = parse_nvidia_smi_xml(&xml).unwrap();
        assert_eq!(snapshot.total(), 3);
        assert_eq!(
            snapshot.devices,
            vec![
                DeviceReading { used_mib: 0, free_mib: 8000 },
                DeviceReading { used_mib: 4000, free_mib: 4000 },
                DeviceReading { used_mib: 0, free_mib: 8000 },
            ]
        );
        assert_eq!(snapshot.idle_count(), 2);
    }

    #[test]
    fn empty_device_list_is_a_valid_snapshot() {
        let snapshot = parse_nvidia_smi_xml("<nvidia_smi_log></nvidia_smi_log>").unwrap();
        assert_eq!(snapshot.total(), 0);
    }

    #[test]
    fn rejects_invalid_xml() {
        assert!(matches!(
            parse_nvidia_smi_xml("<nvidia_smi_log><gpu>"),
            Err(PayloadError::Xml(_))
        ));
    }

    #[test]
    fn rejects_missing_memory_section() {
        let xml = "<nvidia_smi_log><gpu><product_name>Test</product_name></gpu></nvidia_smi_log>";
        assert!(matches!(
            parse_nvidia_smi_xml(xml),
            Err(PayloadError::MissingMemorySection { index: 0 })
        ));
    }

    #[test]
    fn rejects_missing_field() {
        let xml = "<nvidia_smi_log><gpu><fb_memory_usage>\
                   <used>0 MiB</used></fb_memory_usage></gpu></nvidia_smi_log>";
        assert!(matches!(
            parse_nvidia_smi_xml(xml),
            Err(PayloadError::MissingField { index: 0, field: "free" })
        ));
    }

    #[test]
    fn rejects_value_without_unit_suffix() {
        let xml = payload(&[("4000", "4000 MiB")]);
        let err = parse_nvidia_smi_xml(&xml).unwrap_err();
        assert!(matches!(
            err,
            PayloadError::BadMemoryValue { index: 0, field: "used", .. }
        ));
    }

    #[test]
    fn rejects_non_numeric_value() {
        let xml = payload(&[("N/A MiB", "4000 MiB")]);
        assert!(matches!(
            parse_nvidia_smi_xml(&xml),
            Err(PayloadError::BadMemoryValue { .. })
        ));
    }

    #[test]
    fn bad_entry_never_yields_a_partial_snapshot() {
        // First device is fine, second is malformed: the whole parse fails.
        let xml = payload(&[("0 MiB", "8000 MiB"), ("4000", "4000 MiB")]);
        assert!(parse_nvidia_smi_xml(&xml).is_err());
    }

    #[test]
    fn query_default_matches_documented_schema() {
        let query = StatusQuery::default();
        assert_eq!(query.command, "nvidia-smi -q -x");
        assert_eq!(query.schema, StatusSchema::NvidiaSmiXml);
        assert!(query.parse(&payload(&[("0 MiB", "1 MiB")])).is_ok());
    }
}
