use serde::{Deserialize, Deserializer, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct VmRecord {
    #[serde(rename = "vmId")]
    pub vm_id: String,
    #[serde(rename = "vmName", default, deserialize_with = "null_as_default")]
    pub vm_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: VmStatus,
    #[serde(rename = "publicIp", default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(rename = "cpuUsedPct", default, deserialize_with = "null_as_default")]
    pub cpu_used_pct: f64,
    #[serde(rename = "ramUsedMB", default, deserialize_with = "null_as_default")]
    pub ram_used_mb: f64,
    #[serde(rename = "ramTotalMB", default, deserialize_with = "null_as_default")]
    pub ram_total_mb: f64,
    #[serde(rename = "diskUsedMB", default, deserialize_with = "null_as_default")]
    pub disk_used_mb: f64,
    #[serde(rename = "diskTotalMB", default, deserialize_with = "null_as_default")]
    pub disk_total_mb: f64,
    /// Last heartbeat as reported by the registry (RFC 3339). Empty until the
    /// agent has reported once.
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metrics: Vec<MetricSample>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct MetricSample {
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
    #[serde(rename = "cpuUsedPct", default, deserialize_with = "null_as_default")]
    pub cpu_used_pct: f64,
    #[serde(rename = "ramUsedMB", default, deserialize_with = "null_as_default")]
    pub ram_used_mb: f64,
    #[serde(rename = "diskUsedMB", default, skip_serializing_if = "Option::is_none")]
    pub disk_used_mb: Option<f64>,
}

/// Instances that have not reported yet carry `null` telemetry fields.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl VmRecord {
    /// The registry returns samples newest-first. Keeps the `limit` newest
    /// samples and stores them oldest-to-newest.
    pub fn into_chronological(mut self, limit: usize) -> Self {
        self.metrics.truncate(limit);
        self.metrics.reverse();
        self
    }

    pub fn disk_usage_percent(&self) -> f64 {
        if self.disk_total_mb > 0.0 {
            (self.disk_used_mb / self.disk_total_mb) * 100.0
        } else {
            0.0
        }
    }

    pub fn heartbeat_label(&self, now: SystemTime) -> String {
        heartbeat_label(&self.timestamp, now)
    }
}

/// Aggregates shown above the fleet table. Averages cover running instances only.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStats {
    pub total_vms: usize,
    pub running_count: usize,
    pub avg_cpu: f64,
    pub avg_disk_usage: f64,
    pub is_disk_critical: bool,
    pub is_disk_warning: bool,
    pub has_disk_data: bool,
}

const DISK_WARNING_PERCENT: f64 = 75.0;
const DISK_CRITICAL_PERCENT: f64 = 90.0;

impl FleetStats {
    pub fn from_records(vms: &[VmRecord]) -> Self {
        let running: Vec<&VmRecord> = vms
            .iter()
            .filter(|v| v.status == VmStatus::Running)
            .collect();
        let running_count = running.len();

        let (avg_cpu, avg_disk_usage) = if running_count > 0 {
            let n = running_count as f64;
            let cpu = running.iter().map(|v| v.cpu_used_pct).sum::<f64>() / n;
            let disk = running.iter().map(|v| v.disk_usage_percent()).sum::<f64>() / n;
            ((cpu * 10.0).round() / 10.0, disk)
        } else {
            (0.0, 0.0)
        };

        Self {
            total_vms: vms.len(),
            running_count,
            avg_cpu,
            avg_disk_usage,
            is_disk_critical: avg_disk_usage > DISK_CRITICAL_PERCENT,
            is_disk_warning: avg_disk_usage > DISK_WARNING_PERCENT,
            has_disk_data: running.iter().any(|v| v.disk_total_mb > 0.0),
        }
    }
}

pub fn heartbeat_label(timestamp: &str, now: SystemTime) -> String {
    let Ok(at) = humantime::parse_rfc3339_weak(timestamp.trim()) else {
        return "N/A".to_string();
    };
    let Ok(age) = now.duration_since(at) else {
        return "N/A".to_string();
    };

    let secs = age.as_secs();
    if secs < 60 {
        return "Just now".to_string();
    }
    let mins = secs / 60;
    if mins < 60 {
        return format!("{mins}m ago");
    }
    let hours = mins / 60;
    if hours < 24 {
        return format!("{hours}h ago");
    }

    if at.duration_since(UNIX_EPOCH).unwrap_or_default() < Duration::from_secs(24 * 60 * 60) {
        return "N/A".to_string();
    }
    let mut date = humantime::format_rfc3339_seconds(at).to_string();
    date.truncate(10);
    date
}

pub fn now_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: &str, cpu: f64) -> MetricSample {
        MetricSample {
            timestamp: ts.to_string(),
            cpu_used_pct: cpu,
            ram_used_mb: 512.0,
            disk_used_mb: None,
        }
    }

    fn vm(id: &str, status: VmStatus, cpu: f64, disk_used: f64, disk_total: f64) -> VmRecord {
        VmRecord {
            vm_id: id.to_string(),
            vm_name: id.to_string(),
            status,
            cpu_used_pct: cpu,
            disk_used_mb: disk_used,
            disk_total_mb: disk_total,
            ..VmRecord::default()
        }
    }

    #[test]
    fn decodes_registry_record() {
        let json = r#"{
            "vmId": "vm-1",
            "vmName": "aws-production-01",
            "status": "running",
            "publicIp": "203.0.113.7",
            "hostname": "ip-10-0-0-7",
            "cpuUsedPct": 12.5,
            "ramUsedMB": 1024,
            "ramTotalMB": 4096,
            "diskUsedMB": 2000,
            "diskTotalMB": 8000,
            "timestamp": "2026-10-18T10:00:00Z",
            "metrics": [
                {"timestamp": "2026-10-18T10:00:00Z", "cpuUsedPct": 12.5, "ramUsedMB": 1024},
                {"timestamp": "2026-10-18T09:59:55Z", "cpuUsedPct": 11.0, "ramUsedMB": 1000}
            ]
        }"#;
        let record: VmRecord = serde_json::from_str(json).expect("разбор записи");
        assert_eq!(record.status, VmStatus::Running);
        assert_eq!(record.ram_total_mb, 4096.0);
        assert_eq!(record.metrics.len(), 2);
        assert_eq!(record.metrics[0].timestamp, "2026-10-18T10:00:00Z");
    }

    #[test]
    fn unknown_status_and_missing_fields_are_tolerated() {
        let record: VmRecord =
            serde_json::from_str(r#"{"vmId": "vm-2", "status": "rebooting"}"#).expect("разбор");
        assert_eq!(record.status, VmStatus::Unknown);
        assert!(record.metrics.is_empty());
        assert_eq!(record.public_ip, None);
    }

    #[test]
    fn null_telemetry_of_fresh_instance_does_not_break_the_list() {
        let json = r#"[
            {"vmId": "vm-1", "vmName": "alpha", "status": "running", "cpuUsedPct": 12.5, "timestamp": "2026-10-18T11:59:30Z"},
            {"vmId": "vm-2", "vmName": "beta", "status": null, "hostname": null, "cpuUsedPct": null, "ramUsedMB": null, "diskTotalMB": null, "timestamp": null, "metrics": null}
        ]"#;
        let vms: Vec<VmRecord> = serde_json::from_str(json).expect("разбор списка");
        assert_eq!(vms.len(), 2);

        let fresh = &vms[1];
        assert_eq!(fresh.status, VmStatus::Unknown);
        assert_eq!(fresh.hostname, None);
        assert_eq!(fresh.cpu_used_pct, 0.0);
        assert_eq!(fresh.disk_total_mb, 0.0);
        assert!(fresh.metrics.is_empty());

        let now = humantime::parse_rfc3339("2026-10-18T12:00:00Z").expect("время");
        assert_eq!(fresh.heartbeat_label(now), "N/A");
        assert_eq!(vms[0].heartbeat_label(now), "Just now");
    }

    #[test]
    fn null_sample_fields_default() {
        let sample: MetricSample =
            serde_json::from_str(r#"{"timestamp": null, "cpuUsedPct": null, "ramUsedMB": 5, "diskUsedMB": null}"#)
                .expect("разбор отсчёта");
        assert_eq!(sample.timestamp, "");
        assert_eq!(sample.cpu_used_pct, 0.0);
        assert_eq!(sample.ram_used_mb, 5.0);
        assert_eq!(sample.disk_used_mb, None);
    }

    #[test]
    fn metrics_become_chronological_and_bounded() {
        let record = VmRecord {
            metrics: vec![
                sample("t3", 3.0),
                sample("t2", 2.0),
                sample("t1", 1.0),
                sample("t0", 0.0),
            ],
            ..VmRecord::default()
        };
        let normalized = record.into_chronological(3);
        let order: Vec<&str> = normalized
            .metrics
            .iter()
            .map(|m| m.timestamp.as_str())
            .collect();
        assert_eq!(order, vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn double_reversal_is_identity() {
        let original = vec![sample("a", 1.0), sample("b", 2.0), sample("c", 3.0)];
        let record = VmRecord {
            metrics: original.clone(),
            ..VmRecord::default()
        };
        let twice = record.into_chronological(50).into_chronological(50);
        assert_eq!(twice.metrics, original);
    }

    #[test]
    fn fleet_stats_average_running_only() {
        let vms = vec![
            vm("a", VmStatus::Running, 10.0, 80.0, 100.0),
            vm("b", VmStatus::Running, 20.25, 100.0, 100.0),
            vm("c", VmStatus::Stopped, 99.0, 0.0, 0.0),
        ];
        let stats = FleetStats::from_records(&vms);
        assert_eq!(stats.total_vms, 3);
        assert_eq!(stats.running_count, 2);
        assert_eq!(stats.avg_cpu, 15.1);
        assert!((stats.avg_disk_usage - 90.0).abs() < 1e-9);
        assert!(stats.is_disk_warning);
        assert!(!stats.is_disk_critical);
        assert!(stats.has_disk_data);
    }

    #[test]
    fn fleet_stats_without_running_instances() {
        let vms = vec![vm("a", VmStatus::Stopped, 50.0, 10.0, 10.0)];
        let stats = FleetStats::from_records(&vms);
        assert_eq!(stats.running_count, 0);
        assert_eq!(stats.avg_cpu, 0.0);
        assert!(!stats.has_disk_data);
    }

    #[test]
    fn running_instance_without_disk_total_counts_as_zero() {
        let vms = vec![
            vm("a", VmStatus::Running, 0.0, 95.0, 100.0),
            vm("b", VmStatus::Running, 0.0, 0.0, 0.0),
        ];
        let stats = FleetStats::from_records(&vms);
        assert!((stats.avg_disk_usage - 47.5).abs() < 1e-9);
        assert!(stats.has_disk_data);
    }

    #[test]
    fn heartbeat_labels() {
        let now = humantime::parse_rfc3339("2026-10-18T12:00:00Z").expect("время");
        assert_eq!(heartbeat_label("2026-10-18T11:59:30Z", now), "Just now");
        assert_eq!(heartbeat_label("2026-10-18T11:45:00Z", now), "15m ago");
        assert_eq!(heartbeat_label("2026-10-18T07:00:00Z", now), "5h ago");
        assert_eq!(heartbeat_label("2026-10-10T07:00:00Z", now), "2026-10-10");
        assert_eq!(heartbeat_label("2026-10-18T12:05:00Z", now), "N/A");
        assert_eq!(heartbeat_label("1970-01-01T00:00:00Z", now), "N/A");
        assert_eq!(heartbeat_label("not a date", now), "N/A");
        assert_eq!(heartbeat_label("", now), "N/A");
    }
}
