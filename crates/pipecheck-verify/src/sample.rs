//! Synthetic usage reports for one hour of a two-pod workload.
//!
//! Used when a run is not given report files of its own. The cost report
//! feeds manifest processing and the daily summary; the resource optimization
//! report feeds experiment creation in the optimization engine.

use std::path::Path;

use chrono::{DateTime, Datelike, Duration, DurationRound, Months, Utc};
use serde::Serialize;

use pipecheck_common::{Error, Result};

/// Timestamp layout used by the cost operator's reports
const REPORT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S +0000 UTC";

/// Resource optimization samples per hour
const ROS_INTERVALS: i64 = 4;

const NAMESPACE: &str = "pipecheck";
const NODE: &str = "pipecheck-worker-0";
const PODS: [&str; 2] = ["pipecheck-app-0", "pipecheck-app-1"];

/// Which pipeline a report file feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// Pod usage for cost processing
    Cost,
    /// Container samples for the optimization engine
    ResourceOptimization,
}

/// A report file to include in an upload
#[derive(Debug, Clone)]
pub struct ReportFile {
    /// File name inside the archive
    pub name: String,
    /// Pipeline the file feeds
    pub kind: ReportKind,
    /// CSV contents
    pub contents: Vec<u8>,
}

impl ReportFile {
    /// Load a report from disk
    pub fn from_path(path: &Path, kind: ReportKind) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::config(format!("{} is not a file", path.display())))?;
        Ok(Self {
            name,
            kind,
            contents: std::fs::read(path)?,
        })
    }
}

/// Reporting window covered by a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportWindow {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
}

impl ReportWindow {
    /// The clock hour containing `now`
    pub fn hour_of(now: DateTime<Utc>) -> Self {
        let start = now.duration_trunc(Duration::hours(1)).unwrap_or(now);
        Self {
            start,
            end: start + Duration::hours(1),
        }
    }

    fn month_bounds(&self) -> (String, String) {
        let day = self.start.date_naive();
        let first = day.with_day(1).unwrap_or(day);
        // the operator reports the period end as the first of the next month
        let next = first.checked_add_months(Months::new(1)).unwrap_or(first);
        (
            first.format("%Y-%m-%d 00:00:00 +0000 UTC").to_string(),
            next.format("%Y-%m-%d 00:00:00 +0000 UTC").to_string(),
        )
    }
}

#[derive(Serialize)]
struct PodUsageRow<'a> {
    report_period_start: &'a str,
    report_period_end: &'a str,
    interval_start: String,
    interval_end: String,
    pod: &'a str,
    namespace: &'a str,
    node: &'a str,
    resource_id: String,
    pod_usage_cpu_core_seconds: f64,
    pod_request_cpu_core_seconds: f64,
    pod_limit_cpu_core_seconds: f64,
    pod_usage_memory_byte_seconds: f64,
    pod_request_memory_byte_seconds: f64,
    pod_limit_memory_byte_seconds: f64,
    node_capacity_cpu_cores: f64,
    node_capacity_cpu_core_seconds: f64,
    node_capacity_memory_bytes: f64,
    node_capacity_memory_byte_seconds: f64,
    pod_labels: String,
}

#[derive(Serialize)]
struct ContainerSampleRow<'a> {
    report_period_start: &'a str,
    report_period_end: &'a str,
    interval_start: String,
    interval_end: String,
    container_name: &'a str,
    pod: &'a str,
    owner_name: &'a str,
    owner_kind: &'a str,
    workload: &'a str,
    workload_type: &'a str,
    namespace: &'a str,
    image_name: &'a str,
    node: &'a str,
    resource_id: String,
    cpu_request_container_avg: f64,
    cpu_request_container_sum: f64,
    cpu_limit_container_avg: f64,
    cpu_limit_container_sum: f64,
    cpu_usage_container_avg: f64,
    cpu_usage_container_min: f64,
    cpu_usage_container_max: f64,
    cpu_usage_container_sum: f64,
    cpu_throttle_container_avg: f64,
    cpu_throttle_container_max: f64,
    cpu_throttle_container_sum: f64,
    memory_request_container_avg: f64,
    memory_request_container_sum: f64,
    memory_limit_container_avg: f64,
    memory_limit_container_sum: f64,
    memory_usage_container_avg: f64,
    memory_usage_container_min: f64,
    memory_usage_container_max: f64,
    memory_usage_container_sum: f64,
    memory_rss_usage_container_avg: f64,
    memory_rss_usage_container_min: f64,
    memory_rss_usage_container_max: f64,
    memory_rss_usage_container_sum: f64,
}

fn csv_error(e: csv::Error) -> Error {
    Error::Io(std::io::Error::other(e))
}

fn write_csv<T: Serialize>(rows: impl IntoIterator<Item = T>) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).map_err(csv_error)?;
    }
    writer
        .into_inner()
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))
}

fn time(t: DateTime<Utc>) -> String {
    t.format(REPORT_TIME_FORMAT).to_string()
}

/// Generate the cost and resource optimization reports for `window`
///
/// File names carry the payload id so they never collide across runs.
pub fn generate(payload_id: &str, window: ReportWindow) -> Result<Vec<ReportFile>> {
    let (period_start, period_end) = window.month_bounds();
    let hour_secs = 3600.0;
    let gib = 1024.0 * 1024.0 * 1024.0;

    let pod_rows = PODS.iter().copied().enumerate().map(|(i, pod)| {
        let usage_cores = 0.25 + 0.25 * i as f64;
        PodUsageRow {
            report_period_start: &period_start,
            report_period_end: &period_end,
            interval_start: time(window.start),
            interval_end: time(window.end),
            pod,
            namespace: NAMESPACE,
            node: NODE,
            resource_id: format!("i-{}", NODE),
            pod_usage_cpu_core_seconds: usage_cores * hour_secs,
            pod_request_cpu_core_seconds: 1.0 * hour_secs,
            pod_limit_cpu_core_seconds: 2.0 * hour_secs,
            pod_usage_memory_byte_seconds: (0.5 + 0.5 * i as f64) * gib * hour_secs,
            pod_request_memory_byte_seconds: 1.0 * gib * hour_secs,
            pod_limit_memory_byte_seconds: 2.0 * gib * hour_secs,
            node_capacity_cpu_cores: 4.0,
            node_capacity_cpu_core_seconds: 4.0 * hour_secs,
            node_capacity_memory_bytes: 16.0 * gib,
            node_capacity_memory_byte_seconds: 16.0 * gib * hour_secs,
            pod_labels: format!("label_app:{}", NAMESPACE),
        }
    });
    let cost = write_csv(pod_rows)?;

    let step = Duration::minutes(60 / ROS_INTERVALS);
    let mut samples = Vec::new();
    for (i, pod) in PODS.iter().copied().enumerate() {
        for n in 0..ROS_INTERVALS {
            let start = window.start + step * n as i32;
            let cpu = 0.2 + 0.05 * (i as f64 + n as f64);
            let mem = (400.0 + 20.0 * n as f64) * 1024.0 * 1024.0;
            samples.push(ContainerSampleRow {
                report_period_start: &period_start,
                report_period_end: &period_end,
                interval_start: time(start),
                interval_end: time(start + step),
                container_name: "app",
                pod,
                owner_name: "pipecheck-app",
                owner_kind: "StatefulSet",
                workload: "pipecheck-app",
                workload_type: "statefulset",
                namespace: NAMESPACE,
                image_name: "registry.access.redhat.com/ubi9/ubi-minimal:latest",
                node: NODE,
                resource_id: format!("i-{}", NODE),
                cpu_request_container_avg: 1.0,
                cpu_request_container_sum: 1.0,
                cpu_limit_container_avg: 2.0,
                cpu_limit_container_sum: 2.0,
                cpu_usage_container_avg: cpu,
                cpu_usage_container_min: cpu * 0.8,
                cpu_usage_container_max: cpu * 1.2,
                cpu_usage_container_sum: cpu,
                cpu_throttle_container_avg: 0.0,
                cpu_throttle_container_max: 0.0,
                cpu_throttle_container_sum: 0.0,
                memory_request_container_avg: gib,
                memory_request_container_sum: gib,
                memory_limit_container_avg: 2.0 * gib,
                memory_limit_container_sum: 2.0 * gib,
                memory_usage_container_avg: mem,
                memory_usage_container_min: mem * 0.9,
                memory_usage_container_max: mem * 1.1,
                memory_usage_container_sum: mem,
                memory_rss_usage_container_avg: mem * 0.8,
                memory_rss_usage_container_min: mem * 0.7,
                memory_rss_usage_container_max: mem * 0.9,
                memory_rss_usage_container_sum: mem * 0.8,
            });
        }
    }
    let ros = write_csv(samples)?;

    Ok(vec![
        ReportFile {
            name: format!("{}_openshift_usage_report.0.csv", payload_id),
            kind: ReportKind::Cost,
            contents: cost,
        },
        ReportFile {
            name: format!("{}_openshift_usage_report.0.ros.csv", payload_id),
            kind: ReportKind::ResourceOptimization,
            contents: ros,
        },
    ])
}
