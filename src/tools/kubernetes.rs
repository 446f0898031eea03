//! Cluster queries answered by shelling out to `kubectl -o json`.
//!
//! Failures are returned to the model as `{"error": ...}` values rather than
//! tool errors, so it can explain what went wrong.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tokio::process::Command;

use super::{NoArgs, ToolRegistry};
use crate::{Error, Result};

const RECENT_WINDOW_MINUTES: i64 = 15;

#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: PathBuf,
    context: Option<String>,
}

impl Default for Kubectl {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("kubectl"),
            context: None,
        }
    }
}

impl Kubectl {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            context: None,
        }
    }

    #[must_use]
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    async fn json(&self, args: &[&str]) -> Result<Value> {
        let mut cmd = Command::new(&self.binary);
        if let Some(context) = &self.context {
            cmd.arg("--context").arg(context);
        }
        cmd.args(args).args(["-o", "json"]).kill_on_drop(true);
        tracing::debug!(args = ?args, "Running kubectl");

        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Tool(format!("kubectl {}: {}", args.join(" "), stderr.trim())));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn raw(&self, path: &str) -> Result<Value> {
        let mut cmd = Command::new(&self.binary);
        if let Some(context) = &self.context {
            cmd.arg("--context").arg(context);
        }
        let output = cmd.args(["get", "--raw", path]).kill_on_drop(true).output().await?;
        if !output.status.success() {
            return Err(Error::Tool(format!("kubectl get --raw {path} failed")));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn count(&self, args: &[&str]) -> Result<usize> {
        Ok(item_count(&self.json(args).await?))
    }

    pub async fn number_of_nodes(&self) -> Value {
        match self.count(&["get", "nodes"]).await {
            Ok(n) => json!({ "node_count": n }),
            Err(e) => json!({ "error": format!("Failed to get node count: {e}") }),
        }
    }

    pub async fn number_of_pods(&self) -> Value {
        match self.count(&["get", "pods", "--all-namespaces"]).await {
            Ok(n) => json!({ "pod_count": n }),
            Err(e) => json!({ "error": format!("Failed to get pod count: {e}") }),
        }
    }

    pub async fn number_of_namespaces(&self) -> Value {
        match self.count(&["get", "namespaces"]).await {
            Ok(n) => json!({ "namespace_count": n }),
            Err(e) => json!({ "error": format!("Failed to get namespace count: {e}") }),
        }
    }

    pub async fn cluster_status(&self) -> Value {
        let gathered = async {
            let nodes = self.json(&["get", "nodes"]).await?;
            let pods = self.json(&["get", "pods", "--all-namespaces"]).await?;
            let events = self.json(&["get", "events", "--all-namespaces"]).await?;
            Ok::<_, Error>((nodes, pods, events))
        }
        .await;

        match gathered {
            Ok((nodes, pods, events)) => {
                let metrics = match self.raw("/apis/metrics.k8s.io/v1beta1/nodes").await {
                    Ok(metrics) => Some(metrics),
                    Err(err) => {
                        tracing::debug!(error = %err, "Node metrics unavailable");
                        None
                    }
                };
                summarize_cluster(&nodes, &pods, &events, metrics.as_ref(), Utc::now())
            }
            Err(e) => json!({
                "error": "Failed to get cluster status",
                "message": e.to_string(),
            }),
        }
    }
}

fn item_count(list: &Value) -> usize {
    list["items"].as_array().map_or(0, Vec::len)
}

fn items(list: &Value) -> &[Value] {
    list["items"].as_array().map(Vec::as_slice).unwrap_or_default()
}

/// Parse a CPU quantity (`"250m"`, `"123456789n"`, `"2"`) into cores.
fn parse_cpu(quantity: &str) -> Option<f64> {
    if let Some(n) = quantity.strip_suffix('n') {
        return n.parse::<f64>().ok().map(|v| v / 1e9);
    }
    if let Some(u) = quantity.strip_suffix('u') {
        return u.parse::<f64>().ok().map(|v| v / 1e6);
    }
    if let Some(m) = quantity.strip_suffix('m') {
        return m.parse::<f64>().ok().map(|v| v / 1e3);
    }
    quantity.parse().ok()
}

/// Parse a memory quantity (`"512Mi"`, `"2Gi"`, bytes) into GiB.
fn parse_memory_gib(quantity: &str) -> Option<f64> {
    const UNITS: [(&str, f64); 4] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ];
    let bytes = UNITS
        .iter()
        .find_map(|(suffix, scale)| quantity.strip_suffix(suffix).map(|v| v.parse::<f64>().ok().map(|v| v * scale)))
        .unwrap_or_else(|| quantity.parse().ok())?;
    Some(bytes / (1024.0 * 1024.0 * 1024.0))
}

fn event_time(event: &Value) -> Option<DateTime<Utc>> {
    ["lastTimestamp", "eventTime", "firstTimestamp"]
        .iter()
        .filter_map(|key| event[*key].as_str())
        .find_map(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

#[allow(clippy::cast_precision_loss)]
fn summarize_cluster(nodes: &Value, pods: &Value, events: &Value, metrics: Option<&Value>, now: DateTime<Utc>) -> Value {
    let node_count = item_count(nodes);

    let mut pod_count: BTreeMap<String, Value> = BTreeMap::new();
    let mut total_pods = 0u64;
    for pod in items(pods) {
        let phase = pod["status"]["phase"].as_str().unwrap_or("Unknown").to_string();
        let entry = pod_count.entry(phase).or_insert_with(|| json!(0));
        *entry = json!(entry.as_u64().unwrap_or(0) + 1);
        total_pods += 1;
    }
    pod_count.insert("total".to_string(), json!(total_pods));

    let cutoff = now - Duration::minutes(RECENT_WINDOW_MINUTES);
    let recent_issues: Vec<Value> = items(events)
        .iter()
        .filter(|event| event["type"] == "Warning")
        .filter(|event| event_time(event).is_some_and(|ts| ts > cutoff))
        .map(|event| {
            json!({
                "reason": event["reason"],
                "message": event["message"],
                "component": event["involvedObject"]["kind"],
            })
        })
        .collect();

    let mut health = json!({
        "total_nodes": node_count,
        "pod_count": pod_count,
    });
    if let Some(metrics) = metrics {
        let (cpu, memory) = items(metrics).iter().fold((0.0, 0.0), |(cpu, memory), item| {
            let usage = &item["usage"];
            (
                cpu + usage["cpu"].as_str().and_then(parse_cpu).unwrap_or(0.0),
                memory + usage["memory"].as_str().and_then(parse_memory_gib).unwrap_or(0.0),
            )
        });
        let divisor = node_count.max(1) as f64;
        health["avg_cpu_usage"] = json!(format!("{:.1}%", cpu / divisor * 100.0));
        health["avg_memory_usage"] = json!(format!("{:.1}GB", memory / divisor));
    }

    let summary = if recent_issues.is_empty() { "All Systems Normal" } else { "Issues Detected" };
    let issues = (!recent_issues.is_empty()).then(|| {
        json!({
            "count": recent_issues.len(),
            "summary": recent_issues,
        })
    });

    json!({
        "cluster_health": health,
        "recent_issues": issues,
        "status_summary": summary,
        "timestamp": now.to_rfc3339(),
    })
}

pub fn register(registry: &mut ToolRegistry) {
    register_with(registry, Kubectl::default());
}

pub fn register_with(registry: &mut ToolRegistry, kubectl: Kubectl) {
    let kubectl = Arc::new(kubectl);

    let k = Arc::clone(&kubectl);
    registry.tool(
        "get_number_of_nodes",
        "Returns the number of nodes in a Kubernetes cluster.",
        move |_: NoArgs| {
            let k = Arc::clone(&k);
            async move { Ok(k.number_of_nodes().await) }
        },
    );

    let k = Arc::clone(&kubectl);
    registry.tool(
        "get_number_of_pods",
        "Returns the number of pods in a Kubernetes cluster.",
        move |_: NoArgs| {
            let k = Arc::clone(&k);
            async move { Ok(k.number_of_pods().await) }
        },
    );

    let k = Arc::clone(&kubectl);
    registry.tool(
        "get_number_of_namespaces",
        "Returns the number of namespaces in a Kubernetes cluster.",
        move |_: NoArgs| {
            let k = Arc::clone(&k);
            async move { Ok(k.number_of_namespaces().await) }
        },
    );

    registry.tool(
        "get_cluster_status",
        "Returns detailed status information about the Kubernetes cluster including node metrics, \
         pod status, resource usage, and recent issues.",
        move |_: NoArgs| {
            let k = Arc::clone(&kubectl);
            async move { Ok(k.cluster_status().await) }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_and_memory_quantities() {
        assert_eq!(parse_cpu("250m"), Some(0.25));
        assert_eq!(parse_cpu("500000000n"), Some(0.5));
        assert_eq!(parse_cpu("2"), Some(2.0));
        assert_eq!(parse_memory_gib("1Gi"), Some(1.0));
        assert_eq!(parse_memory_gib("512Mi"), Some(0.5));
        assert_eq!(parse_cpu("lots"), None);
    }

    #[test]
    fn summary_counts_phases_and_recent_warnings() {
        let now = DateTime::parse_from_rfc3339("2026-01-01T12:00:00Z").unwrap().with_timezone(&Utc);
        let nodes = json!({"items": [{}, {}]});
        let pods = json!({"items": [
            {"status": {"phase": "Running"}},
            {"status": {"phase": "Running"}},
            {"status": {"phase": "Pending"}}
        ]});
        let events = json!({"items": [
            {"type": "Warning", "reason": "BackOff", "message": "restarting",
             "involvedObject": {"kind": "Pod"}, "lastTimestamp": "2026-01-01T11:55:00Z"},
            {"type": "Warning", "reason": "Old", "message": "stale",
             "involvedObject": {"kind": "Node"}, "lastTimestamp": "2026-01-01T10:00:00Z"},
            {"type": "Normal", "reason": "Pulled", "lastTimestamp": "2026-01-01T11:59:00Z"}
        ]});

        let status = summarize_cluster(&nodes, &pods, &events, None, now);
        assert_eq!(status["cluster_health"]["total_nodes"], 2);
        assert_eq!(status["cluster_health"]["pod_count"]["total"], 3);
        assert_eq!(status["cluster_health"]["pod_count"]["Running"], 2);
        assert_eq!(status["recent_issues"]["count"], 1);
        assert_eq!(status["recent_issues"]["summary"][0]["reason"], "BackOff");
        assert_eq!(status["status_summary"], "Issues Detected");
    }

    #[test]
    fn quiet_cluster_is_normal() {
        let status = summarize_cluster(&json!({"items": []}), &json!({"items": []}), &json!({"items": []}), None, Utc::now());
        assert_eq!(status["status_summary"], "All Systems Normal");
        assert!(status["recent_issues"].is_null());
    }

    #[tokio::test]
    async fn missing_kubectl_is_reported_as_data() {
        let kubectl = Kubectl::new("/nonexistent/kubectl-for-tests");
        let value = kubectl.number_of_nodes().await;
        assert!(value["error"].as_str().unwrap().starts_with("Failed to get node count"));
    }
}
