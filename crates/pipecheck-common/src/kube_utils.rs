//! Kubernetes helpers for reading cluster state the verifier depends on.
//!
//! The verifier only consumes the control plane: it reads secrets and route
//! hosts to find endpoints and credentials, locates database pods, and runs
//! read-only queries inside them through the exec subresource.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, AttachParams, DynamicObject, GroupVersionKind, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::{Error, Result};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path and context
///
/// Falls back to the inferred config (`KUBECONFIG`, `~/.kube/config`, or
/// in-cluster) when no path is given.
pub async fn create_client(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let options = KubeConfigOptions {
                context: context.map(str::to_string),
                ..Default::default()
            };
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {}", e)))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(Error::from)
}

/// Read one key of a secret as UTF-8
pub async fn get_secret_string(
    client: &Client,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<String> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = secrets.get(name).await?;

    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(|| {
            Error::config(format!("secret {}/{} missing key {}", namespace, name, key))
        })?;

    String::from_utf8(data.0.clone()).map_err(|_| {
        Error::config(format!(
            "secret {}/{} key {} is not valid UTF-8",
            namespace, name, key
        ))
    })
}

/// Resolve an OpenShift route to its external base URL
pub async fn route_url(client: &Client, namespace: &str, name: &str) -> Result<String> {
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("route.openshift.io", "v1", "Route"));
    let routes: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &ar);
    let route = routes.get(name).await?;

    route
        .data
        .get("spec")
        .and_then(route_url_from_spec)
        .ok_or_else(|| Error::config(format!("route {}/{} has no host", namespace, name)))
}

/// Build `scheme://host` from a route spec; TLS-terminated routes are https
pub fn route_url_from_spec(spec: &serde_json::Value) -> Option<String> {
    let host = spec.get("host")?.as_str().filter(|h| !h.is_empty())?;
    let tls = spec.get("tls").is_some_and(|t| !t.is_null());
    let scheme = if tls { "https" } else { "http" };
    Some(format!("{}://{}", scheme, host))
}

/// Find a running pod matching a label selector
pub async fn find_running_pod(client: &Client, namespace: &str, selector: &str) -> Result<String> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let list = pods.list(&ListParams::default().labels(selector)).await?;

    first_running_pod(&list.items).ok_or_else(|| {
        Error::store(
            selector,
            format!("no running pod in {} matches {}", namespace, selector),
        )
    })
}

/// Name of the first `Running` pod, by name for determinism
pub fn first_running_pod(pods: &[Pod]) -> Option<String> {
    let mut running: Vec<&str> = pods
        .iter()
        .filter(|p| {
            p.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Running")
        })
        .filter_map(|p| p.metadata.name.as_deref())
        .collect();
    running.sort_unstable();
    running.first().map(|name| name.to_string())
}

/// Captured output of a command run inside a pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Whether the exec status reported success
    pub success: bool,
    /// Status message reported on failure
    pub message: Option<String>,
}

/// Run a non-interactive command in a pod and capture its output
///
/// The whole exchange, including connection setup, is bounded by `timeout`.
pub async fn exec_capture(
    client: &Client,
    namespace: &str,
    pod: &str,
    container: Option<&str>,
    command: &[String],
    timeout: Duration,
) -> Result<ExecOutput> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let mut params = AttachParams::default()
        .stdin(false)
        .stdout(true)
        .stderr(true);
    if let Some(container) = container {
        params = params.container(container);
    }

    debug!(namespace = %namespace, pod = %pod, "Executing command in pod");

    let run = async {
        let mut attached = pods.exec(pod, command.to_vec(), &params).await?;
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let (stdout, stderr) = tokio::join!(read_all(stdout), read_all(stderr));
        let status = match status {
            Some(status) => status.await,
            None => None,
        };

        let success = status
            .as_ref()
            .and_then(|s| s.status.as_deref())
            .map_or(true, |s| s == "Success");
        let message = status.and_then(|s| s.message);

        Ok::<_, Error>(ExecOutput {
            stdout: stdout?,
            stderr: stderr?,
            success,
            message,
        })
    };

    tokio::time::timeout(timeout, run).await.map_err(|_| {
        Error::store(
            pod,
            format!("exec in {}/{} timed out after {:?}", namespace, pod, timeout),
        )
    })?
}

async fn read_all<R>(reader: Option<R>) -> Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut out = String::new();
    if let Some(mut reader) = reader {
        reader.read_to_string(&mut out).await?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    fn pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn route_with_tls_is_https() {
        let spec = json!({"host": "sso.apps.example.com", "tls": {"termination": "edge"}});
        assert_eq!(
            route_url_from_spec(&spec).as_deref(),
            Some("https://sso.apps.example.com")
        );
    }

    #[test]
    fn route_without_tls_is_http() {
        let spec = json!({"host": "ingress.apps.example.com"});
        assert_eq!(
            route_url_from_spec(&spec).as_deref(),
            Some("http://ingress.apps.example.com")
        );
        let spec = json!({"host": "ingress.apps.example.com", "tls": null});
        assert!(route_url_from_spec(&spec).unwrap().starts_with("http://"));
    }

    #[test]
    fn route_without_host_is_none() {
        assert!(route_url_from_spec(&json!({})).is_none());
        assert!(route_url_from_spec(&json!({"host": ""})).is_none());
    }

    #[test]
    fn first_running_pod_skips_pending() {
        let pods = vec![
            pod("db-2", "Running"),
            pod("db-0", "Pending"),
            pod("db-1", "Running"),
        ];
        assert_eq!(first_running_pod(&pods).as_deref(), Some("db-1"));
        assert!(first_running_pod(&[pod("db-0", "Failed")]).is_none());
    }
}
