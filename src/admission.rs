use std::{collections::BTreeSet, fmt, net::SocketAddr, time::Duration};

use axum::{extract::State, routing::post, Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::{
    core::{
        admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
        DynamicObject,
    },
    ResourceExt,
};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::controllers::proxy::{JaegerNginxProxy, JaegerNginxProxySpec};
use crate::error::Error;
use crate::nginx;

/// Webhook path registered in the ValidatingWebhookConfiguration.
pub const WEBHOOK_PATH: &str =
    "/validate-jaeger-nginx-proxy-platform-engineer-stream-v1alpha0-jaegernginxproxy";

/// A single field violation, reported with its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        FieldError { path: path.into(), message: message.into() }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate a candidate spec, collecting every field violation in one pass.
///
/// Only when the fields are individually sound is the renderer run as a
/// final end-to-end check.
pub fn validate_proxy(spec: &JaegerNginxProxySpec) -> Vec<FieldError> {
    let mut errs = Vec::new();

    if spec.replica_count <= 0 {
        errs.push(FieldError::new("spec.replicaCount", "replicaCount must be greater than 0"));
    }

    if spec.container_port <= 0 || spec.container_port > 65535 {
        errs.push(FieldError::new(
            "spec.containerPort",
            "containerPort must be between 1 and 65535",
        ));
    }

    if spec.upstream.collector_host.is_empty() {
        errs.push(FieldError::new("spec.upstream.collectorHost", "collectorHost is required"));
    }

    if spec.ports.is_empty() {
        errs.push(FieldError::new("spec.ports", "at least one port must be specified"));
    }

    let mut seen = BTreeSet::new();
    for (i, port) in spec.ports.iter().enumerate() {
        if port.name.is_empty() {
            errs.push(FieldError::new(format!("spec.ports[{i}].name"), "port name is required"));
        } else if !seen.insert(port.name.clone()) {
            errs.push(FieldError::new(
                format!("spec.ports[{i}].name"),
                format!("Duplicate value: {:?}", port.name),
            ));
        }

        if port.port <= 0 || port.port > 65535 {
            errs.push(FieldError::new(
                format!("spec.ports[{i}].port"),
                "port must be between 1 and 65535",
            ));
        }

        if port.path.is_empty() {
            errs.push(FieldError::new(format!("spec.ports[{i}].path"), "port path is required"));
        }
    }

    if spec.image.repository.is_empty() {
        errs.push(FieldError::new("spec.image.repository", "image repository is required"));
    }

    if spec.image.tag.is_empty() {
        errs.push(FieldError::new("spec.image.tag", "image tag is required"));
    }

    if spec.resources.limits.cpu.is_empty() {
        errs.push(FieldError::new("spec.resources.limits.cpu", "CPU limit is required"));
    }

    if spec.resources.limits.memory.is_empty() {
        errs.push(FieldError::new("spec.resources.limits.memory", "memory limit is required"));
    }

    if spec.resources.requests.cpu.is_empty() {
        errs.push(FieldError::new("spec.resources.requests.cpu", "CPU request is required"));
    }

    if spec.resources.requests.memory.is_empty() {
        errs.push(FieldError::new("spec.resources.requests.memory", "memory request is required"));
    }

    if errs.is_empty() {
        if let Err(err) = nginx::validate(&nginx::render(spec)) {
            let reason = match err {
                Error::InvalidConfig(reason) => reason,
                other => other.to_string(),
            };
            errs.push(FieldError::new(
                "spec",
                format!("nginx configuration validation failed: {reason}"),
            ));
        }
    }

    errs
}

#[derive(Clone)]
struct WebhookState {
    deep_check: bool,
}

async fn validate_handler(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<JaegerNginxProxy>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<JaegerNginxProxy> = match review.try_into() {
        Ok(req) => req,
        Err(err) => {
            error!("invalid admission request: {err}");
            return Json(AdmissionResponse::invalid(err.to_string()).into_review());
        }
    };

    let mut res = AdmissionResponse::from(&req);

    // Deletion is always permitted.
    if matches!(req.operation, Operation::Delete) {
        return Json(res.into_review());
    }

    if let Some(proxy) = &req.object {
        let ns = proxy.namespace().unwrap_or_else(|| "default".to_string());
        let name = proxy.name_any();
        info!("validating {:?} of JaegerNginxProxy {ns}/{name}", req.operation);

        let errs = validate_proxy(&proxy.spec);
        if errs.is_empty() {
            if state.deep_check {
                if let Err(err) = nginx::deep_check(&nginx::render(&proxy.spec)).await {
                    warn!("nginx validation failed, continuing with basic validation: {err}");
                }
            }
        } else {
            let detail =
                errs.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
            warn!("denied {:?} of JaegerNginxProxy {ns}/{name}: {detail}");
            res = res.deny(format!("validation failed: [{detail}]"));
        }
    }

    Json(res.into_review())
}

/// Serve the validating webhook over TLS until the token fires.
///
/// Without certificate paths the webhook stays down and the apiserver's
/// `failurePolicy=Fail` blocks JaegerNginxProxy writes.
pub async fn run(settings: &Settings, shutdown: CancellationToken) -> anyhow::Result<()> {
    let (Some(cert), Some(key)) = (&settings.webhook_tls_cert, &settings.webhook_tls_key) else {
        warn!("webhook TLS certificate not configured, admission webhook disabled");
        return Ok(());
    };

    let state = WebhookState { deep_check: settings.nginx_binary_check };
    let app = Router::new().route(WEBHOOK_PATH, post(validate_handler)).with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.webhook_port));
    let tls = RustlsConfig::from_pem_file(cert, key).await?;

    info!("starting admission webhook on {addr}");

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });
    }

    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::proxy::{fixtures, PortSpec};

    #[test]
    fn valid_spec_passes() {
        assert!(validate_proxy(&fixtures::spec()).is_empty());
    }

    #[test]
    fn zero_replicas_denied_at_admission() {
        let mut spec = fixtures::spec();
        spec.replica_count = 0;

        let errs = validate_proxy(&spec);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].path, "spec.replicaCount");
        assert_eq!(errs[0].message, "replicaCount must be greater than 0");
    }

    #[test]
    fn container_port_bounds() {
        for bad in [0, -1, 65536] {
            let mut spec = fixtures::spec();
            spec.container_port = bad;
            let errs = validate_proxy(&spec);
            assert!(
                errs.iter().any(|err| err.path == "spec.containerPort"),
                "containerPort {bad} should be rejected"
            );
        }
    }

    #[test]
    fn empty_port_entry_collects_all_three_errors() {
        let mut spec = fixtures::spec();
        spec.ports =
            vec![PortSpec { name: String::new(), port: 0, path: String::new() }];

        let errs = validate_proxy(&spec);
        let paths: Vec<&str> = errs.iter().map(|err| err.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["spec.ports[0].name", "spec.ports[0].port", "spec.ports[0].path"]
        );
        assert_eq!(errs[0].message, "port name is required");
        assert_eq!(errs[1].message, "port must be between 1 and 65535");
        assert_eq!(errs[2].message, "port path is required");
    }

    #[test]
    fn duplicate_port_names_rejected() {
        let mut spec = fixtures::spec();
        spec.ports.push(PortSpec {
            name: "http".to_string(),
            port: 14250,
            path: "/other".to_string(),
        });

        let errs = validate_proxy(&spec);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].path, "spec.ports[1].name");
        assert_eq!(errs[0].message, "Duplicate value: \"http\"");
    }

    #[test]
    fn missing_upstream_image_and_resources_reported_together() {
        let mut spec = fixtures::spec();
        spec.upstream.collector_host.clear();
        spec.image.repository.clear();
        spec.image.tag.clear();
        spec.resources.limits.cpu.clear();
        spec.resources.requests.memory.clear();

        let errs = validate_proxy(&spec);
        let paths: Vec<&str> = errs.iter().map(|err| err.path.as_str()).collect();
        assert!(paths.contains(&"spec.upstream.collectorHost"));
        assert!(paths.contains(&"spec.image.repository"));
        assert!(paths.contains(&"spec.image.tag"));
        assert!(paths.contains(&"spec.resources.limits.cpu"));
        assert!(paths.contains(&"spec.resources.requests.memory"));
        assert_eq!(errs.len(), 5);
    }

    #[tokio::test]
    async fn review_denied_with_field_errors() {
        let proxy = {
            let mut proxy = fixtures::proxy("default", "p1");
            proxy.spec.ports =
                vec![PortSpec { name: String::new(), port: 0, path: String::new() }];
            proxy
        };

        let review: AdmissionReview<JaegerNginxProxy> =
            serde_json::from_value(serde_json::json!({
                "apiVersion": "admission.k8s.io/v1",
                "kind": "AdmissionReview",
                "request": {
                    "uid": "4be0b87a-0d6b-4a3e-8d10-02394a4e7c8f",
                    "kind": {
                        "group": "jaeger-nginx-proxy.platform-engineer.stream",
                        "version": "v1alpha0",
                        "kind": "JaegerNginxProxy"
                    },
                    "resource": {
                        "group": "jaeger-nginx-proxy.platform-engineer.stream",
                        "version": "v1alpha0",
                        "resource": "jaegernginxproxies"
                    },
                    "operation": "CREATE",
                    "userInfo": {},
                    "object": serde_json::to_value(&proxy).expect("serializable proxy")
                }
            }))
            .expect("well-formed review");

        let Json(reviewed) =
            validate_handler(State(WebhookState { deep_check: false }), Json(review)).await;
        let response = reviewed.response.expect("response set");

        assert!(!response.allowed);
        let message = response.result.message;
        assert!(message.contains("spec.ports[0].name: port name is required"), "{message}");
        assert!(message.contains("spec.ports[0].port"), "{message}");
        assert!(message.contains("spec.ports[0].path"), "{message}");
    }

    #[tokio::test]
    async fn review_admits_valid_object() {
        let proxy = fixtures::proxy("default", "p1");

        let review: AdmissionReview<JaegerNginxProxy> =
            serde_json::from_value(serde_json::json!({
                "apiVersion": "admission.k8s.io/v1",
                "kind": "AdmissionReview",
                "request": {
                    "uid": "8f7a2c9e-95b3-4a1d-b1db-1f5a4d9f4e11",
                    "kind": {
                        "group": "jaeger-nginx-proxy.platform-engineer.stream",
                        "version": "v1alpha0",
                        "kind": "JaegerNginxProxy"
                    },
                    "resource": {
                        "group": "jaeger-nginx-proxy.platform-engineer.stream",
                        "version": "v1alpha0",
                        "resource": "jaegernginxproxies"
                    },
                    "operation": "UPDATE",
                    "userInfo": {},
                    "object": serde_json::to_value(&proxy).expect("serializable proxy"),
                    "oldObject": serde_json::to_value(&proxy).expect("serializable proxy")
                }
            }))
            .expect("well-formed review");

        let Json(reviewed) =
            validate_handler(State(WebhookState { deep_check: false }), Json(review)).await;
        let response = reviewed.response.expect("response set");
        assert!(response.allowed);
    }
}
