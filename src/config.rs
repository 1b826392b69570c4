use std::env;

use anyhow::Context as _;
use kube::config::{KubeConfigOptions, Kubeconfig};
use log::debug;

const DEFAULT_METRICS_PORT: u16 = 8081;
const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// Runtime configuration, read once at startup from the environment.
///
/// Log verbosity is handled separately by `env_logger` via `RUST_LOG`.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Explicit kubeconfig path; falls back to the ambient default when unset.
    pub kubeconfig_path: Option<String>,
    /// Force the in-cluster service-account configuration.
    pub in_cluster: bool,
    /// Namespace scope string for the deployment informer:
    /// `""` or `"all"`, a single namespace, or a comma-separated list.
    pub informer_namespaces: String,
    /// Namespace the reconciler operates in; all namespaces when unset.
    pub target_namespace: Option<String>,
    pub metrics_port: u16,
    pub webhook_port: u16,
    pub webhook_tls_cert: Option<String>,
    pub webhook_tls_key: Option<String>,
    pub leader_election: bool,
    pub leader_election_namespace: String,
    /// Let the admission path shell out to `nginx -t` as a deeper check.
    pub nginx_binary_check: bool,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Settings {
            kubeconfig_path: env::var("KUBECONFIG").ok().filter(|path| !path.is_empty()),
            in_cluster: env_flag("IN_CLUSTER"),
            informer_namespaces: env::var("WATCH_NAMESPACES").unwrap_or_default(),
            target_namespace: env::var("TARGET_NAMESPACE").ok().filter(|ns| !ns.is_empty()),
            metrics_port: env_port("METRICS_PORT", DEFAULT_METRICS_PORT)?,
            webhook_port: env_port("WEBHOOK_PORT", DEFAULT_WEBHOOK_PORT)?,
            webhook_tls_cert: env::var("WEBHOOK_TLS_CERT").ok().filter(|path| !path.is_empty()),
            webhook_tls_key: env::var("WEBHOOK_TLS_KEY").ok().filter(|path| !path.is_empty()),
            leader_election: env_flag("LEADER_ELECTION"),
            leader_election_namespace: env::var("LEADER_ELECTION_NAMESPACE")
                .ok()
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| "default".to_string()),
            nginx_binary_check: env_flag("NGINX_BINARY_CHECK"),
        })
    }

    /// Build a kube client for the configured target: in-cluster, an explicit
    /// kubeconfig path, or whatever the environment provides by default.
    pub async fn client(&self) -> anyhow::Result<kube::Client> {
        if self.in_cluster {
            debug!("using in-cluster configuration");
            let config = kube::Config::incluster().context("in-cluster configuration")?;
            return Ok(kube::Client::try_from(config)?);
        }

        if let Some(path) = &self.kubeconfig_path {
            debug!("using kubeconfig at {path}");
            let kubeconfig =
                Kubeconfig::read_from(path).with_context(|| format!("read kubeconfig {path}"))?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context("load kubeconfig")?;
            return Ok(kube::Client::try_from(config)?);
        }

        Ok(kube::Client::try_default().await?)
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).map(|value| parse_flag(&value)).unwrap_or(false)
}

fn env_port(name: &str, default: u16) -> anyhow::Result<u16> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u16>()
            .with_context(|| format!("{name} must be a port number, got {value:?}")),
        Err(_) => Ok(default),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_spellings() {
        for value in ["1", "true", "True", "YES", "on"] {
            assert!(parse_flag(value), "{value} should enable");
        }
        for value in ["", "0", "false", "no", "off", "nope"] {
            assert!(!parse_flag(value), "{value} should disable");
        }
    }
}
