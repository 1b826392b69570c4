use std::sync::atomic::{AtomicU64, Ordering};

use tokio::{fs, process::Command};

use crate::controllers::proxy::JaegerNginxProxySpec;
use crate::error::Error;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Render the nginx proxy configuration for a spec.
///
/// The output is a pure function of the spec: port blocks follow the
/// spec's order and nothing here reads clocks or ambient state.
pub fn render(spec: &JaegerNginxProxySpec) -> String {
    let mut config = String::new();

    config.push_str("log_format custom_format '$remote_addr - $remote_user [$time_local] '\n");
    config.push_str("                             '\"$request\" \"args=$args\" \"q=$query_string\" '\n");
    config.push_str("                             '\"url=$uri\" \"status=$status\" '\n");
    config.push_str("                             '\"bytes=$body_bytes_sent\" \"ref=$http_referer\" '\n");
    config.push_str("                             '\"agent=$http_user_agent\" \"$http_x_forwarded_for\" ';\n\n");

    for port in &spec.ports {
        config.push_str(&format!("upstream jaeger-collector-{} {{\n", port.name));
        config.push_str(&format!("  server {}:{};\n", spec.upstream.collector_host, port.port));
        config.push_str("}\n\n");
    }

    config.push_str("server {\n");
    config.push_str(&format!("  listen {} default_server;\n\n", spec.container_port));

    config.push_str("  access_log /dev/stdout custom_format;\n");
    config.push_str("  error_log  /dev/stderr;\n\n");

    config.push_str("  proxy_connect_timeout 600;\n");
    config.push_str("  proxy_send_timeout 600;\n");
    config.push_str("  proxy_read_timeout 600;\n");
    config.push_str("  send_timeout 600;\n");
    config.push_str("  client_max_body_size 100m;\n\n");

    config.push_str("  location /healthz {\n");
    config.push_str("        access_log off;\n");
    config.push_str("        return 200;\n");
    config.push_str("  }\n\n");

    for port in &spec.ports {
        config.push_str(&format!("  location {} {{\n", port.path));
        config.push_str(&format!("     proxy_pass http://jaeger-collector-{};\n", port.name));
        config.push_str("  }\n\n");
    }

    config.push_str("}\n");

    config
}

/// Syntactic self-check of a rendered configuration.
///
/// Catches unbalanced braces, directives missing both `{` and `;`, and the
/// absence of a `server` block or `listen` directive.
pub fn validate(config: &str) -> Result<(), Error> {
    let mut brace_count: i64 = 0;

    for (i, raw) in config.lines().enumerate() {
        let line = raw.trim();

        if line.starts_with('#') || line.is_empty() {
            continue;
        }

        brace_count += line.matches('{').count() as i64;
        brace_count -= line.matches('}').count() as i64;

        if brace_count < 0 {
            return Err(Error::InvalidConfig(format!(
                "unmatched closing brace on line {}: {}",
                i + 1,
                line
            )));
        }

        for directive in ["server", "location", "upstream"] {
            if line.contains(directive) && !line.contains('{') && !line.contains(';') {
                return Err(Error::InvalidConfig(format!(
                    "invalid {} directive on line {}: {}",
                    directive,
                    i + 1,
                    line
                )));
            }
        }
    }

    if brace_count != 0 {
        return Err(Error::InvalidConfig(format!(
            "unmatched opening braces: {brace_count} unclosed"
        )));
    }

    if !config.contains("server {") {
        return Err(Error::InvalidConfig("missing server block".to_string()));
    }

    if !config.contains("listen") {
        return Err(Error::InvalidConfig("missing listen directive".to_string()));
    }

    Ok(())
}

/// Deeper check through `nginx -t`, when a binary is around.
///
/// Callers treat a failure as a warning; the binary is not part of the
/// controller's deployment contract.
pub async fn deep_check(config: &str) -> Result<(), Error> {
    let path = std::env::temp_dir().join(format!(
        "nginx-config-{}-{}.conf",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    fs::write(&path, config).await?;

    let output = Command::new("nginx").args(["-t", "-c"]).arg(&path).output().await;

    let _ = fs::remove_file(&path).await;

    match output {
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => Err(Error::InvalidConfig(format!(
            "nginx validation failed: {}",
            String::from_utf8_lossy(&out.stderr)
        ))),
        Err(err) => Err(Error::InvalidConfig(format!("failed to run nginx: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::proxy::fixtures;

    #[test]
    fn renders_upstream_server_and_locations() {
        let config = render(&fixtures::spec());

        assert!(config.starts_with("log_format custom_format"));
        assert!(config.contains("upstream jaeger-collector-http {\n  server c.svc:14268;\n}"));
        assert!(config.contains("listen 8080 default_server;"));
        assert!(config.contains("location /healthz {"));
        assert!(config.contains("location /api/traces {\n     proxy_pass http://jaeger-collector-http;\n  }"));
        assert!(config.ends_with("}\n"));
    }

    #[test]
    fn render_is_deterministic() {
        let spec = fixtures::spec();
        assert_eq!(render(&spec), render(&spec));
    }

    #[test]
    fn render_preserves_port_order() {
        let mut spec = fixtures::spec();
        spec.ports.push(crate::controllers::proxy::PortSpec {
            name: "grpc".to_string(),
            port: 14250,
            path: "/grpc".to_string(),
        });

        let config = render(&spec);
        let http = config.find("upstream jaeger-collector-http").expect("http upstream");
        let grpc = config.find("upstream jaeger-collector-grpc").expect("grpc upstream");
        assert!(http < grpc);

        let http_loc = config.find("location /api/traces").expect("http location");
        let grpc_loc = config.find("location /grpc").expect("grpc location");
        assert!(http_loc < grpc_loc);
    }

    #[test]
    fn rendered_config_passes_self_check() {
        let config = render(&fixtures::spec());
        validate(&config).expect("rendered config is valid");
    }

    #[test]
    fn validate_rejects_unbalanced_braces() {
        let err = validate("server {\n  listen 80;\n").expect_err("unclosed brace");
        assert!(err.to_string().contains("unclosed"));

        let err = validate("server {\n  listen 80;\n}\n}\n").expect_err("extra closing brace");
        assert!(err.to_string().contains("unmatched closing brace"));
    }

    #[test]
    fn validate_rejects_missing_server_or_listen() {
        let err = validate("upstream u {\n  server a:1;\n}\n").expect_err("no server block");
        assert!(err.to_string().contains("missing server block"));

        let err = validate("server {\n}\n").expect_err("no listen");
        assert!(err.to_string().contains("missing listen directive"));
    }

    #[test]
    fn validate_rejects_malformed_directives() {
        let err = validate("server {\n  listen 80;\n}\nlocation /broken\n").expect_err("bare location");
        assert!(err.to_string().contains("invalid location directive"));

        let err = validate("server {\n  listen 80;\n}\nupstream broken\n").expect_err("bare upstream");
        assert!(err.to_string().contains("invalid upstream directive"));
    }
}
