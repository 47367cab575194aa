//! Proxy route template renderer
//!
//! Pure function from an instance descriptor to nginx server-block text.
//! No I/O happens here; identical input always yields byte-identical
//! output, which is what lets the synchronizer diff and re-publish routes
//! safely.

use crate::error::{InstancerError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// Fixed placeholder contract: `{hostname}`, `{container_ip}`,
/// `{container_port}`, `{challenge_name}`, `{timestamp}`, `{container_id}`
/// (truncated to 12 chars). The literal braces below belong to nginx.
pub const ROUTE_TEMPLATE: &str = r#"# Route for challenge "{challenge_name}" (container {container_id})
# Generated at {timestamp} - managed by instancer, do not edit.
server {
    listen 80;
    server_name {hostname};

    access_log /var/log/nginx/challenges/{hostname}.access.log;
    error_log /var/log/nginx/challenges/{hostname}.error.log;

    location = /health {
        access_log off;
        return 200 "healthy";
    }

    location / {
        proxy_pass http://{container_ip}:{container_port}/;
        proxy_http_version 1.1;
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
        proxy_read_timeout 3600s;
    }
}
"#;

/// Hostnames must be plain DNS labels and dots; anything that could break
/// out of the template (braces, quotes, semicolons, whitespace) is rejected.
static HOSTNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9.-]*[a-z0-9])?$").expect("valid regex"));

/// Input to the renderer. `timestamp` is part of the input on purpose:
/// rendering the same descriptor twice must produce identical bytes.
#[derive(Debug, Clone)]
pub struct RouteParams {
    pub hostname: String,
    pub container_ip: String,
    pub container_port: u16,
    pub challenge_name: String,
    pub container_id: String,
    pub timestamp: DateTime<Utc>,
}

impl RouteParams {
    pub fn target_address(&self) -> String {
        format!("{}:{}", self.container_ip, self.container_port)
    }
}

pub fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.len() > 253 || !HOSTNAME_RE.is_match(hostname) {
        return Err(InstancerError::Template(format!(
            "hostname {:?} contains characters outside [a-z0-9.-]",
            hostname
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.contains(['{', '}', '"', ';', '\n', '\r']) {
        return Err(InstancerError::Template(format!(
            "challenge name {:?} contains template-breaking characters",
            name
        )));
    }
    Ok(())
}

/// Render `template` with the fixed placeholder set. Pure; two calls with
/// identical input produce byte-identical output.
pub fn render(template: &str, params: &RouteParams) -> Result<String> {
    validate_hostname(&params.hostname)?;
    validate_name(&params.challenge_name)?;

    let container_id: String = params.container_id.chars().take(12).collect();
    let timestamp = params.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);

    Ok(template
        .replace("{hostname}", &params.hostname)
        .replace("{container_ip}", &params.container_ip)
        .replace("{container_port}", &params.container_port.to_string())
        .replace("{challenge_name}", &params.challenge_name)
        .replace("{container_id}", &container_id)
        .replace("{timestamp}", &timestamp))
}
