//! Argument checks applied before a tool call reaches its server.

use std::sync::LazyLock;

use agora_core::model::SandboxPolicy;
use regex::Regex;
use serde_json::Value;

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]+"#).expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxViolation {
    #[error("Tool call quota exceeded ({limit} calls per session)")]
    QuotaExceeded { limit: u32 },

    #[error("Network access is disabled for this server (argument contains {url})")]
    NetworkDisabled { url: String },

    #[error("Domain '{host}' is not in the allowed domains list")]
    DomainNotAllowed { host: String },
}

/// Every URL found in any string value of `arguments`, depth first.
pub fn find_urls(arguments: &Value) -> Vec<String> {
    let mut urls = Vec::new();
    collect_urls(arguments, &mut urls);
    urls
}

fn collect_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.extend(URL_PATTERN.find_iter(s).map(|m| m.as_str().to_string())),
        Value::Array(items) => items.iter().for_each(|v| collect_urls(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_urls(v, out)),
        _ => {}
    }
}

/// `host` matches an entry exactly or is a subdomain of it.
fn domain_allowed(host: &str, allowed: &[String]) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    allowed.iter().any(|entry| {
        let entry = entry.trim().trim_start_matches("*.").to_ascii_lowercase();
        host == entry || host.ends_with(&format!(".{entry}"))
    })
}

/// Network and domain checks for one call's arguments.
pub fn check_arguments(policy: &SandboxPolicy, arguments: &Value) -> Result<(), SandboxViolation> {
    let urls = find_urls(arguments);
    if urls.is_empty() {
        return Ok(());
    }
    if !policy.network_enabled {
        return Err(SandboxViolation::NetworkDisabled {
            url: urls[0].clone(),
        });
    }
    if policy.allowed_domains.is_empty() {
        return Ok(());
    }
    for raw in &urls {
        let host = url::Url::parse(raw)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        match host {
            Some(host) if domain_allowed(&host, &policy.allowed_domains) => {}
            Some(host) => return Err(SandboxViolation::DomainNotAllowed { host }),
            None => {
                return Err(SandboxViolation::DomainNotAllowed { host: raw.clone() });
            }
        }
    }
    Ok(())
}
