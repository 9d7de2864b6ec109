//! Public hostname scheme: `{port}-{sandboxId}.{region}.{domain}`.
//!
//! The sandbox id is globally unique and the port is unique within its
//! sandbox, so every generated hostname is collision-free without any
//! coordination.

use thiserror::Error;

use crate::resources::is_dns_label;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub port: u16,
    pub sandbox_id: String,
    pub region: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("host {0:?} is not under the sandbox domain")]
    ForeignDomain(String),
    #[error("host {0:?} does not match {{port}}-{{sandbox}}.{{region}}")]
    Malformed(String),
    #[error("invalid port in host {0:?}")]
    InvalidPort(String),
}

pub fn route_domain(port: u16, sandbox_id: &str, region: &str, domain: &str) -> String {
    format!("{port}-{sandbox_id}.{region}.{domain}")
}

pub fn public_url(port: u16, sandbox_id: &str, region: &str, domain: &str) -> String {
    format!("https://{}", route_domain(port, sandbox_id, region, domain))
}

/// Splits a `Host` header value into its port, sandbox id and region.
/// Matching is case-insensitive; a trailing `:port` and root dot are ignored.
pub fn parse_host(host: &str, domain: &str) -> Result<HostTarget, HostError> {
    let host = host.trim().to_ascii_lowercase();
    let host = host.split(':').next().unwrap_or_default();
    let host = host.trim_end_matches('.');
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();

    let prefix = host
        .strip_suffix(domain.as_str())
        .and_then(|rest| rest.strip_suffix('.'))
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| HostError::ForeignDomain(host.to_string()))?;

    let (label, region) = prefix
        .split_once('.')
        .ok_or_else(|| HostError::Malformed(host.to_string()))?;
    if !is_dns_label(region) {
        return Err(HostError::Malformed(host.to_string()));
    }

    let (port, sandbox_id) = label
        .split_once('-')
        .ok_or_else(|| HostError::Malformed(host.to_string()))?;
    let port: u16 = port
        .parse()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| HostError::InvalidPort(host.to_string()))?;
    if !is_dns_label(sandbox_id) {
        return Err(HostError::Malformed(host.to_string()));
    }

    Ok(HostTarget {
        port,
        sandbox_id: sandbox_id.to_string(),
        region: region.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn builds_collision_free_domain() {
        assert_eq!(
            route_domain(3000, "abc123", "us2", "sbx.example.dev"),
            "3000-abc123.us2.sbx.example.dev"
        );
        assert_eq!(
            public_url(3000, "abc123", "us2", "sbx.example.dev"),
            "https://3000-abc123.us2.sbx.example.dev"
        );
    }

    #[test_timeout::timeout]
    fn parses_generated_hosts() {
        let host = route_domain(8080, "web-app-7", "eu1", "sbx.example.dev");
        let target = parse_host(&host, "sbx.example.dev").expect("parse");
        assert_eq!(
            target,
            HostTarget {
                port: 8080,
                sandbox_id: "web-app-7".into(),
                region: "eu1".into(),
            }
        );
    }

    #[test_timeout::timeout]
    fn ignores_case_port_and_root_dot() {
        let target = parse_host("3000-ABC123.US2.Sbx.Example.Dev.:443", "sbx.example.dev")
            .expect("parse");
        assert_eq!(target.port, 3000);
        assert_eq!(target.sandbox_id, "abc123");
        assert_eq!(target.region, "us2");
    }

    #[test_timeout::timeout]
    fn rejects_malformed_hosts() {
        let domain = "sbx.example.dev";
        assert!(matches!(
            parse_host("3000-abc.us2.other.dev", domain),
            Err(HostError::ForeignDomain(_))
        ));
        assert!(matches!(
            parse_host("sbx.example.dev", domain),
            Err(HostError::ForeignDomain(_))
        ));
        assert!(matches!(
            parse_host("abc123.us2.sbx.example.dev", domain),
            Err(HostError::Malformed(_))
        ));
        assert!(matches!(
            parse_host("3000-abc.a.b.sbx.example.dev", domain),
            Err(HostError::Malformed(_))
        ));
        assert!(matches!(
            parse_host("99999-abc.us2.sbx.example.dev", domain),
            Err(HostError::InvalidPort(_))
        ));
        assert!(matches!(
            parse_host("0-abc.us2.sbx.example.dev", domain),
            Err(HostError::InvalidPort(_))
        ));
    }
}
