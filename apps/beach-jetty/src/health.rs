//! Answers requests that could not reach a healthy sandbox backend.
//!
//! [`decide`] maps a sandbox's lifecycle state to a status code, headers and
//! a reason; [`HealthEngine`] adds the registry lookup, the wake side effect
//! and content negotiation. Only new requests come through here, so nothing
//! in this module ever affects an established connection.

use axum::{
    http::{
        header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};
use jetty_proto::host::HostTarget;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::registry::{LifecycleState, SandboxDirectory, SandboxRecord};
use crate::wake::WakeTrigger;

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub hibernating_retry_after: u64,
    pub starting_retry_after: u64,
    pub error_retry_after: u64,
    pub default_retry_after: u64,
    pub wake_dedup_ttl: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            hibernating_retry_after: 10,
            starting_retry_after: 3,
            error_retry_after: 30,
            default_retry_after: 5,
            wake_dedup_ttl: Duration::from_secs(30),
        }
    }
}

/// Why the request ended up here instead of at the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhealthySignal {
    /// The proxy had no route for the host.
    NoRoute,
    /// A route existed but the upstream could not serve the request.
    UpstreamUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Json,
    Html,
}

impl BodyFormat {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let wants_html = headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.to_ascii_lowercase().contains("text/html"));
        if wants_html {
            BodyFormat::Html
        } else {
            BodyFormat::Json
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthBody {
    pub reason: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: HealthBody,
    pub format: BodyFormat,
}

impl HealthResponse {
    fn new(status: StatusCode, retry_after: Option<u64>, body: HealthBody) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if let Some(seconds) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from(seconds));
        }
        Self {
            status,
            headers,
            body: HealthBody {
                retry_after,
                ..body
            },
            format: BodyFormat::Json,
        }
    }

    /// Host outside the sandbox naming scheme.
    pub fn unknown_host(host: &str, retry_after: u64) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            Some(retry_after),
            HealthBody {
                reason: "unknown_host",
                message: format!("{host} is not a sandbox address"),
                sandbox_id: None,
                port: None,
                retry_after: None,
                error: None,
            },
        )
    }

    pub fn upgrade_failed(target: &HostTarget, retry_after: u64, error: String) -> Self {
        Self::new(
            StatusCode::BAD_GATEWAY,
            Some(retry_after),
            HealthBody {
                reason: "upstream_upgrade_failed",
                message: "the sandbox did not accept the websocket connection".into(),
                sandbox_id: Some(target.sandbox_id.clone()),
                port: Some(target.port),
                retry_after: None,
                error: Some(error),
            },
        )
    }

    pub fn reason(&self) -> &'static str {
        self.body.reason
    }

    /// Only the hibernation page has an HTML rendition.
    pub fn with_format(mut self, format: BodyFormat) -> Self {
        self.format = if self.body.reason == "sandbox_hibernating" {
            format
        } else {
            BodyFormat::Json
        };
        self
    }

    fn render_html(&self) -> String {
        let refresh = self.body.retry_after.unwrap_or(10);
        format!(
            "<!doctype html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
             <meta http-equiv=\"refresh\" content=\"{refresh}\">\n\
             <title>Waking sandbox</title>\n</head>\n<body>\n\
             <h1>This sandbox is waking up</h1>\n\
             <p>{message}</p>\n<p>This page refreshes automatically in {refresh} seconds.</p>\n\
             </body>\n</html>\n",
            message = self.body.message,
        )
    }
}

impl IntoResponse for HealthResponse {
    fn into_response(self) -> Response {
        let (content_type, body) = match self.format {
            BodyFormat::Html => ("text/html; charset=utf-8", self.render_html()),
            BodyFormat::Json => (
                "application/json",
                serde_json::to_string(&self.body).unwrap_or_else(|_| "{}".to_string()),
            ),
        };
        let mut response = (self.status, body).into_response();
        let headers = response.headers_mut();
        headers.extend(self.headers);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub response: HealthResponse,
    pub wake: bool,
}

fn body(reason: &'static str, message: impl Into<String>, target: &HostTarget) -> HealthBody {
    HealthBody {
        reason,
        message: message.into(),
        sandbox_id: Some(target.sandbox_id.clone()),
        port: Some(target.port),
        retry_after: None,
        error: None,
    }
}

/// Pure mapping from registry state to the response for a failed request.
pub fn decide(
    record: Option<&SandboxRecord>,
    target: &HostTarget,
    signal: UnhealthySignal,
    settings: &HealthSettings,
) -> Decision {
    let unavailable = StatusCode::SERVICE_UNAVAILABLE;
    let retry = Some(settings.default_retry_after);

    // A record in another region means the URL does not name it.
    let Some(record) = record.filter(|record| record.region == target.region) else {
        return Decision {
            response: HealthResponse::new(
                StatusCode::NOT_FOUND,
                retry,
                body("sandbox_not_found", "no such sandbox", target),
            ),
            wake: false,
        };
    };

    let (response, wake) = match record.state {
        LifecycleState::Hibernating => (
            HealthResponse::new(
                unavailable,
                Some(settings.hibernating_retry_after),
                body("sandbox_hibernating", "the sandbox is resuming", target),
            ),
            true,
        ),
        LifecycleState::Starting => (
            HealthResponse::new(
                unavailable,
                Some(settings.starting_retry_after),
                body("sandbox_starting", "the sandbox is starting", target),
            ),
            false,
        ),
        LifecycleState::Error => (
            HealthResponse::new(
                unavailable,
                Some(settings.error_retry_after),
                HealthBody {
                    error: Some(
                        record
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "sandbox failed".to_string()),
                    ),
                    ..body("sandbox_error", "the sandbox reported an error", target)
                },
            ),
            false,
        ),
        LifecycleState::Terminated => (
            HealthResponse::new(
                unavailable,
                retry,
                body("sandbox_terminated", "the sandbox has been terminated", target),
            ),
            false,
        ),
        LifecycleState::Running => {
            let reason = if record.port(target.port).is_none() {
                body("port_not_exposed", "the sandbox does not expose this port", target)
            } else if !record.is_routable() {
                body("sandbox_unroutable", "the sandbox has no network address yet", target)
            } else {
                match signal {
                    UnhealthySignal::NoRoute => body(
                        "route_pending",
                        "routing for this sandbox is still propagating",
                        target,
                    ),
                    UnhealthySignal::UpstreamUnavailable => body(
                        "upstream_unavailable",
                        "the sandbox is not answering on this port",
                        target,
                    ),
                }
            };
            (HealthResponse::new(unavailable, retry, reason), false)
        }
    };
    Decision { response, wake }
}

/// Registry lookup plus [`decide`], firing wakes for hibernating sandboxes.
pub struct HealthEngine {
    directory: Arc<SandboxDirectory>,
    settings: HealthSettings,
    wakes: WakeTrigger,
}

impl HealthEngine {
    pub fn new(directory: Arc<SandboxDirectory>, settings: HealthSettings, wakes: WakeTrigger) -> Self {
        Self {
            directory,
            settings,
            wakes,
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    pub fn respond(
        &self,
        target: &HostTarget,
        signal: UnhealthySignal,
        format: BodyFormat,
    ) -> HealthResponse {
        let record = self.directory.lookup(&target.sandbox_id);
        let decision = decide(record.as_ref(), target, signal, &self.settings);
        metrics::counter!(
            "jetty_health_responses_total",
            1,
            "reason" => decision.response.reason()
        );
        if decision.wake {
            self.wakes.trigger(&target.sandbox_id);
        }
        decision.response.with_format(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "sbx.example.dev";

    fn target() -> HostTarget {
        HostTarget {
            port: 3000,
            sandbox_id: "abc123".into(),
            region: "us2".into(),
        }
    }

    fn record(state: LifecycleState) -> SandboxRecord {
        SandboxRecord::new("abc123", "us2", state)
            .with_pod_address("10.0.0.1")
            .expose(3000, DOMAIN)
    }

    fn decide_for(record: Option<&SandboxRecord>) -> Decision {
        decide(
            record,
            &target(),
            UnhealthySignal::UpstreamUnavailable,
            &HealthSettings::default(),
        )
    }

    fn retry_after(response: &HealthResponse) -> Option<&str> {
        response
            .headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
    }

    #[test_timeout::timeout]
    fn documented_table() {
        let cases = [
            (Some(LifecycleState::Hibernating), 503, Some("10"), "sandbox_hibernating", true),
            (Some(LifecycleState::Starting), 503, Some("3"), "sandbox_starting", false),
            (Some(LifecycleState::Error), 503, Some("30"), "sandbox_error", false),
            (None, 404, Some("5"), "sandbox_not_found", false),
            (Some(LifecycleState::Terminated), 503, Some("5"), "sandbox_terminated", false),
            (Some(LifecycleState::Running), 503, Some("5"), "upstream_unavailable", false),
        ];
        for (state, status, retry, reason, wake) in cases {
            let record = state.map(record);
            let decision = decide_for(record.as_ref());
            assert_eq!(decision.response.status.as_u16(), status, "{reason}");
            assert_eq!(retry_after(&decision.response), retry, "{reason}");
            assert_eq!(decision.response.reason(), reason);
            assert_eq!(decision.wake, wake, "{reason}");
            assert_eq!(
                decision.response.headers.get(CACHE_CONTROL).unwrap(),
                "no-store"
            );
        }
    }

    #[test_timeout::timeout]
    fn error_state_carries_stored_message() {
        let failed = record(LifecycleState::Error).with_error("image pull failed");
        let decision = decide_for(Some(&failed));
        assert_eq!(decision.response.body.error.as_deref(), Some("image pull failed"));
        assert_eq!(decision.response.body.retry_after, Some(30));
    }

    #[test_timeout::timeout]
    fn running_sandbox_fallbacks() {
        let mut unexposed = target();
        unexposed.port = 4000;
        let running = record(LifecycleState::Running);
        let decision = decide(
            Some(&running),
            &unexposed,
            UnhealthySignal::NoRoute,
            &HealthSettings::default(),
        );
        assert_eq!(decision.response.reason(), "port_not_exposed");

        let mut unassigned = running.clone();
        unassigned.pod_address = None;
        assert_eq!(
            decide_for(Some(&unassigned)).response.reason(),
            "sandbox_unroutable"
        );

        let decision = decide(
            Some(&running),
            &target(),
            UnhealthySignal::NoRoute,
            &HealthSettings::default(),
        );
        assert_eq!(decision.response.reason(), "route_pending");
        assert_eq!(retry_after(&decision.response), Some("5"));
    }

    #[test_timeout::timeout]
    fn wrong_region_is_not_found() {
        let mut elsewhere = record(LifecycleState::Running);
        elsewhere.region = "eu1".into();
        let decision = decide_for(Some(&elsewhere));
        assert_eq!(decision.response.status, StatusCode::NOT_FOUND);
        assert_eq!(retry_after(&decision.response), Some("5"));
        assert_eq!(decision.response.body.retry_after, Some(5));
    }

    #[test_timeout::timeout]
    fn accept_header_selects_format() {
        let mut headers = HeaderMap::new();
        assert_eq!(BodyFormat::from_headers(&headers), BodyFormat::Json);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9"),
        );
        assert_eq!(BodyFormat::from_headers(&headers), BodyFormat::Html);

        let hibernating = decide_for(Some(&record(LifecycleState::Hibernating)));
        assert_eq!(
            hibernating.response.with_format(BodyFormat::Html).format,
            BodyFormat::Html
        );
        let starting = decide_for(Some(&record(LifecycleState::Starting)));
        assert_eq!(
            starting.response.with_format(BodyFormat::Html).format,
            BodyFormat::Json
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn rendered_response_keeps_headers() {
        use http_body_util::BodyExt;

        let decision = decide_for(Some(&record(LifecycleState::Hibernating)));
        let response = decision.response.with_format(BodyFormat::Html).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "10");
        assert_eq!(response.headers()[CACHE_CONTROL], "no-store");
        assert!(response.headers()[CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains("http-equiv=\"refresh\" content=\"10\""));
    }
}
