//! Vendor-facing services: ticketing and IVR dispatch, plus the shared
//! plumbing every vendor call goes through (tracing into HTTP logs,
//! secret redaction, bounded retries).

pub mod ivr;
pub mod tickets;

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{FlowhubError, Result};

/// What replaces a secret in stored logs.
pub const REDACTION_MASK: &str = "****************";

/// Masks configured secrets in anything persisted.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Redactor {
        Redactor {
            secrets: secrets.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    pub fn redact(&self, raw: &str) -> String {
        let mut out = raw.to_string();
        for secret in &self.secrets {
            out = out.replace(secret, REDACTION_MASK);
        }
        out
    }
}

/// One recorded vendor exchange, already redacted.
#[derive(Debug, Clone)]
pub struct HttpTrace {
    pub url: String,
    pub status_code: i32,
    pub request: String,
    pub response: String,
    pub elapsed_ms: i32,
}

/// Sends a request, retrying connection failures and 5xx responses with
/// jittered exponential backoff, and records the redacted exchange.
/// Returns the trace alongside the outcome so callers persist the log
/// even on failure.
pub async fn send_traced(
    request: reqwest::RequestBuilder,
    retries: u32,
    redactor: &Redactor,
) -> (Option<HttpTrace>, Result<String>) {
    let started = std::time::Instant::now();

    let Some(cloned) = request.try_clone() else {
        return (None, Err(FlowhubError::Service("unclonable request".to_string())));
    };
    let built = match cloned.build() {
        Ok(b) => b,
        Err(e) => return (None, Err(e.into())),
    };
    let url = built.url().to_string();
    let request_repr = format!(
        "{} {}\n{}",
        built.method(),
        built.url(),
        built
            .body()
            .and_then(|b| b.as_bytes())
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    );

    let mut attempt = 0;
    loop {
        attempt += 1;
        let this_try = match request.try_clone() {
            Some(r) => r,
            None => break (None, Err(FlowhubError::Service("unclonable request".to_string()))),
        };

        let outcome = this_try.send().await;
        match outcome {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let trace = HttpTrace {
                    url: url.clone(),
                    status_code: status.as_u16() as i32,
                    request: redactor.redact(&request_repr),
                    response: redactor.redact(&body),
                    elapsed_ms: started.elapsed().as_millis() as i32,
                };

                if status.is_server_error() && attempt <= retries {
                    warn!(url = %url, status = %status, attempt, "vendor call failed, retrying");
                    backoff(attempt).await;
                    continue;
                }
                if !status.is_success() {
                    return (
                        Some(trace),
                        Err(FlowhubError::Service(format!("vendor returned status {status}"))),
                    );
                }
                return (Some(trace), Ok(body));
            }
            Err(err) if attempt <= retries => {
                warn!(url = %url, error = %err, attempt, "vendor call errored, retrying");
                backoff(attempt).await;
            }
            Err(err) => {
                let trace = HttpTrace {
                    url: url.clone(),
                    status_code: 0,
                    request: redactor.redact(&request_repr),
                    response: String::new(),
                    elapsed_ms: started.elapsed().as_millis() as i32,
                };
                return (Some(trace), Err(err.into()));
            }
        }
    }
}

/// Exponential backoff with jitter, starting at 100ms.
async fn backoff(attempt: u32) {
    let base = 100u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..base / 2 + 1);
    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redactor_masks_all_secrets() {
        let redactor = Redactor::new(vec!["sesame".to_string(), "523562".to_string()]);
        let body = r#"{"auth": "Bearer sesame", "account": "523562", "text": "hi"}"#;
        let redacted = redactor.redact(body);

        assert!(!redacted.contains("sesame"));
        assert!(!redacted.contains("523562"));
        assert!(redacted.contains(REDACTION_MASK));
        assert!(redacted.contains("\"text\": \"hi\""));
    }

    #[test]
    fn redactor_ignores_empty_secrets() {
        let redactor = Redactor::new(vec![String::new()]);
        assert_eq!(redactor.redact("body"), "body");
    }
}
