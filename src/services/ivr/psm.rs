//! The phone-state-machine voice provider: a JSON-over-HTTP provider that
//! posts call requests and receives JSON callbacks.

use async_trait::async_trait;
use serde_json::json;

use crate::engine::{Event, EngineOutput, Resume};
use crate::error::{FlowhubError, Result};
use crate::models::channels::ChannelEventType;
use crate::models::urns::Urn;
use crate::models::{Channel, ConnectionStatus};
use crate::runtime::Runtime;
use crate::services::{send_traced, HttpTrace, Redactor};

use super::{CallbackRequest, IvrProvider};

const CONFIG_CALL_URL: &str = "call_url";
const CONFIG_AUTH_TOKEN: &str = "auth_token";

pub struct PsmProvider {
    http: reqwest::Client,
    retries: u32,
    call_url: String,
    auth_token: String,
    redactor: Redactor,
}

pub fn factory(rt: &Runtime, channel: &Channel) -> Result<Box<dyn IvrProvider>> {
    let call_url = channel
        .config
        .get(CONFIG_CALL_URL)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let auth_token = channel
        .config
        .get(CONFIG_AUTH_TOKEN)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    Ok(Box::new(PsmProvider {
        http: rt.http.clone(),
        retries: rt.config.http_retries,
        redactor: Redactor::new(vec![auth_token.clone()]),
        call_url,
        auth_token,
    }))
}

#[async_trait]
impl IvrProvider for PsmProvider {
    async fn request_call(
        &self,
        urn: &str,
        handle_url: &str,
        status_url: &str,
        traces: &mut Vec<HttpTrace>,
    ) -> Result<String> {
        if self.call_url.is_empty() {
            return Err(FlowhubError::Service("channel has no call_url configured".to_string()));
        }

        let request = self
            .http
            .post(&self.call_url)
            .bearer_auth(&self.auth_token)
            .json(&json!({
                "urn": urn,
                "handle_url": handle_url,
                "status_url": status_url,
            }));

        let (trace, outcome) = send_traced(request, self.retries, &self.redactor).await;
        if let Some(trace) = trace {
            traces.push(trace);
        }
        let body = outcome.map_err(|e| e.wrap("error requesting call"))?;

        let parsed: serde_json::Value = serde_json::from_str(&body)
            .map_err(|_| FlowhubError::Service("malformed call response".to_string()))?;
        let call_id = parsed["call_id"].as_str().unwrap_or_default();
        if call_id.is_empty() {
            return Err(FlowhubError::Service("no call_id in call response".to_string()));
        }
        Ok(call_id.to_string())
    }

    async fn hangup_call(&self, external_id: &str, traces: &mut Vec<HttpTrace>) -> Result<()> {
        let request = self
            .http
            .post(format!("{}/{}/hangup", self.call_url.trim_end_matches('/'), external_id))
            .bearer_auth(&self.auth_token);

        let (trace, outcome) = send_traced(request, self.retries, &self.redactor).await;
        if let Some(trace) = trace {
            traces.push(trace);
        }
        outcome.map(|_| ()).map_err(|e| e.wrap("error hanging up call"))
    }

    fn validate_signature(&self, _request: &CallbackRequest) -> Result<()> {
        // callbacks carry no signature; transport auth is the bearer token
        Ok(())
    }

    fn urn_for_request(&self, request: &CallbackRequest) -> Result<String> {
        let urn = request
            .body_str("urn")
            .ok_or_else(|| FlowhubError::Validation("no urn found in body".to_string()))?;
        let parsed = Urn::parse(&format!("tel:+{}", urn.trim_start_matches('+')))?;
        Ok(parsed.identity())
    }

    fn call_id_for_request(&self, request: &CallbackRequest) -> Result<String> {
        request
            .body_str("call_id")
            .map(String::from)
            .ok_or_else(|| FlowhubError::Validation("no call_id found in body".to_string()))
    }

    fn status_for_request(&self, request: &CallbackRequest) -> (ConnectionStatus, i32) {
        let status = request
            .body_str("status")
            .or_else(|| request.query_value("CallStatus"))
            .unwrap_or("");
        match status {
            "queued" | "ringing" => (ConnectionStatus::Wired, 0),
            "initiated" | "in-progress" => (ConnectionStatus::InProgress, 0),
            "completed" => {
                let duration = request
                    .body
                    .get("duration")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0) as i32;
                (ConnectionStatus::Completed, duration)
            }
            "busy" => (ConnectionStatus::Busy, 0),
            "no-answer" => (ConnectionStatus::NoAnswer, 0),
            "canceled" | "failed" => (ConnectionStatus::Errored, 0),
            _ => (ConnectionStatus::Failed, 0),
        }
    }

    fn resume_for_request(&self, request: &CallbackRequest) -> Result<Resume> {
        if let Some(dial_status) = request.body_str("dial_status") {
            let duration = request
                .body
                .get("dial_duration")
                .and_then(|v| v.as_i64())
                .unwrap_or(0) as i32;
            return Ok(Resume::Dial {
                status: dial_status.to_string(),
                duration_seconds: duration,
            });
        }

        if request.body_str("wait_timeout").is_some() {
            return Ok(Resume::WaitTimeout);
        }

        let input = request
            .body_str("input")
            .ok_or_else(|| FlowhubError::Validation("no input found in body".to_string()))?;
        Ok(Resume::Msg {
            msg_uuid: uuid::Uuid::new_v4(),
            text: input.to_string(),
            urn: request.body_str("urn").map(|u| format!("tel:+{}", u.trim_start_matches('+'))),
        })
    }

    fn event_for_call_data(&self, request: &CallbackRequest) -> Result<(ChannelEventType, i32)> {
        let status = request.body_str("status").unwrap_or("");
        let duration = request.body.get("duration").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        match status {
            "miss" | "missed" => Ok((ChannelEventType::MoMiss, 0)),
            _ => Ok((ChannelEventType::MoCall, duration)),
        }
    }

    fn write_session_response(&self, output: &EngineOutput, resume_url: &str) -> Result<serde_json::Value> {
        // render the sprint's voice prompts plus whether we're gathering
        // input, which the provider plays back and acts on
        let mut say = Vec::new();
        for event in &output.events {
            if let Event::IvrCreated { msg } = event {
                say.push(json!({"text": msg.text, "attachments": msg.attachments}));
            }
        }

        let gather = output.wait.as_ref().map(|w| {
            json!({
                "resume_url": resume_url,
                "timeout": w.timeout_seconds,
            })
        });

        Ok(json!({
            "say": say,
            "gather": gather,
            "hangup": output.wait.is_none(),
        }))
    }

    fn error_response(&self, message: &str) -> serde_json::Value {
        json!({"error": message, "hangup": true})
    }

    fn empty_response(&self, message: &str) -> serde_json::Value {
        json!({"message": message})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineStatus, EngineWait, MsgOut};

    fn provider() -> PsmProvider {
        PsmProvider {
            http: reqwest::Client::new(),
            retries: 0,
            call_url: "https://psm.example.com/call".to_string(),
            auth_token: "tok".to_string(),
            redactor: Redactor::new(vec!["tok".to_string()]),
        }
    }

    fn callback(body: serde_json::Value) -> CallbackRequest {
        CallbackRequest { query: Default::default(), body }
    }

    #[test]
    fn status_mapping() {
        let p = provider();
        assert_eq!(p.status_for_request(&callback(json!({"status": "ringing"}))).0, ConnectionStatus::Wired);
        assert_eq!(p.status_for_request(&callback(json!({"status": "in-progress"}))).0, ConnectionStatus::InProgress);
        assert_eq!(
            p.status_for_request(&callback(json!({"status": "completed", "duration": 33}))),
            (ConnectionStatus::Completed, 33)
        );
        assert_eq!(p.status_for_request(&callback(json!({"status": "busy"}))).0, ConnectionStatus::Busy);
        assert_eq!(p.status_for_request(&callback(json!({"status": "failed"}))).0, ConnectionStatus::Errored);
        assert_eq!(p.status_for_request(&callback(json!({"status": "???"}))).0, ConnectionStatus::Failed);
    }

    #[test]
    fn urn_extraction_normalizes_tel() {
        let p = provider();
        let urn = p.urn_for_request(&callback(json!({"urn": "206 555 1212"}))).unwrap();
        assert_eq!(urn, "tel:+2065551212");

        assert!(p.urn_for_request(&callback(json!({}))).is_err());
    }

    #[test]
    fn resume_extraction() {
        let p = provider();
        match p.resume_for_request(&callback(json!({"input": "2", "urn": "1234"}))).unwrap() {
            Resume::Msg { text, urn, .. } => {
                assert_eq!(text, "2");
                assert_eq!(urn.as_deref(), Some("tel:+1234"));
            }
            other => panic!("unexpected resume: {other:?}"),
        }

        match p
            .resume_for_request(&callback(json!({"dial_status": "answered", "dial_duration": 5})))
            .unwrap()
        {
            Resume::Dial { status, duration_seconds } => {
                assert_eq!(status, "answered");
                assert_eq!(duration_seconds, 5);
            }
            other => panic!("unexpected resume: {other:?}"),
        }
    }

    #[test]
    fn session_response_renders_prompts_and_gather() {
        let p = provider();
        let output = EngineOutput {
            session_uuid: uuid::Uuid::new_v4(),
            status: EngineStatus::Waiting,
            current_flow: None,
            runs: vec![],
            wait: Some(EngineWait { timeout_seconds: Some(30) }),
            state: json!({}),
            events: vec![Event::IvrCreated {
                msg: MsgOut {
                    uuid: uuid::Uuid::new_v4(),
                    text: "Press 1 for cookies".to_string(),
                    urn: None,
                    channel: None,
                    attachments: vec![],
                    quick_replies: vec![],
                },
            }],
        };

        let response = p.write_session_response(&output, "https://hub/resume").unwrap();
        assert_eq!(response["say"][0]["text"], "Press 1 for cookies");
        assert_eq!(response["gather"]["resume_url"], "https://hub/resume");
        assert_eq!(response["hangup"], false);
    }
}
