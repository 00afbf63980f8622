//! Push-channel ticketing against a Zendesk-style JSON API.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{FlowhubError, Result};
use crate::models::{Contact, Ticket, Ticketer};
use crate::runtime::Runtime;
use crate::services::{send_traced, HttpTrace, Redactor};

use super::{OpenedTicket, TicketService};

const CONFIG_SUBDOMAIN: &str = "subdomain";
const CONFIG_OAUTH_TOKEN: &str = "oauth_token";
const CONFIG_PUSH_ID: &str = "push_id";

pub struct ZendeskService {
    http: reqwest::Client,
    retries: u32,
    subdomain: String,
    oauth_token: String,
    push_id: String,
    redactor: Redactor,
}

pub fn factory(rt: &Runtime, ticketer: &Ticketer) -> Result<Box<dyn TicketService>> {
    let subdomain = ticketer.config_value(CONFIG_SUBDOMAIN).unwrap_or("").to_string();
    let oauth_token = ticketer.config_value(CONFIG_OAUTH_TOKEN).unwrap_or("").to_string();

    if subdomain.is_empty() || oauth_token.is_empty() {
        return Err(FlowhubError::Service(
            "missing subdomain or oauth_token in zendesk config".to_string(),
        ));
    }

    Ok(Box::new(ZendeskService {
        http: rt.http.clone(),
        retries: rt.config.http_retries,
        redactor: Redactor::new(vec![oauth_token.clone()]),
        subdomain,
        oauth_token,
        push_id: ticketer.config_value(CONFIG_PUSH_ID).unwrap_or("").to_string(),
    }))
}

impl ZendeskService {
    /// Pushes one external message into the any-channel API, returning the
    /// external resource id Zendesk assigned.
    async fn push(
        &self,
        author_id: &str,
        author_name: &str,
        subject: &str,
        text: &str,
        thread_id: Option<&str>,
        traces: &mut Vec<HttpTrace>,
    ) -> Result<String> {
        let body = json!({
            "instance_push_id": self.push_id,
            "external_resources": [{
                "external_id": thread_id.unwrap_or(author_id),
                "message": text,
                "internal_note": false,
                "thread_id": thread_id,
                "author": {"external_id": author_id, "name": author_name},
                "fields": [{"id": "subject", "value": subject}],
            }],
        });

        let request = self
            .http
            .post(format!(
                "https://{}.zendesk.com/api/v2/any_channel/push.json",
                self.subdomain
            ))
            .bearer_auth(&self.oauth_token)
            .json(&body);

        let (trace, outcome) = send_traced(request, self.retries, &self.redactor).await;
        if let Some(trace) = trace {
            traces.push(trace);
        }
        let response = outcome.map_err(|e| e.wrap("error calling zendesk API"))?;

        let parsed: serde_json::Value = serde_json::from_str(&response)
            .map_err(|_| FlowhubError::Service("malformed zendesk response".to_string()))?;
        let result = &parsed["results"][0];
        if result["status"]["code"] != "success" {
            return Err(FlowhubError::Service(format!(
                "zendesk push rejected: {}",
                result["status"]["description"].as_str().unwrap_or("unknown")
            )));
        }

        Ok(result["external_resource_id"].as_str().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl TicketService for ZendeskService {
    async fn open(
        &self,
        contact: &Contact,
        subject: &str,
        body: &str,
        traces: &mut Vec<HttpTrace>,
    ) -> Result<OpenedTicket> {
        let author_id = contact.uuid.to_string();
        let author_name = contact.name.clone().unwrap_or_default();

        let external_id = self.push(&author_id, &author_name, subject, body, None, traces).await?;

        let mut config = HashMap::new();
        config.insert("contact-uuid".to_string(), author_id);
        Ok(OpenedTicket { external_id: Some(external_id), config })
    }

    async fn forward(
        &self,
        ticket: &Ticket,
        text: &str,
        traces: &mut Vec<HttpTrace>,
    ) -> Result<()> {
        let author_id = ticket.config_value("contact-uuid").unwrap_or("").to_string();
        self.push(
            &author_id,
            "",
            &ticket.subject,
            text,
            ticket.external_id.as_deref(),
            traces,
        )
        .await?;
        Ok(())
    }

    async fn close(&self, tickets: &[Ticket], traces: &mut Vec<HttpTrace>) -> Result<()> {
        for ticket in tickets {
            let author_id = ticket.config_value("contact-uuid").unwrap_or("").to_string();
            self.push(
                &author_id,
                "",
                &ticket.subject,
                "Ticket has been closed",
                ticket.external_id.as_deref(),
                traces,
            )
            .await?;
        }
        Ok(())
    }

    async fn reopen(&self, tickets: &[Ticket], traces: &mut Vec<HttpTrace>) -> Result<()> {
        for ticket in tickets {
            let author_id = ticket.config_value("contact-uuid").unwrap_or("").to_string();
            self.push(
                &author_id,
                "",
                &ticket.subject,
                "Ticket has been reopened",
                ticket.external_id.as_deref(),
                traces,
            )
            .await?;
        }
        Ok(())
    }
}
