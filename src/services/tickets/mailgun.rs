//! Email-thread ticketing: each ticket is an email conversation relayed
//! through the mailgun API. Replies arrive on the ticket webhook.

use std::collections::HashMap;

use async_trait::async_trait;
use self::base64_encode::encode_basic_auth;
use uuid::Uuid;

use crate::error::{FlowhubError, Result};
use crate::models::{Contact, Ticket, Ticketer};
use crate::runtime::Runtime;
use crate::services::{send_traced, HttpTrace, Redactor};

use super::{OpenedTicket, TicketService};

const CONFIG_DOMAIN: &str = "domain";
const CONFIG_API_KEY: &str = "api_key";
const CONFIG_TO_ADDRESS: &str = "to_address";
const CONFIG_BRAND_NAME: &str = "brand_name";
const CONFIG_URL_BASE: &str = "url_base";

pub const TICKET_CONFIG_CONTACT_UUID: &str = "contact-uuid";
pub const TICKET_CONFIG_CONTACT_DISPLAY: &str = "contact-display";
pub const TICKET_CONFIG_LAST_MESSAGE_ID: &str = "last-message-id";

pub struct MailgunService {
    http: reqwest::Client,
    retries: u32,
    domain: String,
    api_key: String,
    to_address: String,
    brand_name: String,
    url_base: String,
    redactor: Redactor,
}

pub fn factory(rt: &Runtime, ticketer: &Ticketer) -> Result<Box<dyn TicketService>> {
    let get = |key: &str| ticketer.config_value(key).unwrap_or("").to_string();
    let domain = get(CONFIG_DOMAIN);
    let api_key = get(CONFIG_API_KEY);
    let to_address = get(CONFIG_TO_ADDRESS);
    let url_base = get(CONFIG_URL_BASE);

    if domain.is_empty() || api_key.is_empty() || to_address.is_empty() || url_base.is_empty() {
        return Err(FlowhubError::Service(
            "missing domain or api_key or to_address or url_base in mailgun config".to_string(),
        ));
    }

    // the basic auth header embeds the key, so it must be redacted too
    let basic_auth = encode_basic_auth("api", &api_key);

    Ok(Box::new(MailgunService {
        http: rt.http.clone(),
        retries: rt.config.http_retries,
        redactor: Redactor::new(vec![api_key.clone(), basic_auth]),
        domain,
        api_key,
        to_address,
        brand_name: get(CONFIG_BRAND_NAME),
        url_base: get(CONFIG_URL_BASE),
    }))
}

impl MailgunService {
    fn contact_url(&self, contact_uuid: &str) -> String {
        format!("{}/contact/read/{}/", self.url_base, contact_uuid)
    }

    fn ticket_address(&self, contact_display: &str, ticket_uuid: &Uuid) -> String {
        format!(
            "{} via {} <ticket+{}@{}>",
            contact_display, self.brand_name, ticket_uuid, self.domain
        )
    }

    fn open_body(&self, body: &str, contact_url: &str) -> String {
        format!(
            "New ticket opened\n------------------------------------------------\n\n{body}\n\n\
             ------------------------------------------------\n\
             * Reply to the contact by replying to this email\n\
             * Close this ticket by replying with CLOSE\n\
             * View this contact at {contact_url}\n"
        )
    }

    fn forward_body(&self, contact: &str, message: &str, contact_url: &str) -> String {
        format!(
            "{contact} replied:\n------------------------------------------------\n\n{message}\n\n\
             ------------------------------------------------\n\
             * Reply to the contact by replying to this email\n\
             * Close this ticket by replying with CLOSE\n\
             * View this contact at {contact_url}\n"
        )
    }

    fn closed_body(&self, contact_url: &str) -> String {
        format!(
            "* Ticket has been closed\n\
             * Replying to the contact will reopen this ticket\n\
             * View this contact at {contact_url}\n"
        )
    }

    fn reopened_body(&self, contact_url: &str) -> String {
        format!(
            "* Ticket has been reopened\n\
             * Close this ticket by replying with CLOSE\n\
             * View this contact at {contact_url}\n"
        )
    }

    /// Sends one email through the API, returning the provider message id.
    async fn send(
        &self,
        from: &str,
        subject: &str,
        text: &str,
        headers: HashMap<&str, String>,
        traces: &mut Vec<HttpTrace>,
    ) -> Result<String> {
        let mut form = vec![
            ("from".to_string(), from.to_string()),
            ("to".to_string(), self.to_address.clone()),
            ("subject".to_string(), subject.to_string()),
            ("text".to_string(), text.to_string()),
        ];
        for (header, value) in headers {
            form.push((format!("h:{header}"), value));
        }

        let request = self
            .http
            .post(format!("https://api.mailgun.net/v3/{}/messages", self.domain))
            .basic_auth("api", Some(&self.api_key))
            .form(&form);

        let (trace, outcome) = send_traced(request, self.retries, &self.redactor).await;
        if let Some(trace) = trace {
            traces.push(trace);
        }
        let body = outcome.map_err(|e| e.wrap("error calling mailgun API"))?;

        let parsed: serde_json::Value = serde_json::from_str(&body)
            .map_err(|_| FlowhubError::Service("malformed mailgun response".to_string()))?;
        Ok(parsed["id"].as_str().unwrap_or_default().to_string())
    }

    /// Sends a message within an existing ticket's email thread.
    async fn send_in_ticket(
        &self,
        ticket: &Ticket,
        text: &str,
        traces: &mut Vec<HttpTrace>,
    ) -> Result<String> {
        let contact_display = ticket.config_value(TICKET_CONFIG_CONTACT_DISPLAY).unwrap_or("");
        let last_message_id = ticket
            .config_value(TICKET_CONFIG_LAST_MESSAGE_ID)
            .or(ticket.external_id.as_deref())
            .unwrap_or("")
            .to_string();

        let mut headers = HashMap::new();
        headers.insert("In-Reply-To", last_message_id.clone());
        headers.insert("References", last_message_id);

        let from = self.ticket_address(contact_display, &ticket.uuid);
        self.send(&from, &ticket.subject, text, headers, traces).await
    }
}

#[async_trait]
impl TicketService for MailgunService {
    async fn open(
        &self,
        contact: &Contact,
        subject: &str,
        body: &str,
        traces: &mut Vec<HttpTrace>,
    ) -> Result<OpenedTicket> {
        let ticket_uuid = Uuid::new_v4();
        let contact_display = contact.name.clone().unwrap_or_else(|| format!("{}", contact.id));
        let contact_url = self.contact_url(&contact.uuid.to_string());

        let from = self.ticket_address(&contact_display, &ticket_uuid);
        let full_body = self.open_body(body, &contact_url);
        let msg_id = self.send(&from, subject, &full_body, HashMap::new(), traces).await?;

        let mut config = HashMap::new();
        config.insert(TICKET_CONFIG_CONTACT_UUID.to_string(), contact.uuid.to_string());
        config.insert(TICKET_CONFIG_CONTACT_DISPLAY.to_string(), contact_display);

        Ok(OpenedTicket { external_id: Some(msg_id), config })
    }

    async fn forward(
        &self,
        ticket: &Ticket,
        text: &str,
        traces: &mut Vec<HttpTrace>,
    ) -> Result<()> {
        let contact = ticket.config_value(TICKET_CONFIG_CONTACT_DISPLAY).unwrap_or("");
        let contact_url = self.contact_url(ticket.config_value(TICKET_CONFIG_CONTACT_UUID).unwrap_or(""));
        let body = self.forward_body(contact, text, &contact_url);
        self.send_in_ticket(ticket, &body, traces).await?;
        Ok(())
    }

    async fn close(&self, tickets: &[Ticket], traces: &mut Vec<HttpTrace>) -> Result<()> {
        for ticket in tickets {
            let contact_url =
                self.contact_url(ticket.config_value(TICKET_CONFIG_CONTACT_UUID).unwrap_or(""));
            let body = self.closed_body(&contact_url);
            self.send_in_ticket(ticket, &body, traces).await?;
        }
        Ok(())
    }

    async fn reopen(&self, tickets: &[Ticket], traces: &mut Vec<HttpTrace>) -> Result<()> {
        for ticket in tickets {
            let contact_url =
                self.contact_url(ticket.config_value(TICKET_CONFIG_CONTACT_UUID).unwrap_or(""));
            let body = self.reopened_body(&contact_url);
            self.send_in_ticket(ticket, &body, traces).await?;
        }
        Ok(())
    }
}

/// Minimal base64 for the basic-auth redaction secret; only the exact
/// header value matters.
mod base64_encode {
    const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    pub fn encode_basic_auth(user: &str, password: &str) -> String {
        let raw = format!("{user}:{password}");
        let bytes = raw.as_bytes();
        let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);

        for chunk in bytes.chunks(3) {
            let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
            out.push(TABLE[(b[0] >> 2) as usize] as char);
            out.push(TABLE[(((b[0] & 0x03) << 4) | (b[1] >> 4)) as usize] as char);
            out.push(if chunk.len() > 1 {
                TABLE[(((b[1] & 0x0f) << 2) | (b[2] >> 6)) as usize] as char
            } else {
                '='
            });
            out.push(if chunk.len() > 2 { TABLE[(b[2] & 0x3f) as usize] as char } else { '=' });
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn encodes_basic_auth() {
            assert_eq!(encode_basic_auth("api", "sesame"), "YXBpOnNlc2FtZQ==");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MailgunService {
        MailgunService {
            http: reqwest::Client::new(),
            retries: 0,
            domain: "tickets.example.com".to_string(),
            api_key: "sesame".to_string(),
            to_address: "support@example.com".to_string(),
            brand_name: "Example".to_string(),
            url_base: "https://app.example.com".to_string(),
            redactor: Redactor::new(vec!["sesame".to_string()]),
        }
    }

    #[test]
    fn ticket_address_embeds_uuid_and_brand() {
        let s = service();
        let uuid: Uuid = "59d74b86-3e2f-4a93-aece-b05d2fdcde0c".parse().unwrap();
        assert_eq!(
            s.ticket_address("Cathy", &uuid),
            "Cathy via Example <ticket+59d74b86-3e2f-4a93-aece-b05d2fdcde0c@tickets.example.com>"
        );
    }

    #[test]
    fn body_templates_include_instructions() {
        let s = service();
        let body = s.open_body("Where are my cookies?", "https://app.example.com/contact/read/x/");
        assert!(body.contains("New ticket opened"));
        assert!(body.contains("Where are my cookies?"));
        assert!(body.contains("replying with CLOSE"));

        let closed = s.closed_body("https://app.example.com/contact/read/x/");
        assert!(closed.contains("Ticket has been closed"));
    }

    #[test]
    fn redactor_covers_key_and_auth_header() {
        let redactor = Redactor::new(vec![
            "sesame".to_string(),
            base64_encode::encode_basic_auth("api", "sesame"),
        ]);
        let log = "Authorization: Basic YXBpOnNlc2FtZQ== key=sesame";
        let redacted = redactor.redact(log);
        assert!(!redacted.contains("sesame"));
        assert!(!redacted.contains("YXBpOnNlc2FtZQ=="));
    }
}
