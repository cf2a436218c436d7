//! Message transport: the capability the conversation loop uses to read and
//! write chats.
//!
//! `BridgeTransport` talks to a WhatsApp Web bridge sidecar over HTTP. The
//! sidecar owns the browser session; this side only asks it for chat contents
//! and hands it outgoing text.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportFault;
use crate::http_client::build_http_client;

/// An inbound message as the transport saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub text: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[async_trait]
pub trait TransportPort: Send + Sync {
    /// Prepare the transport; called once before the loop starts.
    async fn connect(&self) -> Result<(), TransportFault> {
        Ok(())
    }

    async fn disconnect(&self) {}

    /// Whether the contact exists on the transport.
    async fn search(&self, contact: &str) -> Result<bool, TransportFault>;

    /// Inbound messages after the first `since` ones, in arrival order.
    async fn fetch_new(
        &self,
        contact: &str,
        since: usize,
    ) -> Result<Vec<InboundMessage>, TransportFault>;

    /// Send `text`; `Ok` means the transport confirmed delivery to the chat.
    async fn send(&self, contact: &str, text: &str) -> Result<(), TransportFault>;
}

#[derive(Serialize)]
struct OutgoingMessage<'a> {
    text: &'a str,
}

#[derive(Clone)]
pub struct BridgeTransport {
    base_url: String,
    client: reqwest::Client,
}

impl BridgeTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_http_client(timeout)?,
        })
    }

    fn chat_url(&self, contact: &str) -> String {
        format!(
            "{}/chats/{}/messages",
            self.base_url,
            urlencoding::encode(contact)
        )
    }

    fn contact_url(&self, contact: &str) -> String {
        format!("{}/contacts/{}", self.base_url, urlencoding::encode(contact))
    }

    async fn inbound_messages(&self, contact: &str) -> Result<Vec<InboundMessage>, TransportFault> {
        let response = self
            .client
            .get(self.chat_url(contact))
            .query(&[("direction", "inbound")])
            .send()
            .await
            .map_err(request_fault)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TransportFault::ContactNotFound(contact.to_string()));
        }
        if !response.status().is_success() {
            return Err(TransportFault::Request(format!(
                "listing messages for {} returned HTTP {}",
                contact,
                response.status()
            )));
        }

        response
            .json::<Vec<InboundMessage>>()
            .await
            .map_err(|e| TransportFault::Request(format!("invalid message list: {}", e)))
    }
}

#[async_trait]
impl TransportPort for BridgeTransport {
    async fn connect(&self) -> Result<(), TransportFault> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await.map_err(request_fault)?;
        if !response.status().is_success() {
            return Err(TransportFault::Disconnected(format!(
                "bridge health check returned HTTP {}",
                response.status()
            )));
        }
        tracing::info!("Connected to transport bridge at {}", self.base_url);
        Ok(())
    }

    async fn search(&self, contact: &str) -> Result<bool, TransportFault> {
        let response = self
            .client
            .get(self.contact_url(contact)).send().await.map_err(request_fault)?;
        match response.status() {
            status if status.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(TransportFault::Request(format!(
                "contact search for {} returned HTTP {}",
                contact, status
            ))),
        }
    }

    async fn fetch_new(
        &self,
        contact: &str,
        since: usize,
    ) -> Result<Vec<InboundMessage>, TransportFault> {
        if !self.search(contact).await? {
            return Err(TransportFault::ContactNotFound(contact.to_string()));
        }
        let messages = self.inbound_messages(contact).await?;
        Ok(messages_after(messages, since))
    }

    async fn send(&self, contact: &str, text: &str) -> Result<(), TransportFault> {
        if !self.search(contact).await? {
            return Err(TransportFault::ContactNotFound(contact.to_string()));
        }

        let response = self
            .client
            .post(self.chat_url(contact))
            .json(&OutgoingMessage { text })
            .send()
            .await
            .map_err(request_fault)?;

        if response.status().is_success() {
            tracing::debug!("Bridge accepted message for {}", contact);
            Ok(())
        } else {
            Err(TransportFault::SendFailed {
                contact: contact.to_string(),
                reason: format!("HTTP {}", response.status()),
            })
        }
    }
}

/// Entries past the cursor. A list shorter than the cursor (chat cleared,
/// history not loaded) yields nothing rather than replaying old messages.
fn messages_after(messages: Vec<InboundMessage>, since: usize) -> Vec<InboundMessage> {
    if messages.len() <= since {
        return Vec::new();
    }
    messages.into_iter().skip(since).collect()
}

fn request_fault(error: reqwest::Error) -> TransportFault {
    if error.is_connect() {
        TransportFault::Disconnected(error.to_string())
    } else {
        TransportFault::Request(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::tests::silent_server;

    fn bridge(base_url: &str) -> BridgeTransport {
        BridgeTransport::new(base_url, Duration::from_secs(5)).unwrap()
    }

    fn inbound(texts: &[&str]) -> Vec<InboundMessage> {
        texts
            .iter()
            .map(|text| InboundMessage {
                text: text.to_string(),
                timestamp: None,
            })
            .collect()
    }

    #[test]
    fn messages_after_returns_only_the_delta() {
        let all = inbound(&["a", "b", "c"]);
        assert_eq!(messages_after(all.clone(), 0), all);
        assert_eq!(messages_after(all.clone(), 2), inbound(&["c"]));
        assert!(messages_after(all.clone(), 3).is_empty());
        assert!(messages_after(all, 7).is_empty());
    }

    #[test]
    fn contact_handles_are_path_encoded() {
        let transport = bridge("http://bridge");
        assert_eq!(
            transport.chat_url("+1 555/01"),
            "http://bridge/chats/%2B1%20555%2F01/messages"
        );
        assert_eq!(transport.contact_url("alice_b-2"), "http://bridge/contacts/alice_b-2");
        assert_eq!(transport.contact_url("émile"), "http://bridge/contacts/%C3%A9mile");
    }

    #[test]
    fn inbound_message_timestamp_is_optional() {
        let parsed: Vec<InboundMessage> =
            serde_json::from_str(r#"[{"text":"hi","timestamp":"10:41"},{"text":"yo"}]"#)
                .expect("parse");
        assert_eq!(parsed[0].timestamp.as_deref(), Some("10:41"));
        assert_eq!(parsed[1].timestamp, None);
    }

    #[test]
    fn bridge_trims_trailing_slash() {
        let transport = bridge("http://127.0.0.1:3000/");
        assert_eq!(
            transport.chat_url("+1555"),
            "http://127.0.0.1:3000/chats/%2B1555/messages"
        );
    }

    #[tokio::test]
    async fn stalled_bridge_fails_the_request_instead_of_hanging() {
        let base = silent_server().await;
        let transport = BridgeTransport::new(base, Duration::from_millis(200)).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), transport.search("+1555"))
            .await
            .expect("request timeout should fire first");

        assert!(matches!(result, Err(TransportFault::Request(_))));
    }
}
