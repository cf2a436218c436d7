//! The polling loop: per contact, pull new inbound messages, record them,
//! generate one reply in the owner's style, send it, and record the reply.

use flume::Sender;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::config::AppConfig;
use crate::database::{ChatMessage, ConversationStore, Direction, Origin};
use crate::error::{CycleFault, StorageFault, TickFault, TransportFault};
use crate::llm_client::{ContextTurn, ResponsePort};
use crate::transport::TransportPort;

/// Loop knobs, lifted out of `AppConfig` so the orchestrator never reads the
/// environment itself.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub auto_reply_enabled: bool,
    pub check_interval: Duration,
    pub error_cooldown: Duration,
    pub context_window: usize,
    pub persist_poll_cursors: bool,
}

impl LoopSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            auto_reply_enabled: config.auto_reply_enabled,
            check_interval: Duration::from_secs(config.check_interval_seconds),
            error_cooldown: Duration::from_secs(config.error_cooldown_seconds),
            context_window: config.context_window.max(1),
            persist_poll_cursors: config.persist_poll_cursors,
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Debug, Clone)]
pub enum BotEvent {
    MessageRecorded {
        contact: String,
        message_id: i64,
        direction: Direction,
        origin: Origin,
    },
    ReplySent {
        contact: String,
        message_id: i64,
    },
    ReplyDiscarded {
        contact: String,
        reason: String,
    },
    ContactFailed {
        contact: String,
        error: String,
    },
    TickFailed {
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Disabled,
    Sent,
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactOutcome {
    /// Nothing new; nothing written.
    Idle,
    Recorded { messages: usize, reply: ReplyOutcome },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub contacts: usize,
    pub recorded: usize,
    pub replies_sent: usize,
    pub failed: usize,
}

pub struct Orchestrator {
    store: Arc<ConversationStore>,
    transport: Arc<dyn TransportPort>,
    responder: Arc<dyn ResponsePort>,
    settings: LoopSettings,
    cursors: HashMap<String, usize>,
    event_tx: Option<Sender<BotEvent>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<ConversationStore>,
        transport: Arc<dyn TransportPort>,
        responder: Arc<dyn ResponsePort>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            store,
            transport,
            responder,
            settings,
            cursors: HashMap::new(),
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: Sender<BotEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Dashboard-side handle for the manual send path.
    pub fn manual_sender(&self) -> ManualSender {
        ManualSender {
            transport: self.transport.clone(),
            store: self.store.clone(),
            event_tx: self.event_tx.clone(),
        }
    }

    fn emit(&self, event: BotEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Register every configured contact the store does not know yet.
    pub fn sync_approved_contacts(&self, contacts: &[String]) -> Result<usize, StorageFault> {
        let mut added = 0;
        for phone in contacts.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
            if !self.store.is_registered(phone)? {
                self.store.register_contact(phone, None)?;
                tracing::info!("Registered approved contact {}", phone);
                added += 1;
            }
        }
        Ok(added)
    }

    fn cursor_for(&mut self, contact: &str) -> Result<usize, StorageFault> {
        if let Some(position) = self.cursors.get(contact) {
            return Ok(*position);
        }
        let position = if self.settings.persist_poll_cursors {
            self.store.load_cursor(contact)?.unwrap_or(0)
        } else {
            0
        };
        self.cursors.insert(contact.to_string(), position);
        Ok(position)
    }

    /// Move past one message whose append has been confirmed.
    fn advance_cursor(&mut self, contact: &str) -> Result<(), StorageFault> {
        let position = self.cursors.entry(contact.to_string()).or_insert(0);
        *position += 1;
        let position = *position;
        if self.settings.persist_poll_cursors {
            self.store.save_cursor(contact, position)?;
        }
        Ok(())
    }

    /// One contact's cycle. Recording always happens before generation, so a
    /// failed or discarded reply never loses an inbound message.
    pub async fn process_contact(
        &mut self,
        contact: &str,
        label: Option<&str>,
    ) -> Result<ContactOutcome, CycleFault> {
        let since = self.cursor_for(contact)?;
        let inbound = self.transport.fetch_new(contact, since).await?;
        let Some(last) = inbound.last() else {
            return Ok(ContactOutcome::Idle);
        };

        let sender_label = label.unwrap_or(contact);
        for message in &inbound {
            let message_id = self.store.append(
                contact,
                &message.text,
                Direction::FromContact,
                Origin::Human,
                Some(sender_label),
            )?;
            self.advance_cursor(contact)?;
            self.emit(BotEvent::MessageRecorded {
                contact: contact.to_string(),
                message_id,
                direction: Direction::FromContact,
                origin: Origin::Human,
            });
        }
        tracing::info!("Recorded {} new message(s) from {}", inbound.len(), contact);

        let reply = if self.settings.auto_reply_enabled {
            self.reply_to(contact, &last.text, sender_label).await?
        } else {
            ReplyOutcome::Disabled
        };

        Ok(ContactOutcome::Recorded {
            messages: inbound.len(),
            reply,
        })
    }

    async fn reply_to(
        &self,
        contact: &str,
        message: &str,
        sender_label: &str,
    ) -> Result<ReplyOutcome, CycleFault> {
        let history = self.store.recent(contact, self.settings.context_window)?;
        let context = context_turns(&history);

        let reply = match self
            .responder
            .generate(message, &context, Some(sender_label))
            .await
        {
            Ok(reply) if !reply.trim().is_empty() => reply,
            Ok(_) => {
                tracing::warn!("Empty reply generated for {}; nothing sent", contact);
                return Ok(self.discard(contact, "empty reply".to_string()));
            }
            Err(e) => {
                tracing::warn!("Reply generation failed for {}: {}", contact, e);
                return Ok(self.discard(contact, e.to_string()));
            }
        };

        match self.transport.send(contact, &reply).await {
            Ok(()) => {
                let message_id = self.store.append(
                    contact,
                    &reply,
                    Direction::FromOwner,
                    Origin::AiGenerated,
                    None,
                )?;
                tracing::info!("Sent reply to {}", contact);
                self.emit(BotEvent::ReplySent {
                    contact: contact.to_string(),
                    message_id,
                });
                Ok(ReplyOutcome::Sent)
            }
            Err(e @ TransportFault::Disconnected(_)) => Err(e.into()),
            Err(e) => {
                tracing::warn!("Failed to send reply to {}: {}", contact, e);
                Ok(self.discard(contact, e.to_string()))
            }
        }
    }

    fn discard(&self, contact: &str, reason: String) -> ReplyOutcome {
        self.emit(BotEvent::ReplyDiscarded {
            contact: contact.to_string(),
            reason,
        });
        ReplyOutcome::Discarded
    }

    /// Visit every approved contact once, in registration order.
    pub async fn run_tick(
        &mut self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<TickSummary, TickFault> {
        let contacts = self.store.list_contacts().map_err(TickFault::Contacts)?;
        let mut summary = TickSummary::default();

        for contact in contacts {
            if *shutdown.borrow() {
                break;
            }
            summary.contacts += 1;

            let phone = contact.phone_number.as_str();
            match self.process_contact(phone, contact.name.as_deref()).await {
                Ok(ContactOutcome::Idle) => {}
                Ok(ContactOutcome::Recorded { messages, reply }) => {
                    summary.recorded += messages;
                    if reply == ReplyOutcome::Sent {
                        summary.replies_sent += 1;
                    }
                }
                Err(fault) if fault.escapes_contact() => {
                    return Err(TickFault::Contact {
                        contact: phone.to_string(),
                        source: fault,
                    });
                }
                Err(fault) => {
                    tracing::error!("Error processing {}: {}", phone, fault);
                    self.emit(BotEvent::ContactFailed {
                        contact: phone.to_string(),
                        error: fault.to_string(),
                    });
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Tick until `shutdown` flips to `true` (or its sender goes away).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Conversation loop starting (interval {:?}, auto-reply {})",
            self.settings.check_interval,
            self.settings.auto_reply_enabled
        );

        if let Err(e) = self.transport.connect().await {
            tracing::error!("Transport not ready at startup: {}", e);
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_tick(&shutdown).await {
                Ok(summary) => {
                    if summary.recorded > 0 || summary.failed > 0 {
                        tracing::debug!("Tick finished: {:?}", summary);
                    }
                    self.settings.check_interval
                }
                Err(e) => {
                    tracing::error!("Error in main loop: {}", e);
                    self.emit(BotEvent::TickFailed {
                        error: e.to_string(),
                    });
                    self.settings.error_cooldown
                }
            };

            tokio::select! {
                _ = sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.transport.disconnect().await;
        tracing::info!("Conversation loop stopped");
    }
}

/// Readable history as model context; unreadable messages are skipped.
fn context_turns(history: &[ChatMessage]) -> Vec<ContextTurn> {
    history
        .iter()
        .filter_map(|message| {
            message.text().map(|text| ContextTurn {
                text: text.to_string(),
                is_owner: message.is_owner(),
            })
        })
        .collect()
}

/// Sends a message typed by the owner and records it as human-authored.
#[derive(Clone)]
pub struct ManualSender {
    transport: Arc<dyn TransportPort>,
    store: Arc<ConversationStore>,
    event_tx: Option<Sender<BotEvent>>,
}

impl ManualSender {
    /// `true` only if the message was both delivered and recorded.
    pub async fn send(&self, contact: &str, text: &str) -> bool {
        let text = text.trim();
        if contact.trim().is_empty() || text.is_empty() {
            return false;
        }

        if let Err(e) = self.transport.send(contact, text).await {
            tracing::warn!("Manual send to {} failed: {}", contact, e);
            return false;
        }

        match self
            .store
            .append(contact, text, Direction::FromOwner, Origin::Human, None)
        {
            Ok(message_id) => {
                if let Some(tx) = &self.event_tx {
                    let _ = tx.send(BotEvent::MessageRecorded {
                        contact: contact.to_string(),
                        message_id,
                        direction: Direction::FromOwner,
                        origin: Origin::Human,
                    });
                }
                true
            }
            Err(e) => {
                tracing::error!("Manual message to {} was sent but not recorded: {}", contact, e);
                false
            }
        }
    }
}
