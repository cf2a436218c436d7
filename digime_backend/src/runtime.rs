use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use flume::Sender;
use tokio::sync::watch;

use crate::config::AppConfig;
use crate::database::ConversationStore;
use crate::llm_client::build_responder;
use crate::orchestrator::{BotEvent, LoopSettings, Orchestrator};
use crate::server::{serve_dashboard, Dashboard};
use crate::style::StyleProfile;
use crate::transport::BridgeTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Bot,
    Dashboard,
    Both,
}

impl RunMode {
    fn runs_bot(self) -> bool {
        matches!(self, RunMode::Bot | RunMode::Both)
    }

    fn serves_dashboard(self) -> bool {
        matches!(self, RunMode::Dashboard | RunMode::Both)
    }
}

/// Shared pieces every mode starts from.
pub struct BotRuntime {
    pub config: AppConfig,
    pub store: Arc<ConversationStore>,
    pub style: Arc<StyleProfile>,
}

impl BotRuntime {
    pub fn bootstrap(config: AppConfig) -> Result<Self> {
        let store = ConversationStore::open(&config.database_path, config.encryption_key.as_deref())
            .with_context(|| format!("Failed to open conversation store {}", config.database_path))?;
        let style = StyleProfile::load(&config.chat_style_path)?;

        Ok(Self {
            config,
            store: Arc::new(store),
            style: Arc::new(style),
        })
    }

    /// Wire the loop to the bridge transport and the configured model, and
    /// register the configured contacts.
    pub fn build_orchestrator(&self, event_tx: Option<Sender<BotEvent>>) -> Result<Orchestrator> {
        let timeout = self.config.request_timeout();
        let transport = Arc::new(
            BridgeTransport::new(self.config.transport_bridge_url.clone(), timeout)
                .context("Failed to build transport HTTP client")?,
        );
        let responder = build_responder(&self.config, self.style.clone())?;

        let mut orchestrator = Orchestrator::new(
            self.store.clone(),
            transport,
            responder,
            LoopSettings::from_config(&self.config),
        );
        if let Some(event_tx) = event_tx {
            orchestrator = orchestrator.with_events(event_tx);
        }

        let added = orchestrator
            .sync_approved_contacts(&self.config.approved_contacts)
            .context("Failed to register approved contacts")?;
        tracing::info!(
            "Approved contacts: {} configured, {} newly registered",
            self.config.approved_contacts.len(),
            added
        );
        Ok(orchestrator)
    }
}

/// Configuration problems that stop `mode` from starting.
pub fn startup_problems(config: &AppConfig, mode: RunMode) -> Vec<String> {
    let mut problems = if mode.runs_bot() {
        config.validate()
    } else {
        config.validate_storage()
    };
    if mode.serves_dashboard() {
        problems.extend(config.validate_dashboard());
    }
    problems
}

pub async fn run(
    config: AppConfig,
    mode: RunMode,
    bind_addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let problems = startup_problems(&config, mode);
    if !problems.is_empty() {
        for problem in &problems {
            tracing::error!("Configuration error: {}", problem);
        }
        bail!("{} configuration error(s); see log", problems.len());
    }

    let runtime = BotRuntime::bootstrap(config)?;

    match mode {
        RunMode::Bot => {
            let orchestrator = runtime.build_orchestrator(None)?;
            orchestrator.run(shutdown).await;
            Ok(())
        }
        RunMode::Dashboard => {
            let dashboard = Dashboard {
                store: runtime.store.clone(),
                style: runtime.style.clone(),
                config: runtime.config.clone(),
                manual: None,
                events: None,
            };
            serve_dashboard(dashboard, bind_addr, shutdown).await
        }
        RunMode::Both => {
            let (event_tx, event_rx) = flume::unbounded();
            let orchestrator = runtime.build_orchestrator(Some(event_tx))?;
            let dashboard = Dashboard {
                store: runtime.store.clone(),
                style: runtime.style.clone(),
                config: runtime.config.clone(),
                manual: Some(orchestrator.manual_sender()),
                events: Some(event_rx),
            };

            let bot = tokio::spawn(orchestrator.run(shutdown.clone()));
            let served = serve_dashboard(dashboard, bind_addr, shutdown).await;
            if served.is_err() {
                bot.abort();
            }
            match bot.await {
                Err(e) if !e.is_cancelled() => {
                    tracing::error!("Conversation loop task failed: {}", e);
                }
                _ => {}
            }
            served
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DashboardAuthMode;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> AppConfig {
        AppConfig {
            openai_api_key: Some("sk-test".to_string()),
            approved_contacts: vec!["+1555".to_string(), "+1666".to_string()],
            encryption_key: Some("secret".to_string()),
            database_path: dir.path().join("data/chat.db").to_string_lossy().into_owned(),
            chat_style_path: dir.path().join("style/my_style.json").to_string_lossy().into_owned(),
            dashboard_password: Some("pw".to_string()),
            ..AppConfig::default()
        }
    }

    #[test]
    fn bootstrap_creates_store_and_default_style() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let runtime = BotRuntime::bootstrap(config).unwrap();

        assert!(dir.path().join("style/my_style.json").exists());
        assert_eq!(runtime.style.max_reply_length().unwrap(), 500);
    }

    #[test]
    fn bootstrap_refuses_missing_secret() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig {
            encryption_key: None,
            ..config_in(&dir)
        };
        assert!(BotRuntime::bootstrap(config).is_err());
    }

    #[tokio::test]
    async fn build_orchestrator_registers_configured_contacts() {
        let dir = TempDir::new().unwrap();
        let runtime = BotRuntime::bootstrap(config_in(&dir)).unwrap();

        runtime.build_orchestrator(None).unwrap();

        let phones: Vec<String> = runtime
            .store
            .list_contacts()
            .unwrap()
            .into_iter()
            .map(|c| c.phone_number)
            .collect();
        assert_eq!(phones, vec!["+1555", "+1666"]);
    }

    #[test]
    fn startup_problems_depend_on_mode() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.openai_api_key = None;
        config.dashboard_password = None;

        let bot = startup_problems(&config, RunMode::Bot);
        assert_eq!(bot.len(), 1);
        assert!(bot[0].contains("OPENAI_API_KEY"));

        let dashboard = startup_problems(&config, RunMode::Dashboard);
        assert_eq!(dashboard.len(), 1);
        assert!(dashboard[0].contains("DASHBOARD_PASSWORD"));

        assert_eq!(startup_problems(&config, RunMode::Both).len(), 2);

        config.dashboard_auth_mode = DashboardAuthMode::Disabled;
        assert!(startup_problems(&config, RunMode::Dashboard).is_empty());
    }

    #[test]
    fn missing_secret_is_reported_once_in_both_mode() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig {
            encryption_key: None,
            ..config_in(&dir)
        };
        let problems = startup_problems(&config, RunMode::Both);
        assert_eq!(
            problems.iter().filter(|p| p.starts_with("ENCRYPTION_KEY")).count(),
            1
        );
    }
}
