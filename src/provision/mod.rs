//! Onboarding of new instances: create request, one-time install command,
//! and waiting for the agent to consume its token.

pub mod clipboard;
pub mod store;

use crate::api::{ApiError, PollStatus, SetupData, VmApi};
use crate::config::ProvisioningConfig;
use crate::metrics::Metrics;
use crate::schedule::{ScheduledTask, Tick, TriggerHandle};
use crate::state::now_unix_millis;
use clipboard::Clipboard;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use store::{PersistedSession, SessionStore};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const COPIED_INDICATOR: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Idle,
    Submitting,
    AwaitingAgent,
    Installed,
}

/// Operator-facing failures. `Display` is the text shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("VM name must not be empty")]
    Validation,
    #[error("A provisioning session is already in progress")]
    Busy,
    #[error("Provisioning was reset")]
    Cancelled,
    #[error("{0}")]
    Service(String),
    #[error("Server unreachable. Try again later.")]
    Unreachable,
    #[error("Installation token expired")]
    TokenExpired,
    #[error("Token no longer valid")]
    TokenInvalid,
}

impl From<ApiError> for ProvisionError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unreachable(_) => ProvisionError::Unreachable,
            other => ProvisionError::Service(
                other
                    .server_message()
                    .unwrap_or("Failed to create VM")
                    .to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningSnapshot {
    pub phase: Phase,
    pub vm_name: Option<String>,
    pub command: Option<String>,
    pub polling_link: Option<String>,
    pub error: Option<String>,
    pub copied: bool,
}

struct Inner {
    phase: Phase,
    vm_name: String,
    setup: Option<SetupData>,
    error: Option<ProvisionError>,
    // Bumped on every transition that invalidates in-flight work.
    generation: u64,
    copied_at: Option<Instant>,
    poller: Option<ScheduledTask>,
    dismiss: Option<JoinHandle<()>>,
}

impl Inner {
    fn to_idle(&mut self) {
        self.phase = Phase::Idle;
        self.vm_name.clear();
        self.setup = None;
        self.copied_at = None;
        self.generation += 1;
    }
}

pub struct ProvisioningManager {
    api: Arc<dyn VmApi>,
    store: SessionStore,
    clipboard: Clipboard,
    fleet: TriggerHandle,
    metrics: Arc<Metrics>,
    poll_interval: Duration,
    session_ttl: Duration,
    success_display: Duration,
    inner: Mutex<Inner>,
}

impl ProvisioningManager {
    pub fn new(
        api: Arc<dyn VmApi>,
        store: SessionStore,
        clipboard: Clipboard,
        fleet: TriggerHandle,
        metrics: Arc<Metrics>,
        cfg: &ProvisioningConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            store,
            clipboard,
            fleet,
            metrics,
            poll_interval: cfg.poll_interval(),
            session_ttl: cfg.session_ttl(),
            success_display: cfg.success_display(),
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                vm_name: String::new(),
                setup: None,
                error: None,
                generation: 0,
                copied_at: None,
                poller: None,
                dismiss: None,
            }),
        })
    }

    /// Reads the durable record once. An expired record is dropped without
    /// contacting the registry.
    pub async fn resume(self: &Arc<Self>) -> Phase {
        self.resume_at(now_unix_millis()).await
    }

    pub async fn resume_at(self: &Arc<Self>, now_unix_millis: i64) -> Phase {
        let persisted = match self.store.load() {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(error = %err, "не удалось прочитать сохранённую сессию");
                None
            }
        };
        let Some(session) = persisted else {
            return self.inner.lock().await.phase;
        };

        if session.is_expired(now_unix_millis, self.session_ttl) {
            info!(vm_name = %session.vm_name, "сохранённая сессия устарела, удаляем");
            self.clear_store();
            return self.inner.lock().await.phase;
        }

        let mut inner = self.inner.lock().await;
        if inner.phase != Phase::Idle {
            return inner.phase;
        }
        inner.generation += 1;
        inner.phase = Phase::AwaitingAgent;
        inner.vm_name = session.vm_name;
        inner.setup = Some(session.setup_data);
        inner.error = None;
        inner.poller = Some(self.start_poller());
        info!(vm_name = %inner.vm_name, "сессия подключения возобновлена");
        inner.phase
    }

    pub async fn submit(self: &Arc<Self>, vm_name: &str) -> Result<SetupData, ProvisionError> {
        let vm_name = vm_name.trim();
        if vm_name.is_empty() {
            return Err(ProvisionError::Validation);
        }

        let generation = {
            let mut inner = self.inner.lock().await;
            if inner.phase != Phase::Idle {
                return Err(ProvisionError::Busy);
            }
            inner.generation += 1;
            inner.phase = Phase::Submitting;
            inner.vm_name = vm_name.to_string();
            inner.error = None;
            inner.generation
        };

        let result = self.api.create_vm(vm_name).await;

        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return Err(ProvisionError::Cancelled);
        }

        let setup = match result {
            Ok(setup) => setup,
            Err(err) => {
                warn!(vm_name, error = %err, "запрос на создание VM не удался");
                self.metrics.inc_submission("error");
                let err = ProvisionError::from(err);
                inner.to_idle();
                inner.error = Some(err.clone());
                return Err(err);
            }
        };
        self.metrics.inc_submission("ok");

        let record = PersistedSession {
            vm_name: vm_name.to_string(),
            setup_data: setup.clone(),
            timestamp: now_unix_millis(),
        };
        if let Err(err) = self.store.save(&record) {
            error!(error = %err, "не удалось сохранить сессию подключения");
        }

        inner.phase = Phase::AwaitingAgent;
        inner.setup = Some(setup.clone());
        inner.poller = Some(self.start_poller());
        info!(vm_name, "VM зарегистрирована, ожидаем агента");
        Ok(setup)
    }

    /// One status check. Returns the decoded status when it was applied.
    pub async fn poll(self: &Arc<Self>) -> Option<PollStatus> {
        let (generation, link) = {
            let inner = self.inner.lock().await;
            if inner.phase != Phase::AwaitingAgent {
                return None;
            }
            (inner.generation, inner.setup.as_ref()?.polling_link.clone())
        };

        let status = match self.api.poll_token(&link).await {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, "ошибка опроса статуса токена");
                self.metrics.inc_poll("error");
                return None;
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.phase != Phase::AwaitingAgent {
            return None;
        }
        self.metrics.inc_poll(status.as_str());

        match status {
            PollStatus::Pending => {
                debug!(vm_name = %inner.vm_name, "агент ещё не подключился");
            }
            PollStatus::Installed => {
                inner.phase = Phase::Installed;
                self.clear_store();
                if !self.fleet.fire(Tick::Notified) {
                    debug!("цикл обновления списка VM уже остановлен");
                }
                if let Some(poller) = inner.poller.take() {
                    poller.cancel();
                }
                inner.dismiss = Some(self.schedule_dismiss(generation));
                info!(vm_name = %inner.vm_name, "агент установлен");
            }
            PollStatus::Expired | PollStatus::Invalid => {
                let err = if status == PollStatus::Expired {
                    ProvisionError::TokenExpired
                } else {
                    ProvisionError::TokenInvalid
                };
                warn!(vm_name = %inner.vm_name, reason = %err, "сессия подключения завершена");
                self.clear_store();
                if let Some(poller) = inner.poller.take() {
                    poller.cancel();
                }
                inner.to_idle();
                inner.error = Some(err);
            }
        }
        Some(status)
    }

    /// Puts the install command on the clipboard. Failures are only logged.
    pub async fn copy_command(&self) -> bool {
        let command = {
            let inner = self.inner.lock().await;
            match &inner.setup {
                Some(setup) => setup.command.clone(),
                None => return false,
            }
        };

        match self.clipboard.copy(&command).await {
            Ok(method) => {
                debug!(?method, "команда скопирована");
                self.inner.lock().await.copied_at = Some(Instant::now());
                true
            }
            Err(err) => {
                warn!(error = %err, "не удалось скопировать команду");
                false
            }
        }
    }

    pub async fn reset(&self) {
        let (poller, dismiss) = {
            let mut inner = self.inner.lock().await;
            inner.to_idle();
            inner.error = None;
            (inner.poller.take(), inner.dismiss.take())
        };
        self.clear_store();
        if let Some(dismiss) = dismiss {
            dismiss.abort();
        }
        if let Some(poller) = poller {
            poller.stop().await;
        }
        info!("сессия подключения сброшена");
    }

    /// Stops timers on process exit. The durable record is left in place.
    pub async fn shutdown(&self) {
        let (poller, dismiss) = {
            let mut inner = self.inner.lock().await;
            (inner.poller.take(), inner.dismiss.take())
        };
        if let Some(dismiss) = dismiss {
            dismiss.abort();
        }
        if let Some(poller) = poller {
            poller.stop().await;
        }
    }

    pub async fn snapshot(&self) -> ProvisioningSnapshot {
        let inner = self.inner.lock().await;
        ProvisioningSnapshot {
            phase: inner.phase,
            vm_name: Some(inner.vm_name.clone()).filter(|n| !n.is_empty()),
            command: inner.setup.as_ref().map(|s| s.command.clone()),
            polling_link: inner.setup.as_ref().map(|s| s.polling_link.clone()),
            error: inner.error.as_ref().map(|e| e.to_string()),
            copied: inner
                .copied_at
                .is_some_and(|at| at.elapsed() < COPIED_INDICATOR),
        }
    }

    fn start_poller(self: &Arc<Self>) -> ScheduledTask {
        let weak: Weak<Self> = Arc::downgrade(self);
        ScheduledTask::start("provision-poll", self.poll_interval, move |_tick| {
            let weak = weak.clone();
            async move {
                if let Some(manager) = weak.upgrade() {
                    manager.poll().await;
                }
            }
        })
    }

    fn schedule_dismiss(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let delay = self.success_display;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = weak.upgrade() {
                manager.finish_installed(generation).await;
            }
        })
    }

    async fn finish_installed(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation == generation && inner.phase == Phase::Installed {
            inner.to_idle();
            inner.error = None;
            inner.dismiss = None;
        }
    }

    fn clear_store(&self) {
        if let Err(err) = self.store.clear() {
            error!(error = %err, "не удалось удалить сохранённую сессию");
        }
    }
}
