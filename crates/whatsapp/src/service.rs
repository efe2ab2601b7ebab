//! Outward surface tying the supervisor, dispatcher and broadcast engine
//! together.

use std::sync::Arc;

use tokio::sync::mpsc;

use {
    wazper_common::{AccountId, Error, Result},
    wazper_config::WazperConfig,
};

use crate::{
    broadcast::{
        BroadcastControl, BroadcastEngine, BroadcastOutcome, BroadcastRequest, RecipientResult,
    },
    credentials::FileCredentialStore,
    media::MediaSource,
    outbound::{Outbound, WhatsAppOutbound},
    pairing::QrPairingRenderer,
    sidecar::SidecarTransport,
    store::AccountStore,
    supervisor::{AccountStatusView, Supervisor},
    transport::Receipt,
};

pub struct WhatsAppService {
    supervisor: Supervisor,
    store: Arc<dyn AccountStore>,
    outbound: Arc<dyn Outbound>,
    broadcasts: BroadcastEngine,
}

impl WhatsAppService {
    /// Build the service around an existing supervisor. The dispatcher shares
    /// the supervisor's session registry.
    pub fn new(supervisor: Supervisor, store: Arc<dyn AccountStore>) -> Self {
        let outbound: Arc<dyn Outbound> = Arc::new(WhatsAppOutbound::new(
            supervisor.registry().clone(),
            Arc::clone(&store),
        ));
        Self {
            broadcasts: BroadcastEngine::new(Arc::clone(&outbound)),
            supervisor,
            store,
            outbound,
        }
    }

    /// Production wiring: file credentials under the sessions directory, the
    /// sidecar transport and QR pairing images.
    pub fn from_config(config: &WazperConfig, store: Arc<dyn AccountStore>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(format!("{e:#}")))?;
        let supervisor = Supervisor::builder(
            Arc::clone(&store),
            Arc::new(FileCredentialStore::new(&config.storage.sessions_dir)),
            Arc::new(SidecarTransport::from_config(&config.sidecar)),
        )
        .with_renderer(Arc::new(QrPairingRenderer::default()))
        .with_config(config.supervisor.clone())
        .build();

        let mut service = Self::new(supervisor, store);
        service.broadcasts = BroadcastEngine::new(Arc::clone(&service.outbound))
            .with_poll_interval(config.broadcast.pause_poll_interval());
        Ok(service)
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub async fn connect(&self, account_id: AccountId) -> Result<()> {
        self.supervisor.connect(account_id).await
    }

    pub async fn disconnect(&self, account_id: AccountId) -> Result<()> {
        self.supervisor.disconnect(account_id).await
    }

    pub async fn force_reconnect(&self, account_id: AccountId) -> Result<()> {
        self.supervisor.force_reconnect(account_id).await
    }

    pub async fn remove_account(&self, account_id: AccountId) -> Result<()> {
        self.supervisor.remove_account(account_id).await
    }

    pub async fn get_status(&self, account_id: AccountId) -> Result<AccountStatusView> {
        self.supervisor.status(account_id).await
    }

    pub async fn send_text(&self, account_id: AccountId, to: &str, text: &str) -> Result<Receipt> {
        self.outbound.send_text(account_id, to, text).await
    }

    pub async fn send_media(
        &self,
        account_id: AccountId,
        to: &str,
        media: &MediaSource,
        caption: Option<&str>,
    ) -> Result<Receipt> {
        self.outbound
            .send_media(account_id, to, media, caption)
            .await
    }

    /// Run a broadcast for a known account. Recipients that cannot be reached
    /// are recorded in the outcome rather than failing the call.
    pub async fn run_broadcast(
        &self,
        request: BroadcastRequest,
        control: &BroadcastControl,
        progress: Option<&mpsc::UnboundedSender<RecipientResult>>,
    ) -> Result<BroadcastOutcome> {
        self.store.get(request.account_id).await?;
        self.broadcasts.run(request, control, progress).await
    }

    pub async fn initialize(&self) -> Result<usize> {
        self.supervisor.initialize().await
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}
