//! WebSocket transport backed by the protocol sidecar.
//!
//! One socket carries every account. Inbound frames are routed to the event
//! stream of the session that currently owns the account; send results are
//! matched back to their request through a pending-request table.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::Utc,
    dashmap::DashMap,
    futures::{SinkExt, StreamExt},
    tokio::sync::{Mutex, RwLock, mpsc, oneshot},
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tracing::{debug, error, info, instrument, warn},
    uuid::Uuid,
};

use {
    wazper_common::{AccountId, Error, Result},
    wazper_config::SidecarConfig,
};

use crate::{
    credentials::CredentialState,
    transport::{
        CloseInfo, CloseReason, EventStream, LifecycleEvent, OpenedSession, OutboundPayload,
        Receipt, Transport, TransportEvent, TransportSession, USER_ADDRESS_SUFFIX, UserInfo,
    },
    types::{GatewayMessage, SidecarMessage, WirePayload},
};

const RETRY_PAUSE: Duration = Duration::from_secs(2);

/// Handle for communicating with the sidecar.
#[derive(Clone)]
pub struct SidecarHandle {
    tx: mpsc::Sender<GatewayMessage>,
    connected: Arc<RwLock<bool>>,
}

impl SidecarHandle {
    pub async fn send(&self, msg: GatewayMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| Error::transport("sidecar writer has stopped"))
    }

    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }
}

/// Callback for handling messages from the sidecar.
pub type MessageCallback = Arc<dyn Fn(SidecarMessage) + Send + Sync>;

/// Connect to the sidecar and spawn reader/writer tasks. The returned
/// receiver fires once the socket is gone.
pub async fn connect_to_sidecar(
    url: &str,
    on_message: MessageCallback,
) -> Result<(SidecarHandle, oneshot::Receiver<()>)> {
    info!(url = %url, "connecting to protocol sidecar");

    let (ws_stream, _) = connect_async(url).await.map_err(Error::transport)?;

    info!("connected to protocol sidecar");

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<GatewayMessage>(32);
    let (disconnect_tx, disconnect_rx) = oneshot::channel();

    let connected = Arc::new(RwLock::new(true));
    let connected_reader = Arc::clone(&connected);
    let connected_writer = Arc::clone(&connected);

    tokio::spawn(async move {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<SidecarMessage>(&text) {
                    Ok(msg) => on_message(msg),
                    Err(e) => {
                        warn!(error = %e, text = %text, "failed to parse sidecar message");
                    },
                },
                Ok(Message::Close(_)) => {
                    info!("sidecar connection closed");
                    break;
                },
                Ok(_) => {},
                Err(e) => {
                    error!(error = %e, "sidecar websocket read error");
                    break;
                },
            }
        }

        *connected_reader.write().await = false;
        let _ = disconnect_tx.send(());
    });

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if let Err(e) = write.send(Message::Text(json.into())).await {
                        error!(error = %e, "failed to send message to sidecar");
                        break;
                    }
                },
                Err(e) => {
                    error!(error = %e, "failed to serialize sidecar message");
                },
            }
        }

        *connected_writer.write().await = false;
    });

    Ok((SidecarHandle { tx, connected }, disconnect_rx))
}

/// Try to connect to the sidecar, pausing between attempts.
pub async fn connect_with_retry(
    url: &str,
    on_message: MessageCallback,
    max_retries: u32,
) -> Result<(SidecarHandle, oneshot::Receiver<()>)> {
    let mut attempt = 0;
    loop {
        match connect_to_sidecar(url, Arc::clone(&on_message)).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt >= max_retries {
                    return Err(e);
                }
                warn!(
                    attempt,
                    max_retries,
                    error = %e,
                    "failed to connect to sidecar, retrying"
                );
                tokio::time::sleep(RETRY_PAUSE).await;
            },
        }
    }
}

#[derive(Debug)]
struct SendOutcome {
    success: bool,
    message_id: Option<String>,
    error: Option<String>,
}

struct Route {
    id: u64,
    connection: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

struct Pending {
    connection: u64,
    tx: oneshot::Sender<SendOutcome>,
}

#[derive(Default)]
struct Router {
    routes: DashMap<AccountId, Route>,
    pending: DashMap<String, Pending>,
    next_route: AtomicU64,
}

impl Router {
    /// Point the account at a fresh event stream. A previous route is
    /// replaced, which ends the stream it fed.
    fn attach(&self, account_id: AccountId, connection: u64) -> (u64, EventStream) {
        let (tx, events) = mpsc::unbounded_channel();
        let id = self.next_route.fetch_add(1, Ordering::Relaxed) + 1;
        self.routes.insert(account_id, Route { id, connection, tx });
        (id, events)
    }

    fn detach(&self, account_id: AccountId, route_id: u64) -> bool {
        self.routes
            .remove_if(&account_id, |_, route| route.id == route_id)
            .is_some()
    }

    fn deliver(&self, account_id: AccountId, event: TransportEvent) {
        let delivered = self
            .routes
            .get(&account_id)
            .is_some_and(|route| route.tx.send(event).is_ok());
        if !delivered {
            debug!(account_id = %account_id, "dropping sidecar event for unrouted account");
        }
    }

    /// Deliver a terminal close and forget the route.
    fn finish(&self, account_id: AccountId, info: CloseInfo) {
        match self.routes.remove(&account_id) {
            Some((_, route)) => {
                let _ = route.tx.send(LifecycleEvent::Closed(info).into());
            },
            None => debug!(account_id = %account_id, "close for unrouted account"),
        }
    }

    fn handle(&self, msg: SidecarMessage) {
        match msg {
            SidecarMessage::Qr { account_id, qr } => {
                self.deliver(account_id, LifecycleEvent::PairingPayloadIssued(qr).into());
            },
            SidecarMessage::Connected {
                account_id,
                phone_number,
                jid,
                name,
            } => {
                let jid =
                    jid.or_else(|| phone_number.map(|p| format!("{p}{USER_ADDRESS_SUFFIX}")));
                self.deliver(
                    account_id,
                    LifecycleEvent::Opened(UserInfo { jid, name }).into(),
                );
            },
            SidecarMessage::Disconnected {
                account_id,
                status_code,
                reason,
            } => {
                let mut info = CloseInfo::new(CloseReason::from_code(status_code));
                if let Some(reason) = reason {
                    info = info.with_detail(reason);
                }
                self.finish(account_id, info);
            },
            SidecarMessage::LoggedOut { account_id } => {
                self.finish(account_id, CloseInfo::new(CloseReason::LoggedOut));
            },
            SidecarMessage::CredsUpdate {
                account_id,
                entries,
            } => {
                self.deliver(account_id, TransportEvent::CredentialsUpdated(entries));
            },
            SidecarMessage::SendResult {
                request_id,
                success,
                message_id,
                error,
            } => match self.pending.remove(&request_id) {
                Some((_, pending)) => {
                    let _ = pending.tx.send(SendOutcome {
                        success,
                        message_id,
                        error,
                    });
                },
                None => debug!(request_id = %request_id, "send result for unknown request"),
            },
            SidecarMessage::Error { account_id, error } => {
                warn!(account_id = ?account_id, error = %error, "sidecar reported an error");
            },
        }
    }

    /// Close every account routed over the given connection and fail its
    /// in-flight sends.
    fn connection_lost(&self, connection: u64) {
        self.routes.retain(|_, route| {
            if route.connection != connection {
                return true;
            }
            let info = CloseInfo::new(CloseReason::ConnectionLost)
                .with_detail("sidecar connection lost");
            let _ = route.tx.send(LifecycleEvent::Closed(info).into());
            false
        });
        self.pending
            .retain(|_, pending| pending.connection != connection);
    }
}

struct Connection {
    handle: SidecarHandle,
    generation: u64,
}

/// [`Transport`] that multiplexes every account over one sidecar socket.
pub struct SidecarTransport {
    url: String,
    connect_retries: u32,
    send_timeout: Duration,
    router: Arc<Router>,
    connection: Mutex<Option<Connection>>,
    generations: AtomicU64,
}

impl SidecarTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let defaults = SidecarConfig::default();
        Self {
            url: url.into(),
            connect_retries: defaults.connect_retries,
            send_timeout: defaults.send_timeout(),
            router: Arc::new(Router::default()),
            connection: Mutex::new(None),
            generations: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &SidecarConfig) -> Self {
        Self::new(config.url.clone())
            .with_connect_retries(config.connect_retries)
            .with_send_timeout(config.send_timeout())
    }

    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Current sidecar connection, dialing a new one when the last is gone.
    async fn connection(&self) -> Result<(SidecarHandle, u64)> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref()
            && conn.handle.is_connected().await
        {
            return Ok((conn.handle.clone(), conn.generation));
        }

        let router = Arc::clone(&self.router);
        let on_message: MessageCallback = Arc::new(move |msg| router.handle(msg));
        let (handle, disconnected) =
            connect_with_retry(&self.url, on_message, self.connect_retries).await?;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;

        let router = Arc::clone(&self.router);
        tokio::spawn(async move {
            let _ = disconnected.await;
            warn!(generation, "sidecar connection lost");
            router.connection_lost(generation);
        });

        *guard = Some(Connection {
            handle: handle.clone(),
            generation,
        });
        Ok((handle, generation))
    }
}

#[async_trait]
impl Transport for SidecarTransport {
    #[instrument(skip(self, credentials), fields(account_id = %account_id))]
    async fn open(
        &self,
        account_id: AccountId,
        credentials: CredentialState,
    ) -> Result<OpenedSession> {
        let (handle, generation) = self.connection().await?;
        let (route_id, events) = self.router.attach(account_id, generation);
        if let Err(e) = handle
            .send(GatewayMessage::Login {
                account_id,
                credentials,
            })
            .await
        {
            self.router.detach(account_id, route_id);
            return Err(e);
        }
        debug!(route_id, "login sent to sidecar");

        Ok(OpenedSession {
            session: Arc::new(SidecarSession {
                account_id,
                route_id,
                connection: generation,
                handle,
                router: Arc::clone(&self.router),
                send_timeout: self.send_timeout,
            }),
            events,
        })
    }
}

struct SidecarSession {
    account_id: AccountId,
    route_id: u64,
    connection: u64,
    handle: SidecarHandle,
    router: Arc<Router>,
    send_timeout: Duration,
}

#[async_trait]
impl TransportSession for SidecarSession {
    async fn send(&self, address: &str, payload: OutboundPayload) -> Result<Receipt> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.router.pending.insert(request_id.clone(), Pending {
            connection: self.connection,
            tx,
        });

        let msg = GatewayMessage::Send {
            account_id: self.account_id,
            to: address.to_string(),
            request_id: request_id.clone(),
            payload: WirePayload::from(&payload),
        };
        if let Err(e) = self.handle.send(msg).await {
            self.router.pending.remove(&request_id);
            return Err(e);
        }

        let outcome = match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                return Err(Error::DispatchFailure(
                    "sidecar connection lost before the send completed".into(),
                ));
            },
            Err(_) => {
                self.router.pending.remove(&request_id);
                return Err(Error::DispatchFailure(format!(
                    "send timed out after {}s",
                    self.send_timeout.as_secs()
                )));
            },
        };

        if outcome.success {
            Ok(Receipt {
                message_id: outcome.message_id.unwrap_or(request_id),
                timestamp: Utc::now(),
            })
        } else {
            Err(Error::DispatchFailure(
                outcome
                    .error
                    .unwrap_or_else(|| "sidecar rejected the message".into()),
            ))
        }
    }

    async fn logout(&self) -> Result<()> {
        let owned = self.router.detach(self.account_id, self.route_id);
        if !owned && self.router.routes.contains_key(&self.account_id) {
            return Err(Error::transport("account is owned by a newer session"));
        }
        self.handle
            .send(GatewayMessage::Logout {
                account_id: self.account_id,
            })
            .await
    }

    async fn close(&self) {
        if !self.router.detach(self.account_id, self.route_id) {
            return;
        }
        if let Err(e) = self
            .handle
            .send(GatewayMessage::Close {
                account_id: self.account_id,
            })
            .await
        {
            debug!(account_id = %self.account_id, error = %e, "close not delivered");
        }
    }
}
