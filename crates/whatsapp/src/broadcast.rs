//! Broadcast engine: one templated message to many recipients through one
//! account, one recipient at a time, with pause/resume/stop control.
//!
//! Runs are not persisted. A run interrupted by a restart is not resumed.

use std::{collections::HashSet, sync::Arc, time::Duration};

use {
    rand::Rng,
    serde::{Deserialize, Serialize},
    tokio::{
        sync::{mpsc, watch},
        time::Instant,
    },
    tracing::{debug, info, instrument, warn},
};

#[cfg(feature = "metrics")]
use metrics::counter;

use {
    wazper_common::{AccountId, Error, Result},
    wazper_config::BroadcastConfig,
};

use crate::{media::MediaSource, outbound::Outbound};

/// Highest `{textN}` placeholder index.
pub const MAX_PLACEHOLDERS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Digits only.
    pub phone: String,
    /// Positional values for `{text1}`..`{text10}`.
    pub data: Vec<String>,
}

impl Recipient {
    pub fn new(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            data: Vec::new(),
        }
    }

    pub fn with_data<I, S>(mut self, data: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data = data.into_iter().map(Into::into).collect();
        self
    }

    /// Parse `phone[,value1,value2..]`. Returns `None` when the phone part
    /// has no digits.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split(',');
        let phone: String = parts
            .next()?
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        if phone.is_empty() {
            return None;
        }
        Some(Self {
            phone,
            data: parts.map(|v| v.trim().to_string()).collect(),
        })
    }
}

/// One recipient per non-empty line, de-duplicated by phone.
pub fn parse_recipients(text: &str) -> Vec<Recipient> {
    dedupe_recipients(
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter_map(Recipient::parse),
    )
}

/// Drop repeated phones, keeping the first occurrence and the input order.
pub fn dedupe_recipients(recipients: impl IntoIterator<Item = Recipient>) -> Vec<Recipient> {
    let mut seen = HashSet::new();
    recipients
        .into_iter()
        .filter(|r| seen.insert(r.phone.clone()))
        .collect()
}

/// Substitute `{text1}`..`{text10}` with the recipient's values. Missing values
/// become empty strings. Substituted text is not scanned again.
pub fn render_template(template: &str, data: &[String]) -> String {
    const OPEN: &str = "{text";
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let index = after[..digits].parse::<usize>().ok();
        match (index, after[digits..].starts_with('}')) {
            (Some(n), true) if (1..=MAX_PLACEHOLDERS).contains(&n) => {
                if let Some(value) = data.get(n - 1) {
                    out.push_str(value);
                }
                rest = &after[digits + 1..];
            },
            _ => {
                out.push_str(OPEN);
                rest = after;
            },
        }
    }
    out.push_str(rest);
    out
}

/// Lifecycle of a broadcast run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }
}

/// Shared control surface of one run. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct BroadcastControl {
    state: Arc<watch::Sender<RunState>>,
}

impl Default for BroadcastControl {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastControl {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RunState::Idle);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// `Running -> Paused`.
    pub fn pause(&self) -> bool {
        self.transition(|s| (s == RunState::Running).then_some(RunState::Paused))
    }

    /// `Paused -> Running`.
    pub fn resume(&self) -> bool {
        self.transition(|s| (s == RunState::Paused).then_some(RunState::Running))
    }

    /// Any non-terminal state `-> Stopped`.
    pub fn stop(&self) -> bool {
        self.transition(|s| (!s.is_terminal()).then_some(RunState::Stopped))
    }

    pub(crate) fn start(&self) -> bool {
        self.transition(|s| (s == RunState::Idle).then_some(RunState::Running))
    }

    pub(crate) fn finish(&self) -> bool {
        self.transition(|s| {
            matches!(s, RunState::Running | RunState::Paused).then_some(RunState::Completed)
        })
    }

    fn transition(&self, next: impl FnOnce(RunState) -> Option<RunState>) -> bool {
        self.state.send_if_modified(|state| match next(*state) {
            Some(new) => {
                *state = new;
                true
            },
            None => false,
        })
    }
}

/// Inclusive range the inter-message delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub fn from_secs(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_secs(min),
            max: Duration::from_secs(max.max(min)),
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            min: delay,
            max: delay,
        }
    }

    pub fn sample(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        if max <= min {
            return self.min;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

impl From<&BroadcastConfig> for DelayRange {
    fn from(cfg: &BroadcastConfig) -> Self {
        Self::from_secs(cfg.default_delay_min_secs, cfg.default_delay_max_secs)
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastRequest {
    pub account_id: AccountId,
    pub recipients: Vec<Recipient>,
    pub template: String,
    pub media: Option<MediaSource>,
    pub delay: DelayRange,
}

impl BroadcastRequest {
    pub fn new(
        account_id: AccountId,
        recipients: Vec<Recipient>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            recipients,
            template: template.into(),
            media: None,
            delay: DelayRange::from(&BroadcastConfig::default()),
        }
    }

    pub fn with_media(mut self, media: MediaSource) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_delay(mut self, delay: DelayRange) -> Self {
        self.delay = delay;
        self
    }
}

/// Outcome of one recipient, recorded as soon as its send returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientResult {
    pub index: usize,
    pub phone: String,
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastEnd {
    Completed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOutcome {
    pub results: Vec<RecipientResult>,
    pub sent: usize,
    pub failed: usize,
    pub end: BroadcastEnd,
}

pub struct BroadcastEngine {
    outbound: Arc<dyn Outbound>,
    poll_interval: Duration,
}

impl BroadcastEngine {
    pub fn new(outbound: Arc<dyn Outbound>) -> Self {
        Self {
            outbound,
            poll_interval: BroadcastConfig::default().pause_poll_interval(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// Run a broadcast to completion or until stopped. Per-recipient failures
    /// are recorded and do not abort the run.
    #[instrument(skip_all, fields(account_id = %request.account_id))]
    pub async fn run(
        &self,
        request: BroadcastRequest,
        control: &BroadcastControl,
        progress: Option<&mpsc::UnboundedSender<RecipientResult>>,
    ) -> Result<BroadcastOutcome> {
        let recipients = dedupe_recipients(request.recipients);
        let media = match &request.media {
            Some(source) => {
                let loaded = source.load().await?;
                Some(
                    MediaSource::from_bytes(loaded.data)
                        .with_mime_type(loaded.mime_type)
                        .with_file_name(loaded.file_name),
                )
            },
            None => None,
        };
        if media.is_none() && request.template.trim().is_empty() {
            return Err(Error::DispatchFailure(
                "broadcast has neither message nor media".into(),
            ));
        }

        if !control.start() && control.state() != RunState::Stopped {
            return Err(Error::DispatchFailure(format!(
                "broadcast control is already {:?}",
                control.state()
            )));
        }
        info!(recipients = recipients.len(), "broadcast started");

        let total = recipients.len();
        let mut results = Vec::with_capacity(total);
        let mut stopped = false;
        for (index, recipient) in recipients.iter().enumerate() {
            if !self.wait_while_paused(control).await {
                stopped = true;
                break;
            }

            let text = render_template(&request.template, &recipient.data);
            let blank = text.trim().is_empty();
            let sent = match &media {
                Some(media) => {
                    let caption = (!blank).then_some(text.as_str());
                    self.outbound
                        .send_media(request.account_id, &recipient.phone, media, caption)
                        .await
                },
                None if blank => Err(Error::DispatchFailure(
                    "message is empty for this recipient".into(),
                )),
                None => {
                    self.outbound
                        .send_text(request.account_id, &recipient.phone, &text)
                        .await
                },
            };

            let result = match sent {
                Ok(receipt) => RecipientResult {
                    index,
                    phone: recipient.phone.clone(),
                    success: true,
                    message_id: Some(receipt.message_id),
                    error: None,
                },
                Err(e) => {
                    warn!(phone = %recipient.phone, error = %e, "broadcast recipient failed");
                    RecipientResult {
                        index,
                        phone: recipient.phone.clone(),
                        success: false,
                        message_id: None,
                        error: Some(e.to_string()),
                    }
                },
            };
            #[cfg(feature = "metrics")]
            counter!("wazper_broadcast_recipients_total", "result" => if result.success { "sent" } else { "failed" })
                .increment(1);
            if let Some(progress) = progress {
                let _ = progress.send(result.clone());
            }
            results.push(result);

            if index + 1 < total {
                let delay = request.delay.sample();
                debug!(delay_ms = delay.as_millis() as u64, "waiting before next recipient");
                if !self.delay_observing(control, delay).await {
                    stopped = true;
                    break;
                }
            }
        }

        let end = if stopped || control.state() == RunState::Stopped {
            BroadcastEnd::Stopped
        } else {
            control.finish();
            BroadcastEnd::Completed
        };
        let sent = results.iter().filter(|r| r.success).count();
        let failed = results.len() - sent;
        info!(sent, failed, end = ?end, "broadcast finished");
        Ok(BroadcastOutcome {
            results,
            sent,
            failed,
            end,
        })
    }

    /// Block while paused. Returns `false` once stopped.
    async fn wait_while_paused(&self, control: &BroadcastControl) -> bool {
        loop {
            match control.state() {
                RunState::Stopped => return false,
                RunState::Paused => tokio::time::sleep(self.poll_interval).await,
                _ => return true,
            }
        }
    }

    /// Sleep for `delay` in poll-sized steps. Paused time does not count
    /// toward the delay. Returns `false` once stopped.
    async fn delay_observing(&self, control: &BroadcastControl, delay: Duration) -> bool {
        let mut remaining = delay;
        while !remaining.is_zero() {
            if !self.wait_while_paused(control).await {
                return false;
            }
            let step = remaining.min(self.poll_interval);
            let started = Instant::now();
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(started.elapsed());
        }
        control.state() != RunState::Stopped
    }
}
