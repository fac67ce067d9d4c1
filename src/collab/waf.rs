//! WAF ban reporting over HTTP.

use dashmap::DashSet;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::AbuseReporter;
use crate::config::WafConfig;
use crate::error::{GatewayError, Result};
use crate::identity::ClientIdentity;
use crate::ratelimit::RateLimiterSet;

/// Pace of ban submissions.
pub const REPORT_TICK: Duration = Duration::from_millis(250);

/// Delay before a failed submission is retried.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Submissions per client before the report is dropped.
pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Serialize)]
struct BanRequest<'a> {
    ip: &'a str,
    /// `ip` for a single address, `ip_range` for an IPv6 /64
    target: &'static str,
}

enum Submission {
    Banned,
    AlreadyBanned,
    /// A client error other than 409; retrying cannot help
    Refused(StatusCode),
}

struct WafInner {
    endpoint: String,
    key: String,
    client: reqwest::Client,
    queue: mpsc::Sender<ClientIdentity>,
    banned: DashSet<String>,
}

/// Queues abusive clients and bans them one at a time in the background.
/// A client is pruned from the limiters once its ban is accepted.
#[derive(Clone)]
pub struct WafReporter {
    inner: Arc<WafInner>,
}

impl WafReporter {
    pub fn spawn(
        config: &WafConfig,
        endpoint: String,
        client: reqwest::Client,
        limiters: RateLimiterSet,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let reporter = Self {
            inner: Arc::new(WafInner {
                endpoint,
                key: config.key.clone(),
                client,
                queue: tx,
                banned: DashSet::new(),
            }),
        };
        let handle = tokio::spawn(reporter.clone().run(rx, limiters, cancel));
        (reporter, handle)
    }

    /// Load the already-banned list so those clients are never resubmitted.
    /// The endpoint answers a GET with a JSON array of addresses or ranges.
    pub async fn seed_banned(&self) -> Result<usize> {
        let banned: Vec<String> = self
            .inner
            .client
            .get(&self.inner.endpoint)
            .header(AUTHORIZATION, &self.inner.key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let count = banned.len();
        for entry in banned {
            self.inner.banned.insert(entry);
        }
        info!(count, "Seeded banned client list");
        Ok(count)
    }

    pub fn is_banned(&self, id: &ClientIdentity) -> bool {
        self.inner.banned.contains(id.as_str())
    }

    async fn run(
        self,
        mut rx: mpsc::Receiver<ClientIdentity>,
        limiters: RateLimiterSet,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(REPORT_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let id = tokio::select! {
                _ = cancel.cancelled() => break,
                id = rx.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };

            if !self.inner.banned.insert(id.to_string()) {
                debug!(client = %id, "Client already banned");
                continue;
            }

            let mut attempts = 0;
            loop {
                attempts += 1;
                match self.submit(&id).await {
                    Ok(Submission::Banned) => {
                        info!(client = %id, "Client banned at the WAF");
                        limiters.prune(&id);
                        break;
                    }
                    Ok(Submission::AlreadyBanned) => {
                        debug!(client = %id, "WAF reports an existing ban");
                        break;
                    }
                    Ok(Submission::Refused(status)) => {
                        warn!(client = %id, %status, "WAF refused the ban, dropping report");
                        self.inner.banned.remove(id.as_str());
                        break;
                    }
                    Err(e) if attempts >= MAX_ATTEMPTS => {
                        warn!(client = %id, error = %e, attempts, "WAF submission failed, giving up");
                        self.inner.banned.remove(id.as_str());
                        break;
                    }
                    Err(e) => {
                        warn!(client = %id, error = %e, "WAF submission failed, retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                        }
                    }
                }
            }
        }
        debug!("WAF reporter stopped");
    }

    #[instrument(skip(self, id), fields(client = %id))]
    async fn submit(&self, id: &ClientIdentity) -> Result<Submission> {
        let body = BanRequest {
            ip: id.as_str(),
            target: if id.is_ipv6_range() { "ip_range" } else { "ip" },
        };
        let response = self
            .inner
            .client
            .post(&self.inner.endpoint)
            .header(AUTHORIZATION, &self.inner.key)
            .json(&body)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(Submission::Banned),
            StatusCode::CONFLICT => Ok(Submission::AlreadyBanned),
            status if status.is_client_error() => Ok(Submission::Refused(status)),
            status => Err(GatewayError::Waf(format!("endpoint answered {}", status))),
        }
    }
}

impl AbuseReporter for WafReporter {
    fn report_abuse_ip(&self, ip: &ClientIdentity) {
        if self.is_banned(ip) {
            return;
        }
        match self.inner.queue.try_send(ip.clone()) {
            Ok(()) => debug!(client = %ip, "Queued client for WAF ban"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client = %ip, "WAF queue full, dropping report")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(client = %ip, "WAF reporter stopped, dropping report")
            }
        }
    }
}
