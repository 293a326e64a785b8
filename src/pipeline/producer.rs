//! Publishing side: hold a valid credential, stamp it on every event

use super::event::NewEvent;
use super::supervisor::ReconnectSupervisor;
use crate::auth::{Authority, Credentials};
use crate::broker::BrokerChannel;
use crate::error::{AuthError, PublishError};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the producer stands with its credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    /// Never logged in, or logged out
    NoCredential,
    /// Holding a pair whose access token verified last time
    HasAccess,
    /// The refresh token was rejected; the next publish logs in again
    NeedsRelogin,
}

/// Producer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Successful logins
    pub logins: u64,
    /// Successful refreshes
    pub refreshes: u64,
    /// Verify round trips made
    pub verifications: u64,
    pub published: u64,
    pub failed: u64,
}

/// Publishes events stamped with a live access token
///
/// Before every send the held access token is verified against the
/// authority, including one that was just issued by a login. A rejected
/// token is refreshed; a rejected refresh falls back to a fresh login. If
/// login fails the send fails.
pub struct CredentialedProducer {
    subject: String,
    authority: Arc<dyn Authority>,
    supervisor: ReconnectSupervisor,
    credentials: Option<Credentials>,
    state: CredentialState,
    channel: Option<Box<dyn BrokerChannel>>,
    stats: ProducerStats,
}

impl CredentialedProducer {
    pub fn new(
        subject: impl Into<String>,
        authority: Arc<dyn Authority>,
        supervisor: ReconnectSupervisor,
    ) -> Self {
        Self {
            subject: subject.into(),
            authority,
            supervisor,
            credentials: None,
            state: CredentialState::NoCredential,
            channel: None,
            stats: ProducerStats::default(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn state(&self) -> CredentialState {
        self.state
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn stats(&self) -> ProducerStats {
        self.stats
    }

    pub fn supervisor(&self) -> &ReconnectSupervisor {
        &self.supervisor
    }

    /// Publish one event as a persistent message
    pub async fn publish(&mut self, event: NewEvent) -> Result<(), PublishError> {
        let kind = event.kind.clone();
        let result = self.try_publish(event).await;

        match &result {
            Ok(()) => {
                self.stats.published += 1;
                debug!(subject = %self.subject, event_type = %kind, "Event published");
            }
            Err(e) => {
                self.stats.failed += 1;
                warn!(subject = %self.subject, event_type = %kind, error = %e, "Publish failed");
            }
        }

        result
    }

    /// Make sure a valid access token is held and return it
    pub async fn ensure_credential(&mut self) -> Result<String, AuthError> {
        let credentials = match (&self.state, &self.credentials) {
            (CredentialState::HasAccess, Some(credentials)) => credentials.clone(),
            _ => return self.login().await,
        };

        self.stats.verifications += 1;
        match self.authority.verify(&credentials.access_token).await {
            Ok(_) => return Ok(credentials.access_token),
            Err(e) => debug!(subject = %self.subject, error = %e, "Access token rejected, refreshing"),
        }

        match self.authority.refresh(&credentials.refresh_token).await {
            Ok(access_token) => {
                self.stats.refreshes += 1;
                self.credentials = Some(Credentials {
                    access_token: access_token.clone(),
                    refresh_token: credentials.refresh_token,
                });
                info!(subject = %self.subject, "Access token refreshed");
                return Ok(access_token);
            }
            Err(e) if e.is_credential_failure() => {
                self.state = CredentialState::NeedsRelogin;
                info!(subject = %self.subject, error = %e, "Refresh rejected, logging in again");
            }
            Err(e) => {
                debug!(subject = %self.subject, error = %e, "Refresh failed, logging in again");
            }
        }

        self.login().await
    }

    /// Revoke the held refresh token and forget the credential
    pub async fn logout(&mut self) -> Result<(), AuthError> {
        if let Some(credentials) = self.credentials.take() {
            self.authority.revoke(&credentials.refresh_token).await?;
            info!(subject = %self.subject, "Logged out");
        }
        self.state = CredentialState::NoCredential;
        Ok(())
    }

    /// Close the broker channel and stop the supervisor
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Error closing producer channel");
            }
        }
        self.supervisor.close();
    }

    /// Log in and verify the fresh access token before it is used
    async fn login(&mut self) -> Result<String, AuthError> {
        let credentials = self.authority.login(&self.subject).await?;
        let access_token = credentials.access_token.clone();

        self.credentials = Some(credentials);
        self.stats.logins += 1;
        info!(subject = %self.subject, "Logged in");

        self.stats.verifications += 1;
        if let Err(e) = self.authority.verify(&access_token).await {
            warn!(subject = %self.subject, error = %e, "Fresh access token rejected");
            self.state = CredentialState::NeedsRelogin;
            return Err(e);
        }

        self.state = CredentialState::HasAccess;
        Ok(access_token)
    }

    async fn try_publish(&mut self, event: NewEvent) -> Result<(), PublishError> {
        let token = self.ensure_credential().await?;
        let body = event.stamp(token, Utc::now()).to_bytes()?;
        let queue = self.supervisor.topology().queue.clone();

        let channel = match self.channel.as_mut() {
            Some(channel) => channel,
            None => {
                let channel = self.supervisor.connect().await?;
                self.channel.insert(channel)
            }
        };

        let result = channel.publish(&queue, body, true).await;
        if let Err(e) = result {
            // Reconnect on the next publish
            self.channel = None;
            self.supervisor.mark_disconnected();
            return Err(e.into());
        }

        Ok(())
    }
}
