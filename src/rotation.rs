//! Credential rotation and retry policy for classification calls
//!
//! [`RotatingClient`] wraps a [`ClassificationPort`] together with the
//! credential it is currently using. Every logical operation (identify goals,
//! classify one hunk) runs through [`RotatingClient::run`], which rotates
//! through the pool on rate limits and waits out a cooldown when every key
//! has been tried. It gives up once the operation has spent its retry budget
//! or after a fixed number of cooldowns, whichever comes first.

use crate::credentials::{Credential, CredentialStore, ErrorKind};
use crate::diff::Hunk;
use crate::llm::{Auth, ClassificationPort, Provider, ProviderError};
use crate::plan::Goal;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Rate-limit retries when there is no pool to rotate through
pub const MAX_RETRIES: u32 = 3;
pub const INITIAL_BACKOFF_MS: u64 = 2000;
pub const BACKOFF_MULTIPLIER: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;

pub const DEFAULT_WAIT_MINUTES: u64 = 5;
pub const DEFAULT_MAX_SWEEPS: u32 = 3;
const COUNTDOWN_INTERVAL_SECS: u64 = 30;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Attempts allowed for one logical operation against a pool of `active`
/// credentials.
pub fn retry_budget(active: usize) -> usize {
    (2 * active).max(10)
}

#[derive(Debug, Clone)]
pub struct RotationPolicy {
    /// Cooldown once every credential has been tried and rate limited
    pub wait: Duration,
    /// Cooldowns allowed per operation before it fails
    pub max_sweeps: u32,
    /// Retries with the same credential after a non rate-limit error
    pub local_retries: u32,
    /// First backoff step when there is no pool
    pub initial_backoff: Duration,
    pub countdown_interval: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(DEFAULT_WAIT_MINUTES * 60),
            max_sweeps: DEFAULT_MAX_SWEEPS,
            local_retries: 1,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            countdown_interval: Duration::from_secs(COUNTDOWN_INTERVAL_SECS),
        }
    }
}

impl RotationPolicy {
    /// Exponential backoff for the `retry`-th rate limit (1-based), capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = BACKOFF_MULTIPLIER.saturating_pow(retry.saturating_sub(1));
        let delay = self.initial_backoff.saturating_mul(factor as u32);
        delay.min(Duration::from_secs(MAX_BACKOFF_SECS))
    }
}

#[derive(Debug, Error)]
pub enum RotationError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("every {provider} API key is still rate limited after {sweeps} cooldown wait(s)")]
    Exhausted { provider: Provider, sweeps: u32 },
    #[error("gave up on {provider} after {attempts} attempt(s)")]
    BudgetSpent { provider: Provider, attempts: usize },
    #[error("cancelled")]
    Cancelled,
    #[error("credential store error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// One logical request, replayable across attempts
trait Operation {
    type Output;

    fn name(&self) -> &'static str;

    async fn call<P: ClassificationPort>(
        &self,
        client: &P,
        auth: &Auth,
    ) -> Result<Self::Output, ProviderError>;
}

struct IdentifyGoals<'a> {
    hunks: &'a [Hunk],
    context: &'a str,
}

impl Operation for IdentifyGoals<'_> {
    type Output = Vec<Goal>;

    fn name(&self) -> &'static str {
        "identify_goals"
    }

    async fn call<P: ClassificationPort>(
        &self,
        client: &P,
        auth: &Auth,
    ) -> Result<Vec<Goal>, ProviderError> {
        client.identify_goals(auth, self.hunks, self.context).await
    }
}

struct ClassifyHunk<'a> {
    hunk: &'a Hunk,
    goals: &'a [Goal],
    context: &'a str,
}

impl Operation for ClassifyHunk<'_> {
    type Output = u32;

    fn name(&self) -> &'static str {
        "classify"
    }

    async fn call<P: ClassificationPort>(
        &self,
        client: &P,
        auth: &Auth,
    ) -> Result<u32, ProviderError> {
        client
            .classify(auth, self.hunk, self.goals, self.context)
            .await
    }
}

/// A classification backend plus the credential it currently holds
pub struct RotatingClient<P> {
    client: P,
    provider: Provider,
    store: Option<CredentialStore>,
    fallback_secret: Option<String>,
    current: Option<Credential>,
    policy: RotationPolicy,
    cancel: CancellationToken,
    clock: Clock,
}

/// Per-operation bookkeeping for the pooled path
struct Sweep {
    used: HashSet<i64>,
    /// Calls made for this operation; cooldowns do not reset it
    attempts: usize,
    cooldowns: u32,
    local_retries_left: u32,
}

impl<P: ClassificationPort> RotatingClient<P> {
    pub fn new(
        client: P,
        provider: Provider,
        policy: RotationPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            provider,
            store: None,
            fallback_secret: None,
            current: None,
            policy,
            cancel,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_store(mut self, store: CredentialStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Secret used when the pool has no active credential for the provider
    pub fn with_fallback_secret(mut self, secret: Option<String>) -> Self {
        self.fallback_secret = secret.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn client(&self) -> &P {
        &self.client
    }

    pub fn store(&self) -> Option<&CredentialStore> {
        self.store.as_ref()
    }

    /// Pool id of the credential in use, if any
    pub fn current_credential(&self) -> Option<i64> {
        self.current.as_ref().map(|c| c.id)
    }

    pub async fn identify_goals(
        &mut self,
        hunks: &[Hunk],
        context: &str,
    ) -> Result<Vec<Goal>, RotationError> {
        self.run(&IdentifyGoals { hunks, context }).await
    }

    pub async fn classify(
        &mut self,
        hunk: &Hunk,
        goals: &[Goal],
        context: &str,
    ) -> Result<u32, RotationError> {
        self.run(&ClassifyHunk {
            hunk,
            goals,
            context,
        })
        .await
    }

    async fn run<O: Operation>(&mut self, op: &O) -> Result<O::Output, RotationError> {
        let active = match &self.store {
            Some(store) => store.active_count(self.provider.as_str())?,
            None => 0,
        };
        if active == 0 {
            self.current = None;
            return self.run_unpooled(op).await;
        }
        self.run_pooled(op, retry_budget(active)).await
    }

    async fn run_pooled<O: Operation>(
        &mut self,
        op: &O,
        budget: usize,
    ) -> Result<O::Output, RotationError> {
        let mut sweep = Sweep {
            used: HashSet::new(),
            attempts: 0,
            cooldowns: 0,
            local_retries_left: self.policy.local_retries,
        };

        loop {
            if self.cancel.is_cancelled() {
                return Err(RotationError::Cancelled);
            }
            if sweep.attempts >= budget {
                return Err(self.budget_spent(sweep.attempts));
            }

            let credential = match self.current.clone() {
                Some(credential) => credential,
                None => match self.select()? {
                    Some(credential) => credential,
                    None => {
                        self.cooldown(&mut sweep).await?;
                        continue;
                    }
                },
            };

            sweep.used.insert(credential.id);
            sweep.attempts += 1;
            let auth = Auth {
                credential_id: Some(credential.id),
                secret: Some(credential.secret.clone()),
            };

            let err = match self.call_cancellable(op, &auth).await? {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            if err.is_rate_limit() {
                self.record(credential.id, ErrorKind::RateLimit, &err.message)?;
                tracing::warn!(
                    op = op.name(),
                    credential = credential.id,
                    attempt = sweep.attempts,
                    budget,
                    "rate limited, rotating credential"
                );
                self.current = None;

                let active: HashSet<i64> = self.active_ids()?.into_iter().collect();
                if active.is_empty() {
                    return Err(RotationError::Provider(err));
                }
                if sweep.attempts >= budget {
                    return Err(self.budget_spent(sweep.attempts));
                }
                if active.is_subset(&sweep.used) {
                    self.cooldown(&mut sweep).await?;
                } else {
                    eprintln!(
                        "  Rate limited on key {}, rotating (attempt {}/{})",
                        credential.label(),
                        sweep.attempts + 1,
                        budget
                    );
                }
                continue;
            }

            self.record(credential.id, ErrorKind::Other, &err.message)?;
            if sweep.local_retries_left > 0 {
                sweep.local_retries_left -= 1;
                tracing::debug!(op = op.name(), error = %err, "retrying once with the same credential");
                continue;
            }
            return Err(RotationError::Provider(err));
        }
    }

    async fn run_unpooled<O: Operation>(&mut self, op: &O) -> Result<O::Output, RotationError> {
        let auth = Auth {
            credential_id: None,
            secret: self.fallback_secret.clone(),
        };
        let mut rate_limited = 0u32;
        let mut local_retries_left = self.policy.local_retries;

        loop {
            if self.cancel.is_cancelled() {
                return Err(RotationError::Cancelled);
            }

            let err = match self.call_cancellable(op, &auth).await? {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            if err.is_rate_limit() {
                if rate_limited >= MAX_RETRIES {
                    return Err(RotationError::Provider(err));
                }
                rate_limited += 1;
                let mut delay = self.policy.backoff(rate_limited);
                if let Some(hint) = err.retry_after {
                    delay = delay.max(Duration::from_secs(hint));
                }
                tracing::warn!(
                    op = op.name(),
                    retry = rate_limited,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, backing off"
                );
                self.sleep(delay).await?;
                continue;
            }

            if local_retries_left > 0 {
                local_retries_left -= 1;
                continue;
            }
            return Err(RotationError::Provider(err));
        }
    }

    async fn call_cancellable<O: Operation>(
        &self,
        op: &O,
        auth: &Auth,
    ) -> Result<Result<O::Output, ProviderError>, RotationError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RotationError::Cancelled),
            result = op.call(&self.client, auth) => Ok(result),
        }
    }

    fn select(&mut self) -> Result<Option<Credential>, RotationError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let picked = store.next_credential(self.provider.as_str(), (self.clock)())?;
        if let Some(credential) = &picked {
            tracing::debug!(credential = credential.id, "selected credential");
        }
        self.current = picked.clone();
        Ok(picked)
    }

    fn active_ids(&self) -> Result<Vec<i64>, RotationError> {
        match &self.store {
            Some(store) => Ok(store.active_ids(self.provider.as_str())?),
            None => Ok(Vec::new()),
        }
    }

    fn record(&self, credential_id: i64, kind: ErrorKind, message: &str) -> Result<(), RotationError> {
        if let Some(store) = &self.store {
            store.record_error(credential_id, kind, message, (self.clock)())?;
        }
        Ok(())
    }

    /// Wait out the rate-limit window, then start a fresh sweep.
    async fn cooldown(&self, sweep: &mut Sweep) -> Result<(), RotationError> {
        if sweep.cooldowns >= self.policy.max_sweeps {
            return Err(RotationError::Exhausted {
                provider: self.provider,
                sweeps: sweep.cooldowns,
            });
        }
        sweep.cooldowns += 1;

        let wait = self.policy.wait;
        eprintln!(
            "  All {} API keys are rate limited. Waiting {} before retrying ({}/{})...",
            self.provider,
            format_remaining(wait),
            sweep.cooldowns,
            self.policy.max_sweeps
        );
        self.countdown(wait).await?;
        eprintln!("  Retrying with all keys...");

        sweep.used.clear();
        Ok(())
    }

    fn budget_spent(&self, attempts: usize) -> RotationError {
        tracing::warn!(provider = %self.provider, attempts, "retry budget spent");
        RotationError::BudgetSpent {
            provider: self.provider,
            attempts,
        }
    }

    async fn countdown(&self, total: Duration) -> Result<(), RotationError> {
        let step = self.policy.countdown_interval.max(Duration::from_millis(1));
        let mut remaining = total;
        while !remaining.is_zero() {
            let slice = remaining.min(step);
            self.sleep(slice).await?;
            remaining -= slice;
            if !remaining.is_zero() {
                eprintln!("    {} remaining", format_remaining(remaining));
            }
        }
        Ok(())
    }

    async fn sleep(&self, duration: Duration) -> Result<(), RotationError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RotationError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

fn format_remaining(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
