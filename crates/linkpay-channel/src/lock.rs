//! Per-channel mutual exclusion with expiring leases.
//!
//! Every channel-mutating step runs while holding the lock for the channel's
//! multisig. A lease that outlives its holder expires and can be taken over,
//! so a crashed workflow cannot block the channel forever. Acquisition is not
//! re-entrant.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::LockError;

/// Opaque proof of ownership returned by `acquire`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn from_value(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lease-based lock keyed by channel.
#[async_trait]
pub trait ChannelLock: Send + Sync {
    /// Block until `key` is free (or its lease expired) and take it for
    /// `lease`. Fails with [`LockError::Timeout`] per the implementation's
    /// acquisition policy.
    async fn acquire(&self, key: &str, lease: Duration) -> Result<LockToken, LockError>;

    /// Release `key` if `token` still owns it.
    async fn release(&self, key: &str, token: &LockToken) -> Result<(), LockError>;
}

#[derive(Debug, Clone)]
struct Lease {
    token: LockToken,
    expires_at: Instant,
}

/// In-process [`ChannelLock`] for single-node deployments.
pub struct InMemoryChannelLock {
    leases: DashMap<String, Lease>,
    released: Notify,
    acquire_timeout: Duration,
}

impl InMemoryChannelLock {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            leases: DashMap::new(),
            released: Notify::new(),
            acquire_timeout,
        }
    }

    /// Whether `key` is held by a lease that has not expired.
    pub fn is_held(&self, key: &str) -> bool {
        self.leases
            .get(key)
            .map(|lease| lease.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Take the lease if free or expired; otherwise report when the current
    /// lease runs out.
    fn try_take(&self, key: &str, lease: Duration) -> Result<LockToken, Instant> {
        let now = Instant::now();
        match self.leases.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                let token = LockToken::generate();
                vacant.insert(Lease {
                    token: token.clone(),
                    expires_at: now + lease,
                });
                Ok(token)
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Err(occupied.get().expires_at);
                }
                tracing::warn!(
                    key,
                    previous = %occupied.get().token,
                    "taking over expired channel lease"
                );
                let token = LockToken::generate();
                occupied.insert(Lease {
                    token: token.clone(),
                    expires_at: now + lease,
                });
                Ok(token)
            }
        }
    }
}

impl Default for InMemoryChannelLock {
    fn default() -> Self {
        Self::new(Duration::from_secs(20))
    }
}

#[async_trait]
impl ChannelLock for InMemoryChannelLock {
    async fn acquire(&self, key: &str, lease: Duration) -> Result<LockToken, LockError> {
        if lease.is_zero() {
            return Err(LockError::InvalidLease("lease must be positive".into()));
        }
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;

        loop {
            // Registered before the attempt so a release in between is seen.
            let notified = self.released.notified();
            tokio::pin!(notified);

            match self.try_take(key, lease) {
                Ok(token) => {
                    tracing::debug!(key, %token, lease_ms = lease.as_millis() as u64, "channel lock acquired");
                    return Ok(token);
                }
                Err(expires_at) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!(key, "channel lock acquisition timed out");
                        return Err(LockError::Timeout {
                            key: key.to_string(),
                            waited_ms: (now - started).as_millis() as u64,
                        });
                    }
                    let wake_at = expires_at.min(deadline);
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(wake_at) => {}
                    }
                }
            }
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<(), LockError> {
        let removed = self
            .leases
            .remove_if(key, |_, lease| &lease.token == token)
            .is_some();
        if !removed {
            return Err(LockError::NotHeld {
                key: key.to_string(),
            });
        }
        tracing::debug!(key, %token, "channel lock released");
        self.released.notify_waiters();
        Ok(())
    }
}

/// A held channel lock. Release it with [`ChannelLockGuard::release`]; if
/// the guard is dropped while still held (e.g. the owning future was
/// cancelled) the release is spawned onto the runtime, and the lease expiry
/// covers the case where no runtime is available.
pub struct ChannelLockGuard {
    lock: Arc<dyn ChannelLock>,
    key: String,
    token: Option<LockToken>,
}

impl ChannelLockGuard {
    pub async fn acquire(
        lock: Arc<dyn ChannelLock>,
        key: &str,
        lease: Duration,
    ) -> Result<Self, LockError> {
        let token = lock.acquire(key, lease).await?;
        Ok(Self {
            lock,
            key: key.to_string(),
            token: Some(token),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        match self.token.take() {
            Some(token) => self.lock.release(&self.key, &token).await,
            None => Ok(()),
        }
    }
}

impl Drop for ChannelLockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let lock = self.lock.clone();
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = lock.release(&key, &token).await {
                    tracing::warn!(key, error = %e, "deferred channel lock release failed");
                }
            });
        } else {
            tracing::warn!(key, "channel lock guard dropped outside runtime, relying on lease expiry");
        }
    }
}

/// Run `op` while holding the lock on `key`. The lock is released on every
/// exit path; a failed release is logged and never replaces `op`'s result.
pub async fn with_channel_lock<T, E, F, Fut>(
    lock: &Arc<dyn ChannelLock>,
    key: &str,
    lease: Duration,
    op: F,
) -> Result<T, E>
where
    E: From<LockError>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let guard = ChannelLockGuard::acquire(lock.clone(), key, lease).await?;
    let result = op().await;
    if let Err(e) = guard.release().await {
        tracing::warn!(key, error = %e, "channel lock release failed");
    }
    result
}
