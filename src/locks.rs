//! Advisory-lock manager.
//!
//! One task per node owns the dedicated database session reserved for
//! session-scoped advisory locks. Components acquire leadership through
//! [`AdvisoryLocks::try_acquire`], receiving an opaque [`LockRef`] and a promise:
//! if the underlying session is ever lost, every current holder is sent
//! [`LockEvent::Lost`] and must treat it as loss of leadership. The session is
//! re-established automatically; holders re-acquire on their own schedule.
//!
//! Session loss is detected eagerly by a periodic ping and lazily by transport
//! errors on acquire/release.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::storage::{LockSession, Storage};

/// Opaque handle to a held advisory lock.
///
/// Valid until released or until the holder receives [`LockEvent::Lost`] for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockRef(u64);

/// Notification delivered to lock holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    /// The session backing this lock is gone; the lock is no longer held.
    Lost(LockRef),
}

enum LockCommand {
    Acquire {
        key: i64,
        events: mpsc::UnboundedSender<LockEvent>,
        reply: oneshot::Sender<Result<LockRef>>,
    },
    Release {
        lock_ref: LockRef,
    },
}

/// Cloneable handle to the lock-manager task.
#[derive(Clone)]
pub struct AdvisoryLocks {
    tx: mpsc::UnboundedSender<LockCommand>,
}

impl AdvisoryLocks {
    /// Attempt to take the advisory lock for `key`.
    ///
    /// On success the caller holds the lock until it calls [`release`](Self::release)
    /// or receives [`LockEvent::Lost`] on `events`.
    ///
    /// # Errors
    ///
    /// - [`Error::LockAlreadyTaken`] if another session holds the lock.
    /// - A retryable transport error if the lock session is unavailable.
    pub async fn try_acquire(
        &self,
        key: i64,
        events: mpsc::UnboundedSender<LockEvent>,
    ) -> Result<LockRef> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(LockCommand::Acquire {
                key,
                events,
                reply: reply_tx,
            })
            .map_err(|_| Error::Connection("lock manager stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Connection("lock manager stopped".into()))?
    }

    /// Release a held lock. Releasing an already-lost lock is a no-op.
    pub fn release(&self, lock_ref: LockRef) {
        let _ = self.tx.send(LockCommand::Release { lock_ref });
    }
}

struct Holder {
    key: i64,
    events: mpsc::UnboundedSender<LockEvent>,
}

struct LockManager {
    storage: Arc<dyn Storage>,
    session: Option<Box<dyn LockSession>>,
    holders: HashMap<u64, Holder>,
    next_ref: u64,
}

impl LockManager {
    async fn acquire(
        &mut self,
        key: i64,
        events: mpsc::UnboundedSender<LockEvent>,
    ) -> Result<LockRef> {
        if self.session.is_none() {
            self.session = Some(self.storage.lock_session().await?);
            tracing::debug!("advisory lock session established");
        }
        let session = self.session.as_mut().expect("session just ensured");

        match session.try_lock(key).await {
            Ok(true) => {
                let lock_ref = LockRef(self.next_ref);
                self.next_ref += 1;
                self.holders.insert(lock_ref.0, Holder { key, events });
                Ok(lock_ref)
            }
            Ok(false) => Err(Error::LockAlreadyTaken { key }),
            Err(e) => {
                self.session_lost();
                Err(e)
            }
        }
    }

    async fn release(&mut self, lock_ref: LockRef) {
        let Some(holder) = self.holders.remove(&lock_ref.0) else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(e) = session.unlock(holder.key).await {
            tracing::warn!(error = %e, key = holder.key, "advisory unlock failed");
            self.session_lost();
        }
    }

    async fn check_session(&mut self) {
        match self.session.as_mut() {
            Some(session) => {
                if let Err(e) = session.ping().await {
                    tracing::warn!(error = %e, "advisory lock session lost");
                    self.session_lost();
                }
            }
            // Re-establish ahead of the next acquire so holders can re-take
            // their locks promptly.
            None => match self.storage.lock_session().await {
                Ok(session) => {
                    self.session = Some(session);
                    tracing::debug!("advisory lock session re-established");
                }
                Err(e) => tracing::debug!(error = %e, "lock session reconnect failed"),
            },
        }
    }

    /// Every lock held through the dead session is gone; tell the owners.
    fn session_lost(&mut self) {
        self.session = None;
        for (raw_ref, holder) in self.holders.drain() {
            let _ = holder.events.send(LockEvent::Lost(LockRef(raw_ref)));
        }
    }
}

/// Spawn the lock-manager task.
///
/// `ping_interval` bounds how long session loss can go undetected while no lock
/// traffic is flowing.
pub fn spawn_lock_manager(
    storage: Arc<dyn Storage>,
    ping_interval: Duration,
) -> (AdvisoryLocks, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let manager = LockManager {
        storage,
        session: None,
        holders: HashMap::new(),
        next_ref: 1,
    };
    let join = tokio::spawn(run_lock_manager(manager, rx, ping_interval));
    (AdvisoryLocks { tx }, join)
}

async fn run_lock_manager(
    mut manager: LockManager,
    mut rx: mpsc::UnboundedReceiver<LockCommand>,
    ping_interval: Duration,
) {
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(LockCommand::Acquire { key, events, reply }) => {
                    let _ = reply.send(manager.acquire(key, events).await);
                }
                Some(LockCommand::Release { lock_ref }) => manager.release(lock_ref).await,
                // All handles dropped: exit. Dropping the session releases any
                // remaining locks server-side.
                None => break,
            },
            _ = ticker.tick() => manager.check_session().await,
        }
    }
}
