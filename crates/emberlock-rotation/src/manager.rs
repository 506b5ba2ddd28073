use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use emberlock_crypto::keys::{fingerprint, verify_identity_key_rotation};
use emberlock_crypto::{CompromiseDetector, CryptoError, IdentityKeyPair, IdentityKeyStore};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{clamp_interval, RotationConfig};
use crate::error::RotationError;

/// Rotates the identity keys of a set of managed users on a schedule.
///
/// Every user whose key is older than the rotation interval (or who has
/// never been rotated by this manager) is rotated at the next check. Failed
/// rotations are logged and retried at the following check.
pub struct IdentityKeyRotationManager {
    store: Arc<dyn IdentityKeyStore>,
    detector: Arc<dyn CompromiseDetector>,
    check_interval: Duration,
    max_attempts: u32,
    retry_delay: Duration,
    schedule: RwLock<Schedule>,
    /// Managed user IDs and when each was last rotated by this manager.
    users: Mutex<BTreeMap<String, Option<Instant>>>,
}

struct Schedule {
    enabled: bool,
    rotation_interval: Duration,
    last_rotation: Option<SystemTime>,
}

/// Snapshot returned by [`IdentityKeyRotationManager::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationStatus {
    pub enabled: bool,
    pub rotation_interval: Duration,
    pub check_interval: Duration,
    /// Wall-clock time of the last successful rotation of any user.
    pub last_rotation: Option<SystemTime>,
    pub managed_users: usize,
}

/// Outcome of rotating several users.
#[derive(Debug, Default)]
pub struct RotationReport {
    pub rotated: Vec<String>,
    pub failed: Vec<(String, RotationError)>,
}

impl RotationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Handle to the background scheduler started by
/// [`IdentityKeyRotationManager::start`].
pub struct RotationHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl RotationHandle {
    /// Stop the scheduler. A rotation already in progress finishes first.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "identity key rotation task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl IdentityKeyRotationManager {
    pub fn new(
        config: &RotationConfig,
        store: Arc<dyn IdentityKeyStore>,
        detector: Arc<dyn CompromiseDetector>,
    ) -> Self {
        Self {
            store,
            detector,
            check_interval: clamp_interval(Duration::from_secs(config.check_interval_secs), "check"),
            max_attempts: config.max_attempts(),
            retry_delay: config.retry_delay(),
            schedule: RwLock::new(Schedule {
                enabled: config.enabled,
                rotation_interval: clamp_interval(
                    Duration::from_secs(config.rotation_interval_secs),
                    "rotation",
                ),
                last_rotation: None,
            }),
            users: Mutex::new(BTreeMap::new()),
        }
    }

    /// Add a user to the rotation schedule. Returns `false` if already managed.
    pub fn manage(&self, user_id: impl Into<String>) -> bool {
        let mut users = self.users.lock();
        let user_id = user_id.into();
        if users.contains_key(&user_id) {
            return false;
        }
        users.insert(user_id, None);
        true
    }

    /// Remove a user from the schedule. Returns `false` if it was not managed.
    pub fn unmanage(&self, user_id: &str) -> bool {
        self.users.lock().remove(user_id).is_some()
    }

    pub fn managed_users(&self) -> Vec<String> {
        self.users.lock().keys().cloned().collect()
    }

    /// Spawn the scheduler on the current tokio runtime.
    ///
    /// The first check runs immediately, then every check interval.
    pub fn start(self: &Arc<Self>) -> RotationHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            manager.run_scheduler(shutdown_rx).await;
        });
        RotationHandle { shutdown_tx, task }
    }

    async fn run_scheduler(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            check_interval_secs = self.check_interval.as_secs(),
            "identity key rotation scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_and_rotate_if_needed().await;
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("identity key rotation scheduler stopped");
                    break;
                }
            }
        }
    }

    /// Rotate every managed user whose key is due. Returns `None` when the
    /// manager is disabled or nobody is due.
    pub async fn check_and_rotate_if_needed(&self) -> Option<RotationReport> {
        let rotation_interval = {
            let schedule = self.schedule.read();
            if !schedule.enabled {
                return None;
            }
            schedule.rotation_interval
        };

        let due: Vec<String> = self
            .users
            .lock()
            .iter()
            .filter(|(_, last)| !matches!(last, Some(at) if at.elapsed() < rotation_interval))
            .map(|(user_id, _)| user_id.clone())
            .collect();

        if due.is_empty() {
            tracing::debug!("identity key rotation check: nothing due");
            return None;
        }

        tracing::info!(users = due.len(), "identity key rotation due");
        let report = self.rotate_users(&due, false).await;
        if !report.is_complete() {
            tracing::warn!(
                failed = report.failed.len(),
                "some identity key rotations failed; retrying at next check"
            );
        }
        Some(report)
    }

    /// Rotate all managed users now, regardless of key age.
    pub async fn rotate_all_identity_keys(&self) -> RotationReport {
        let users = self.managed_users();
        tracing::info!(users = users.len(), "rotating identity keys for all users");
        self.rotate_users(&users, false).await
    }

    async fn rotate_users(&self, users: &[String], emergency: bool) -> RotationReport {
        let mut report = RotationReport::default();
        for user_id in users {
            match self.rotate_user(user_id, emergency).await {
                Ok(()) => report.rotated.push(user_id.clone()),
                Err(e) => {
                    tracing::error!(user_id = %user_id, error = %e, "identity key rotation failed");
                    report.failed.push((user_id.clone(), e));
                }
            }
        }
        report
    }

    /// Replace one user's identity key.
    ///
    /// The superseded key is invalidated after the new one is stored; an
    /// invalidation failure is logged but does not fail the rotation.
    pub async fn rotate_user_identity_key(&self, user_id: &str) -> Result<(), RotationError> {
        self.rotate_user(user_id, false).await
    }

    /// The new key is stored before anything is invalidated, so a failed
    /// store leaves the user's existing keys in place.
    async fn rotate_user(&self, user_id: &str, emergency: bool) -> Result<(), RotationError> {
        tracing::info!(user_id, "rotating identity key");

        let current = self
            .store
            .get_identity_key(user_id)
            .map_err(RotationError::Lookup)?;
        match &current {
            Some(key_pair) => self.check_compromise(user_id, key_pair),
            None => tracing::info!(user_id, "no existing identity key, creating one"),
        }

        let new_key = self
            .with_retry(user_id, "generate identity key", IdentityKeyPair::generate)
            .await
            .map_err(|source| RotationError::Generation {
                attempts: self.max_attempts,
                source,
            })?;
        let old_public = current.as_ref().map_or([0u8; 32], |key| *key.public_key());
        verify_identity_key_rotation(&old_public, new_key.public_key())
            .map_err(RotationError::InvalidKey)?;

        self.with_retry(user_id, "store identity key", || {
            self.store.store_identity_key(user_id, &new_key)
        })
        .await
        .map_err(|source| RotationError::Storage {
            attempts: self.max_attempts,
            source,
        })?;
        // Only the key just stored survives.
        if let Err(e) = self.store.invalidate_old_keys(user_id, true) {
            if emergency {
                return Err(RotationError::Invalidation(e));
            }
            tracing::warn!(user_id, error = %e, "failed to invalidate old identity keys");
        }

        if let Some(last) = self.users.lock().get_mut(user_id) {
            *last = Some(Instant::now());
        }
        self.schedule.write().last_rotation = Some(SystemTime::now());

        tracing::info!(
            user_id,
            key = %fingerprint(new_key.public_key()),
            "identity key rotated"
        );
        Ok(())
    }

    fn check_compromise(&self, user_id: &str, key_pair: &IdentityKeyPair) {
        match self.detector.is_key_compromised(user_id, key_pair) {
            Ok(true) => {
                tracing::error!(
                    user_id,
                    key = %fingerprint(key_pair.public_key()),
                    "identity key compromised, replacing"
                );
                if let Err(e) = self.detector.report_compromise(user_id, key_pair) {
                    tracing::warn!(user_id, error = %e, "failed to report key compromise");
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(user_id, error = %e, "compromise check failed, rotating anyway");
            }
        }
    }

    /// Run `op` up to `max_attempts` times with a fixed delay in between.
    async fn with_retry<T>(
        &self,
        user_id: &str,
        what: &str,
        mut op: impl FnMut() -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    tracing::warn!(user_id, attempt, error = %e, "{what} failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Rotate one user immediately, e.g. after a suspected compromise.
    pub async fn force_immediate_rotation(&self, user_id: &str) -> Result<(), RotationError> {
        if !self.is_enabled() {
            return Err(RotationError::Disabled);
        }
        tracing::warn!(user_id, "forcing immediate identity key rotation");
        self.rotate_user(user_id, false).await
    }

    /// Rotate every managed user and invalidate all of their previous keys,
    /// including the ones current until now.
    ///
    /// Unlike scheduled rotation, a user whose old keys could not be
    /// invalidated is reported as failed, even though the new key is stored.
    pub async fn force_emergency_rotation(&self) -> Result<RotationReport, RotationError> {
        if !self.is_enabled() {
            return Err(RotationError::Disabled);
        }
        let users = self.managed_users();
        tracing::error!(users = users.len(), "forcing emergency identity key rotation");
        let report = self.rotate_users(&users, true).await;
        tracing::warn!(
            rotated = report.rotated.len(),
            failed = report.failed.len(),
            "emergency identity key rotation finished"
        );
        Ok(report)
    }

    pub fn enable(&self) {
        self.schedule.write().enabled = true;
        tracing::info!("identity key rotation enabled");
    }

    /// Scheduled checks become no-ops and forced rotations are refused until
    /// [`enable`](Self::enable) is called.
    pub fn disable(&self) {
        self.schedule.write().enabled = false;
        tracing::info!("identity key rotation disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.schedule.read().enabled
    }

    /// Change the key age at which users are rotated. Takes effect at the
    /// next check. Values under 24 hours are raised to 24 hours.
    pub fn set_rotation_interval(&self, interval: Duration) {
        let interval = clamp_interval(interval, "rotation");
        self.schedule.write().rotation_interval = interval;
        tracing::info!(interval_secs = interval.as_secs(), "identity key rotation interval set");
    }

    pub fn status(&self) -> RotationStatus {
        let schedule = self.schedule.read();
        RotationStatus {
            enabled: schedule.enabled,
            rotation_interval: schedule.rotation_interval,
            check_interval: self.check_interval,
            last_rotation: schedule.last_rotation,
            managed_users: self.users.lock().len(),
        }
    }
}
