//! Session Registry
//!
//! Tracks pairing sessions and the billed, client-side metering sessions that
//! depend on them.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use coinmeter_common::{
    BillingConfig, CoinmeterError, DurationSource, EndReason, MeteringSession, PairingSession,
    ParticipantRole, Result, StoreError, UserId,
};

use crate::retry::{store_call, RetryPolicy};
use crate::store::SessionRepository;

pub struct SessionRegistry {
    store: Arc<dyn SessionRepository>,
    config: Arc<BillingConfig>,
    retry: RetryPolicy,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionRepository>, config: Arc<BillingConfig>) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            store,
            config,
            retry,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Open a metering session for a client joining `room_name`
    pub async fn start_metering(&self, user_id: UserId, room_name: &str) -> Result<MeteringSession> {
        self.start_metering_at(user_id, room_name, Utc::now()).await
    }

    #[instrument(skip(self))]
    pub async fn start_metering_at(
        &self,
        user_id: UserId,
        room_name: &str,
        now: DateTime<Utc>,
    ) -> Result<MeteringSession> {
        if room_name.trim().is_empty() {
            return Err(CoinmeterError::Validation("room_name is required".into()));
        }

        let mut session = MeteringSession::start(user_id, room_name, now);
        if let Some(pairing) = self.find_active_pairing(room_name, user_id).await? {
            if pairing.client_user_id == user_id {
                session = session.with_model(pairing.model_user_id);
            }
        }

        let store = &self.store;
        let session_ref = &session;
        self.call("insert_metering", move || store.insert_metering(session_ref))
            .await?;

        info!(
            session_id = %session.id,
            user_id = %user_id,
            room_name,
            "Metering started"
        );
        Ok(session)
    }

    /// End a metering session; `None` when it had already ended
    pub async fn end_metering(
        &self,
        session_id: Uuid,
        reason: EndReason,
    ) -> Result<Option<MeteringSession>> {
        self.end_metering_at(session_id, reason, Utc::now()).await
    }

    #[instrument(skip(self))]
    pub async fn end_metering_at(
        &self,
        session_id: Uuid,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> Result<Option<MeteringSession>> {
        let store = &self.store;
        let ended = self
            .call("end_metering", move || store.end_metering(session_id, reason, now))
            .await
            .map_err(|err| match err {
                CoinmeterError::Store(StoreError::NotFound(_)) => {
                    CoinmeterError::SessionNotFound(session_id)
                }
                other => other,
            })?;

        if let Some(session) = &ended {
            info!(
                session_id = %session_id,
                user_id = %session.user_id,
                reason = %reason,
                total_consumed = session.total_consumed,
                "Metering ended"
            );
        }
        Ok(ended)
    }

    pub async fn get(&self, session_id: Uuid) -> Result<MeteringSession> {
        let store = &self.store;
        self.call("get_metering", move || store.get_metering(session_id))
            .await?
            .ok_or(CoinmeterError::SessionNotFound(session_id))
    }

    pub async fn find_active_pairing(
        &self,
        room_name: &str,
        user_id: UserId,
    ) -> Result<Option<PairingSession>> {
        let store = &self.store;
        self.call("find_active_pairing", move || {
            store.find_active_pairing(room_name, user_id)
        })
        .await
    }

    pub async fn latest_pairing(&self, room_name: &str) -> Result<Option<PairingSession>> {
        let store = &self.store;
        self.call("latest_pairing", move || store.latest_pairing(room_name))
            .await
    }

    /// Record pairing state reported by the signaling layer
    pub async fn upsert_pairing(&self, pairing: &PairingSession) -> Result<()> {
        let store = &self.store;
        self.call("upsert_pairing", move || store.upsert_pairing(pairing))
            .await
    }

    /// Cache the model on a metering session
    pub async fn remember_model(&self, session_id: Uuid, model_user_id: UserId) -> Result<()> {
        let store = &self.store;
        self.call("set_model", move || store.set_model(session_id, model_user_id))
            .await
    }

    /// Active client sessions still inside the staleness cap
    pub async fn billable_sessions(&self, now: DateTime<Utc>) -> Result<Vec<MeteringSession>> {
        let cap = self.config.stale_session_cap();
        Ok(self
            .active_sessions()
            .await?
            .into_iter()
            .filter(|s| s.role == ParticipantRole::Client && !s.is_stale(now, cap))
            .collect())
    }

    /// Active sessions older than the staleness cap
    pub async fn stale_sessions(&self, now: DateTime<Utc>) -> Result<Vec<MeteringSession>> {
        let cap = self.config.stale_session_cap();
        Ok(self
            .active_sessions()
            .await?
            .into_iter()
            .filter(|s| s.is_stale(now, cap))
            .collect())
    }

    /// Force-end every session older than the staleness cap
    ///
    /// Returns the sessions this call ended.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<MeteringSession>> {
        let mut expired = Vec::new();

        for session in self.stale_sessions(now).await? {
            warn!(
                session_id = %session.id,
                user_id = %session.user_id,
                age_secs = session.age(now).num_seconds(),
                "Metering session exceeded staleness cap"
            );
            if let Some(ended) = self
                .end_metering_at(session.id, EndReason::SessionTimeout, now)
                .await?
            {
                expired.push(ended);
            }
        }
        Ok(expired)
    }

    /// Active sessions whose pairing never became active within the grace period
    pub async fn orphaned_sessions(&self, now: DateTime<Utc>) -> Result<Vec<MeteringSession>> {
        let grace = self.config.orphan_grace();
        let mut orphaned = Vec::new();

        for session in self.active_sessions().await? {
            if session.age(now) <= grace {
                continue;
            }
            let never_activated = match self.latest_pairing(&session.room_name).await? {
                None => true,
                Some(pairing) => pairing.activated_at.is_none(),
            };
            if never_activated {
                orphaned.push(session);
            }
        }
        Ok(orphaned)
    }

    /// Ended sessions since `since`, oldest first
    pub async fn ended_since(&self, since: DateTime<Utc>) -> Result<Vec<MeteringSession>> {
        let store = &self.store;
        self.call("ended_metering_since", move || store.ended_metering_since(since))
            .await
    }

    /// Manual duration override; permanently authoritative
    #[instrument(skip(self))]
    pub async fn set_manual_duration(&self, session_id: Uuid, seconds: u64) -> Result<()> {
        let store = &self.store;
        self.call("set_manual_duration", move || {
            store.set_manual_duration(session_id, seconds)
        })
        .await?;
        info!(session_id = %session_id, seconds, "Manual duration recorded");
        Ok(())
    }

    /// Persist a computed duration unless one is already stored
    ///
    /// Returns the value that is authoritative after the call.
    pub async fn persist_duration(
        &self,
        session_id: Uuid,
        seconds: u64,
        source: DurationSource,
    ) -> Result<u64> {
        let store = &self.store;
        self.call("set_duration_if_absent", move || {
            store.set_duration_if_absent(session_id, seconds, source)
        })
        .await
    }

    async fn active_sessions(&self) -> Result<Vec<MeteringSession>> {
        let store = &self.store;
        self.call("active_metering", move || store.active_metering())
            .await
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        store_call(&self.retry, operation, op).await
    }
}
