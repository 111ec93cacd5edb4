use super::{
    shared::SubscriberCore, AccountEvent, AccountSubscriber, OnChange, SubscriptionState,
};
use crate::{
    bulk_loader::{BulkAccountLoader, CallbackId},
    decode::SharedDecoder,
    error::{LoaderError, SyncError, SyncResult},
    observation::{RawObservation, VersionedValue},
    observer::{Listener, ListenerId},
    util::lock,
};
use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy)]
struct Registration {
    key: Pubkey,
    account: CallbackId,
    errors: CallbackId,
}

/// Subscriber that rides a shared [`BulkAccountLoader`].
///
/// Subscribing registers the key with the loader and makes sure the loader is
/// polling; the loader's dedup and this subscriber's dedup apply the same rule, so
/// a key shared by several subscribers is decoded once per change by each.
pub struct PollingAccountSubscriber<T> {
    core: Arc<SubscriberCore<T>>,
    loader: BulkAccountLoader,
    registration: Mutex<Option<Registration>>,
}

impl<T> PollingAccountSubscriber<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(key: Pubkey, decoder: SharedDecoder<T>, loader: BulkAccountLoader) -> Self {
        Self {
            core: SubscriberCore::new(key, decoder),
            loader,
            registration: Mutex::new(None),
        }
    }

    pub fn loader(&self) -> &BulkAccountLoader {
        &self.loader
    }
}

impl<T> PollingAccountSubscriber<T> {
    fn release(&self) {
        if let Some(registration) = lock(&self.registration).take() {
            self.loader
                .remove_account(&registration.key, registration.account);
            self.loader.remove_error_callback(registration.errors);
        }
    }
}

#[async_trait]
impl<T> AccountSubscriber<T> for PollingAccountSubscriber<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn key(&self) -> &Pubkey {
        self.core.key()
    }

    async fn subscribe(&self, on_change: OnChange<T>) -> SyncResult<()> {
        let Some(generation) = self.core.begin_subscribe(on_change) else {
            return Ok(());
        };
        let key = *self.core.key();

        if !self.core.has_observation() {
            match self.loader.fetch_account(&key).await {
                Ok(observation) => {
                    self.core.ingest(generation, observation);
                }
                Err(e) => {
                    tracing::warn!(%key, "Initial fetch failed: {}", e);
                    self.core.abort_subscribe(generation);
                    return Err(e);
                }
            }
        }

        if !self.core.is_current(generation) {
            return Err(SyncError::Cancelled);
        }

        let core = self.core.clone();
        let account = self.loader.add_account(
            key,
            Arc::new(move |observation: &RawObservation| {
                core.ingest(generation, observation.clone());
            }),
        );
        let core = self.core.clone();
        let errors = self
            .loader
            .add_error_callback(Arc::new(move |error: &LoaderError| {
                if error.keys.contains(&key) {
                    core.report_error(generation, error.clone().into());
                }
            }));
        let registration = Registration {
            key,
            account,
            errors,
        };
        if let Some(stale) = lock(&self.registration).replace(registration) {
            self.loader.remove_account(&key, stale.account);
            self.loader.remove_error_callback(stale.errors);
        }

        self.loader.start_polling();
        tracing::info!(%key, "Polling subscription registered");
        Ok(())
    }

    async fn fetch(&self) -> SyncResult<()> {
        let observation = self.loader.fetch_account(self.core.key()).await?;
        self.core.apply_fetched(observation);
        Ok(())
    }

    async fn unsubscribe(&self) {
        let was_live = self.core.begin_unsubscribe();
        self.release();
        self.core.finish_unsubscribe();
        if was_live {
            tracing::info!(key = %self.core.key(), "Polling subscription removed");
        }
    }

    fn current(&self) -> Option<VersionedValue<T>> {
        self.core.current()
    }

    fn assert_active(&self) -> SyncResult<()> {
        self.core.assert_active()
    }

    fn state(&self) -> SubscriptionState {
        self.core.state()
    }

    fn add_listener(&self, listener: Listener<AccountEvent>) -> ListenerId {
        self.core.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.core.remove_listener(id)
    }
}

impl<T> Drop for PollingAccountSubscriber<T> {
    fn drop(&mut self) {
        self.release();
    }
}
