use super::{
    shared::SubscriberCore, AccountEvent, AccountSubscriber, OnChange, SubscriptionState,
};
use crate::{
    decode::SharedDecoder,
    error::{SyncError, SyncResult},
    observation::VersionedValue,
    observer::{Listener, ListenerId},
    transport::AccountRpc,
};
use async_trait::async_trait;
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};
use std::sync::Arc;

/// Subscriber without a live transport: it reads on `subscribe` and on every
/// `fetch`, and callers decide when to refresh.
pub struct OneShotAccountSubscriber<T> {
    core: Arc<SubscriberCore<T>>,
    rpc: Arc<dyn AccountRpc>,
    commitment: CommitmentLevel,
}

impl<T> OneShotAccountSubscriber<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        key: Pubkey,
        decoder: SharedDecoder<T>,
        rpc: Arc<dyn AccountRpc>,
        commitment: CommitmentLevel,
    ) -> Self {
        Self {
            core: SubscriberCore::new(key, decoder),
            rpc,
            commitment,
        }
    }
}

#[async_trait]
impl<T> AccountSubscriber<T> for OneShotAccountSubscriber<T>
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
        match self.rpc.get_account(self.core.key(), self.commitment).await {
            Ok(observation) => {
                self.core.ingest(generation, observation);
            }
            Err(e) => {
                self.core.abort_subscribe(generation);
                return Err(e.into());
            }
        }
        if self.core.is_current(generation) {
            Ok(())
        } else {
            Err(SyncError::Cancelled)
        }
    }

    async fn fetch(&self) -> SyncResult<()> {
        let observation = self.rpc.get_account(self.core.key(), self.commitment).await?;
        self.core.apply_fetched(observation);
        Ok(())
    }

    async fn unsubscribe(&self) {
        self.core.begin_unsubscribe();
        self.core.finish_unsubscribe();
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
