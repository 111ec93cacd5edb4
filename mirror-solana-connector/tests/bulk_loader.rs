mod support;

use mirror_solana_connector::{
    bulk_loader::BulkAccountLoader, config::LoaderConfig, LoaderError, RawObservation,
};
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use support::{encode, init_tracing, key, MockRpc};
use tokio::time::sleep;

type Seen = Arc<Mutex<HashMap<Pubkey, Vec<RawObservation>>>>;

fn loader(rpc: &Arc<MockRpc>, chunk_size: usize) -> BulkAccountLoader {
    let config = LoaderConfig {
        chunk_size,
        max_concurrent_chunks: 2,
        ..LoaderConfig::default()
    };
    BulkAccountLoader::new(rpc.clone(), CommitmentLevel::Confirmed, &config)
}

fn watch_all(loader: &BulkAccountLoader, keys: &[Pubkey]) -> Seen {
    let seen: Seen = Arc::default();
    for key in keys {
        let sink = seen.clone();
        let key = *key;
        loader.add_account(
            key,
            Arc::new(move |observation: &RawObservation| {
                sink.lock()
                    .unwrap()
                    .entry(key)
                    .or_default()
                    .push(observation.clone());
            }),
        );
    }
    seen
}

fn total_callbacks(seen: &Seen) -> usize {
    seen.lock().unwrap().values().map(Vec::len).sum()
}

#[tokio::test]
async fn test_load_issues_one_read_per_chunk() {
    init_tracing();
    let rpc = MockRpc::new();
    let keys: Vec<Pubkey> = (1..=7).map(key).collect();
    for (i, key) in keys.iter().enumerate() {
        rpc.set_account(*key, Some(i as u64), 50);
    }
    let loader = loader(&rpc, 3);
    let seen = watch_all(&loader, &keys);

    loader.load().await;

    // ceil(7 / 3) batched reads.
    assert_eq!(rpc.multiple_calls(), 3);
    let mut sizes = rpc.batch_sizes();
    sizes.sort();
    assert_eq!(sizes, vec![1, 3, 3]);
    assert_eq!(total_callbacks(&seen), 7);
    assert_eq!(loader.most_recent_slot(), 50);
    assert_eq!(
        loader.get_buffer_and_slot(&keys[2]),
        Some(RawObservation::new(Some(encode(2)), 50))
    );
}

#[tokio::test]
async fn test_unchanged_keys_do_not_fire_again() {
    init_tracing();
    let rpc = MockRpc::new();
    let keys = [key(1), key(2)];
    rpc.set_account(keys[0], Some(1), 10);
    rpc.set_account(keys[1], Some(2), 10);
    let loader = loader(&rpc, 99);
    let seen = watch_all(&loader, &keys);

    loader.load().await;
    assert_eq!(total_callbacks(&seen), 2);

    // The response slot advances but only the first key's bytes change.
    rpc.set_account(keys[0], Some(10), 11);
    loader.load().await;
    loader.load().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen[&keys[0]].len(), 2);
    assert_eq!(seen[&keys[0]][1].slot, 11);
    assert_eq!(seen[&keys[1]].len(), 1);
}

#[tokio::test]
async fn test_failed_chunk_does_not_block_others() {
    init_tracing();
    let rpc = MockRpc::new();
    let keys: Vec<Pubkey> = (1..=4).map(key).collect();
    for key in &keys {
        rpc.set_account(*key, Some(7), 10);
    }
    let loader = loader(&rpc, 2);
    let seen = watch_all(&loader, &keys);
    let errors: Arc<Mutex<Vec<LoaderError>>> = Arc::default();
    let sink = errors.clone();
    let error_id = loader.add_error_callback(Arc::new(move |error: &LoaderError| {
        sink.lock().unwrap().push(error.clone());
    }));

    rpc.fail_chunk_containing(Some(keys[0]));
    loader.load().await;

    {
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].keys, vec![keys[0], keys[1]]);
    }
    let fired: Vec<Pubkey> = {
        let mut fired: Vec<Pubkey> = seen.lock().unwrap().keys().copied().collect();
        fired.sort();
        fired
    };
    assert_eq!(fired, vec![keys[2], keys[3]]);

    // The failed chunk is retried on the next cycle.
    rpc.fail_chunk_containing(None);
    loader.remove_error_callback(error_id);
    loader.load().await;
    assert_eq!(total_callbacks(&seen), 4);
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_load_is_not_reentrant() {
    init_tracing();
    let rpc = MockRpc::new();
    let keys: Vec<Pubkey> = (1..=5).map(key).collect();
    for key in &keys {
        rpc.set_account(*key, Some(1), 10);
    }
    let loader = loader(&rpc, 5);
    watch_all(&loader, &keys);
    rpc.delay_batches(Some(Duration::from_millis(100)));

    tokio::join!(loader.load(), loader.load(), loader.load());
    assert_eq!(rpc.multiple_calls(), 1);

    loader.load().await;
    assert_eq!(rpc.multiple_calls(), 2);
}

#[tokio::test]
async fn test_remove_account_is_idempotent() {
    init_tracing();
    let rpc = MockRpc::new();
    let loader = loader(&rpc, 99);
    let account = key(1);
    let first = loader.add_account(account, Arc::new(|_: &RawObservation| {}));
    let second = loader.add_account(account, Arc::new(|_: &RawObservation| {}));

    loader.remove_account(&account, first);
    loader.remove_account(&account, first);
    assert_eq!(loader.watched_keys(), vec![account]);

    loader.remove_account(&account, second);
    assert!(loader.watched_keys().is_empty());
    loader.remove_account(&account, second);

    loader.load().await;
    assert_eq!(rpc.multiple_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_polling_frequency_can_change() {
    init_tracing();
    let rpc = MockRpc::new();
    let account = key(1);
    rpc.set_account(account, Some(1), 10);
    let loader = loader(&rpc, 99);
    watch_all(&loader, &[account]);

    loader.start_polling();
    loader.start_polling();
    sleep(Duration::from_millis(2500)).await;
    assert_eq!(rpc.multiple_calls(), 2);

    loader.update_polling_frequency(Duration::from_millis(100));
    assert_eq!(loader.polling_frequency(), Duration::from_millis(100));
    sleep(Duration::from_millis(550)).await;
    assert_eq!(rpc.multiple_calls(), 7);

    loader.stop_polling();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(rpc.multiple_calls(), 7);
}

#[tokio::test]
async fn test_fetch_account_reads_directly() -> anyhow::Result<()> {
    init_tracing();
    let rpc = MockRpc::new();
    let account = key(9);
    rpc.set_account(account, Some(3), 44);
    let loader = loader(&rpc, 99);

    let observation = loader.fetch_account(&account).await?;
    assert_eq!(observation, RawObservation::new(Some(encode(3)), 44));
    assert_eq!(rpc.multiple_calls(), 0);
    Ok(())
}
