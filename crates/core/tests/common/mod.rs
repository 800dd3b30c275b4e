//! Shared harness for the multi-client integration tests.
//!
//! Every client talks to the same in-memory sequencer. Nothing here syncs
//! implicitly: tests call [`sync`] wherever a client should catch up with
//! the merged branch before it is inspected.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use treesync_core::config::SyncConfig;
use treesync_core::models::ClientId;
use treesync_core::sequencer::MemorySequencer;
use treesync_core::sync_engine::SyncEngine;

pub fn config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.resolver.retry_backoff_ms = 1;
    config.sequencer.timeout_ms = 5_000;
    config
}

/// Check out one client per name against a fresh sequencer.
pub async fn users(names: &[&str]) -> (Arc<MemorySequencer>, Vec<Arc<SyncEngine>>) {
    users_with(names, config()).await
}

pub async fn users_with(
    names: &[&str],
    config: SyncConfig,
) -> (Arc<MemorySequencer>, Vec<Arc<SyncEngine>>) {
    let sequencer = Arc::new(MemorySequencer::new());
    let mut clients = Vec::new();
    for name in names {
        let client = SyncEngine::checkout(ClientId::new(*name), sequencer.clone(), config.clone())
            .await
            .expect("checkout failed");
        clients.push(Arc::new(client));
    }
    (sequencer, clients)
}

pub async fn sync(client: &SyncEngine) {
    client.sync_from_server().await.expect("sync_from_server failed");
}

/// Directory listing as `name -> FILE|DIR|SYM|EXEC`.
pub fn lsdir(client: &SyncEngine, path: &str) -> BTreeMap<String, String> {
    client
        .list_dir(path)
        .unwrap_or_else(|e| panic!("{}: lsdir {:?} failed: {}", client.client(), path, e))
        .into_iter()
        .map(|entry| (entry.name, entry.entry_type.to_string()))
        .collect()
}

pub fn assert_dir(client: &SyncEngine, path: &str, expected: &[(&str, &str)]) {
    let expected: BTreeMap<String, String> = expected
        .iter()
        .map(|(name, kind)| (name.to_string(), kind.to_string()))
        .collect();
    assert_eq!(
        lsdir(client, path),
        expected,
        "{}: unexpected listing of {:?}",
        client.client(),
        path
    );
}

pub fn assert_read(client: &SyncEngine, path: &str, expected: &[u8]) {
    let data = client
        .read(path)
        .unwrap_or_else(|e| panic!("{}: read {:?} failed: {}", client.client(), path, e));
    assert!(
        data == expected,
        "{}: {:?} holds {:?}, expected {:?}",
        client.client(),
        path,
        String::from_utf8_lossy(&data),
        String::from_utf8_lossy(expected)
    );
}

pub fn assert_missing(client: &SyncEngine, path: &str) {
    assert!(
        client.lookup(path).is_err(),
        "{}: {:?} should not exist",
        client.client(),
        path
    );
}
