//! Redis Integration Tests
//!
//! Runs the cache client against a real server, focusing on:
//! - Text coercion and expiry
//! - Prefix deletes with glob metacharacters in the prefix
//! - FIFO queue semantics
//! - Error classification for type errors and unreachable servers
//!
//! These tests require a running Redis server. Set the environment variable
//! `STOWAGE_TEST_REDIS_URL` to enable these tests:
//!
//! ```bash
//! export STOWAGE_TEST_REDIS_URL="redis://localhost:6379/15"
//! cargo test --features redis redis_integration
//! ```

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::doc_markdown
)]
#![cfg(feature = "redis")]

use std::env;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use stowage::ErrorKind;
use stowage::config::{StoreKind, StoreSettings};
use stowage::storage::cache::{CacheClient, RedisConnector};

/// Environment variable for Redis test connection URL.
const REDIS_URL_ENV: &str = "STOWAGE_TEST_REDIS_URL";

/// Returns the Redis connection URL if available, or None to skip tests.
fn get_redis_url() -> Option<String> {
    env::var(REDIS_URL_ENV).ok()
}

/// Macro to skip tests when Redis is not available.
macro_rules! require_redis {
    () => {
        match get_redis_url() {
            Some(url) => url,
            None => {
                eprintln!(
                    "Skipping test: {} not set. Set this environment variable to run Redis tests.",
                    REDIS_URL_ENV
                );
                return;
            },
        }
    };
}

/// Returns a key prefix no other test run shares.
fn unique_prefix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos();
    format!("stowage_test:{}:{nanos}:", std::process::id())
}

fn connect(url: &str) -> CacheClient<RedisConnector> {
    let settings = StoreSettings::defaults_for(StoreKind::Cache).with_pool_size(1, 2);
    let connector = RedisConnector::from_url(url, &settings).unwrap();
    CacheClient::connect(connector, &settings).unwrap()
}

#[test]
fn test_set_get_round_trip_as_text() {
    let url = require_redis!();
    let client = connect(&url);
    let prefix = unique_prefix();
    let key = format!("{prefix}answer");

    client.set(&key, 42).unwrap();
    assert_eq!(client.get(&key).unwrap().as_deref(), Some("42"));
    assert!(client.exists(&key).unwrap());
    assert!(client.delete(&key).unwrap());
    assert_eq!(client.get(&key).unwrap(), None);
    client.disconnect();
}

#[test]
fn test_expiry() {
    let url = require_redis!();
    let client = connect(&url);
    let key = format!("{}short", unique_prefix());

    client
        .set_with_expiry(&key, "v", Duration::from_millis(100))
        .unwrap();
    assert!(client.exists(&key).unwrap());
    std::thread::sleep(Duration::from_millis(250));
    assert!(!client.exists(&key).unwrap());
    client.disconnect();
}

#[test]
fn test_delete_by_prefix_is_literal() {
    let url = require_redis!();
    let client = connect(&url);
    let prefix = unique_prefix();

    for suffix in ["a", "b", "c"] {
        client.set(&format!("{prefix}[x]*{suffix}"), suffix).unwrap();
    }
    // Would match the glob `[x]*` but not the literal prefix.
    let other = format!("{prefix}x-other");
    client.set(&other, "keep").unwrap();

    let removed = client.delete_by_prefix(&format!("{prefix}[x]*")).unwrap();
    assert_eq!(removed, 3);
    assert!(client.exists(&other).unwrap());
    client.delete_by_prefix(&prefix).unwrap();
    client.disconnect();
}

#[test]
fn test_queue_is_fifo() {
    let url = require_redis!();
    let client = connect(&url);
    let queue = format!("{}queue", unique_prefix());

    assert_eq!(client.push(&queue, "a").unwrap(), 1);
    assert_eq!(client.push(&queue, "b").unwrap(), 2);
    assert_eq!(client.fetch(&queue).unwrap().as_deref(), Some("a"));
    assert_eq!(client.fetch(&queue).unwrap().as_deref(), Some("b"));
    assert_eq!(client.fetch(&queue).unwrap(), None);
    client.disconnect();
}

#[test]
fn test_wrong_type_is_domain_error() {
    let url = require_redis!();
    let client = connect(&url);
    let key = format!("{}plain", unique_prefix());

    client.set(&key, "v").unwrap();
    let err = client.push(&key, "x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Domain);
    client.delete(&key).unwrap();
    client.disconnect();
}

#[test]
fn test_unreachable_server_fails_to_connect() {
    // Runs only alongside the other Redis tests so plain `cargo test` stays
    // offline.
    let _url = require_redis!();
    let mut settings = StoreSettings::defaults_for(StoreKind::Cache).with_address("127.0.0.1", 9);
    settings.connect_timeout = Duration::from_millis(200);
    let connector = RedisConnector::new(&settings).unwrap();
    let err = CacheClient::connect(connector, &settings).err().unwrap();
    assert!(err.is_transient());
}
