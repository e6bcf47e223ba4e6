//! End-to-end protocol scenarios over the in-memory store: single-flight
//! election, dead-holder recovery, explicit release, hit path, connection
//! reset, and deadlines.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cache_aside::{Client, Error, MemoryBackend, MemoryStore, Store, CLIENT_ID_PREFIX};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn coordinator(backend: &Arc<MemoryBackend>, client_ttl: Duration) -> Client<MemoryStore> {
    let (store, invalidations) = backend.connect();
    Client::with_store(store, invalidations, client_ttl)
}

#[tokio::test]
async fn single_flight_across_two_clients() {
    init_tracing();
    let backend = MemoryBackend::new();
    let c1 = Arc::new(coordinator(&backend, Duration::from_secs(10)));
    let c2 = Arc::new(coordinator(&backend, Duration::from_secs(10)));
    let calls = Arc::new(AtomicUsize::new(0));

    let run = |client: Arc<Client<MemoryStore>>| {
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            client
                .get(Duration::from_secs(2), "k", move |_key| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok("V".to_string())
                    }
                })
                .await
        })
    };

    let first = run(c1);
    let second = run(c2);
    assert_eq!(first.await.unwrap().unwrap(), "V");
    assert_eq!(second.await.unwrap().unwrap(), "V");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_misses_on_one_client_coalesce() {
    init_tracing();
    let backend = MemoryBackend::new();
    let client = Arc::new(coordinator(&backend, Duration::from_secs(10)));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let client = Arc::clone(&client);
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            client
                .get(Duration::from_secs(2), "k", move |_key| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok("V".to_string())
                    }
                })
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "V");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hit_path_serves_locally_without_loader() {
    init_tracing();
    let backend = MemoryBackend::new();
    let client = coordinator(&backend, Duration::from_secs(10));

    let value = client
        .get(Duration::from_secs(2), "k", |_key| async move {
            Ok("V".to_string())
        })
        .await
        .unwrap();
    assert_eq!(value, "V");

    // Let the pump settle the invalidation from our own placeholder write.
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Populated: the loader must not run again.
    let value = client
        .get(Duration::from_secs(2), "k", |_key| async move {
            unreachable!("loader must not run on a populated key")
        })
        .await
        .unwrap();
    assert_eq!(value, "V");

    // And once locally cached, the store is not contacted at all.
    let reads = backend.server_reads();
    let value = client
        .get(Duration::from_secs(2), "k", |_key| async move {
            unreachable!("loader must not run on a cached key")
        })
        .await
        .unwrap();
    assert_eq!(value, "V");
    assert_eq!(backend.server_reads(), reads);
}

#[tokio::test]
async fn del_then_get_reinvokes_loader() {
    init_tracing();
    let backend = MemoryBackend::new();
    let client = coordinator(&backend, Duration::from_secs(10));

    let value = client
        .get(Duration::from_secs(2), "k", |_key| async move {
            Ok("V1".to_string())
        })
        .await
        .unwrap();
    assert_eq!(value, "V1");

    client.del("k").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let value = client
        .get(Duration::from_secs(2), "k", |_key| async move {
            Ok("V2".to_string())
        })
        .await
        .unwrap();
    assert_eq!(value, "V2");
}

#[tokio::test]
async fn loader_error_releases_lock_for_waiters() {
    init_tracing();
    let backend = MemoryBackend::new();
    let c1 = Arc::new(coordinator(&backend, Duration::from_secs(10)));
    let c2 = Arc::new(coordinator(&backend, Duration::from_secs(10)));

    let failing = tokio::spawn({
        let c1 = Arc::clone(&c1);
        async move {
            c1.get(Duration::from_secs(2), "k", |_key| async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Err::<String, anyhow::Error>(anyhow::anyhow!("backend outage"))
            })
            .await
        }
    });

    // Give c1 time to take the lock, then join as a waiter.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let value = c2
        .get(Duration::from_secs(2), "k", |_key| async move {
            Ok("V2".to_string())
        })
        .await
        .unwrap();
    assert_eq!(value, "V2");

    let err = failing.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Loader(_)));
}

#[tokio::test]
async fn dead_holder_is_reclaimed() {
    init_tracing();
    let backend = MemoryBackend::new();
    let (raw, _invalidations) = backend.connect();

    // A holder that died without cleanup: its placeholder is in the key and
    // its liveness marker is about to lapse with nobody refreshing it.
    let dead = format!("{CLIENT_ID_PREFIX}01JDEADHOLDER0000000000000");
    raw.set_px(&dead, "", Duration::from_millis(150)).await.unwrap();
    raw.set_px("k", &dead, Duration::from_secs(5)).await.unwrap();

    let client = coordinator(&backend, Duration::from_secs(10));
    let started = Instant::now();
    let value = client
        .get(Duration::from_secs(2), "k", |_key| async move {
            Ok("V".to_string())
        })
        .await
        .unwrap();
    assert_eq!(value, "V");
    // We must have waited for the marker to lapse, not skipped the holder.
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn connection_reset_wakes_all_waiters() {
    init_tracing();
    let backend = MemoryBackend::new();
    let (raw, _invalidations) = backend.connect();

    // Two keys locked by a stale holder whose marker lapses later.
    let holder = format!("{CLIENT_ID_PREFIX}01JSTALEHOLDER000000000000");
    raw.set_px(&holder, "", Duration::from_millis(400)).await.unwrap();
    raw.set_px("k1", &holder, Duration::from_secs(5)).await.unwrap();
    raw.set_px("k2", &holder, Duration::from_secs(5)).await.unwrap();

    let client = Arc::new(coordinator(&backend, Duration::from_secs(10)));

    // Establish a client id so the reset has a marker to clear.
    client
        .get(Duration::from_secs(1), "warm", |_key| async move {
            Ok("w".to_string())
        })
        .await
        .unwrap();
    let old_markers: Vec<String> = backend
        .live_keys()
        .into_iter()
        .filter(|k| k.starts_with(CLIENT_ID_PREFIX) && *k != holder)
        .collect();
    assert_eq!(old_markers.len(), 1);

    let spawn_get = |key: &'static str, value: &'static str| {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .get(Duration::from_secs(2), key, move |_key| async move {
                    Ok(value.to_string())
                })
                .await
        })
    };
    let g1 = spawn_get("k1", "v1");
    let g2 = spawn_get("k2", "v2");

    // Both are parked in the wait path when the connection-level
    // invalidation arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;
    backend.reset();

    assert_eq!(g1.await.unwrap().unwrap(), "v1");
    assert_eq!(g2.await.unwrap().unwrap(), "v2");

    // The reset dropped the old id; repopulation allocated a fresh marker.
    assert!(!backend.contains(&old_markers[0]));
}

#[tokio::test]
async fn deadline_is_honoured_while_holder_lives() {
    init_tracing();
    let backend = MemoryBackend::new();
    let (raw, _invalidations) = backend.connect();

    let holder = format!("{CLIENT_ID_PREFIX}01JLIVEHOLDER0000000000000");
    raw.set_px(&holder, "", Duration::from_secs(10)).await.unwrap();
    raw.set_px("k", &holder, Duration::from_secs(10)).await.unwrap();

    let client = coordinator(&backend, Duration::from_secs(10));
    let started = Instant::now();
    let err = client
        .get(Duration::from_millis(50), "k", |_key| async move {
            Ok("V".to_string())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn get_existing_misses_and_hits() {
    init_tracing();
    let backend = MemoryBackend::new();
    let client = coordinator(&backend, Duration::from_secs(10));

    let err = client
        .get_existing(Duration::from_millis(200), "k")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound));

    client
        .get(Duration::from_secs(2), "k", |_key| async move {
            Ok("V".to_string())
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let value = client
        .get_existing(Duration::from_millis(200), "k")
        .await
        .unwrap();
    assert_eq!(value, "V");
}

#[tokio::test]
async fn cancelled_populate_releases_the_lock() {
    init_tracing();
    let backend = MemoryBackend::new();
    let c1 = Arc::new(coordinator(&backend, Duration::from_secs(10)));

    let slow = tokio::spawn({
        let c1 = Arc::clone(&c1);
        async move {
            c1.get(Duration::from_secs(5), "k", |_key| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok("never".to_string())
            })
            .await
        }
    });

    // Let it take the lock, then cancel it mid-load.
    tokio::time::sleep(Duration::from_millis(50)).await;
    slow.abort();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The lock guard released the placeholder, so a fresh client populates
    // immediately instead of waiting out the key TTL.
    let c2 = coordinator(&backend, Duration::from_secs(10));
    let value = c2
        .get(Duration::from_secs(1), "k", |_key| async move {
            Ok("V".to_string())
        })
        .await
        .unwrap();
    assert_eq!(value, "V");
}
