use chrono::Utc;
use meshcord::meshtastic::MessageKey;
use meshcord::storage::DedupStore;
use std::time::Duration;
use tempfile::TempDir;

fn key(seq: u32) -> MessageKey {
    MessageKey {
        node_id: 0x12345678,
        sequence_id: seq,
    }
}

#[test]
fn was_seen_is_false_until_recorded_then_sticky() {
    let dir = TempDir::new().unwrap();
    let store = DedupStore::open(dir.path()).unwrap();
    for seq in [0, 1, u32::MAX] {
        assert!(!store.was_seen(&key(seq), "RadioA").unwrap());
        assert!(store.record(&key(seq), "RadioA", Utc::now()).unwrap());
        assert!(store.was_seen(&key(seq), "RadioA").unwrap());
        for _ in 0..3 {
            assert!(!store.record(&key(seq), "RadioA", Utc::now()).unwrap());
            assert!(store.was_seen(&key(seq), "RadioA").unwrap());
        }
    }
}

#[test]
fn young_records_survive_restart_and_sweep() {
    let dir = TempDir::new().unwrap();
    {
        let store = DedupStore::open(dir.path()).unwrap();
        store.record(&key(1), "RadioA", Utc::now()).unwrap();
        store.upsert_node_identity(0x12345678, "N1", "Node One").unwrap();
        store.close().unwrap();
    }
    let store = DedupStore::open(dir.path()).unwrap();
    assert_eq!(store.purge_older_than(Duration::from_secs(24 * 3600)).unwrap(), 0);
    assert!(store.was_seen(&key(1), "RadioA").unwrap());
    assert_eq!(store.lookup_node_label(0x12345678).unwrap(), "N1 (12345678)");
}

#[test]
fn old_records_are_gone_after_sweep() {
    let dir = TempDir::new().unwrap();
    let store = DedupStore::open(dir.path()).unwrap();
    store.record(&key(1), "RadioA", Utc::now()).unwrap();
    store.record(&key(2), "RadioB", Utc::now()).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    // A zero-length window makes every existing record "older than retention".
    assert_eq!(store.purge_older_than(Duration::ZERO).unwrap(), 2);
    assert!(!store.was_seen(&key(1), "RadioA").unwrap());
    assert!(!store.was_seen(&key(2), "RadioB").unwrap());
    // Identity tables are not part of the sweep.
    let stats = store.stats().unwrap();
    assert_eq!(stats.processed_messages, 0);
}

#[test]
fn stats_report_table_sizes() {
    let dir = TempDir::new().unwrap();
    let store = DedupStore::open(dir.path()).unwrap();
    store.record(&key(1), "RadioA", Utc::now()).unwrap();
    store.upsert_node_identity(1, "A", "").unwrap();
    store.upsert_node_identity(2, "B", "").unwrap();
    store.upsert_radio_identity("RadioA", 1, "A").unwrap();
    let stats = store.stats().unwrap();
    assert_eq!(stats.processed_messages, 1);
    assert_eq!(stats.node_identities, 2);
    assert_eq!(stats.radio_identities, 1);
    assert!(stats.oldest_record.is_some());
    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["processed_messages"], 1);
}
