//! End-to-end tests for recording, auto-swap and retention on a real cache tree.

use chainreplay_cache::{
    Batch, CacheConfig, Error, Mode, Pruner, Recorder, RetentionFilter, normalize_batches,
};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;

fn identity() -> Value {
    json!({"contracts": ["0xabc", "0xdef"], "finality": 12, "version": "v3"})
}

fn config(root: &std::path::Path) -> CacheConfig {
    let mut cfg = CacheConfig::new(root).with_mode(Mode::Record);
    cfg.auto_use = true;
    cfg.require_full_coverage = true;
    cfg
}

fn raw_batches(range: std::ops::RangeInclusive<u64>) -> Vec<Value> {
    range
        .map(|h| {
            json!({
                "header": {"number": format!("0x{h:x}"), "hash": format!("0xhash{h}"), "timestamp": 1_700_000_000 + h},
                "logs": [{
                    "address": "0xabc",
                    "data": "0x",
                    "topics": ["0xddf252ad"],
                    "txHash": format!("0xtx{h}"),
                    "index": 0,
                    "transactionIndex": "1"
                }],
                "transactions": [{"hash": format!("0xtx{h}"), "from": "0x1"}]
            })
        })
        .collect()
}

fn live(range: std::ops::RangeInclusive<u64>) -> Vec<Batch> {
    normalize_batches(
        &range
            .map(|h| json!({"height": h, "hash": "live"}))
            .collect::<Vec<_>>(),
    )
    .unwrap()
}

fn heights(batches: &[Batch]) -> Vec<u64> {
    batches.iter().map(Batch::height).collect()
}

fn at(date: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&format!("{date}T08:00:00Z"))
        .unwrap()
        .with_timezone(&Utc)
}

// =============================================================================
// Recording
// =============================================================================

#[test]
fn sequential_records_grow_the_manifest() {
    let tmp = TempDir::new().unwrap();
    let rec = Recorder::new(&config(tmp.path()), "dex", "mainnet", &identity()).unwrap();

    for i in 0..10u64 {
        let lo = 100 - i * 10;
        rec.record_batch(&raw_batches(lo..=lo + 9)).unwrap().unwrap();
        assert_eq!(rec.list_replay_files().unwrap().len(), usize::try_from(i + 1).unwrap());
    }

    let files = rec.list_replay_files().unwrap();
    assert!(files.windows(2).all(|w| w[0].min_block <= w[1].min_block));
    assert!(files.iter().all(|f| f.path.starts_with(tmp.path())));
    assert!(files.iter().all(|f| f.path.is_file()));
}

#[test]
fn recorded_file_round_trips_normalized_batches() {
    let tmp = TempDir::new().unwrap();
    let rec = Recorder::new(&config(tmp.path()), "dex", "mainnet", &identity()).unwrap();
    let raw = raw_batches(5..=7);
    rec.record_batch(&raw).unwrap();

    let file = rec.list_replay_files().unwrap().remove(0);
    let mut reader = rec.read_file(&file.path).unwrap();
    assert!(reader.header().is_none(), "recorder reads skip the header");
    let group = reader.next().unwrap().unwrap();
    assert!(reader.next().is_none(), "whole file is a single group");

    assert_eq!(group, normalize_batches(&raw).unwrap());
    assert_eq!(group[0].logs[0].transaction_hash, "0xtx5");
    assert_eq!(group[0].logs[0].block_number, 5);
    assert_eq!(group[0].logs[0].transaction_index, 1);
}

#[test]
fn same_range_rerecorded_replaces_entry() {
    let tmp = TempDir::new().unwrap();
    let rec = Recorder::new(&config(tmp.path()), "dex", "mainnet", &identity()).unwrap();
    let when = at("2024-06-01");
    let batches = normalize_batches(&raw_batches(1..=3)).unwrap();

    rec.record_batches_at(batches.clone(), when).unwrap();
    rec.record_batches_at(batches, when).unwrap();
    assert_eq!(rec.list_replay_files().unwrap().len(), 1);
}

#[test]
fn identities_partition_the_cache() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path());
    let a = Recorder::new(&cfg, "dex", "mainnet", &json!({"v": 1})).unwrap();
    let b = Recorder::new(&cfg, "dex", "mainnet", &json!({"v": 2})).unwrap();
    assert_ne!(a.namespace_dir(), b.namespace_dir());

    a.record_batch(&raw_batches(1..=2)).unwrap();
    assert_eq!(a.list_replay_files().unwrap().len(), 1);
    assert!(b.list_replay_files().unwrap().is_empty());
}

#[test]
fn concurrent_recorders_share_one_manifest() {
    let tmp = TempDir::new().unwrap();
    let rec = Arc::new(Recorder::new(&config(tmp.path()), "dex", "mainnet", &identity()).unwrap());

    let handles: Vec<_> = (0..6u64)
        .map(|t| {
            let rec = Arc::clone(&rec);
            std::thread::spawn(move || {
                for i in 0..4u64 {
                    let lo = (t * 4 + i) * 10;
                    rec.record_batch(&raw_batches(lo..=lo + 9)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(rec.list_replay_files().unwrap().len(), 24);
    assert!(!rec.namespace_dir().join("manifest.json.lock").exists());
}

// =============================================================================
// Auto-swap
// =============================================================================

#[test]
fn auto_swap_serves_covered_range_from_cache() {
    let tmp = TempDir::new().unwrap();
    let rec = Recorder::new(&config(tmp.path()), "dex", "mainnet", &identity()).unwrap();
    rec.record_batch(&raw_batches(10..=15)).unwrap();
    rec.record_batch(&raw_batches(16..=20)).unwrap();
    rec.record_batch(&raw_batches(14..=18)).unwrap();

    let out = rec.auto_swap_blocks(live(12..=19)).unwrap();
    assert_eq!(heights(&out), (12..=19).collect::<Vec<_>>());
    assert!(out.iter().all(|b| b.header.hash.as_deref() != Some("live")));
}

#[test]
fn auto_swap_with_gap_returns_live() {
    let tmp = TempDir::new().unwrap();
    let rec = Recorder::new(&config(tmp.path()), "dex", "mainnet", &identity()).unwrap();
    rec.record_batch(&raw_batches(10..=14)).unwrap();
    rec.record_batch(&raw_batches(16..=20)).unwrap();

    let input = live(10..=20);
    assert_eq!(rec.auto_swap_blocks(input.clone()).unwrap(), input);
}

#[test]
fn auto_swap_disabled_or_empty_cache_returns_live() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(tmp.path());
    let rec = Recorder::new(&cfg, "dex", "mainnet", &identity()).unwrap();
    let input = live(1..=3);
    assert_eq!(rec.auto_swap_blocks(input.clone()).unwrap(), input);

    rec.record_batch(&raw_batches(1..=3)).unwrap();
    cfg.auto_use = false;
    let off = Recorder::new(&cfg, "dex", "mainnet", &identity()).unwrap();
    assert_eq!(off.auto_swap_blocks(input.clone()).unwrap(), input);
}

#[test]
fn orphaned_manifest_entry_is_tolerated() {
    let tmp = TempDir::new().unwrap();
    let rec = Recorder::new(&config(tmp.path()), "dex", "mainnet", &identity()).unwrap();
    rec.record_batch(&raw_batches(1..=5)).unwrap();
    rec.record_batch(&raw_batches(6..=10)).unwrap();
    let files = rec.list_replay_files().unwrap();
    std::fs::remove_file(&files[1].path).unwrap();

    let input = live(1..=10);
    assert_eq!(rec.auto_swap_blocks(input.clone()).unwrap(), input);

    let partial = rec.auto_swap_blocks(live(2..=4)).unwrap();
    assert_eq!(heights(&partial), vec![2, 3, 4]);
    assert!(partial.iter().all(|b| b.header.hash.as_deref() != Some("live")));
}

#[test]
fn corrupt_batch_file_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let rec = Recorder::new(&config(tmp.path()), "dex", "mainnet", &identity()).unwrap();
    rec.record_batch(&raw_batches(1..=2)).unwrap();
    let file = rec.list_replay_files().unwrap().remove(0);
    std::fs::write(&file.path, b"not gzip at all").unwrap();

    let err = rec.auto_swap_blocks(live(1..=2)).unwrap_err();
    assert!(matches!(err, Error::Io { .. } | Error::Serialization { .. }));
}

// =============================================================================
// Retention
// =============================================================================

#[test]
fn pruned_partitions_disappear_from_auto_swap() {
    let tmp = TempDir::new().unwrap();
    let rec = Recorder::new(&config(tmp.path()), "dex", "mainnet", &identity()).unwrap();
    rec.record_batches_at(normalize_batches(&raw_batches(1..=5)).unwrap(), at("2024-01-01"))
        .unwrap();
    rec.record_batches_at(normalize_batches(&raw_batches(6..=10)).unwrap(), at("2024-03-01"))
        .unwrap();

    let report = Pruner::new(tmp.path())
        .with_filter(RetentionFilter::new(&["dex".to_string()], &[]))
        .by_age_at(30, at("2024-03-05"))
        .unwrap();
    assert_eq!(report.partitions_removed, 1);
    assert!(report.errors.is_empty());

    let input = live(1..=5);
    assert_eq!(rec.auto_swap_blocks(input.clone()).unwrap(), input);
    let cached = rec.auto_swap_blocks(live(6..=10)).unwrap();
    assert_eq!(heights(&cached), (6..=10).collect::<Vec<_>>());
    assert!(cached.iter().all(|b| b.header.hash.as_deref() != Some("live")));
}
