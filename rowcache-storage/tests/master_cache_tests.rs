//! Master data tests: local cache reads, table-wide invalidation through the
//! shared version marker, and the cached master key set.
//!
//! Managers built on separate registries stand in for separate processes.
//! Invalidation is eventual: a process only drops its local copies the next
//! time it syncs the marker (on manager construction or transaction start).

use std::rc::Rc;
use std::sync::Arc;

use rowcache_storage::{keyset_key, CacheTransport, SaveOptions, VERSION_MARKER_KEY};
use rowcache_test_utils::fixtures::*;
use rowcache_test_utils::*;

fn seed_masters(harness: &TestHarness) {
    let mut m = harness.manager_without_cache();
    m.start_transaction().unwrap();
    for (id, name) in [(1, "one"), (2, "two"), (3, "three")] {
        m.cached_save(master(id, name), SaveOptions::new()).unwrap();
    }
    m.write_all().unwrap();
    m.commit_transaction().unwrap();
}

#[test]
fn test_master_reads_fill_local_cache() {
    let harness = TestHarness::new();
    seed_masters(&harness);

    let mut first = harness.manager();
    first
        .get_models::<DummyMasterTable>(&[Key::from(1u32), Key::from(2u32)])
        .unwrap();
    assert_eq!(first.stats().store_queries, 1);
    assert_eq!(first.local_cache().len(), 2);
    // Master rows never go to the distributed cache.
    assert!(harness
        .transport()
        .get("dummy_master_table:1")
        .unwrap()
        .is_miss());

    let mut second = harness.manager();
    let rows = second
        .get_models::<DummyMasterTable>(&[Key::from(1u32), Key::from(2u32)])
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(second.stats().local_hits, 2);
    assert_eq!(second.executor().query_count(), 0);
}

#[test]
fn test_master_write_invalidates_whole_table_across_processes() {
    let harness = TestHarness::new();
    seed_masters(&harness);

    let reader_registry = Arc::new(Registry::new());
    let mut reader = harness.manager_in_process(Arc::clone(&reader_registry));
    reader
        .get_models::<DummyMasterTable>(&[Key::from(1u32), Key::from(2u32)])
        .unwrap();
    assert_eq!(reader.local_cache().len(), 2);

    let mut writer = harness.manager_in_process(Arc::new(Registry::new()));
    writer.start_transaction().unwrap();
    writer
        .cached_save(master(1, "uno"), SaveOptions::new())
        .unwrap();
    writer.write_all().unwrap();
    writer.commit_transaction().unwrap();
    assert!(!harness.transport().exists(VERSION_MARKER_KEY).unwrap());

    // Not yet synced: the reader process may still serve its old copy.
    assert!(reader
        .local_cache()
        .get::<DummyMasterTable>(&Key::from(2u32))
        .is_hit());

    // The next transaction adopts the new version and drops every row of
    // the table, including the sibling that was never written.
    reader.start_transaction().unwrap();
    assert!(reader.local_cache().is_empty());
    reader.rollback_transaction().unwrap();

    let mut later = harness.manager_in_process(reader_registry);
    let sibling = later
        .get_model::<DummyMasterTable>(2u32)
        .unwrap()
        .unwrap();
    assert_eq!(sibling.borrow().hoge, "two");
    let written = later
        .get_model::<DummyMasterTable>(1u32)
        .unwrap()
        .unwrap();
    assert_eq!(written.borrow().hoge, "uno");
    assert_eq!(later.stats().store_queries, 2);
    assert_eq!(later.stats().local_hits, 0);
}

#[test]
fn test_master_delete_invalidates_local_cache() {
    let harness = TestHarness::new();
    seed_masters(&harness);

    let mut m = harness.manager();
    m.get_models::<DummyMasterTable>(&[Key::from(3u32)]).unwrap();
    assert_eq!(m.local_cache().len(), 1);

    m.start_transaction().unwrap();
    m.set_delete(master(3, "three")).unwrap();
    m.write_all().unwrap();
    m.commit_transaction().unwrap();

    assert!(m.local_cache().is_empty());
    assert!(m
        .get_model::<DummyMasterTable>(3u32)
        .unwrap()
        .is_none());
}

#[test]
fn test_master_model_all_uses_cached_key_set() {
    let harness = TestHarness::new();
    seed_masters(&harness);

    let mut first = harness.manager();
    let all = first.get_master_model_all::<DummyMasterTable>(false).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(first.stats().store_queries, 1);
    assert!(harness
        .transport()
        .get(&keyset_key(DummyMasterTable::TABLE))
        .unwrap()
        .is_hit());

    let mut second = harness.manager();
    let all = second
        .get_master_model_all::<DummyMasterTable>(false)
        .unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(second.stats().store_queries, 0);
    assert_eq!(second.stats().local_hits, 3);

    let reloaded = second
        .get_master_model_all::<DummyMasterTable>(true)
        .unwrap();
    assert_eq!(reloaded.len(), 3);
    assert_eq!(second.stats().store_queries, 1);
    // Reload hands back the handles already in scope.
    for handle in &reloaded {
        assert!(all.iter().any(|h| Rc::ptr_eq(h, handle)));
    }
}

#[test]
fn test_master_write_drops_cached_key_set() {
    let harness = TestHarness::new();
    seed_masters(&harness);

    let mut m = harness.manager();
    m.get_master_model_all::<DummyMasterTable>(false).unwrap();

    m.start_transaction().unwrap();
    m.cached_save(master(4, "four"), SaveOptions::new())
        .unwrap();
    m.write_all().unwrap();
    m.commit_transaction().unwrap();
    assert!(harness
        .transport()
        .get(&keyset_key(DummyMasterTable::TABLE))
        .unwrap()
        .is_miss());

    let mut reader = harness.manager();
    let all = reader
        .get_master_model_all::<DummyMasterTable>(false)
        .unwrap();
    assert_eq!(all.len(), 4);
}
