//! Rebuild debouncing and the persistent pre-render cache.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use pretty_assertions::assert_eq;
use serde_json::json;
use zenith_ssr::cache::{DevRebuilder, InvalidationSet, PrerenderCache, Rebuild};
use zenith_ssr::manifest::{ClientManifest, ManifestChunk, ManifestStore};
use zenith_ssr::utils::encode_path_segment;
use zenith_ssr::{IslandRequest, IslandResponse, SsrError};

// ---- Helpers ----

#[derive(Default)]
struct CountingRebuild {
    calls: Mutex<Vec<Vec<String>>>,
}

impl Rebuild for CountingRebuild {
    fn rebuild<'a>(&'a self, changed: &'a [String]) -> BoxFuture<'a, Result<ClientManifest, SsrError>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(changed.to_vec());
            let mut manifest = ClientManifest::default();
            manifest.chunks.insert(
                "src/entry-client.js".to_string(),
                ManifestChunk {
                    file: format!("assets/entry-{}.js", changed.len()),
                    is_entry: true,
                    ..ManifestChunk::default()
                },
            );
            Ok(manifest)
        })
    }
}

fn island_response() -> IslandResponse {
    IslandResponse {
        id: "Card_abc".to_string(),
        html: "<p>card</p>".to_string(),
        ..IslandResponse::default()
    }
}

// ===========================================================================
// Debounced rebuild
// ===========================================================================

/// A burst of change events inside the window produces one rebuild with the
/// last event's files; every file is invalidated immediately.
#[tokio::test(start_paused = true)]
async fn burst_of_changes_rebuilds_once() {
    let rebuild = Arc::new(CountingRebuild::default());
    let manifest = ManifestStore::new(ClientManifest::default());
    let invalidations = InvalidationSet::new();
    let rebuilder = DevRebuilder::new(
        rebuild.clone(),
        manifest.clone(),
        invalidations.clone(),
        Duration::from_millis(100),
    );

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(rebuilder.file_changed([format!("/src/file{i}.js"), "/src/shared.js".to_string()]));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(rebuild.calls.lock().unwrap().is_empty());
    assert_eq!(invalidations.len(), 6);

    for handle in handles {
        handle.await.unwrap();
    }

    let calls = rebuild.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![vec!["/src/file4.js".to_string(), "/src/shared.js".to_string()]]);
    assert_eq!(
        manifest.current().get("src/entry-client.js").map(|c| c.file.as_str()),
        Some("assets/entry-2.js")
    );
}

/// Events separated by more than the window each rebuild.
#[tokio::test(start_paused = true)]
async fn spaced_changes_rebuild_separately() {
    let rebuild = Arc::new(CountingRebuild::default());
    let rebuilder = DevRebuilder::new(
        rebuild.clone(),
        ManifestStore::new(ClientManifest::default()),
        InvalidationSet::new(),
        Duration::from_millis(50),
    );

    rebuilder.file_changed(["/src/a.js"]).await.unwrap();
    rebuilder.file_changed(["/src/b.js"]).await.unwrap();
    assert_eq!(rebuild.calls.lock().unwrap().len(), 2);
}

// ===========================================================================
// Persistent pre-render cache
// ===========================================================================

/// Entries written by one cache are visible to a fresh cache on the same
/// directory.
#[tokio::test]
async fn persisted_entries_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let island = IslandRequest::new("Card", "abc").with_props(json!({ "sku": 1 }));
    let path = island.path("/__zenith_island");

    let cache = PrerenderCache::new().with_persist_dir(dir.path());
    cache.put_island(&path, &island, &island_response()).await.unwrap();
    cache
        .put_payload("/blog/_payload.json", &json!({ "posts": [] }))
        .await
        .unwrap();
    assert_eq!(cache.persist_dir(), Some(dir.path()));

    let restarted = PrerenderCache::new().with_persist_dir(dir.path());
    assert_eq!(restarted.island(&path).await, Some(island_response()));
    assert_eq!(restarted.island_request(&path).await, Some(island));
    assert_eq!(
        restarted.payload("/blog/_payload.json").await,
        Some(json!({ "posts": [] }))
    );
    assert_eq!(restarted.payload("/other/_payload.json").await, None);
}

/// Clearing memory falls back to disk; without a directory it is gone.
#[tokio::test]
async fn clear_only_drops_memory() {
    let dir = tempfile::tempdir().unwrap();
    let persisted = PrerenderCache::new().with_persist_dir(dir.path());
    persisted.put_payload("/_payload.json", &json!(1)).await.unwrap();
    persisted.clear();
    assert_eq!(persisted.payload("/_payload.json").await, Some(json!(1)));

    let memory = PrerenderCache::new();
    memory.put_payload("/_payload.json", &json!(1)).await.unwrap();
    memory.clear();
    assert_eq!(memory.payload("/_payload.json").await, None);
}

/// Corrupt cache files are ignored.
#[tokio::test]
async fn corrupt_files_are_misses() {
    let dir = tempfile::tempdir().unwrap();
    let payloads = dir.path().join("payloads");
    std::fs::create_dir_all(&payloads).unwrap();
    std::fs::write(
        payloads.join(format!("{}.json", encode_path_segment("/x/_payload.json"))),
        "{not json",
    )
    .unwrap();

    let cache = PrerenderCache::new().with_persist_dir(dir.path());
    assert_eq!(cache.payload("/x/_payload.json").await, None);
}
