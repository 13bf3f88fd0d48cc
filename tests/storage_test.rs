//! Storage router tests against real temporary directories.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tollgate::storage::{Category, Format, StorageRouter};
use tollgate::TollgateError;

fn router(dir: &tempfile::TempDir) -> StorageRouter {
    StorageRouter::new(dir.path().join("reports"), dir.path().join("memories")).unwrap()
}

#[tokio::test]
async fn persist_then_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let storage = router(&dir);

    let record = storage
        .persist(Category::Report, "Denver Q3", Format::Markdown, "# Denver Q3\n")
        .await
        .unwrap();

    assert_eq!(record.logical_id, "Denver_Q3");
    assert_eq!(record.physical_path, dir.path().join("reports/Denver_Q3.md"));
    assert_eq!(record.bytes, 12);

    let artifact = storage.fetch(Category::Report, "Denver Q3").await.unwrap();
    assert_eq!(artifact.format, Format::Markdown);
    assert_eq!(artifact.content, "# Denver Q3\n");
}

#[tokio::test]
async fn categories_are_separate_roots() {
    let dir = tempfile::tempdir().unwrap();
    let storage = router(&dir);

    storage
        .persist(Category::Memory, "notes", Format::Json, "{}")
        .await
        .unwrap();

    assert!(dir.path().join("memories/notes.json").exists());
    assert!(matches!(
        storage.fetch(Category::Report, "notes").await,
        Err(TollgateError::NotFound(_))
    ));
}

#[tokio::test]
async fn overwrite_replaces_content() {
    let dir = tempfile::tempdir().unwrap();
    let storage = router(&dir);

    storage
        .persist(Category::Report, "r", Format::Html, "<p>v1</p>")
        .await
        .unwrap();
    storage
        .persist(Category::Report, "r", Format::Html, "<p>v2</p>")
        .await
        .unwrap();

    let content = storage
        .fetch_as(Category::Report, "r", Format::Html)
        .await
        .unwrap();
    assert_eq!(content, "<p>v2</p>");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_never_interleave() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(router(&dir));

    let contents: Vec<String> = (0..16)
        .map(|i| format!("{}\n", char::from(b'a' + i as u8).to_string().repeat(64 * 1024)))
        .collect();

    let writing = Arc::new(AtomicBool::new(true));
    let reader = {
        let storage = Arc::clone(&storage);
        let writing = Arc::clone(&writing);
        let contents = contents.clone();
        tokio::spawn(async move {
            let mut observed = 0usize;
            while writing.load(Ordering::Acquire) {
                match storage
                    .fetch_as(Category::Report, "contested", Format::Markdown)
                    .await
                {
                    Ok(content) => {
                        assert!(
                            contents.contains(&content),
                            "reader saw a partial file of {} bytes",
                            content.len()
                        );
                        observed += 1;
                    }
                    Err(TollgateError::NotFound(_)) => {}
                    Err(e) => panic!("unexpected read error: {e}"),
                }
                tokio::task::yield_now().await;
            }
            observed
        })
    };

    let mut handles = Vec::new();
    for content in contents.clone() {
        let storage = Arc::clone(&storage);
        handles.push(tokio::spawn(async move {
            storage
                .persist(Category::Report, "contested", Format::Markdown, content)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    writing.store(false, Ordering::Release);
    reader.await.unwrap();

    let final_content = storage
        .fetch_as(Category::Report, "contested", Format::Markdown)
        .await
        .unwrap();
    assert!(
        contents.contains(&final_content),
        "file holds a mix of writes"
    );

    // no staged temp files are left behind
    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("reports"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn rewriting_in_another_format_replaces_the_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let storage = router(&dir);

    storage
        .persist(Category::Report, "sf", Format::Markdown, "old md")
        .await
        .unwrap();
    let record = storage
        .persist(Category::Report, "sf", Format::Json, "{\"new\":true}")
        .await
        .unwrap();

    let artifact = storage.fetch(Category::Report, "sf").await.unwrap();
    assert_eq!(artifact.format, Format::Json);
    assert_eq!(artifact.content, "{\"new\":true}");
    assert!(!dir.path().join("reports/sf.md").exists());
    assert_eq!(record.physical_path, dir.path().join("reports/sf.json"));
}

#[tokio::test]
async fn dotted_ids_keep_their_full_stem() {
    let dir = tempfile::tempdir().unwrap();
    let storage = router(&dir);

    storage
        .persist(Category::Report, "sf.v1", Format::Markdown, "one")
        .await
        .unwrap();
    storage
        .persist(Category::Report, "sf.v2", Format::Html, "two")
        .await
        .unwrap();

    assert_eq!(
        storage.fetch(Category::Report, "sf.v1").await.unwrap().content,
        "one"
    );
    assert_eq!(
        storage.list(Category::Report).await.unwrap(),
        vec!["sf.v1", "sf.v2"]
    );
}

#[tokio::test]
async fn list_returns_sorted_logical_ids() {
    let dir = tempfile::tempdir().unwrap();
    let storage = router(&dir);

    assert!(storage.list(Category::Report).await.unwrap().is_empty());

    for id in ["zeta", "alpha", "mid"] {
        storage
            .persist(Category::Report, id, Format::Markdown, id)
            .await
            .unwrap();
    }
    storage
        .persist(Category::Report, "alpha", Format::Json, "{}")
        .await
        .unwrap();
    std::fs::write(dir.path().join("reports/ignored.txt"), "x").unwrap();

    let ids = storage.list(Category::Report).await.unwrap();
    assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
}

#[tokio::test]
async fn traversal_ids_stay_inside_root() {
    let dir = tempfile::tempdir().unwrap();
    let storage = router(&dir);

    let record = storage
        .persist(Category::Report, "../../escape", Format::Markdown, "x")
        .await
        .unwrap();
    assert!(record.physical_path.starts_with(dir.path().join("reports")));
    assert!(!dir.path().join("escape.md").exists());

    let err = storage
        .persist(Category::Report, "..", Format::Markdown, "x")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_input");
}

#[tokio::test]
async fn seeding_creates_missing_memories_only() {
    let dir = tempfile::tempdir().unwrap();
    let storage = router(&dir);

    storage
        .persist(
            Category::Memory,
            "user_preferences",
            Format::Markdown,
            "# mine\n",
        )
        .await
        .unwrap();

    let created = storage.seed_memories().await.unwrap();
    let mut ids: Vec<_> = created.iter().map(|r| r.logical_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["market_knowledge", "property_history"]);

    let prefs = storage
        .fetch_as(Category::Memory, "user_preferences", Format::Markdown)
        .await
        .unwrap();
    assert_eq!(prefs, "# mine\n");

    // second run is a no-op
    assert!(storage.seed_memories().await.unwrap().is_empty());
}
