//! End-to-end engine scenarios against the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use docstore_migrate::store::FaultPlan;
use docstore_migrate::{
    Config, DeleteSink, Document, DocumentPath, DocumentStore, FieldPath, FnPlanner, MemoryStore,
    MigrateError, MigrationResult, MutationOp, Orchestrator, RecursiveDeleter, RunStatus,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn doc(path: &str) -> DocumentPath {
    DocumentPath::parse(path).unwrap()
}

fn config(yaml: &str) -> Config {
    Config::from_yaml(yaml).unwrap()
}

fn assert_counts_add_up(result: &MigrationResult) {
    assert_eq!(
        result.updated + result.skipped + result.errors,
        result.scanned,
        "counts do not add up: {:?}",
        result
    );
}

/// 1000 users; the first 700 still carry `old`.
async fn thousand_users() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for i in 0..1000 {
        let fields = if i < 700 {
            json!({"old": format!("value-{}", i)})
        } else {
            json!({"new": format!("value-{}", i)})
        };
        store.insert(&doc(&format!("users/u{:04}", i)), fields).await;
    }
    store
}

const RENAME: &str = r#"
migration:
  max_batch_size: 450
  retry_base_delay_ms: 1
plan:
  name: rename-old
  collection: users
  ops:
    - rename_field: { from: old, to: new }
"#;

async fn field(store: &MemoryStore, path: &str, name: &str) -> Option<Value> {
    store
        .get(&doc(path))
        .await
        .unwrap()
        .and_then(|d| d.get(&FieldPath::parse(name).unwrap()).cloned())
}

#[tokio::test]
async fn test_thousand_documents_commit_in_two_batches() {
    let store = thousand_users().await;
    let result = Orchestrator::new(config(RENAME), store.clone())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.scanned, 1000);
    assert_eq!(result.updated, 700);
    assert_eq!(result.skipped, 300);
    assert_eq!(result.errors, 0);
    assert_eq!(result.commits, 2);
    assert_counts_add_up(&result);
    assert_eq!(store.commit_log().await, vec![450, 250]);
}

#[tokio::test]
async fn test_rename_moves_value_and_rerun_is_noop() {
    let store = thousand_users().await;
    Orchestrator::new(config(RENAME), store.clone())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(field(&store, "users/u0042", "old").await, None);
    assert_eq!(
        field(&store, "users/u0042", "new").await,
        Some(json!("value-42"))
    );
    assert_eq!(
        field(&store, "users/u0800", "new").await,
        Some(json!("value-800"))
    );

    let rerun = Orchestrator::new(config(RENAME), store.clone())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rerun.updated, 0);
    assert_eq!(rerun.skipped, 1000);
    assert_counts_add_up(&rerun);
    assert_eq!(store.commit_log().await.len(), 2);
}

#[tokio::test]
async fn test_dry_run_previews_live_batches_without_writing() {
    let preview_store = thousand_users().await;
    let live_store = thousand_users().await;
    let before = preview_store.document_paths().await;

    let mut dry = config(RENAME);
    dry.migration.dry_run = true;
    let output = Orchestrator::new(dry, preview_store.clone())
        .unwrap()
        .run_detailed(CancellationToken::new())
        .await
        .unwrap();
    assert!(output.result.dry_run);
    assert!(preview_store.commit_log().await.is_empty());
    assert_eq!(preview_store.document_paths().await, before);
    assert_eq!(
        field(&preview_store, "users/u0001", "old").await,
        Some(json!("value-1"))
    );

    let live = Orchestrator::new(config(RENAME), live_store.clone())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    let preview_sizes: Vec<usize> = output.preview.iter().map(Vec::len).collect();
    assert_eq!(preview_sizes, live_store.commit_log().await);
    assert_eq!(output.result.updated, live.updated);
    assert_eq!(output.result.commits, live.commits);
}

#[tokio::test]
async fn test_delete_tree_removes_every_descendant() {
    let store = Arc::new(MemoryStore::new());
    store.insert(&doc("tenants/t1"), json!({})).await;
    let mut frontier = vec!["tenants/t1".to_string()];
    for level in 1..=3 {
        let mut next = Vec::new();
        for parent in &frontier {
            for i in 0..5 {
                let path = format!("{}/level{}/n{}", parent, level, i);
                store.insert(&doc(&path), json!({"level": level})).await;
                next.push(path);
            }
        }
        frontier = next;
    }
    store.insert(&doc("tenants/t2"), json!({})).await;
    store.insert(&doc("tenants/t2/level1/n0"), json!({})).await;

    let report = RecursiveDeleter::new(store.clone())
        .with_page_size(4)
        .delete_tree(&doc("tenants/t1"), DeleteSink::Direct, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.documents_deleted, 1 + 5 + 25 + 125);
    let remaining = store.document_paths().await;
    assert!(remaining.iter().all(|p| !p.starts_with("tenants/t1")));
    assert_eq!(remaining.len(), 2);
}

#[tokio::test]
async fn test_ghost_documents_are_cleaned() {
    let store = Arc::new(MemoryStore::new());
    let report = RecursiveDeleter::new(store)
        .delete_documents(
            &[doc("users/ghost-a"), doc("users/ghost-b")],
            DeleteSink::Direct,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.documents_deleted, 2);
}

#[tokio::test]
async fn test_recursive_delete_inside_run() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..6 {
        let status = if i % 2 == 0 { "deleted" } else { "active" };
        let user = format!("users/u{}", i);
        store.insert(&doc(&user), json!({ "status": status })).await;
        for p in 0..3 {
            store
                .insert(&doc(&format!("{}/posts/p{}", user, p)), json!({}))
                .await;
        }
    }

    let result = Orchestrator::new(
        config(
            r#"
plan:
  name: purge-deleted
  collection: users
  when:
    - equals: { field: status, value: deleted }
  ops:
    - delete_document: { recursive: true }
"#,
        ),
        store.clone(),
    )
    .unwrap()
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.updated, 3);
    assert_eq!(result.skipped, 3);
    assert_eq!(result.documents_deleted, 12);
    assert_eq!(store.document_count().await, 12);
    assert!(store
        .document_paths()
        .await
        .iter()
        .all(|p| !p.starts_with("users/u0") && !p.starts_with("users/u2")));
}

#[tokio::test]
async fn test_transient_commit_failures_are_retried() {
    let store = thousand_users().await;
    store
        .inject(FaultPlan {
            transient_commits: 3,
            ..Default::default()
        })
        .await;
    let result = Orchestrator::new(config(RENAME), store.clone())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.updated, 700);
    assert_eq!(store.commit_log().await, vec![450, 250]);
}

#[tokio::test]
async fn test_exhausted_retries_fail_with_partial_counts() {
    let store = thousand_users().await;
    store
        .inject(FaultPlan {
            transient_commits: 100,
            ..Default::default()
        })
        .await;
    let mut cfg = config(RENAME);
    cfg.migration.max_retries = Some(3);
    let result = Orchestrator::new(cfg, store.clone())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result
        .fatal_error
        .as_deref()
        .is_some_and(|e| e.contains("Transient")));
    assert!(result.scanned > 0 && result.scanned < 1000);
    assert_counts_add_up(&result);
    assert!(store.commit_log().await.is_empty());
}

#[tokio::test]
async fn test_permission_errors_are_not_retried() {
    let store = thousand_users().await;
    store
        .inject(FaultPlan {
            deny_commits: true,
            ..Default::default()
        })
        .await;
    let mut cfg = config(RENAME);
    // A retried permission error would make this test sleep for minutes.
    cfg.migration.retry_base_delay_ms = Some(60_000);
    let result = Orchestrator::new(cfg, store)
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result
        .fatal_error
        .as_deref()
        .is_some_and(|e| e.contains("Permission denied")));
}

#[tokio::test]
async fn test_cancellation_flushes_pending_batch() {
    let store = thousand_users().await;
    let cancel = CancellationToken::new();
    let seen = Arc::new(AtomicUsize::new(0));

    let planner = {
        let cancel = cancel.clone();
        let seen = seen.clone();
        FnPlanner::new("mark-then-stop", move |d: &Document| {
            if seen.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                cancel.cancel();
            }
            Ok(vec![MutationOp::SetField {
                path: d.path().clone(),
                field: FieldPath::parse("marked")?,
                value: json!(true),
            }])
        })
    };

    let result = Orchestrator::with_planner(config(RENAME), store.clone(), Arc::new(planner))
        .unwrap()
        .run(cancel)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.scanned, 5);
    assert_eq!(result.updated, 5);
    assert_eq!(store.commit_log().await, vec![5]);
    assert_eq!(field(&store, "users/u0004", "marked").await, Some(json!(true)));
    assert_eq!(field(&store, "users/u0005", "marked").await, None);
}

#[tokio::test]
async fn test_validation_errors_are_isolated() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..10 {
        let fields = if i % 3 == 0 {
            json!({"name": "no email"})
        } else {
            json!({"email": format!("u{}@example.com", i)})
        };
        store.insert(&doc(&format!("users/u{}", i)), fields).await;
    }

    let result = Orchestrator::new(
        config(
            r#"
plan:
  name: verify-email
  collection: users
  require: [email]
  ops:
    - set_field: { field: verified, value: false }
"#,
        ),
        store.clone(),
    )
    .unwrap()
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.errors, 4);
    assert_eq!(result.updated, 6);
    assert_counts_add_up(&result);
    assert_eq!(result.error_details.len(), 4);
    assert!(result.error_details.iter().any(|e| e.path == "users/u3"));
    assert_eq!(field(&store, "users/u1", "verified").await, Some(json!(false)));
}

#[tokio::test]
async fn test_invalid_op_leaves_document_untouched() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..3 {
        store
            .insert(&doc(&format!("users/u{}", i)), json!({"a": i}))
            .await;
    }

    let planner = FnPlanner::new("touch-and-nest", |d: &Document| {
        let mut ops = vec![MutationOp::SetField {
            path: d.path().clone(),
            field: FieldPath::parse("touched")?,
            value: json!(true),
        }];
        if d.path().id() == "u1" {
            ops.push(MutationOp::RenameField {
                path: d.path().clone(),
                from: FieldPath::parse("a")?,
                to: FieldPath::parse("a.b")?,
            });
        }
        Ok(ops)
    });

    let result = Orchestrator::with_planner(config(RENAME), store.clone(), Arc::new(planner))
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.errors, 1);
    assert_eq!(result.updated, 2);
    assert_counts_add_up(&result);
    assert_eq!(field(&store, "users/u1", "touched").await, None);
    assert_eq!(field(&store, "users/u0", "touched").await, Some(json!(true)));
    assert_eq!(store.commit_log().await, vec![2]);
}

#[tokio::test]
async fn test_cancelled_recursive_delete_is_not_counted_as_updated() {
    let store = Arc::new(MemoryStore::new());
    for user in ["users/u0", "users/u1"] {
        store.insert(&doc(user), json!({})).await;
        for p in 0..3 {
            store
                .insert(&doc(&format!("{}/posts/p{}", user, p)), json!({}))
                .await;
        }
    }

    let cancel = CancellationToken::new();
    let planner = {
        let cancel = cancel.clone();
        FnPlanner::new("purge-then-stop", move |d: &Document| {
            cancel.cancel();
            Ok(vec![MutationOp::DeleteDocument {
                path: d.path().clone(),
                recursive: true,
            }])
        })
    };

    let result = Orchestrator::with_planner(config(RENAME), store.clone(), Arc::new(planner))
        .unwrap()
        .run(cancel)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.updated, 0);
    assert_eq!(result.documents_deleted, 0);
    assert_counts_add_up(&result);
    assert_eq!(store.document_count().await, 8);
}

#[tokio::test]
async fn test_fan_out_processes_every_subcollection() {
    let store = Arc::new(MemoryStore::new());
    for u in 0..7 {
        store.insert(&doc(&format!("users/u{}", u)), json!({})).await;
        for o in 0..4 {
            store
                .insert(
                    &doc(&format!("users/u{}/orders/o{}", u, o)),
                    json!({"total": o * 10}),
                )
                .await;
        }
    }

    let result = Orchestrator::new(
        config(
            r#"
migration:
  workers: 3
  max_batch_size: 3
  page_size: 2
plan:
  name: tag-orders
  collection: users
  fan_out_subcollection: orders
  ops:
    - merge_fields:
        set: { "meta.schema": 2 }
"#,
        ),
        store.clone(),
    )
    .unwrap()
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.scanned, 28);
    assert_eq!(result.updated, 28);
    // Each parent's four orders commit as 3 + 1 through its own writer.
    let mut log = store.commit_log().await;
    log.sort_unstable();
    assert_eq!(log, [vec![1; 7], vec![3; 7]].concat());
    assert_eq!(
        field(&store, "users/u6/orders/o3", "meta.schema").await,
        Some(json!(2))
    );
    assert_eq!(field(&store, "users/u6", "meta").await, None);
}

const MARK: &str = r#"
migration:
  page_size: 10
plan:
  name: mark
  collection: items
  ops:
    - set_field: { field: migrated, value: true }
"#;

#[tokio::test]
async fn test_resume_continues_after_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state.json");
    let store = Arc::new(MemoryStore::new());
    for i in 0..30 {
        store
            .insert(&doc(&format!("items/i{:02}", i)), json!({"i": i}))
            .await;
    }

    // First run stops after 15 documents; the checkpoint sits after page one.
    let cancel = CancellationToken::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let planner = {
        let cancel = cancel.clone();
        let seen = seen.clone();
        FnPlanner::new("mark", move |d: &Document| {
            if seen.fetch_add(1, Ordering::SeqCst) + 1 == 15 {
                cancel.cancel();
            }
            Ok(vec![MutationOp::SetField {
                path: d.path().clone(),
                field: FieldPath::parse("migrated")?,
                value: json!(true),
            }])
        })
    };
    let first = Orchestrator::with_planner(config(MARK), store.clone(), Arc::new(planner))
        .unwrap()
        .with_state_file(state_file.clone())
        .run(cancel)
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Cancelled);
    assert_eq!(first.scanned, 15);

    let second = Orchestrator::new(config(MARK), store.clone())
        .unwrap()
        .with_state_file(state_file.clone())
        .resume()
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.scanned, 30);
    assert_eq!(second.updated, 25);
    assert_eq!(second.skipped, 5);
    assert_counts_add_up(&second);
    for i in 0..30 {
        assert_eq!(
            field(&store, &format!("items/i{:02}", i), "migrated").await,
            Some(json!(true))
        );
    }
}

#[tokio::test]
async fn test_resume_rejects_changed_config() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state.json");
    let store = Arc::new(MemoryStore::new());
    store.insert(&doc("items/a"), json!({})).await;

    Orchestrator::new(config(MARK), store.clone())
        .unwrap()
        .with_state_file(state_file.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    let mut changed = config(MARK);
    changed.migration.page_size = Some(5);
    let err = Orchestrator::new(changed, store)
        .unwrap()
        .with_state_file(state_file)
        .resume()
        .err()
        .unwrap();
    assert!(matches!(err, MigrateError::ConfigChanged));
}
