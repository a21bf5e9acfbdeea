//! Policy Registry Invariant Tests
//!
//! - Policies are returned in name order regardless of creation order
//! - Every applied batch bumps the version by exactly one
//! - A failed batch publishes nothing
//! - Concurrent readers only ever see complete snapshots
//! - Policy files load identically from JSON and SQL
//! - Self-referencing policies are flagged by the linter

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rlsgate::policy::{
    load_policy_file, Command, Expr, LintKind, Operation, Policy, PolicyError, PolicyRegistry,
    PolicySet, SchemaChange,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn create(name: &str, command: Command) -> SchemaChange {
    SchemaChange::CreatePolicy(Policy::new(name, "todos", command).using(Expr::lit(true)))
}

fn enable(table: &str) -> SchemaChange {
    SchemaChange::SetRls {
        table: table.to_string(),
        enabled: true,
    }
}

fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

// =============================================================================
// Ordering and Versioning
// =============================================================================

/// Applicable policies come back sorted by name.
#[test]
fn test_policy_order_is_by_name() {
    let registry = PolicyRegistry::new();
    registry
        .apply_all([
            enable("todos"),
            create("zeta", Command::Select),
            create("alpha", Command::All),
            create("mid", Command::Select),
        ])
        .unwrap();

    let snapshot = registry.snapshot();
    let applicable = snapshot.policies_for("todos", Operation::Select, "anon");
    let names: Vec<_> = applicable.permissive.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["alpha", "mid", "zeta"]);
}

/// Versions count applied batches; failed batches leave the snapshot untouched.
#[test]
fn test_versions_and_failed_batches() {
    let registry = PolicyRegistry::new();
    assert_eq!(registry.version(), 0);

    registry.apply_all([enable("todos"), create("a", Command::Select)]).unwrap();
    assert_eq!(registry.version(), 1);
    let before = registry.snapshot().fingerprint();

    let err = registry
        .apply_all([create("b", Command::Select), create("a", Command::Select)])
        .unwrap_err();
    assert!(matches!(err, PolicyError::DuplicatePolicy { .. }));
    assert_eq!(registry.version(), 1);
    assert_eq!(registry.snapshot().fingerprint(), before);

    let err = registry
        .apply(SchemaChange::DropPolicy {
            table: "todos".to_string(),
            name: "missing".to_string(),
        })
        .unwrap_err();
    assert!(matches!(err, PolicyError::UnknownPolicy { .. }));

    registry
        .apply(SchemaChange::DropPolicy {
            table: "todos".to_string(),
            name: "a".to_string(),
        })
        .unwrap();
    assert_eq!(registry.version(), 2);
    assert_eq!(registry.snapshot().policies().count(), 0);
}

/// A pinned snapshot is unaffected by later changes.
#[test]
fn test_snapshot_isolation() {
    let registry = PolicyRegistry::new();
    registry.apply_all([enable("todos"), create("a", Command::Select)]).unwrap();

    let pinned = registry.snapshot();
    registry.apply(create("b", Command::Select)).unwrap();

    assert_eq!(pinned.policies().count(), 1);
    assert_eq!(registry.snapshot().policies().count(), 2);
    assert_ne!(pinned.fingerprint(), registry.snapshot().fingerprint());
}

// =============================================================================
// Concurrency
// =============================================================================

/// Readers racing a writer see either none or all of each two-policy batch.
#[test]
fn test_concurrent_readers_see_whole_batches() {
    let registry = Arc::new(PolicyRegistry::new());
    registry.apply(enable("todos")).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut observed = 0;
                while !done.load(Ordering::SeqCst) {
                    let snapshot = registry.snapshot();
                    let count = snapshot.policies().count();
                    assert_eq!(count % 2, 0, "partial batch at version {}", snapshot.version());
                    assert_eq!(count as u64, (snapshot.version() - 1) * 2);
                    observed += 1;
                }
                observed
            })
        })
        .collect();

    for i in 0..200 {
        registry
            .apply_all([
                create(&format!("p{}_read", i), Command::Select),
                create(&format!("p{}_write", i), Command::Insert),
            ])
            .unwrap();
    }
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert_eq!(registry.version(), 201);
}

// =============================================================================
// Policy Files
// =============================================================================

/// The same policy set written as JSON and as SQL produces the same snapshot.
#[test]
fn test_json_and_sql_files_agree() {
    let dir = TempDir::new().unwrap();
    let json_path = write_file(
        &dir,
        "policies.json",
        r#"{
            "tables": [{"table": "todos", "enabled": true}],
            "policies": [
                {"name": "owner_read", "table": "todos", "command": "select",
                 "roles": ["authenticated"], "using": "auth.uid() = user_id"},
                {"name": "mfa", "table": "todos", "permissive": false,
                 "using": "(auth.jwt() ->> 'aal') = 'aal2'"}
            ]
        }"#,
    );
    let sql_path = write_file(
        &dir,
        "policies.sql",
        "alter table todos enable row level security;
         create policy owner_read on todos for select to authenticated using (auth.uid() = user_id);
         create policy mfa on todos as restrictive using ((auth.jwt() ->> 'aal') = 'aal2');",
    );

    let fingerprints: Vec<_> = [json_path, sql_path]
        .iter()
        .map(|path| {
            let registry = PolicyRegistry::new();
            load_policy_file(path).unwrap().install(&registry).unwrap();
            registry.snapshot().fingerprint()
        })
        .collect();
    assert_eq!(fingerprints[0], fingerprints[1]);
}

/// Parse errors carry the offset of the offending token.
#[test]
fn test_sql_parse_error_position() {
    let set = PolicySet::from_sql("create policy p on todos using (user_id = );");
    match set.install(&PolicyRegistry::new()) {
        Err(PolicyError::Parse { position, .. }) => assert_eq!(position, 42),
        other => panic!("expected parse error, got {:?}", other.map(|r| r.version)),
    }
}

// =============================================================================
// Lint
// =============================================================================

/// A policy querying its own table is reported; loading still succeeds.
#[test]
fn test_recursive_policy_flagged_on_load() {
    let registry = PolicyRegistry::new();
    let report = PolicySet::from_sql(
        "alter table members enable row level security;
         create policy members_read on members for select
           using (exists (select 1 from members m where m.team_id = members.team_id
                          and m.user_id = auth.uid()));",
    )
    .install(&registry)
    .unwrap();

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].kind, LintKind::RecursiveTableReference);
    assert_eq!(registry.snapshot().policies().count(), 1);
}
