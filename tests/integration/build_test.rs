//! Build pipeline scenarios: new files, validate-loop fallback to
//! whole-file, and conflict invalidation.

use std::sync::Arc;
use std::time::Duration;

use super::helpers::{TestHarness, ORG, USER};
use plandex_server::models::context::ContextType;
use plandex_server::models::Context;
use plandex_server::services::active::ActiveBuild;
use plandex_server::services::build::BuildRunner;

async fn wait_for_results(harness: &TestHarness, plan_id: &str, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let results = harness.server.plan_fs(ORG, plan_id).load_results().unwrap();
        if results.len() >= count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for build results"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn runner(harness: &TestHarness, plan_id: &str) -> Arc<BuildRunner> {
    BuildRunner::new(
        Arc::clone(&harness.server),
        ORG,
        USER,
        plan_id,
        "main",
        super::helpers::role_named_settings(),
    )
}

#[tokio::test]
async fn test_new_file_build_emits_content_result() {
    let harness = TestHarness::new();
    harness.create_plan("p-build-new", "build plan");
    harness
        .server
        .registry
        .activate(ORG, USER, "p-build-new", "main", "", true, false, "s1")
        .unwrap();

    let build = ActiveBuild::file_build("reply-1", "hello.txt", "hi", "create hello");
    runner(&harness, "p-build-new").queue_builds(vec![build]);

    wait_for_results(&harness, "p-build-new", 1).await;

    let results = harness.server.plan_fs(ORG, "p-build-new").load_results().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "hello.txt");
    assert_eq!(results[0].content, "hi");
    assert!(results[0].replacements.is_empty());
    assert!(results[0].is_pending());
}

#[tokio::test]
async fn test_validate_loop_falls_back_to_whole_file() {
    let harness = TestHarness::new();
    harness.create_plan("p-build-fix", "fix plan");
    let active = harness
        .server
        .registry
        .activate(ORG, USER, "p-build-fix", "main", "", true, false, "s1")
        .unwrap();

    // existing file comes from context
    let original = "fn main() {\n    old();\n}\n";
    let mut ctx = Context::new(ContextType::File, "src/app.rs");
    ctx.file_path = "src/app.rs".into();
    ctx.set_body(original.into(), 10);
    let ctx = Arc::new(ctx);
    active.update(|s| {
        s.contexts_by_path.insert("src/app.rs".into(), Arc::clone(&ctx));
        s.contexts.push(ctx);
    });

    // every validation attempt fails without usable replacements, so after
    // the attempts exhaust the whole-file fallback supplies the fix
    for _ in 0..4 {
        harness
            .provider
            .route("builder-m", "That change is wrong.\n<PlandexIncorrect/>");
    }
    let fixed = "fn main() {\n    new();\n}";
    harness.provider.route(
        "whole-m",
        format!("<PlandexWholeFile>\n{}\n</PlandexWholeFile>", fixed),
    );

    let build = ActiveBuild::file_build(
        "reply-1",
        "src/app.rs",
        "fn main() {\n    new();\n}\n",
        "replace old with new",
    );
    runner(&harness, "p-build-fix").queue_builds(vec![build]);

    wait_for_results(&harness, "p-build-fix", 1).await;

    let results = harness.server.plan_fs(ORG, "p-build-fix").load_results().unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.path, "src/app.rs");
    assert!(!result.replacements.is_empty());

    // replacement determinism: applying the stored replacements to the
    // pre-build state reproduces the whole-file output exactly
    let mut check = result.clone();
    let applied = check.apply_replacements(original).unwrap();
    assert_eq!(applied, fixed);
}

#[tokio::test]
async fn test_remove_and_reset_operations() {
    let harness = TestHarness::new();
    harness.create_plan("p-build-ops", "ops plan");
    let active = harness
        .server
        .registry
        .activate(ORG, USER, "p-build-ops", "main", "", true, false, "s1")
        .unwrap();

    let mut ctx = Context::new(ContextType::File, "keep.rs");
    ctx.file_path = "keep.rs".into();
    ctx.set_body("original body".into(), 4);
    let ctx = Arc::new(ctx);
    active.update(|s| {
        s.contexts_by_path.insert("keep.rs".into(), Arc::clone(&ctx));
        s.contexts.push(ctx);
    });

    let remove = ActiveBuild::remove_build("reply-1", "gone.rs");
    let reset = {
        let op = plandex_core::Operation::reset("keep.rs");
        ActiveBuild::from_operation("reply-1", &op, 0)
    };
    runner(&harness, "p-build-ops").queue_builds(vec![remove, reset]);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let results = harness.server.plan_fs(ORG, "p-build-ops").load_results().unwrap();
        if results.len() == 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let results = harness.server.plan_fs(ORG, "p-build-ops").load_results().unwrap();
    let removed = results.iter().find(|r| r.path == "gone.rs").unwrap();
    assert!(removed.removed_file);
    let reset_res = results.iter().find(|r| r.path == "keep.rs").unwrap();
    assert_eq!(reset_res.content, "original body");
}
