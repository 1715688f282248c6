//! Tell pipeline scenarios: single-file create, missing-file skip, and
//! auto-continue to completion.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use plandex_core::stream::StreamMessage;
use plandex_server::models::{
    ConvoMessage, ConvoMessageFlags, CurrentStage, PlanStatus, PlanningPhase, Subtask,
    TellRequest, TellStage, ROLE_ASSISTANT, ROLE_USER,
};
use plandex_server::services::active::MissingFileChoice;
use plandex_server::services::tell::tell;

use super::helpers::{collect_until_finished, reply_text, TestHarness, ORG, USER};

fn convo_message(num: usize, role: &str, text: &str, flags: ConvoMessageFlags) -> ConvoMessage {
    ConvoMessage {
        id: format!("seed-{}", num),
        plan_id: "seeded".into(),
        user_id: USER.into(),
        role: role.into(),
        num,
        tokens: 10,
        message: text.into(),
        stopped: false,
        flags,
        reply_type: Default::default(),
        subtask: None,
        added_subtasks: vec![],
        removed_subtasks: vec![],
        activated_paths: Default::default(),
        activated_paths_ordered: vec![],
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_single_file_create_end_to_end() {
    let harness = TestHarness::new();
    let plan = harness.create_plan("p-tell-create", "draft");

    // iteration 0: planning produces one subtask
    harness.provider.route("namer-m", "Create hello file");
    harness.provider.route(
        "planner-m",
        "I'll create the file.\n\n### Tasks\n\n1. Create hello.txt\nUses: `hello.txt`\n\n<PlandexFinish/>",
    );
    // iteration 1: implementation writes the file and declares completion
    harness.provider.route(
        "coder-m",
        "Creating the file.\n\n- hello.txt\n\n\
         <PlandexBlock lang=\"txt\" path=\"hello.txt\">\nhi\n</PlandexBlock>\n\n\
         **Create hello.txt** has been completed.\n<PlandexFinish/>",
    );
    for _ in 0..2 {
        harness
            .provider
            .route("describer-m", r#"{"commitMsg": "Create hello.txt", "wroteFiles": true}"#);
        harness.provider.route("summary-m", "Summary of the plan so far.");
    }

    let req = TellRequest {
        prompt: "create file hello.txt with content: hi".into(),
        project_paths: HashSet::new(),
        ..Default::default()
    };

    let active = tell(harness.server.clone(), plan, "main", USER, req)
        .await
        .unwrap();
    let (_sub, mut rx) = active.subscribe();

    let messages = collect_until_finished(&mut rx, Duration::from_secs(30)).await;
    assert!(
        matches!(messages.last(), Some(StreamMessage::Finished)),
        "expected finished, got {:?}",
        messages.last()
    );

    // one validated result: new file with full content, no replacements
    let fs = harness.server.plan_fs(ORG, "p-tell-create");
    let results = fs.load_results().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "hello.txt");
    assert_eq!(results[0].content, "hi\n");
    assert!(results[0].replacements.is_empty());

    // one subtask, finished
    let subtasks = fs.load_subtasks().unwrap();
    assert_eq!(subtasks.len(), 1);
    assert_eq!(subtasks[0].title, "Create hello.txt");
    assert!(subtasks[0].is_finished);

    // conversation: user prompt + planning reply + implementation reply
    let convo = fs.load_conversation().unwrap();
    assert_eq!(convo.len(), 3);
    assert_eq!(convo[0].role, ROLE_USER);
    assert!(convo[1].flags.did_make_plan);
    assert!(convo[2].flags.did_complete_task);

    // status walked draft -> replying -> describing -> ... -> finished
    let history = active.read(|s| s.status_history.clone());
    assert_eq!(history.first(), Some(&PlanStatus::Replying));
    assert!(history.contains(&PlanStatus::Describing));
    assert_eq!(history.last(), Some(&PlanStatus::Finished));

    // repo has commits beyond init: user prompt, replies, build
    let repo = harness.server.plan_repo(ORG, "p-tell-create");
    assert!(repo.commit_count().unwrap() >= 4);

    // exec-status short-circuited on the completion marker
    assert_eq!(harness.provider.num_requests_for("exec-m"), 0);
}

#[tokio::test]
async fn test_missing_file_prompt_and_skip() {
    let harness = TestHarness::new();
    let plan = harness.create_plan("p-tell-missing", "env plan");

    // auto-continue off so the plan stops after one planning reply
    let mut settings = super::helpers::role_named_settings();
    settings.auto_continue = false;
    harness
        .server
        .plan_fs(ORG, "p-tell-missing")
        .store_settings(&settings)
        .unwrap();

    harness.provider.route(
        "planner-m",
        "Setting up the env file.\n\n- secrets.env\n\n\
         <PlandexBlock lang=\"bash\" path=\"secrets.env\">\nSECRET=1\n</PlandexBlock>\n\
         <PlandexFinish/>",
    );
    // the resumed stream after the skip
    harness
        .provider
        .route("planner-m", "Skipping that file. All done.\n<PlandexFinish/>");
    harness
        .provider
        .route("describer-m", r#"{"commitMsg": "Discuss env setup", "wroteFiles": false}"#);
    harness.provider.route("summary-m", "Summary.");

    let req = TellRequest {
        prompt: "set up the env file".into(),
        project_paths: ["secrets.env".to_string()].into_iter().collect(),
        ..Default::default()
    };

    let active = tell(harness.server.clone(), plan, "main", USER, req)
        .await
        .unwrap();
    let (_sub, mut rx) = active.subscribe();

    // drive the client side: answer the missing-file prompt with skip
    let mut transcript = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let msg = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out")
            .expect("stream closed");
        match msg {
            StreamMessage::PromptMissingFile { path, auto_context } => {
                assert_eq!(path, "secrets.env");
                transcript.push(StreamMessage::PromptMissingFile { path, auto_context });
                assert!(active.respond_missing_file(MissingFileChoice::Skip));
            }
            StreamMessage::Finished => {
                transcript.push(StreamMessage::Finished);
                break;
            }
            StreamMessage::Multi { messages } => transcript.extend(messages),
            other => transcript.push(other),
        }
    }

    assert!(transcript
        .iter()
        .any(|m| matches!(m, StreamMessage::PromptMissingFile { .. })));

    // the skipped path is recorded, no build ran for it
    assert!(active.read(|s| s.skipped_paths.contains("secrets.env")));
    let fs = harness.server.plan_fs(ORG, "p-tell-missing");
    assert!(fs.load_results().unwrap().is_empty());

    // the stored reply is the pre-file prefix plus the post-skip content
    let convo = fs.load_conversation().unwrap();
    let reply = &convo.last().unwrap().message;
    assert!(reply.contains("Setting up the env file."));
    assert!(reply.contains("Skipping that file. All done."));
    assert!(!reply.contains("SECRET=1"));

    // the pause left its mark on the status history
    let history = active.read(|s| s.status_history.clone());
    assert!(history.contains(&PlanStatus::MissingFile));
}

#[tokio::test]
async fn test_auto_continue_until_all_subtasks_finished() {
    let harness = TestHarness::new();
    let plan = harness.create_plan("p-tell-continue", "continue plan");
    let fs = harness.server.plan_fs(ORG, "p-tell-continue");

    // seeded mid-plan state: A done, B and C pending
    let mut subtasks = vec![Subtask::new("A"), Subtask::new("B"), Subtask::new("C")];
    subtasks[0].is_finished = true;
    subtasks[1].uses_files = vec!["b.txt".into()];
    subtasks[2].uses_files = vec!["c.txt".into()];
    fs.store_subtasks(&subtasks).unwrap();

    fs.store_convo_message(&convo_message(
        1,
        ROLE_USER,
        "implement the plan",
        Default::default(),
    ))
    .unwrap();
    fs.store_convo_message(&convo_message(
        2,
        ROLE_ASSISTANT,
        "Working through the tasks.",
        ConvoMessageFlags {
            current_stage: CurrentStage {
                tell_stage: TellStage::Implementation,
                planning_phase: PlanningPhase::Tasks,
            },
            ..Default::default()
        },
    ))
    .unwrap();

    harness.provider.route(
        "coder-m",
        "Working on B.\n\n- b.txt\n\n\
         <PlandexBlock lang=\"txt\" path=\"b.txt\">\nb\n</PlandexBlock>\n\n\
         **B** has been completed.\n<PlandexFinish/>",
    );
    harness.provider.route(
        "coder-m",
        "Working on C.\n\n- c.txt\n\n\
         <PlandexBlock lang=\"txt\" path=\"c.txt\">\nc\n</PlandexBlock>\n\n\
         **C** has been completed.\n<PlandexFinish/>",
    );
    for _ in 0..2 {
        harness
            .provider
            .route("describer-m", r#"{"commitMsg": "Implement task", "wroteFiles": true}"#);
        harness.provider.route("summary-m", "Summary.");
    }

    let req = TellRequest {
        prompt: String::new(),
        is_user_continue: true,
        ..Default::default()
    };

    let active = tell(harness.server.clone(), plan, "main", USER, req)
        .await
        .unwrap();
    let (_sub, mut rx) = active.subscribe();

    let messages = collect_until_finished(&mut rx, Duration::from_secs(30)).await;
    assert!(matches!(messages.last(), Some(StreamMessage::Finished)));

    // two implementation iterations ran
    assert_eq!(harness.provider.num_requests_for("coder-m"), 2);

    // both subtasks got marked finished
    let subtasks = fs.load_subtasks().unwrap();
    assert!(subtasks.iter().all(|t| t.is_finished));

    // both files were built
    let results = fs.load_results().unwrap();
    let paths: HashSet<&str> = results.iter().map(|r| r.path.as_str()).collect();
    assert!(paths.contains("b.txt"));
    assert!(paths.contains("c.txt"));

    // the streamed reply text covers both iterations
    let text = reply_text(&messages);
    assert!(text.contains("Working on B."));
    assert!(text.contains("Working on C."));
}
