//! End-to-end runs of each workflow variant against a scripted model.

use std::sync::Arc;

use tokio_stream::StreamExt;

use hitl_engine::{
    MemoryCheckpointStore, OutputKind, ResumeRequest, StartRequest, WireEvent, WorkflowService,
};
use hitl_llm::{LlmClient, ScriptedProvider};
use hitl_types::{fields, ApprovalStatus, HitlError};
use hitl_workflows::{
    analysis, default_catalog, editor, sections, ExecutionReport, StaticAnalysisTool,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn service_with_tool(provider: ScriptedProvider, tool: StaticAnalysisTool) -> WorkflowService {
    let llm = Arc::new(LlmClient::new().with_provider(provider));
    let catalog = default_catalog(Arc::new(tool)).unwrap();
    WorkflowService::new(catalog, Arc::new(MemoryCheckpointStore::new()), llm)
}

fn service(provider: ScriptedProvider) -> WorkflowService {
    service_with_tool(provider, StaticAnalysisTool::new())
}

async fn start(svc: &WorkflowService, workflow: &str, query: &str) -> String {
    svc.start(StartRequest {
        workflow: workflow.into(),
        query: query.into(),
        file: None,
    })
    .await
    .unwrap()
    .thread_id
}

async fn collect(svc: &WorkflowService, thread_id: &str) -> Vec<WireEvent> {
    svc.stream(thread_id)
        .await
        .unwrap()
        .collect::<Vec<_>>()
        .await
}

async fn resume(svc: &WorkflowService, request: ResumeRequest) -> serde_json::Value {
    let thread_id = request.thread_id.clone();
    svc.resume(request).await.unwrap();
    let events = collect(svc, &thread_id).await;
    events.last().unwrap().to_json()
}

fn token_nodes(events: &[WireEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            WireEvent::Token { node, .. } => Some(node.clone()),
            _ => None,
        })
        .collect()
}

fn prompt_text(provider: &ScriptedProvider, index: usize) -> String {
    provider.requests()[index]
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Test 1: Review scenario reaches finished with output
// ---------------------------------------------------------------------------

#[tokio::test]
async fn review_start_approve_finishes() {
    let svc = service(
        ScriptedProvider::new()
            .with_reply("Rain falls. Puddles form.")
            .with_reply("Rain falls gently. Puddles form."),
    );
    let thread = start(&svc, "review", "Write two sentences about rain.").await;

    let events = collect(&svc, &thread).await;
    assert!(token_nodes(&events).iter().all(|n| n == "draft"));
    let status = events.last().unwrap().to_json();
    assert_eq!(status["status"], "user_feedback");
    assert_eq!(status["draft_content"], "Rain falls. Puddles form.");

    let status = resume(&svc, ResumeRequest::new(&thread, ApprovalStatus::Approved)).await;
    assert_eq!(status["status"], "finished");
    assert_eq!(status["final_output"], "Rain falls gently. Puddles form.");
}

// ---------------------------------------------------------------------------
// Test 2: Review feedback is embedded in the revision prompt
// ---------------------------------------------------------------------------

#[tokio::test]
async fn review_feedback_then_approve() {
    let provider = ScriptedProvider::new()
        .with_reply("A long draft.")
        .with_reply("Short draft.")
        .with_reply("Short final.");
    let svc = service(provider.clone());
    let thread = start(&svc, "review", "Write about rain.").await;
    collect(&svc, &thread).await;

    let status = resume(
        &svc,
        ResumeRequest::new(&thread, ApprovalStatus::Feedback).with_comment("Make it shorter"),
    )
    .await;
    assert_eq!(status["status"], "user_feedback");
    assert_eq!(status["draft_content"], "Short draft.");
    assert_eq!(status["revision_count"], 1);

    let revision = prompt_text(&provider, 1);
    assert!(revision.contains("Make it shorter"));
    assert!(revision.contains("A long draft."));

    let snapshot = svc.get_state(&thread).await.unwrap();
    let history = snapshot.state.messages();
    assert!(history.iter().all(|m| m.content != "Make it shorter"));

    let status = resume(&svc, ResumeRequest::new(&thread, ApprovalStatus::Approved)).await;
    assert_eq!(status["status"], "finished");
}

// ---------------------------------------------------------------------------
// Test 3: Sections plan of N titles and N approvals finishes aligned
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sections_write_each_planned_section() {
    let svc = service(
        ScriptedProvider::new()
            .with_reply("Notes about tides.")
            .with_reply("[\"Causes\", \"Effects\"]")
            .with_reply("The moon pulls.")
            .with_reply("Coasts flood."),
    );
    let thread = start(&svc, "sections", "Explain tides.").await;

    let events = collect(&svc, &thread).await;
    let nodes = token_nodes(&events);
    assert!(nodes.iter().all(|n| n == "research" || n == "generate_section"));
    let status = events.last().unwrap().to_json();
    assert_eq!(status["status"], "user_feedback");
    assert_eq!(status["plan"], serde_json::json!(["Causes", "Effects"]));
    assert_eq!(status["current_index"], 0);
    assert_eq!(status["current_chunk"], "The moon pulls.");

    let status = resume(&svc, ResumeRequest::new(&thread, ApprovalStatus::Approved)).await;
    assert_eq!(status["current_index"], 1);
    assert_eq!(status["current_chunk"], "Coasts flood.");

    let status = resume(&svc, ResumeRequest::new(&thread, ApprovalStatus::Approved)).await;
    assert_eq!(status["status"], "finished");
    assert_eq!(
        status["generated_sections"],
        serde_json::json!(["The moon pulls.", "Coasts flood."])
    );
    assert_eq!(
        status["final_output"],
        "## Causes\n\nThe moon pulls.\n\n## Effects\n\nCoasts flood."
    );
}

// ---------------------------------------------------------------------------
// Test 4: Sections revision uses the human-edited version
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sections_revision_uses_edited_content() {
    let provider = ScriptedProvider::new()
        .with_reply("Notes.")
        .with_reply("not a plan at all")
        .with_reply("Intro v1.")
        .with_reply("Intro v2.");
    let svc = service(provider.clone());
    let thread = start(&svc, "sections", "Explain tides.").await;
    let events = collect(&svc, &thread).await;
    let status = events.last().unwrap().to_json();
    assert_eq!(
        status["plan"],
        serde_json::json!(["Introduction", "Main Content", "Conclusion"])
    );

    let mut request =
        ResumeRequest::new(&thread, ApprovalStatus::Feedback).with_comment("Add a hook");
    request.edited_content = Some("My own intro.".into());
    let status = resume(&svc, request).await;
    assert_eq!(status["current_chunk"], "Intro v2.");

    let revision = prompt_text(&provider, 3);
    assert!(revision.contains("My own intro."));
    assert!(revision.contains("Add a hook"));

    let snapshot = svc.get_state(&thread).await.unwrap();
    assert!(!snapshot.state.contains(sections::EDITED_CONTENT));
    assert_eq!(snapshot.state.get_count(fields::REVISION_COUNT), 1);
}

// ---------------------------------------------------------------------------
// Test 5: Sections approval with an edited section keeps the human version
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sections_approved_edit_replaces_the_section() {
    let svc = service(
        ScriptedProvider::new()
            .with_reply("Notes.")
            .with_reply("[\"Only\"]")
            .with_reply("Model section."),
    );
    let thread = start(&svc, "sections", "Explain tides.").await;
    collect(&svc, &thread).await;

    let mut request = ResumeRequest::new(&thread, ApprovalStatus::Approved);
    request.edited_content = Some("Human section.".into());
    let status = resume(&svc, request).await;
    assert_eq!(status["status"], "finished");
    assert_eq!(status["generated_sections"], serde_json::json!(["Human section."]));
    assert_eq!(status["final_output"], "## Only\n\nHuman section.");
}

// ---------------------------------------------------------------------------
// Test 6: Analysis without a file still reaches the first interrupt
// ---------------------------------------------------------------------------

#[tokio::test]
async fn analysis_without_file_pauses_for_code_review() {
    let svc = service(ScriptedProvider::new().with_reply("1. Load. 2. Average."));
    let thread = start(&svc, "analysis", "What is the average price?").await;

    let events = collect(&svc, &thread).await;
    let nodes = token_nodes(&events);
    assert!(!nodes.iter().any(|n| n == "code_generation" || n == "human_review"));
    let status = events.last().unwrap().to_json();
    assert_eq!(status["status"], "code_review");
    assert_eq!(status["analysis_plan"], "1. Load. 2. Average.");

    let snapshot = svc.get_state(&thread).await.unwrap();
    assert_eq!(snapshot.next, vec!["code_generation"]);
    assert_eq!(
        snapshot.state.get_str(analysis::DATA_SUMMARY),
        Some(analysis::NO_FILE_SUMMARY)
    );
}

// ---------------------------------------------------------------------------
// Test 7: Analysis full cycle with a revision loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn analysis_revision_pauses_at_code_review_again() {
    let tool = StaticAnalysisTool::new();
    let svc = service_with_tool(
        ScriptedProvider::new()
            .with_reply("Plan.")
            .with_reply("```python\nprint(df['price'].mean())\n```")
            .with_reply("```python\nfig = df.plot().figure\nsave_visualization(fig, 'p')\n```")
            .with_reply("```python\nprint(df['price'].median())\n```")
            .with_reply("```python\nprint('chart')\n```")
            .with_reply("Prices average 12.33."),
        tool.clone(),
    );
    let thread = start(&svc, "analysis", "Average price?").await;
    collect(&svc, &thread).await;

    let status = resume(&svc, ResumeRequest::new(&thread, ApprovalStatus::Approved)).await;
    assert_eq!(status["status"], "user_feedback");
    assert_eq!(status["code"], "print(df['price'].mean())");
    assert_eq!(status["execution_results"], "mean price: 12.33");
    assert_eq!(status["visualization_paths"], serde_json::json!(["chart.png"]));

    let status = resume(
        &svc,
        ResumeRequest::new(&thread, ApprovalStatus::Feedback).with_comment("Use the median"),
    )
    .await;
    assert_eq!(status["status"], "code_review");

    let status = resume(
        &svc,
        ResumeRequest::new(&thread, ApprovalStatus::Feedback).with_comment("Use the median"),
    )
    .await;
    assert_eq!(status["status"], "user_feedback");
    assert_eq!(status["code"], "print(df['price'].median())");

    let status = resume(&svc, ResumeRequest::new(&thread, ApprovalStatus::Approved)).await;
    assert_eq!(status["status"], "finished");
    assert_eq!(status["final_output"], "Prices average 12.33.");
    assert_eq!(tool.executed().len(), 4);
}

// ---------------------------------------------------------------------------
// Test 8: Failed analysis code is recorded, not fatal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn analysis_failed_code_is_reported_as_results() {
    let tool = StaticAnalysisTool::new().with_report(ExecutionReport::failed("NameError: x"));
    let svc = service_with_tool(
        ScriptedProvider::new()
            .with_reply("Plan.")
            .with_reply("print(x)")
            .with_reply("print('no chart')"),
        tool,
    );
    let thread = start(&svc, "analysis", "Average price?").await;
    collect(&svc, &thread).await;

    svc.resume(ResumeRequest::new(&thread, ApprovalStatus::Approved))
        .await
        .unwrap();
    let events = collect(&svc, &thread).await;
    assert!(events.iter().any(|e| matches!(
        e,
        WireEvent::Token { node, kind: OutputKind::Error, .. } if node == "execute_code"
    )));
    let status = events.last().unwrap().to_json();
    assert_eq!(status["status"], "user_feedback");
    assert_eq!(status["execution_results"], "Execution failed:\nNameError: x");
}

// ---------------------------------------------------------------------------
// Test 9: Interrupt is analysis-only and feeds the next revision
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interrupt_only_on_analysis() {
    let provider = ScriptedProvider::new()
        .with_reply("Plan.")
        .with_reply("print(1)");
    let svc = service(provider.clone());
    let thread = start(&svc, "analysis", "Average price?").await;
    collect(&svc, &thread).await;

    let ack = svc.interrupt(&thread, "Focus on 2021").await.unwrap();
    assert_eq!(ack.status, "interrupted");
    let snapshot = svc.get_state(&thread).await.unwrap();
    assert!(snapshot.state.get_bool(analysis::INTERRUPT_REQUESTED));

    svc.resume(ResumeRequest::new(&thread, ApprovalStatus::Feedback))
        .await
        .unwrap();
    collect(&svc, &thread).await;
    assert!(prompt_text(&provider, 1).contains("Focus on 2021"));

    let review = start(&svc, "review", "rain").await;
    assert!(matches!(
        svc.interrupt(&review, "stop").await,
        Err(HitlError::ThreadNotFound { .. })
    ));
    collect(&svc, &review).await;
    let err = svc.interrupt(&review, "stop").await.unwrap_err();
    assert_eq!(err.http_status(), Some(422));
}

// ---------------------------------------------------------------------------
// Test 10: Editor edits reach the revision request verbatim
// ---------------------------------------------------------------------------

#[tokio::test]
async fn editor_sentence_edit_is_incorporated() {
    let provider = ScriptedProvider::new()
        .with_reply("Rain falls. Clouds gather. Streets shine.")
        .with_reply("Rain falls. Clouds gather. Wet streets glitter under lamps.")
        .with_reply("Rain falls and clouds gather. Wet streets glitter under lamps.");
    let svc = service(provider.clone());
    let thread = start(&svc, "editor", "Describe a rainy night.").await;

    let events = collect(&svc, &thread).await;
    let status = events.last().unwrap().to_json();
    assert_eq!(status["status"], "editing");
    assert_eq!(status["sentences"]["sentence_2"], "Streets shine.");

    let view = editor::edit_sentence(&svc, &thread, "sentence_2", "Wet streets glitter.")
        .await
        .unwrap();
    assert_eq!(
        view.get("sentence_2").unwrap().edited.as_deref(),
        Some("Wet streets glitter.")
    );
    editor::feedback_sentence(&svc, &thread, "sentence_0", "more vivid")
        .await
        .unwrap();

    let status = resume(&svc, ResumeRequest::new(&thread, ApprovalStatus::Editing)).await;
    assert_eq!(status["status"], "editing");
    assert_eq!(status["revision_count"], 1);
    assert_eq!(status["sentences"]["sentence_2"], "Wet streets glitter under lamps.");

    let revision = prompt_text(&provider, 1);
    assert!(revision.contains("Wet streets glitter."));
    assert!(revision.contains("more vivid"));

    let view = editor::sentences(&svc, &thread).await.unwrap();
    assert!(view.sentences.iter().all(|s| s.edited.is_none() && s.feedback.is_none()));

    svc.resume(ResumeRequest::new(&thread, ApprovalStatus::Approved))
        .await
        .unwrap();
    let events = collect(&svc, &thread).await;
    assert!(token_nodes(&events).iter().any(|n| n == "finalize"));
    let status = events.last().unwrap().to_json();
    assert_eq!(status["status"], "finished");
    assert_eq!(
        status["final_output"],
        "Rain falls and clouds gather. Wet streets glitter under lamps."
    );
    assert_eq!(provider.requests().len(), 3);
    assert!(prompt_text(&provider, 2).contains("Wet streets glitter under lamps."));
}

// ---------------------------------------------------------------------------
// Test 11: Editor with nothing to incorporate skips the model
// ---------------------------------------------------------------------------

#[tokio::test]
async fn editor_without_edits_keeps_content() {
    let provider = ScriptedProvider::new().with_reply("One. Two.");
    let svc = service(provider.clone());
    let thread = start(&svc, "editor", "Count.").await;
    collect(&svc, &thread).await;

    let status = resume(&svc, ResumeRequest::new(&thread, ApprovalStatus::Editing)).await;
    assert_eq!(status["status"], "editing");
    assert_eq!(status["current_content"], "One. Two.");
    assert_eq!(provider.requests().len(), 1);
}

// ---------------------------------------------------------------------------
// Test 12: Sentence operations reject bad targets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sentence_operations_validate_target() {
    let svc = service(
        ScriptedProvider::new()
            .with_reply("One. Two.")
            .with_reply("Draft."),
    );
    let thread = start(&svc, "editor", "Count.").await;
    collect(&svc, &thread).await;

    let err = editor::edit_sentence(&svc, &thread, "sentence_7", "x")
        .await
        .unwrap_err();
    assert!(matches!(err, HitlError::InvalidUpdate { .. }));

    let review = start(&svc, "review", "rain").await;
    collect(&svc, &review).await;
    let err = editor::sentences(&svc, &review).await.unwrap_err();
    assert!(matches!(err, HitlError::InvalidUpdate { .. }));

    let err = editor::sentences(&svc, "missing").await.unwrap_err();
    assert_eq!(err.http_status(), Some(404));
}

// ---------------------------------------------------------------------------
// Test 13: Streams never surface interrupt points
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_streams_never_emit_interrupt_tokens() {
    let svc = service(ScriptedProvider::new());
    for workflow in ["review", "sections", "analysis", "editor"] {
        let thread = start(&svc, workflow, "Tell me about rivers.").await;
        let events = collect(&svc, &thread).await;
        let info = svc.catalog().get(workflow).unwrap();
        let interrupts = info.graph().interrupt_points();
        assert!(token_nodes(&events)
            .iter()
            .all(|node| !interrupts.contains(node)));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }
}

// ---------------------------------------------------------------------------
// Test 14: Catalog lists all four variants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn catalog_lists_variants() {
    let svc = service(ScriptedProvider::new());
    let names: Vec<String> = svc.workflows().into_iter().map(|w| w.name).collect();
    assert_eq!(names, ["review", "sections", "analysis", "editor"]);
    let analysis = svc
        .workflows()
        .into_iter()
        .find(|w| w.name == "analysis")
        .unwrap();
    assert!(analysis.supports_interrupt);
    assert_eq!(analysis.interrupt_points, ["code_generation", "human_review"]);
}
