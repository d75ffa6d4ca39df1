//! Frame-to-snapshot scenarios
//!
//! Drives the pure path, `FrameStream` → `parse_events` → `reduce`, with
//! recorded frame sequences and no network.

use futures::StreamExt;
use responses_stream::{
    ConversationMessage, ConversationStateSnapshot, FileSearchPhase, FrameStream, MessageRole,
    RawFrame, ReasoningPhase, ResponsePhase, ToolCallPhase, WebSearchPhase, parse_events, reduce,
};
use serde_json::json;

fn frame(value: serde_json::Value) -> RawFrame {
    RawFrame::new(value.to_string())
}

async fn fold(initial: ConversationStateSnapshot, frames: Vec<RawFrame>) -> Vec<ConversationStateSnapshot> {
    let stream = FrameStream::from_frames(frames.into_iter().map(Ok).collect());
    let events: Vec<_> = parse_events(stream).collect().await;

    let mut snapshots = Vec::new();
    let mut current = initial;
    for event in events {
        current = reduce(&current, &event.unwrap());
        snapshots.push(current.clone());
    }
    snapshots
}

fn transcript(snapshot: &ConversationStateSnapshot) -> Vec<(MessageRole, &str)> {
    snapshot
        .messages
        .iter()
        .map(|m| (m.role, m.text.as_str()))
        .collect()
}

fn completed_response(id: &str, text: &str) -> serde_json::Value {
    json!({
        "id": id,
        "created_at": 1700000100,
        "status": "completed",
        "conversation_id": "conv_1",
        "output": [{
            "id": "msg_out",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "output_text", "text": text}]
        }]
    })
}

#[tokio::test]
async fn test_hello_scenario() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();

    let frames = vec![
        RawFrame::named(
            "response.created",
            json!({"response": {"id": "resp_1", "created_at": 1700000000, "output": []}}).to_string(),
        ),
        frame(json!({"type": "response.in_progress", "response_id": "resp_1"})),
        frame(json!({"type": "response.output_text.delta", "delta": "Hel"})),
        RawFrame::new("{\"type\": \"response.output_text.delta\", \"delta\": "),
        frame(json!({"type": "response.output_text.delta", "delta": {"text": "lo"}})),
        frame(json!({"type": "response.completed", "response": completed_response("resp_1", "Hello")})),
        RawFrame::new("[DONE]"),
    ];

    let snapshots = fold(
        ConversationStateSnapshot::new(vec![ConversationMessage::user("Hi")]),
        frames,
    )
    .await;

    let phases: Vec<_> = snapshots.iter().map(|s| s.response_phase.clone()).collect();
    assert_eq!(
        phases,
        vec![
            ResponsePhase::AwaitingResponse,
            ResponsePhase::Streaming,
            ResponsePhase::Streaming,
            ResponsePhase::Streaming,
            ResponsePhase::Streaming,
            ResponsePhase::Completed,
            ResponsePhase::Completed,
        ]
    );

    // The malformed frame leaves the transcript untouched
    assert_eq!(snapshots[2].latest_assistant_text(), Some("Hel"));
    assert_eq!(snapshots[3].latest_assistant_text(), Some("Hel"));
    assert_eq!(snapshots[4].latest_assistant_text(), Some("Hello"));

    let last = snapshots.last().unwrap();
    assert_eq!(
        transcript(last),
        vec![(MessageRole::User, "Hi"), (MessageRole::Assistant, "Hello")]
    );
    assert_eq!(last.messages[1].id, "msg_out");
    assert_eq!(last.last_response_id.as_deref(), Some("resp_1"));
    assert_eq!(last.conversation_id.as_deref(), Some("conv_1"));
    assert_eq!(last.created_at, Some(1700000100));
}

#[tokio::test]
async fn test_tool_assisted_answer() {
    let frames = vec![
        frame(json!({"type": "response.created", "response": {"id": "resp_2", "output": []}})),
        frame(json!({"type": "response.reasoning_summary_text.delta", "delta": "Need fresh data"})),
        frame(json!({"type": "response.reasoning_summary_text.done", "text": "Need fresh data"})),
        frame(json!({"type": "response.web_search_call.in_progress", "query": "weather paris"})),
        frame(json!({"type": "response.web_search_call.searching"})),
        frame(json!({"type": "response.web_search_call.completed"})),
        frame(json!({"type": "response.file_search_call.searching"})),
        frame(json!({"type": "response.file_search_call.completed"})),
        frame(json!({
            "type": "response.output_item.added",
            "item": {"type": "tool_call", "name": "lookup", "tool_type": "function"}
        })),
        frame(json!({
            "type": "response.output_item.done",
            "item": {"type": "tool_call", "name": "lookup", "tool_type": "function"}
        })),
        frame(json!({"type": "response.output_text.delta", "delta": "Sunny"})),
        frame(json!({"type": "response.completed", "response": completed_response("resp_2", "Sunny, 21°C")})),
    ];

    let snapshots = fold(
        ConversationStateSnapshot::new(vec![ConversationMessage::user("Weather in Paris?")]),
        frames,
    )
    .await;
    let last = snapshots.last().unwrap();

    assert_eq!(last.response_phase, ResponsePhase::Completed);
    assert_eq!(last.web_search_phase, WebSearchPhase::Completed);
    assert_eq!(last.file_search_phase, FileSearchPhase::Completed);
    assert!(matches!(last.reasoning_phase, ReasoningPhase::Completed { .. }));
    assert!(matches!(last.tool_call_phase, ToolCallPhase::Completed { .. }));
    assert_eq!(
        transcript(last),
        vec![
            (MessageRole::User, "Weather in Paris?"),
            (MessageRole::Assistant, "Sunny, 21°C")
        ]
    );

    // Sub-phase traffic never disturbs the response phase
    assert!(
        snapshots[1..10]
            .iter()
            .all(|s| s.response_phase == ResponsePhase::AwaitingResponse)
    );
}

#[tokio::test]
async fn test_failed_response() {
    let frames = vec![
        frame(json!({"type": "response.created", "response": {"id": "resp_3", "output": []}})),
        frame(json!({"type": "response.output_text.delta", "delta": "Par"})),
        frame(json!({
            "type": "response.failed",
            "response": {
                "id": "resp_3",
                "status": "failed",
                "output": [],
                "error": {"message": "The server had an error", "code": "server_error"}
            }
        })),
    ];

    let snapshots = fold(
        ConversationStateSnapshot::new(vec![ConversationMessage::user("Hi")]),
        frames,
    )
    .await;
    let last = snapshots.last().unwrap();

    assert_eq!(
        last.response_phase,
        ResponsePhase::Failed("The server had an error".to_string())
    );
    assert_eq!(last.last_response_id.as_deref(), Some("resp_3"));
}
