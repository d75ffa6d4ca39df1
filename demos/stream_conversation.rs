//! Streaming conversation demo
//!
//! Streams two turns of a conversation, printing the assistant text as it
//! grows, then cancels a third turn after a short delay.
//!
//! Reads `OPENAI_API_KEY` and optionally `RESPONSES_BASE_URL` from the
//! environment.

use anyhow::{Context, Result};
use futures::StreamExt;
use responses_stream::prelude::*;
use responses_stream::{ReasoningPhase, ToolCallPhase, WebSearchPhase};
use std::io::Write;
use std::time::Duration;

fn render(snapshot: &ConversationStateSnapshot, printed: &mut usize) -> Result<()> {
    if let WebSearchPhase::Initiated { query: Some(query) } = &snapshot.web_search_phase {
        println!("\n[searching the web for '{}']", query);
    }
    if let ReasoningPhase::Completed { summary: Some(summary) } = &snapshot.reasoning_phase {
        println!("\n[reasoning: {}]", summary);
    }
    if let ToolCallPhase::Running { name: Some(name), .. } = &snapshot.tool_call_phase {
        println!("\n[calling tool {}]", name);
    }

    if snapshot.response_phase.is_streaming() {
        if let Some(text) = snapshot.latest_assistant_text() {
            if let Some(fresh) = text.get(*printed..) {
                print!("{}", fresh);
                std::io::stdout().flush()?;
            }
            *printed = text.len();
        }
    }
    Ok(())
}

async fn turn(session: &ConversationSession, history: &mut Vec<ConversationMessage>, prompt: &str) -> Result<()> {
    println!("\n> {}", prompt);
    history.push(ConversationMessage::user(prompt));

    let mut stream = session.start(history.clone()).await?;
    let mut printed = 0;
    let mut last = None;
    while let Some(snapshot) = stream.next().await {
        render(&snapshot, &mut printed)?;
        last = Some(snapshot);
    }

    match stream.end_reason().await {
        StreamEnd::Completed => println!(),
        StreamEnd::Cancelled => println!("\n[cancelled]"),
        StreamEnd::Failed(e) => println!("\n[failed: {}]", e),
    }

    if let Some(last) = last {
        *history = last.messages;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let api_key = get_api_key().context("OPENAI_API_KEY is not set")?;
    let options = ClientOptions::builder()
        .api_key(api_key)
        .base_url(get_base_url(None))
        .streaming_timeout(Duration::from_secs(60))
        .build()?;

    let builder = ConversationRequestBuilder::new("gpt-4.1-mini")
        .instructions("You are a concise assistant.")
        .max_output_tokens(400);
    let session = ConversationSession::connect(options, builder)?;

    let mut history = Vec::new();
    turn(&session, &mut history, "Name three rivers in Europe.").await?;
    turn(&session, &mut history, "Which of them is the longest?").await?;

    println!("\n> Write a long story about the sea.");
    history.push(ConversationMessage::user("Write a long story about the sea."));
    let mut stream = session.start(history.clone()).await?;
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while stream.next().await.is_some() {}
    })
    .await;
    session.cancel().await?;
    println!("\n[phase after cancel: {:?}]", session.snapshot().response_phase);

    Ok(())
}
