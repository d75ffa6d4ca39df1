//! One-shot request demo
//!
//! Sends a single non-streaming request through a session, then looks the
//! response up again and deletes it.

use anyhow::{Context, Result};
use responses_stream::prelude::*;
use responses_stream::HttpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let api_key = get_api_key().context("OPENAI_API_KEY is not set")?;
    let options = ClientOptions::builder()
        .api_key(api_key)
        .base_url(get_base_url(None))
        .retry(responses_stream::retry::RetryConfig::default())
        .build()?;

    let builder = ConversationRequestBuilder::new("gpt-4.1-mini").temperature(0.2);
    let session = ConversationSession::connect(options.clone(), builder)?;

    let snapshot = session
        .send_once(vec![ConversationMessage::user(
            "What's the capital of France? One word.",
        )])
        .await?;

    println!(
        "Answer: {}",
        snapshot.latest_assistant_text().unwrap_or("<no text>")
    );

    let Some(id) = snapshot.last_response_id else {
        return Ok(());
    };

    let transport = HttpTransport::new(options)?;
    let stored = transport.retrieve(&id).await?;
    println!("Stored response {} is {:?}", stored.id, stored.status);

    let deletion = transport.delete(&id).await?;
    println!("Deleted: {}", deletion.deleted);

    Ok(())
}
