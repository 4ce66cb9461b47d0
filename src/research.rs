//! Research report generation.
//!
//! Builds the research prompt for a topic and streams the model's answer
//! into a [`ResearchDocument`]. If the stream fails part-way the text that
//! already arrived is handed back inside the error so it stays visible.

use tracing::{info, warn};

use crate::error::ResearchError;
use crate::llm::{ChunkSink, TextGenerator};
use crate::models::ResearchDocument;

/// Build the research prompt for `topic`.
pub fn research_prompt(topic: &str) -> String {
    format!(
        "You are a research analyst. Write a thorough, well-structured research report on the \
         following topic.\n\n\
         Topic: {topic}\n\n\
         Requirements:\n\
         - Start with a one-paragraph executive summary.\n\
         - Organise the body into clearly titled sections (background, current state, key \
           findings, challenges, outlook).\n\
         - Include concrete figures, dates and named examples where they are well established.\n\
         - Where quantitative data would help, present it as a markdown table.\n\
         - Where a chart would help, include a short R code block fenced as ```{{r}} that \
           builds the data inline and draws the chart with base graphics or ggplot2.\n\
         - End with a short list of open questions.\n\
         Write in markdown."
    )
}

/// Stream a research report on `topic` into a new [`ResearchDocument`].
///
/// Every delta is appended to the document and forwarded to `on_chunk`.
/// On success the returned document is complete.
pub async fn conduct_research(
    generator: &dyn TextGenerator,
    topic: &str,
    max_tokens: u32,
    streaming: bool,
    on_chunk: Option<ChunkSink<'_>>,
) -> Result<ResearchDocument, ResearchError> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(ResearchError::EmptyTopic);
    }

    let mut doc = ResearchDocument::new(topic);
    let prompt = research_prompt(topic);

    let mut on_chunk = on_chunk;
    let result = {
        let mut forward = |delta: &str| {
            doc.append(delta);
            if let Some(cb) = on_chunk.as_mut() {
                cb(delta);
            }
        };
        generator
            .query(&prompt, max_tokens, streaming, Some(&mut forward))
            .await
    };

    match result {
        Ok(text) => {
            // Single-shot generators may not echo through the callback.
            if doc.raw_text.is_empty() {
                doc.raw_text = text;
            }
            doc.complete();
            info!(
                operation = "research",
                topic = %doc.topic,
                chars = doc.raw_text.len(),
                "Research complete"
            );
            Ok(doc)
        }
        Err(source) => {
            warn!(
                operation = "research",
                topic = %doc.topic,
                partial_chars = doc.raw_text.len(),
                error = %source,
                "Research query failed"
            );
            Err(ResearchError::Query {
                source,
                partial: Box::new(doc),
            })
        }
    }
}
