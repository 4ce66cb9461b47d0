//! Research document → slide outline.
//!
//! [`generate_outline`] asks the model to restructure a finished research
//! document under a fixed slide grammar, then runs [`normalize`] over the
//! response. Normalization is a pure function and idempotent:
//! `normalize(normalize(s)) == normalize(s)` for every `s`.
//!
//! # Normalization steps
//!
//! 1. Strip a leading ```` ```markdown ```` / ```` ```md ```` / bare ```` ``` ````
//!    wrapper. A fence that opens a statistical block (```` ```{r} ````) is
//!    never stripped.
//! 2. Strip a trailing bare ```` ``` ```` unless it closes an open code block.
//! 3. Trim surrounding whitespace. Steps 1–3 repeat until nothing changes.
//! 4. Repair prose lines: slide breaks become exactly `---`; pipe tables get
//!    outer pipes, a missing delimiter row, and a blank line before them.
//!    Code blocks and front matter are left byte-for-byte alone.

use tracing::info;

use crate::error::TransformError;
use crate::llm::{ChunkSink, TextGenerator};
use crate::markdown::{classify_lines, ends_inside_code, is_break_line, parse_fence, LineKind};
use crate::models::{Outline, OutlineFormat, ResearchDocument};

/// Build the outline prompt for a research document.
pub fn outline_prompt(document: &ResearchDocument) -> String {
    format!(
        "Convert the research report below into a slide-deck outline in markdown.\n\n\
         Follow this structure exactly:\n\
         - The first line is the deck title as a level-1 heading (`# Title`).\n\
         - Each slide starts with a level-2 heading (`## Slide title`).\n\
         - Separate slides with a line containing exactly `---` and nothing else.\n\
         - Keep each slide to at most five concise bullet points.\n\
         - Present numeric comparisons as markdown tables with pipe-delimited rows \
           (`| a | b |`) and a `| --- | --- |` delimiter row after the header.\n\
         - Where a chart or computed table helps, include an R code block fenced as \
           ```{{r}} ... ```. Put `#| kind: plot` or `#| kind: table` as its first line. \
           The code must build its data inline and must not read files.\n\
         - Do not wrap the whole answer in a code fence and do not add commentary.\n\n\
         Topic: {topic}\n\n\
         Research report:\n\n{body}",
        topic = document.topic,
        body = document.raw_text
    )
}

/// Turn a completed research document into a normalized [`Outline`].
pub async fn generate_outline(
    generator: &dyn TextGenerator,
    document: &ResearchDocument,
    max_tokens: u32,
    streaming: bool,
    on_chunk: Option<ChunkSink<'_>>,
) -> Result<Outline, TransformError> {
    if document.raw_text.trim().is_empty() {
        return Err(TransformError::EmptySourceDocument);
    }
    if !document.is_complete {
        return Err(TransformError::IncompleteSourceDocument);
    }

    let prompt = outline_prompt(document);
    let raw = generator
        .query(&prompt, max_tokens, streaming, on_chunk)
        .await?;

    let normalized_text = normalize(&raw);
    if normalized_text.is_empty() {
        return Err(TransformError::EmptyOutline);
    }
    let slide_breaks = slide_break_offsets(&normalized_text);

    info!(
        operation = "outline",
        document = %document.id,
        slides = slide_breaks.len() + 1,
        "Outline generated"
    );

    Ok(Outline {
        source_document_ref: document.id.clone(),
        normalized_text,
        slide_breaks,
        format: OutlineFormat::Markdown,
        is_complete: true,
    })
}

// ============ Normalization ============

/// Normalize raw model output into outline text. Idempotent.
pub fn normalize(raw: &str) -> String {
    let mut text = raw.replace("\r\n", "\n").trim().to_string();
    loop {
        let next = strip_wrappers_once(&text);
        if next == text {
            break;
        }
        text = next;
    }

    let lines: Vec<&str> = text.split('\n').collect();
    repair_lines(&lines).join("\n").trim().to_string()
}

fn is_wrapper_fence(line: &str) -> bool {
    match parse_fence(line) {
        Some(f) if f.marker == '`' => {
            let info = f.info.to_ascii_lowercase();
            matches!(info.as_str(), "" | "markdown" | "md" | "marp")
        }
        _ => false,
    }
}

fn is_bare_fence(line: &str) -> bool {
    matches!(parse_fence(line), Some(f) if f.marker == '`' && f.info.is_empty())
}

fn strip_wrappers_once(text: &str) -> String {
    let mut lines: Vec<&str> = text.split('\n').collect();

    if lines.first().is_some_and(|l| is_wrapper_fence(l)) {
        lines.remove(0);
    }

    if let Some(last) = lines.last() {
        if is_bare_fence(last) && !ends_inside_code(&lines[..lines.len() - 1]) {
            lines.pop();
        }
    }

    lines.join("\n").trim().to_string()
}

fn repair_lines(lines: &[&str]) -> Vec<String> {
    let kinds = classify_lines(lines);
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;

    while i < lines.len() {
        if kinds[i] != LineKind::Prose {
            out.push(lines[i].to_string());
            i += 1;
            continue;
        }

        if is_break_line(lines[i]) {
            out.push("---".to_string());
            i += 1;
            continue;
        }

        if let Some(end) = table_run_end(lines, &kinds, i) {
            if out.last().is_some_and(|prev| !prev.trim().is_empty()) {
                out.push(String::new());
            }
            out.extend(repair_table(&lines[i..end]));
            i = end;
            continue;
        }

        out.push(lines[i].to_string());
        i += 1;
    }

    out
}

// ============ Tables ============

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    if t.is_empty() || is_break_line(t) || t.starts_with('#') || t.starts_with('>') {
        return false;
    }
    if t.starts_with("- ") || t.starts_with("* ") || t.starts_with("+ ") {
        return false;
    }
    split_cells(t).len() >= 2 || (t.starts_with('|') && t.len() > 1)
}

/// End (exclusive) of a table starting at `start`, if one starts there.
fn table_run_end(lines: &[&str], kinds: &[LineKind], start: usize) -> Option<usize> {
    let mut end = start;
    while end < lines.len() && kinds[end] == LineKind::Prose && is_table_row(lines[end]) {
        end += 1;
    }
    if end - start < 2 {
        return None;
    }
    let first = lines[start].trim();
    if first.starts_with('|') || is_delimiter_row(lines[start + 1]) {
        Some(end)
    } else {
        None
    }
}

/// Split a row into cells, ignoring outer pipes and escaped `\|`.
fn split_cells(row: &str) -> Vec<String> {
    let mut t = row.trim();
    if let Some(rest) = t.strip_prefix('|') {
        t = rest;
    }
    if t.ends_with('|') && !t.ends_with("\\|") {
        t = &t[..t.len() - 1];
    }

    let mut cells = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in t.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                current.push(c);
                escaped = true;
            }
            '|' => cells.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    cells.push(current);
    cells
}

fn is_delimiter_row(row: &str) -> bool {
    let cells = split_cells(row);
    !cells.is_empty()
        && cells.iter().all(|cell| {
            let c = cell.trim();
            let c = c.strip_prefix(':').unwrap_or(c);
            let c = c.strip_suffix(':').unwrap_or(c);
            !c.is_empty() && c.chars().all(|ch| ch == '-')
        })
}

fn with_outer_pipes(row: &str) -> String {
    let t = row.trim();
    let mut s = String::with_capacity(t.len() + 4);
    if !t.starts_with('|') {
        s.push_str("| ");
    }
    s.push_str(t);
    if !t.ends_with('|') || t.ends_with("\\|") {
        s.push_str(" |");
    }
    s
}

fn repair_table(rows: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = rows.iter().map(|r| with_outer_pipes(r)).collect();
    if !is_delimiter_row(&out[1]) {
        let cols = split_cells(&out[0]).len().max(1);
        let delimiter = format!("|{}", " --- |".repeat(cols));
        out.insert(1, delimiter);
    }
    out
}

// ============ Slide breaks ============

/// Byte offsets of every slide-break line outside code and front matter.
pub fn slide_break_offsets(text: &str) -> Vec<usize> {
    let lines: Vec<&str> = text.split('\n').collect();
    let kinds = classify_lines(&lines);
    let mut offsets = Vec::new();
    let mut offset = 0;
    for (line, kind) in lines.iter().zip(kinds.iter()) {
        if kind.is_prose() && is_break_line(line) {
            offsets.push(offset);
        }
        offset += line.len() + 1;
    }
    offsets
}
