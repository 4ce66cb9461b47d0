//! Outline → slide deck.
//!
//! [`DeckCompiler::assemble`] produces the final deck markdown:
//!
//! 1. Find fenced R blocks (```` ```{r} ````, ```` ```{r label} ````, ```` ```r ````).
//! 2. Execute them through the [`ExecutionGateway`] with bounded concurrency.
//! 3. Replace each block with its output, in document order. A block whose
//!    execution fails stays exactly as written.
//! 4. Repair slide breaks.
//! 5. Add the Marp directive front matter for the chosen template.
//!
//! [`DeckCompiler::compile`] then hands the markup to a [`SlideRenderer`].

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::CompileError;
use crate::gateway::ExecutionGateway;
use crate::markdown::{classify_lines, frontmatter_end, is_break_line, parse_fence, LineKind};
use crate::models::{Artifact, CodeBlock, CodeKind, CodeLanguage, MimeType, Outline, Template};
use crate::render::SlideRenderer;

pub struct DeckCompiler {
    gateway: Arc<ExecutionGateway>,
    renderer: Arc<dyn SlideRenderer>,
    max_parallel: usize,
}

impl DeckCompiler {
    pub fn new(
        gateway: Arc<ExecutionGateway>,
        renderer: Arc<dyn SlideRenderer>,
        max_parallel: usize,
    ) -> Self {
        Self {
            gateway,
            renderer,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Build deck markdown without rendering it.
    pub async fn assemble(&self, outline: &Outline, template: &Template) -> Result<String, CompileError> {
        let text = outline.normalized_text.as_str();
        if text.trim().is_empty() {
            return Err(CompileError::EmptyOutline);
        }

        let blocks = extract_code_blocks(text);
        let runs: Vec<_> = blocks
            .iter()
            .map(|block| self.gateway.execute(&block.raw_source, block.kind))
            .collect();
        let results: Vec<_> = stream::iter(runs)
            .buffered(self.max_parallel)
            .collect()
            .await;

        let mut body = String::with_capacity(text.len());
        let mut cursor = 0;
        let mut substituted = 0;
        for (block, result) in blocks.iter().zip(results) {
            body.push_str(&text[cursor..block.position_in_outline]);
            let end = block.position_in_outline + block.len;
            match result {
                Ok(artifact) => {
                    body.push_str(&artifact_markup(&artifact));
                    substituted += 1;
                }
                Err(e) => {
                    warn!(
                        operation = "compile",
                        kind = %block.kind,
                        position = block.position_in_outline,
                        error = %e,
                        "Code block left verbatim"
                    );
                    body.push_str(&text[block.position_in_outline..end]);
                }
            }
            cursor = end;
        }
        body.push_str(&text[cursor..]);

        let deck = apply_directives(&repair_slide_breaks(&body), template);
        info!(
            operation = "compile",
            template = template.name,
            blocks = blocks.len(),
            substituted,
            "Deck assembled"
        );
        Ok(deck)
    }

    /// Assemble and render.
    pub async fn compile(&self, outline: &Outline, template: &Template) -> Result<String, CompileError> {
        let markup = self.assemble(outline, template).await?;
        self.renderer.render(&markup).await
    }

    pub fn renderer(&self) -> &Arc<dyn SlideRenderer> {
        &self.renderer
    }
}

// ============ Code blocks ============

/// Whether a fence info string opens an R block.
fn is_statistical_info(info: &str) -> bool {
    let inner = info
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(info);
    let lang = inner
        .split(|c: char| c.is_whitespace() || c == ',')
        .next()
        .unwrap_or("");
    lang == "r" || lang == "R"
}

/// `kind=...` from chunk options such as `{r chart, kind="table"}`.
fn header_kind(info: &str) -> Option<CodeKind> {
    let inner = info.strip_prefix('{')?.strip_suffix('}')?;
    inner.split(',').find_map(|opt| {
        let (key, value) = opt.split_once('=')?;
        let key = key.trim().rsplit(char::is_whitespace).next()?;
        if key != "kind" {
            return None;
        }
        value.trim().trim_matches(|c| c == '"' || c == '\'').parse().ok()
    })
}

/// `#| kind: table` inside the block body.
fn tagged_kind(source: &str) -> Option<CodeKind> {
    source.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix("#|")?;
        let (key, value) = rest.split_once(':')?;
        if key.trim() != "kind" {
            return None;
        }
        value.trim().trim_matches(|c| c == '"' || c == '\'').parse().ok()
    })
}

const PLOT_CALLS: &[&str] = &[
    "plot", "ggplot", "hist", "barplot", "boxplot", "lines", "points", "pie", "curve",
    "heatmap", "image", "matplot", "qplot",
];

const TABLE_CALLS: &[&str] = &[
    "kable", "data.frame", "table", "xtable", "gt", "datatable", "tibble",
];

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Whether `code` calls any of `names` as a function (`name(`), ignoring
/// identifiers that merely end in the name (`readLines(` is not `lines(`).
fn has_call(code: &str, names: &[&str]) -> bool {
    names.iter().any(|name| {
        let pattern = format!("{}(", name);
        code.match_indices(&pattern).any(|(i, _)| {
            code[..i]
                .chars()
                .next_back()
                .map_or(true, |c| !is_ident_char(c))
        })
    })
}

fn strip_comments(source: &str) -> String {
    source
        .lines()
        .map(|l| l.split('#').next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decide what a block produces. An explicit tag wins; otherwise plotting
/// calls mean a plot, table construction alone means a table, and anything
/// else is drawn as a plot.
pub fn classify_kind(info: &str, source: &str) -> CodeKind {
    if let Some(kind) = tagged_kind(source).or_else(|| header_kind(info)) {
        return kind;
    }
    let code = strip_comments(source);
    if has_call(&code, PLOT_CALLS) || code.contains("geom_") {
        CodeKind::Plot
    } else if has_call(&code, TABLE_CALLS) {
        CodeKind::Table
    } else {
        CodeKind::Plot
    }
}

/// All closed R blocks in `text`, in document order. Unclosed blocks and
/// other languages are skipped.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let lines: Vec<&str> = text.split('\n').collect();
    let kinds = classify_lines(&lines);

    let mut offsets = Vec::with_capacity(lines.len());
    let mut offset = 0;
    for line in &lines {
        offsets.push(offset);
        offset += line.len() + 1;
    }

    let mut blocks = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if kinds[i] != LineKind::FenceOpen {
            i += 1;
            continue;
        }
        let info = parse_fence(lines[i]).map(|f| f.info).unwrap_or_default();
        let close = (i + 1..lines.len()).find(|&j| kinds[j] == LineKind::FenceClose);
        let Some(close) = close else {
            break;
        };

        if is_statistical_info(&info) {
            let raw_source = lines[i + 1..close].join("\n");
            let start = offsets[i];
            let end = offsets[close] + lines[close].len();
            blocks.push(CodeBlock {
                language: CodeLanguage::Statistical,
                kind: classify_kind(&info, &raw_source),
                raw_source,
                position_in_outline: start,
                len: end - start,
            });
        }
        i = close + 1;
    }
    blocks
}

// ============ Substitution ============

fn artifact_markup(artifact: &Artifact) -> String {
    match artifact.mime_type {
        MimeType::Svg => format!(
            "<img src=\"data:image/svg+xml;base64,{}\" style=\"max-width:100%;max-height:70vh;\">",
            artifact.payload_base64()
        ),
        MimeType::Html => {
            let html = artifact.payload_text();
            let lines: Vec<&str> = html.lines().filter(|l| !l.trim().is_empty()).collect();
            format!("<div class=\"deck-table\">\n{}\n</div>", lines.join("\n"))
        }
        MimeType::PlainText => {
            let text = artifact.payload_text();
            let text = text.trim_end();
            let longest = longest_backtick_run(text);
            let fence = "`".repeat((longest + 1).max(3));
            format!("{fence}text\n{text}\n{fence}")
        }
    }
}

fn longest_backtick_run(s: &str) -> usize {
    let mut longest = 0;
    let mut run = 0;
    for c in s.chars() {
        if c == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest
}

// ============ Slide breaks ============

enum Token<'a> {
    Break,
    Blank,
    Line(&'a str),
}

fn is_slide_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    (hashes == 1 || hashes == 2) && line[hashes..].chars().next().map_or(true, |c| c == ' ')
}

/// Normalize slide breaks outside code and front matter.
///
/// Consecutive breaks collapse, breaks at the start or end of the body are
/// dropped, each break gets exactly one blank line on either side, and a
/// `#`/`##` heading that is not the first content starts a new slide.
pub fn repair_slide_breaks(text: &str) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let kinds = classify_lines(&lines);
    let body_start = frontmatter_end(&lines).map_or(0, |end| end + 1);

    let mut tokens = Vec::with_capacity(lines.len());
    for (line, kind) in lines[body_start..].iter().zip(&kinds[body_start..]) {
        let token = match kind {
            LineKind::Prose if is_break_line(line) => Token::Break,
            LineKind::Prose if line.trim().is_empty() => Token::Blank,
            LineKind::Prose if is_slide_heading(line) => {
                tokens.push(Token::Break);
                Token::Line(line)
            }
            _ => Token::Line(line),
        };
        tokens.push(token);
    }

    let mut out: Vec<&str> = lines[..body_start].to_vec();
    let mut seen_content = false;
    let mut pending_break = false;
    let mut pending_blank = false;
    for token in tokens {
        match token {
            Token::Break => pending_break = seen_content,
            Token::Blank => pending_blank = seen_content,
            Token::Line(line) => {
                if pending_break {
                    out.extend(["", "---", ""]);
                } else if pending_blank {
                    out.push("");
                }
                out.push(line);
                seen_content = true;
                pending_break = false;
                pending_blank = false;
            }
        }
    }

    // Front matter followed directly by content gets a separating blank line.
    if body_start > 0 && out.len() > body_start && !out[body_start].is_empty() {
        out.insert(body_start, "");
    }

    out.join("\n")
}

// ============ Directives ============

fn directive_lines(template: &Template) -> Vec<(&'static str, Vec<String>)> {
    let css = [
        "section {".to_string(),
        format!("  background: {};", template.background_color),
        format!("  color: {};", template.text_color),
        format!("  font-family: {};", template.body_font),
        "}".to_string(),
        "h1, h2, h3 {".to_string(),
        format!("  color: {};", template.accent_color),
        format!("  font-family: {};", template.heading_font),
        "}".to_string(),
        format!("a {{ color: {}; }}", template.accent_color),
        ".deck-table table { border-collapse: collapse; margin: 0 auto; font-size: 0.7em; }"
            .to_string(),
        format!(
            ".deck-table th, .deck-table td {{ border: 1px solid {}; padding: 0.2em 0.6em; }}",
            template.accent_color
        ),
    ];

    let mut style = vec!["style: |".to_string()];
    style.extend(css.iter().map(|l| format!("  {}", l)));

    vec![
        ("marp", vec!["marp: true".to_string()]),
        ("theme", vec![format!("theme: {}", template.theme)]),
        ("paginate", vec!["paginate: true".to_string()]),
        ("style", style),
    ]
}

fn frontmatter_key(line: &str) -> Option<&str> {
    if line.starts_with(' ') || line.starts_with('\t') {
        return None;
    }
    line.split_once(':').map(|(k, _)| k.trim())
}

/// Add Marp front matter for `template`. A document whose front matter
/// already sets `marp:` is returned unchanged; other front matter is
/// extended with the missing keys.
pub fn apply_directives(text: &str, template: &Template) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let directives = directive_lines(template);

    match frontmatter_end(&lines) {
        Some(end) => {
            let existing: Vec<&str> = lines[1..end].iter().filter_map(|l| frontmatter_key(l)).collect();
            if existing.contains(&"marp") {
                return text.to_string();
            }
            let mut out: Vec<String> = vec![lines[0].to_string()];
            for (key, block) in directives {
                if !existing.contains(&key) {
                    out.extend(block);
                }
            }
            out.extend(lines[1..].iter().map(|l| l.to_string()));
            out.join("\n")
        }
        None => {
            let mut out = vec!["---".to_string()];
            for (_, block) in directives {
                out.extend(block);
            }
            out.push("---".to_string());
            out.push(String::new());
            out.push(text.to_string());
            out.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ContentCache;
    use crate::error::ExecutionError;
    use crate::render::PassthroughRenderer;
    use crate::runtime::{ExecMode, StatRuntime};
    use crate::templates::TemplateRegistry;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    /// Echoes the code back per mode; `slow` in the body delays the reply,
    /// `fail` makes it time out.
    struct Echo;

    #[async_trait]
    impl StatRuntime for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn run(&self, code: &str, mode: ExecMode) -> Result<String, ExecutionError> {
            if code.contains("fail") {
                return Err(ExecutionError::Timeout { timeout_secs: 30 });
            }
            if code.contains("slow") {
                tokio::time::sleep(Duration::from_millis(80)).await;
            }
            let id = code.lines().last().unwrap_or("").trim();
            Ok(match mode {
                ExecMode::Svg => format!("<svg>{}</svg>", id),
                ExecMode::Table => format!("<table>\n\n<tr><td>{}</td></tr>\n</table>", id),
                _ => format!("out {}", id),
            })
        }
    }

    fn compiler() -> DeckCompiler {
        let gateway = Arc::new(ExecutionGateway::new(
            Arc::new(Echo),
            Arc::new(ContentCache::new(1 << 20)),
        ));
        DeckCompiler::new(gateway, Arc::new(PassthroughRenderer), 4)
    }

    fn classic() -> &'static Template {
        TemplateRegistry::builtin().find("classic").unwrap()
    }

    fn body_of(deck: &str) -> &str {
        let lines: Vec<&str> = deck.split('\n').collect();
        let end = frontmatter_end(&lines).unwrap();
        let offset: usize = lines[..=end].iter().map(|l| l.len() + 1).sum();
        &deck[offset..]
    }

    #[test]
    fn test_classify_kind() {
        assert_eq!(classify_kind("{r}", "#| kind: table\nplot(1)"), CodeKind::Table);
        assert_eq!(classify_kind("{r, kind=\"generic\"}", "plot(1)"), CodeKind::Generic);
        assert_eq!(classify_kind("{r}", "df <- data.frame(a=1)\nknitr::kable(df)"), CodeKind::Table);
        assert_eq!(classify_kind("{r}", "df <- data.frame(a=1)\nplot(df)"), CodeKind::Plot);
        assert_eq!(classify_kind("{r}", "ggplot(d) + geom_point()"), CodeKind::Plot);
        assert_eq!(classify_kind("{r}", "x <- readLines(f)\ntable(x)"), CodeKind::Table);
        assert_eq!(classify_kind("{r}", "# plot(x)\nsummary(x)"), CodeKind::Plot);
    }

    #[test]
    fn test_extract_code_blocks() {
        let text = "# T\n```{r}\nplot(1)\n```\n```python\nprint(1)\n```\n```r\n#| kind: table\nkable(x)\n```\n```{r}\nunclosed";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].raw_source, "plot(1)");
        assert_eq!(blocks[0].kind, CodeKind::Plot);
        assert_eq!(
            &text[blocks[0].position_in_outline..blocks[0].position_in_outline + blocks[0].len],
            "```{r}\nplot(1)\n```"
        );
        assert_eq!(blocks[1].kind, CodeKind::Table);
        assert_eq!(blocks[1].language, CodeLanguage::Statistical);
    }

    #[test]
    fn test_statistical_info() {
        assert!(is_statistical_info("{r}"));
        assert!(is_statistical_info("{r chart, echo=FALSE}"));
        assert!(is_statistical_info("R"));
        assert!(!is_statistical_info("rust"));
        assert!(!is_statistical_info("{python}"));
    }

    #[test]
    fn test_generic_fence_longer_than_content() {
        let a = Artifact::new("h", MimeType::PlainText, b"a ```` b".to_vec());
        assert_eq!(artifact_markup(&a), "`````text\na ```` b\n`````");
    }

    #[test]
    fn test_table_markup_has_no_blank_lines() {
        let a = Artifact::new("h", MimeType::Html, b"<table>\n\n<tr></tr>\n</table>\n".to_vec());
        assert_eq!(
            artifact_markup(&a),
            "<div class=\"deck-table\">\n<table>\n<tr></tr>\n</table>\n</div>"
        );
    }

    #[test]
    fn test_repair_slide_breaks() {
        let raw = "---\n\n# Title\n---\n---\n\n\n## A\ntext\n  ---  \n## B\n```\n---\n```\n---\n";
        assert_eq!(
            repair_slide_breaks(raw),
            "# Title\n\n---\n\n## A\ntext\n\n---\n\n## B\n```\n---\n```"
        );
    }

    #[test]
    fn test_heading_starts_slide() {
        assert_eq!(
            repair_slide_breaks("# Deck\nintro\n## One\n- a\n### Detail\n## Two"),
            "# Deck\nintro\n\n---\n\n## One\n- a\n### Detail\n\n---\n\n## Two"
        );
    }

    #[test]
    fn test_repair_is_idempotent() {
        let once = repair_slide_breaks("# A\n---\n\n\n---\n## B\n\n\ntext\n---");
        assert_eq!(repair_slide_breaks(&once), once);
    }

    #[test]
    fn test_directives_prepended_once() {
        let t = classic();
        let deck = apply_directives("# Title", t);
        assert!(deck.starts_with("---\nmarp: true\ntheme: default\npaginate: true\nstyle: |\n"));
        assert!(deck.contains("  background: #ffffff;"));
        assert!(deck.ends_with("---\n\n# Title"));
        assert_eq!(apply_directives(&deck, t), deck);
    }

    #[tokio::test]
    async fn test_reassembling_a_deck_is_stable() {
        let outline = Outline::from_text(
            "doc",
            "# Deck\n---\n## Chart\n```{r}\nplot(a)\n```\n---\n## Notes\n| a | b |\n| 1 | 2 |",
        );
        let c = compiler();
        let first = c.assemble(&outline, classic()).await.unwrap();
        let second = c
            .assemble(&Outline::from_text("deck", &first), classic())
            .await
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(first.matches("marp: true").count(), 1);
    }

    #[tokio::test]
    async fn test_header_kind_overrides_cached_plot() {
        let outline = Outline::from_text(
            "doc",
            "# A\n```{r}\nx\n```\n---\n## B\n```{r, kind=\"table\"}\nx\n```",
        );
        let deck = compiler().assemble(&outline, classic()).await.unwrap();
        assert_eq!(deck.matches("<img ").count(), 1);
        assert!(deck.contains("<div class=\"deck-table\">"));
        assert!(deck.contains("<tr><td>x</td></tr>"));
    }

    #[test]
    fn test_directives_merge_into_existing_frontmatter() {
        let deck = apply_directives("---\ntheme: gaia\n---\n\n# T", classic());
        assert!(deck.starts_with("---\nmarp: true\npaginate: true\nstyle: |\n"));
        assert!(deck.contains("\ntheme: gaia\n---\n\n# T"));
        assert!(!deck.contains("theme: default"));
    }

    #[tokio::test]
    async fn test_assemble_substitutes_in_order() {
        let outline = Outline::from_text(
            "doc",
            "# Deck\n---\n## Plot\n```{r}\nSys.sleep(0) # slow\nplot(a)\n```\n---\n## Table\n```{r}\n#| kind: table\nb\n```",
        );
        let deck = compiler().assemble(&outline, classic()).await.unwrap();
        let body = body_of(&deck);

        let svg = crate::models::Artifact::new("x", MimeType::Svg, b"<svg>plot(a)</svg>".to_vec())
            .payload_base64();
        assert_eq!(
            body,
            format!(
                "\n# Deck\n\n---\n\n## Plot\n<img src=\"data:image/svg+xml;base64,{}\" style=\"max-width:100%;max-height:70vh;\">\n\n---\n\n## Table\n<div class=\"deck-table\">\n<table>\n<tr><td>b</td></tr>\n</table>\n</div>",
                svg
            )
        );
    }

    #[tokio::test]
    async fn test_failed_block_left_verbatim() {
        let outline = Outline::from_text("doc", "# D\n---\n## S\n```{r}\nfail()\n```\n```{r}\nplot(ok)\n```");
        let deck = compiler().assemble(&outline, classic()).await.unwrap();
        assert!(deck.contains("```{r}\nfail()\n```"));
        assert!(deck.contains("data:image/svg+xml;base64,"));
    }

    #[tokio::test]
    async fn test_no_blocks_keeps_text() {
        let outline = Outline::from_text("doc", "# Only\n---\n## Text\n- point");
        let deck = compiler().assemble(&outline, classic()).await.unwrap();
        assert_eq!(body_of(&deck), "\n# Only\n\n---\n\n## Text\n- point");
    }

    #[tokio::test]
    async fn test_empty_outline_rejected() {
        let outline = Outline::from_text("doc", "   ");
        let err = compiler().compile(&outline, classic()).await.unwrap_err();
        assert!(matches!(err, CompileError::EmptyOutline));
    }

    #[tokio::test]
    async fn test_compile_through_renderer() {
        let outline = Outline::from_text("doc", "# T");
        let c = compiler();
        let deck = c.compile(&outline, classic()).await.unwrap();
        assert_eq!(deck, c.assemble(&outline, classic()).await.unwrap());
    }
}
