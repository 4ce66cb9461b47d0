//! Line-level markdown scanning.
//!
//! The outline normalizer and the deck compiler both need to know, for each
//! line, whether it sits in front matter, inside a fenced code block, or in
//! ordinary prose. [`classify_lines`] runs that state machine once so every
//! later pass agrees on where code starts and ends.
//!
//! ```text
//!            first line "---" + key lines + "---"
//!   start ──────────────────────────────────────▶ InFrontmatter ──▶ Prose
//!     │                                                               │ ▲
//!     └──────────────────────────────▶ Prose ◀────────────────────────┘ │
//!                                        │  fence open          fence close
//!                                        └──────────▶ InCodeBlock ──────┘
//! ```
//!
//! Table detection lives with the table repair in [`crate::outline`], which
//! runs over `Prose` lines only.

/// Classification of a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// The `---` lines opening and closing front matter.
    FrontmatterDelim,
    Frontmatter,
    FenceOpen,
    Code,
    FenceClose,
    Prose,
}

impl LineKind {
    pub fn is_prose(&self) -> bool {
        matches!(self, LineKind::Prose)
    }
}

/// An opening code fence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    pub marker: char,
    pub len: usize,
    /// Text after the fence markers, trimmed (e.g. `{r}`, `markdown`).
    pub info: String,
}

/// Parse a fence line (```` ``` ```` or `~~~`, up to three spaces of indent).
pub fn parse_fence(line: &str) -> Option<Fence> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let marker = rest.chars().next()?;
    if marker != '`' && marker != '~' {
        return None;
    }
    let len = rest.chars().take_while(|&c| c == marker).count();
    if len < 3 {
        return None;
    }
    let info = rest[len..].trim();
    // Backtick fences may not carry backticks in their info string.
    if marker == '`' && info.contains('`') {
        return None;
    }
    Some(Fence {
        marker,
        len,
        info: info.to_string(),
    })
}

/// Whether `line` closes a block opened by `open`.
pub fn closes(open: &Fence, line: &str) -> bool {
    match parse_fence(line) {
        Some(f) => f.marker == open.marker && f.len >= open.len && f.info.is_empty(),
        None => false,
    }
}

/// Whether a line is a slide break (`---` alone on the line).
pub fn is_break_line(line: &str) -> bool {
    line.trim() == "---"
}

fn is_frontmatter_line(line: &str) -> bool {
    if line.trim().is_empty() {
        return false;
    }
    if line.starts_with(' ') || line.starts_with('\t') {
        return true;
    }
    let Some(colon) = line.find(':') else {
        return false;
    };
    let key = &line[..colon];
    let after = &line[colon + 1..];
    !key.is_empty()
        && key
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && (after.is_empty() || after.starts_with(' '))
}

/// Index of the closing front-matter delimiter, if `lines` opens with a
/// front-matter block.
pub fn frontmatter_end(lines: &[&str]) -> Option<usize> {
    if lines.first().map(|l| l.trim_end()) != Some("---") {
        return None;
    }
    let mut saw_key = false;
    for (i, line) in lines.iter().enumerate().skip(1) {
        if line.trim_end() == "---" {
            return if saw_key { Some(i) } else { None };
        }
        if !is_frontmatter_line(line) {
            return None;
        }
        if !line.starts_with(' ') && !line.starts_with('\t') {
            saw_key = true;
        }
    }
    None
}

/// Classify every line of a document.
pub fn classify_lines(lines: &[&str]) -> Vec<LineKind> {
    let mut kinds = Vec::with_capacity(lines.len());
    let mut start = 0;

    if let Some(end) = frontmatter_end(lines) {
        kinds.push(LineKind::FrontmatterDelim);
        kinds.extend(std::iter::repeat(LineKind::Frontmatter).take(end - 1));
        kinds.push(LineKind::FrontmatterDelim);
        start = end + 1;
    }

    let mut open: Option<Fence> = None;
    for line in &lines[start..] {
        match &open {
            Some(fence) => {
                if closes(fence, line) {
                    kinds.push(LineKind::FenceClose);
                    open = None;
                } else {
                    kinds.push(LineKind::Code);
                }
            }
            None => match parse_fence(line) {
                Some(fence) => {
                    kinds.push(LineKind::FenceOpen);
                    open = Some(fence);
                }
                None => kinds.push(LineKind::Prose),
            },
        }
    }

    kinds
}

/// Whether the last fence in `lines` is left open.
pub fn ends_inside_code(lines: &[&str]) -> bool {
    matches!(
        classify_lines(lines).last(),
        Some(LineKind::FenceOpen) | Some(LineKind::Code)
    )
}
