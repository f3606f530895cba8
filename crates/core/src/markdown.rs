//! Fenced code-block scanning over possibly-incomplete markdown.
//!
//! Streamed assistant output arrives mid-fence, so the canvas needs to locate
//! both finished blocks and blocks whose closing fence has not arrived yet.
//! Pairing is deliberately simple: the first opening fence matches the first
//! plain closing fence, with no recursive fence matching.

/// One fenced code block: the optional language tag from the opening fence
/// plus the body between the fences (fences excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: Option<String>,
    pub body: String,
}

/// Byte span of a block in the source text, fences included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub start: usize,
    pub end: usize,
}

struct Line<'a> {
    start: usize,
    content: &'a str,
}

fn lines_with_offsets(text: &str) -> impl Iterator<Item = Line<'_>> {
    text.split_inclusive('\n').scan(0usize, |offset, raw| {
        let start = *offset;
        *offset += raw.len();
        let content = raw
            .strip_suffix('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .unwrap_or(raw);
        Some(Line { start, content })
    })
}

/// Returns the language tag when `line` opens a fence, `None` when it does
/// not. A line of surrounding whitespace still counts as a fence delimiter.
fn opening_fence_language(line: &str) -> Option<Option<String>> {
    let rest = line.trim().strip_prefix("```")?;
    let tag = rest.trim();
    if tag.is_empty() {
        Some(None)
    } else {
        Some(Some(tag.to_string()))
    }
}

fn is_closing_fence(line: &str) -> bool {
    line.trim() == "```"
}

struct OpenFence {
    start: usize,
    language: Option<String>,
    body_lines: Vec<String>,
}

/// Finds the complete fenced block with the longest body, together with the
/// span that reconstructs the whole block including both fences.
pub fn find_longest_complete_block(text: &str) -> Option<(CodeBlock, BlockSpan)> {
    let mut best: Option<(CodeBlock, BlockSpan)> = None;
    let mut open: Option<OpenFence> = None;

    for line in lines_with_offsets(text) {
        if open.is_none() {
            if let Some(language) = opening_fence_language(line.content) {
                open = Some(OpenFence {
                    start: line.start,
                    language,
                    body_lines: Vec::new(),
                });
            }
            continue;
        }

        if is_closing_fence(line.content) {
            let fence = open.take().expect("open fence checked above");
            let body = fence.body_lines.join("\n");
            let span = BlockSpan {
                start: fence.start,
                end: line.start + line.content.len(),
            };
            let longer = best
                .as_ref()
                .is_none_or(|(current, _)| body.len() > current.body.len());
            if longer {
                best = Some((
                    CodeBlock {
                        language: fence.language,
                        body,
                    },
                    span,
                ));
            }
        } else if let Some(fence) = open.as_mut() {
            fence.body_lines.push(line.content.to_string());
        }
    }

    best
}

/// Detects a fence that has been opened but not yet closed, scanning from
/// `from` (a byte offset on a char boundary). Returns the body streamed so
/// far and a span reaching the end of the text.
pub fn find_in_progress_block(text: &str, from: usize) -> Option<(CodeBlock, BlockSpan)> {
    let slice = text.get(from..)?;
    let mut open: Option<OpenFence> = None;

    for line in lines_with_offsets(slice) {
        if open.is_none() {
            if let Some(language) = opening_fence_language(line.content) {
                open = Some(OpenFence {
                    start: from + line.start,
                    language,
                    body_lines: Vec::new(),
                });
            }
            continue;
        }

        if is_closing_fence(line.content) {
            open = None;
        } else if let Some(fence) = open.as_mut() {
            fence.body_lines.push(line.content.to_string());
        }
    }

    open.map(|fence| {
        (
            CodeBlock {
                language: fence.language,
                body: fence.body_lines.join("\n"),
            },
            BlockSpan {
                start: fence.start,
                end: text.len(),
            },
        )
    })
}
