//! Segment assembler: turns parsed fragments into transcript text.
//!
//! In thinking-aware mode reasoning is rendered as a markdown block quote and
//! separated from the answer by a paragraph break. Backends that mark
//! reasoning with inline `<think>` tags instead of a structured flag are
//! normalized to the same representation.
//!
//! The assembler also guards each transport cycle against the overload
//! marker: once the cycle's text contains it, the sentinel is emitted once and
//! the rest of that cycle's text is suppressed. Text that was already handed
//! out is never rewritten.

use crate::config::{RelayConfig, ThinkingStrategy};
use crate::types::Fragment;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";
const QUOTE: &str = "> ";
const PARAGRAPH: &str = "\n\n";

#[derive(Debug, Clone)]
pub struct SegmentAssembler {
    strategy: ThinkingStrategy,
    overload_marker: String,
    overload_sentinel: String,
    /// The buffer is currently inside a quoted reasoning block.
    in_thinking: bool,
    /// Classification inferred from inline think tags, inherited by
    /// unflagged fragments.
    last_tagged_thinking: bool,
    /// Total text handed out so far, across all cycles.
    emitted_len: usize,
    /// Text assembled during the current transport cycle.
    cycle_text: String,
    cycle_overloaded: bool,
}

impl SegmentAssembler {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            strategy: config.thinking,
            overload_marker: config.overload_marker.clone(),
            overload_sentinel: config.overload_sentinel.clone(),
            in_thinking: false,
            last_tagged_thinking: false,
            emitted_len: 0,
            cycle_text: String::new(),
            cycle_overloaded: false,
        }
    }

    pub fn strategy(&self) -> ThinkingStrategy {
        self.strategy
    }

    /// Reset the per-cycle overload guard. Mode state carries over so a
    /// reasoning block split across tool rounds stays quoted.
    pub fn begin_cycle(&mut self) {
        self.cycle_text.clear();
        self.cycle_overloaded = false;
    }

    /// Assemble one fragment. Returns the text to append to the reveal
    /// buffer, or `None` when the fragment contributes nothing.
    pub fn push(&mut self, fragment: Fragment) -> Option<String> {
        let piece = match self.strategy {
            ThinkingStrategy::Plain => {
                if fragment.content.is_empty() {
                    return None;
                }
                fragment.content
            }
            ThinkingStrategy::ThinkingAware => self.push_thinking_aware(fragment)?,
        };
        self.guard_overload(piece)
    }

    fn push_thinking_aware(&mut self, fragment: Fragment) -> Option<String> {
        let Fragment {
            mut content,
            is_thinking,
        } = fragment;

        // Only tag-inferred classifications are inherited; an explicit flag
        // describes its own fragment and nothing after it.
        let is_thinking = match is_thinking {
            Some(flag) => flag,
            None => {
                let inferred = if let Some(rest) = content.strip_prefix(THINK_OPEN) {
                    content = rest.trim().to_string();
                    true
                } else if let Some(rest) = content.strip_suffix(THINK_CLOSE) {
                    content = rest.trim().to_string();
                    false
                } else {
                    self.last_tagged_thinking
                };
                // A bare closing tag still ends the tagged block.
                self.last_tagged_thinking = inferred;
                inferred
            }
        };

        if content.is_empty() {
            return None;
        }

        let mut piece = String::with_capacity(content.len() + 4);
        if is_thinking {
            if !self.in_thinking {
                if self.emitted_len > 0 {
                    piece.push('\n');
                }
                piece.push_str(QUOTE);
                self.in_thinking = true;
            }
            piece.push_str(&quote_paragraphs(&content));
        } else {
            if self.in_thinking {
                piece.push_str(PARAGRAPH);
                self.in_thinking = false;
            }
            piece.push_str(&content);
        }
        Some(piece)
    }

    fn guard_overload(&mut self, piece: String) -> Option<String> {
        if self.cycle_overloaded {
            return None;
        }
        self.cycle_text.push_str(&piece);
        if !self.overload_marker.is_empty() && self.cycle_text.contains(&self.overload_marker) {
            self.cycle_overloaded = true;
            let sentinel = self.overload_sentinel.clone();
            self.emitted_len += sentinel.len();
            return Some(sentinel);
        }
        self.emitted_len += piece.len();
        Some(piece)
    }

    /// Record text that reached the transcript without passing through
    /// fragment assembly (plain bodies, diagnostics).
    pub fn note_external(&mut self, text: &str) {
        self.emitted_len += text.len();
    }

    pub fn is_in_thinking(&self) -> bool {
        self.in_thinking
    }
}

/// Keep a quoted block marked line-by-line across paragraph breaks.
fn quote_paragraphs(content: &str) -> String {
    if content.contains(PARAGRAPH) {
        content.split(PARAGRAPH).collect::<Vec<_>>().join("\n\n> ")
    } else {
        content.to_string()
    }
}
