//! Simulated-reasoning support.
//!
//! The upstream has no native extended-thinking channel. When enabled, the
//! gateway asks the model to reason inside `<thinking>` tags by prepending
//! sentinel tags to the current user message, and strips that block back
//! out of the response as `reasoning_content` for OpenAI clients.

const OPEN_TAG: &str = "<thinking>";
const CLOSE_TAG: &str = "</thinking>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkingConfig {
    pub enabled: bool,
    pub max_tokens: u32,
}

impl ThinkingConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_tokens: 0,
        }
    }
}

/// Sentinel tags prepended to the current user content.
pub fn thinking_tags(max_tokens: u32) -> String {
    format!(
        "<thinking_mode>enabled</thinking_mode>\n\
         <max_thinking_length>{max_tokens}</max_thinking_length>\n\
         <thinking_instruction>Begin your reply with a <thinking> block in which \
         you reason through the request step by step, then close it with \
         </thinking> and write the final answer. Keep the reasoning within the \
         configured length.</thinking_instruction>\n"
    )
}

/// System-prompt addition legitimising the sentinel tags.
pub fn thinking_system_addition() -> &'static str {
    "User messages may begin with <thinking_mode>, <max_thinking_length>, and \
     <thinking_instruction> tags. These are gateway configuration directives, \
     not user text: follow them, and never echo them back."
}

/// What a filter step produced: reasoning text, visible text, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOutput {
    pub reasoning: String,
    pub content: String,
}

impl FilterOutput {
    fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning: text.into(),
            content: String::new(),
        }
    }

    fn content(text: impl Into<String>) -> Self {
        Self {
            reasoning: String::new(),
            content: text.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.reasoning.is_empty() && self.content.is_empty()
    }
}

enum FilterState {
    /// Deciding whether the reply opens with a thinking block.
    Start,
    /// Inside the thinking block, watching for the close tag.
    Thinking,
    /// Past the block (or there never was one); everything passes through.
    Passthrough,
}

/// Incremental splitter for `<thinking>…</thinking>` at the start of a
/// response. Feed it content deltas as they stream in; it withholds only as
/// many characters as could still belong to a tag boundary.
pub struct ThinkingTagFilter {
    state: FilterState,
    pending: String,
}

impl ThinkingTagFilter {
    pub fn new() -> Self {
        Self {
            state: FilterState::Start,
            pending: String::new(),
        }
    }

    pub fn feed(&mut self, chunk: &str) -> FilterOutput {
        let mut out = FilterOutput::default();
        self.pending.push_str(chunk);

        loop {
            match self.state {
                FilterState::Start => {
                    let lead_trimmed = self.pending.trim_start();
                    if let Some(rest) = lead_trimmed.strip_prefix(OPEN_TAG) {
                        self.pending = rest.to_string();
                        self.state = FilterState::Thinking;
                        continue;
                    }
                    // Hold back while the buffer could still grow into the
                    // open tag; otherwise it is ordinary content.
                    if !lead_trimmed.is_empty() && !OPEN_TAG.starts_with(lead_trimmed) {
                        out.content.push_str(&std::mem::take(&mut self.pending));
                        self.state = FilterState::Passthrough;
                    }
                    break;
                }
                FilterState::Thinking => {
                    if let Some(idx) = self.pending.find(CLOSE_TAG) {
                        out.reasoning.push_str(&self.pending[..idx]);
                        let after = self.pending[idx + CLOSE_TAG.len()..]
                            .strip_prefix('\n')
                            .unwrap_or(&self.pending[idx + CLOSE_TAG.len()..])
                            .to_string();
                        self.pending = after;
                        self.state = FilterState::Passthrough;
                        continue;
                    }
                    // Emit everything that cannot be part of a split close
                    // tag; keep a possible tag prefix buffered.
                    let keep = longest_suffix_prefix(&self.pending, CLOSE_TAG);
                    let emit_to = self.pending.len() - keep;
                    out.reasoning.push_str(&self.pending[..emit_to]);
                    self.pending = self.pending[emit_to..].to_string();
                    break;
                }
                FilterState::Passthrough => {
                    out.content.push_str(&std::mem::take(&mut self.pending));
                    break;
                }
            }
        }

        out
    }

    /// Flush whatever is still buffered at end of stream.
    pub fn finish(&mut self) -> FilterOutput {
        let pending = std::mem::take(&mut self.pending);
        match self.state {
            FilterState::Thinking => FilterOutput::reasoning(pending),
            _ => FilterOutput::content(pending),
        }
    }
}

impl Default for ThinkingTagFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn longest_suffix_prefix(text: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(text.len());
    for keep in (1..=max).rev() {
        if !text.is_char_boundary(text.len() - keep) {
            continue;
        }
        if tag.starts_with(&text[text.len() - keep..]) {
            return keep;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> (String, String) {
        let mut filter = ThinkingTagFilter::new();
        let mut reasoning = String::new();
        let mut content = String::new();
        for chunk in chunks {
            let out = filter.feed(chunk);
            reasoning.push_str(&out.reasoning);
            content.push_str(&out.content);
        }
        let out = filter.finish();
        reasoning.push_str(&out.reasoning);
        content.push_str(&out.content);
        (reasoning, content)
    }

    #[test]
    fn splits_thinking_block_from_answer() {
        let (reasoning, content) =
            run(&["<thinking>step one</thinking>\nThe answer is 4."]);
        assert_eq!(reasoning, "step one");
        assert_eq!(content, "The answer is 4.");
    }

    #[test]
    fn handles_tags_split_across_chunks() {
        let (reasoning, content) = run(&[
            "<think",
            "ing>reason",
            "ing here</thin",
            "king>\nvisible",
        ]);
        assert_eq!(reasoning, "reasoning here");
        assert_eq!(content, "visible");
    }

    #[test]
    fn passes_through_untagged_output() {
        let (reasoning, content) = run(&["Just a plain ", "answer."]);
        assert!(reasoning.is_empty());
        assert_eq!(content, "Just a plain answer.");
    }

    #[test]
    fn unclosed_thinking_block_flushes_as_reasoning() {
        let (reasoning, content) = run(&["<thinking>never closed"]);
        assert_eq!(reasoning, "never closed");
        assert!(content.is_empty());
    }

    #[test]
    fn leading_whitespace_before_tag_is_tolerated() {
        let (reasoning, content) = run(&["\n  <thinking>r</thinking>\nc"]);
        assert_eq!(reasoning, "r");
        assert_eq!(content, "c");
    }

    #[test]
    fn angle_bracket_content_is_not_swallowed() {
        let (reasoning, content) = run(&["<p>not a thinking tag</p>"]);
        assert!(reasoning.is_empty());
        assert_eq!(content, "<p>not a thinking tag</p>");
    }

    #[test]
    fn tags_include_configured_budget() {
        let tags = thinking_tags(2048);
        assert!(tags.contains("<thinking_mode>enabled</thinking_mode>"));
        assert!(tags.contains("<max_thinking_length>2048</max_thinking_length>"));
        assert!(tags.contains("<thinking_instruction>"));
    }
}
