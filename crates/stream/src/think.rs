//! `<think>…</think>` extraction over an arbitrarily-chunked token stream.
//!
//! The parser is fed one chunk at a time but internally walks it
//! character-by-character, because a tag can straddle a chunk boundary
//! (a provider might emit `<thi` then `nk>` as two separate deltas). It
//! keeps a small trailing buffer of characters that *might* be the start
//! of `<think>` or `</think>` and only commits them once the buffer can
//! no longer match either tag.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";
/// Longest tag we might be partway through matching.
const MAX_TAG_LEN: usize = 8; // len("</think>")

/// Output of feeding one chunk through the parser: text destined for
/// `content` and text destined for `thinking`, in emission order isn't
/// interleaved here — callers that need strict ordering should treat
/// `content` and `thinking` as two independent channels, which is how
/// the stream pipeline's `chunk` / `chunk(thinking:true)` frames work.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ThinkOutput {
    pub content: String,
    pub thinking: String,
}

impl ThinkOutput {
    fn is_empty(&self) -> bool {
        self.content.is_empty() && self.thinking.is_empty()
    }
}

/// Character-at-a-time `<think>` tag stripper.
///
/// Holds a `pending` buffer of characters not yet known to be outside
/// both tags. On each character, the buffer is re-checked against
/// `<think>` and `</think>`: a full match switches `in_think` and
/// drains the buffer without emitting it; once the buffer can no
/// longer be a *prefix* of either tag, its oldest character is flushed
/// to the appropriate destination.
pub struct ThinkTagParser {
    pending: String,
    in_think: bool,
    /// Whether we've seen a non-whitespace content character yet —
    /// leading whitespace before the first real character is dropped.
    seen_content: bool,
}

impl ThinkTagParser {
    pub fn new() -> Self {
        Self {
            pending: String::new(),
            in_think: false,
            seen_content: false,
        }
    }

    /// Feed one chunk (of any length, including a single character) and
    /// return the text it resolved to.
    pub fn feed(&mut self, chunk: &str) -> ThinkOutput {
        let mut out = ThinkOutput::default();
        for ch in chunk.chars() {
            self.push_char(ch, &mut out);
        }
        out
    }

    /// Flush whatever remains buffered. Call once the source stream is
    /// done — a trailing partial tag that never completed is just text.
    pub fn finish(&mut self) -> ThinkOutput {
        let mut out = ThinkOutput::default();
        let remaining = std::mem::take(&mut self.pending);
        for ch in remaining.chars() {
            self.emit(ch, &mut out);
        }
        out
    }

    fn push_char(&mut self, ch: char, out: &mut ThinkOutput) {
        self.pending.push(ch);

        if self.pending == OPEN_TAG {
            self.in_think = true;
            self.pending.clear();
            return;
        }
        if self.pending == CLOSE_TAG {
            self.in_think = false;
            self.pending.clear();
            // Synthetic space so a UI's "thinking" indicator can
            // transition cleanly even if the model emits no space of
            // its own right after `</think>`.
            out.content.push(' ');
            self.seen_content = true;
            return;
        }

        // Once `pending` can no longer be a prefix of either tag (in
        // either tag-state), the leading characters are definitely
        // plain text/thinking and can be flushed.
        while !self.pending.is_empty()
            && !OPEN_TAG.starts_with(&self.pending)
            && !CLOSE_TAG.starts_with(&self.pending)
        {
            let c = self.pending.remove(0);
            self.emit(c, out);
        }

        // Safety valve: never let the buffer exceed the longest tag,
        // even if both `starts_with` checks keep matching (they can't
        // beyond MAX_TAG_LEN, but stay defensive against future tags).
        while self.pending.chars().count() > MAX_TAG_LEN {
            let c = self.pending.remove(0);
            self.emit(c, out);
        }
    }

    fn emit(&mut self, ch: char, out: &mut ThinkOutput) {
        if self.in_think {
            out.thinking.push(ch);
            return;
        }
        if !self.seen_content {
            if ch.is_whitespace() {
                return;
            }
            self.seen_content = true;
        }
        out.content.push(ch);
    }
}

impl Default for ThinkTagParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_whole(input: &str) -> ThinkOutput {
        let mut parser = ThinkTagParser::new();
        let mut out = parser.feed(input);
        let tail = parser.finish();
        out.content.push_str(&tail.content);
        out.thinking.push_str(&tail.thinking);
        out
    }

    fn run_char_by_char(input: &str) -> ThinkOutput {
        let mut parser = ThinkTagParser::new();
        let mut out = ThinkOutput::default();
        for ch in input.chars() {
            let piece = parser.feed(&ch.to_string());
            out.content.push_str(&piece.content);
            out.thinking.push_str(&piece.thinking);
        }
        let tail = parser.finish();
        out.content.push_str(&tail.content);
        out.thinking.push_str(&tail.thinking);
        out
    }

    #[test]
    fn plain_text_passes_through() {
        let out = run_whole("hello world");
        assert_eq!(out.content, "hello world");
        assert!(out.thinking.is_empty());
    }

    #[test]
    fn think_block_is_routed_to_thinking() {
        let out = run_whole("<think>pondering</think>the answer is 42");
        assert_eq!(out.thinking, "pondering");
        assert_eq!(out.content, " the answer is 42");
    }

    #[test]
    fn leading_whitespace_before_first_content_char_is_suppressed() {
        let out = run_whole("   hello");
        assert_eq!(out.content, "hello");
    }

    #[test]
    fn leading_whitespace_inside_think_block_is_not_suppressed() {
        let out = run_whole("<think>  pondering</think>answer");
        assert_eq!(out.thinking, "  pondering");
    }

    #[test]
    fn adversarial_one_char_at_a_time_chunking_matches_whole_feed() {
        let input = "before <think>secret reasoning</think> after";
        let whole = run_whole(input);
        let char_by_char = run_char_by_char(input);
        assert_eq!(whole, char_by_char);
        assert_eq!(char_by_char.thinking, "secret reasoning");
        assert_eq!(char_by_char.content, "before  after");
    }

    #[test]
    fn tag_split_across_feeds_is_still_detected() {
        let mut parser = ThinkTagParser::new();
        let mut out = ThinkOutput::default();
        for piece in ["<th", "ink>", "hidden", "</th", "ink>", "visible"] {
            let o = parser.feed(piece);
            out.content.push_str(&o.content);
            out.thinking.push_str(&o.thinking);
        }
        let tail = parser.finish();
        out.content.push_str(&tail.content);
        out.thinking.push_str(&tail.thinking);
        assert_eq!(out.thinking, "hidden");
        assert_eq!(out.content, " visible");
    }

    #[test]
    fn no_tag_literal_ever_leaks_into_emitted_content_under_any_chunking() {
        let input = "a<think>b</think>c<think>d</think>e";
        for chunk_size in 1..=input.len() {
            let mut parser = ThinkTagParser::new();
            let mut content = String::new();
            let mut thinking = String::new();
            let chars: Vec<char> = input.chars().collect();
            for window in chars.chunks(chunk_size) {
                let s: String = window.iter().collect();
                let out = parser.feed(&s);
                content.push_str(&out.content);
                thinking.push_str(&out.thinking);
            }
            let tail = parser.finish();
            content.push_str(&tail.content);
            thinking.push_str(&tail.thinking);
            assert!(!content.contains("<think>"), "chunk_size={chunk_size}");
            assert!(!content.contains("</think>"), "chunk_size={chunk_size}");
            assert!(!thinking.contains("<think>"), "chunk_size={chunk_size}");
            assert!(!thinking.contains("</think>"), "chunk_size={chunk_size}");
        }
    }

    #[test]
    fn text_with_partial_tag_prefix_that_never_completes_is_plain_text() {
        // "<thi" never resolves into a full tag, so it must surface as
        // ordinary content once the stream ends.
        let out = run_whole("weird <thi but not a tag");
        assert_eq!(out.content, "weird <thi but not a tag");
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let out = run_whole("");
        assert!(out.content.is_empty());
        assert!(out.thinking.is_empty());
    }
}
