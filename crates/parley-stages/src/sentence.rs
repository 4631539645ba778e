//! Sentence splitting for streamed LLM output.
//!
//! Deltas are buffered until a terminator followed by whitespace shows up, so
//! "3.5" or "e.g.x" never split mid-token. Closing quotes and brackets stay
//! with the sentence they close.

const TERMINATORS: &[char] = &['.', '!', '?', '…'];
const CLOSERS: &[char] = &['"', '\'', ')', ']', '\u{201D}', '\u{2019}'];

/// Accumulates streamed text and hands back complete sentences.
#[derive(Debug, Default)]
pub struct SentenceBuffer {
    buffer: String,
    /// Force a break once this many bytes pile up without a boundary.
    max_chars: Option<usize>,
}

impl SentenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_chars(max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_chars: Some(max_chars),
        }
    }

    /// Append a delta; returns the sentences it completed, in order.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut sentences = Vec::new();

        while let Some(end) = self.boundary() {
            let sentence = self.buffer[..end].trim().to_string();
            self.buffer.drain(..end);
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
        }

        if let Some(max) = self.max_chars {
            if self.buffer.len() >= max {
                if let Some(split) = self.buffer.rfind(char::is_whitespace) {
                    let head = self.buffer[..split].trim().to_string();
                    self.buffer.drain(..split);
                    if !head.is_empty() {
                        sentences.push(head);
                    }
                }
            }
        }

        sentences
    }

    /// Whatever is left once the stream has ended.
    pub fn flush(&mut self) -> Option<String> {
        let rest = self.buffer.trim().to_string();
        self.buffer.clear();
        (!rest.is_empty()).then_some(rest)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.trim().is_empty()
    }

    /// Byte offset just past the first complete sentence.
    fn boundary(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if !TERMINATORS.contains(&c) {
                continue;
            }
            let mut end = i + c.len_utf8();
            while let Some(&(j, next)) = chars.peek() {
                if TERMINATORS.contains(&next) || CLOSERS.contains(&next) {
                    end = j + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            match chars.peek() {
                Some(&(_, next)) if next.is_whitespace() => return Some(end),
                Some(_) => continue,
                // Terminator at the very end: the next delta decides.
                None => return None,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentences_emitted_in_order_with_tail_flush() {
        let mut buf = SentenceBuffer::new();
        assert_eq!(buf.push("Hello there. How"), vec!["Hello there."]);
        assert_eq!(buf.push(" are you? I am"), vec!["How are you?"]);
        assert!(buf.push(" fine").is_empty());
        assert_eq!(buf.flush().as_deref(), Some("I am fine"));
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn test_decimal_does_not_split() {
        let mut buf = SentenceBuffer::new();
        assert_eq!(
            buf.push("It costs 3.5 dollars. Ok"),
            vec!["It costs 3.5 dollars."]
        );
    }

    #[test]
    fn test_terminator_at_chunk_end_waits() {
        let mut buf = SentenceBuffer::new();
        assert!(buf.push("Version 2.").is_empty());
        assert!(buf.push("1 is out").is_empty());
        assert_eq!(buf.push("! "), vec!["Version 2.1 is out!"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_closers_stay_with_sentence() {
        let mut buf = SentenceBuffer::new();
        assert_eq!(
            buf.push("She said \"stop!\" Then left. "),
            vec!["She said \"stop!\"", "Then left."]
        );
    }

    #[test]
    fn test_repeated_terminators() {
        let mut buf = SentenceBuffer::new();
        assert_eq!(buf.push("Really?! Wow... ok "), vec!["Really?!", "Wow..."]);
        assert_eq!(buf.flush().as_deref(), Some("ok"));
    }

    #[test]
    fn test_max_chars_forces_break() {
        let mut buf = SentenceBuffer::with_max_chars(20);
        let out = buf.push("one two three four five six");
        assert_eq!(out, vec!["one two three four five"]);
        assert_eq!(buf.flush().as_deref(), Some("six"));
    }
}
