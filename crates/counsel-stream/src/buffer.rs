/// Accumulated response text, capped at a fixed number of characters.
///
/// Appends that push the length past the cap drop the oldest characters so
/// the most recent `max_chars` always survive.
#[derive(Clone, Debug)]
pub struct RenderBuffer {
    content: String,
    char_len: usize,
    max_chars: usize,
}

impl RenderBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            content: String::new(),
            char_len: 0,
            max_chars,
        }
    }

    /// Appends `text`, then truncates from the head if over the cap.
    ///
    /// Returns the number of characters dropped.
    pub fn append(&mut self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.content.push_str(text);
        self.char_len += text.chars().count();
        if self.char_len <= self.max_chars {
            return 0;
        }
        let excess = self.char_len - self.max_chars;
        let cut = self
            .content
            .char_indices()
            .nth(excess)
            .map_or(self.content.len(), |(idx, _)| idx);
        self.content.drain(..cut);
        self.char_len = self.max_chars;
        excess
    }

    pub fn as_str(&self) -> &str {
        &self.content
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.char_len
    }

    pub fn is_empty(&self) -> bool {
        self.char_len == 0
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn into_string(self) -> String {
        self.content
    }
}
