//! Running transcript of the turn currently being spoken

/// Accumulates segment transcripts until the turn is judged finished.
#[derive(Debug, Default, Clone)]
pub struct UtteranceAssembler {
    text: String,
    segments: usize,
}

impl UtteranceAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transcript fragment, separated from the previous one by a
    /// space. Blank fragments are ignored. Returns the accumulated text.
    pub fn append(&mut self, fragment: &str) -> &str {
        let fragment = fragment.trim();
        if !fragment.is_empty() {
            if !self.text.is_empty() {
                self.text.push(' ');
            }
            self.text.push_str(fragment);
            self.segments += 1;
        }
        &self.text
    }

    /// Current accumulated text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of fragments appended since the last reset
    pub fn segments(&self) -> usize {
        self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Hand back the finished text and start a fresh utterance.
    pub fn take(&mut self) -> String {
        self.segments = 0;
        std::mem::take(&mut self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_separates_with_space() {
        let mut utterance = UtteranceAssembler::new();
        assert_eq!(utterance.append("Hello"), "Hello");
        assert_eq!(utterance.append(" there, "), "Hello there,");
        assert_eq!(utterance.append("how are you?"), "Hello there, how are you?");
        assert_eq!(utterance.segments(), 3);
    }

    #[test]
    fn test_blank_fragment_is_ignored() {
        let mut utterance = UtteranceAssembler::new();
        utterance.append("   ");
        assert!(utterance.is_empty());
        assert_eq!(utterance.segments(), 0);
    }

    #[test]
    fn test_take_resets() {
        let mut utterance = UtteranceAssembler::new();
        utterance.append("one");
        utterance.append("two");
        assert_eq!(utterance.take(), "one two");
        assert!(utterance.is_empty());
        assert_eq!(utterance.segments(), 0);
        assert_eq!(utterance.append("three"), "three");
    }
}
