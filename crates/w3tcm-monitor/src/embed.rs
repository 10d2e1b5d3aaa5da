use crate::conditional::CONDITIONAL_TAIL_EXTRA;

/// Corrects the host's embed position for inline scripts it never counted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EmbedCorrector {
    end_head_pos: Option<usize>,
    last_inline: Option<(usize, usize)>,
}

impl EmbedCorrector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an extracted inline script at `pos` replaced by
    /// `replacement_len` bytes. Conditional scripts also cover the rest of
    /// their comment.
    pub fn record_inline(&mut self, pos: usize, replacement_len: usize, conditional: bool) {
        let end = pos + replacement_len;
        let last_end = if conditional {
            end + CONDITIONAL_TAIL_EXTRA
        } else {
            end
        };
        self.last_inline = Some((pos, last_end));
    }

    pub fn record_head_end(&mut self, pos: usize) {
        self.end_head_pos = Some(pos);
    }

    /// Final embed position for a batch the host placed at `embed_pos`.
    ///
    /// The `</head>` position wins outright; otherwise the position moves past
    /// the last extracted inline script when that script lies after it. The
    /// tracked state is consumed.
    pub fn correct(&mut self, embed_pos: usize) -> usize {
        let corrected = match (self.end_head_pos, self.last_inline) {
            (Some(head_end), _) => head_end,
            (None, Some((start, end))) if start > embed_pos => end,
            _ => embed_pos,
        };
        *self = Self::default();
        corrected
    }

    pub fn last_inline(&self) -> Option<(usize, usize)> {
        self.last_inline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamps_past_last_inline() {
        let mut corrector = EmbedCorrector::new();
        corrector.record_inline(100, 10, false);
        corrector.record_inline(200, 10, false);
        assert_eq!(corrector.last_inline(), Some((200, 210)));
        assert_eq!(corrector.correct(150), 210);
        // state was consumed
        assert_eq!(corrector.correct(150), 150);
    }

    #[test]
    fn test_keeps_position_after_inline() {
        let mut corrector = EmbedCorrector::new();
        corrector.record_inline(100, 10, false);
        assert_eq!(corrector.correct(300), 300);
    }

    #[test]
    fn test_conditional_extends_end() {
        let mut corrector = EmbedCorrector::new();
        corrector.record_inline(100, 10, true);
        assert_eq!(corrector.last_inline(), Some((100, 123)));
        assert_eq!(corrector.correct(50), 123);
    }

    #[test]
    fn test_head_end_bypasses_clamp() {
        let mut corrector = EmbedCorrector::new();
        corrector.record_inline(500, 10, false);
        corrector.record_head_end(400);
        assert_eq!(corrector.correct(50), 400);
        assert_eq!(corrector.last_inline(), None);
    }
}
