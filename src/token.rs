//! Approximate token accounting.
//!
//! All budgets in this crate (chunk size, history, prompt segments) are
//! expressed in *approximate* tokens: one whitespace-delimited word counts as
//! one token. This is the same class of heuristic the rest of the pipeline is
//! calibrated against (a real BPE tokenizer lands within a small constant
//! factor for prose); what matters is that chunking, eviction, and prompt
//! assembly all measure with the same ruler.

/// Count approximate tokens in `text`.
pub fn count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Byte spans of each token in `text`, in order.
pub fn spans(text: &str) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                out.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        out.push((s, text.len()));
    }
    out
}

/// True when the token ending at this span closes a sentence: it ends in
/// terminal punctuation, or the following whitespace contains a newline.
pub fn is_sentence_end(text: &str, span: (usize, usize), next_start: Option<usize>) -> bool {
    let token = &text[span.0..span.1];
    if token.ends_with(['.', '!', '?']) {
        return true;
    }
    match next_start {
        Some(ns) => text[span.1..ns].contains('\n'),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_matches_spans() {
        let text = "  The driver must  stop.\nAt red lights. ";
        assert_eq!(count(text), spans(text).len());
        assert_eq!(count(text), 7);
    }

    #[test]
    fn spans_cover_tokens_exactly() {
        let text = "ab  cd\ne";
        let s = spans(text);
        assert_eq!(s, vec![(0, 2), (4, 6), (7, 8)]);
        assert_eq!(&text[s[1].0..s[1].1], "cd");
    }

    #[test]
    fn sentence_end_on_punctuation_and_newline() {
        let text = "Stop. go on\nnext";
        let s = spans(text);
        assert!(is_sentence_end(text, s[0], Some(s[1].0)));
        assert!(!is_sentence_end(text, s[1], Some(s[2].0)));
        assert!(is_sentence_end(text, s[2], Some(s[3].0)));
        assert!(is_sentence_end(text, s[3], None));
    }

    #[test]
    fn empty_text() {
        assert_eq!(count(""), 0);
        assert!(spans("   ").is_empty());
    }
}
