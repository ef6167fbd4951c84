//! Split narration scripts into provider-sized pieces.
//!
//! Chunks break at sentence ends where possible, at word boundaries when a
//! single sentence is too long, and mid-word only for a word longer than the
//! limit. Every non-whitespace character of the input survives in order.

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Sentences including their terminal punctuation, trimmed.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?' | '…') {
            // Swallow runs like "?!" or "...".
            while let Some(&(_, next)) = chars.peek() {
                if matches!(next, '.' | '!' | '?' | '…' | '"' | '\'' | ')') {
                    chars.next();
                } else {
                    break;
                }
            }
            let end = chars.peek().map_or(text.len(), |&(j, _)| j);
            let at_boundary = chars.peek().is_none_or(|&(_, next)| next.is_whitespace());
            if at_boundary {
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = end;
            }
        } else if c == '\n' && chars.peek().is_some_and(|&(_, next)| next == '\n') {
            // Paragraph break ends a sentence too.
            let sentence = text[start..i].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = i;
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

/// Break an over-long sentence at word boundaries.
fn split_words(sentence: &str, limit: usize, out: &mut Vec<String>) {
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        if char_len(word) > limit {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(limit) {
                out.push(piece.iter().collect());
            }
            continue;
        }
        let needed = if current.is_empty() {
            char_len(word)
        } else {
            char_len(&current) + 1 + char_len(word)
        };
        if needed > limit {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        out.push(current);
    }
}

/// Split `text` into chunks of at most `limit` characters.
pub fn split_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut out = Vec::new();
    let mut current = String::new();

    for sentence in sentences(text) {
        let len = char_len(sentence);
        if len > limit {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            split_words(sentence, limit, &mut out);
            continue;
        }
        let needed = if current.is_empty() {
            len
        } else {
            char_len(&current) + 1 + len
        };
        if needed > limit {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn squash(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    fn assert_lossless(text: &str, limit: usize) -> Vec<String> {
        let chunks = split_text(text, limit);
        for chunk in &chunks {
            assert!(char_len(chunk) <= limit, "{chunk:?} exceeds {limit}");
            assert!(!chunk.is_empty());
        }
        assert_eq!(squash(&chunks.concat()), squash(text));
        chunks
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = assert_lossless("Breathe in. Breathe out.", 100);
        assert_eq!(chunks, vec!["Breathe in. Breathe out."]);
    }

    #[test]
    fn splits_at_sentence_boundaries() {
        let chunks = assert_lossless("Close your eyes. Relax your jaw. Let go.", 20);
        assert_eq!(
            chunks,
            vec!["Close your eyes.", "Relax your jaw.", "Let go."]
        );
    }

    #[test]
    fn packs_multiple_sentences_per_chunk() {
        let chunks = assert_lossless("One. Two. Three. Four.", 10);
        assert_eq!(chunks, vec!["One. Two.", "Three.", "Four."]);
    }

    #[test]
    fn long_sentence_falls_back_to_words() {
        let text = "notice the gentle rise and fall of your breath as it moves through you";
        let chunks = assert_lossless(text, 25);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| !c.starts_with(' ') && !c.ends_with(' ')));
    }

    #[test]
    fn giant_word_is_hard_split() {
        let word = "a".repeat(23);
        let chunks = assert_lossless(&format!("Start. {word} end."), 10);
        assert!(chunks.contains(&"aaaaaaaaaa".to_string()));
    }

    #[test]
    fn handles_multibyte_text() {
        assert_lossless("Respira profundamente… Siente la calma. ¿Estás listo? ¡Sí!", 18);
        assert_lossless("深呼吸してください。リラックス。", 5);
    }

    #[test]
    fn punctuation_inside_words_does_not_split() {
        let chunks = split_text("Visit example.com today. Then rest.", 100);
        assert_eq!(chunks, vec!["Visit example.com today. Then rest."]);
        let sentences = sentences("Visit example.com today. Then rest.");
        assert_eq!(sentences, vec!["Visit example.com today.", "Then rest."]);
    }

    #[test]
    fn paragraph_breaks_end_sentences() {
        let s = sentences("First thought\n\nSecond thought");
        assert_eq!(s, vec!["First thought", "Second thought"]);
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(split_text("   \n ", 50).is_empty());
    }

    #[test]
    fn property_sweep_over_limits() {
        let text = "Settle into a comfortable position. Allow your shoulders to drop away from your ears! \
                    Is there tension in your hands? Release it... Now, breathe-in-slowly-and-deeply-through-the-nose. \
                    Hold. And exhale.";
        for limit in [1, 3, 7, 16, 40, 80, 500] {
            assert_lossless(text, limit);
        }
    }
}
