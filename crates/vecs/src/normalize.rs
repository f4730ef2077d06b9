//! Prompt normalization: lowercase, strip ASCII punctuation, collapse
//! whitespace runs, trim ends. Used both for the L1 composite key and as the
//! text handed to the embedder.

/// Normalizes `text` in place per the rules above.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for ch in text.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_punctuation() {
            continue;
        }
        if lower.is_whitespace() {
            if !last_was_space && !out.is_empty() {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(lower);
            last_was_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Builds the L1 composite key `"<prompt>|<params>"` from already-normalized
/// halves.
pub fn composite_key(normalized_prompt: &str, normalized_params: &str) -> String {
    let mut key = String::with_capacity(normalized_prompt.len() + 1 + normalized_params.len());
    key.push_str(normalized_prompt);
    key.push('|');
    key.push_str(normalized_params);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_strips_punctuation() {
        assert_eq!(normalize("What is 2+2?"), "what is 22");
    }

    #[test]
    fn collapses_internal_whitespace() {
        assert_eq!(normalize("dogs   are\tmammals"), "dogs are mammals");
    }

    #[test]
    fn trims_leading_and_trailing_whitespace() {
        assert_eq!(normalize("  hello world  "), "hello world");
    }

    #[test]
    fn composite_key_joins_with_pipe() {
        assert_eq!(composite_key("hello", "{}"), "hello|{}");
    }
}
