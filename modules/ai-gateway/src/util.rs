/// Truncate a string to at most `max_bytes` bytes without splitting a
/// multi-byte character.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}

/// Strip markdown code fences that models wrap around JSON payloads.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "résumé résumé";
        let truncated = truncate_to_char_boundary(text, 10);
        assert!(truncated.len() <= 10);
        assert!(text.starts_with(truncated));
    }

    #[test]
    fn truncate_is_noop_when_short() {
        assert_eq!(truncate_to_char_boundary("short", 1000), "short");
    }

    #[test]
    fn strips_fenced_json() {
        assert_eq!(strip_code_blocks("```json\n[1,2]\n```"), "[1,2]");
        assert_eq!(strip_code_blocks("```\n[1,2]\n```"), "[1,2]");
        assert_eq!(strip_code_blocks("[1,2]"), "[1,2]");
    }
}
