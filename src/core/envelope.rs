/*
 * The serialization envelope wrapped around each file when the selection is
 * packed into a context document. Token estimates are computed over the
 * enveloped text, not the raw file, so the numbers shown in the tree match what
 * the downstream consumer will actually receive.
 */
use crate::core::models::LineRange;

/*
 * Wraps `content` in the start/end markers used for a packed file. The display
 * path is relative to the owning workspace root. A newline is inserted before
 * the footer if the content does not already end with one.
 */
pub fn wrap_file_content(display_path: &str, content: &str) -> String {
    let mut wrapped = String::with_capacity(content.len() + 2 * display_path.len() + 48);
    wrapped.push_str(&format!("--- START FILE: {display_path} ---\n"));
    wrapped.push_str(content);
    if !content.is_empty() && !content.ends_with('\n') {
        wrapped.push('\n');
    }
    wrapped.push_str(&format!("--- END FILE: {display_path} ---\n\n"));
    wrapped
}

/*
 * Restricts `content` to the lines covered by `range` (1-based, inclusive),
 * keeping their original line terminators. Lines past the end are ignored.
 */
pub fn apply_line_range(content: &str, range: LineRange) -> String {
    content
        .split_inclusive('\n')
        .skip(range.start.saturating_sub(1))
        .take((range.end + 1).saturating_sub(range.start))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_file_content_adds_markers_and_trailing_newline() {
        let wrapped = wrap_file_content("src/a.rs", "fn main() {}");
        assert_eq!(
            wrapped,
            "--- START FILE: src/a.rs ---\nfn main() {}\n--- END FILE: src/a.rs ---\n\n"
        );
    }

    #[test]
    fn test_wrap_file_content_keeps_existing_newline() {
        let wrapped = wrap_file_content("b.txt", "line\n");
        assert_eq!(wrapped, "--- START FILE: b.txt ---\nline\n--- END FILE: b.txt ---\n\n");
    }

    #[test]
    fn test_wrap_file_content_empty_file() {
        let wrapped = wrap_file_content("empty", "");
        assert_eq!(wrapped, "--- START FILE: empty ---\n--- END FILE: empty ---\n\n");
    }

    #[test]
    fn test_apply_line_range_selects_inclusive_lines() {
        let content = "one\ntwo\nthree\nfour";
        assert_eq!(apply_line_range(content, LineRange::new(2, 3)), "two\nthree\n");
        assert_eq!(apply_line_range(content, LineRange::new(4, 10)), "four");
        assert_eq!(apply_line_range(content, LineRange::new(9, 12)), "");
    }
}
