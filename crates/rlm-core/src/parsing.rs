//! Turn-text parsing (§4.H): fenced ```repl``` code-block extraction, the
//! textual `FINAL(...)` marker (recognized outside fenced regions, balanced
//! on parentheses), and the execution-result pretty-printer fed back into
//! the next prompt.

use crate::types::ReplResult;

/// One fenced code block found in LM output.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeFence {
    pub lang: String,
    pub code: String,
}

fn fence_lang(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    trimmed.strip_prefix("```").map(|rest| rest.trim())
}

/// Splits `text` into fenced and non-fenced runs, line by line. Each element
/// is `(in_fence, lang_if_opening, line)`; used by both extraction helpers
/// below so they agree on what counts as "inside a fence".
fn scan_lines(text: &str) -> Vec<CodeFence> {
    let mut fences = Vec::new();
    let mut in_fence = false;
    let mut current_lang = String::new();
    let mut current_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            if in_fence {
                fences.push(CodeFence {
                    lang: current_lang.clone(),
                    code: current_lines.join("\n"),
                });
                current_lines.clear();
                in_fence = false;
            } else {
                current_lang = fence_lang(line).unwrap_or_default().to_string();
                in_fence = true;
            }
        } else if in_fence {
            current_lines.push(line);
        }
    }
    // An unterminated trailing fence is dropped: no closing ``` means the
    // model's output was truncated mid-block and nothing inside it is safe
    // to execute.
    fences
}

/// Extracts every fenced ```repl``` block in source order.
pub fn extract_repl_blocks(text: &str) -> Vec<String> {
    scan_lines(text)
        .into_iter()
        .filter(|f| f.lang.eq_ignore_ascii_case("repl"))
        .map(|f| f.code)
        .collect()
}

/// Replaces the contents of every fenced region with blank lines, preserving
/// line count and non-fenced text verbatim. Used ahead of `FINAL(...)`
/// detection so a code comment or string literal containing the text
/// `FINAL(...)` inside a fence is never mistaken for the termination marker.
fn blank_fenced_regions(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_fence = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            out.push('\n');
        } else if in_fence {
            out.push('\n');
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Finds a top-level `FINAL(...)` marker outside fenced regions and returns
/// its argument text, trimmed and with a single layer of surrounding quotes
/// stripped if present. Parentheses are matched with quote-awareness so an
/// argument like `FINAL("the answer is (42)")` is not truncated early.
pub fn find_final_marker(text: &str) -> Option<String> {
    let scrubbed = blank_fenced_regions(text);
    let bytes = scrubbed.as_bytes();
    let needle = b"FINAL(";
    let mut search_from = 0;

    while let Some(rel) = find_subslice(&bytes[search_from..], needle) {
        let start = search_from + rel;
        // Reject FINAL_VAR( and other identifier-prefixed matches: the
        // character before "FINAL(" must not be an identifier character.
        let preceded_by_ident = start > 0
            && (bytes[start - 1].is_ascii_alphanumeric() || bytes[start - 1] == b'_');
        if preceded_by_ident {
            search_from = start + needle.len();
            continue;
        }

        let open_paren = start + needle.len() - 1;
        if let Some(close) = matching_paren(&scrubbed, open_paren) {
            let inner = &scrubbed[open_paren + 1..close];
            return Some(strip_quotes(inner.trim()));
        }
        search_from = start + needle.len();
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Given the byte index of an opening `(`, returns the index of its matching
/// `)`, treating text inside single/double quotes as opaque.
fn matching_paren(text: &str, open_idx: usize) -> Option<usize> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let start_pos = chars.iter().position(|&(i, _)| i == open_idx)?;

    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut prev_escape = false;

    for &(idx, ch) in &chars[start_pos..] {
        if let Some(q) = quote {
            if prev_escape {
                prev_escape = false;
            } else if ch == '\\' {
                prev_escape = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

/// Renders an executed block's result back into the next prompt (§4.H).
pub fn format_execution_result(result: &ReplResult) -> String {
    let mut rendered = String::new();
    if !result.stdout.is_empty() {
        rendered.push_str("stdout:\n");
        rendered.push_str(&result.stdout);
        if !result.stdout.ends_with('\n') {
            rendered.push('\n');
        }
    }
    if result.error {
        rendered.push_str("error:\n");
        rendered.push_str(&result.stderr);
        if !result.stderr.ends_with('\n') {
            rendered.push('\n');
        }
    } else if !result.stderr.is_empty() {
        rendered.push_str("stderr:\n");
        rendered.push_str(&result.stderr);
        if !result.stderr.ends_with('\n') {
            rendered.push('\n');
        }
    }
    if rendered.is_empty() {
        rendered.push_str("(no output)\n");
    }
    if !result.sub_call_usage.is_empty() {
        let mut models: Vec<_> = result.sub_call_usage.keys().collect();
        models.sort();
        rendered.push_str("sub-calls: ");
        let parts: Vec<String> = models
            .iter()
            .map(|m| format!("{m}={}tok", result.sub_call_usage[*m].total()))
            .collect();
        rendered.push_str(&parts.join(", "));
        rendered.push('\n');
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_repl_block() {
        let text = "some prose\n```repl\nx = 1\nprint(x)\n```\nmore prose";
        let blocks = extract_repl_blocks(text);
        assert_eq!(blocks, vec!["x = 1\nprint(x)".to_string()]);
    }

    #[test]
    fn extracts_multiple_blocks_in_order() {
        let text = "```repl\na = 1\n```\ntext\n```repl\nb = 2\n```";
        let blocks = extract_repl_blocks(text);
        assert_eq!(blocks, vec!["a = 1".to_string(), "b = 2".to_string()]);
    }

    #[test]
    fn ignores_non_repl_fences() {
        let text = "```python\nimport os\n```\n```repl\nx = 1\n```";
        let blocks = extract_repl_blocks(text);
        assert_eq!(blocks, vec!["x = 1".to_string()]);
    }

    #[test]
    fn unterminated_fence_is_dropped() {
        let text = "```repl\nx = 1\nno closing fence";
        assert!(extract_repl_blocks(text).is_empty());
    }

    #[test]
    fn finds_final_marker_with_simple_string() {
        let text = "I'm done. FINAL(\"the answer is 42\")";
        assert_eq!(find_final_marker(text).as_deref(), Some("the answer is 42"));
    }

    #[test]
    fn finds_final_marker_with_nested_parens_in_quotes() {
        let text = "FINAL(\"the answer is (42)\")";
        assert_eq!(find_final_marker(text).as_deref(), Some("the answer is (42)"));
    }

    #[test]
    fn ignores_final_inside_fenced_code() {
        let text = "```repl\n# calls FINAL(\"nope\") internally\nx = 1\n```\nnot done yet";
        assert_eq!(find_final_marker(text), None);
    }

    #[test]
    fn does_not_match_final_var() {
        let text = "FINAL_VAR(\"answer\")";
        assert_eq!(find_final_marker(text), None);
    }

    #[test]
    fn format_execution_result_reports_no_output() {
        let result = ReplResult::ok("");
        assert_eq!(format_execution_result(&result), "(no output)\n");
    }

    #[test]
    fn format_execution_result_includes_error_body() {
        let result = ReplResult::failed("Traceback...\nValueError: bad");
        let rendered = format_execution_result(&result);
        assert!(rendered.starts_with("error:\n"));
        assert!(rendered.contains("ValueError"));
    }

    #[test]
    fn format_execution_result_includes_sub_call_usage() {
        let mut result = ReplResult::ok("hi");
        result.record_sub_call("gpt", crate::types::Usage::new(3, 4));
        let rendered = format_execution_result(&result);
        assert!(rendered.contains("gpt=7tok"));
    }
}
