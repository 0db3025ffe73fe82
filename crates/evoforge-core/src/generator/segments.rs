use regex::Regex;
use std::sync::OnceLock;

/// Prose/code split of a model reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segments {
    pub text: Vec<String>,
    pub code: Vec<String>,
    pub languages: Vec<String>,
}

fn fence_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```([a-zA-Z]*)\n(.*?)```").expect("static regex"))
}

/// Splits `output` into fenced code blocks and the prose around them.
///
/// Prose before each block is kept even when empty, so `text[i]` always precedes
/// `code[i]`. Trailing prose is appended only when non-empty, except that a reply
/// without any block yields exactly one (trimmed) prose segment.
pub fn split_explanation_and_code(output: &str) -> Segments {
    let mut seg = Segments::default();
    let mut last_idx = 0;

    for caps in fence_pattern().captures_iter(output) {
        let Some(whole) = caps.get(0) else { continue };
        seg.text.push(output[last_idx..whole.start()].trim().to_string());
        seg.languages
            .push(caps.get(1).map_or("", |m| m.as_str()).trim().to_string());
        seg.code
            .push(caps.get(2).map_or("", |m| m.as_str()).trim().to_string());
        last_idx = whole.end();
    }

    let trailing = output[last_idx..].trim();
    if !trailing.is_empty() || seg.code.is_empty() {
        seg.text.push(trailing.to_string());
    }

    if seg.code.len() > seg.text.len() {
        seg.text.insert(0, String::new());
    }

    seg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_block_between_prose() {
        let out = "Idea: favour small objects.\n```cpp\nreturn -obj_info.size;\n```\nHope it helps.";
        let s = split_explanation_and_code(out);
        assert_eq!(s.text, vec!["Idea: favour small objects.", "Hope it helps."]);
        assert_eq!(s.code, vec!["return -obj_info.size;"]);
        assert_eq!(s.languages, vec!["cpp"]);
    }

    #[test]
    fn no_block_gives_single_trimmed_segment() {
        let s = split_explanation_and_code("  I cannot write that.  \n");
        assert!(s.code.is_empty());
        assert_eq!(s.text, vec!["I cannot write that."]);

        let s = split_explanation_and_code("");
        assert_eq!(s.text, vec![""]);
    }

    #[test]
    fn leading_block_gets_empty_prose_slot() {
        let s = split_explanation_and_code("```c\nu32 x = 1;\n```");
        assert_eq!(s.text, vec![""]);
        assert_eq!(s.code, vec!["u32 x = 1;"]);
    }

    #[test]
    fn multiple_blocks_keep_source_order() {
        let out = "a\n```c\nfirst\n```\nb\n```\nsecond\n```\nc";
        let s = split_explanation_and_code(out);
        assert_eq!(s.code, vec!["first", "second"]);
        assert_eq!(s.languages, vec!["c", ""]);
        assert_eq!(s.text, vec!["a", "b", "c"]);
    }

    #[test]
    fn unterminated_fence_is_prose() {
        let s = split_explanation_and_code("text\n```cpp\nint x;");
        assert!(s.code.is_empty());
        assert_eq!(s.text.len(), 1);
    }
}
