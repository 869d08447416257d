pub fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    let len = s.len();
    if index >= len {
        return len;
    }

    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }

    index
}

pub fn split_text(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let chunk_len = if remaining.len() <= max_len {
            remaining.len()
        } else {
            let boundary = floor_char_boundary(remaining, max_len.min(remaining.len()));
            remaining[..boundary].rfind('\n').unwrap_or(boundary)
        };
        chunks.push(remaining[..chunk_len].to_string());
        remaining = &remaining[chunk_len..];
        if remaining.starts_with('\n') {
            remaining = &remaining[1..];
        }
    }
    chunks
}

/// Redact substrings that must not reach a chat channel: absolute
/// filesystem paths and long bearer-like tokens (20+ chars).
pub fn redact_sensitive(text: &str) -> String {
    use std::sync::OnceLock;

    static PATH_RE: OnceLock<regex::Regex> = OnceLock::new();
    static TOKEN_RE: OnceLock<regex::Regex> = OnceLock::new();

    let path_re = PATH_RE.get_or_init(|| {
        regex::Regex::new(r"(?:[A-Za-z]:)?(?:/[A-Za-z0-9_.@-]+){2,}").expect("path regex")
    });
    let token_re = TOKEN_RE
        .get_or_init(|| regex::Regex::new(r"\b[A-Za-z0-9_-]{20,}\b").expect("token regex"));

    let out = path_re.replace_all(text, "[path]");
    token_re.replace_all(&out, "[redacted]").into_owned()
}
