use regex::Regex;

/// A response split around the first `<tag>...</tag>` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedSplit {
    pub pre: String,
    pub inner: Option<String>,
    pub post: String,
}

/// Splits `text` around the first `<tag>...</tag>` section.
///
/// When no such section exists, the whole (trimmed) text is returned as `pre`.
///
/// # Example
/// ```
/// use promptimize::utils::postprocess::tags::split_tagged;
/// let split = split_tagged("Critique first.<tweet>Ship it</tweet>Thanks", "tweet");
/// assert_eq!(split.inner.as_deref(), Some("Ship it"));
/// assert_eq!(split.post, "Thanks");
/// ```
pub fn split_tagged(text: &str, tag: &str) -> TaggedSplit {
    let tag = regex::escape(tag);
    let pattern = format!(r"(?s)^(.*?)<{tag}>(.*?)</{tag}>(.*)$");
    let text = text.trim();
    // the pattern is built from an escaped tag, so it always compiles
    let captures = Regex::new(&pattern).ok().and_then(|re| re.captures(text).map(|c| {
        (c[1].to_string(), c[2].to_string(), c[3].to_string())
    }));
    match captures {
        Some((pre, inner, post)) => TaggedSplit { pre, inner: Some(inner), post },
        None => TaggedSplit { pre: text.to_string(), inner: None, post: String::new() },
    }
}
