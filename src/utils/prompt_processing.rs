//! Placeholder scanning for prompt templates.
//!
//! A placeholder is written `{name}`. Literal braces are escaped as `{{` and `}}`.
//! A field may carry a conversion or a format spec (`{name!r}`, `{name:>8}`), in which case the
//! placeholder name is the part before the first `!` or `:`.

use std::collections::{BTreeSet, HashMap};

use crate::prompt::errors::TemplateSyntaxError;

/// A piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    /// Literal text with escapes already resolved.
    Literal(String),
    /// A placeholder reference by name.
    Placeholder(String),
}

/// Scans a template into literal and placeholder segments.
pub(crate) fn parse_template(template: &str) -> Result<Vec<Segment>, TemplateSyntaxError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        match c {
            '{' => {
                if let Some((_, '{')) = chars.peek() {
                    chars.next();
                    literal.push('{');
                    continue;
                }
                let mut field = String::new();
                let mut closed = false;
                for (_, fc) in chars.by_ref() {
                    match fc {
                        '}' => {
                            closed = true;
                            break;
                        }
                        '{' => return Err(TemplateSyntaxError::NestedBrace { position: idx }),
                        _ => field.push(fc),
                    }
                }
                if !closed {
                    return Err(TemplateSyntaxError::UnclosedPlaceholder { position: idx });
                }
                let name = field_name(&field);
                if name.is_empty() {
                    return Err(TemplateSyntaxError::EmptyPlaceholder { position: idx });
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder(name.to_string()));
            }
            '}' => {
                if let Some((_, '}')) = chars.peek() {
                    chars.next();
                    literal.push('}');
                } else {
                    return Err(TemplateSyntaxError::LoneClosingBrace { position: idx });
                }
            }
            _ => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

#[inline]
fn field_name(field: &str) -> &str {
    let end = field.find(|c| c == '!' || c == ':').unwrap_or(field.len());
    &field[..end]
}

/// Collects the distinct placeholder names of parsed segments.
pub(crate) fn placeholder_names(segments: &[Segment]) -> BTreeSet<String> {
    segments
        .iter()
        .filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.clone()),
            Segment::Literal(_) => None,
        })
        .collect()
}

/// Returns the set of placeholder names in `template`.
///
/// # Example
/// ```
/// use promptimize::utils::prompt_processing::get_placeholders;
/// let names = get_placeholders("Summarize {text} in {{braces}} for {audience}").unwrap();
/// assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["audience", "text"]);
/// ```
pub fn get_placeholders(template: &str) -> Result<BTreeSet<String>, TemplateSyntaxError> {
    parse_template(template).map(|segments| placeholder_names(&segments))
}

/// Renders segments, substituting placeholders from `mapping`.
///
/// Returns the name of the first placeholder missing from the mapping, if any.
pub(crate) fn render_segments(segments: &[Segment], mapping: &HashMap<String, Option<String>>) -> Result<String, String> {
    let mut rendered = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => rendered.push_str(text),
            Segment::Placeholder(name) => match mapping.get(name) {
                Some(Some(value)) => rendered.push_str(value),
                _ => return Err(name.clone()),
            },
        }
    }
    Ok(rendered)
}
