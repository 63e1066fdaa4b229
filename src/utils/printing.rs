use termimad::{FmtText, MadSkin};

use crate::utils::diff::{diff_words, DiffOp};

/// Escapes characters that termimad would read as markdown markup.
fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '~' | '`' | '_' | '|' | '#' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Wraps every non-blank line of `text` in `marker` so that styling survives line breaks.
fn mark_lines(text: &str, marker: &str) -> String {
    text.split('\n')
        .map(|line| {
            let trimmed = line.trim_end();
            if trimmed.trim().is_empty() {
                line.to_string()
            } else {
                format!("{marker}{}{marker}{}", escape_markdown(trimmed), &line[trimmed.len()..])
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Renders a prompt diff as markdown: deletions are struck through and insertions are bold.
pub fn prompt_diff_markdown(title: &str, original: &str, updated: &str) -> String {
    let body: String = diff_words(original, updated)
        .into_iter()
        .map(|op| match op {
            DiffOp::Equal(text) => escape_markdown(&text),
            DiffOp::Delete(text) => mark_lines(&text, "~~"),
            DiffOp::Insert(text) => mark_lines(&text, "**"),
        })
        .collect();
    let title = if title.is_empty() { "Prompt Diff" } else { title };
    format!("## {}\n\n{}\n", escape_markdown(title), body)
}

/// Prints a colorized diff of two prompts to the terminal.
pub fn print_prompt_diff(title: &str, original: &str, updated: &str) {
    let skin = MadSkin::default();
    let markdown = prompt_diff_markdown(title, original, updated);
    println!("{}", FmtText::from(&skin, &markdown, None));
}
