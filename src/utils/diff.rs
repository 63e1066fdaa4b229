//! Word-level diff between two prompt versions.

/// One step of an edit script turning the old text into the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOp {
    Equal(String),
    Insert(String),
    Delete(String),
}

/// Splits text into words, each keeping its trailing whitespace, so joining the tokens restores the text.
fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_space = false;
    for (idx, c) in text.char_indices() {
        if c.is_whitespace() {
            in_space = true;
        } else if in_space {
            tokens.push(&text[start..idx]);
            start = idx;
            in_space = false;
        }
    }
    if start < text.len() {
        tokens.push(&text[start..]);
    }
    tokens
}

/// Diffs `original` against `updated` word by word (longest common subsequence).
///
/// Adjacent operations of the same kind are merged.
pub fn diff_words(original: &str, updated: &str) -> Vec<DiffOp> {
    let a = tokenize(original);
    let b = tokenize(updated);
    // lcs[i][j] = LCS length of a[i..] and b[j..]
    let mut lcs = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut ops: Vec<DiffOp> = Vec::new();
    let mut push = |op: DiffOp| {
        if let Some(last) = ops.last_mut() {
            match (last, &op) {
                (DiffOp::Equal(last), DiffOp::Equal(text))
                | (DiffOp::Insert(last), DiffOp::Insert(text))
                | (DiffOp::Delete(last), DiffOp::Delete(text)) => {
                    last.push_str(text);
                    return;
                }
                _ => {}
            }
        }
        ops.push(op);
    };
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            push(DiffOp::Equal(a[i].to_string()));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            push(DiffOp::Delete(a[i].to_string()));
            i += 1;
        } else {
            push(DiffOp::Insert(b[j].to_string()));
            j += 1;
        }
    }
    a[i..].iter().for_each(|t| push(DiffOp::Delete(t.to_string())));
    b[j..].iter().for_each(|t| push(DiffOp::Insert(t.to_string())));
    ops
}

/// Counts of (inserted, deleted) words, for log lines.
pub fn summarize(ops: &[DiffOp]) -> (usize, usize) {
    ops.iter().fold((0, 0), |(ins, del), op| match op {
        DiffOp::Insert(text) => (ins + text.split_whitespace().count(), del),
        DiffOp::Delete(text) => (ins, del + text.split_whitespace().count()),
        DiffOp::Equal(_) => (ins, del),
    })
}
