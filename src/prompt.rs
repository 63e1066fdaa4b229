//! # Prompt
//! A prompt is simply a string
//! ## PromptTemplate
//! A prompt template is a string with placeholders. It can also have metadata in JSON format.
//!
//! ## Placeholder
//! A placeholder is a string that is in the format of `{name}`. It can be filled with a value.
//! Literal braces are written as `{{` and `}}`.
//!
//! The set of placeholder names of a template is computed once and never changes. A template is never mutated;
//! an optimizer that rewrites a template produces a brand-new [PromptTemplate].
//!
//! ## PartialPrompt
//! A partial prompt is a prompt template with some placeholders filled. A partial prompt can be only constructed from a prompt template via [PromptTemplate::construct_prompt].
//!
//! The placeholders in a partial prompt can be filled with values via [PartialPrompt::try_fill], which fails on a placeholder the template does not have. It also updates the filling values of the placeholders.
//! When all placeholders are filled, the partial prompt can be completed via [PartialPrompt::complete], in which the placeholders in a template are **actually** replaced with the filling values.
//! Filling values are inserted verbatim, so they may contain braces.


use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use crate::prompt::errors::{PlaceholderMismatch, PlaceholderNotExist, TemplateSyntaxError, UnfilledPlaceholders};
use crate::utils::prompt_processing::{parse_template, placeholder_names, render_segments, Segment};
use log::warn;
use crate::utils::JsonMap;


/// A prompt template with some placeholders filled. A partial prompt can be only constructed from a prompt template via [PromptTemplate::construct_prompt].
#[derive(Debug, Clone)]
#[readonly::make]
pub struct PartialPrompt {
    /// The template of the partial prompt, readonly
    #[readonly]
    pub template: PromptTemplate,

    /// Mapping from placeholder name to its filling value
    pub(crate) placeholder_to_vals: HashMap<String, Option<String>>,

    /// Record the placeholders that are not filled yet
    pub(crate) unfilled_placeholders: HashSet<String>,
}

impl PartialPrompt {
    /// Fill the placeholders in the partial prompt with the given values.
    /// Returns an error if the placeholder does not exist.
    pub fn try_fill(&mut self, placeholder: impl Into<String>, value: impl Into<String>) -> Result<&mut Self, PlaceholderNotExist> {
        let placeholder = placeholder.into();
        if self.placeholder_to_vals.contains_key(&placeholder) {
            self.unfilled_placeholders.remove(&placeholder);
            self.placeholder_to_vals.insert(placeholder, Some(value.into()));
            Ok(self)
        } else {
            Err(PlaceholderNotExist::new(placeholder, value, &self.template.placeholders))
        }
    }

    /// Names of the placeholders that still need a value.
    pub fn unfilled(&self) -> BTreeSet<String> {
        self.unfilled_placeholders.iter().cloned().collect()
    }

    /// Complete the partial prompt and return the completed prompt.
    /// Returns an error if there are still unfilled placeholders.
    pub fn complete(&self) -> Result<String, UnfilledPlaceholders> {
        let unfilled_error = || UnfilledPlaceholders {
            all_placeholders: self.template.placeholders.iter().cloned().collect(),
            unfilled_placeholders: self.unfilled().into_iter().collect(),
        };
        if !self.unfilled_placeholders.is_empty() {
            return Err(unfilled_error());
        }
        render_segments(&self.template.segments, &self.placeholder_to_vals).map_err(|_| unfilled_error())
    }
}

/// A prompt template with placeholders. It can also have metadata in JSON format.
#[derive(Debug, Clone)]
#[readonly::make]
pub struct PromptTemplate {
    /// The template of the partial prompt, immutable
    template: Arc<String>,

    /// Parsed segments of the template
    segments: Arc<Vec<Segment>>,

    /// The placeholders in the template, readonly
    #[readonly]
    pub placeholders: BTreeSet<String>,

    /// The metadata of the prompt template, readonly
    #[readonly]
    pub meta_data: Arc<JsonMap>,
}

impl PromptTemplate {
    /// Create a prompt template from a string without metadata.
    pub fn new(template: impl Into<String>) -> Result<Self, TemplateSyntaxError> {
        Self::with_metadata(template, JsonMap::new())
    }

    /// Create a prompt template from a string with metadata. Warns if the template does not have any placeholder.
    pub fn with_metadata(template: impl Into<String>, metadata: JsonMap) -> Result<Self, TemplateSyntaxError> {
        let template = template.into();
        let segments = parse_template(&template)?;
        let placeholders = placeholder_names(&segments);
        if placeholders.is_empty() {
            warn!("Your prompt template does not have a placeholder. If this is intended, ignore this message. \
            Otherwise, check whether you have written placeholders correctly.\n\
            Got prompt template:\n\
            {}", template);
        }
        Ok(Self {
            template: Arc::new(template),
            segments: Arc::new(segments),
            meta_data: Arc::new(metadata),
            placeholders,
        })
    }

    /// Get the prompt template as a string.
    #[inline]
    pub fn str(&self) -> &str {
        &self.template
    }

    /// Construct a partial prompt from the prompt template.
    pub fn construct_prompt(&self) -> PartialPrompt {
        PartialPrompt {
            template: self.clone(),
            placeholder_to_vals: self.placeholders.iter().map(|p| (p.clone(), None)).collect(),
            unfilled_placeholders: self.placeholders.iter().cloned().collect(),
        }
    }

    /// Check that `other` has exactly the placeholders of this template.
    pub fn check_same_placeholders(&self, other: &PromptTemplate) -> Result<(), PlaceholderMismatch> {
        PlaceholderMismatch::check(&self.placeholders, &other.placeholders)
    }
}

impl PartialEq for PromptTemplate {
    fn eq(&self, other: &Self) -> bool {
        self.template == other.template
    }
}

impl Eq for PromptTemplate {}

impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

impl FromStr for PromptTemplate {
    type Err = TemplateSyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

pub mod errors {
    use std::collections::BTreeSet;
    use std::error::Error;
    use std::fmt;
    use std::fmt::Formatter;

    /// Error when trying to complete a partial prompt but there are still unfilled placeholders.
    #[derive(Debug)]
    pub struct UnfilledPlaceholders {
        pub unfilled_placeholders: Vec<String>,
        pub all_placeholders: Vec<String>,
    }

    impl fmt::Display for UnfilledPlaceholders {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "UnfilledPlaceholders: to complete the prompt template,\n  Requires Placeholders:{:?}\n  Unfilled Placeholders:{:?}",
                   self.all_placeholders, self.unfilled_placeholders)
        }
    }

    impl Error for UnfilledPlaceholders {}

    /// Error when trying to fill a placeholder that does not exist in the prompt template of the partial prompt.
    #[derive(Debug)]
    pub struct PlaceholderNotExist {
        pub try_fill_placeholder: String,
        pub value: String,
        pub available_placeholders: Vec<String>,
    }

    impl PlaceholderNotExist {
        pub(crate) fn new(try_fill_placeholder: impl Into<String>,
                          value: impl Into<String>,
                          available_placeholders: &BTreeSet<String>) -> Self {
            let available_placeholders = available_placeholders.iter().cloned().collect();
            PlaceholderNotExist {
                try_fill_placeholder: try_fill_placeholder.into(),
                value: value.into(),
                available_placeholders,
            }
        }
    }

    impl fmt::Display for PlaceholderNotExist {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "PlaceholderNotExist: try to fill placeholder = {} with value = {}, but available placeholders are {:?}",
                   self.try_fill_placeholder,
                   self.value,
                   self.available_placeholders)
        }
    }

    impl Error for PlaceholderNotExist {}

    /// Error when a template string is malformed. Positions are byte offsets into the template.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum TemplateSyntaxError {
        UnclosedPlaceholder { position: usize },
        LoneClosingBrace { position: usize },
        EmptyPlaceholder { position: usize },
        NestedBrace { position: usize },
    }

    impl fmt::Display for TemplateSyntaxError {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            match self {
                TemplateSyntaxError::UnclosedPlaceholder { position } =>
                    write!(f, "TemplateSyntaxError: '{{' at byte {} is never closed", position),
                TemplateSyntaxError::LoneClosingBrace { position } =>
                    write!(f, "TemplateSyntaxError: single '}}' at byte {}, write '}}}}' for a literal brace", position),
                TemplateSyntaxError::EmptyPlaceholder { position } =>
                    write!(f, "TemplateSyntaxError: placeholder at byte {} has no name", position),
                TemplateSyntaxError::NestedBrace { position } =>
                    write!(f, "TemplateSyntaxError: placeholder at byte {} contains '{{'", position),
            }
        }
    }

    impl Error for TemplateSyntaxError {}

    /// Error when two templates do not share the same placeholder set.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PlaceholderMismatch {
        pub expected: BTreeSet<String>,
        pub got: BTreeSet<String>,
        pub missing: BTreeSet<String>,
        pub extra: BTreeSet<String>,
    }

    impl PlaceholderMismatch {
        /// Ok when `got` equals `expected`, otherwise the mismatch.
        pub fn check(expected: &BTreeSet<String>, got: &BTreeSet<String>) -> Result<(), PlaceholderMismatch> {
            if expected == got {
                return Ok(());
            }
            Err(PlaceholderMismatch {
                expected: expected.clone(),
                got: got.clone(),
                missing: expected.difference(got).cloned().collect(),
                extra: got.difference(expected).cloned().collect(),
            })
        }
    }

    impl fmt::Display for PlaceholderMismatch {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "Unexpected variables included in output prompt. Expected {:?}. Got: {:?}.\nMissing: {:?}\nExtra: {:?}",
                   self.expected, self.got, self.missing, self.extra)
        }
    }

    impl Error for PlaceholderMismatch {}
}
