//! # promptimize
//!
//! Automatic prompt optimization for LLM applications in Rust
//!
//! **Note: `promptimize` is a WIP, so the APIs are subject to change.**
//!
//! ## Usage
//! `promptimize` is not released on crates.io yet. To use it, add a dependency in `Cargo.toml`
//! ```toml
//! promptimize = { git = "https://github.com/ifsheldon/promptimize.git", branch = "main"}
//! ```
//!
//! ## Why `promptimize`
//!
//! Prompts are the parameters of an LLM application, and like any parameter they can be fitted to data.
//! `promptimize` closes the loop: run the application over a dataset, score the outputs, show the scores and
//! comments to an optimizer model and let it rewrite the prompt. Repeat, keep the best.
//!
//! ## Concepts and Design
//!
//! The design stays data-driven and explicit. Every collaborator (model, dataset store, trace store) is a value
//! passed to the component that needs it; there is no global client.
//!
//! ### Prompt Template and Placeholder
//!
//! A template looks like
//!
//! ```text
//! Summarize the following text in one sentence: {text}
//! ```
//!
//! `{text}` is a placeholder named `"text"`. Literal braces are written as `{{` and `}}`. The set of
//! placeholders of a template is its contract with the chain built from it: the optimizer only accepts revisions
//! that keep exactly the same set.
//!
//! ### Partial Prompt and Filler
//!
//! A [`PartialPrompt`](crate::prompt::PartialPrompt) comes only from
//! [`PromptTemplate::construct_prompt`](crate::prompt::PromptTemplate::construct_prompt) and records which placeholder
//! gets filled by what value. Fillers ([`FillPlaceholders`](crate::filler::FillPlaceholders),
//! [`FillWith<CTX>`](crate::filler::FillWith)) fill placeholders, e.g.
//! [`InputsFiller`](crate::filler::InputsFiller) fills them from the inputs of a dataset example.
//!
//! ### Chain
//!
//! A [`Chain`](crate::chain::Chain) maps example inputs to a text output. A
//! [`PromptChain`](crate::chain::PromptChain) is `template | model | text`.
//!
//! ### Optimization loop
//!
//! * [evaluation]: run a chain over examples and score every run with evaluators.
//! * [critique]: a model-graded evaluator.
//! * [feedback]: render runs, labels and scores into an annotated transcript.
//! * [optimizer]: ask a model for an improved prompt, validate it, feed errors back on rejection.
//! * [train]: alternate the above and keep the best candidate.
//!
//! Around it, [fewshot] turns in-app thumbs-up feedback into few-shot examples and [testing] runs dataset-driven
//! tests that leave pass/fail feedback on their runs.
//!
//! ## Features
//! * `openai` (default): [`OpenAIChat`](crate::utils::llm::openai::OpenAIChat) and `tiktoken` token counting.
//! * `terminal_printing` (default): prompt diffs rendered in the terminal.
//!
//! ## License
//!
//! `promptimize` will always remain free under Apache license.
//!
//! ## Attribution
//! * `tiktoken-rs`: In [crate::utils::token::tiktoken], we re-export the `tiktoken-rs` crate.


pub mod prompt;
pub mod filler;
pub mod utils;
pub mod schemas;
pub mod store;
pub mod chain;
pub mod evaluation;
pub mod critique;
pub mod feedback;
pub mod optimizer;
pub mod train;
pub mod fewshot;
pub mod testing;
pub mod config;
