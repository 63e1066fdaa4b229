//! Optimize a summarization prompt against a small labeled dataset, then collect thumbs-up feedback on the best
//! prompt's output and turn it into few-shot examples.
//!
//! Needs `OPENAI_API_KEY`. Set `RUST_LOG=info` to follow the training loop.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use rand::thread_rng;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use promptimize::chain::{Chain, PromptChain};
use promptimize::evaluation::{EvaluationHarness, Evaluator};
use promptimize::fewshot::{FeedbackCollector, Thumbs, DEFAULT_FEW_SHOTS};
use promptimize::optimizer::PromptOptimizer;
use promptimize::prompt::PromptTemplate;
use promptimize::schemas::{EvaluationResult, Example, Run};
use promptimize::store::InMemoryStore;
use promptimize::train::{TrainConfig, Trainer};
use promptimize::utils::llm::openai::OpenAIChat;
use promptimize::utils::JsonMap;

const ARTICLES: [(&str, &str); 4] = [
    ("The city council approved a new bike lane network on Tuesday. Construction starts in spring and is expected to take two years.",
     "Council approves bike lanes; two-year build starts in spring."),
    ("Researchers found that a common soil bacterium can break down certain plastics within weeks under lab conditions.",
     "Soil bacterium breaks down some plastics in weeks in the lab."),
    ("The local library will extend its weekend hours starting next month after a surge in student visitors.",
     "Library extends weekend hours next month due to student demand."),
    ("A heatwave is forecast for the end of the week, with temperatures expected to exceed 38 degrees in the valley.",
     "Heatwave above 38 degrees forecast for the valley this weekend."),
];

fn pair(text: &str, summary: &str) -> (JsonMap, JsonMap) {
    let inputs = json!({"text": text}).as_object().cloned().unwrap_or_default();
    let outputs = json!({"summary": summary}).as_object().cloned().unwrap_or_default();
    (inputs, outputs)
}

fn words(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Share of the label's words found in the output.
fn coverage(run: &Run, example: &Example) -> Result<EvaluationResult> {
    let output = run.output_text().ok_or_else(|| anyhow!("run has no output"))?;
    let label = example.outputs.get("summary").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("example has no summary"))?;
    let expected = words(label);
    let found = expected.intersection(&words(output)).count();
    Ok(EvaluationResult::new("coverage").with_score(found as f64 / expected.len().max(1) as f64))
}

/// Penalizes outputs longer than twice the label.
fn brevity(run: &Run, example: &Example) -> Result<EvaluationResult> {
    let output = run.output_text().ok_or_else(|| anyhow!("run has no output"))?;
    let label = example.outputs.get("summary").and_then(|v| v.as_str()).unwrap_or_default();
    let ratio = output.len() as f64 / label.len().max(1) as f64;
    let result = EvaluationResult::new("brevity").with_score(if ratio <= 2.0 { 1.0 } else { 2.0 / ratio });
    Ok(if ratio > 2.0 { result.with_comment(format!("{:.1}x longer than the reference", ratio)) } else { result })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let store = Arc::new(InMemoryStore::new()
        .with_dataset("summaries-train", ARTICLES[..3].iter().map(|(t, s)| pair(t, s)))
        .with_dataset("summaries-eval", ARTICLES[1..].iter().map(|(t, s)| pair(t, s))));

    let model = Arc::new(OpenAIChat::new(Default::default()));
    let harness = EvaluationHarness::new(Default::default()).with_trace_store(store.clone());
    let optimizer = PromptOptimizer::new(model.clone(), Default::default());
    let trainer = Trainer::new(TrainConfig { steps: 3, print_diffs: true, ..Default::default() }, store.clone(), harness, optimizer);

    let seed = PromptTemplate::new("Summarize this text: {text}")?;
    let evaluators: Vec<Box<dyn Evaluator>> = vec![Box::new(coverage), Box::new(brevity)];
    let constructor = |prompt: &PromptTemplate| PromptChain::new(prompt.clone(), model.clone());
    let history = trainer.train(constructor, &seed, "summaries-train", "summaries-eval", &evaluators).await?;

    println!("Best step {} with score {:?}", history.best_step, history.best_score);
    for candidate in history.candidates.iter() {
        println!("[{:?}] step {}: {}", candidate.score, candidate.step, candidate.prompt);
    }

    // In-app loop: a user approves a response of the best prompt.
    let best = history.best().ok_or_else(|| anyhow!("empty history"))?;
    let (text, _) = ARTICLES[0];
    let example = Example::new("live", pair(text, "").0, JsonMap::new());
    let mut run = Run::for_example("summaries-live", &example);
    let chain = PromptChain::new(best.prompt.clone(), model.clone());
    run.succeed(chain.invoke(&example.inputs).await?);

    let collector = FeedbackCollector::new(store.clone(), store.clone(), "approved-summaries");
    collector
        .record(&run.id, "user_score", Thumbs::Up, Some("Great length"), Some(text), run.output_text())
        .await?;
    let few_shots = collector.few_shot_examples(DEFAULT_FEW_SHOTS, &mut thread_rng()).await?;
    println!("Few-shot section for the next prompt:{}", few_shots);
    Ok(())
}
