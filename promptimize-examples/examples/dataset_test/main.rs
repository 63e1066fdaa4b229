//! Run a prompt chain over a dataset as a test: every example must produce an answer containing the expected
//! keyword. Each run gets a Pass/Fail verdict as feedback, which can later drive `optimize_over_project`.
//!
//! Needs `OPENAI_API_KEY`.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use promptimize::chain::{Chain, PromptChain};
use promptimize::optimizer::PromptOptimizer;
use promptimize::prompt::PromptTemplate;
use promptimize::schemas::Example;
use promptimize::store::InMemoryStore;
use promptimize::testing::DatasetTest;
use promptimize::utils::llm::openai::OpenAIChat;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let questions = [("What is the capital of France?", "Paris"), ("Which planet is known as the red planet?", "Mars")];
    let store = Arc::new(InMemoryStore::new().with_dataset(
        "trivia",
        questions.iter().map(|(q, a)| {
            (json!({"question": q}).as_object().cloned().unwrap_or_default(),
             json!({"answer": a}).as_object().cloned().unwrap_or_default())
        }),
    ));

    let model = Arc::new(OpenAIChat::new(Default::default()));
    let prompt = PromptTemplate::new("Answer in one word: {question}")?;
    let chain = PromptChain::new(prompt.clone(), model.clone());

    let test = DatasetTest::new("test_trivia", "trivia").with_description("The answer names the expected entity");
    let report = test
        .run(store.as_ref(), store.as_ref(), |example: Example| {
            let chain = &chain;
            async move {
                let answer = chain.invoke(&example.inputs).await?;
                let expected = example.outputs.get("answer").and_then(|v| v.as_str()).unwrap_or_default();
                if !answer.to_lowercase().contains(&expected.to_lowercase()) {
                    bail!("expected {} in {:?}", expected, answer);
                }
                Ok(answer)
            }
        })
        .await?;
    println!("{}: {} passed, {} failed", report.project_name, report.passed(), report.failed());

    if report.failed() > 0 {
        let optimizer = PromptOptimizer::new(model, Default::default());
        let output = optimizer.optimize_over_project(store.as_ref(), store.as_ref(), &report.project_name, &prompt).await?;
        println!("Suggested prompt:\n{}\n\nPlan:\n{}", output.improved_prompt, output.plan);
    }
    report.assert_all_passed()
}
