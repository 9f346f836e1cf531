//! One-shot question answering from the command line.

use colored::Colorize;

use answerkit_engine::config::EngineConfig;
use answerkit_engine::types::AnswerSource;

use crate::context::AppContext;
use crate::exit_codes::EXIT_SUCCESS;

pub struct AskArgs {
    pub query: String,
    pub json: bool,
}

pub async fn execute(config: EngineConfig, args: AskArgs) -> anyhow::Result<i32> {
    let ctx = AppContext::init(config).await?;
    let response = ctx.router.get_response(&args.query, None).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("{}", response.response);
    match response.source {
        AnswerSource::Faq => println!(
            "{} {} (similarity {:.2})",
            "source:".dimmed(),
            "faq".green(),
            response.similarity_score
        ),
        AnswerSource::Rag => println!("{} {}", "source:".dimmed(), "rag".yellow()),
    }
    Ok(EXIT_SUCCESS)
}
