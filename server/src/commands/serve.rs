//! Run the HTTP server.

use colored::Colorize;

use answerkit_engine::config::EngineConfig;

use crate::context::AppContext;
use crate::exit_codes::EXIT_SUCCESS;
use crate::http;

pub struct ServeArgs {
    pub addr: String,
}

pub async fn execute(config: EngineConfig, args: ServeArgs) -> anyhow::Result<i32> {
    let ctx = AppContext::init(config).await?;
    println!(
        "{} serving on {} (model {}, {} indexed chunks)",
        "ok:".green(),
        args.addr,
        ctx.config.chat_model,
        ctx.index.count().await?
    );
    http::serve(&args.addr, ctx.router.clone()).await?;
    Ok(EXIT_SUCCESS)
}
