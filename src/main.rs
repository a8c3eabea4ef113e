//! Ark - Rust 流程驱动对话智能体
//!
//! 入口：加载配置与流程，创建（或恢复）会话，运行命令行对话循环。
//!
//! 用法：`ark [--config <path>] [--flow <path>] [--resume <session_id>] [--flow-schema]`
//!
//! 对话中可用命令：`/state`、`/sessions`、`/events`、`/quit`；Ctrl-C 取消进行中的一轮。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use ark::agent::{llm_from_config, store_from_config, transport_from_config};
use ark::config::load_config;
use ark::core::RecoveryEngine;
use ark::flow::{Flow, FlowDefinition};
use ark::{observability, SessionManager, TurnInput};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    flow: Option<PathBuf>,
    resume: Option<String>,
    flow_schema: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config = Some(it.next().context("--config needs a path")?.into()),
            "--flow" => args.flow = Some(it.next().context("--flow needs a path")?.into()),
            "--resume" => args.resume = Some(it.next().context("--resume needs a session id")?),
            "--flow-schema" => args.flow_schema = true,
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    if args.flow_schema {
        let schema = schemars::schema_for!(FlowDefinition);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    observability::init();

    let config = load_config(args.config).context("Failed to load config")?;
    let flow_path = args.flow.unwrap_or_else(|| config.app.flow_path.clone());
    let flow = Arc::new(
        Flow::from_path(&flow_path)
            .with_context(|| format!("Failed to load flow {}", flow_path.display()))?,
    );

    let llm = llm_from_config(&config.llm)?;
    let (transport, calendar) = transport_from_config(&config.tools)?;
    let store = store_from_config(&config.storage)?;

    let manager = Arc::new(
        SessionManager::new(llm, transport)
            .with_store(store)
            .with_settings(config.agent.clone())
            .with_retry(config.tools.retry.clone()),
    );
    manager.register_flow(Arc::clone(&flow)).await;

    let session_id = match args.resume {
        Some(id) => manager
            .resume(&id)
            .await
            .with_context(|| format!("Failed to resume session {}", id))?,
        None => manager.create(flow.id()).await?,
    };
    println!("{} | flow '{}' | session {}", config.app.name, flow.id(), session_id);

    // Ctrl-C：取消当前轮
    {
        let manager = Arc::clone(&manager);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if let Ok(true) = manager.cancel(&session_id).await {
                    eprintln!("(cancelled)");
                }
            }
        });
    }

    let recovery = RecoveryEngine::new();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut finished = false;
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/state" => {
                let snapshot = manager.snapshot(&session_id).await?;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                continue;
            }
            "/sessions" => {
                for id in manager.list_stored()? {
                    println!("{}", id);
                }
                continue;
            }
            "/events" => {
                match &calendar {
                    Some(cal) => println!("{}", serde_json::to_string_pretty(&cal.events())?),
                    None => println!("(remote calendar)"),
                }
                continue;
            }
            _ => {}
        }

        match manager.step(&session_id, TurnInput::new(line)).await {
            Ok(outcome) => {
                println!("{}", outcome.reply);
                if outcome.is_finished() {
                    finished = true;
                    break;
                }
            }
            Err(e) if e.is_fatal_to_session() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "turn failed");
                let action = recovery.handle(&e);
                println!("{}", action.message().unwrap_or("Something went wrong."));
            }
        }
    }

    // 未完成的会话保留在存储中，可用 --resume 继续
    if finished {
        manager.terminate(&session_id).await?;
    } else {
        println!("Session saved: {}", session_id);
    }
    Ok(())
}
