use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use folio_core_sdk::prelude::*;

/**
 * \brief CLI 程序入口：启动服务、管理 Provider、命令行聊天。
 */
#[derive(Parser, Debug)]
#[command(name = "folio", version, about = "Folio AI chat backend")]
struct Cli {
    /** \brief SQLite 数据库路径 */
    #[arg(long, global = true, env = "FOLIO_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 服务。
     */
    Serve {
        #[arg(long, env = "FOLIO_ADDR")]
        addr: Option<String>,
    },

    /**
     * \brief 列出当前会被加载的 Provider。
     */
    Providers,

    /**
     * \brief 加密 API Key 并写入 Provider 配置。
     * \param provider 厂商标识：glm、deepseek、qwen、kimi、openai
     */
    AddProvider {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long, default_value_t = false)]
        inactive: bool,
    },

    /**
     * \brief 停用已保存的 Provider。
     */
    DisableProvider {
        #[arg(long)]
        provider: String,
    },

    /**
     * \brief 重新启用已保存的 Provider。
     */
    EnableProvider {
        #[arg(long)]
        provider: String,
    },

    /**
     * \brief 用当前 ENCRYPTION_KEY 加密一个值并输出密文。
     */
    Encrypt { value: String },

    /**
     * \brief 发送一条消息并打印回复。
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, default_value = "cli")]
        session: String,
        #[arg(long)]
        character: Option<i64>,
        #[arg(long)]
        conversation: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let env: Arc<dyn EnvSource> = Arc::new(ProcessEnv);
    let mut settings = Settings::from_source(env.as_ref());
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    telemetry::init(&settings.log_filter, settings.log_file.as_deref())
        .context("init logging failed")?;

    match cli.command {
        Commands::Encrypt { value } => {
            let sealed = Cipher::from_settings(&settings)
                .encrypt(&value)
                .context("encrypt failed")?;
            println!("{}", sealed);
        }
        Commands::AddProvider {
            provider,
            api_key,
            endpoint,
            model,
            display_name,
            inactive,
        } => {
            let kind = ProviderKind::from_tag(&provider)
                .ok_or_else(|| anyhow!("unknown provider type: {}", provider))?;
            let service = AiService::new(settings, env);
            service.bootstrap().await.context("open store failed")?;
            let id = service
                .store_provider(ProviderInput {
                    kind,
                    api_key,
                    endpoint,
                    model,
                    display_name,
                    max_tokens: None,
                    temperature: None,
                    active: !inactive,
                })
                .await
                .context("save provider failed")?;
            println!("Saved provider id={} ({})", id, kind);
        }
        Commands::DisableProvider { provider } => {
            toggle_provider(settings, env, &provider, false).await?;
        }
        Commands::EnableProvider { provider } => {
            toggle_provider(settings, env, &provider, true).await?;
        }
        Commands::Providers => {
            let service = AiService::new(settings, env);
            let names = service.bootstrap().await.context("load providers failed")?;
            if names.is_empty() {
                println!("No provider configured. Run: folio add-provider --provider deepseek --api-key ...");
            }
            let default = service.registry().default_name();
            for entry in service.model_catalog().await.context("load models failed")?.iter() {
                let marker = if default.as_deref() == Some(entry.name.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{} {:<10} {:<24} {}", marker, entry.name, entry.model, entry.display_name);
            }
        }
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                settings.addr = addr;
            }
            let addr = settings.addr.clone();
            let service = Arc::new(AiService::new(settings, env));
            service.bootstrap().await.context("bootstrap failed")?;

            let shutdown = CancellationToken::new();
            spawn_ctrl_c(shutdown.clone());
            server::run(&addr, service, shutdown).await?;
        }
        Commands::Chat {
            prompt,
            provider,
            session,
            character,
            conversation,
        } => {
            let service = AiService::new(settings, env);
            service.bootstrap().await.context("bootstrap failed")?;

            let cancel = CancellationToken::new();
            spawn_ctrl_c(cancel.clone());
            let output = service
                .chat(
                    &cancel,
                    ChatInput {
                        session_id: session,
                        message: prompt,
                        conversation_id: conversation,
                        character_id: character,
                        provider,
                        user_ip: String::new(),
                    },
                )
                .await
                .context("chat failed")?;
            for line in output.reply.split('$') {
                println!("{}", line);
            }
            tracing::info!(
                conversation_id = output.conversation_id,
                provider = %output.provider,
                model = %output.model,
                total_tokens = output.usage.total_tokens,
                "chat finished"
            );
        }
    }

    Ok(())
}

async fn toggle_provider(
    settings: Settings,
    env: Arc<dyn EnvSource>,
    provider: &str,
    active: bool,
) -> Result<()> {
    let service = AiService::new(settings, env);
    service.bootstrap().await.context("open store failed")?;
    service
        .set_provider_active(provider, active)
        .await
        .with_context(|| format!("update provider {} failed", provider))?;
    let names = service.reload().await.context("reload providers failed")?;
    println!(
        "{} provider {}; loaded: {}",
        if active { "Enabled" } else { "Disabled" },
        provider,
        names.join(", ")
    );
    Ok(())
}

fn spawn_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c, shutting down");
            token.cancel();
        }
    });
}
