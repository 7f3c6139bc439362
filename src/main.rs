mod api;
mod bus;
mod channels;
mod clock;
mod commands;
mod config;
mod dates;
mod dispatcher;
mod matcher;
mod scheduler;
mod session;
mod store;
mod tags;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;

use bus::{MessageBus, OutboundMessage};
use channels::Channel;
use channels::cli::{CONSOLE_GROUP, CONSOLE_USER, CliChannel};
use channels::telegram::TelegramChannel;
use clock::{Clock, SystemClock};
use commands::CommandHandler;
use config::Config;
use dispatcher::NotificationDispatcher;
use scheduler::ReminderScheduler;
use store::Database;
use tags::TagDirectory;

#[derive(Parser)]
#[command(
    name = "herald",
    version,
    about = "Birthday reminders for group chats"
)]
struct Cli {
    #[arg(short, long, default_value = "~/.birthday-herald/config.toml")]
    config: String,
    /// Telegram bot token (overrides [telegram] bot_token)
    #[arg(long, env = "BOT_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    Init,
    /// Show what is stored
    Status,
    /// Run one birthday check now and exit
    Tick,
    /// Write a timestamped copy of the database
    Backup,
    /// Talk to the running bot via its API server
    Chat {
        /// Message to send (omit for interactive mode)
        message: Option<String>,
        /// API server URL
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        url: String,
        /// Auth token (or HERALD_API_TOKEN env)
        #[arg(long, env = "HERALD_API_TOKEN")]
        token: Option<String>,
        /// Chat to speak in; negative ids are groups
        #[arg(long, default_value_t = CONSOLE_GROUP, allow_hyphen_values = true)]
        chat_id: i64,
        #[arg(long, default_value_t = CONSOLE_USER)]
        user_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Init => {
            let path = config::init_config_dir().await?;
            tracing::info!("Config written to {}", path.display());
        }
        Commands::Run => run(&cli.config, cli.token).await?,
        Commands::Status => {
            let cfg = config::load(&cli.config)?;
            let db = Database::open(&cfg.storage.db_path())?;
            let stats = db.stats()?;
            if let Some(path) = db.path() {
                println!("Database: {}", path.display());
            }
            println!(
                "Birthdays: {}\nGroups: {}\nMembers: {}",
                stats.birthdays, stats.groups, stats.subjects
            );
        }
        Commands::Tick => tick_once(&cli.config, cli.token).await?,
        Commands::Backup => {
            let cfg = config::load(&cli.config)?;
            let db = Database::open(&cfg.storage.db_path())?;
            let target = db.backup(SystemClock.now())?;
            println!("{}", target.display());
        }
        Commands::Chat {
            message,
            url,
            token,
            chat_id,
            user_id,
        } => chat(&url, token.as_deref(), chat_id, user_id, message.as_deref()).await?,
    }
    Ok(())
}

/// Telegram when a token is available, otherwise the local console.
fn create_channel(cfg: &Config, token: Option<String>, bus: &MessageBus) -> Arc<dyn Channel> {
    let telegram = cfg.telegram.clone().unwrap_or_default();
    match token.or_else(|| telegram.bot_token.clone()) {
        Some(token) => Arc::new(TelegramChannel::new(&telegram, &token, bus.inbound_sender())),
        None => {
            tracing::warn!("No bot token configured, using the console channel");
            Arc::new(CliChannel::new(bus.inbound_sender()))
        }
    }
}

fn create_scheduler(
    cfg: &Config,
    db: Arc<Database>,
    channel: Arc<dyn Channel>,
    clock: Arc<dyn Clock>,
) -> ReminderScheduler {
    let dispatcher = NotificationDispatcher::new(channel, cfg.reminders.send_delay());
    ReminderScheduler::new(db.clone(), db, dispatcher, clock, cfg.reminders.clone())
}

async fn run(config_path: &str, token: Option<String>) -> Result<()> {
    let cfg = config::load(config_path)?;
    let db = Arc::new(Database::open(&cfg.storage.db_path())?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = Arc::new(MessageBus::new(100));

    let channel = create_channel(&cfg, token, &bus);
    let scheduler = Arc::new(create_scheduler(&cfg, db.clone(), channel.clone(), clock.clone()));
    let handler = Arc::new(CommandHandler::new(
        db.clone(),
        TagDirectory::new(cfg.tags.clone()),
        clock,
    ));

    if cfg.api.enabled && cfg.api.api_key.is_none() {
        if is_localhost(&cfg.api.bind) {
            tracing::warn!("API authentication disabled (localhost-only)");
        } else {
            anyhow::bail!(
                "API authentication required for non-localhost binding '{}'. Set [api] api_key.",
                cfg.api.bind
            );
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    channel.start().await?;
    tracing::info!("{} started on {}", cfg.bot.name, channel.name());

    let mut tasks = vec![
        scheduler.clone().spawn(shutdown_rx.clone()),
        tokio::spawn(channels::dispatch_loop(
            bus.clone(),
            channel.clone(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(command_loop(bus.clone(), handler.clone(), shutdown_rx.clone())),
    ];

    if cfg.api.enabled {
        let state = api::AppState {
            handler,
            scheduler,
            db: db.clone(),
            name: cfg.bot.name.clone(),
            api_key: cfg.api.api_key.clone(),
        };
        let listener = tokio::net::TcpListener::bind(&cfg.api.bind).await?;
        tracing::info!("API listening on {}", cfg.api.bind);
        let mut api_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let served = axum::serve(listener, api::router(state))
                .with_graceful_shutdown(async move {
                    api_shutdown.changed().await.ok();
                })
                .await;
            if let Err(e) = served {
                tracing::error!("API server error: {e}");
            }
        }));
    }

    signal::ctrl_c().await.ok();
    tracing::info!("Shutting down");
    shutdown_tx.send(true).ok();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("Task ended abnormally: {e}");
        }
    }
    Ok(())
}

/// Feed inbound messages through the command handler and publish replies.
async fn command_loop(
    bus: Arc<MessageBus>,
    handler: Arc<CommandHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.changed() => break,
            msg = bus.recv_inbound() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let (chat_id, message_id) = (msg.chat_id, msg.message_id);
        let worker = handler.clone();
        let handled = tokio::task::spawn_blocking(move || worker.handle(&msg))
            .await
            .unwrap_or_else(|e| Err(anyhow::anyhow!("command task panicked: {e}")));
        match handled {
            Ok(replies) => {
                for reply in replies {
                    bus.send_outbound(reply);
                }
            }
            Err(e) => {
                tracing::error!("Handling message in {chat_id} failed: {e:#}");
                bus.send_outbound(
                    OutboundMessage::to(chat_id, "⚠️ Something went wrong, please try again later.")
                        .replying_to(message_id),
                );
            }
        }
    }
}

async fn tick_once(config_path: &str, token: Option<String>) -> Result<()> {
    let cfg = config::load(config_path)?;
    let db = Arc::new(Database::open(&cfg.storage.db_path())?);
    let bus = MessageBus::new(1);
    let channel = create_channel(&cfg, token, &bus);
    let scheduler = create_scheduler(&cfg, db, channel, Arc::new(SystemClock));

    match scheduler.tick().await? {
        Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        None => println!("A check is already running"),
    }
    Ok(())
}

async fn chat(
    url: &str,
    token: Option<&str>,
    chat_id: i64,
    user_id: i64,
    message: Option<&str>,
) -> Result<()> {
    let client = reqwest::Client::new();
    if let Some(msg) = message {
        for reply in send_message(&client, url, token, chat_id, user_id, msg).await? {
            println!("{reply}");
        }
        return Ok(());
    }
    // Interactive REPL
    let stdin = std::io::stdin();
    loop {
        eprint!("herald> ");
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }
        match send_message(&client, url, token, chat_id, user_id, line).await {
            Ok(replies) if replies.is_empty() => println!("\n(no reply)\n"),
            Ok(replies) => println!("\n{}\n", replies.join("\n\n")),
            Err(e) => eprintln!("Error: {e}"),
        }
    }
    Ok(())
}

async fn send_message(
    client: &reqwest::Client,
    url: &str,
    token: Option<&str>,
    chat_id: i64,
    user_id: i64,
    text: &str,
) -> Result<Vec<String>> {
    let mut req = client.post(format!("{url}/message")).json(&serde_json::json!({
        "text": text,
        "chat_id": chat_id,
        "user_id": user_id,
    }));
    if let Some(t) = token {
        req = req.header("Authorization", format!("Bearer {t}"));
    }
    let resp = req.send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("API error: {} {}", resp.status(), resp.text().await?);
    }
    let body: api::MessageResponse = resp.json().await?;
    Ok(body.replies)
}

fn is_localhost(bind: &str) -> bool {
    use std::net::IpAddr;

    let host = if let Some(inner) = bind.strip_prefix('[')
        && let Some(bracket_end) = inner.find(']')
    {
        &inner[..bracket_end]
    } else if let Some(colon) = bind.rfind(':') {
        &bind[..colon]
    } else {
        bind
    };

    if host == "localhost" {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
