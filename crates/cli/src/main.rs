mod config;
mod console;
mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use mcp::ServerId;
use policy::{AuthorizationGate, AuthorizationRequest};
use runtime::{
    BackendError, ConversationMode, OpenAiBackend, Reply, ServerManager, SessionRegistry,
};
use storage::{ConfigStore, LogMessage, Role, SessionId, SqliteStore};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use console::ConsolePresenter;
use error::{Error, Result};

const CONFIG_FILE: &str = "parley.toml";
const DATABASE_FILE: &str = "parley.db";

type Input = Lines<BufReader<Stdin>>;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Chat with a local model that can call MCP tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the config file (default: ./parley.toml, then the data directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat {
        /// Continue an earlier session
        #[arg(short, long)]
        resume: Option<String>,
    },
    /// List configured tool servers
    Servers {
        /// Launch each enabled server and list its tools
        #[arg(short, long)]
        probe: bool,
    },
    /// Show or revoke pre-authorized tools
    Approvals {
        /// Server ID
        #[arg(short, long)]
        server: String,
        /// Remove a tool from the server's approvals
        #[arg(long)]
        revoke: Option<String>,
    },
    /// Show the message log of a session
    History {
        /// Session ID
        #[arg(short, long)]
        session: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,parley=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Some(Commands::Chat { resume }) => cmd_chat(config_path, resume.as_deref()).await,
        None => cmd_chat(config_path, None).await,
        Some(Commands::Servers { probe }) => cmd_servers(config_path, probe).await,
        Some(Commands::Approvals { server, revoke }) => cmd_approvals(&server, revoke.as_deref()),
        Some(Commands::History { session }) => cmd_history(&session),
    }
}

async fn cmd_chat(config_path: Option<&Path>, resume: Option<&str>) -> Result<()> {
    println!("parley v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(config_path)?;

    let data_dir = dirs_data_dir().unwrap_or_else(|| ".parley".into());
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join(DATABASE_FILE);
    let store = Arc::new(SqliteStore::open(&db_path)?);
    config.seed(store.as_ref())?;

    let (gate, mut authorizations) = AuthorizationGate::new(store.clone());
    let registry = SessionRegistry::builder(OpenAiBackend::new(), store, Arc::new(gate))
        .presenter(Arc::new(ConsolePresenter))
        .build();

    let settings = config.session_settings();
    let session = match resume {
        Some(id) => registry.resume(parse_session_id(id)?, settings)?,
        None => registry.create(settings),
    };
    let id = session.id();

    println!("Session ID: {id}");
    println!("Model: {} at {}", config.model.model, config.model.endpoint);
    println!("Type /help for commands, 'quit' or Ctrl+D to exit.\n");

    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt("> ").await?;
        let Some(line) = input.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        if let Some(command) = line.strip_prefix('/') {
            if !slash_command(&registry, id, command).await {
                break;
            }
            continue;
        }

        match converse(&registry, id, line, &mut authorizations, &mut input).await {
            Ok(reply) if reply.aborted => println!("\n[aborted]\n"),
            Ok(_) => println!("\n"),
            Err(Error::Runtime(runtime::Error::Backend(e))) => {
                eprintln!("\n{}\n", backend_message(&e));
            }
            Err(e) => eprintln!("\nError: {e}\n"),
        }
    }

    registry.shutdown().await;
    println!("\nSession ended.");
    Ok(())
}

/// Send one message, answering authorization prompts and Ctrl+C until the reply is complete.
async fn converse(
    registry: &SessionRegistry<OpenAiBackend>,
    id: SessionId,
    text: &str,
    authorizations: &mut mpsc::UnboundedReceiver<AuthorizationRequest>,
    input: &mut Input,
) -> Result<Reply> {
    let send = registry.send_message(id, text);
    tokio::pin!(send);

    loop {
        tokio::select! {
            biased;
            reply = &mut send => return Ok(reply?),
            Some(request) = authorizations.recv() => {
                let Some((authorized, permanent)) = decide(ask(&request, input), interrupted()).await?
                else {
                    // Cancelling the generation abandons the pending request.
                    eprintln!();
                    registry.abort(id);
                    continue;
                };
                match registry.submit_decision(request.correlation_id, authorized, permanent) {
                    Ok(()) => {}
                    // The call was abandoned while the prompt was open.
                    Err(runtime::Error::Policy(policy::Error::UnknownCorrelation(id))) => {
                        debug!(correlation = %id, "decision arrived after cancellation");
                    }
                    Err(e) => warn!(error = %e, "failed to record decision"),
                }
            }
            () = interrupted() => {
                registry.abort(id);
            }
        }
    }
}

/// Wait for an answer to an authorization prompt, unless interrupted first.
///
/// Returns `(authorized, permanent)`, or `None` on interruption.
async fn decide(
    answer: impl Future<Output = Result<String>>,
    interrupt: impl Future<Output = ()>,
) -> Result<Option<(bool, bool)>> {
    tokio::select! {
        biased;
        () = interrupt => Ok(None),
        answer = answer => Ok(Some(console::parse_answer(&answer?))),
    }
}

/// Resolves on Ctrl+C. Never resolves if the signal cannot be watched.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

async fn ask(request: &AuthorizationRequest, input: &mut Input) -> Result<String> {
    prompt(&console::authorization_prompt(request)).await?;
    // End of input denies.
    Ok(input.next_line().await?.unwrap_or_default())
}

/// Returns false when the session should end.
async fn slash_command(
    registry: &SessionRegistry<OpenAiBackend>,
    id: SessionId,
    command: &str,
) -> bool {
    let mut parts = command.split_whitespace();
    let Some(session) = registry.get(id) else {
        return false;
    };
    match (parts.next(), parts.next()) {
        (Some("quit" | "exit"), _) => return false,
        (Some("mode"), Some("single")) => {
            session.set_mode(ConversationMode::SingleTurn);
            println!("Each message now starts a fresh conversation.");
        }
        (Some("mode"), Some("multi")) => {
            session.set_mode(ConversationMode::MultiTurn);
            println!("Earlier messages are now sent as context.");
        }
        (Some("servers"), _) => print_statuses(registry.servers()),
        (Some("reconnect"), Some(server)) => {
            match registry.reconnect(&ServerId::new(server)).await {
                Ok(tools) => println!("{server}: connected, {} tools", tools.len()),
                Err(e) => eprintln!("{server}: {e}"),
            }
        }
        (Some("history"), _) => {
            for message in session.messages() {
                print_message(&message);
            }
        }
        _ => {
            println!("Commands:");
            println!("  /mode single|multi   send earlier messages as context or not");
            println!("  /servers             show tool servers and their tools");
            println!("  /reconnect <server>  restart a tool server");
            println!("  /history             show this session's messages");
            println!("  /quit                end the session");
        }
    }
    true
}

fn backend_message(error: &BackendError) -> String {
    match error {
        BackendError::Auth(_) => format!(
            "{} Check model.api_key in {CONFIG_FILE}.",
            error.user_message()
        ),
        _ => error.user_message(),
    }
}

async fn cmd_servers(config_path: Option<&Path>, probe: bool) -> Result<()> {
    let config = load_config(config_path)?;

    if config.servers.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }

    println!("{:<16}  {:<8}  {:<24}  AUTO-APPROVE", "ID", "ENABLED", "COMMAND");
    println!("{}", "-".repeat(80));
    for server in &config.servers {
        println!(
            "{:<16}  {:<8}  {:<24}  {}",
            server.id,
            if server.enabled { "yes" } else { "no" },
            server.command,
            server.auto_approve.join(", ")
        );
    }

    if probe {
        let manager = ServerManager::new();
        let specs: Vec<_> = config.servers.iter().filter(|s| s.enabled).map(|s| s.spec()).collect();
        manager.ensure_active(&specs).await;
        println!();
        print_statuses(&manager);
        manager.shutdown().await;
    }

    Ok(())
}

fn print_statuses(manager: &ServerManager) {
    let statuses = manager.statuses();
    if statuses.is_empty() {
        println!("No active servers.");
    }
    for status in statuses {
        println!("{} ({}): {}", status.id, status.name, status.state);
        for tool in status.tools {
            println!("  - {tool}");
        }
    }
}

fn cmd_approvals(server: &str, revoke: Option<&str>) -> Result<()> {
    let store = open_store()?;
    let mut approved = store.auto_approval(server)?;

    if let Some(tool) = revoke {
        if approved.remove(tool) {
            store.set_auto_approval(server, &approved)?;
            println!("Revoked {server}/{tool}.");
        } else {
            println!("{server}/{tool} was not pre-authorized.");
        }
        return Ok(());
    }

    if approved.is_empty() {
        println!("No pre-authorized tools for {server}.");
    }
    for tool in approved {
        println!("{tool}");
    }
    Ok(())
}

fn cmd_history(session: &str) -> Result<()> {
    let store = open_store()?;
    let id = parse_session_id(session)?;
    let messages = store.load_messages(id)?;

    if messages.is_empty() {
        println!("No messages found for session {id}");
        return Ok(());
    }

    println!("Session: {id}\n");
    for message in &messages {
        print_message(message);
    }
    Ok(())
}

fn print_message(message: &LogMessage) {
    let time = Local
        .from_utc_datetime(&message.timestamp.naive_utc())
        .format("%H:%M:%S");

    let content = truncate(&message.content, 200);
    match message.role {
        Role::Tool => {
            let name = message.tool_name.as_deref().unwrap_or("?");
            println!("[{time}] TOOL RESULT ({name}): {content}");
        }
        Role::Assistant if !message.tool_calls.is_empty() => {
            if !content.is_empty() {
                println!("[{time}] ASSISTANT: {content}");
            }
            for call in &message.tool_calls {
                println!("[{time}] TOOL CALL: {} {}", call.name, truncate(&call.arguments, 200));
            }
        }
        role => println!("[{time}] {}: {content}", role.as_str().to_uppercase()),
    }
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

fn parse_session_id(id: &str) -> Result<SessionId> {
    id.parse().map_err(|_| Error::InvalidSessionId(id.to_string()))
}

async fn prompt(text: &str) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return Ok(Config::load(path)?);
    }

    let mut searched = vec![PathBuf::from(CONFIG_FILE)];
    if let Some(dir) = dirs_data_dir() {
        searched.push(dir.join(CONFIG_FILE));
    }
    match searched.iter().find(|p| p.exists()) {
        Some(path) => Ok(Config::load(path)?),
        None => Err(Error::ConfigNotFound { searched }),
    }
}

fn open_store() -> Result<SqliteStore> {
    let data_dir = dirs_data_dir().unwrap_or_else(|| ".parley".into());
    let db_path = data_dir.join(DATABASE_FILE);

    if !db_path.exists() {
        return Err(Error::DatabaseNotFound { path: db_path });
    }

    Ok(SqliteStore::open(&db_path)?)
}

fn dirs_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share/parley"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .map(|p| p.join("parley"))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|h| PathBuf::from(h).join("parley"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_on_char_boundary() {
        assert_eq!(truncate("short", 200), "short");
        assert_eq!(truncate("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn session_ids() {
        let id = SessionId::new();
        assert_eq!(parse_session_id(&id.to_string()).unwrap(), id);
        assert!(matches!(
            parse_session_id("nope"),
            Err(Error::InvalidSessionId(s)) if s == "nope"
        ));
    }

    #[tokio::test]
    async fn answered_prompt_is_parsed() {
        let decision = decide(async { Ok("a\n".to_string()) }, std::future::pending()).await;
        assert_eq!(decision.unwrap(), Some((true, true)));
    }

    #[tokio::test]
    async fn interrupt_wins_over_an_open_prompt() {
        let decision = decide(std::future::pending(), async {}).await;
        assert_eq!(decision.unwrap(), None);
    }

    #[tokio::test]
    async fn unreadable_input_is_an_error() {
        let failed = async { Err(Error::Io(std::io::ErrorKind::BrokenPipe.into())) };
        assert!(decide(failed, std::future::pending()).await.is_err());
    }

    #[test]
    fn auth_failures_point_at_config() {
        let message = backend_message(&BackendError::Auth("bad key".into()));
        assert!(message.contains(CONFIG_FILE));
    }
}
