//! Agent Loop - bounded autonomous loop runner for LLM coding agents.
//!
//! The binary surfaces the persisted state (sessions, circuits, histories)
//! and configuration; embedders drive the loop itself through the library's
//! `Runner` with a sandbox provider of their choosing.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use agent_loop::config::Config;
use agent_loop::store::{HistoryStore, SessionStore};

const CYAN: &str = "\x1b[38;5;51m";
const VIOLET: &str = "\x1b[38;5;147m";
const RED: &str = "\x1b[38;5;196m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

#[derive(Parser)]
#[command(name = "agent-loop")]
#[command(about = "Run LLM coding agents in a bounded autonomous loop")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show session and circuit state for a (project, agent) key
    Status {
        /// Project name
        project: String,

        /// Agent name
        agent: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// List sessions for a project
    Sessions {
        /// Project name
        project: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Reset a tripped circuit (and optionally the session) for a key
    Reset {
        /// Project name
        project: String,

        /// Agent name
        agent: String,

        /// Also delete the persisted session
        #[arg(short, long)]
        session: bool,
    },

    /// Manage configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,

        /// Initialize default configuration file
        #[arg(short, long)]
        init: bool,
    },

    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };
    let _ = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Status { project, agent, json } => {
            show_status(&config, &project, &agent, json).await?;
        }
        Commands::Sessions { project, json } => {
            list_sessions(&config, &project, json).await?;
        }
        Commands::Reset { project, agent, session } => {
            reset_state(&config, &project, &agent, session).await?;
        }
        Commands::Config { show, init } => {
            manage_config(&config, show, init)?;
        }
        Commands::Version => {
            println!(
                "{}agent-loop{} {}v{}{}",
                BOLD,
                RESET,
                CYAN,
                env!("CARGO_PKG_VERSION"),
                RESET
            );
        }
    }

    Ok(())
}

async fn show_status(config: &Config, project: &str, agent: &str, json: bool) -> Result<()> {
    let store = SessionStore::new(&config.state_dir);
    let history = HistoryStore::new(&config.state_dir);

    let session = store.load_session(project, agent).await?;
    let circuit = store.load_circuit_state(project, agent).await?;
    let session_log = history.session_history(project, agent).await?;

    if json {
        let output = serde_json::json!({
            "session": session,
            "circuit": circuit,
            "history": session_log,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}── {}/{} ──{}", DIM, project, agent, RESET);

    match session {
        Some(s) => {
            println!("  {}session{}   {}", BOLD, RESET, s.id);
            println!("  status    {}", s.status);
            println!("  loops     {}", s.loops_completed);
            println!(
                "  totals    {} tasks, {} files",
                s.total_tasks_completed, s.total_files_modified
            );
            println!("  updated   {}", s.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
            if let Some(err) = &s.last_error {
                println!("  {}last err{}  {}", RED, RESET, err);
            }
        }
        None => println!("  {}no session{}", DIM, RESET),
    }

    match circuit {
        Some(c) if c.tripped => {
            println!(
                "  {}circuit{}   {}tripped{}: {}",
                BOLD, RESET, RED, RESET, c.trip_reason
            );
        }
        Some(_) => println!("  {}circuit{}   closed", BOLD, RESET),
        None => println!("  {}circuit{}   {}closed{}", BOLD, RESET, DIM, RESET),
    }

    if !session_log.is_empty() {
        println!();
        println!("  {}recent events{}", VIOLET, RESET);
        for entry in session_log.iter().rev().take(10) {
            println!(
                "    {} {:<16} loop {:<3} {}",
                entry.timestamp.format("%H:%M:%S"),
                entry.event,
                entry.loop_count,
                entry.error.as_deref().unwrap_or("")
            );
        }
    }

    Ok(())
}

async fn list_sessions(config: &Config, project: &str, json: bool) -> Result<()> {
    let store = SessionStore::new(&config.state_dir);
    let sessions = store.list_sessions(project).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("{}no sessions for {}{}", DIM, project, RESET);
        return Ok(());
    }

    println!(
        "{}{:<12} {:<10} {:>6} {:>6} {:>6}  {}{}",
        BOLD, "agent", "status", "loops", "tasks", "files", "updated", RESET
    );
    for s in &sessions {
        println!(
            "{:<12} {:<10} {:>6} {:>6} {:>6}  {}",
            s.agent,
            s.status.to_string(),
            s.loops_completed,
            s.total_tasks_completed,
            s.total_files_modified,
            s.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

async fn reset_state(config: &Config, project: &str, agent: &str, session: bool) -> Result<()> {
    let store = SessionStore::new(&config.state_dir);

    match store.load_circuit_state(project, agent).await? {
        Some(state) if state.tripped => {
            store.delete_circuit_state(project, agent).await?;
            println!(
                "{}✓{} circuit reset for {}/{} (was: {})",
                CYAN, RESET, project, agent, state.trip_reason
            );
        }
        Some(_) => {
            store.delete_circuit_state(project, agent).await?;
            println!("{}✓{} circuit state cleared for {}/{}", CYAN, RESET, project, agent);
        }
        None => println!("{}no circuit state for {}/{}{}", DIM, project, agent, RESET),
    }

    if session {
        store.delete_session(project, agent).await?;
        println!("{}✓{} session deleted for {}/{}", CYAN, RESET, project, agent);
    }

    Ok(())
}

fn manage_config(config: &Config, show: bool, init: bool) -> Result<()> {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_path = format!("{}/.config/agent-loop/config.json", home);

    if init {
        let config_dir = format!("{}/.config/agent-loop", home);
        std::fs::create_dir_all(&config_dir)?;
        config.save(&config_path)?;
        println!("{}✓{} configuration created at {}", CYAN, RESET, config_path);
        return Ok(());
    }

    if show || !init {
        println!("{}── configuration ──{}", DIM, RESET);
        println!("  state_dir            {:?}", config.state_dir);
        println!("  max_loops            {}", config.max_loops);
        println!("  loop_delay_seconds   {}", config.loop_delay_seconds);
        println!("  loop_timeout_seconds {}", config.loop_timeout_seconds);
        println!("  rate_limit_per_hour  {}", config.rate_limit_per_hour);
        println!("  session_ttl_hours    {}", config.session_ttl_hours);
        println!("  strict_completion    {}", config.strict_completion);
        println!("  log_level            {}", config.log_level);
    }

    Ok(())
}
