//! Milestone Tutor CLI
//!
//! Serves the tutoring API and inspects persisted sessions.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tutor_orchestrator::{
    create_router, AppState, AttemptRecord, Config, HintRecord, HttpCompletionService,
    JsonFileStore, MilestoneStatus, Orchestrator, PersistenceStore, Phase, SessionState,
    SessionSummary,
};
use tutor_report::{
    json::JsonGenerator, AttemptInput, HintInput, MarkdownGenerator, MilestoneInput,
    MilestoneState, ReportGenerator, ReportInput, ReportPhase,
};

/// Milestone Tutor - guided coding lessons for young learners
///
/// Plans a themed lesson as a sequence of milestones, hands out hints within
/// a budget, grades submissions and tracks xp and badges.
#[derive(Parser, Debug)]
#[command(name = "tutor")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: tutor.json in current directory)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and telemetry stream
    Serve {
        /// Interface to bind (overrides server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show the progress of a stored session
    Progress {
        /// Session id
        #[arg(value_name = "ID")]
        session_id: String,
    },

    /// List stored sessions
    Sessions,

    /// Write Markdown and JSON reports for a stored session
    Report {
        /// Session id
        #[arg(value_name = "ID")]
        session_id: String,

        /// Output directory for reports
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        output_dir: String,
    },

    /// Validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!(config = ?args.config, "Config file");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Serve { host, port } => serve(config, host, port).await,
        Command::Progress { session_id } => {
            let state = load_session(&config, &session_id).await?;
            print_summary(&SessionSummary::from(&state));
            Ok(())
        }
        Command::Sessions => list_sessions(&config).await,
        Command::Report {
            session_id,
            output_dir,
        } => {
            let state = load_session(&config, &session_id).await?;
            generate_reports(&state, Path::new(&output_dir))
        }
        Command::CheckConfig => {
            print_config(&config);
            println!();
            println!("Configuration is valid");
            Ok(())
        }
    }
}

/// Loads configuration from the specified path or default location.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Config::load_from_file(path).map_err(|e| anyhow::anyhow!("{e}"))
        }
        None => Config::load().map_err(|e| anyhow::anyhow!("{e}")),
    }
}

// ============================================================================
// serve
// ============================================================================

async fn serve(mut config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    print_config(&config);

    let completion = HttpCompletionService::new(config.completion.clone()).map_err(|e| {
        anyhow::anyhow!(
            "Failed to create completion client: {e}\n\nSuggestion: Check completion.baseUrl and completion.timeoutSeconds"
        )
    })?;
    let store = JsonFileStore::new(&config.store.state_dir);
    let orchestrator = Orchestrator::new(config.clone(), Arc::new(completion), Arc::new(store));

    let health = orchestrator.health().await;
    println!();
    println!(
        "Health: {:?} (completion {:?}, store {:?})",
        health.status, health.services.completion, health.services.store
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind to {addr}: {e}\n\nSuggestion: Try a different port with --port"
        )
    })?;

    let router = create_router(AppState::new(Arc::new(orchestrator)));

    println!("HTTP API server running on http://{addr}");
    println!("Telemetry stream on ws://{addr}/ws");
    println!("Press Ctrl+C to stop");
    tracing::info!(%addr, "Server started");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {e}"))?;

    println!();
    println!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        return;
    }
    tracing::info!("Shutdown requested");
}

// ============================================================================
// Stored sessions
// ============================================================================

async fn load_session(config: &Config, session_id: &str) -> anyhow::Result<SessionState> {
    let store = JsonFileStore::new(&config.store.state_dir);
    store
        .load(session_id)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Session '{session_id}' not found in '{}'\n\nSuggestion: Run `tutor sessions` to list stored sessions",
                config.store.state_dir
            )
        })
}

async fn list_sessions(config: &Config) -> anyhow::Result<()> {
    let store = JsonFileStore::new(&config.store.state_dir);
    let ids = store.list().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    if ids.is_empty() {
        println!("No sessions stored in '{}'", config.store.state_dir);
        return Ok(());
    }

    println!("Sessions in '{}':", config.store.state_dir);
    for id in ids {
        match store.load(&id).await {
            Ok(Some(state)) => {
                let summary = SessionSummary::from(&state);
                println!(
                    "  {}  {:<20} {:<10} {:<16} {}/{} milestones, {} xp",
                    summary.session_id,
                    summary.learner_nickname,
                    summary.theme,
                    summary.phase,
                    state.milestones_completed(),
                    summary.total_milestones,
                    summary.xp_earned
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Skipping unreadable session");
                println!("  {id}  (unreadable)");
            }
        }
    }
    Ok(())
}

// ============================================================================
// Reports
// ============================================================================

/// Writes `tutor-report-<id>.md` and `tutor-report-<id>.json` to `output_dir`.
fn generate_reports(state: &SessionState, output_dir: &Path) -> anyhow::Result<()> {
    println!("Generating reports...");

    let input = create_report_input(state);
    let report = ReportGenerator::new(&input).generate()?;

    std::fs::create_dir_all(output_dir)?;

    let stem = format!("tutor-report-{}", state.session_id);

    let md_path: PathBuf = output_dir.join(format!("{stem}.md"));
    std::fs::write(&md_path, MarkdownGenerator::new(&report).generate())?;
    println!("  Markdown report: {}", md_path.display());

    let json_path = output_dir.join(format!("{stem}.json"));
    JsonGenerator::new(&report).write_to_file(&json_path, true)?;
    println!("  JSON report: {}", json_path.display());

    println!();
    println!(
        "{}: {} of {} milestones, {} xp, {} badges",
        report.learner_nickname,
        report.summary.milestones_completed,
        report.summary.total_milestones,
        report.summary.xp_earned,
        report.summary.badges_earned.len()
    );

    Ok(())
}

/// Creates a `ReportInput` from a stored session.
fn create_report_input(state: &SessionState) -> ReportInput {
    ReportInput {
        session_id: state.session_id.clone(),
        learner_nickname: state.learner_nickname.clone(),
        theme: state.theme.clone(),
        lesson_title: state.lesson_title.clone(),
        difficulty_level: state.difficulty_level,
        phase: convert_phase(state.phase),
        ended_early: state.ended_early,
        xp_earned: state.xp_earned,
        badges_earned: state.badges_earned.clone(),
        created_at: state.created_at,
        updated_at: state.updated_at,
        completed_at: state.completed_at,
        milestones: state
            .milestones
            .iter()
            .map(|m| MilestoneInput {
                id: m.id.clone(),
                goal: m.goal.clone(),
                status: convert_milestone_status(state.status_of(&m.id).unwrap_or_default()),
            })
            .collect(),
        attempts: state.attempts.iter().map(convert_attempt).collect(),
        hints: state.hints.iter().map(convert_hint).collect(),
    }
}

const fn convert_phase(phase: Phase) -> ReportPhase {
    match phase {
        Phase::Planning => ReportPhase::Planning,
        Phase::MilestoneActive => ReportPhase::MilestoneActive,
        Phase::AwaitingGrading => ReportPhase::AwaitingGrading,
        Phase::Completed => ReportPhase::Completed,
        Phase::Failed => ReportPhase::Failed,
    }
}

const fn convert_milestone_status(status: MilestoneStatus) -> MilestoneState {
    match status {
        MilestoneStatus::Pending => MilestoneState::Pending,
        MilestoneStatus::Active => MilestoneState::Active,
        MilestoneStatus::Completed => MilestoneState::Completed,
    }
}

fn convert_attempt(record: &AttemptRecord) -> AttemptInput {
    AttemptInput {
        milestone_id: record.milestone_id.clone(),
        attempt: record.attempt,
        passed: record.passed,
        xp_awarded: record.xp_awarded,
        feedback: record.feedback.clone(),
        degraded: record.degraded,
        timestamp: record.timestamp,
    }
}

fn convert_hint(record: &HintRecord) -> HintInput {
    HintInput {
        milestone_id: record.milestone_id.clone(),
        hint_number: record.hint_number,
        hint: record.hint.clone(),
        timestamp: record.timestamp,
    }
}

// ============================================================================
// Output
// ============================================================================

/// Prints the loaded configuration.
fn print_config(config: &Config) {
    println!("Configuration loaded:");
    println!("  Themes: {}", config.lesson.themes.join(", "));
    println!(
        "  Difficulty: {}-{}",
        config.lesson.min_difficulty, config.lesson.max_difficulty
    );
    println!(
        "  Hints per milestone: {}",
        config.hints.max_hints_per_milestone
    );
    println!("  Max xp per milestone: {}", config.grading.max_xp_per_milestone);
    println!("  Completion proxy: {}", config.completion.base_url);
    println!("  Default model: {}", config.completion.default_model);
    println!("  State directory: {}", config.store.state_dir);
    println!(
        "  Server: {}:{}",
        config.server.host, config.server.port
    );
}

/// Prints a session summary.
fn print_summary(summary: &SessionSummary) {
    println!("=== Session {} ===", summary.session_id);
    println!("Learner: {}", summary.learner_nickname);
    println!("Theme: {}", summary.theme);
    if let Some(title) = &summary.lesson_title {
        println!("Lesson: {title}");
    }
    println!("Phase: {}", summary.phase);
    println!(
        "Milestone: {} of {}",
        (summary.current_milestone + 1).min(summary.total_milestones),
        summary.total_milestones
    );
    if let Some(active) = &summary.active_milestone {
        println!("  Goal: {}", active.goal);
        println!("  Hints used: {}", summary.hint_count);
    }
    println!("Attempts: {}", summary.attempt_count);
    println!("XP: {}", summary.xp_earned);
    if summary.badges_earned.is_empty() {
        println!("Badges: none yet");
    } else {
        println!("Badges: {}", summary.badges_earned.join(", "));
    }
    if summary.ended_early {
        println!("Ended early: yes");
    }
}
