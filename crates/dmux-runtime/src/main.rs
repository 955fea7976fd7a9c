use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use dmux_core::toast::ToastSeverity;
use dmux_git::{Git, GitExecutor};
use dmux_llm::ProviderChain;
use dmux_tmux::executor::TmuxCommandRunner;
use dmux_tmux::{TmuxAdapter, TmuxExecutor, hooks};

use dmux_runtime::actions::{ActionDispatcher, CALLBACK_TTL, CallbackRegistry};
use dmux_runtime::analyzer::{StatusAnalyzer, run_status_consumer};
use dmux_runtime::bus::{DEFAULT_POLL_INTERVAL, PaneEventBus};
use dmux_runtime::hookrun::HookRunner;
use dmux_runtime::lifecycle::{CloseLocks, LifecycleController};
use dmux_runtime::merge::MergeEngine;
use dmux_runtime::project::{self, ProjectContext};
use dmux_runtime::server::{AppState, serve};
use dmux_runtime::state::{StateEvent, StateStore};
use dmux_runtime::streamer::TerminalStreamer;
use dmux_runtime::{preflight, tui, watcher};

#[derive(Parser)]
#[command(name = "dmux", about = "Orchestrate AI coding agents in tmux panes and git worktrees")]
struct Cli {
    /// HTTP server port (0 picks an ephemeral port)
    #[arg(long, default_value_t = 0)]
    port: u16,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the environment (tmux, git, agent CLIs) and exit
    Doctor,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let home = PathBuf::from(std::env::var("HOME").context("HOME is not set")?);
    let cwd = std::env::current_dir()?;
    let root = discover_root(&cwd);
    let ctx = ProjectContext::discover(root, home);

    init_tracing(&ctx)?;
    if std::env::var("DMUX_DEV").is_ok() {
        tracing::info!("DMUX_DEV set: development workflow enabled");
    }

    if let Some(Commands::Doctor) = cli.command {
        let report = preflight::check(&ctx.home)?;
        println!("tmux: ok");
        println!("git:  ok");
        if report.agents.is_empty() {
            println!("agents: none found (claude, opencode, codex)");
        } else {
            let names: Vec<&str> = report.agents.iter().map(|a| a.as_str()).collect();
            println!("agents: {}", names.join(", "));
        }
        return Ok(());
    }

    preflight::check(&ctx.home)?;

    // Outside the project session: create it (running dmux inside) and
    // replace ourselves with `tmux attach`.
    if !inside_target_session(&ctx) {
        return bootstrap_session(&ctx);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(ctx, cli.port))
}

/// Project root: git toplevel when inside a repo, cwd otherwise.
fn discover_root(cwd: &std::path::Path) -> PathBuf {
    let git = Git::new(GitExecutor::default());
    git.toplevel(cwd).unwrap_or_else(|_| cwd.to_path_buf())
}

/// The TUI owns stdout, so tracing goes to `.dmux/dmux.log`.
fn init_tracing(ctx: &ProjectContext) -> Result<()> {
    std::fs::create_dir_all(ctx.dmux_dir())?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(ctx.dmux_dir().join("dmux.log"))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(move || file.try_clone().expect("log file clone"))
        .init();
    Ok(())
}

fn inside_target_session(ctx: &ProjectContext) -> bool {
    if std::env::var("TMUX").is_err() {
        return false;
    }
    let adapter = TmuxAdapter::new(TmuxExecutor::default());
    adapter
        .display_message("#{session_name}")
        .map(|name| name.trim() == ctx.session_name)
        .unwrap_or(false)
}

/// Create the per-project session with dmux running in its first pane,
/// then exec `tmux attach` in place of this process.
fn bootstrap_session(ctx: &ProjectContext) -> Result<()> {
    let adapter = TmuxAdapter::new(TmuxExecutor::default());
    if !adapter.has_session(&ctx.session_name) {
        let exe = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "dmux".to_string());
        adapter.runner().run(&[
            "new-session",
            "-d",
            "-s",
            &ctx.session_name,
            "-c",
            &ctx.root.display().to_string(),
            &exe,
        ])?;
        adapter.set_global_option("pane-border-status", "top")?;
        tracing::info!(session = %ctx.session_name, "created project session");
    }

    use std::os::unix::process::CommandExt;
    let err = std::process::Command::new("tmux")
        .args(["attach", "-t", &ctx.session_name])
        .exec();
    Err(err).context("failed to exec tmux attach")
}

async fn run(ctx: ProjectContext, port: u16) -> Result<()> {
    let cancel = CancellationToken::new();

    let settings = project::load_settings(&ctx);
    let config = project::load_config(&ctx);
    let store = StateStore::new(ctx.clone(), settings.clone(), config);
    let _config_watcher = watcher::spawn(store.clone(), cancel.clone())?;

    let tmux = Arc::new(TmuxAdapter::new(TmuxExecutor::default()).scoped_to(ctx.session_name.clone()));
    let git = Arc::new(Git::new(GitExecutor::default()));
    let chain = Arc::new(ProviderChain::for_provider(settings.slug_provider));
    let hooks_runner = Arc::new(HookRunner::new(&ctx));
    if let Err(e) = hooks_runner.scaffold() {
        tracing::warn!(error = %e, "hook scaffolding failed");
    }

    // Control pane identity: the pane this TUI runs in.
    if let Ok(control_pane) = std::env::var("TMUX_PANE") {
        let _ = tmux.set_pane_title(&control_pane, &ctx.control_title());
        store.persist_panes(move |config| {
            config.control_pane_id = Some(control_pane);
        })?;
    }

    let locks = CloseLocks::new();
    locks.spawn_sweeper(cancel.clone());

    let lifecycle = LifecycleController::new(
        tmux.clone(),
        git.clone(),
        store.clone(),
        chain.clone(),
        locks.clone(),
        hooks_runner.clone(),
    );
    let merge = MergeEngine::new(lifecycle.clone());
    let dispatcher = ActionDispatcher::new(lifecycle.clone(), merge);
    let registry = CallbackRegistry::new(CALLBACK_TTL);
    registry.spawn_gc(cancel.clone());

    // Pane event bus: hooks when configured, polling otherwise.
    let bus = PaneEventBus::new(
        tmux.clone(),
        ctx.event_pipe_path(),
        DEFAULT_POLL_INTERVAL,
        cancel.clone(),
    );
    let mode = bus.start(settings.use_tmux_hooks).await;
    tracing::info!(mode = ?mode, "pane event bus running");
    {
        let lifecycle = lifecycle.clone();
        let mut events = bus.subscribe();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => lifecycle.reconcile(&event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => return,
                    },
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    // Analyzer: track agent panes, consume its status events.
    let (analyzer, status_rx) = StatusAnalyzer::new(tmux.clone(), chain.clone(), cancel.clone());
    analyzer.sync_tracked(&store.config());
    tokio::spawn(run_status_consumer(
        store.clone(),
        tmux.clone(),
        status_rx,
        cancel.clone(),
    ));
    {
        let analyzer = analyzer.clone();
        let bus = bus.clone();
        let mut state_rx = store.subscribe();
        let cancel = cancel.clone();
        let mut hooks_enabled = settings.use_tmux_hooks;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = state_rx.recv() => match event {
                        Ok(StateEvent::PanesUpdated(config)) => analyzer.sync_tracked(&config),
                        Ok(StateEvent::SettingsUpdated(updated)) => {
                            if updated.use_tmux_hooks != hooks_enabled {
                                hooks_enabled = updated.use_tmux_hooks;
                                bus.select_backend(hooks_enabled).await;
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => return,
                    },
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    let streamer = TerminalStreamer::new(tmux.clone(), cancel.clone());

    let state = AppState {
        store: store.clone(),
        tmux: tmux.clone(),
        streamer,
        analyzer: analyzer.clone(),
        dispatcher: dispatcher.clone(),
        registry,
        hooks: hooks_runner.clone(),
    };
    let bound_port = serve(state, port, cancel.clone()).await?;
    store.set_server_port(bound_port);
    hooks_runner.set_server_port(bound_port);

    if project::onboarding_first_run(&ctx) {
        store.toast(
            format!("welcome to dmux; http://localhost:{bound_port} mirrors this view"),
            ToastSeverity::Info,
        );
    }

    lifecycle.ensure_welcome_pane().await.ok();

    let tui_result = tui::run_tui(store.clone(), analyzer, dispatcher, cancel.clone()).await;

    // Clean shutdown: stop background work and remove our tmux hooks.
    cancel.cancel();
    let _ = hooks::uninstall_hooks(tmux.runner(), &ctx.session_name);
    tui_result
}
