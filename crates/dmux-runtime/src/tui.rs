//! Control-pane TUI: pane list, action menu, and dialog rendering for
//! every `ActionResult` variant. Runs inside the dmux tmux session's
//! control pane.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::prelude::*;
use ratatui::widgets::*;
use tokio_util::sync::CancellationToken;

use dmux_core::action::ActionResult;
use dmux_core::toast::ToastSeverity;
use dmux_core::types::{AgentKind, AgentStatus, DevStatus, PaneRecord, TestStatus};
use dmux_git::runner::GitRunner;
use dmux_tmux::executor::TmuxCommandRunner;

use crate::actions::{ActionDescriptor, ActionDispatcher, available_actions};
use crate::analyzer::StatusAnalyzer;
use crate::lifecycle::{CreateOutcome, CreatePaneRequest, detect_available_agents};
use crate::state::{StateEvent, StateStore};

// ---------------------------------------------------------------------------
// Terminal cleanup guard
// ---------------------------------------------------------------------------

/// Restores the terminal on drop, surviving panics and `?` returns.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
    }
}

// ---------------------------------------------------------------------------
// Pure formatting
// ---------------------------------------------------------------------------

pub fn status_indicator(status: AgentStatus) -> (&'static str, Color) {
    match status {
        AgentStatus::Working => ("●", Color::Yellow),
        AgentStatus::Waiting => ("◐", Color::Magenta),
        AgentStatus::Idle => ("○", Color::Green),
        AgentStatus::Unknown => ("·", Color::DarkGray),
    }
}

/// One list row: indicator, slug, agent, lifecycle markers.
pub fn pane_line(pane: &PaneRecord) -> String {
    let mut line = format!("{} [{}]", pane.slug, pane.agent);
    if pane.autopilot {
        line.push_str(" ⚡");
    }
    match pane.test_status {
        Some(TestStatus::Running) => line.push_str(" tests:…"),
        Some(TestStatus::Passed) => line.push_str(" tests:✓"),
        Some(TestStatus::Failed) => line.push_str(" tests:✗"),
        None => {}
    }
    match pane.dev_status {
        Some(DevStatus::Running) => line.push_str(" dev:▶"),
        Some(DevStatus::Stopped) => line.push_str(" dev:■"),
        None => {}
    }
    line
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

enum Mode {
    List,
    Menu {
        pane_id: String,
        actions: Vec<ActionDescriptor>,
        selected: usize,
    },
    Dialog(DialogState),
    NewPane {
        input: String,
        /// A/B pair: the same prompt on two agents at once.
        pair: bool,
    },
}

struct DialogState {
    result: ActionResult,
    selected: usize,
    input: String,
}

struct App {
    panes: Vec<PaneRecord>,
    selected: usize,
    mode: Mode,
    should_quit: bool,
}

impl App {
    fn new(panes: Vec<PaneRecord>) -> Self {
        App {
            panes,
            selected: 0,
            mode: Mode::List,
            should_quit: false,
        }
    }

    fn next(&mut self) {
        if !self.panes.is_empty() {
            self.selected = (self.selected + 1).min(self.panes.len() - 1);
        }
    }

    fn previous(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    fn update_panes(&mut self, panes: Vec<PaneRecord>) {
        self.panes = panes;
        if self.panes.is_empty() {
            self.selected = 0;
        } else if self.selected >= self.panes.len() {
            self.selected = self.panes.len() - 1;
        }
    }

    fn selected_pane(&self) -> Option<&PaneRecord> {
        self.panes.get(self.selected)
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

pub async fn run_tui<RT, RG>(
    store: Arc<StateStore>,
    analyzer: Arc<StatusAnalyzer<RT>>,
    dispatcher: Arc<ActionDispatcher<RT, RG>>,
    cancel: CancellationToken,
) -> Result<()>
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    enable_raw_mode()?;
    execute!(io::stdout(), EnterAlternateScreen)?;
    let _guard = TerminalGuard;
    let backend = CrosstermBackend::new(io::stdout());
    let mut terminal = Terminal::new(backend)?;

    let mut state_rx = store.subscribe();
    let mut app = App::new(store.config().panes);

    loop {
        if app.should_quit || cancel.is_cancelled() {
            return Ok(());
        }

        // Drain state events; pane updates replace the list wholesale.
        while let Ok(event) = state_rx.try_recv() {
            if let StateEvent::PanesUpdated(config) = event {
                app.update_panes(config.panes);
            }
        }
        store.with_toasts(|toasts| toasts.advance(Utc::now()));

        let unread = store.unread_attention_count();
        let toast = store.with_toasts(|toasts| toasts.current().cloned());
        terminal.draw(|frame| draw(frame, &app, unread, toast.as_ref()))?;

        // Blocking poll with a short timeout keeps the loop responsive to
        // state pushes without an async event stream.
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                handle_key(&mut app, key, &store, &analyzer, &dispatcher).await;
            }
        }
    }
}

async fn handle_key<RT, RG>(
    app: &mut App,
    key: KeyEvent,
    store: &Arc<StateStore>,
    analyzer: &Arc<StatusAnalyzer<RT>>,
    dispatcher: &Arc<ActionDispatcher<RT, RG>>,
) where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        app.should_quit = true;
        return;
    }

    let mode = std::mem::replace(&mut app.mode, Mode::List);
    match mode {
        Mode::List => handle_list_key(app, key, store, dispatcher).await,
        Mode::Menu {
            pane_id,
            actions,
            mut selected,
        } => match key.code {
            KeyCode::Esc => {}
            KeyCode::Char('j') | KeyCode::Down => {
                selected = (selected + 1).min(actions.len().saturating_sub(1));
                app.mode = Mode::Menu {
                    pane_id,
                    actions,
                    selected,
                };
            }
            KeyCode::Char('k') | KeyCode::Up => {
                selected = selected.saturating_sub(1);
                app.mode = Mode::Menu {
                    pane_id,
                    actions,
                    selected,
                };
            }
            KeyCode::Enter => {
                if let Some(descriptor) = actions.get(selected) {
                    let result = dispatcher.dispatch(&pane_id, descriptor.id).await;
                    present(app, result, store, analyzer);
                }
            }
            _ => {
                app.mode = Mode::Menu {
                    pane_id,
                    actions,
                    selected,
                };
            }
        },
        Mode::Dialog(dialog) => handle_dialog_key::<RT, RG>(app, key, dialog, store, analyzer).await,
        Mode::NewPane { mut input, pair } => match key.code {
            KeyCode::Esc => {}
            KeyCode::Enter => {
                let prompt = input.trim().to_string();
                if pair {
                    submit_pair(prompt, store, dispatcher).await;
                } else {
                    let outcome = dispatcher
                        .lifecycle
                        .create_pane(CreatePaneRequest {
                            prompt: prompt.clone(),
                            agent: None,
                        })
                        .await;
                    match outcome {
                        Ok(CreateOutcome::Created(pane)) => {
                            store.toast(format!("created '{}'", pane.slug), ToastSeverity::Success);
                        }
                        Ok(CreateOutcome::NeedsAgentChoice(agents)) => {
                            present(
                                app,
                                agent_choice_dialog(dispatcher, prompt, agents),
                                store,
                                analyzer,
                            );
                        }
                        Err(e) => {
                            store.toast(format!("create failed: {e:#}"), ToastSeverity::Error);
                        }
                    }
                }
            }
            KeyCode::Backspace => {
                input.pop();
                app.mode = Mode::NewPane { input, pair };
            }
            KeyCode::Char(c) => {
                input.push(c);
                app.mode = Mode::NewPane { input, pair };
            }
            _ => {
                app.mode = Mode::NewPane { input, pair };
            }
        },
    }

    // Keep the analyzer informed about modal state.
    analyzer.set_dialog_open(matches!(app.mode, Mode::Dialog(_)));
}

async fn handle_list_key<RT, RG>(
    app: &mut App,
    key: KeyEvent,
    store: &Arc<StateStore>,
    dispatcher: &Arc<ActionDispatcher<RT, RG>>,
) where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    match key.code {
        KeyCode::Char('q') => app.should_quit = true,
        KeyCode::Char('j') | KeyCode::Down => app.next(),
        KeyCode::Char('k') | KeyCode::Up => app.previous(),
        KeyCode::Char('n') => {
            app.mode = Mode::NewPane {
                input: String::new(),
                pair: false,
            }
        }
        KeyCode::Char('N') => {
            app.mode = Mode::NewPane {
                input: String::new(),
                pair: true,
            }
        }
        KeyCode::Char('r') => {
            store.with_logs(|logs| logs.mark_all_as_read());
        }
        KeyCode::Enter => {
            if let Some(pane) = app.selected_pane() {
                let actions = available_actions(pane, &store.settings());
                app.mode = Mode::Menu {
                    pane_id: pane.id.clone(),
                    actions,
                    selected: 0,
                };
            }
        }
        KeyCode::Char('m') => {
            if let Some(pane) = app.selected_pane().cloned() {
                if pane.worktree_path.is_some() {
                    let result = dispatcher.dispatch(&pane.id, "merge").await;
                    // `present` needs the analyzer; route through Menu-less
                    // presentation by stashing into app.mode directly.
                    if result.is_interactive() {
                        app.mode = Mode::Dialog(DialogState {
                            selected: default_option_index(&result),
                            input: default_input(&result),
                            result,
                        });
                    } else {
                        toast_result(store, result);
                    }
                }
            }
        }
        KeyCode::Char('x') => {
            if let Some(pane) = app.selected_pane().cloned() {
                let result = dispatcher.dispatch(&pane.id, "close").await;
                if result.is_interactive() {
                    app.mode = Mode::Dialog(DialogState {
                        selected: default_option_index(&result),
                        input: default_input(&result),
                        result,
                    });
                } else {
                    toast_result(store, result);
                }
            }
        }
        _ => {}
    }
}

async fn handle_dialog_key<RT, RG>(
    app: &mut App,
    key: KeyEvent,
    mut dialog: DialogState,
    store: &Arc<StateStore>,
    analyzer: &Arc<StatusAnalyzer<RT>>,
) where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    if key.code == KeyCode::Esc {
        return; // mode already reset to List
    }

    enum Kind {
        Confirm,
        Choice(usize),
        Input,
    }
    let kind = match &dialog.result {
        ActionResult::Confirm { .. } => Kind::Confirm,
        ActionResult::Choice { options, .. } => Kind::Choice(options.len()),
        ActionResult::Input { .. } => Kind::Input,
        // Non-interactive results dismiss on any key.
        _ => return,
    };

    match kind {
        Kind::Confirm => match key.code {
            KeyCode::Char('y') | KeyCode::Enter => {
                if let ActionResult::Confirm { on_confirm, .. } = dialog.result {
                    let next = on_confirm().await;
                    present(app, next, store, analyzer);
                }
            }
            KeyCode::Char('n') => {
                if let ActionResult::Confirm { on_cancel, .. } = dialog.result {
                    if let Some(on_cancel) = on_cancel {
                        let next = on_cancel().await;
                        present(app, next, store, analyzer);
                    }
                }
            }
            _ => app.mode = Mode::Dialog(dialog),
        },
        Kind::Choice(count) => match key.code {
            KeyCode::Char('j') | KeyCode::Down => {
                dialog.selected = (dialog.selected + 1).min(count.saturating_sub(1));
                app.mode = Mode::Dialog(dialog);
            }
            KeyCode::Char('k') | KeyCode::Up => {
                dialog.selected = dialog.selected.saturating_sub(1);
                app.mode = Mode::Dialog(dialog);
            }
            KeyCode::Enter => {
                let selected = dialog.selected;
                if let ActionResult::Choice {
                    options, on_select, ..
                } = dialog.result
                {
                    if let Some(option) = options.get(selected) {
                        let next = on_select(option.id.clone()).await;
                        present(app, next, store, analyzer);
                    }
                }
            }
            _ => app.mode = Mode::Dialog(dialog),
        },
        Kind::Input => match key.code {
            KeyCode::Enter => {
                let value = dialog.input.clone();
                if let ActionResult::Input { on_submit, .. } = dialog.result {
                    let next = on_submit(value).await;
                    present(app, next, store, analyzer);
                }
            }
            KeyCode::Backspace => {
                dialog.input.pop();
                app.mode = Mode::Dialog(dialog);
            }
            KeyCode::Char(c) => {
                dialog.input.push(c);
                app.mode = Mode::Dialog(dialog);
            }
            _ => app.mode = Mode::Dialog(dialog),
        },
    }
}

/// Show the next step: interactive results become the modal dialog,
/// terminal ones become a toast.
fn present<RT>(
    app: &mut App,
    result: ActionResult,
    store: &Arc<StateStore>,
    analyzer: &Arc<StatusAnalyzer<RT>>,
) where
    RT: TmuxCommandRunner + 'static,
{
    if result.is_interactive() {
        app.mode = Mode::Dialog(DialogState {
            selected: default_option_index(&result),
            input: default_input(&result),
            result,
        });
        analyzer.set_dialog_open(true);
    } else {
        toast_result(store, result);
        app.mode = Mode::List;
        analyzer.set_dialog_open(false);
    }
}

fn toast_result(store: &Arc<StateStore>, result: ActionResult) {
    match result {
        ActionResult::Success { message, .. } => store.toast(message, ToastSeverity::Success),
        ActionResult::Error { message, .. } => store.toast(message, ToastSeverity::Error),
        ActionResult::Info { message, .. } | ActionResult::View { message } => {
            store.toast(message, ToastSeverity::Info)
        }
        ActionResult::Navigation { message, .. } => store.toast(message, ToastSeverity::Info),
        ActionResult::Progress { message, .. } => store.toast(message, ToastSeverity::Info),
        _ => {}
    }
}

fn default_option_index(result: &ActionResult) -> usize {
    match result {
        ActionResult::Choice { options, .. } => options
            .iter()
            .position(|o| o.default)
            .unwrap_or(0),
        _ => 0,
    }
}

fn default_input(result: &ActionResult) -> String {
    match result {
        ActionResult::Input { default_value, .. } => default_value.clone().unwrap_or_default(),
        _ => String::new(),
    }
}

/// A/B pair submission: same prompt, the first two installed agents.
async fn submit_pair<RT, RG>(
    prompt: String,
    store: &Arc<StateStore>,
    dispatcher: &Arc<ActionDispatcher<RT, RG>>,
) where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    let agents = detect_available_agents(&store.project().home);
    let [first, second, ..] = agents.as_slice() else {
        store.toast(
            "A/B pairs need at least two agent CLIs installed",
            ToastSeverity::Error,
        );
        return;
    };
    match dispatcher.lifecycle.create_pair(&prompt, (*first, *second)).await {
        Ok((a, b)) => {
            store.toast(
                format!("created pair '{}' / '{}'", a.slug, b.slug),
                ToastSeverity::Success,
            );
        }
        Err(e) => {
            store.toast(format!("pair create failed: {e:#}"), ToastSeverity::Error);
        }
    }
}

fn agent_choice_dialog<RT, RG>(
    dispatcher: &Arc<ActionDispatcher<RT, RG>>,
    prompt: String,
    agents: Vec<AgentKind>,
) -> ActionResult
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    let lifecycle = dispatcher.lifecycle.clone();
    ActionResult::Choice {
        title: "Which agent?".to_string(),
        message: "Multiple agent CLIs are installed.".to_string(),
        options: agents
            .iter()
            .map(|a| dmux_core::action::OptionItem::new(a.as_str(), a.as_str()))
            .collect(),
        on_select: Box::new(move |agent_id| {
            Box::pin(async move {
                let agent = match AgentKind::parse(&agent_id) {
                    Ok(agent) => agent,
                    Err(e) => return ActionResult::error(e.to_string()),
                };
                match lifecycle
                    .create_pane(CreatePaneRequest {
                        prompt,
                        agent: Some(agent),
                    })
                    .await
                {
                    Ok(CreateOutcome::Created(pane)) => {
                        ActionResult::success(format!("created '{}'", pane.slug))
                    }
                    Ok(CreateOutcome::NeedsAgentChoice(_)) => {
                        ActionResult::error("agent selection looped")
                    }
                    Err(e) => ActionResult::error(format!("create failed: {e:#}")),
                }
            })
        }),
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn draw(frame: &mut Frame, app: &App, unread: usize, toast: Option<&dmux_core::toast::Toast>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(3),
            Constraint::Length(1),
        ])
        .split(frame.area());

    draw_pane_list(frame, chunks[0], app);
    draw_footer(frame, chunks[1], unread, toast);

    match &app.mode {
        Mode::List => {}
        Mode::Menu {
            actions, selected, ..
        } => draw_menu(frame, actions, *selected),
        Mode::Dialog(dialog) => draw_dialog(frame, dialog),
        Mode::NewPane { input, pair } => draw_new_pane(frame, input, *pair),
    }
}

fn draw_pane_list(frame: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .panes
        .iter()
        .map(|pane| {
            let (indicator, color) = status_indicator(pane.agent_status);
            let line = Line::from(vec![
                Span::styled(format!("{indicator} "), Style::default().fg(color)),
                Span::raw(pane_line(pane)),
            ]);
            ListItem::new(line)
        })
        .collect();

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(" dmux "))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));

    let mut state = ListState::default();
    state.select((!app.panes.is_empty()).then_some(app.selected));
    frame.render_stateful_widget(list, area, &mut state);
}

fn draw_footer(frame: &mut Frame, area: Rect, unread: usize, toast: Option<&dmux_core::toast::Toast>) {
    let mut spans = vec![Span::raw(
        "n:new  N:pair  Enter:menu  m:merge  x:close  j/k:move  q:quit",
    )];
    if unread > 0 {
        spans.push(Span::styled(
            format!("  ⚠ {unread}"),
            Style::default().fg(Color::Red),
        ));
    }
    if let Some(toast) = toast {
        let color = match toast.severity {
            ToastSeverity::Error => Color::Red,
            ToastSeverity::Warning => Color::Yellow,
            ToastSeverity::Success => Color::Green,
            ToastSeverity::Info => Color::Cyan,
        };
        spans.push(Span::styled(
            format!("  {}", toast.message),
            Style::default().fg(color),
        ));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn centered_rect(width: u16, height: u16, area: Rect) -> Rect {
    let x = area.x + area.width.saturating_sub(width) / 2;
    let y = area.y + area.height.saturating_sub(height) / 2;
    Rect {
        x,
        y,
        width: width.min(area.width),
        height: height.min(area.height),
    }
}

fn draw_menu(frame: &mut Frame, actions: &[ActionDescriptor], selected: usize) {
    let area = centered_rect(40, actions.len() as u16 + 2, frame.area());
    frame.render_widget(Clear, area);
    let items: Vec<ListItem> = actions
        .iter()
        .map(|a| ListItem::new(format!("{}  {}", a.label, a.description)))
        .collect();
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(" actions "))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    let mut state = ListState::default();
    state.select(Some(selected));
    frame.render_stateful_widget(list, area, &mut state);
}

fn draw_dialog(frame: &mut Frame, dialog: &DialogState) {
    let area = centered_rect(56, 10, frame.area());
    frame.render_widget(Clear, area);
    match &dialog.result {
        ActionResult::Confirm { title, message, confirm_label, cancel_label, .. } => {
            let confirm = confirm_label.as_deref().unwrap_or("yes");
            let cancel = cancel_label.as_deref().unwrap_or("no");
            let text = format!("{message}\n\n[y] {confirm}   [n] {cancel}   [esc] dismiss");
            frame.render_widget(
                Paragraph::new(text)
                    .wrap(Wrap { trim: false })
                    .block(Block::default().borders(Borders::ALL).title(format!(" {title} "))),
                area,
            );
        }
        ActionResult::Choice { title, message, options, .. } => {
            let mut lines = vec![Line::raw(message.clone()), Line::raw("")];
            for (i, option) in options.iter().enumerate() {
                let marker = if i == dialog.selected { "▸" } else { " " };
                let style = if option.danger {
                    Style::default().fg(Color::Red)
                } else {
                    Style::default()
                };
                lines.push(Line::styled(format!("{marker} {}", option.label), style));
            }
            frame.render_widget(
                Paragraph::new(lines)
                    .block(Block::default().borders(Borders::ALL).title(format!(" {title} "))),
                area,
            );
        }
        ActionResult::Input { title, message, placeholder, .. } => {
            let hint = placeholder.as_deref().unwrap_or("");
            let shown = if dialog.input.is_empty() {
                format!("({hint})")
            } else {
                dialog.input.clone()
            };
            frame.render_widget(
                Paragraph::new(format!("{message}\n\n> {shown}"))
                    .wrap(Wrap { trim: false })
                    .block(Block::default().borders(Borders::ALL).title(format!(" {title} "))),
                area,
            );
        }
        _ => {}
    }
}

fn draw_new_pane(frame: &mut Frame, input: &str, pair: bool) {
    let area = centered_rect(60, 6, frame.area());
    frame.render_widget(Clear, area);
    let (title, what) = if pair {
        (" new A/B pair ", "both agents")
    } else {
        (" new pane ", "the agent")
    };
    frame.render_widget(
        Paragraph::new(format!(
            "Describe the task for {what}:\n\n> {input}\n\n[enter] create   [esc] cancel"
        ))
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title(title)),
        area,
    );
}
