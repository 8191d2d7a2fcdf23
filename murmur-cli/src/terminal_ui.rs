//! Terminal call screen

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame, Terminal,
};
use std::{
    collections::VecDeque,
    io::{self, Stdout},
    time::Duration,
};
use tokio::sync::broadcast::error::TryRecvError;

use murmur_core::prelude::*;
use murmur_core::types::format_duration;

/// How many notices stay on screen
const MAX_NOTICES: usize = 5;

/// Something the user asked for from the keyboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiAction {
    Accept,
    Reject,
    HangUp,
    ToggleMute,
    ToggleVideo,
    SwitchCamera,
    /// Hang up if needed, then leave the screen
    Quit,
}

/// Map a key press to an action
#[must_use]
pub fn action_for_key(code: KeyCode) -> Option<UiAction> {
    match code {
        KeyCode::Char('a') => Some(UiAction::Accept),
        KeyCode::Char('r') => Some(UiAction::Reject),
        KeyCode::Char('h') => Some(UiAction::HangUp),
        KeyCode::Char('m') => Some(UiAction::ToggleMute),
        KeyCode::Char('v') => Some(UiAction::ToggleVideo),
        KeyCode::Char('c') => Some(UiAction::SwitchCamera),
        KeyCode::Char('q') | KeyCode::Esc => Some(UiAction::Quit),
        _ => None,
    }
}

/// Run an action against the session; returns a notice to show, if any
pub async fn dispatch(manager: &CallSessionManager, action: UiAction) -> Option<String> {
    let snapshot = manager.snapshot();
    let result = match action {
        UiAction::Accept => manager.accept_call().await.map(|_| None),
        UiAction::Reject => manager.reject_call().await.map(|()| None),
        UiAction::HangUp | UiAction::Quit => {
            manager.end_call().await;
            Ok(None)
        }
        UiAction::ToggleMute => manager.set_audio_muted(!snapshot.audio_muted).map(|()| None),
        UiAction::ToggleVideo => manager
            .set_video_enabled(!snapshot.video_enabled)
            .map(|()| None),
        UiAction::SwitchCamera => manager
            .switch_camera(None)
            .await
            .map(|device| Some(format!("Camera: {device}"))),
    };
    result.unwrap_or_else(|e| Some(e.to_string()))
}

/// One-line description of a session event, for the notice area
#[must_use]
pub fn notice_for(event: &CallEvent) -> Option<String> {
    match event {
        CallEvent::IncomingCall { call_type, from, .. } => {
            Some(format!("Incoming {call_type} call from {from}"))
        }
        CallEvent::Declined { .. } => Some("Call declined".to_string()),
        CallEvent::MediaDenied { message, .. } => Some(message.clone()),
        CallEvent::Failed { reason, .. } => Some(format!("Call failed: {reason}")),
        CallEvent::TimedOut { .. } => Some("No answer".to_string()),
        CallEvent::CallEnded { reason, .. } => Some(match reason {
            EndReason::LocalHangup => "You hung up".to_string(),
            EndReason::RemoteHangup => "The other side hung up".to_string(),
            EndReason::Rejected => "Call rejected".to_string(),
            EndReason::Declined => "Call declined".to_string(),
            EndReason::TransportLost => "Connection lost".to_string(),
            EndReason::NegotiationFailed => "Could not establish the call".to_string(),
            EndReason::MediaUnavailable => "Camera or microphone unavailable".to_string(),
            EndReason::TimedOut => "No answer".to_string(),
        }),
        CallEvent::StateChanged { .. } | CallEvent::CameraSwitched { .. } => None,
    }
}

/// Human label for the session state
#[must_use]
pub fn state_label(state: CallState, is_incoming: bool) -> &'static str {
    match state {
        CallState::Idle => "Idle",
        CallState::Calling => "Calling",
        CallState::Ringing if is_incoming => "Incoming call",
        CallState::Ringing => "Ringing",
        CallState::Connecting => "Connecting",
        CallState::Connected => "Connected",
    }
}

/// Everything the call screen shows, derived from one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallScreen {
    pub status: &'static str,
    pub peer: String,
    pub call_type: String,
    pub duration: String,
    pub muted: bool,
    pub video_on: bool,
    pub remote_tracks: usize,
    pub keys: Vec<(&'static str, &'static str)>,
}

impl CallScreen {
    #[must_use]
    pub fn from_snapshot(snapshot: &CallSnapshot) -> Self {
        let has_video = snapshot.call_type.is_some_and(CallType::has_video);
        let mut keys = Vec::new();
        match snapshot.state {
            CallState::Ringing if snapshot.is_incoming => {
                keys.push(("a", "Accept"));
                keys.push(("r", "Reject"));
            }
            CallState::Idle => {}
            _ => {
                keys.push(("h", "Hang up"));
                keys.push(("m", if snapshot.audio_muted { "Unmute" } else { "Mute" }));
                if has_video {
                    keys.push(("v", "Video"));
                    keys.push(("c", "Camera"));
                }
            }
        }
        keys.push(("q", "Quit"));

        Self {
            status: state_label(snapshot.state, snapshot.is_incoming),
            peer: snapshot
                .remote_peer_id
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string),
            call_type: snapshot
                .call_type
                .map_or_else(|| "-".to_string(), |t| t.to_string()),
            duration: snapshot
                .duration()
                .map_or_else(|| "--:--".to_string(), format_duration),
            muted: snapshot.audio_muted,
            video_on: has_video && snapshot.video_enabled,
            remote_tracks: snapshot.remote_stream.as_ref().map_or(0, |s| s.tracks.len()),
            keys,
        }
    }
}

/// Bounded list of recent notices, newest last
#[derive(Debug, Default)]
pub struct Notices {
    items: VecDeque<String>,
}

impl Notices {
    pub fn push(&mut self, notice: String) {
        if self.items.len() == MAX_NOTICES {
            self.items.pop_front();
        }
        self.items.push_back(notice);
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.items.iter()
    }
}

// ============================================================================
// Drawing
// ============================================================================

fn status_color(status: &str) -> Color {
    match status {
        "Connected" => Color::Green,
        "Idle" => Color::DarkGray,
        "Incoming call" => Color::Yellow,
        _ => Color::Cyan,
    }
}

fn flag(label: &str, on: bool) -> Span<'static> {
    Span::styled(
        format!(" {label}: {} ", if on { "on" } else { "off" }),
        Style::default().fg(if on { Color::Green } else { Color::Red }),
    )
}

/// Draw the whole call screen
pub fn draw(f: &mut Frame, screen: &CallScreen, notices: &Notices) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6), // Call
            Constraint::Min(3),    // Notices
            Constraint::Length(3), // Keys
        ])
        .split(f.size());

    draw_call_area(f, chunks[0], screen);
    draw_notice_area(f, chunks[1], notices);
    draw_key_area(f, chunks[2], screen);
}

fn draw_call_area(f: &mut Frame, area: Rect, screen: &CallScreen) {
    let block = Block::default()
        .title("Murmur")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let lines = vec![
        Line::from(Span::styled(
            screen.status,
            Style::default()
                .fg(status_color(screen.status))
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(format!("Peer: {} | Type: {}", screen.peer, screen.call_type)),
        Line::from(format!(
            "Duration: {} | Remote tracks: {}",
            screen.duration, screen.remote_tracks
        )),
        Line::from(vec![flag("Mic", !screen.muted), flag("Video", screen.video_on)]),
    ];

    let paragraph = Paragraph::new(lines)
        .block(block)
        .alignment(Alignment::Center);
    f.render_widget(paragraph, area);
}

fn draw_notice_area(f: &mut Frame, area: Rect, notices: &Notices) {
    let block = Block::default().title("Notices").borders(Borders::ALL);
    let lines: Vec<Line> = notices.iter().map(|n| Line::from(n.as_str())).collect();
    let paragraph = Paragraph::new(lines)
        .block(block)
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn draw_key_area(f: &mut Frame, area: Rect, screen: &CallScreen) {
    let block = Block::default().title("Keys").borders(Borders::ALL);
    let mut spans = Vec::new();
    for (i, (key, label)) in screen.keys.iter().enumerate() {
        if i > 0 {
            spans.push(Span::raw(" | "));
        }
        spans.push(Span::styled(
            format!("({key})"),
            Style::default()
                .fg(Color::Blue)
                .add_modifier(Modifier::BOLD),
        ));
        spans.push(Span::raw(format!(" {label}")));
    }
    let paragraph = Paragraph::new(Line::from(spans)).block(block);
    f.render_widget(paragraph, area);
}

// ============================================================================
// Event loop
// ============================================================================

/// When the screen closes on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPolicy {
    /// Stay until the user quits
    OnQuit,
    /// Also leave once a call has ended
    AfterCall,
}

/// Full-screen call view bound to one terminal
pub struct TerminalUI<B: Backend> {
    terminal: Terminal<B>,
    notices: Notices,
    restore: bool,
}

impl TerminalUI<CrosstermBackend<Stdout>> {
    /// Take over the terminal
    pub fn new() -> Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        Ok(Self {
            terminal,
            notices: Notices::default(),
            restore: true,
        })
    }
}

impl<B: Backend> TerminalUI<B> {
    /// Wrap an existing terminal without touching raw mode
    pub fn with_terminal(terminal: Terminal<B>) -> Self {
        Self {
            terminal,
            notices: Notices::default(),
            restore: false,
        }
    }

    /// Notices collected so far
    pub fn notices(&self) -> &Notices {
        &self.notices
    }

    /// Pull pending session events into the notice list
    ///
    /// Returns true if an incoming call was announced.
    fn drain_events(
        &mut self,
        events: &mut tokio::sync::broadcast::Receiver<CallEvent>,
    ) -> bool {
        let mut incoming = false;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    incoming |= matches!(event, CallEvent::IncomingCall { .. });
                    if let Some(notice) = notice_for(&event) {
                        self.notices.push(notice);
                    }
                }
                Err(TryRecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "Notice stream lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return incoming,
            }
        }
    }

    /// Render one frame for the current session state
    pub fn render(&mut self, snapshot: &CallSnapshot) -> Result<()> {
        let screen = CallScreen::from_snapshot(snapshot);
        let notices = &self.notices;
        self.terminal.draw(|f| draw(f, &screen, notices))?;
        Ok(())
    }

    /// Drive the screen until the user quits or the exit policy fires
    pub async fn run(
        &mut self,
        manager: &CallSessionManager,
        auto_accept: bool,
        exit: ExitPolicy,
    ) -> Result<()> {
        let mut events = manager.subscribe_events();
        let mut was_active = manager.state().is_active();

        loop {
            if self.drain_events(&mut events) && auto_accept {
                if let Some(notice) = dispatch(manager, UiAction::Accept).await {
                    self.notices.push(notice);
                }
            }

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        if let Some(action) = action_for_key(key.code) {
                            if let Some(notice) = dispatch(manager, action).await {
                                self.notices.push(notice);
                            }
                            if action == UiAction::Quit {
                                break;
                            }
                        }
                    }
                }
            }

            let snapshot = manager.snapshot();
            self.render(&snapshot)?;

            let active = snapshot.state.is_active();
            if exit == ExitPolicy::AfterCall && was_active && !active {
                // Leave the final notice readable for a moment
                tokio::time::sleep(Duration::from_millis(750)).await;
                break;
            }
            was_active = active;

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Ok(())
    }
}

impl<B: Backend> Drop for TerminalUI<B> {
    fn drop(&mut self) {
        if !self.restore {
            return;
        }
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}
