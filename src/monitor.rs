//! Live playback monitor.
//!
//! Polls the controller status about once a second and maps keys to
//! controller calls: `p` pause, `r` resume, `s` stop, `q` quit.

use std::io::{self, Stdout};
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use pemf::controller::{PlaybackController, RunState, StatusSnapshot};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Gauge, Paragraph};

const STATUS_POLL: Duration = Duration::from_secs(1);

type Term = Terminal<CrosstermBackend<Stdout>>;

pub async fn run(controller: &PlaybackController) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let result = event_loop(&mut terminal, controller).await;

    // Restore the terminal even when the loop failed.
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

async fn event_loop(terminal: &mut Term, controller: &PlaybackController) -> Result<()> {
    let mut message: Option<String> = None;
    loop {
        let status = controller.status();
        terminal.draw(|frame| render(frame, &status, message.as_deref()))?;

        if !event::poll(STATUS_POLL)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        let result = match key.code {
            KeyCode::Char('p') => controller.pause().await,
            KeyCode::Char('r') => controller.resume().await,
            KeyCode::Char('s') => controller.stop().await,
            KeyCode::Char('q') | KeyCode::Esc => {
                if matches!(status.run_state, RunState::Running | RunState::Paused) {
                    controller.stop().await?;
                }
                return Ok(());
            }
            _ => continue,
        };
        message = result.err().map(|e| e.to_string());
    }
}

fn render(frame: &mut Frame, status: &StatusSnapshot, message: Option<&str>) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Device
            Constraint::Length(3), // Progress
            Constraint::Min(4),    // Details
            Constraint::Length(3), // Help
        ])
        .split(frame.size());

    let device = match &status.device {
        Some(device) => format!(
            "{device} on {}",
            status.port.as_deref().unwrap_or("?")
        ),
        None => "not connected".to_owned(),
    };
    let state_style = match status.run_state {
        RunState::Running => Style::default().fg(Color::Green),
        RunState::Paused | RunState::Stopping => Style::default().fg(Color::Yellow),
        RunState::Idle | RunState::Loaded => Style::default(),
    };
    let header = Line::from(vec![
        Span::raw(device),
        Span::raw("  "),
        Span::styled(status.run_state.as_str(), state_style.add_modifier(Modifier::BOLD)),
    ]);
    frame.render_widget(
        Paragraph::new(header).block(Block::default().borders(Borders::ALL).title("pemf")),
        layout[0],
    );

    let ratio = if status.total_rows == 0 {
        0.0
    } else {
        status.current_row as f64 / status.total_rows as f64
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Rows"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .label(format!("{}/{}", status.current_row, status.total_rows))
        .ratio(ratio.clamp(0.0, 1.0));
    frame.render_widget(gauge, layout[1]);

    let mut details = vec![Line::from(format!(
        "Treatment: {}",
        status.treatment.as_deref().unwrap_or("-")
    ))];
    if let Some(stage) = status.active_stage {
        details.push(Line::from(format!("Stage: {stage}")));
    }
    if let Some(err) = &status.last_error {
        details.push(Line::styled(
            format!("Error: {err}"),
            Style::default().fg(Color::Red),
        ));
    }
    if let Some(message) = message {
        details.push(Line::styled(message.to_owned(), Style::default().fg(Color::Yellow)));
    }
    frame.render_widget(
        Paragraph::new(details).block(Block::default().borders(Borders::ALL)),
        layout[2],
    );

    let help = Paragraph::new("p pause   r resume   s stop   q quit")
        .block(Block::default().borders(Borders::ALL));
    frame.render_widget(help, layout[3]);
}
