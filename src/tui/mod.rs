// src/tui/mod.rs
use crate::notify::NotificationSink;
use crate::types::{Action, Decision, Event, Level, Position, UiEvent};
use async_trait::async_trait;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Terminal,
};
use rust_decimal::Decimal;
use std::{io, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAX_NOTICES: usize = 20;

pub struct App {
    pub pair: String,
    pub current_price: Option<Decimal>,
    pub position: Position,
    pub last_decision: Option<Decision>,
    pub notices: Vec<(Level, String)>,
}

impl App {
    pub fn new(pair: String) -> Self {
        Self {
            pair,
            current_price: None,
            position: Position::Flat,
            last_decision: None,
            notices: Vec::new(),
        }
    }

    pub fn on_event(&mut self, event: UiEvent) {
        match event {
            UiEvent::TickerUpdate(t) => {
                self.current_price = Some(t.price);
            }
            UiEvent::Decision(d) => {
                self.last_decision = Some(d);
            }
            UiEvent::Position(p) => {
                self.position = p;
            }
            UiEvent::Notice(e) => {
                self.notices.push((e.level(), e.to_string()));
                if self.notices.len() > MAX_NOTICES {
                    self.notices.remove(0);
                }
            }
        }
    }
}

/// Forwards notifications into the dashboard feed.
pub struct UiSink {
    tx: mpsc::Sender<UiEvent>,
}

impl UiSink {
    pub fn new(tx: mpsc::Sender<UiEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl NotificationSink for UiSink {
    fn name(&self) -> &'static str {
        "tui"
    }

    async fn notify(&self, event: &Event) -> anyhow::Result<()> {
        // A full feed only costs a line on screen.
        let _ = self.tx.try_send(UiEvent::Notice(event.clone()));
        Ok(())
    }
}

/// Draws until `q` is pressed (which cancels `cancel`) or until something
/// else cancels it.
pub async fn run(
    mut rx: mpsc::Receiver<UiEvent>,
    pair: String,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(pair);

    while !cancel.is_cancelled() {
        terminal.draw(|f| ui(f, &app))?;

        if event::poll(Duration::from_millis(100))? {
            if let event::Event::Key(key) = event::read()? {
                if let KeyCode::Char('q') = key.code {
                    cancel.cancel();
                }
            }
        }

        while let Ok(event) = rx.try_recv() {
            app.on_event(event);
        }
        tokio::task::yield_now().await;
    }

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    Ok(())
}

fn level_style(level: Level) -> Style {
    match level {
        Level::Info => Style::default().fg(Color::Cyan),
        Level::Success => Style::default().fg(Color::Green),
        Level::Warning => Style::default().fg(Color::Yellow),
        Level::Error => Style::default().fg(Color::Red),
    }
}

fn ui(f: &mut ratatui::Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints(
            [
                Constraint::Length(3),
                Constraint::Length(4),
                Constraint::Min(10),
            ]
            .as_ref(),
        )
        .split(f.size());

    let price_text = match app.current_price {
        Some(p) => p.to_string(),
        None => "Waiting for data...".to_string(),
    };

    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            format!("Threshold Trader [{}]", app.pair),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw(" | Price: "),
        Span::styled(
            price_text,
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
    ]))
    .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(header, chunks[0]);

    let decision_text = match app.last_decision {
        Some(Decision {
            action,
            percent_change: Some(pct),
            ..
        }) => {
            let verb = match action {
                Action::Hold => "HOLD",
                Action::ExitProfit => "EXIT (profit)",
                Action::ExitLoss => "EXIT (loss)",
            };
            format!("{} at {:+}%", verb, pct.round_dp(3))
        }
        Some(_) => "HOLD (flat)".to_string(),
        None => "-".to_string(),
    };
    let position = Paragraph::new(vec![
        Line::from(format!("Position: {}", app.position)),
        Line::from(format!("Last decision: {}", decision_text)),
    ])
    .block(Block::default().borders(Borders::ALL).title("Position"));
    f.render_widget(position, chunks[1]);

    let notices: Vec<ListItem> = app
        .notices
        .iter()
        .rev()
        .map(|(level, text)| {
            ListItem::new(Line::from(Span::styled(text.as_str(), level_style(*level))))
        })
        .collect();

    let notices_list =
        List::new(notices).block(Block::default().borders(Borders::ALL).title("Notifications"));
    f.render_widget(notices_list, chunks[2]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceTick;
    use rust_decimal_macros::dec;

    #[test]
    fn app_tracks_latest_state() {
        let mut app = App::new("BTCUSDT".into());
        app.on_event(UiEvent::TickerUpdate(PriceTick {
            pair: "BTCUSDT".into(),
            price: dec!(101.5),
            timestamp: 0,
        }));
        let long = Position::long(dec!(100), dec!(1)).unwrap();
        app.on_event(UiEvent::Position(long));
        app.on_event(UiEvent::Decision(Decision::hold(dec!(101.5), Some(dec!(1.5)))));

        assert_eq!(app.current_price, Some(dec!(101.5)));
        assert_eq!(app.position, long);
        assert_eq!(app.last_decision.unwrap().action, Action::Hold);
    }

    #[test]
    fn notices_are_capped() {
        let mut app = App::new("BTCUSDT".into());
        for attempt in 0..(MAX_NOTICES as u32 + 5) {
            app.on_event(UiEvent::Notice(Event::ConnectionRestored { attempt }));
        }
        assert_eq!(app.notices.len(), MAX_NOTICES);
        assert!(app.notices[0].1.ends_with("attempt 5"));
    }

    #[tokio::test]
    async fn ui_sink_forwards_notices() {
        let (tx, mut rx) = mpsc::channel(4);
        UiSink::new(tx)
            .notify(&Event::RetryExhausted { attempts: 1 })
            .await
            .unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            UiEvent::Notice(Event::RetryExhausted { attempts: 1 })
        ));
    }
}
