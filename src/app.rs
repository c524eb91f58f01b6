use anyhow::Result;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind};
use tokio::sync::broadcast::{self, error::TryRecvError};

use babelroom::nostr::Identity;
use babelroom::session::{ConnectionState, SessionHandle, SessionNotice};
use babelroom::transcript::{DeliveryState, Nonce, Snapshot, TranscriptReader};

#[derive(Debug, Clone, PartialEq)]
pub enum InputMode {
    Normal,
    Editing,
}

pub struct App {
    pub should_quit: bool,
    pub state: ConnectionState,
    pub input_mode: InputMode,
    pub input: String,
    /// Cursor position in characters, not bytes.
    pub cursor_position: usize,
    /// Lines scrolled up from the newest message.
    pub scroll_offset: usize,

    pub identity: Identity,
    pub room_code: String,
    pub relay_count: usize,

    pub transcript: Snapshot,
    pub status_messages: Vec<String>,

    session: SessionHandle,
    reader: TranscriptReader,
    notices: broadcast::Receiver<SessionNotice>,
}

impl App {
    pub fn new(session: SessionHandle, identity: Identity, room_code: &str, relay_count: usize) -> Self {
        let reader = session.reader();
        let notices = session.notices();
        let mut app = Self {
            should_quit: false,
            state: session.state(),
            input_mode: InputMode::Editing,
            input: String::new(),
            cursor_position: 0,
            scroll_offset: 0,

            identity,
            room_code: room_code.to_string(),
            relay_count,

            transcript: reader.snapshot(),
            status_messages: Vec::new(),

            session,
            reader,
            notices,
        };

        app.add_status_message(format!(
            "Babelroom - entering room #{} as {} ({})",
            app.room_code,
            app.identity.nickname,
            if app.identity.is_ephemeral { "ephemeral" } else { "authenticated" }
        ));
        app
    }

    pub async fn handle_input(&mut self, event: Event) -> Result<()> {
        if let Event::Key(key) = event {
            if key.kind == KeyEventKind::Press {
                self.handle_key_event(key).await?;
            }
        }
        Ok(())
    }

    async fn handle_key_event(&mut self, key: KeyEvent) -> Result<()> {
        match self.input_mode {
            InputMode::Normal => match key.code {
                KeyCode::Char('q') => self.quit().await,
                KeyCode::Char('i') => self.input_mode = InputMode::Editing,
                KeyCode::Up => self.scroll_offset += 1,
                KeyCode::Down => self.scroll_offset = self.scroll_offset.saturating_sub(1),
                KeyCode::PageUp => self.scroll_offset += 10,
                KeyCode::PageDown => self.scroll_offset = self.scroll_offset.saturating_sub(10),
                KeyCode::End => self.scroll_offset = 0,
                _ => {}
            },
            InputMode::Editing => match key.code {
                KeyCode::Enter => {
                    self.submit_input().await?;
                    self.input.clear();
                    self.cursor_position = 0;
                }
                KeyCode::Char(c) => {
                    let at = self.byte_index();
                    self.input.insert(at, c);
                    self.cursor_position += 1;
                }
                KeyCode::Backspace => {
                    if self.cursor_position > 0 {
                        self.cursor_position -= 1;
                        let at = self.byte_index();
                        self.input.remove(at);
                    }
                }
                KeyCode::Delete => {
                    if self.cursor_position < self.input.chars().count() {
                        let at = self.byte_index();
                        self.input.remove(at);
                    }
                }
                KeyCode::Left => self.cursor_position = self.cursor_position.saturating_sub(1),
                KeyCode::Right => {
                    self.cursor_position = (self.cursor_position + 1).min(self.input.chars().count());
                }
                KeyCode::Home => self.cursor_position = 0,
                KeyCode::End => self.cursor_position = self.input.chars().count(),
                KeyCode::Up => self.scroll_offset += 1,
                KeyCode::Down => self.scroll_offset = self.scroll_offset.saturating_sub(1),
                KeyCode::Esc => self.input_mode = InputMode::Normal,
                _ => {}
            },
        }
        Ok(())
    }

    fn byte_index(&self) -> usize {
        self.input
            .char_indices()
            .nth(self.cursor_position)
            .map(|(i, _)| i)
            .unwrap_or(self.input.len())
    }

    async fn submit_input(&mut self) -> Result<()> {
        let input = self.input.trim().to_string();
        if input.is_empty() {
            return Ok(());
        }

        if input.starts_with('/') {
            self.handle_command(&input).await?;
        } else if let Err(e) = self.session.send(input).await {
            self.add_status_message(format!("Cannot send: {}", e));
        } else {
            self.scroll_offset = 0;
        }
        Ok(())
    }

    async fn handle_command(&mut self, input: &str) -> Result<()> {
        let parts: Vec<&str> = input[1..].split_whitespace().collect();
        if parts.is_empty() {
            return Ok(());
        }

        match parts[0].to_lowercase().as_str() {
            "resend" | "r" => {
                let nth = match parts.get(1).map(|n| n.parse::<usize>()) {
                    None => 1,
                    Some(Ok(n)) if n > 0 => n,
                    Some(_) => {
                        self.add_status_message("Usage: /resend [n]".to_string());
                        return Ok(());
                    }
                };
                self.resend(nth).await;
            }
            "reconnect" => {
                if let Err(e) = self.session.reconnect().await {
                    self.add_status_message(format!("Cannot reconnect: {}", e));
                }
            }
            "code" => self.copy_room_code(),
            "help" | "h" | "commands" => self.show_help(),
            "quit" | "q" | "exit" | "leave" => self.quit().await,
            _ => {
                self.add_status_message(format!(
                    "Unknown command: {}. Type /help for available commands.",
                    parts[0]
                ));
            }
        }
        Ok(())
    }

    /// Failed messages, newest first.
    pub fn failed_messages(&self) -> Vec<Nonce> {
        self.transcript
            .iter()
            .rev()
            .filter(|m| m.is_optimistic() && m.delivery_state() == DeliveryState::Failed)
            .filter_map(|m| m.client_nonce.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.transcript
            .iter()
            .filter(|m| m.delivery_state() == DeliveryState::Pending)
            .count()
    }

    async fn resend(&mut self, nth: usize) {
        let Some(nonce) = self.failed_messages().into_iter().nth(nth - 1) else {
            self.add_status_message("No failed message to resend".to_string());
            return;
        };
        if let Err(e) = self.session.resend(nonce).await {
            self.add_status_message(format!("Cannot resend: {}", e));
        }
    }

    fn copy_room_code(&mut self) {
        let copied = arboard::Clipboard::new().and_then(|mut clipboard| clipboard.set_text(self.room_code.clone()));
        match copied {
            Ok(()) => self.add_status_message(format!("Room code {} copied to clipboard", self.room_code)),
            Err(e) => self.add_status_message(format!("Clipboard unavailable: {}", e)),
        }
    }

    fn show_help(&mut self) {
        let help_text = [
            "Babelroom Commands:",
            "/resend [n] - Retry the most recent (or n-th most recent) failed message",
            "/reconnect - Drop the connection and connect again",
            "/code - Copy the room code to the clipboard",
            "/help - Show this help",
            "/quit, /leave - Leave the room and exit",
            "",
            "Keyboard: Esc=normal mode, i=input mode, q=quit (normal mode)",
            "Up/Down=scroll, Page Up/Down=fast scroll, End=jump to newest",
        ];
        for line in help_text {
            self.add_status_message(line.to_string());
        }
    }

    async fn quit(&mut self) {
        // Already closed is fine.
        let _ = self.session.close().await;
        self.should_quit = true;
    }

    pub fn add_status_message(&mut self, message: String) {
        self.status_messages.push(format!(
            "[{}] {}",
            chrono::Local::now().format("%H:%M:%S"),
            message
        ));
        if self.status_messages.len() > 200 {
            self.status_messages.remove(0);
        }
    }

    pub fn on_tick(&mut self) {
        loop {
            match self.notices.try_recv() {
                Ok(notice) => {
                    let text = self.describe_notice(&notice);
                    self.add_status_message(text);
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        self.state = self.session.state();
        self.transcript = self.reader.snapshot();
    }

    fn describe_notice(&self, notice: &SessionNotice) -> String {
        match notice {
            SessionNotice::Connected => format!("Joined room #{}", self.room_code),
            SessionNotice::Reconnected => "Reconnected, catching up on missed messages".to_string(),
            SessionNotice::ConnectFailing { attempts, error } => {
                format!("Still unable to connect after {} attempts ({}), retrying", attempts, error)
            }
            SessionNotice::MessagesMayBeMissing(error) => {
                format!("Some messages may be missing ({})", error)
            }
            SessionNotice::SendFailed { error, .. } => {
                format!("Message not delivered ({}). Use /resend to retry.", error)
            }
        }
    }
}
