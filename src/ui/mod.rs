use chrono::Local;
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
    Frame,
};

use crate::app::{App, InputMode};
use babelroom::session::ConnectionState;
use babelroom::transcript::{DeliveryState, Message, MessageKind};

pub fn draw(f: &mut Frame<'_>, app: &App) {
    let size = f.size();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Title bar
            Constraint::Min(0),    // Main content
            Constraint::Length(3), // Input area
        ])
        .split(size);

    draw_title_bar(f, app, chunks[0]);

    let main_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(72), // Transcript
            Constraint::Percentage(28), // Info + status
        ])
        .split(chunks[1]);

    draw_transcript(f, app, main_chunks[0]);
    draw_info_panel(f, app, main_chunks[1]);
    draw_input_area(f, app, chunks[2]);
}

fn state_style(state: ConnectionState) -> Style {
    match state {
        ConnectionState::Connected => Style::default().fg(Color::Green),
        ConnectionState::Connecting => Style::default().fg(Color::Yellow),
        ConnectionState::Disconnected | ConnectionState::Closed => Style::default().fg(Color::Red),
    }
}

fn state_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Connected => "connected",
        ConnectionState::Connecting => "connecting...",
        ConnectionState::Disconnected => "disconnected, retrying",
        ConnectionState::Closed => "closed",
    }
}

fn draw_title_bar(f: &mut Frame, app: &App, area: Rect) {
    let title = format!(
        " Babelroom | {} | #{} | {} ",
        app.identity.nickname,
        app.room_code,
        state_label(app.state)
    );

    let title_block = Block::default()
        .borders(Borders::ALL)
        .style(state_style(app.state))
        .title(" Babelroom ");

    let title_paragraph = Paragraph::new(title)
        .block(title_block)
        .alignment(Alignment::Center);

    f.render_widget(title_paragraph, area);
}

/// Turn one transcript entry into display lines, honouring the grouping
/// annotations computed by the transcript builder.
pub fn message_lines(message: &Message) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let local = message.timestamp.with_timezone(&Local);

    if message.is_first_of_day() {
        lines.push(Line::from(Span::styled(
            format!("──── {} ────", local.format("%A, %B %-d, %Y")),
            Style::default().fg(Color::DarkGray),
        )));
    }

    if message.kind == MessageKind::System {
        lines.push(Line::from(Span::styled(
            format!("        * {}", message.text),
            Style::default().fg(Color::Gray).add_modifier(Modifier::ITALIC),
        )));
        return lines;
    }

    let time = if message.show_timestamp() {
        format!("[{}] ", local.format("%H:%M"))
    } else {
        " ".repeat(8)
    };
    let nick_color = match message.kind {
        MessageKind::SentByMe => Color::Green,
        _ => Color::Magenta,
    };
    let nick = if message.show_avatar() {
        format!("<{}> ", message.sender_name)
    } else {
        " ".repeat(message.sender_name.chars().count() + 3)
    };

    let mut spans = vec![
        Span::styled(time, Style::default().fg(Color::Gray)),
        Span::styled(nick, Style::default().fg(nick_color)),
        Span::raw(message.display_text()),
    ];
    match message.delivery_state() {
        DeliveryState::Pending => spans.push(Span::styled(" …", Style::default().fg(Color::Yellow))),
        DeliveryState::Failed => spans.push(Span::styled(
            " ✗ not delivered",
            Style::default().fg(Color::Red),
        )),
        DeliveryState::Sent => {}
    }
    lines.push(Line::from(spans));

    if message.kind == MessageKind::ReceivedFromOther && message.translated_text.is_some() {
        lines.push(Line::from(Span::styled(
            format!("{}↳ {}", " ".repeat(10), message.text),
            Style::default().fg(Color::DarkGray),
        )));
    }

    lines
}

fn draw_transcript(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(format!(" Room #{} ", app.room_code))
        .style(Style::default().fg(Color::Cyan));

    let inner = block.inner(area);
    f.render_widget(block, area);

    let mut lines: Vec<Line> = app.transcript.iter().flat_map(|m| message_lines(m)).collect();

    if lines.is_empty() {
        lines.push(Line::from(Span::styled(
            "No messages yet. Type a message and press Enter to send.",
            Style::default().fg(Color::Gray).add_modifier(Modifier::ITALIC),
        )));
    }

    // Stick to the newest line unless the user scrolled up.
    let height = inner.height as usize;
    let top = lines
        .len()
        .saturating_sub(height)
        .saturating_sub(app.scroll_offset);

    let transcript_widget = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .scroll((top.min(u16::MAX as usize) as u16, 0));

    f.render_widget(transcript_widget, inner);
}

fn draw_info_panel(f: &mut Frame<'_>, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6), // Identity info
            Constraint::Length(7), // Connection info
            Constraint::Min(0),    // Status messages
        ])
        .split(area);

    let identity_block = Block::default()
        .borders(Borders::ALL)
        .title(" Identity ")
        .style(Style::default().fg(Color::Blue));

    let identity_text = vec![
        Line::from(vec![
            Span::raw("Nick: "),
            Span::styled(&app.identity.nickname, Style::default().fg(Color::Green)),
        ]),
        Line::from(vec![
            Span::raw("Type: "),
            Span::styled(
                if app.identity.is_ephemeral { "ephemeral" } else { "authenticated" },
                Style::default().fg(if app.identity.is_ephemeral { Color::Yellow } else { Color::Green }),
            ),
        ]),
        Line::from(vec![
            Span::raw("Pubkey: "),
            Span::styled(&app.identity.pubkey[..16], Style::default().fg(Color::Gray)),
            Span::styled("...", Style::default().fg(Color::Gray)),
        ]),
    ];

    f.render_widget(Paragraph::new(identity_text).block(identity_block), chunks[0]);

    let connection_block = Block::default()
        .borders(Borders::ALL)
        .title(" Connection ")
        .style(Style::default().fg(Color::Blue));

    let failed = app.failed_messages().len();
    let connection_text = vec![
        Line::from(vec![
            Span::raw("Status: "),
            Span::styled(state_label(app.state), state_style(app.state)),
        ]),
        Line::from(vec![
            Span::raw("Relays: "),
            Span::styled(app.relay_count.to_string(), Style::default().fg(Color::Cyan)),
        ]),
        Line::from(vec![
            Span::raw("Messages: "),
            Span::styled(app.transcript.len().to_string(), Style::default().fg(Color::Cyan)),
        ]),
        Line::from(vec![
            Span::raw("Pending: "),
            Span::styled(app.pending_count().to_string(), Style::default().fg(Color::Yellow)),
            Span::raw("  Failed: "),
            Span::styled(
                failed.to_string(),
                Style::default().fg(if failed > 0 { Color::Red } else { Color::Gray }),
            ),
        ]),
    ];

    f.render_widget(Paragraph::new(connection_text).block(connection_block), chunks[1]);

    let status_block = Block::default()
        .borders(Borders::ALL)
        .title(" Status ")
        .style(Style::default().fg(Color::Blue));

    let visible = chunks[2].height.saturating_sub(2) as usize;
    let start = app.status_messages.len().saturating_sub(visible);
    let items: Vec<ListItem> = app.status_messages[start..]
        .iter()
        .map(|line| ListItem::new(line.as_str()).style(Style::default().fg(Color::White)))
        .collect();

    f.render_widget(List::new(items).block(status_block), chunks[2]);
}

fn draw_input_area(f: &mut Frame, app: &App, area: Rect) {
    let input_style = match app.input_mode {
        InputMode::Normal => Style::default().fg(Color::White),
        InputMode::Editing => Style::default().fg(Color::Green),
    };

    let mode_indicator = match app.input_mode {
        InputMode::Normal => "[NORMAL] Press 'i' to type, 'q' to leave",
        InputMode::Editing => "[INPUT] ESC=normal, ENTER=send, /help for commands",
    };

    let input_block = Block::default()
        .borders(Borders::ALL)
        .title(mode_indicator)
        .style(input_style);

    let input_text = if app.input_mode == InputMode::Editing {
        app.input.as_str()
    } else {
        ""
    };

    let input_paragraph = Paragraph::new(input_text)
        .block(input_block)
        .wrap(Wrap { trim: false });

    f.render_widget(input_paragraph, area);

    if app.input_mode == InputMode::Editing {
        f.set_cursor(area.x + app.cursor_position as u16 + 1, area.y + 1);
    }
}
