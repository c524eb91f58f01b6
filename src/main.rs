use anyhow::{Context, Result};
use clap::{Arg, Command};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::{
    io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{error, info};

use babelroom::nostr::{Identity, NostrTransport};
use babelroom::session::RoomContext;
use babelroom::{logging, Config, SessionChannel, TranscriptBuilder};

mod app;
mod ui;

use app::App;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("babelroom")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Terminal chat room over Nostr relays that survives flaky networks")
        .arg(
            Arg::new("room")
                .short('r')
                .long("room")
                .value_name("CODE")
                .required(true)
                .help("Room code to join"),
        )
        .arg(
            Arg::new("nsec")
                .long("nsec")
                .value_name("NSEC_KEY")
                .help("Login with your Nostr private key (nsec format)"),
        )
        .arg(
            Arg::new("nick")
                .short('n')
                .long("nick")
                .value_name("NICKNAME")
                .help("Nickname shown to the room"),
        )
        .arg(
            Arg::new("lang")
                .long("lang")
                .value_name("LANG")
                .help("Your language code, e.g. en or ko"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Config file (defaults to the platform config dir)"),
        )
        .get_matches();

    let config = Config::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
    let log_path = logging::init(&config.log)?;
    info!(log = %log_path.display(), "babelroom starting");

    let room_code = matches
        .get_one::<String>("room")
        .map(|s| s.trim().to_string())
        .context("missing room code")?;

    let identity = match matches.get_one::<String>("nsec") {
        Some(nsec) => Identity::from_nsec(nsec)?,
        None => Identity::ephemeral(),
    };
    let nick = matches
        .get_one::<String>("nick")
        .map(String::as_str)
        .or(config.profile.nickname.as_deref());
    let identity = identity.with_nickname(nick);

    let language = matches
        .get_one::<String>("lang")
        .cloned()
        .unwrap_or_else(|| config.profile.language.clone());

    let context = RoomContext {
        room_code: room_code.clone(),
        user_id: identity.pubkey.clone(),
        nickname: identity.nickname.clone(),
        language,
    };

    let transport = Arc::new(NostrTransport::new(identity.clone(), &config.relays));
    let relay_count = transport.relay_count();
    let session = SessionChannel::open(
        context,
        transport.clone(),
        transport,
        config.session.clone(),
        TranscriptBuilder::local(),
    );

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(session, identity, &room_code, relay_count);
    let res = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        error!(error = ?err, "ui loop failed");
        println!("Error: {:?}", err);
    }

    Ok(())
}

async fn run_app(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, app: &mut App) -> Result<()> {
    let mut last_tick = Instant::now();
    let tick_rate = Duration::from_millis(100);

    loop {
        terminal.draw(|f| ui::draw(f, app))?;

        let timeout_duration = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));

        if event::poll(timeout_duration)? {
            let event = event::read()?;
            app.handle_input(event).await?;
        }

        if last_tick.elapsed() >= tick_rate {
            app.on_tick();
            last_tick = Instant::now();
        }

        if app.should_quit {
            return Ok(());
        }
    }
}
