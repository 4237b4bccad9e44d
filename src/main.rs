use std::error::Error;
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};

use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tasky::api::{AuthMode, Credentials, HttpTaskApi, TaskApi};
use tasky::config::ClientConfig;
use tasky::kanban_board::{Dispatcher, KanbanBoard};
use tasky::session::SessionStore;
use tasky::ui::{run_app, App, Exit};

fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();

    let config = ClientConfig::from_env()?;
    init_tracing(&config)?;
    tracing::info!(api_url = %config.api_url, "Starting tasky");

    let runtime = Runtime::new()?;
    let session = SessionStore::open(&config.session_file)?;
    let api = Arc::new(HttpTaskApi::new(config.api_url.clone(), session.clone()));

    loop {
        if !session.is_authenticated() && !sign_in(&runtime, &api, &session)? {
            return Ok(());
        }

        match run_board(&runtime, Arc::clone(&api), session.clone())? {
            Exit::Quit => return Ok(()),
            Exit::Logout => {
                session.clear()?;
                tracing::info!("Logged out");
                println!("Logged out.");
            }
            Exit::SessionExpired => {
                session.clear()?;
                tracing::info!("Session rejected by the server");
                println!("Your session has expired, please log in again.");
            }
        }
    }
}

fn init_tracing(config: &ClientConfig) -> io::Result<()> {
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasky=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file)),
        )
        .init();
    Ok(())
}

/// Asks for credentials until the server hands out a token.
///
/// Returns `false` when the user gives up.
fn sign_in(
    runtime: &Runtime,
    api: &HttpTaskApi,
    session: &SessionStore,
) -> Result<bool, Box<dyn Error>> {
    loop {
        let mode = match ask("Log in or register? [l/r, q to quit]")?.as_deref() {
            Some("l") | Some("") => AuthMode::Login,
            Some("r") => AuthMode::Register,
            Some("q") | None => return Ok(false),
            Some(other) => {
                println!("Unknown choice {other:?}");
                continue;
            }
        };
        let name = match mode {
            AuthMode::Register => match ask("Full name")? {
                Some(name) if !name.is_empty() => Some(name),
                Some(_) => {
                    println!("A name is required to register");
                    continue;
                }
                None => return Ok(false),
            },
            AuthMode::Login => None,
        };
        let Some(email) = ask("Email")? else {
            return Ok(false);
        };
        let Some(password) = ask("Password")? else {
            return Ok(false);
        };
        let credentials = Credentials {
            name,
            email,
            password,
        };

        match runtime.block_on(api.authenticate(mode, &credentials)) {
            Ok(token) => {
                session.set_token(token)?;
                return Ok(true);
            }
            Err(err) => {
                tracing::warn!(error = %err, "Authentication failed");
                let fallback = match mode {
                    AuthMode::Login => "Invalid credentials",
                    AuthMode::Register => "Failed to create account",
                };
                match err {
                    tasky::api::ApiError::Status { message: None, .. } => println!("{fallback}"),
                    err => println!("{}", err.user_message()),
                }
            }
        }
    }
}

fn ask(message: &str) -> io::Result<Option<String>> {
    print!("{message}: ");
    io::stdout().flush()?;
    let mut input = String::new();
    if io::stdin().lock().read_line(&mut input)? == 0 {
        return Ok(None);
    }
    Ok(Some(input.trim().to_string()))
}

fn run_board(
    runtime: &Runtime,
    api: Arc<HttpTaskApi>,
    session: SessionStore,
) -> Result<Exit, Box<dyn Error>> {
    let api: Arc<dyn TaskApi> = api;
    let (dispatcher, settlements) = Dispatcher::new(Arc::clone(&api), runtime.handle().clone());
    let mut app = App::new(KanbanBoard::new(api), dispatcher, settlements, session);
    app.reload();

    // Terminal setup
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_app(&mut terminal, &mut app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    Ok(result?)
}
