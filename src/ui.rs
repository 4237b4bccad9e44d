use std::io;
use std::path::Path;
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    backend::Backend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
    Frame, Terminal,
};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::kanban_board::{
    BoardSignal, DeleteTask, Dispatcher, EditTask, KanbanBoard, LoadState, MoveTask, Settlement,
};
use crate::session::{SessionStore, Theme};
use crate::task::{parse_deadline, ImageUpload, NewTask, Task, TaskPatch, TaskStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Edit-form answer that empties the description.
const CLEAR: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Quit,
    Logout,
    SessionExpired,
}

pub trait Prompt {
    fn ask(&mut self, message: &str) -> Option<String>;
}

/// Reads answers from stdin with raw mode temporarily off.
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn ask(&mut self, message: &str) -> Option<String> {
        prompt(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub text: String,
    pub is_error: bool,
}

pub struct App {
    pub board: KanbanBoard,
    dispatcher: Dispatcher,
    settlements: UnboundedReceiver<Settlement>,
    session: SessionStore,
    pub selected_status: usize,
    pub selected_task: usize,
    pub status_line: Option<StatusLine>,
}

impl App {
    pub fn new(
        board: KanbanBoard,
        dispatcher: Dispatcher,
        settlements: UnboundedReceiver<Settlement>,
        session: SessionStore,
    ) -> Self {
        Self {
            board,
            dispatcher,
            settlements,
            session,
            selected_status: 0,
            selected_task: 0,
            status_line: None,
        }
    }

    pub fn selected_column(&self) -> TaskStatus {
        TaskStatus::from_index(self.selected_status).unwrap_or(TaskStatus::Pending)
    }

    pub fn selected(&self) -> Option<&Task> {
        self.board
            .get_tasks_by_status(self.selected_column())
            .get(self.selected_task)
            .copied()
    }

    pub fn theme(&self) -> Theme {
        self.session.theme()
    }

    pub fn reload(&mut self) {
        self.dispatcher.load(&mut self.board);
        self.info("Loading tasks...");
    }

    /// Applies every finished request, then reacts to the signals they raised.
    pub fn apply_settlements(&mut self) -> Option<Exit> {
        let mut settled = false;
        while let Ok(settlement) = self.settlements.try_recv() {
            // Failures are reported through the board's signals.
            let _ = settlement.settle(&mut self.board);
            settled = true;
        }
        if settled
            && matches!(self.board.load_state(), LoadState::Ready)
            && self.status_line.as_ref().is_some_and(|s| !s.is_error)
        {
            self.status_line = None;
        }
        self.absorb_signals()
    }

    pub fn handle_key(&mut self, code: KeyCode, prompt: &mut dyn Prompt) -> Option<Exit> {
        match code {
            KeyCode::Char('q') => return Some(Exit::Quit),
            KeyCode::Char('L') => return Some(Exit::Logout),
            KeyCode::Left => {
                if self.selected_status > 0 {
                    self.selected_status -= 1;
                    self.selected_task = 0;
                }
            }
            KeyCode::Right => {
                if self.selected_status < TaskStatus::ALL.len() - 1 {
                    self.selected_status += 1;
                    self.selected_task = 0;
                }
            }
            KeyCode::Up => {
                self.selected_task = self.selected_task.saturating_sub(1);
            }
            KeyCode::Down => {
                let max_tasks = self.board.get_tasks_by_status(self.selected_column()).len();
                if self.selected_task + 1 < max_tasks {
                    self.selected_task += 1;
                }
            }
            KeyCode::Enter | KeyCode::Char('>') => self.move_selected(TaskStatus::next),
            KeyCode::Char('<') => self.move_selected(TaskStatus::prev),
            KeyCode::Char('a') => self.add_task(prompt),
            KeyCode::Char('e') => self.edit_selected(prompt),
            KeyCode::Char('d') => {
                if let Some(task) = self.selected() {
                    let mutation = DeleteTask::new(task.id.clone());
                    let _ = self.dispatcher.submit(&mut self.board, mutation);
                }
            }
            KeyCode::Char('r') => self.reload(),
            KeyCode::Char('t') => {
                let theme = self.session.theme().toggled();
                if let Err(err) = self.session.set_theme(theme) {
                    self.error(err.to_string());
                }
            }
            _ => {}
        }
        self.clamp_selection();
        self.absorb_signals()
    }

    fn move_selected(&mut self, target: fn(TaskStatus) -> TaskStatus) {
        let Some(task) = self.selected() else {
            return;
        };
        let mutation = MoveTask::new(task.id.clone(), target(task.status));
        let _ = self.dispatcher.submit(&mut self.board, mutation);
    }

    fn add_task(&mut self, prompt: &mut dyn Prompt) {
        let Some(title) = prompt.ask("Enter task title") else {
            return;
        };
        let Some(description) = prompt.ask("Enter task description") else {
            return;
        };
        let Some(deadline) = prompt.ask("Enter deadline (YYYY-MM-DD)") else {
            return;
        };
        let deadline = match parse_deadline(&deadline) {
            Ok(deadline) => deadline,
            Err(_) => return self.error(format!("Invalid deadline: {deadline:?}")),
        };
        let mut task = NewTask::new(title, description, self.selected_column(), deadline);

        let image_path = prompt.ask("Image file (leave blank for none)").unwrap_or_default();
        if !image_path.is_empty() {
            match ImageUpload::from_file(Path::new(&image_path)) {
                Ok(image) => task = task.with_image(image),
                Err(err) => return self.error(format!("Cannot read {image_path}: {err}")),
            }
        }

        if self.dispatcher.create(&mut self.board, task).is_ok() {
            self.info("Creating task...");
        }
    }

    fn edit_selected(&mut self, prompt: &mut dyn Prompt) {
        let Some(task) = self.selected() else {
            return;
        };
        let id = task.id.clone();
        let keep = |answer: Option<String>| answer.filter(|a| !a.is_empty());

        let title = keep(prompt.ask("New title (leave blank to keep)"));
        let description = keep(prompt.ask("New description (leave blank to keep, - to clear)"))
            .map(|answer| if answer == CLEAR { String::new() } else { answer });
        let deadline = match keep(prompt.ask("New deadline YYYY-MM-DD (leave blank to keep)")) {
            None => None,
            Some(raw) => match parse_deadline(&raw) {
                Ok(deadline) => Some(deadline),
                Err(_) => return self.error(format!("Invalid deadline: {raw:?}")),
            },
        };

        let patch = TaskPatch {
            title,
            description,
            status: None,
            deadline,
        };
        let _ = self
            .dispatcher
            .submit(&mut self.board, EditTask::new(id, patch));
    }

    fn absorb_signals(&mut self) -> Option<Exit> {
        let mut exit = None;
        for signal in self.board.drain_signals() {
            match signal {
                BoardSignal::Failed(failure) => self.error(failure.to_string()),
                BoardSignal::SessionExpired => exit = Some(Exit::SessionExpired),
            }
        }
        self.clamp_selection();
        exit
    }

    fn clamp_selection(&mut self) {
        let len = self.board.get_tasks_by_status(self.selected_column()).len();
        self.selected_task = self.selected_task.min(len.saturating_sub(1));
    }

    fn info(&mut self, text: impl Into<String>) {
        self.status_line = Some(StatusLine {
            text: text.into(),
            is_error: false,
        });
    }

    fn error(&mut self, text: impl Into<String>) {
        self.status_line = Some(StatusLine {
            text: text.into(),
            is_error: true,
        });
    }
}

struct Palette {
    text: Color,
    muted: Color,
    selected: Color,
    error: Color,
}

fn palette(theme: Theme) -> Palette {
    match theme {
        Theme::Light => Palette {
            text: Color::Black,
            muted: Color::DarkGray,
            selected: Color::Blue,
            error: Color::Red,
        },
        Theme::Dark => Palette {
            text: Color::White,
            muted: Color::Gray,
            selected: Color::Cyan,
            error: Color::LightRed,
        },
    }
}

fn status_color(status: TaskStatus) -> Color {
    match status {
        TaskStatus::Pending => Color::Yellow,
        TaskStatus::InProgress => Color::Blue,
        TaskStatus::Completed => Color::Green,
    }
}

pub fn draw(f: &mut Frame, app: &App) {
    let palette = palette(app.theme());
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(1)])
        .split(f.area());
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(vec![
            Constraint::Percentage(33),
            Constraint::Percentage(33),
            Constraint::Percentage(34),
        ])
        .split(rows[0]);

    for (status, count) in app.board.column_counts() {
        let i = status.index();
        let tasks = app.board.get_tasks_by_status(status);
        let items: Vec<ListItem> = tasks
            .iter()
            .map(|t| {
                ListItem::new(vec![
                    Line::from(Span::styled(
                        t.title.as_str(),
                        Style::default().fg(palette.text).add_modifier(Modifier::BOLD),
                    )),
                    Line::from(Span::styled(
                        t.description.as_str(),
                        Style::default().fg(palette.muted),
                    )),
                    Line::from(Span::raw(format!("Due: {}", t.deadline))),
                ])
            })
            .collect();

        let is_selected = app.selected_status == i;
        let list = List::new(items)
            .block(
                Block::default()
                    .title(Span::styled(
                        format!("{} ({})", status.label(), count),
                        Style::default().fg(status_color(status)),
                    ))
                    .borders(Borders::ALL)
                    .border_style(if is_selected {
                        Style::default().fg(palette.selected)
                    } else {
                        Style::default()
                    }),
            )
            .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
            .highlight_symbol("> ");

        let mut state = ListState::default();
        if is_selected && !tasks.is_empty() {
            state.select(Some(app.selected_task));
        }
        f.render_stateful_widget(list, chunks[i], &mut state);
    }

    let status = match (&app.status_line, app.board.load_state()) {
        (Some(line), _) => Span::styled(
            line.text.as_str(),
            Style::default().fg(if line.is_error {
                palette.error
            } else {
                palette.muted
            }),
        ),
        (None, LoadState::Failed(message)) => Span::styled(
            format!("Could not load tasks: {message} (r to retry)"),
            Style::default().fg(palette.error),
        ),
        (None, _) => Span::styled(
            "a add  e edit  d delete  </> move  r reload  t theme  L logout  q quit",
            Style::default().fg(palette.muted),
        ),
    };
    f.render_widget(Paragraph::new(Line::from(status)), rows[1]);
}

pub fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> io::Result<Exit> {
    loop {
        if let Some(exit) = app.apply_settlements() {
            return Ok(exit);
        }
        terminal.draw(|f| draw(f, app))?;

        if !event::poll(POLL_INTERVAL)? {
            continue;
        }
        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            if let Some(exit) = app.handle_key(key.code, &mut TerminalPrompt) {
                return Ok(exit);
            }
            // The prompts write over the alternate screen.
            if matches!(key.code, KeyCode::Char('a' | 'e')) {
                terminal.clear()?;
            }
        }
    }
}

pub fn prompt(message: &str) -> Option<String> {
    disable_raw_mode().ok();
    println!("{}", message);
    let mut input = String::new();
    let answer = match io::stdin().read_line(&mut input) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(input.trim().to_string()),
    };
    enable_raw_mode().ok();
    answer
}
