pub mod api;
pub mod config;
pub mod kanban_board;
pub mod session;
pub mod task;
pub mod ui;
