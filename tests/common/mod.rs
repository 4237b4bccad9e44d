#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;

use tasky::api::{ApiError, TaskApi};
use tasky::task::{NewTask, Task, TaskId, TaskPatch, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(Option<TaskStatus>),
    Create(String),
    Update(TaskId, TaskPatch),
    Delete(TaskId),
}

#[derive(Default)]
struct ServerState {
    tasks: Vec<Task>,
    next_id: u64,
    failures: VecDeque<(u16, Option<String>)>,
    calls: Vec<Call>,
}

/// Task server kept in a `Vec`, with scripted failures.
#[derive(Default)]
pub struct InMemoryTaskApi {
    state: Mutex<ServerState>,
}

impl InMemoryTaskApi {
    pub fn with_tasks(tasks: Vec<Task>) -> Arc<Self> {
        let api = Self::default();
        api.state.lock().unwrap().tasks = tasks;
        Arc::new(api)
    }

    /// Makes the next call fail with `status` and an optional `message` body.
    pub fn fail_next(&self, status: u16, message: Option<&str>) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push_back((status, message.map(str::to_owned)));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn server_tasks(&self) -> Vec<Task> {
        self.state.lock().unwrap().tasks.clone()
    }

    fn begin(&self, call: Call) -> Result<std::sync::MutexGuard<'_, ServerState>, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        match state.failures.pop_front() {
            Some((status, message)) => Err(ApiError::Status { status, message }),
            None => Ok(state),
        }
    }
}

fn not_found() -> ApiError {
    ApiError::status(404, "Task not found")
}

#[async_trait]
impl TaskApi for InMemoryTaskApi {
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, ApiError> {
        let state = self.begin(Call::List(status))?;
        Ok(state
            .tasks
            .iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect())
    }

    async fn create_task(&self, task: &NewTask) -> Result<Task, ApiError> {
        let mut state = self.begin(Call::Create(task.title.clone()))?;
        state.next_id += 1;
        let created = Task {
            id: TaskId::new(format!("srv-{}", state.next_id)),
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status,
            deadline: task.deadline,
            image: task
                .image
                .as_ref()
                .map(|image| format!("uploads/{}", image.file_name)),
        };
        state.tasks.push(created.clone());
        Ok(created)
    }

    async fn update_task(&self, id: &TaskId, patch: &TaskPatch) -> Result<(), ApiError> {
        let mut state = self.begin(Call::Update(id.clone(), patch.clone()))?;
        let task = state
            .tasks
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or_else(not_found)?;
        patch.apply_to(task);
        Ok(())
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), ApiError> {
        let mut state = self.begin(Call::Delete(id.clone()))?;
        let before = state.tasks.len();
        state.tasks.retain(|t| &t.id != id);
        if state.tasks.len() == before {
            return Err(not_found());
        }
        Ok(())
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn task(id: &str, status: TaskStatus) -> Task {
    Task {
        id: TaskId::new(id),
        title: format!("Task {id}"),
        description: format!("about {id}"),
        status,
        deadline: date(2025, 4, 1),
        image: None,
    }
}

pub fn id(raw: &str) -> TaskId {
    TaskId::new(raw)
}
