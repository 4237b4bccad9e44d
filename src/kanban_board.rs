use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::api::{ApiError, FailureKind, TaskApi};
use crate::task::{NewTask, Task, TaskId, TaskPatch, TaskStatus};

pub type OpResult<T = ()> = Result<T, OperationFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Load,
    Move,
    Edit,
    Delete,
    Create,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Load => "load tasks",
            Self::Move => "move task",
            Self::Edit => "edit task",
            Self::Delete => "delete task",
            Self::Create => "create task",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {message}")]
pub struct OperationFailure {
    pub operation: Operation,
    pub kind: FailureKind,
    pub message: String,
}

impl OperationFailure {
    pub fn new(operation: Operation, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
        }
    }

    fn from_api(operation: Operation, err: &ApiError) -> Self {
        Self::new(operation, err.kind(), err.user_message())
    }

    fn unknown_task(operation: Operation, id: &TaskId) -> Self {
        Self::new(
            operation,
            FailureKind::NotFound,
            format!("Task {id} is not on the board"),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardSignal {
    Failed(OperationFailure),
    SessionExpired,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed(String),
}

#[async_trait]
pub trait Mutation: Send + Sync + 'static {
    type Undo: Send + Sync + 'static;

    fn operation(&self) -> Operation;

    /// Applies the change to `tasks`.
    ///
    /// `Ok(None)` means the change is a no-op and nothing should be sent.
    fn apply(&self, tasks: &mut Vec<Task>) -> OpResult<Option<Self::Undo>>;

    fn revert(&self, undo: Self::Undo, tasks: &mut Vec<Task>);

    async fn confirm(&self, api: &dyn TaskApi) -> Result<(), ApiError>;
}

pub struct Pending<M: Mutation> {
    mutation: M,
    undo: M::Undo,
    generation: u64,
}

impl<M: Mutation> Pending<M> {
    pub fn mutation(&self) -> &M {
        &self.mutation
    }

    pub async fn confirm(&self, api: &dyn TaskApi) -> Result<(), ApiError> {
        self.mutation.confirm(api).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    generation: u64,
}

#[derive(Debug, Clone)]
pub struct PendingCreate {
    task: NewTask,
}

impl PendingCreate {
    pub fn task(&self) -> &NewTask {
        &self.task
    }
}

fn position(tasks: &[Task], id: &TaskId) -> Option<usize> {
    tasks.iter().position(|task| &task.id == id)
}

fn locate(tasks: &[Task], id: &TaskId, operation: Operation) -> OpResult<usize> {
    position(tasks, id).ok_or_else(|| OperationFailure::unknown_task(operation, id))
}

/// Puts `task` back at `index`, removing whatever copy is there now.
fn restore_at(tasks: &mut Vec<Task>, index: usize, task: Task) {
    if let Some(current) = position(tasks, &task.id) {
        tasks.remove(current);
    }
    let index = index.min(tasks.len());
    tasks.insert(index, task);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveTask {
    pub id: TaskId,
    pub status: TaskStatus,
}

impl MoveTask {
    pub fn new(id: TaskId, status: TaskStatus) -> Self {
        Self { id, status }
    }
}

#[derive(Debug)]
pub struct MoveUndo {
    previous_status: TaskStatus,
    index: usize,
}

#[async_trait]
impl Mutation for MoveTask {
    type Undo = MoveUndo;

    fn operation(&self) -> Operation {
        Operation::Move
    }

    fn apply(&self, tasks: &mut Vec<Task>) -> OpResult<Option<MoveUndo>> {
        let index = locate(tasks, &self.id, Operation::Move)?;
        if tasks[index].status == self.status {
            return Ok(None);
        }
        let mut task = tasks.remove(index);
        let previous_status = task.status;
        task.status = self.status;
        tasks.push(task);
        Ok(Some(MoveUndo {
            previous_status,
            index,
        }))
    }

    fn revert(&self, undo: MoveUndo, tasks: &mut Vec<Task>) {
        let Some(current) = position(tasks, &self.id) else {
            tracing::debug!(task_id = %self.id, "Moved task is gone, nothing to revert");
            return;
        };
        let mut task = tasks.remove(current);
        task.status = undo.previous_status;
        restore_at(tasks, undo.index, task);
    }

    async fn confirm(&self, api: &dyn TaskApi) -> Result<(), ApiError> {
        api.update_task(&self.id, &TaskPatch::status(self.status)).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditTask {
    pub id: TaskId,
    pub patch: TaskPatch,
}

impl EditTask {
    pub fn new(id: TaskId, patch: TaskPatch) -> Self {
        Self { id, patch }
    }
}

#[derive(Debug)]
pub struct EditUndo {
    snapshot: Task,
    index: usize,
}

#[async_trait]
impl Mutation for EditTask {
    type Undo = EditUndo;

    fn operation(&self) -> Operation {
        Operation::Edit
    }

    fn apply(&self, tasks: &mut Vec<Task>) -> OpResult<Option<EditUndo>> {
        if self
            .patch
            .title
            .as_ref()
            .is_some_and(|title| title.trim().is_empty())
        {
            return Err(OperationFailure::new(
                Operation::Edit,
                FailureKind::Validation,
                "Title cannot be empty",
            ));
        }
        let index = locate(tasks, &self.id, Operation::Edit)?;
        let snapshot = tasks[index].clone();
        let mut edited = snapshot.clone();
        self.patch.apply_to(&mut edited);
        if edited == snapshot {
            return Ok(None);
        }

        if edited.status == snapshot.status {
            tasks[index] = edited;
        } else {
            tasks.remove(index);
            tasks.push(edited);
        }
        Ok(Some(EditUndo { snapshot, index }))
    }

    fn revert(&self, undo: EditUndo, tasks: &mut Vec<Task>) {
        if position(tasks, &self.id).is_none() {
            tracing::debug!(task_id = %self.id, "Edited task is gone, nothing to revert");
            return;
        }
        restore_at(tasks, undo.index, undo.snapshot);
    }

    async fn confirm(&self, api: &dyn TaskApi) -> Result<(), ApiError> {
        api.update_task(&self.id, &self.patch).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteTask {
    pub id: TaskId,
}

impl DeleteTask {
    pub fn new(id: TaskId) -> Self {
        Self { id }
    }
}

#[derive(Debug)]
pub struct DeleteUndo {
    task: Task,
    index: usize,
    /// Index within the task's own column.
    column_index: usize,
}

#[async_trait]
impl Mutation for DeleteTask {
    type Undo = DeleteUndo;

    fn operation(&self) -> Operation {
        Operation::Delete
    }

    fn apply(&self, tasks: &mut Vec<Task>) -> OpResult<Option<DeleteUndo>> {
        let index = locate(tasks, &self.id, Operation::Delete)?;
        let task = tasks.remove(index);
        let column_index = tasks[..index]
            .iter()
            .filter(|other| other.status == task.status)
            .count();
        Ok(Some(DeleteUndo {
            task,
            index,
            column_index,
        }))
    }

    fn revert(&self, undo: DeleteUndo, tasks: &mut Vec<Task>) {
        if position(tasks, &self.id).is_some() {
            return;
        }
        let status = undo.task.status;
        let index = undo.index.min(tasks.len());
        let before = tasks[..index].iter().filter(|t| t.status == status).count();
        if before == undo.column_index {
            tasks.insert(index, undo.task);
            return;
        }

        let mut seen = 0;
        let mut after_last = None;
        let mut insert_at = None;
        for (index, task) in tasks.iter().enumerate() {
            if task.status != status {
                continue;
            }
            if seen == undo.column_index {
                insert_at = Some(index);
                break;
            }
            seen += 1;
            after_last = Some(index + 1);
        }
        let index = insert_at.or(after_last).unwrap_or(tasks.len());
        tasks.insert(index, undo.task);
    }

    async fn confirm(&self, api: &dyn TaskApi) -> Result<(), ApiError> {
        api.delete_task(&self.id).await
    }
}

pub struct KanbanBoard {
    api: Arc<dyn TaskApi>,
    tasks: Vec<Task>,
    generation: u64,
    load_state: LoadState,
    signals: Vec<BoardSignal>,
}

impl KanbanBoard {
    pub fn new(api: Arc<dyn TaskApi>) -> Self {
        Self {
            api,
            tasks: Vec::new(),
            generation: 0,
            load_state: LoadState::Idle,
            signals: Vec::new(),
        }
    }

    pub fn api(&self) -> Arc<dyn TaskApi> {
        Arc::clone(&self.api)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| &task.id == id)
    }

    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.status == status).collect()
    }

    pub fn column_counts(&self) -> [(TaskStatus, usize); 3] {
        TaskStatus::ALL.map(|status| {
            let count = self.tasks.iter().filter(|t| t.status == status).count();
            (status, count)
        })
    }

    pub fn load_state(&self) -> &LoadState {
        &self.load_state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn drain_signals(&mut self) -> Vec<BoardSignal> {
        std::mem::take(&mut self.signals)
    }

    // ---- load ----

    /// Starts a reload. Mutations begun before this point are no longer
    /// reverted when they fail, though their failures are still reported.
    pub fn begin_load(&mut self) -> LoadTicket {
        self.generation += 1;
        self.load_state = LoadState::Loading;
        LoadTicket {
            generation: self.generation,
        }
    }

    pub fn finish_load(
        &mut self,
        ticket: LoadTicket,
        result: Result<Vec<Task>, ApiError>,
    ) -> OpResult {
        if ticket.generation != self.generation {
            tracing::debug!(
                ticket = ticket.generation,
                current = self.generation,
                "Discarding superseded load"
            );
            return Ok(());
        }
        match result {
            Ok(tasks) => {
                tracing::info!(count = tasks.len(), "Loaded tasks");
                self.tasks = tasks;
                self.load_state = LoadState::Ready;
                Ok(())
            }
            Err(err) => {
                self.tasks.clear();
                let failure = OperationFailure::from_api(Operation::Load, &err);
                self.load_state = LoadState::Failed(failure.message.clone());
                self.fail(failure.clone());
                Err(failure)
            }
        }
    }

    /// On failure the collection is left empty.
    pub async fn load(&mut self) -> OpResult {
        let ticket = self.begin_load();
        let api = self.api();
        let result = api.list_tasks(None).await;
        self.finish_load(ticket, result)
    }

    // ---- optimistic mutations ----

    pub fn begin<M: Mutation>(&mut self, mutation: M) -> OpResult<Option<Pending<M>>> {
        match mutation.apply(&mut self.tasks) {
            Ok(Some(undo)) => Ok(Some(Pending {
                mutation,
                undo,
                generation: self.generation,
            })),
            Ok(None) => Ok(None),
            Err(failure) => {
                self.fail(failure.clone());
                Err(failure)
            }
        }
    }

    pub fn settle<M: Mutation>(
        &mut self,
        pending: Pending<M>,
        result: Result<(), ApiError>,
    ) -> OpResult {
        let operation = pending.mutation.operation();
        let stale = pending.generation != self.generation;
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                // A reload since `begin` already replaced the collection.
                if stale {
                    tracing::debug!(%operation, "Not reverting over a reloaded board");
                } else {
                    pending.mutation.revert(pending.undo, &mut self.tasks);
                }
                let failure = OperationFailure::from_api(operation, &err);
                self.fail(failure.clone());
                Err(failure)
            }
        }
    }

    pub async fn run<M: Mutation>(&mut self, mutation: M) -> OpResult {
        let Some(pending) = self.begin(mutation)? else {
            return Ok(());
        };
        let api = self.api();
        let result = pending.confirm(api.as_ref()).await;
        self.settle(pending, result)
    }

    pub async fn move_task(&mut self, id: &TaskId, status: TaskStatus) -> OpResult {
        self.run(MoveTask::new(id.clone(), status)).await
    }

    pub async fn edit_task(&mut self, id: &TaskId, patch: TaskPatch) -> OpResult {
        self.run(EditTask::new(id.clone(), patch)).await
    }

    pub async fn delete_task(&mut self, id: &TaskId) -> OpResult {
        self.run(DeleteTask::new(id.clone())).await
    }

    // ---- create ----

    pub fn begin_create(&mut self, task: NewTask) -> OpResult<PendingCreate> {
        if task.title.trim().is_empty() {
            let failure = OperationFailure::new(
                Operation::Create,
                FailureKind::Validation,
                "Title is required",
            );
            self.fail(failure.clone());
            return Err(failure);
        }
        Ok(PendingCreate { task })
    }

    /// Inserts the server's record; a reload may already have picked it up.
    pub fn finish_create(
        &mut self,
        pending: PendingCreate,
        result: Result<Task, ApiError>,
    ) -> OpResult<TaskId> {
        match result {
            Ok(task) => {
                let id = task.id.clone();
                if position(&self.tasks, &id).is_none() {
                    tracing::info!(
                        task_id = %id,
                        title = %pending.task.title,
                        status = %task.status,
                        "Created task"
                    );
                    self.tasks.push(task);
                }
                Ok(id)
            }
            Err(err) => {
                let failure = OperationFailure::from_api(Operation::Create, &err);
                self.fail(failure.clone());
                Err(failure)
            }
        }
    }

    pub async fn create_task(&mut self, task: NewTask) -> OpResult<TaskId> {
        let pending = self.begin_create(task)?;
        let api = self.api();
        let result = api.create_task(pending.task()).await;
        self.finish_create(pending, result)
    }

    fn fail(&mut self, failure: OperationFailure) {
        tracing::warn!(
            operation = %failure.operation,
            kind = ?failure.kind,
            message = %failure.message,
            "Board operation failed"
        );
        let expired = failure.kind == FailureKind::Unauthorized;
        self.signals.push(BoardSignal::Failed(failure));
        if expired {
            self.signals.push(BoardSignal::SessionExpired);
        }
    }
}

pub trait Settle: Send {
    fn settle(self: Box<Self>, board: &mut KanbanBoard) -> OpResult;
}

pub type Settlement = Box<dyn Settle>;

struct Confirmation<M: Mutation> {
    pending: Pending<M>,
    result: Result<(), ApiError>,
}

impl<M: Mutation> Settle for Confirmation<M> {
    fn settle(self: Box<Self>, board: &mut KanbanBoard) -> OpResult {
        board.settle(self.pending, self.result)
    }
}

struct LoadCompletion {
    ticket: LoadTicket,
    result: Result<Vec<Task>, ApiError>,
}

impl Settle for LoadCompletion {
    fn settle(self: Box<Self>, board: &mut KanbanBoard) -> OpResult {
        board.finish_load(self.ticket, self.result)
    }
}

struct CreateCompletion {
    pending: PendingCreate,
    result: Result<Task, ApiError>,
}

impl Settle for CreateCompletion {
    fn settle(self: Box<Self>, board: &mut KanbanBoard) -> OpResult {
        board.finish_create(self.pending, self.result).map(|_| ())
    }
}

/// When the receiving side has been dropped the result is discarded.
#[derive(Clone)]
pub struct Dispatcher {
    api: Arc<dyn TaskApi>,
    runtime: Handle,
    tx: mpsc::UnboundedSender<Settlement>,
}

impl Dispatcher {
    pub fn new(
        api: Arc<dyn TaskApi>,
        runtime: Handle,
    ) -> (Self, mpsc::UnboundedReceiver<Settlement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { api, runtime, tx }, rx)
    }

    pub fn load(&self, board: &mut KanbanBoard) {
        let ticket = board.begin_load();
        let api = Arc::clone(&self.api);
        self.deliver(async move {
            let result = api.list_tasks(None).await;
            Box::new(LoadCompletion { ticket, result }) as Settlement
        });
    }

    pub fn submit<M: Mutation>(&self, board: &mut KanbanBoard, mutation: M) -> OpResult {
        let Some(pending) = board.begin(mutation)? else {
            return Ok(());
        };
        tracing::debug!(operation = %pending.mutation.operation(), "Dispatching mutation");
        let api = Arc::clone(&self.api);
        self.deliver(async move {
            let result = pending.confirm(api.as_ref()).await;
            Box::new(Confirmation { pending, result }) as Settlement
        });
        Ok(())
    }

    pub fn create(&self, board: &mut KanbanBoard, task: NewTask) -> OpResult {
        let pending = board.begin_create(task)?;
        let api = Arc::clone(&self.api);
        self.deliver(async move {
            let result = api.create_task(pending.task()).await;
            Box::new(CreateCompletion { pending, result }) as Settlement
        });
        Ok(())
    }

    fn deliver<F>(&self, request: F)
    where
        F: std::future::Future<Output = Settlement> + Send + 'static,
    {
        let tx = self.tx.clone();
        self.runtime.spawn(async move {
            let settlement = request.await;
            if tx.send(settlement).is_err() {
                tracing::debug!("Board is gone, discarding response");
            }
        });
    }
}
