//! Progress surface shared by every download job.
//!
//! [`ProgressSurface`] is a thread-safe task registry. Jobs register a task,
//! advance it as bytes arrive and hide it when done. The
//! governor reads the aggregate speed of visible tasks to enforce the global
//! speed limit, so the registry works the same whether or not anything is drawn.
//!
//! Rendering goes through an [`indicatif::MultiProgress`]. A surface built
//! with [`ProgressSurface::hidden`] keeps all bookkeeping but draws nothing.
//!
//! # Example
//!
//! ```
//! use mediadl_core::progress::{ProgressSurface, TaskSpec, TaskUpdate};
//!
//! let progress = ProgressSurface::hidden();
//! let id = progress.add_task(TaskSpec::new("clip.mp4").with_total(100.0));
//! progress.update(id, TaskUpdate::new().advance(40.0));
//!
//! let snapshot = progress.task(id).unwrap();
//! assert_eq!(snapshot.completed, 40.0);
//! assert!(!snapshot.finished);
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::debug;

use crate::ffmpeg::ToolError;

/// Window over which task speed is estimated.
const SPEED_WINDOW: Duration = Duration::from_secs(10);

/// Rendered descriptions longer than this are cut and suffixed with `...`.
pub const DESCRIPTION_MAX_CHARS: usize = 33;

const BAR_TEMPLATE: &str =
    "{msg:36} {bar:30.cyan/blue} {percent:>3}% {bytes:>10}/{total_bytes:<10} {bytes_per_sec:>12} {eta}";

/// Identifier of a progress task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Action run once after every path of a job has been produced.
///
/// Receives the produced paths in the order the job created them.
pub type UpperAction = Box<dyn FnOnce(Vec<PathBuf>) -> BoxFuture<'static, Result<(), ToolError>> + Send>;

/// Parameters for a new task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    description: String,
    total: Option<f64>,
    visible: bool,
    fields: HashMap<String, String>,
}

impl TaskSpec {
    /// A visible task without a known total.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            total: None,
            visible: true,
            fields: HashMap::new(),
        }
    }

    /// Sets the expected total.
    #[must_use]
    pub fn with_total(mut self, total: f64) -> Self {
        self.total = Some(total);
        self
    }

    /// Registers the task without showing it.
    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    /// Attaches a free-form field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// A partial update to a task. Unset members are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    total: Option<f64>,
    add_total: Option<f64>,
    completed: Option<f64>,
    advance: Option<f64>,
    visible: Option<bool>,
    description: Option<String>,
    fields: HashMap<String, String>,
}

impl TaskUpdate {
    /// An empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the total.
    #[must_use]
    pub fn total(mut self, total: f64) -> Self {
        self.total = Some(total);
        self
    }

    /// Adds to the total (an unknown total counts as zero).
    #[must_use]
    pub fn add_total(mut self, amount: f64) -> Self {
        self.add_total = Some(amount);
        self
    }

    /// Replaces the completed amount.
    #[must_use]
    pub fn completed(mut self, completed: f64) -> Self {
        self.completed = Some(completed);
        self
    }

    /// Adds to the completed amount.
    #[must_use]
    pub fn advance(mut self, amount: f64) -> Self {
        self.advance = Some(amount);
        self
    }

    /// Shows or hides the task.
    #[must_use]
    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = Some(visible);
        self
    }

    /// Replaces the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets a free-form field.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    /// Task description as registered (untruncated).
    pub description: String,
    /// Expected total, when known.
    pub total: Option<f64>,
    /// Amount completed so far.
    pub completed: f64,
    /// Whether `completed` reached a known `total`.
    pub finished: bool,
    /// Estimated bytes per second over the last 10 seconds.
    pub speed: Option<f64>,
    /// Whether the task is shown.
    pub visible: bool,
    /// Free-form fields.
    pub fields: HashMap<String, String>,
    /// Whether a post-completion action is attached.
    pub has_upper: bool,
}

#[derive(Debug)]
struct TaskState {
    description: String,
    total: Option<f64>,
    completed: f64,
    visible: bool,
    fields: HashMap<String, String>,
    samples: VecDeque<(Instant, f64)>,
}

impl TaskState {
    fn finished(&self) -> bool {
        self.total.is_some_and(|total| self.completed >= total)
    }

    fn record_sample(&mut self, now: Instant) {
        self.samples.push_back((now, self.completed));
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > SPEED_WINDOW && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Estimates speed from `(instant, completed)` samples.
///
/// Returns `None` with fewer than two samples or a zero time span.
fn speed_from_samples(samples: &VecDeque<(Instant, f64)>) -> Option<f64> {
    let (first_at, first_value) = *samples.front()?;
    let (last_at, last_value) = *samples.back()?;
    let elapsed = last_at.duration_since(first_at).as_secs_f64();
    if samples.len() < 2 || elapsed <= 0.0 {
        return None;
    }
    Some(((last_value - first_value) / elapsed).max(0.0))
}

/// Cuts a description to [`DESCRIPTION_MAX_CHARS`] characters plus `...`.
#[must_use]
pub fn truncate_description(description: &str) -> String {
    if description.chars().count() <= DESCRIPTION_MAX_CHARS {
        return description.to_string();
    }
    let head: String = description.chars().take(DESCRIPTION_MAX_CHARS).collect();
    format!("{head}...")
}

/// Thread-safe registry of progress tasks with an optional terminal renderer.
pub struct ProgressSurface {
    next_id: AtomicU64,
    tasks: DashMap<TaskId, TaskState>,
    uppers: Mutex<HashMap<TaskId, UpperAction>>,
    multi: MultiProgress,
    bars: DashMap<TaskId, ProgressBar>,
    renders: bool,
    started: AtomicBool,
}

impl fmt::Debug for ProgressSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSurface")
            .field("tasks", &self.tasks.len())
            .field("renders", &self.renders)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for ProgressSurface {
    fn default() -> Self {
        Self::hidden()
    }
}

impl ProgressSurface {
    /// A surface that draws bars on stderr once [`start`](Self::start) is called.
    #[must_use]
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr(), true)
    }

    /// A surface that tracks tasks but never draws.
    #[must_use]
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden(), false)
    }

    fn with_target(target: ProgressDrawTarget, renders: bool) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            tasks: DashMap::new(),
            uppers: Mutex::new(HashMap::new()),
            multi: MultiProgress::with_draw_target(target),
            bars: DashMap::new(),
            renders,
            started: AtomicBool::new(false),
        }
    }

    /// Starts rendering visible tasks.
    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        let ids: Vec<TaskId> = self.tasks.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.sync_bar(id);
        }
    }

    /// Stops rendering and clears every bar.
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        for entry in &self.bars {
            entry.value().finish_and_clear();
        }
        self.bars.clear();
        if let Err(error) = self.multi.clear() {
            debug!(error = %error, "failed to clear progress bars");
        }
    }

    /// Registers a task and returns its id.
    pub fn add_task(&self, spec: TaskSpec) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut state = TaskState {
            description: spec.description,
            total: spec.total,
            completed: 0.0,
            visible: spec.visible,
            fields: spec.fields,
            samples: VecDeque::new(),
        };
        state.record_sample(Instant::now());
        self.tasks.insert(id, state);
        self.sync_bar(id);
        id
    }

    /// Applies an update. Unknown ids are ignored.
    pub fn update(&self, id: TaskId, update: TaskUpdate) {
        {
            let Some(mut state) = self.tasks.get_mut(&id) else {
                debug!(task = %id, "update for unknown task ignored");
                return;
            };
            if let Some(total) = update.total {
                state.total = Some(total);
            }
            if let Some(amount) = update.add_total {
                state.total = Some(state.total.unwrap_or(0.0) + amount);
            }
            let progressed = update.completed.is_some() || update.advance.is_some();
            if let Some(completed) = update.completed {
                state.completed = completed;
            }
            if let Some(amount) = update.advance {
                state.completed += amount;
            }
            if progressed {
                state.record_sample(Instant::now());
            }
            if let Some(visible) = update.visible {
                state.visible = visible;
            }
            if let Some(description) = update.description {
                state.description = description;
            }
            state.fields.extend(update.fields);
        }
        self.sync_bar(id);
    }

    /// Returns a snapshot of the task, if it exists.
    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<TaskSnapshot> {
        let state = self.tasks.get(&id)?;
        let has_upper = self.lock_uppers().contains_key(&id);
        Some(TaskSnapshot {
            description: state.description.clone(),
            total: state.total,
            completed: state.completed,
            finished: state.finished(),
            speed: speed_from_samples(&state.samples),
            visible: state.visible,
            fields: state.fields.clone(),
            has_upper,
        })
    }

    /// Sum of speeds of visible, unfinished tasks; `None` when there are none.
    #[must_use]
    pub fn active_speed(&self) -> Option<f64> {
        let mut any = false;
        let mut sum = 0.0;
        for entry in &self.tasks {
            let state = entry.value();
            if state.visible && !state.finished() {
                any = true;
                sum += speed_from_samples(&state.samples).unwrap_or(0.0);
            }
        }
        any.then_some(sum)
    }

    /// Number of visible, unfinished tasks.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| entry.value().visible && !entry.value().finished())
            .count()
    }

    /// Attaches the post-completion action of a task, replacing any previous one.
    pub fn set_upper(&self, id: TaskId, action: UpperAction) {
        self.lock_uppers().insert(id, action);
    }

    /// Detaches and returns the post-completion action of a task.
    #[must_use]
    pub fn take_upper(&self, id: TaskId) -> Option<UpperAction> {
        self.lock_uppers().remove(&id)
    }

    /// Whether a post-completion action is attached.
    #[must_use]
    pub fn has_upper(&self, id: TaskId) -> bool {
        self.lock_uppers().contains_key(&id)
    }

    fn lock_uppers(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, UpperAction>> {
        self.uppers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sync_bar(&self, id: TaskId) {
        if !self.renders || !self.started.load(Ordering::SeqCst) {
            return;
        }
        let Some(state) = self.tasks.get(&id) else {
            return;
        };
        if !state.visible {
            drop(state);
            if let Some((_, bar)) = self.bars.remove(&id) {
                bar.finish_and_clear();
                self.multi.remove(&bar);
            }
            return;
        }
        let bar = self
            .bars
            .entry(id)
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(0));
                bar.set_style(
                    ProgressStyle::with_template(BAR_TEMPLATE)
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar
            })
            .clone();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            bar.set_length(state.total.unwrap_or(0.0).max(0.0) as u64);
            bar.set_position(state.completed.max(0.0) as u64);
        }
        bar.set_message(truncate_description(&state.description));
    }
}
