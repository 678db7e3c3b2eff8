// ============================================================================
// IMAGE CONTROLLER — one image, its history, its in-flight edit, its caches
// ============================================================================
//
// State machine:
//
//   Idle ──modify()──▶ Editing ──drain──▶ Idle
//
// Every public entry point that needs an authoritative image drains first:
// the pending task is joined, its output is committed (edit or replacement)
// or dropped (failure), and the render and histogram caches are marked
// dirty.  Only the owning thread ever writes `image`; workers receive a
// shared `Arc` of the committed buffer and hand back a fresh one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::components::history::{CommandHistory, UndoRecord};
use crate::config::EngineSettings;
use crate::error::EditError;
use crate::io::{self, SaveParams};
use crate::progress::{AtomicProgress, ProgressState};
use crate::raster::{self, Image};
use crate::stats::{HistogramParams, ImageStatistics};
use crate::task::AsyncTask;
use crate::texture::{RenderCache, Texture};

// ============================================================================
// COMMANDS
// ============================================================================

/// What a command body hands back to the controller.
#[derive(Debug)]
pub struct CommandOutput {
    pub image: Image,
    /// `None` marks a replacement (e.g. a load): history is reset instead
    /// of extended.
    pub undo: Option<UndoRecord>,
}

impl CommandOutput {
    pub fn edit(image: Image, undo: UndoRecord) -> Self {
        Self {
            image,
            undo: Some(undo),
        }
    }

    pub fn replace(image: Image) -> Self {
        Self { image, undo: None }
    }
}

pub type CommandResult = Result<CommandOutput, EditError>;

/// Wrap a plain image → image function into a command that records the
/// input as a full snapshot.
pub fn snapshot_command<F>(
    description: impl Into<String>,
    f: F,
) -> impl FnOnce(Arc<Image>, &AtomicProgress) -> CommandResult + Send + 'static
where
    F: FnOnce(&Image, &AtomicProgress) -> Result<Image, EditError> + Send + 'static,
{
    let description = description.into();
    move |img: Arc<Image>, progress: &AtomicProgress| {
        let out = f(&img, progress)?;
        let before = Arc::try_unwrap(img).unwrap_or_else(|shared| (*shared).clone());
        Ok(CommandOutput::edit(
            out,
            UndoRecord::full_snapshot(description, before),
        ))
    }
}

/// Result of a drain, replacing a "modify done" callback.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    /// Nothing was in flight.
    NothingPending,
    /// An edit was committed and pushed onto the history.
    Edited(String),
    /// The image was replaced and the history reset.
    Replaced,
    /// The task failed, was cancelled or produced an empty image.  Image
    /// and history are exactly as before.
    Failed(EditError),
}

impl DrainOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, DrainOutcome::Edited(_) | DrainOutcome::Replaced)
    }
}

struct PendingEdit {
    task: AsyncTask<CommandResult>,
    description: String,
    started: Instant,
    /// Set for loads; becomes the controller's path on success.
    source_path: Option<PathBuf>,
}

enum EditState {
    Idle,
    Editing(PendingEdit),
}

type StatsResult = Result<ImageStatistics, EditError>;

/// Histogram work tagged with the parameters and the image generation it
/// was started for.
struct InFlightStats {
    params: HistogramParams,
    generation: u64,
    task: AsyncTask<StatsResult>,
}

struct CachedStats {
    params: HistogramParams,
    generation: u64,
    stats: Arc<ImageStatistics>,
}

#[derive(Default)]
struct HistogramCache {
    task: Option<InFlightStats>,
    stats: Option<CachedStats>,
}

impl HistogramCache {
    fn cached(&self, params: HistogramParams, generation: u64) -> Option<Arc<ImageStatistics>> {
        self.stats
            .as_ref()
            .filter(|c| c.params == params && c.generation == generation)
            .map(|c| Arc::clone(&c.stats))
    }

    fn in_flight_for(&self, params: HistogramParams, generation: u64) -> bool {
        self.task
            .as_ref()
            .is_some_and(|t| t.params == params && t.generation == generation)
    }

    /// Join a task and move its result into `stats`.
    fn adopt(&mut self, flight: InFlightStats) -> Result<Arc<ImageStatistics>, EditError> {
        let InFlightStats {
            params,
            generation,
            task,
        } = flight;
        match task.into_result() {
            Ok(Ok(stats)) => {
                let stats = Arc::new(stats);
                self.stats = Some(CachedStats {
                    params,
                    generation,
                    stats: Arc::clone(&stats),
                });
                Ok(stats)
            }
            Ok(Err(e)) => {
                if e.is_cancelled() {
                    crate::log_debug!("Histogram: computation interrupted");
                } else {
                    crate::log_warn!("Histogram: {}", e);
                }
                Err(e)
            }
            Err(e) => {
                crate::log_err!("Histogram worker failed: {}", e);
                Err(e.into())
            }
        }
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

pub struct ImageController {
    id: Uuid,
    path: Option<PathBuf>,
    image: Arc<Image>,
    history: CommandHistory,
    state: EditState,
    render: RenderCache,
    histogram: HistogramCache,
    /// Bumped whenever the committed image changes.
    generation: u64,
    settings: EngineSettings,
    finished: Option<DrainOutcome>,
}

impl ImageController {
    /// Controller holding an empty image, as before a load.
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_history(raster::empty_image(), CommandHistory::new(), settings)
    }

    /// Controller for an in-memory image.  `modified` marks images that have
    /// never been saved.
    pub fn from_image(image: Image, modified: bool, settings: EngineSettings) -> Self {
        let history = if modified {
            CommandHistory::already_modified()
        } else {
            CommandHistory::new()
        };
        Self::with_history(image, history, settings)
    }

    /// Controller that starts loading `path` in the background.
    pub fn open(path: impl Into<PathBuf>, settings: EngineSettings) -> Self {
        let mut controller = Self::new(settings);
        controller.load(path);
        controller
    }

    fn with_history(image: Image, history: CommandHistory, settings: EngineSettings) -> Self {
        let settings = settings.sanitized();
        Self {
            id: Uuid::new_v4(),
            path: None,
            image: Arc::new(image),
            history: history.with_limits(settings.history_limits()),
            state: EditState::Idle,
            render: RenderCache::new(),
            histogram: HistogramCache::default(),
            generation: 0,
            settings,
            finished: None,
        }
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// File name (or "Untitled") with a `*` suffix while modified.
    pub fn display_title(&mut self) -> String {
        let name = self
            .path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Untitled".to_string());
        if self.is_modified() {
            format!("{}*", name)
        } else {
            name
        }
    }

    // ------------------------------------------------------------------
    // Committed state
    // ------------------------------------------------------------------

    /// The committed image after draining any pending edit.
    pub fn image(&mut self) -> &Image {
        self.wait_for_async_result();
        &self.image
    }

    /// The last committed image, without waiting.
    pub fn committed_image(&self) -> &Image {
        &self.image
    }

    pub fn history(&self) -> &CommandHistory {
        &self.history
    }

    pub fn is_null(&self) -> bool {
        raster::is_null(&self.image)
    }

    pub fn is_modified(&mut self) -> bool {
        self.check_async_result();
        self.history.is_modified()
    }

    pub fn has_undo(&mut self) -> bool {
        self.check_async_result();
        self.history.has_undo()
    }

    pub fn has_redo(&mut self) -> bool {
        self.check_async_result();
        self.history.has_redo()
    }

    // ------------------------------------------------------------------
    // Edits
    // ------------------------------------------------------------------

    /// True when no edit is in flight.
    pub fn can_modify(&self) -> bool {
        matches!(self.state, EditState::Idle)
    }

    pub fn is_editing(&self) -> bool {
        !self.can_modify()
    }

    /// Start `command` in the background, draining any pending edit first.
    pub fn modify<F>(&mut self, description: impl Into<String>, command: F)
    where
        F: FnOnce(Arc<Image>, &AtomicProgress) -> CommandResult + Send + 'static,
    {
        self.wait_for_async_result();
        let image = Arc::clone(&self.image);
        let task = AsyncTask::new(move |progress: &AtomicProgress| command(image, progress)).named("edit");
        self.spawn(description.into(), task, None);
    }

    /// Like [`modify`](Self::modify) for commands that cannot report progress.
    pub fn modify_without_progress<F>(&mut self, description: impl Into<String>, command: F)
    where
        F: FnOnce(Arc<Image>) -> CommandResult + Send + 'static,
    {
        self.wait_for_async_result();
        let image = Arc::clone(&self.image);
        let task = AsyncTask::without_progress(move || command(image)).named("edit");
        self.spawn(description.into(), task, None);
    }

    /// Run an image → image function in the background with snapshot undo.
    pub fn modify_with_snapshot<F>(&mut self, description: impl Into<String>, f: F)
    where
        F: FnOnce(&Image, &AtomicProgress) -> Result<Image, EditError> + Send + 'static,
    {
        let description = description.into();
        self.modify(description.clone(), snapshot_command(description, f));
    }

    /// Synchronous in-place edit (brush strokes and the like) recorded with
    /// a full snapshot.
    pub fn direct_modify(&mut self, description: impl Into<String>, f: impl FnOnce(&mut Image)) {
        self.wait_for_async_result();
        self.prepare_exclusive();
        let before = (*self.image).clone();
        f(Arc::make_mut(&mut self.image));
        let description = description.into();
        crate::log_debug!("Direct edit '{}'", description);
        self.history
            .add_command(UndoRecord::full_snapshot(description, before));
        self.mark_caches_dirty();
    }

    /// Replace the image with the contents of `path`, in the background.
    /// On success the history is reset and `path()` updated.
    pub fn load(&mut self, path: impl Into<PathBuf>) {
        self.wait_for_async_result();
        let path = path.into();
        let source = path.clone();
        let task = AsyncTask::without_progress(move || io::load_image(&source).map(CommandOutput::replace))
            .named("load");
        self.spawn(format!("Load {}", path.display()), task, Some(path));
    }

    fn spawn(&mut self, description: String, task: AsyncTask<CommandResult>, source_path: Option<PathBuf>) {
        debug_assert!(self.can_modify());
        let mut task = task.with_schedule(self.settings.schedule);
        crate::log_info!("Edit '{}' started on {:?}", description, self.settings.schedule);
        task.compute();
        self.state = EditState::Editing(PendingEdit {
            task,
            description,
            started: Instant::now(),
            source_path,
        });
    }

    /// Progress of the pending edit; `Idle` when nothing is running.
    pub fn progress(&mut self) -> ProgressState {
        self.check_async_result();
        match &self.state {
            EditState::Idle => ProgressState::Idle,
            EditState::Editing(pending) => pending.task.progress(),
        }
    }

    /// Ask the pending edit to stop.  It still has to be drained.
    pub fn cancel(&self) {
        if let EditState::Editing(pending) = &self.state {
            crate::log_info!("Edit '{}' cancellation requested", pending.description);
            pending.task.cancel();
        }
    }

    // ------------------------------------------------------------------
    // Drain
    // ------------------------------------------------------------------

    /// Commit the pending edit if it has finished.  Never blocks.
    pub fn check_async_result(&mut self) -> Option<DrainOutcome> {
        let ready = matches!(&self.state, EditState::Editing(pending) if pending.task.ready());
        ready.then(|| self.wait_for_async_result())
    }

    /// Join the pending edit (if any) and commit or discard its result.
    pub fn wait_for_async_result(&mut self) -> DrainOutcome {
        let EditState::Editing(pending) = std::mem::replace(&mut self.state, EditState::Idle) else {
            return DrainOutcome::NothingPending;
        };

        // The statistics worker reads the image being replaced.
        self.cancel_histogram();

        let PendingEdit {
            task,
            description,
            started,
            source_path,
        } = pending;

        let outcome = match task.into_result() {
            Err(e) => DrainOutcome::Failed(e.into()),
            Ok(Err(e)) => DrainOutcome::Failed(e),
            Ok(Ok(output)) if raster::is_null(&output.image) => DrainOutcome::Failed(EditError::EmptyImage),
            Ok(Ok(CommandOutput { image, undo: None })) => {
                self.history = CommandHistory::new().with_limits(self.settings.history_limits());
                self.image = Arc::new(image);
                if source_path.is_some() {
                    self.path = source_path;
                }
                DrainOutcome::Replaced
            }
            Ok(Ok(CommandOutput {
                image,
                undo: Some(record),
            })) => {
                self.history.add_command(record);
                self.image = Arc::new(image);
                DrainOutcome::Edited(description.clone())
            }
        };

        match &outcome {
            DrainOutcome::Failed(e) if e.is_cancelled() => {
                crate::log_info!("Edit '{}' cancelled after {:.2?}", description, started.elapsed());
            }
            DrainOutcome::Failed(e) => {
                crate::log_warn!("Edit '{}' failed: {}", description, e);
            }
            _ => {
                self.mark_caches_dirty();
                crate::log_info!(
                    "Edit '{}' committed in {:.2?} ({} undo record(s), {} bytes)",
                    description,
                    started.elapsed(),
                    self.history.len(),
                    self.history.memory_usage()
                );
            }
        }

        self.finished = Some(outcome.clone());
        outcome
    }

    /// Outcome of the most recent drain, handed out once.
    pub fn take_finished(&mut self) -> Option<DrainOutcome> {
        self.finished.take()
    }

    // ------------------------------------------------------------------
    // Undo / redo
    // ------------------------------------------------------------------

    pub fn undo(&mut self) -> bool {
        self.wait_for_async_result();
        if !self.history.has_undo() {
            return false;
        }
        self.prepare_exclusive();
        let done = self.history.undo(Arc::make_mut(&mut self.image));
        self.mark_caches_dirty();
        done
    }

    pub fn redo(&mut self) -> bool {
        self.wait_for_async_result();
        if !self.history.has_redo() {
            return false;
        }
        self.prepare_exclusive();
        let done = self.history.redo(Arc::make_mut(&mut self.image));
        self.mark_caches_dirty();
        done
    }

    /// Drop every other reference to the committed image so it can be
    /// mutated in place.
    fn prepare_exclusive(&mut self) {
        self.cancel_histogram();
        self.render.release();
    }

    fn mark_caches_dirty(&mut self) {
        self.render.mark_dirty();
        self.generation += 1;
    }

    // ------------------------------------------------------------------
    // Render cache
    // ------------------------------------------------------------------

    /// Drain, realize the render cache if needed, and return it.
    pub fn texture(&mut self) -> Texture<'_> {
        self.wait_for_async_result();
        self.render.realize(&self.image)
    }

    /// Last realization, without draining.  `None` before the first
    /// `texture()` call and after an undo or redo until the next one.
    pub fn current_texture(&self) -> Option<Texture<'_>> {
        self.render.texture()
    }

    // ------------------------------------------------------------------
    // Histogram cache
    // ------------------------------------------------------------------

    /// Start computing statistics for `params` unless they are already
    /// cached or in flight for the committed image.
    pub fn request_histogram(&mut self, params: HistogramParams) {
        self.check_async_result();
        let generation = self.generation;
        if self.is_null()
            || self.histogram.cached(params, generation).is_some()
            || self.histogram.in_flight_for(params, generation)
        {
            return;
        }
        self.cancel_histogram();

        let image = Arc::clone(&self.image);
        let bins = self.settings.histogram_bins;
        let mut task = AsyncTask::new(move |progress: &AtomicProgress| {
            ImageStatistics::compute(&image, params.exposure, bins, progress)
        })
        .with_schedule(self.settings.schedule)
        .named("histogram");
        task.compute();
        crate::log_debug!("Histogram: started for exposure {:+.2}", params.exposure);
        self.histogram.task = Some(InFlightStats {
            params,
            generation,
            task,
        });
    }

    /// Collect a finished histogram task and return the newest statistics.
    ///
    /// The flag is `true` when the statistics describe the committed image;
    /// after an edit the previous image's statistics are still returned,
    /// flagged `false`, until a new request completes.
    pub fn poll_histogram(&mut self) -> Option<(Arc<ImageStatistics>, bool)> {
        self.check_async_result();
        if self.histogram.task.as_ref().is_some_and(|t| t.task.ready())
            && let Some(flight) = self.histogram.task.take()
        {
            let _ = self.histogram.adopt(flight);
        }
        self.histogram
            .stats
            .as_ref()
            .map(|c| (Arc::clone(&c.stats), c.generation == self.generation))
    }

    /// Statistics for the committed image at `params`, computing them on
    /// the spot if needed.
    pub fn recompute_histogram(&mut self, params: HistogramParams) -> Result<Arc<ImageStatistics>, EditError> {
        self.wait_for_async_result();
        if self.is_null() {
            return Err(EditError::EmptyImage);
        }
        if let Some(stats) = self.histogram.cached(params, self.generation) {
            return Ok(stats);
        }
        // Replaces any task started for other parameters.
        self.request_histogram(params);
        match self.histogram.task.take() {
            Some(flight) => self.histogram.adopt(flight),
            None => Err(EditError::Failed("histogram task was not started".to_string())),
        }
    }

    /// Cancel and join the histogram task.  A result that completed before
    /// the cancel landed is kept.
    pub fn cancel_histogram(&mut self) {
        if let Some(flight) = self.histogram.task.take() {
            flight.task.cancel();
            let _ = self.histogram.adopt(flight);
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Drain, write the committed image to `path` and mark it saved.
    pub fn save(&mut self, path: impl AsRef<Path>, params: &SaveParams) -> Result<(), EditError> {
        self.wait_for_async_result();
        let path = path.as_ref();
        io::save_image(&self.image, path, params)?;
        self.history.mark_saved();
        self.path = Some(path.to_path_buf());
        Ok(())
    }
}

impl Drop for ImageController {
    fn drop(&mut self) {
        if let Some(flight) = self.histogram.task.take() {
            flight.task.cancel();
            let _ = flight.task.into_result();
        }
        if let EditState::Editing(pending) = std::mem::replace(&mut self.state, EditState::Idle) {
            pending.task.cancel();
            let _ = pending.task.into_result();
        }
    }
}
