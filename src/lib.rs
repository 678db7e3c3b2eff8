//! LumaEdit: an asynchronous, cancellable, undoable editing engine for
//! high-dynamic-range images.
//!
//! An [`ImageController`] owns one image.  Edits are closures that run on a
//! background [`AsyncTask`] while reporting through an [`AtomicProgress`];
//! finished edits are committed on the owner's thread together with an
//! [`UndoRecord`] in the controller's [`CommandHistory`].

#![allow(clippy::too_many_arguments)]

pub mod logger;

pub mod cli;
pub mod components;
pub mod config;
pub mod controller;
pub mod error;
pub mod io;
pub mod ops;
pub mod progress;
pub mod raster;
pub mod stats;
pub mod task;
pub mod texture;

pub use components::history::{CommandHistory, HistoryLimits, UndoRecord};
pub use config::EngineSettings;
pub use controller::{CommandOutput, CommandResult, DrainOutcome, ImageController};
pub use error::EditError;
pub use io::{FileFormat, SaveParams};
pub use progress::{AtomicProgress, ProgressState};
pub use raster::Image;
pub use stats::{AxisScale, Histogram, HistogramParams, ImageStatistics};
pub use task::{AsyncTask, Schedule, TaskError};
pub use texture::{RenderCache, Texture};
