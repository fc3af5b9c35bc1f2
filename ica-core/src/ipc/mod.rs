//! Events exchanged with the UI/control thread.

pub mod events;

pub use events::{TrainingStatus, TrainingStatusEvent};
