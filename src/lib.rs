//! Scheduled notebook dispatcher.
//!
//! Every notebook in the notebook directory becomes a [`workflow::Workflow`]
//! that clears the output directory, executes the notebook, then posts the
//! files it produced to Google Drive or Google Sheets according to the
//! notebook manifest.

pub mod cli;
pub mod config;
pub mod contract;
pub mod execute;
pub mod google;
pub mod load_config;
pub mod post_process;
pub mod scheduler;
pub mod workflow;

pub use cli::{run, Cli, Commands};
