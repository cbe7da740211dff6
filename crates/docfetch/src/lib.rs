#![doc = include_str!("../README.md")]

mod client;
mod config;
mod dataset;
mod decoder;
mod dispatcher;
mod engine;
mod error;
mod fetcher;
mod model;
mod planner;
mod registry;
mod sequencer;

pub use crate::client::*;
pub use crate::config::*;
pub use crate::dataset::*;
pub use crate::decoder::*;
pub use crate::dispatcher::*;
pub use crate::engine::*;
pub use crate::error::*;
pub use crate::fetcher::*;
pub use crate::model::*;
pub use crate::planner::*;
pub use crate::registry::*;
pub use crate::sequencer::{
    PartitionState, ResultSequence, ResultStream, SequenceStats, TaskContext,
};
