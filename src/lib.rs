//! Device configuration push pipeline: builds an abstract config per
//! physical router from the intent graph and pushes changed ones through
//! the job broker.

pub mod abstract_config;
pub mod alloc;
pub mod composer;
pub mod config;
pub mod context;
pub mod coord;
pub mod error;
pub mod events;
pub mod fabric;
pub mod handlers;
pub mod intent;
pub mod jobs;
pub mod push;
pub mod router;
pub mod utils;

pub use context::AppState;
