pub mod app;
pub mod jobs;

pub use app::{router, AppState};
