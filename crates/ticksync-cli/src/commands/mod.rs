pub mod common;
pub mod maintenance;
pub mod materialize;
pub mod queue;
pub mod sessions;
pub mod watermarks;
pub mod worker;
