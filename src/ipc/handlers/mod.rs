pub mod catalog;
pub mod core;
pub mod grade;
pub mod results;
pub mod sessions;
pub mod setup;
