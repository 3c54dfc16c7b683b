pub mod api;
pub mod broadcast;
pub mod dispatcher;
pub mod engine;
pub mod registry;
pub mod scanner;
pub mod sweeper;
pub mod task;
pub mod tracker;

#[cfg(test)]
mod testing;
