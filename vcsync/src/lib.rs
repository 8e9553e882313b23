pub mod attributes;
pub mod baseline;
pub mod cancel;
pub mod checkin;
pub mod context;
pub mod error;
pub mod filter;
pub mod get;
pub mod lock;
pub mod path;
pub mod pool;
pub mod queue;
pub mod session;
pub mod state;
pub mod util;

#[cfg(test)]
mod tests;
