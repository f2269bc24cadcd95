pub mod cache;
pub mod dispatch;
pub mod enrich;
pub mod key;
mod records;

pub use dispatch::dispatch;
