//! Test doubles for jobyard: an in-memory store, a manual clock, handler
//! and dispatcher mocks, and fixtures.

mod clock;
pub mod fixtures;
mod handlers;
mod mock;
mod store;

pub use clock::ManualClock;
pub use handlers::{
    FailingHandler, FlakyHandler, PanickingHandler, RecordingHandler,
    SlowHandler,
};
pub use mock::{DispatchRecord, MockDispatcher};
pub use store::InMemoryJobStore;
