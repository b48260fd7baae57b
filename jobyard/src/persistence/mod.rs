/// PostgreSQL implementation of the storage traits.
///
/// `PostgresJobStore` implements [`crate::store::JobStore`],
/// [`crate::store::WorkerRegistry`] and [`crate::store::RecurringJobStore`]
/// with `FOR UPDATE SKIP LOCKED` leasing.
pub mod postgres;

pub use postgres::PostgresJobStore;
