//! Program store adapters.

mod postgres;

pub use postgres::PostgresProgramStore;
