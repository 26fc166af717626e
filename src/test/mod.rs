pub mod utils;

pub use utils::{test_db, test_store, test_utils};

mod auth;
mod results;
mod retrieval;
mod surveys;
