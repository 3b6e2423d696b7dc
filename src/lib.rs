pub mod catalogue;
pub mod coordinator;
pub mod error;
pub mod file_handler;
pub mod fitter;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod maintenance;
pub mod merger;
pub mod registry;
pub mod worker;

pub use error::*;
