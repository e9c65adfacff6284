pub mod cancel;
pub mod config;
pub mod errors;
pub mod logging;
pub mod retry;
