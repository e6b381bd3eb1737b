pub mod cancel;
pub mod constants;
pub mod error;
pub mod interface;
pub mod probe;
pub mod search;
