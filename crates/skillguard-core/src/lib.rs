pub mod config;
pub mod traits;
pub mod types;

pub use config::*;
pub use traits::*;
pub use types::*;
