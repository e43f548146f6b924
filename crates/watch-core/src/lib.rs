pub mod error;
pub mod traits;
pub mod types;
pub mod watch_loop;

pub use error::*;
pub use traits::*;
pub use types::*;
pub use watch_loop::*;
