pub mod errors;
pub mod logging;
pub mod models;
pub mod traits;

pub use errors::*;
pub use logging::StructuredLogger;
pub use models::*;
pub use traits::*;
