pub mod firmware;
pub mod reachability;
pub mod repository;

pub use firmware::*;
pub use reachability::*;
pub use repository::*;
