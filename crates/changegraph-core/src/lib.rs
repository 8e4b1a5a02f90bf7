//! Core data model, error taxonomy, ports and configuration shared by the
//! ChangeGraph crates.

pub mod change;
pub mod config_manager;
pub mod deadline;
pub mod error;
pub mod logging;
pub mod report;
pub mod resource;
pub mod traits;
pub mod types;

pub use change::*;
pub use config_manager::*;
pub use deadline::*;
pub use error::*;
pub use report::*;
pub use resource::*;
pub use traits::*;
pub use types::*;
