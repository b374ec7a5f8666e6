pub mod command;
pub mod error;
pub mod log;
pub mod script;
pub mod vars;

pub use command::*;
pub use error::EngineError;
pub use log::*;
pub use script::*;
pub use vars::*;
