pub mod errors;
pub mod merge;
pub mod models;
pub mod protocol;

pub use errors::*;
pub use merge::*;
pub use models::*;
pub use protocol::*;

pub type DeliveryResult<T> = Result<T, DeliveryError>;
