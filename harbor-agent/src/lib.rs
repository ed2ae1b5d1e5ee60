pub mod error;
pub mod manager;
pub mod persist;
pub mod state;

pub use error::ManagerError;
pub use manager::{ManagerOptions, ServiceManager};
pub use persist::{PersistenceStore, RegistrationSource};
pub use state::LocalState;
