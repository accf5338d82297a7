pub mod events;
mod socket;

pub use events::ProcEvent;
pub use socket::ProcConnector;
