pub mod hub;
pub mod socket;

pub use hub::{BootstrapSource, BroadcastHub, Outbound, Subscription};
pub use socket::serve_socket;
