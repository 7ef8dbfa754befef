//! UDP flow handling
//!
//! UDP has no handshake, so a flow is a client/intercept address pair kept
//! alive by traffic. The [`UdpManager`] actor owns all
//! [`UdpVirtualConnection`]s and applies the admission and expiration
//! policies from [`policy`].

mod conn;
mod manager;
pub mod policy;

pub use conn::UdpVirtualConnection;
pub use manager::{ManagerEvent, UdpManager, UdpManagerHandle, UdpManagerStats};
pub use policy::{
    Admission, ConnExpirationPolicy, ConnectionLimit, IdleTimeout, NewConnPolicy,
    UnlimitedConnections,
};
