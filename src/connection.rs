//! Connection Layer
//!
//! [`ConnectionRegistry`] owns every data-source connection, one per
//! credential, and decides whether a failed credential may be tried again.

mod registry;

pub use registry::{
    ConnectionError, ConnectionRegistry, DEFAULT_CONNECT_TIMEOUT, ReconnectPolicy,
};
