//! Imports shared by nearly every module in the workspace: the std types the
//! data model and stores lean on, plus the logging macros.

pub use std::fmt::{Debug, Display};
pub use std::net::{IpAddr, Ipv4Addr, SocketAddr};
pub use std::sync::{Arc, Mutex};
pub use std::time::{Duration, Instant};

pub use anyhow::Context as _;
pub use bytes::Bytes;
pub use tracing::{debug, info, trace, warn};

pub use crate::strng;
pub use crate::strng::Strng;
