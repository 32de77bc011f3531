//! Shared transport infrastructure for rust-pv-usb
//!
//! Everything both sides of the isolation boundary touch lives here: the
//! page and grant-table model, the shared transport ring, the notification
//! doorbells, and the link constructor that wires one frontend device to
//! one backend dispatcher. Also hosts the logging setup helper and test
//! utilities used across the workspace.

pub mod doorbell;
pub mod error;
pub mod grants;
pub mod link;
pub mod logging;
pub mod page;
pub mod ring;
pub mod test_utils;

pub use doorbell::{Doorbell, DoorbellWaiter, doorbell};
pub use error::{Error, Result};
pub use grants::{GrantAccess, GrantError, GrantTable, MappedGrant};
pub use link::{BackLink, FrontLink, Link};
pub use logging::setup_logging;
pub use page::Page;
pub use ring::{BackRing, FrontRing, RingError, SharedRing};
