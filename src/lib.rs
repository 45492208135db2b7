pub mod utils;
pub mod errors;
pub mod sql;
pub mod config;
pub mod contact;
pub mod event;
pub mod filter;
pub mod merge;
pub mod session;
pub mod metadata;
pub mod filesystem;
pub mod provider;
pub mod providers;
pub mod subset;
pub mod anonymise;
pub mod rime;

pub mod prelude {
    pub use std::collections::{HashMap, HashSet};

    pub use crate::config::Config;
    pub use crate::contact::{Contact, GlobalContactId, Name};
    pub use crate::errors::{RimeError, SubsetErrorCode};
    pub use crate::event::{Event, MediaData, MessageEvent, MessageSession};
    pub use crate::filter::{ContactsFilter, EventsFilter, ProvidersFilter};
    pub use crate::merge::{merge_contacts, MergedContact};
    pub use crate::rime::{DeviceCache, Rime, SubsetTarget};
    pub use crate::utils::*;
}

use std::sync::Arc;

use crate::utils::Result;

/// Creates the top-level RIME object for a devices directory.
pub fn create(config: config::Config) -> Result<Arc<rime::Rime>> {
    rime::Rime::create(config)
}
