pub mod defs;
pub mod memory;
pub mod requests;
pub mod state;
pub mod text;

pub use defs::*;
pub use memory::MemoryStore;
pub use requests::{MailboxSourceUpdate, NewMailboxSource, NewSiteSource, SiteSourceUpdate};
pub use state::{InsertOutcome, Store, StoreError, StoreResult};
