//! External collaborators reached through narrow traits.
//!
//! Only in-memory (and disabled) implementations live here; concrete
//! transports plug in behind the same traits.

pub mod ledger;
pub mod mailer;
pub mod object_store;

pub use ledger::{InMemoryLedger, LedgerError, LedgerMirror};
pub use mailer::{DisabledMailer, InMemoryMailer, MailError, Mailer, MessageId, SentMail};
pub use object_store::{InMemoryObjectStore, ObjectRef, ObjectStore, ObjectStoreError};
