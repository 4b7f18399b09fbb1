//! External mail surfaces: staging queue, LMTP mail store, quarantine folder,
//! and message parsing.

pub mod email;
pub mod lmtp;
pub mod quarantine;
pub mod staging;

pub use lmtp::{LmtpClient, MailStore};
pub use quarantine::QuarantineStore;
pub use staging::StagingQueue;
