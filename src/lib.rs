//! Bugzilla Relay - announce Bugzilla changes (bugmail) in chat channels

pub mod bugmail;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod format;
pub mod mailbox;
pub mod render;
pub mod rules;
pub mod scheduler;
pub mod snarf;
pub mod tracker;
pub mod transport;

pub use bugmail::{Bugmail, BugmailParser, Diff, Flag, FlagChanges, HeaderBugmailParser, ParseError};
pub use config::{ChannelConfig, ConfigStore, LineKind, RelayConfig, WatchRule, WatchedItems};
pub use dedup::{DedupRegistry, EntityKind};
pub use engine::{parse_bug_ids, NotificationEngine};
pub use error::{RelayError, Result};
pub use mailbox::MailboxPoller;
pub use render::{render_diff, RenderContext};
pub use scheduler::PollScheduler;
pub use tracker::{AttachmentRecord, BugErrorKind, BugFields, BugRecord, BugTracker, SearchOutcome, TrackerClient};
pub use transport::{AnnouncementLog, AnnouncementRecord, ChatTransport, LogFileTransport, SendResult, StdoutTransport};
