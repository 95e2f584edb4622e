//! Recording
//!
//! Session records, disk monitoring and the session-scoped supervisor.

pub mod disk;
pub mod session;
pub mod supervisor;

pub use disk::DiskMonitor;
pub use session::{Session, SessionStatus};
pub use supervisor::{RecordingStatus, RecordingSupervisor, MIXER_PROGRAM_PATH};
