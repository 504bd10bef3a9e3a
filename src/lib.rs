//! Self-update and durable feedback telemetry for unattended desktop
//! binaries.
//!
//! The update side checks a GitHub release index, downloads the newest
//! asset, and swaps the installed binary via a detached helper process; the
//! feedback side persists every record locally before attempting delivery
//! to a remote endpoint. Both are driven through handles (`UpdateOrchestrator`,
//! `FeedbackQueue`) that a host application constructs once at startup; the
//! `upkeep` binary is a thin CLI over the same API.

pub mod config;
pub mod download;
pub mod errors;
pub mod feedback;
pub mod install;
pub mod release;
pub mod update;
pub mod version;
