pub mod autosave;
pub mod cli;
pub mod config;
pub mod drafts;
pub mod messaging;
pub mod network;
pub mod storage;

pub use autosave::{AutoSaveController, AutoSaveOptions, SaveError, SaveSink, SaveState, SaveStatus};
pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use drafts::{Draft, DraftStore};
pub use messaging::{UnreadAlertGate, UnreadSnapshot};
pub use network::{NetworkObserver, NetworkStatus};
