//! Client side of LifeLink chat: live message window, composer, single-slot
//! file transfers and clipboard copy, over pluggable document and blob stores.

pub mod backend;
pub mod clipboard;
pub mod composer;
pub mod config;
pub mod logging;
pub mod remote;
pub mod stream;
pub mod transfer;

pub use backend::{BackendError, BlobStore, DocumentStore, LiveQuery, UploadProgress};
pub use clipboard::{ClipboardBridge, ClipboardError, ClipboardWriter, SystemClipboard};
pub use composer::{ComposerInput, MessageComposer, SendError, SubmitOutcome};
pub use remote::RelayBackend;
pub use stream::{MessageStream, SeenMessages, Subscription};
pub use transfer::{
    FileSource, FileTransferManager, FileTransferState, ScheduledDeletion, TransferError,
    TransferOutcome, TransferPhase, TransferTask,
};
