pub mod log_writer;
pub mod queue;
pub mod replay_log;
pub mod types;

pub use log_writer::{LogWriter, WriterFailure};
pub use queue::{capture_queue, CaptureReceiver, CaptureSender, CompletionSignal};
pub use replay_log::{describe_entry, ReplayLogCodec, ReplayLogReader};
pub use types::{CaptureEntry, ConnectionId, Direction};
