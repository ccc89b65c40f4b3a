//! Provider-agnostic spawning, stream-JSON parsing and lifecycle
//! management of AI assistant subprocesses.

pub mod client;
pub mod event;
pub mod parser;
pub mod process;
pub mod spawn;

pub use client::{
    BEADS_DIR_ENV,
    ClientRegistry,
    HeadlessClient,
    OPENCODE_CONFIG_ENV,
    ProviderExtensions,
    ProviderKind,
    SpawnConfig,
};
pub use event::{
    ContentBlock,
    ErrorInfo,
    ErrorReason,
    MessageContent,
    OutputEvent,
    OutputEventKind,
    ToolContent,
    UsageInfo,
};
pub use parser::{BaseParser, EventParser, ParseError};
pub use process::{BaseProcess, HeadlessProcess, InitHook, ProcessError, ProcessStatus};
pub use spawn::{SpawnBuilder, StdinMode};
