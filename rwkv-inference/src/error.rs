use bitflags::bitflags;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;

bitflags! {
    /// Composable failure categories. Category flags (`ARGS` .. `CTX`) say where
    /// a failure happened, detail flags say what went wrong.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ErrorFlags: u32 {
        const ARGS = 1 << 0;
        const FILE = 1 << 1;
        const MODEL = 1 << 2;
        const MODEL_PARAMS = 1 << 3;
        const GRAPH = 1 << 4;
        const CTX = 1 << 5;

        const ALLOC = 1 << 8;
        const FILE_OPEN = 1 << 9;
        const FILE_STAT = 1 << 10;
        const FILE_READ = 1 << 11;
        const FILE_WRITE = 1 << 12;
        const FILE_MAGIC = 1 << 13;
        const FILE_VERSION = 1 << 14;
        const DATA_TYPE = 1 << 15;
        const UNSUPPORTED = 1 << 16;
        const SHAPE = 1 << 17;
        const DIMENSION = 1 << 18;
        const KEY = 1 << 19;
        const DATA = 1 << 20;
        const PARAM_MISSING = 1 << 21;
    }
}

/// Failure of a library call: the accumulated flags plus the innermost message.
#[derive(Debug, Clone, Error)]
#[error("{message} (flags: {flags:?})")]
pub struct Error {
    flags: ErrorFlags,
    message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(flags: ErrorFlags, message: impl Into<String>) -> Self {
        Self { flags, message: message.into() }
    }

    pub fn flags(&self) -> ErrorFlags {
        self.flags
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Adds flags without replacing the ones already recorded.
    pub fn with_flags(mut self, flags: ErrorFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Shortcut for `Error::new(..)` wrapped in `Err`.
    pub(crate) fn fail<T>(flags: ErrorFlags, message: impl Into<String>) -> Result<T> {
        Err(Self::new(flags, message))
    }
}

/// Extension for ORing flags into an error while it travels outward.
pub trait ResultExt<T> {
    fn flag(self, flags: ErrorFlags) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn flag(self, flags: ErrorFlags) -> Result<T> {
        self.map_err(|e| e.with_flags(flags))
    }
}

/// Converts an I/O failure into an error carrying the given flags.
pub(crate) fn io_error(flags: ErrorFlags, what: impl std::fmt::Display) -> impl FnOnce(std::io::Error) -> Error {
    move |e| Error::new(flags, format!("{what}: {e}"))
}

// Fallback slots for failures that happen before a context exists (load, quantize).
static GLOBAL_LAST_ERROR: AtomicU32 = AtomicU32::new(0);
static GLOBAL_PRINT_ERRORS: AtomicBool = AtomicBool::new(true);

/// Returns and clears the flags of the last context-less failure.
pub fn last_error() -> ErrorFlags {
    ErrorFlags::from_bits_retain(GLOBAL_LAST_ERROR.swap(0, Ordering::AcqRel))
}

pub fn print_errors() -> bool {
    GLOBAL_PRINT_ERRORS.load(Ordering::Relaxed)
}

/// Sets the process-wide print toggle; new contexts copy it at creation.
pub fn set_print_errors(enabled: bool) {
    GLOBAL_PRINT_ERRORS.store(enabled, Ordering::Relaxed);
}

/// Records a context-less failure in the fallback slot and reports it if printing is enabled.
pub fn record_global<T>(result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        GLOBAL_LAST_ERROR.fetch_or(e.flags().bits(), Ordering::AcqRel);
        if print_errors() {
            log::error!("{e}");
        }
    }
    result
}
