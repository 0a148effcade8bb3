//! Error types for the optimization pipeline.
//!
//! Each concern owns its error enum. Internal APIs propagate these with `?`;
//! only [`crate::PipelineContext::transform`] swallows them and falls back to
//! the original bytes.

use crate::governor::OptimizerState;

/// Errors decoding or encoding the binary unit format.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    /// Input shorter than the fixed header.
    #[error("unit too short: {len} bytes")]
    TooShort { len: usize },

    /// First four bytes are not the unit magic.
    #[error("bad unit magic")]
    BadMagic,

    /// Input ended while reading a field.
    #[error("truncated at offset {offset}: needed {needed} more bytes")]
    Truncated { offset: usize, needed: usize },

    /// Opcode byte not in the instruction set.
    #[error("unknown opcode {opcode:#04x} at instruction {index}")]
    UnknownOpcode { opcode: u8, index: usize },

    /// Pool entry is not valid UTF-8.
    #[error("pool entry {index} is not valid UTF-8")]
    InvalidUtf8 { index: usize },

    /// Bytes left over after the handler table.
    #[error("{count} trailing bytes after handler table")]
    TrailingBytes { count: usize },

    /// A table or string does not fit its length prefix.
    #[error("{what} too large to encode: {len}")]
    TooLarge { what: &'static str, len: usize },
}

/// Structural errors found while analyzing a unit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    /// Unit has no instructions.
    #[error("unit has no instructions")]
    Empty,

    /// Branch target outside the instruction list.
    #[error("instruction {at} jumps to missing instruction {target}")]
    DanglingTarget { at: usize, target: u32 },

    /// Two paths reach an instruction with different stack depths.
    #[error("inconsistent stack depth at {at}: {expected} vs {found}")]
    InconsistentStack { at: usize, expected: u32, found: u32 },

    /// Instruction pops more values than the stack holds.
    #[error("stack underflow at {at}")]
    StackUnderflow { at: usize },

    /// LOAD/STORE references a slot beyond `max_locals`.
    #[error("slot {slot} out of range at {at} (max_locals {max_locals})")]
    SlotOutOfRange { at: usize, slot: u16, max_locals: u16 },

    /// Pool reference beyond the string pool.
    #[error("pool index {index} out of range at {at}")]
    PoolOutOfRange { at: usize, index: u16 },

    /// Control reaches past the last instruction.
    #[error("control falls off the end after instruction {at}")]
    FallsOffEnd { at: usize },

    /// Handler with an empty or out-of-range protected region or target.
    #[error("bad handler {index}: [{start}, {end}) -> {target}")]
    BadHandler {
        index: usize,
        start: u32,
        end: u32,
        target: u32,
    },

    /// Nested analysis deeper than the sandbox allows.
    #[error("analysis depth {depth} exceeds limit {max}")]
    DepthExceeded { depth: u32, max: u32 },
}

/// Failure of a single pass. The pipeline isolates these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PassError {
    /// Pass left the unit in a shape the analyzer rejects.
    #[error("analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    /// Pass visited more instructions than its budget.
    #[error("pass {pass} exceeded instruction budget ({processed} > {limit})")]
    BudgetExceeded {
        pass: &'static str,
        processed: u64,
        limit: u64,
    },

    /// Job was cancelled by the watchdog.
    #[error("cancelled")]
    Cancelled,

    /// Pass panicked; payload message attached.
    #[error("panicked: {0}")]
    Panicked(String),

    /// Pass could not represent its rewrite.
    #[error("{0}")]
    Internal(String),
}

impl PassError {
    /// Whether this failure is a resource limit rather than a logic error.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            PassError::BudgetExceeded { .. }
                | PassError::Cancelled
                | PassError::Panicked(_)
                | PassError::Analysis(AnalysisError::DepthExceeded { .. })
        )
    }
}

/// Errors from the on-disk cache tier and other persisted files.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Index header (magic or format version) is not recognized.
    #[error("bad index header: {0}")]
    BadHeader(String),

    /// Index or dependency body is malformed.
    #[error("corrupt {file}: {reason}")]
    Corrupt { file: &'static str, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Post-transform verification failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerifyError {
    /// Optimized bytes no longer decode.
    #[error("output does not decode: {0}")]
    Decode(#[from] UnitError),

    /// Optimized unit fails structural analysis.
    #[error("output fails analysis: {0}")]
    Structure(#[from] AnalysisError),

    /// Re-encoding the decoded output did not reproduce it.
    #[error("round-trip mismatch: {0}")]
    RoundTrip(String),

    /// Output grew beyond the allowed ratio.
    #[error("expansion ratio {ratio:.2} exceeds {max:.2} ({original} -> {optimized} bytes)")]
    Expansion {
        original: usize,
        optimized: usize,
        ratio: f64,
        max: f64,
    },
}

/// Why a transform job produced no optimized output.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    /// Input passed pre-validation but does not decode.
    #[error("input does not decode: {0}")]
    Decode(UnitError),

    /// Input decodes but fails analysis before any pass runs.
    #[error("input fails analysis: {0}")]
    Malformed(AnalysisError),

    #[error("output does not encode: {0}")]
    Encode(UnitError),

    #[error("verification failed: {0}")]
    Verify(VerifyError),

    #[error("cancelled during pass {pass:?}")]
    Cancelled { pass: Option<&'static str> },

    /// Watchdog expired before the job finished.
    #[error("watchdog expired during pass {pass:?}")]
    Timeout { pass: Option<&'static str> },

    #[error("job panicked: {0}")]
    Panicked(String),

    /// Transform queue is full; the caller gets the original bytes.
    #[error("transform queue full")]
    QueueFull,

    #[error("transform pool is shut down")]
    PoolClosed,
}

impl TransformError {
    /// The input itself is bad; nothing to attribute to a pass.
    pub fn is_input_error(&self) -> bool {
        match self {
            TransformError::Decode(_) => true,
            TransformError::Malformed(err) => !matches!(err, AnalysisError::DepthExceeded { .. }),
            _ => false,
        }
    }

    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            TransformError::Cancelled { .. }
                | TransformError::Timeout { .. }
                | TransformError::Panicked(_)
                | TransformError::Malformed(AnalysisError::DepthExceeded { .. })
        )
    }

    /// Output was produced but rejected.
    pub fn is_verification_failure(&self) -> bool {
        matches!(self, TransformError::Encode(_) | TransformError::Verify(_))
    }
}

/// Reasons a unit is passed through without optimization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("unit too small: {len} bytes (min {min})")]
    TooSmall { len: usize, min: usize },

    #[error("unit too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    #[error("bad magic")]
    BadMagic,

    #[error("unsupported unit version {version}")]
    UnsupportedVersion { version: u16 },

    #[error("unit is blacklisted")]
    Blacklisted,

    /// Governor state does not allow optimization.
    #[error("optimization not permitted in state {0}")]
    NotPermitted(OptimizerState),

    /// Heap backpressure is engaged.
    #[error("paused by heap backpressure")]
    HeapPressure,
}

/// Governor state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    /// Transition not in the legal transition table.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: OptimizerState,
        to: OptimizerState,
    },

    /// Persisted state file holds an unknown name.
    #[error("unknown persisted state {0:?}")]
    UnknownState(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<std::io::Error> for GovernorError {
    fn from(err: std::io::Error) -> Self {
        GovernorError::Storage(StorageError::Io(err))
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Crate-level error for construction and administrative operations.
#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error(transparent)]
    Unit(#[from] UnitError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Pass(#[from] PassError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Governor(#[from] GovernorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Worker thread could not be spawned.
    #[error("failed to spawn worker: {0}")]
    Spawn(std::io::Error),
}
