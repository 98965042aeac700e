pub mod structured_logging;

pub use structured_logging::{
    init_structured_logging,
    HostContext,
    LogFormat,
    LoggingConfig,
    OperationTimer,
    StructuredLogEntry,
    TimingMetrics,
};
