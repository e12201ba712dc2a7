pub mod adapter;
#[cfg(feature = "simulation")]
pub mod adapter_sim;
pub mod alarm;
pub mod anomaly;
pub mod error;
pub mod events;
pub mod queue;
pub mod scan;
pub mod status;
pub mod tags;
pub mod timebase;

pub use adapter::ProtocolAdapter;
#[cfg(feature = "simulation")]
pub use adapter_sim::{SimStep, SimulatedAdapter};
pub use alarm::{AlarmEvaluator, AlarmEvent};
pub use anomaly::{
    AnomalyDetector, AnomalyResult, Baseline, BaselineModel, DetectionStrategy, HistoryWindow,
    ThresholdHeuristic,
};
pub use error::{CommunicationError, ConfigurationError, ModelError, RegistryError};
pub use events::{EventSink, LogSink};
pub use queue::{ReadingQueue, DEFAULT_QUEUE_CAPACITY};
pub use scan::{CycleReport, ScanConfig, ScanScheduler, ScanStats, ScannerHandle};
pub use status::{EngineStatus, StatusReport, TagStatus};
pub use tags::{DataType, Reading, TagDefinition, TagId, TagRegistry, TagSnapshot, TagState};
pub use timebase::TimeBase;
