//! Event types, kernel descriptors and the selection set that ties them to
//! ring buffers.

pub mod event_fd;
pub mod event_type;
pub mod selection;

pub use event_fd::{CounterValue, EventBackend, EventFile, KernelBackend, PerfEventFile};
pub use event_type::{EventType, EventTypeAndModifier, parse_event_type};
pub use selection::{CounterInfo, CountersInfo, EventSelectionSet, RecordSink};
