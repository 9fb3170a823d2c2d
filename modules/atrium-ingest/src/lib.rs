//! Sensor batch ingestion: timestamp validation, duplicate suppression via
//! per-sensor checkpoints, numeric field extraction, and a time-boxed
//! listener that self-terminates so the next trigger starts fresh.

pub mod fields;
pub mod listener;
pub mod timestamp;
pub mod validator;

pub use fields::{extract_fields, Extraction, FIELD_MAP_VERSION};
pub use listener::{IngestListener, ListenerStats, MessageSource, StdinSource};
pub use timestamp::parse_timestamp;
pub use validator::{Admission, BatchValidator, RejectReason, SensorBatch, ValidatorConfig};
