//! Core types for the device configuration twin.
//!
//! Provides:
//! - Field schemas and the closed set of wire value types
//! - The binary field codec with range and length validation
//! - Desired/reported value types and downlink command structures
//! - Collaborator traits for the store, transport, liveness and auth services
//! - Unified error type and service configuration

pub mod codec;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod error;
pub mod format;
pub mod schema;
pub mod value;

// Re-exports
pub use codec::{decode, encode};

pub use collaborators::{
    Authorizer, ConfigStore, DownlinkTransport, LivenessRegistry, Severity, TelemetrySink,
    TracingTelemetry,
};

pub use command::{ConnectionEvent, ConsistencyCheckTask, DeviceEvent, DownlinkCommand, UplinkMessage};

pub use config::ServiceConfig;

pub use error::{Error, RangeBound, Result, ValidationError};

pub use format::format_value;

pub use schema::{DocType, FieldSchema, ValueType};

pub use value::{ConfigDoc, ConfigField, ConfigFieldValue};

/// Device identifier.
pub type DeviceId = String;
