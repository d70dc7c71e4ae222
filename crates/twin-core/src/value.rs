//! Desired and reported config values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Desired and reported value of one field on one device (or device slot).
///
/// An unset desired value means no command is pending, which is distinct
/// from a desired empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFieldValue {
    /// Value an operator wants the device to have
    pub desired: Option<String>,
    /// Value the device last confirmed
    pub reported: Option<String>,
}

impl ConfigFieldValue {
    /// Create a value pair.
    pub fn new(desired: Option<String>, reported: Option<String>) -> Self {
        Self { desired, reported }
    }

    /// Check if desired is set and differs from reported.
    pub fn is_inconsistent(&self) -> bool {
        match &self.desired {
            Some(desired) => self.reported.as_ref() != Some(desired),
            None => false,
        }
    }

    /// The desired value when the pair is inconsistent.
    pub fn pending(&self) -> Option<&str> {
        if self.is_inconsistent() {
            self.desired.as_deref()
        } else {
            None
        }
    }
}

/// One field of a device config document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigField {
    /// Schema index of the field
    pub index: u32,
    /// Field name
    pub name: String,
    /// Desired value
    pub desired: Option<String>,
    /// Reported value
    pub reported: Option<String>,
}

impl ConfigField {
    /// Create a blank field.
    pub fn blank(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            desired: None,
            reported: None,
        }
    }

    /// Get the desired/reported pair.
    pub fn value(&self) -> ConfigFieldValue {
        ConfigFieldValue::new(self.desired.clone(), self.reported.clone())
    }

    /// Check if desired is set and differs from reported.
    pub fn is_inconsistent(&self) -> bool {
        self.value().is_inconsistent()
    }
}

/// Flat desired/reported document, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDoc {
    pub desired: BTreeMap<String, String>,
    pub reported: BTreeMap<String, String>,
}
