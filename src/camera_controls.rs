//! Camera hardware controls for V4L2 devices
//!
//! Light transport measurements are only comparable when every frame is
//! taken with the same exposure, gain and white balance. This module looks
//! up the device's controls and pins them to the values from the config
//! before the capture stream starts.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use v4l::control::{Control, Flags, Type, Value};
use v4l::Device;

/// A camera control with its range and current value
#[derive(Debug, Clone, Serialize)]
pub struct CameraControl {
    /// V4L2 control ID
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub control_type: ControlType,
    pub minimum: i64,
    pub maximum: i64,
    pub default: i64,
    pub value: Option<i64>,
    pub read_only: bool,
    pub inactive: bool,
}

impl CameraControl {
    /// Config key for this control, e.g. "Exposure Time, Absolute" -> "exposure_time_absolute"
    pub fn key(&self) -> String {
        normalize_name(&self.name)
    }

    fn writable(&self) -> bool {
        !self.read_only && !self.inactive
    }
}

/// Simplified control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlType {
    Integer,
    Boolean,
    Menu,
    Integer64,
    Unsupported,
}

impl From<Type> for ControlType {
    fn from(t: Type) -> Self {
        match t {
            Type::Integer => ControlType::Integer,
            Type::Boolean => ControlType::Boolean,
            Type::Menu | Type::IntegerMenu => ControlType::Menu,
            Type::Integer64 => ControlType::Integer64,
            _ => ControlType::Unsupported,
        }
    }
}

/// Lowercase, with every run of non-alphanumeric characters collapsed to one underscore
pub fn normalize_name(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() {
            key.extend(c.to_lowercase());
        } else if !key.is_empty() && !key.ends_with('_') {
            key.push('_');
        }
    }
    if key.ends_with('_') {
        key.pop();
    }
    key
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Boolean(b) => Some(*b as i64),
        _ => None,
    }
}

fn to_v4l2_value(control_type: ControlType, value: i64) -> Value {
    match control_type {
        ControlType::Boolean => Value::Boolean(value != 0),
        _ => Value::Integer(value),
    }
}

/// Camera controls manager
pub struct CameraControlsManager {
    device_path: String,
    /// Cached control descriptions
    controls: Vec<CameraControl>,
}

impl CameraControlsManager {
    pub fn new(device_path: &str) -> Self {
        Self {
            device_path: device_path.to_string(),
            controls: Vec::new(),
        }
    }

    /// Query all available controls from the camera
    pub fn query_controls(&mut self) -> Result<&[CameraControl]> {
        let device = Device::with_path(&self.device_path)
            .with_context(|| format!("Failed to open device: {}", self.device_path))?;

        let descriptions = device
            .query_controls()
            .with_context(|| "Failed to query camera controls")?;

        self.controls.clear();

        for desc in descriptions {
            // Skip controls that are disabled or are control classes
            if desc.flags.contains(Flags::DISABLED) || desc.typ == Type::CtrlClass {
                continue;
            }

            let value = match device.control(desc.id) {
                Ok(ctrl) => value_as_i64(&ctrl.value),
                Err(e) => {
                    debug!("Could not read control {}: {}", desc.name, e);
                    None
                }
            };

            let control = CameraControl {
                id: desc.id,
                name: desc.name.clone(),
                control_type: ControlType::from(desc.typ),
                minimum: desc.minimum,
                maximum: desc.maximum,
                default: desc.default,
                value,
                read_only: desc.flags.contains(Flags::READ_ONLY),
                inactive: desc.flags.contains(Flags::INACTIVE),
            };

            debug!(
                "Found control: {} (id={:#x}, type={:?}, value={:?})",
                control.name, control.id, control.control_type, control.value
            );

            self.controls.push(control);
        }

        info!(
            "Discovered {} camera controls on {}",
            self.controls.len(),
            self.device_path
        );

        Ok(&self.controls)
    }

    /// Look up a control by its normalized config key
    pub fn find(&self, key: &str) -> Option<&CameraControl> {
        let key = normalize_name(key);
        self.controls.iter().find(|c| c.key() == key)
    }

    /// Set a control value by ID
    pub fn set_control(&mut self, id: u32, value: i64) -> Result<()> {
        let control = self
            .controls
            .iter_mut()
            .find(|c| c.id == id)
            .with_context(|| format!("Control not found: {:#x}", id))?;

        let device = Device::with_path(&self.device_path)
            .with_context(|| format!("Failed to open device: {}", self.device_path))?;

        device
            .set_control(Control {
                id,
                value: to_v4l2_value(control.control_type, value),
            })
            .with_context(|| format!("Failed to set control '{}'", control.name))?;

        control.value = Some(value);
        info!("Set control '{}' (id={:#x}) to {}", control.name, id, value);
        Ok(())
    }

    /// Apply config values by normalized name.
    ///
    /// Auto modes are applied first so the manual values that follow are not
    /// reported inactive by the driver.
    pub fn apply_settings(&mut self, settings: &HashMap<String, i64>) -> Result<()> {
        let mut ordered: Vec<(&String, &i64)> = settings.iter().collect();
        ordered.sort_by(|a, b| (!a.0.contains("auto"), a.0).cmp(&(!b.0.contains("auto"), b.0)));

        for (name, &value) in ordered {
            // Flags may change after an auto mode switch
            self.refresh_flags(name);

            let Some(control) = self.find(name) else {
                warn!("Camera has no control named '{}'", name);
                continue;
            };
            if !control.writable() {
                debug!("Skipping read-only/inactive control: {}", name);
                continue;
            }
            if control.control_type == ControlType::Unsupported {
                warn!("Control '{}' has an unsupported type", name);
                continue;
            }

            let clamped = clamp_to_range(value, control.minimum, control.maximum);
            if clamped != value {
                warn!(
                    "Control '{}' value {} outside [{}, {}], using {}",
                    name, value, control.minimum, control.maximum, clamped
                );
            }

            let id = control.id;
            if let Err(e) = self.set_control(id, clamped) {
                warn!("Failed to apply setting '{}': {:#}", name, e);
            }
        }

        Ok(())
    }

    fn refresh_flags(&mut self, key: &str) {
        let Ok(device) = Device::with_path(&self.device_path) else {
            return;
        };
        let Ok(descriptions) = device.query_controls() else {
            return;
        };
        let key = normalize_name(key);
        for desc in descriptions {
            if normalize_name(&desc.name) != key {
                continue;
            }
            if let Some(control) = self.controls.iter_mut().find(|c| c.id == desc.id) {
                control.read_only = desc.flags.contains(Flags::READ_ONLY);
                control.inactive = desc.flags.contains(Flags::INACTIVE);
            }
        }
    }
}

fn clamp_to_range(value: i64, minimum: i64, maximum: i64) -> i64 {
    if minimum > maximum {
        return value;
    }
    value.clamp(minimum, maximum)
}
