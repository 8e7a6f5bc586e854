//! Typed access to a remote parameter dictionary.
//!
//! Nothing is cached: every read and write goes to the device. Numeric
//! parameters are read together with their limits so callers can check a new
//! value before the device rejects it.

use tracing::{debug, instrument};

use crate::device::{ParameterKind, ParameterMap, ParameterValue, RemoteError};
use crate::error::{CameraError, Result};

/// `{min, current, max}` of a numeric parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericRange<T> {
    pub min: T,
    pub current: T,
    pub max: T,
}

impl<T: PartialOrd + Copy> NumericRange<T> {
    pub fn contains(&self, value: T) -> bool {
        self.min <= value && value <= self.max
    }
}

impl NumericRange<i64> {
    /// `current + delta`, if it stays inside the limits.
    pub fn offset(&self, delta: i64) -> Option<i64> {
        self.current
            .checked_add(delta)
            .filter(|target| self.contains(*target))
    }
}

impl NumericRange<f64> {
    /// `current + delta`, if it stays inside the limits.
    pub fn offset(&self, delta: f64) -> Option<f64> {
        let target = self.current + delta;
        self.contains(target).then_some(target)
    }
}

/// Decoded value of a parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterReading {
    /// Enumerations are reported by their symbolic entry name
    Enumeration(String),
    Boolean(bool),
    Text(String),
    Integer(NumericRange<i64>),
    Float(NumericRange<f64>),
}

impl ParameterReading {
    pub fn kind(&self) -> ParameterKind {
        match self {
            ParameterReading::Enumeration(_) => ParameterKind::Enumeration,
            ParameterReading::Boolean(_) => ParameterKind::Boolean,
            ParameterReading::Text(_) => ParameterKind::String,
            ParameterReading::Integer(_) => ParameterKind::Integer,
            ParameterReading::Float(_) => ParameterKind::Float,
        }
    }

    /// Symbolic value of enumeration and string parameters.
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            ParameterReading::Enumeration(s) | ParameterReading::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Current value of a numeric parameter.
    pub fn current(&self) -> Option<f64> {
        match self {
            ParameterReading::Integer(range) => Some(range.current as f64),
            ParameterReading::Float(range) => Some(range.current),
            _ => None,
        }
    }
}

/// Read a parameter.
///
/// Returns `Ok(None)` when the dictionary has no such parameter or its kind
/// carries no value (commands, registers), so "not present" stays distinct
/// from "present but unreadable".
pub fn get_parameter(name: &str, params: &dyn ParameterMap) -> Result<Option<ParameterReading>> {
    let Some(handle) = params.get(name) else {
        return Ok(None);
    };

    let read_failure = |e: RemoteError| CameraError::ParameterReadFailure {
        name: name.to_owned(),
        description: e.description,
    };

    let reading = match handle.kind() {
        ParameterKind::Enumeration => match handle.value().map_err(read_failure)? {
            ParameterValue::Enumeration(symbol) | ParameterValue::String(symbol) => {
                ParameterReading::Enumeration(symbol)
            }
            other => return Err(unexpected(name, &other)),
        },
        ParameterKind::Boolean => match handle.value().map_err(read_failure)? {
            ParameterValue::Boolean(v) => ParameterReading::Boolean(v),
            other => return Err(unexpected(name, &other)),
        },
        ParameterKind::String => match handle.value().map_err(read_failure)? {
            ParameterValue::String(s) => ParameterReading::Text(s),
            other => return Err(unexpected(name, &other)),
        },
        ParameterKind::Integer => {
            let min = handle.min().map_err(read_failure)?;
            let current = handle.value().map_err(read_failure)?;
            let max = handle.max().map_err(read_failure)?;
            match (min, current, max) {
                (
                    ParameterValue::Integer(min),
                    ParameterValue::Integer(current),
                    ParameterValue::Integer(max),
                ) => ParameterReading::Integer(NumericRange { min, current, max }),
                (_, other, _) => return Err(unexpected(name, &other)),
            }
        }
        ParameterKind::Float => {
            let as_float = |v: ParameterValue| {
                v.as_f64().ok_or_else(|| unexpected(name, &v))
            };
            let min = as_float(handle.min().map_err(read_failure)?)?;
            let current = as_float(handle.value().map_err(read_failure)?)?;
            let max = as_float(handle.max().map_err(read_failure)?)?;
            ParameterReading::Float(NumericRange { min, current, max })
        }
        ParameterKind::Command | ParameterKind::Register => return Ok(None),
    };

    Ok(Some(reading))
}

fn unexpected(name: &str, value: &ParameterValue) -> CameraError {
    CameraError::ParameterReadFailure {
        name: name.to_owned(),
        description: format!("unexpected value {value:?}"),
    }
}

/// Write a parameter after checking that it is available and readable.
#[instrument(skip(value, params))]
pub fn set_parameter(
    name: &str,
    value: impl Into<ParameterValue>,
    params: &dyn ParameterMap,
) -> Result<()> {
    let value = value.into();

    let handle = params
        .get(name)
        .ok_or_else(|| CameraError::ParameterNotAvailable {
            name: name.to_owned(),
        })?;

    if !handle.is_available() {
        return Err(CameraError::ParameterNotAvailable {
            name: name.to_owned(),
        });
    }
    if !handle.is_readable() {
        return Err(CameraError::ParameterNotReadable {
            name: name.to_owned(),
        });
    }

    debug!(%value, "Setting parameter");
    handle
        .set_value(value)
        .map_err(|e| CameraError::ParameterSetFailure {
            name: name.to_owned(),
            description: e.description,
        })
}

/// Move a numeric parameter by `delta`, refusing targets outside its limits.
///
/// The range check happens before anything is written, so an out-of-range
/// request never reaches the device. Returns the value written.
pub fn step_parameter(name: &str, delta: f64, params: &dyn ParameterMap) -> Result<ParameterValue> {
    let reading =
        get_parameter(name, params)?.ok_or_else(|| CameraError::ParameterNotAvailable {
            name: name.to_owned(),
        })?;

    let target = match reading {
        ParameterReading::Integer(range) => {
            let delta = delta.round() as i64;
            let target = range.offset(delta).ok_or(CameraError::ParameterOutOfRange {
                name: name.to_owned(),
                requested: range.current as f64 + delta as f64,
                min: range.min as f64,
                max: range.max as f64,
            })?;
            ParameterValue::Integer(target)
        }
        ParameterReading::Float(range) => {
            let target = range.offset(delta).ok_or(CameraError::ParameterOutOfRange {
                name: name.to_owned(),
                requested: range.current + delta,
                min: range.min,
                max: range.max,
            })?;
            ParameterValue::Float(target)
        }
        _ => {
            return Err(CameraError::ParameterNotNumeric {
                name: name.to_owned(),
            })
        }
    };

    set_parameter(name, target.clone(), params)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimParameter, SimParameters};

    fn exposure_map() -> SimParameters {
        let params = SimParameters::new();
        params.insert(SimParameter::float("ExposureTime", 1000.0, 5000.0, 9000.0));
        params.insert(SimParameter::integer("Width", 16, 640, 1024));
        params.insert(SimParameter::enumeration(
            "PixelFormat",
            &["Mono8", "BayerRG8", "BayerRG12"],
            "BayerRG12",
        ));
        params.insert(SimParameter::boolean("ReverseX", false));
        params.insert(SimParameter::string("DeviceModelName", "GO-5000C-PGE"));
        params.insert(SimParameter::command("AcquisitionStart"));
        params
    }

    #[test]
    fn absent_parameter_reads_as_none() {
        let params = exposure_map();
        assert_eq!(get_parameter("Gamma", &params).unwrap(), None);
        assert_eq!(get_parameter("AcquisitionStart", &params).unwrap(), None);
    }

    #[test]
    fn readings_are_decoded_by_kind() {
        let params = exposure_map();

        let exposure = get_parameter("ExposureTime", &params).unwrap().unwrap();
        assert_eq!(exposure.kind(), ParameterKind::Float);
        assert_eq!(
            exposure,
            ParameterReading::Float(NumericRange {
                min: 1000.0,
                current: 5000.0,
                max: 9000.0
            })
        );

        let format = get_parameter("PixelFormat", &params).unwrap().unwrap();
        assert_eq!(format, ParameterReading::Enumeration("BayerRG12".into()));
        assert_eq!(format.as_symbol(), Some("BayerRG12"));

        let width = get_parameter("Width", &params).unwrap().unwrap();
        assert_eq!(width.current(), Some(640.0));
        assert_eq!(
            get_parameter("ReverseX", &params).unwrap(),
            Some(ParameterReading::Boolean(false))
        );
        assert_eq!(
            get_parameter("DeviceModelName", &params).unwrap(),
            Some(ParameterReading::Text("GO-5000C-PGE".into()))
        );
    }

    #[test]
    fn failed_read_reports_description() {
        let params = exposure_map();
        params
            .lookup("Width")
            .unwrap()
            .fail_reads(Some("register read timeout"));
        match get_parameter("Width", &params) {
            Err(CameraError::ParameterReadFailure { name, description }) => {
                assert_eq!(name, "Width");
                assert_eq!(description, "register read timeout");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn set_checks_availability_then_readability() {
        let params = exposure_map();

        assert!(matches!(
            set_parameter("Gamma", 1.0, &params),
            Err(CameraError::ParameterNotAvailable { .. })
        ));

        let width = params.lookup("Width").unwrap();
        width.set_available(false);
        assert!(matches!(
            set_parameter("Width", 800i64, &params),
            Err(CameraError::ParameterNotAvailable { .. })
        ));

        width.set_available(true);
        width.set_readable(false);
        assert!(matches!(
            set_parameter("Width", 800i64, &params),
            Err(CameraError::ParameterNotReadable { .. })
        ));
        assert_eq!(width.writes(), 0);
    }

    #[test]
    fn remote_rejection_becomes_set_failure() {
        let params = exposure_map();
        match set_parameter("Width", 4096i64, &params) {
            Err(CameraError::ParameterSetFailure { name, description }) => {
                assert_eq!(name, "Width");
                assert!(description.contains("out of range"));
            }
            other => panic!("unexpected {other:?}"),
        }

        set_parameter("PixelFormat", "BayerRG8", &params).unwrap();
        assert_eq!(
            get_parameter("PixelFormat", &params).unwrap(),
            Some(ParameterReading::Enumeration("BayerRG8".into()))
        );
    }

    #[test]
    fn step_within_limits_is_written() {
        let params = exposure_map();
        let written = step_parameter("ExposureTime", 1000.0, &params).unwrap();
        assert_eq!(written, ParameterValue::Float(6000.0));
        assert_eq!(params.lookup("ExposureTime").unwrap().writes(), 1);
        assert_eq!(
            get_parameter("ExposureTime", &params)
                .unwrap()
                .and_then(|r| r.current()),
            Some(6000.0)
        );
    }

    #[test]
    fn step_past_max_is_rejected_before_writing() {
        let params = exposure_map();
        let err = step_parameter("ExposureTime", 5000.0, &params).unwrap_err();
        match err {
            CameraError::ParameterOutOfRange {
                requested, max, ..
            } => {
                assert_eq!(requested, 10000.0);
                assert_eq!(max, 9000.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(params.lookup("ExposureTime").unwrap().writes(), 0);

        assert!(matches!(
            step_parameter("Width", -1000.0, &params),
            Err(CameraError::ParameterOutOfRange { .. })
        ));
        assert!(matches!(
            step_parameter("PixelFormat", 1.0, &params),
            Err(CameraError::ParameterNotNumeric { .. })
        ));
    }

    #[test]
    fn integer_offsets_respect_limits() {
        let range = NumericRange {
            min: 1000i64,
            current: 5000,
            max: 9000,
        };
        assert_eq!(range.offset(1000), Some(6000));
        assert_eq!(range.offset(4000), Some(9000));
        assert_eq!(range.offset(4001), None);
        assert_eq!(range.offset(-4001), None);
        assert_eq!(range.offset(i64::MAX), None);
    }
}
