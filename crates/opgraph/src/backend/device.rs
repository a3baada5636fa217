use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail};

use crate::backend::hashing::{FingerprintHasher, StructuralHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Tpu,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Cpu => "CPU",
            DeviceType::Gpu => "GPU",
            DeviceType::Tpu => "TPU",
        }
    }
}

/// Execution target, rendered and parsed as `"CPU:0"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Device {
    pub hw_type: DeviceType,
    pub ordinal: usize,
}

impl Device {
    pub fn new(hw_type: DeviceType, ordinal: usize) -> Self {
        Self { hw_type, ordinal }
    }

    pub fn cpu(ordinal: usize) -> Self {
        Self::new(DeviceType::Cpu, ordinal)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hw_type.as_str(), self.ordinal)
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, ordinal) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid device spec '{s}': expected TYPE:ORDINAL"))?;
        let hw_type = match kind.trim().to_ascii_uppercase().as_str() {
            "CPU" => DeviceType::Cpu,
            "GPU" => DeviceType::Gpu,
            "TPU" => DeviceType::Tpu,
            other => bail!("unknown device type '{other}' in '{s}'"),
        };
        let ordinal = ordinal
            .trim()
            .parse::<usize>()
            .map_err(|err| anyhow!("invalid device ordinal in '{s}': {err}"))?;
        Ok(Device { hw_type, ordinal })
    }
}

impl StructuralHash for Device {
    fn structural_hash(&self, hasher: &mut FingerprintHasher) {
        hasher.write_str(self.hw_type.as_str());
        hasher.write(&self.ordinal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_renders_round_trip_form() {
        let device: Device = "gpu:3".parse().unwrap();
        assert_eq!(device, Device::new(DeviceType::Gpu, 3));
        assert_eq!(device.to_string(), "GPU:3");
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!("CPU".parse::<Device>().is_err());
        assert!("FPGA:0".parse::<Device>().is_err());
        assert!("CPU:x".parse::<Device>().is_err());
    }
}
