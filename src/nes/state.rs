use serde::{Deserialize, Serialize};

use super::apu::Apu;
use super::cpu::DelayedFlag;
use super::mapper::{BoardState, Mapper};
use super::ppu::Ppu;
use super::{Controller, DmaUnit};

/// Bumped whenever the document layout changes incompatibly.
pub const STATE_VERSION: u32 = 1;

/// Serializes byte buffers as standard base64 strings.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CpuState {
    pub(crate) a: u8,
    pub(crate) x: u8,
    pub(crate) y: u8,
    pub(crate) p: u8,
    pub(crate) sp: u8,
    pub(crate) pc: u16,
    pub(crate) cycles: u64,
    pub(crate) nmi: DelayedFlag,
    pub(crate) irq: DelayedFlag,
    pub(crate) prev_nmi_line: bool,
}

/// Everything needed to resume a machine, minus the ROM itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub(crate) version: u32,
    pub(crate) rom_sha1: String,
    pub(crate) cpu: CpuState,
    pub(crate) dma: DmaUnit,
    pub(crate) master_clock: u64,
    pub(crate) ppu_clock: u64,
    pub(crate) open_bus: u8,
    #[serde(with = "base64_bytes")]
    pub(crate) ram: Vec<u8>,
    pub(crate) ppu: Ppu,
    pub(crate) apu: Apu,
    pub(crate) controllers: [Controller; 2],
    pub(crate) mapper: Mapper,
    pub(crate) board: BoardState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn byte_buffers_travel_as_base64() {
        let blob = Blob {
            data: vec![0x00, 0xFF, 0x10],
        };
        let json = serde_json::to_value(&blob).unwrap();
        assert_eq!(json["data"], "AP8Q");
        let back: Blob = serde_json::from_value(json).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn malformed_base64_is_rejected() {
        let result: Result<Blob, _> = serde_json::from_str(r#"{"data":"not base64!"}"#);
        assert!(result.is_err());
    }
}
