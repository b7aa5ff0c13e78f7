//! Representation changes for KV pages on tier transitions.
//!
//! Device memory always holds FP16. Slower tiers may hold group-wise int8
//! (one FP16 scale per group, symmetric absmax) and the remote tier may add
//! zstd on top. Every conversion goes through FP16, so a page can move
//! between any two tiers regardless of how it got where it is.
//!
//! Int8 layout: `[elements: u32 LE][group_size: u16 LE]` followed by, for
//! each group, an FP16 scale and then the group's `i8` values.

use half::f16;
use thiserror::Error;

use crate::cache::page::{PageFormat, Tier};
use crate::config::CompressionConfig;

const HEADER_LEN: usize = 6;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("FP16 payload has odd length {0}")]
    OddLength(usize),

    #[error("Malformed int8 payload: {0}")]
    Malformed(&'static str),
}

/// The compression engine handles format transitions between tiers.
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Representation a page takes when it lands in `tier`.
    pub fn format_for_tier(&self, tier: Tier) -> PageFormat {
        match tier {
            Tier::DeviceMemory => PageFormat::Fp16,
            Tier::HostMemory if self.config.host_quantize => PageFormat::Int8,
            Tier::HostMemory => PageFormat::Fp16,
            Tier::LocalStorage if self.config.storage_quantize => PageFormat::Int8,
            Tier::LocalStorage => PageFormat::Fp16,
            Tier::RemoteObject if self.config.remote_zstd => PageFormat::Int8Zstd,
            Tier::RemoteObject if self.config.storage_quantize => PageFormat::Int8,
            Tier::RemoteObject => PageFormat::Fp16,
        }
    }

    /// Encode FP16 bytes into `format`.
    pub fn encode(&self, fp16: &[u8], format: PageFormat) -> Result<Vec<u8>, CompressionError> {
        match format {
            PageFormat::Fp16 => Ok(fp16.to_vec()),
            PageFormat::Int8 => self.quantize_int8(fp16),
            PageFormat::Int8Zstd => {
                let quantized = self.quantize_int8(fp16)?;
                self.zstd_compress(&quantized)
            }
        }
    }

    /// Decode bytes stored as `format` back to FP16.
    pub fn decode(&self, data: &[u8], format: PageFormat) -> Result<Vec<u8>, CompressionError> {
        match format {
            PageFormat::Fp16 => Ok(data.to_vec()),
            PageFormat::Int8 => self.dequantize_int8(data),
            PageFormat::Int8Zstd => {
                let quantized = self.zstd_decompress(data)?;
                self.dequantize_int8(&quantized)
            }
        }
    }

    /// Re-encode stored bytes from one representation to another.
    pub fn convert(
        &self,
        data: &[u8],
        from: PageFormat,
        to: PageFormat,
    ) -> Result<Vec<u8>, CompressionError> {
        if from == to {
            return Ok(data.to_vec());
        }
        let fp16 = self.decode(data, from)?;
        self.encode(&fp16, to)
    }

    fn quantize_int8(&self, fp16: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if fp16.len() % 2 != 0 {
            return Err(CompressionError::OddLength(fp16.len()));
        }
        let values: Vec<f32> = fp16
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect();
        let group_size = self.config.group_size.clamp(1, u16::MAX as usize);
        let groups = values.len().div_ceil(group_size);

        let mut out = Vec::with_capacity(HEADER_LEN + groups * 2 + values.len());
        out.extend_from_slice(&(values.len() as u32).to_le_bytes());
        out.extend_from_slice(&(group_size as u16).to_le_bytes());

        for group in values.chunks(group_size) {
            let absmax = group.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            let scale = if absmax > 0.0 { absmax / 127.0 } else { 1.0 };
            let scale_h = f16::from_f32(scale);
            // Quantize against the scale that will actually be stored.
            let stored_scale = scale_h.to_f32().max(f32::MIN_POSITIVE);
            out.extend_from_slice(&scale_h.to_le_bytes());
            out.extend(
                group
                    .iter()
                    .map(|v| (v / stored_scale).round().clamp(-127.0, 127.0) as i8 as u8),
            );
        }
        Ok(out)
    }

    fn dequantize_int8(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if data.len() < HEADER_LEN {
            return Err(CompressionError::Malformed("truncated header"));
        }
        let elements = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let group_size = u16::from_le_bytes([data[4], data[5]]) as usize;
        if group_size == 0 {
            return Err(CompressionError::Malformed("zero group size"));
        }

        let mut values: Vec<f16> = Vec::with_capacity(elements);
        let mut body = &data[HEADER_LEN..];
        let mut remaining = elements;
        while remaining > 0 {
            let n = remaining.min(group_size);
            if body.len() < 2 + n {
                return Err(CompressionError::Malformed("truncated group"));
            }
            let scale = f16::from_le_bytes([body[0], body[1]]).to_f32();
            values.extend(
                body[2..2 + n]
                    .iter()
                    .map(|&q| f16::from_f32(q as i8 as f32 * scale)),
            );
            body = &body[2 + n..];
            remaining -= n;
        }
        if !body.is_empty() {
            return Err(CompressionError::Malformed("trailing bytes"));
        }
        Ok(bytemuck::cast_slice(&values).to_vec())
    }

    /// Compress data with zstd.
    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let compressed = zstd::encode_all(data, self.config.zstd_level)?;
        Ok(compressed)
    }

    /// Decompress zstd data.
    fn zstd_decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let decompressed = zstd::decode_all(data)?;
        Ok(decompressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp16_bytes(values: &[f32]) -> Vec<u8> {
        let halves: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
        bytemuck::cast_slice(&halves).to_vec()
    }

    fn to_f32(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect()
    }

    #[test]
    fn test_zstd_roundtrip() {
        let compressor = Compressor::new(CompressionConfig::default());
        let data = vec![42u8; 4096];

        let compressed = compressor.zstd_compress(&data).unwrap();
        assert!(compressed.len() < data.len()); // should compress well

        let decompressed = compressor.zstd_decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_int8_error_bounded_by_group_scale() {
        let compressor = Compressor::new(CompressionConfig::default());
        let values: Vec<f32> = (0..100).map(|i| (i as f32 - 50.0) * 0.37).collect();
        let fp16 = fp16_bytes(&values);

        let q = compressor.encode(&fp16, PageFormat::Int8).unwrap();
        // 100 elements, 4 groups of <= 32: header + 4 scales + 100 values
        assert_eq!(q.len(), HEADER_LEN + 4 * 2 + 100);
        assert!(q.len() < fp16.len());

        let back = to_f32(&compressor.decode(&q, PageFormat::Int8).unwrap());
        assert_eq!(back.len(), values.len());
        let absmax = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        for (a, b) in values.iter().zip(&back) {
            assert!((a - b).abs() <= absmax / 127.0 + 0.05, "{a} vs {b}");
        }
    }

    #[test]
    fn test_zero_group_survives() {
        let compressor = Compressor::new(CompressionConfig::default());
        let fp16 = fp16_bytes(&[0.0; 40]);
        let q = compressor.encode(&fp16, PageFormat::Int8Zstd).unwrap();
        let back = compressor.decode(&q, PageFormat::Int8Zstd).unwrap();
        assert_eq!(back, fp16);
    }

    #[test]
    fn test_format_per_tier_flags() {
        let compressor = Compressor::new(CompressionConfig::default());
        assert_eq!(compressor.format_for_tier(Tier::DeviceMemory), PageFormat::Fp16);
        assert_eq!(compressor.format_for_tier(Tier::HostMemory), PageFormat::Fp16);
        assert_eq!(compressor.format_for_tier(Tier::LocalStorage), PageFormat::Int8);
        assert_eq!(compressor.format_for_tier(Tier::RemoteObject), PageFormat::Int8Zstd);

        let compressor = Compressor::new(CompressionConfig {
            host_quantize: true,
            remote_zstd: false,
            storage_quantize: false,
            ..Default::default()
        });
        assert_eq!(compressor.format_for_tier(Tier::HostMemory), PageFormat::Int8);
        assert_eq!(compressor.format_for_tier(Tier::RemoteObject), PageFormat::Fp16);
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let compressor = Compressor::new(CompressionConfig::default());
        assert!(compressor.decode(&[1, 2, 3], PageFormat::Int8).is_err());
        assert!(matches!(
            compressor.encode(&[1, 2, 3], PageFormat::Int8),
            Err(CompressionError::OddLength(3))
        ));
    }
}
