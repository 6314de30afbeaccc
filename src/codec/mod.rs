//! Block codec registry: string tags, frozen on-disk ids, pluggable
//! encode/decode.
//!
//! # Identity rules
//! Every codec has a string tag (what the dataset header and the HTTP
//! `compression=` parameter carry) and a frozen one-byte on-disk id (what
//! the block-file directory stores). On-disk ids are permanent: an id is
//! NEVER reused, even if a codec is retired. Readers MUST fail hard on an
//! id they cannot supply — no fallback, no negotiation.
//!
//! # Lossy codecs
//! `jpg` is lossy and `zfp` is reserved as lossy; both are restricted to
//! the dtypes they can represent, checked before any encode. `png` is
//! lossless but shares the dtype restriction (unsigned 8/16-bit, 2-D
//! dims). Mixing lossy encodings within one block's lifetime is rejected
//! by the access layer.
//!
//! # Cancellation
//! `decode` takes the query's abort token and checks it cooperatively, so
//! a cancelled query never waits on a large inflate.

use std::io::Read;
use thiserror::Error;

use crate::dtype::{DType, ScalarKind};
use crate::query::Aborted;
use crate::space::PointN;

// ── Frozen on-disk ids ───────────────────────────────────────────────────────
//
// These values appear in every block directory entry. Permanent.

pub const DISK_ID_RAW: u8 = 0;
pub const DISK_ID_ZIP: u8 = 1;
pub const DISK_ID_LZ4: u8 = 2;
pub const DISK_ID_ZSTD: u8 = 3;
pub const DISK_ID_PNG: u8 = 4;
pub const DISK_ID_JPG: u8 = 5;
pub const DISK_ID_ZFP: u8 = 6;

// ── CodecTag ─────────────────────────────────────────────────────────────────

/// Runtime codec discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecTag {
    Raw,
    Zip,
    Lz4,
    Zstd,
    Png,
    Jpg,
    Zfp,
}

impl CodecTag {
    /// Frozen one-byte id written into block directories.
    pub fn disk_id(self) -> u8 {
        match self {
            CodecTag::Raw => DISK_ID_RAW,
            CodecTag::Zip => DISK_ID_ZIP,
            CodecTag::Lz4 => DISK_ID_LZ4,
            CodecTag::Zstd => DISK_ID_ZSTD,
            CodecTag::Png => DISK_ID_PNG,
            CodecTag::Jpg => DISK_ID_JPG,
            CodecTag::Zfp => DISK_ID_ZFP,
        }
    }

    pub fn from_disk_id(id: u8) -> Option<Self> {
        match id {
            DISK_ID_RAW => Some(CodecTag::Raw),
            DISK_ID_ZIP => Some(CodecTag::Zip),
            DISK_ID_LZ4 => Some(CodecTag::Lz4),
            DISK_ID_ZSTD => Some(CodecTag::Zstd),
            DISK_ID_PNG => Some(CodecTag::Png),
            DISK_ID_JPG => Some(CodecTag::Jpg),
            DISK_ID_ZFP => Some(CodecTag::Zfp),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecTag::Raw => "raw",
            CodecTag::Zip => "zip",
            CodecTag::Lz4 => "lz4",
            CodecTag::Zstd => "zstd",
            CodecTag::Png => "png",
            CodecTag::Jpg => "jpg",
            CodecTag::Zfp => "zfp",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "raw" => Some(CodecTag::Raw),
            "zip" => Some(CodecTag::Zip),
            "lz4" => Some(CodecTag::Lz4),
            "zstd" => Some(CodecTag::Zstd),
            "png" => Some(CodecTag::Png),
            "jpg" | "jpeg" => Some(CodecTag::Jpg),
            "zfp" => Some(CodecTag::Zfp),
            _ => None,
        }
    }

    /// A lossy codec may return a payload that does not decode
    /// byte-for-byte; the block directory flags such blocks.
    pub fn is_lossy(self) -> bool {
        matches!(self, CodecTag::Jpg | CodecTag::Zfp)
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    /// Decoded payload has the wrong size for the declared block geometry.
    #[error("decoded {got} bytes where {expected} were expected")]
    Truncated { expected: usize, got: usize },
    /// Payload is present but does not belong to the named codec.
    #[error("payload does not match codec {0}")]
    Mismatch(&'static str),
    #[error("codec {codec} cannot represent dtype {dtype}")]
    Incompatible { codec: &'static str, dtype: String },
    /// Emitted for a tag this build recognizes but cannot supply.
    /// Decoding MUST NOT continue — fail hard, never fall back.
    #[error("codec {0} is not available in this build")]
    Unavailable(&'static str),
    #[error("decode aborted")]
    Aborted,
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn tag(&self) -> CodecTag;

    /// Check that this codec can represent `dtype` over `dims` at all.
    /// The default accepts everything; lossy/image codecs narrow it.
    fn check_compatible(&self, _dtype: DType, _dims: &PointN) -> Result<(), CodecError> {
        Ok(())
    }

    fn encode(&self, raw: &[u8], dtype: DType, dims: &PointN) -> Result<Vec<u8>, CodecError>;

    /// Decode `enc`; the output must hold exactly
    /// `dtype.size() * dims.product()` bytes.
    fn decode(
        &self,
        enc: &[u8],
        dtype: DType,
        dims: &PointN,
        aborted: &Aborted,
    ) -> Result<Vec<u8>, CodecError>;
}

/// Resolve a tag to its codec. `zfp` is recognized but unavailable in this
/// build; the caller MUST NOT substitute another codec for it.
pub fn get_codec(tag: CodecTag) -> Result<Box<dyn Codec>, CodecError> {
    match tag {
        CodecTag::Raw => Ok(Box::new(RawCodec)),
        CodecTag::Zip => Ok(Box::new(ZipCodec)),
        CodecTag::Lz4 => Ok(Box::new(Lz4Codec)),
        CodecTag::Zstd => Ok(Box::new(ZstdCodec)),
        CodecTag::Png => Ok(Box::new(PngCodec)),
        CodecTag::Jpg => Ok(Box::new(JpgCodec)),
        CodecTag::Zfp => Err(CodecError::Unavailable("zfp")),
    }
}

fn expected_bytes(dtype: DType, dims: &PointN) -> usize {
    dtype.size() * dims.product() as usize
}

fn check_decoded_size(out: &[u8], dtype: DType, dims: &PointN) -> Result<(), CodecError> {
    let expected = expected_bytes(dtype, dims);
    if out.len() != expected {
        return Err(CodecError::Truncated { expected, got: out.len() });
    }
    Ok(())
}

// ── raw ──────────────────────────────────────────────────────────────────────

pub struct RawCodec;

impl Codec for RawCodec {
    fn tag(&self) -> CodecTag {
        CodecTag::Raw
    }
    fn encode(&self, raw: &[u8], _: DType, _: &PointN) -> Result<Vec<u8>, CodecError> {
        Ok(raw.to_vec())
    }
    fn decode(
        &self,
        enc: &[u8],
        dtype: DType,
        dims: &PointN,
        _: &Aborted,
    ) -> Result<Vec<u8>, CodecError> {
        check_decoded_size(enc, dtype, dims)?;
        Ok(enc.to_vec())
    }
}

// ── zip (deflate/zlib) ───────────────────────────────────────────────────────

pub struct ZipCodec;

impl Codec for ZipCodec {
    fn tag(&self) -> CodecTag {
        CodecTag::Zip
    }
    fn encode(&self, raw: &[u8], _: DType, _: &PointN) -> Result<Vec<u8>, CodecError> {
        let mut enc = flate2::read::ZlibEncoder::new(raw, flate2::Compression::default());
        let mut out = Vec::new();
        enc.read_to_end(&mut out)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(out)
    }
    fn decode(
        &self,
        enc: &[u8],
        dtype: DType,
        dims: &PointN,
        aborted: &Aborted,
    ) -> Result<Vec<u8>, CodecError> {
        let expected = expected_bytes(dtype, dims);
        let mut dec = flate2::read::ZlibDecoder::new(enc);
        let mut out = Vec::with_capacity(expected);
        let mut chunk = [0u8; 64 * 1024];
        loop {
            if aborted.get() {
                return Err(CodecError::Aborted);
            }
            match dec.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if out.len() + n > expected {
                        return Err(CodecError::Truncated { expected, got: out.len() + n });
                    }
                    out.extend_from_slice(&chunk[..n]);
                }
                Err(e) => return Err(CodecError::Decode(e.to_string())),
            }
        }
        check_decoded_size(&out, dtype, dims)?;
        Ok(out)
    }
}

// ── lz4 ──────────────────────────────────────────────────────────────────────

pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn tag(&self) -> CodecTag {
        CodecTag::Lz4
    }
    fn encode(&self, raw: &[u8], _: DType, _: &PointN) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(raw))
    }
    fn decode(
        &self,
        enc: &[u8],
        dtype: DType,
        dims: &PointN,
        aborted: &Aborted,
    ) -> Result<Vec<u8>, CodecError> {
        if aborted.get() {
            return Err(CodecError::Aborted);
        }
        let out = lz4_flex::decompress_size_prepended(enc)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        check_decoded_size(&out, dtype, dims)?;
        Ok(out)
    }
}

// ── zstd ─────────────────────────────────────────────────────────────────────

pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn tag(&self) -> CodecTag {
        CodecTag::Zstd
    }
    fn encode(&self, raw: &[u8], _: DType, _: &PointN) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(raw, 3).map_err(|e| CodecError::Encode(e.to_string()))
    }
    fn decode(
        &self,
        enc: &[u8],
        dtype: DType,
        dims: &PointN,
        aborted: &Aborted,
    ) -> Result<Vec<u8>, CodecError> {
        if aborted.get() {
            return Err(CodecError::Aborted);
        }
        let out = zstd::decode_all(enc).map_err(|e| CodecError::Decode(e.to_string()))?;
        check_decoded_size(&out, dtype, dims)?;
        Ok(out)
    }
}

// ── png ──────────────────────────────────────────────────────────────────────

/// Lossless image codec; unsigned 8/16-bit samples with 1–4 components
/// over 2-D dims.
pub struct PngCodec;

fn image_dims(dims: &PointN) -> Option<(u32, u32)> {
    // 2-D, or higher-dimensional with every trailing extent equal to 1.
    if dims.pdim() < 2 || dims.as_slice()[2..].iter().any(|&n| n != 1) {
        return None;
    }
    Some((dims[0] as u32, dims[1] as u32))
}

fn png_color(ncomponents: usize) -> Option<png::ColorType> {
    match ncomponents {
        1 => Some(png::ColorType::Grayscale),
        2 => Some(png::ColorType::GrayscaleAlpha),
        3 => Some(png::ColorType::Rgb),
        4 => Some(png::ColorType::Rgba),
        _ => None,
    }
}

fn swap_u16(buf: &mut [u8]) {
    for pair in buf.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

impl Codec for PngCodec {
    fn tag(&self) -> CodecTag {
        CodecTag::Png
    }

    fn check_compatible(&self, dtype: DType, dims: &PointN) -> Result<(), CodecError> {
        let ok = matches!(dtype.kind, ScalarKind::U8 | ScalarKind::U16)
            && png_color(dtype.ncomponents).is_some()
            && image_dims(dims).is_some();
        if !ok {
            return Err(CodecError::Incompatible { codec: "png", dtype: dtype.to_string() });
        }
        Ok(())
    }

    fn encode(&self, raw: &[u8], dtype: DType, dims: &PointN) -> Result<Vec<u8>, CodecError> {
        self.check_compatible(dtype, dims)?;
        let (w, h) = image_dims(dims).unwrap();
        let color = png_color(dtype.ncomponents).unwrap();
        let depth = match dtype.kind {
            ScalarKind::U8 => png::BitDepth::Eight,
            _ => png::BitDepth::Sixteen,
        };

        let mut out = Vec::new();
        {
            let mut enc = png::Encoder::new(&mut out, w, h);
            enc.set_color(color);
            enc.set_depth(depth);
            let mut writer = enc
                .write_header()
                .map_err(|e| CodecError::Encode(e.to_string()))?;
            if dtype.kind == ScalarKind::U16 {
                // PNG carries 16-bit samples big-endian.
                let mut be = raw.to_vec();
                swap_u16(&mut be);
                writer
                    .write_image_data(&be)
                    .map_err(|e| CodecError::Encode(e.to_string()))?;
            } else {
                writer
                    .write_image_data(raw)
                    .map_err(|e| CodecError::Encode(e.to_string()))?;
            }
            writer
                .finish()
                .map_err(|e| CodecError::Encode(e.to_string()))?;
        }
        Ok(out)
    }

    fn decode(
        &self,
        enc: &[u8],
        dtype: DType,
        dims: &PointN,
        aborted: &Aborted,
    ) -> Result<Vec<u8>, CodecError> {
        self.check_compatible(dtype, dims)?;
        if aborted.get() {
            return Err(CodecError::Aborted);
        }
        let decoder = png::Decoder::new(enc);
        let mut reader = decoder
            .read_info()
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        let mut buf = vec![0u8; reader.output_buffer_size()];
        let info = reader
            .next_frame(&mut buf)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        let (w, h) = image_dims(dims).unwrap();
        if info.width != w || info.height != h {
            return Err(CodecError::Mismatch("png"));
        }
        buf.truncate(info.buffer_size());
        if dtype.kind == ScalarKind::U16 {
            swap_u16(&mut buf);
        }
        check_decoded_size(&buf, dtype, dims)?;
        Ok(buf)
    }
}

// ── jpg ──────────────────────────────────────────────────────────────────────

/// Lossy image codec; u8 samples with 1 or 3 components over 2-D dims.
pub struct JpgCodec;

const JPG_QUALITY: u8 = 90;

impl Codec for JpgCodec {
    fn tag(&self) -> CodecTag {
        CodecTag::Jpg
    }

    fn check_compatible(&self, dtype: DType, dims: &PointN) -> Result<(), CodecError> {
        let ok = dtype.kind == ScalarKind::U8
            && matches!(dtype.ncomponents, 1 | 3)
            && image_dims(dims).is_some();
        if !ok {
            return Err(CodecError::Incompatible { codec: "jpg", dtype: dtype.to_string() });
        }
        Ok(())
    }

    fn encode(&self, raw: &[u8], dtype: DType, dims: &PointN) -> Result<Vec<u8>, CodecError> {
        self.check_compatible(dtype, dims)?;
        let (w, h) = image_dims(dims).unwrap();
        if w > u16::MAX as u32 || h > u16::MAX as u32 {
            return Err(CodecError::Incompatible { codec: "jpg", dtype: dtype.to_string() });
        }
        let color = if dtype.ncomponents == 1 {
            jpeg_encoder::ColorType::Luma
        } else {
            jpeg_encoder::ColorType::Rgb
        };
        let mut out = Vec::new();
        let encoder = jpeg_encoder::Encoder::new(&mut out, JPG_QUALITY);
        encoder
            .encode(raw, w as u16, h as u16, color)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(out)
    }

    fn decode(
        &self,
        enc: &[u8],
        dtype: DType,
        dims: &PointN,
        aborted: &Aborted,
    ) -> Result<Vec<u8>, CodecError> {
        self.check_compatible(dtype, dims)?;
        if aborted.get() {
            return Err(CodecError::Aborted);
        }
        let mut decoder = jpeg_decoder::Decoder::new(enc);
        let out = decoder
            .decode()
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        let info = decoder.info().ok_or(CodecError::Mismatch("jpg"))?;
        let (w, h) = image_dims(dims).unwrap();
        if info.width as u32 != w || info.height as u32 != h {
            return Err(CodecError::Mismatch("jpg"));
        }
        check_decoded_size(&out, dtype, dims)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims2(w: i64, h: i64) -> PointN {
        PointN::from_slice(&[w, h])
    }

    fn none() -> Aborted {
        Aborted::new()
    }

    #[test]
    fn tags_roundtrip() {
        for tag in [
            CodecTag::Raw,
            CodecTag::Zip,
            CodecTag::Lz4,
            CodecTag::Zstd,
            CodecTag::Png,
            CodecTag::Jpg,
            CodecTag::Zfp,
        ] {
            assert_eq!(CodecTag::from_name(tag.name()), Some(tag));
            assert_eq!(CodecTag::from_disk_id(tag.disk_id()), Some(tag));
        }
        assert_eq!(CodecTag::from_name("gzip"), None);
        assert_eq!(CodecTag::from_disk_id(200), None);
    }

    #[test]
    fn lossless_roundtrip() {
        let dtype = DType::parse("u16").unwrap();
        let dims = dims2(8, 8);
        let raw: Vec<u8> = (0..128u32).map(|i| (i * 7 % 256) as u8).collect();
        for tag in [CodecTag::Raw, CodecTag::Zip, CodecTag::Lz4, CodecTag::Zstd] {
            let c = get_codec(tag).unwrap();
            let enc = c.encode(&raw, dtype, &dims).unwrap();
            let dec = c.decode(&enc, dtype, &dims, &none()).unwrap();
            assert_eq!(dec, raw, "codec {}", tag.name());
        }
    }

    #[test]
    fn png_roundtrip_u8_and_u16() {
        let dims = dims2(4, 4);
        for dtype_s in ["u8", "u16", "u8*3"] {
            let dtype = DType::parse(dtype_s).unwrap();
            let raw: Vec<u8> =
                (0..dtype.size() * 16).map(|i| (i * 13 % 251) as u8).collect();
            let c = get_codec(CodecTag::Png).unwrap();
            let enc = c.encode(&raw, dtype, &dims).unwrap();
            let dec = c.decode(&enc, dtype, &dims, &none()).unwrap();
            assert_eq!(dec, raw, "png {dtype_s}");
        }
    }

    #[test]
    fn jpg_is_lossy_but_shaped() {
        let dtype = DType::parse("u8").unwrap();
        let dims = dims2(16, 16);
        let raw: Vec<u8> = (0..256).map(|i| (i / 16 * 16) as u8).collect();
        let c = get_codec(CodecTag::Jpg).unwrap();
        let enc = c.encode(&raw, dtype, &dims).unwrap();
        let dec = c.decode(&enc, dtype, &dims, &none()).unwrap();
        assert_eq!(dec.len(), raw.len());
    }

    #[test]
    fn incompatible_dtypes_rejected() {
        let f32s = DType::parse("f32").unwrap();
        let dims = dims2(4, 4);
        assert!(matches!(
            get_codec(CodecTag::Png).unwrap().encode(&[0u8; 64], f32s, &dims),
            Err(CodecError::Incompatible { .. })
        ));
        assert!(matches!(
            get_codec(CodecTag::Jpg).unwrap().encode(&[0u8; 64], f32s, &dims),
            Err(CodecError::Incompatible { .. })
        ));
    }

    #[test]
    fn zfp_fails_hard() {
        assert!(matches!(get_codec(CodecTag::Zfp), Err(CodecError::Unavailable("zfp"))));
    }

    #[test]
    fn truncated_payload_detected() {
        let dtype = DType::parse("u8").unwrap();
        let dims = dims2(8, 8);
        let c = get_codec(CodecTag::Raw).unwrap();
        assert!(matches!(
            c.decode(&[0u8; 7], dtype, &dims, &none()),
            Err(CodecError::Truncated { expected: 64, got: 7 })
        ));
    }

    #[test]
    fn aborted_decode_stops() {
        let dtype = DType::parse("u8").unwrap();
        let dims = dims2(32, 32);
        let raw = vec![7u8; 1024];
        let c = get_codec(CodecTag::Zip).unwrap();
        let enc = c.encode(&raw, dtype, &dims).unwrap();
        let aborted = Aborted::new();
        aborted.set();
        assert!(matches!(
            c.decode(&enc, dtype, &dims, &aborted),
            Err(CodecError::Aborted)
        ));
    }
}
