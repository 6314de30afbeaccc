//! Sample types: fixed-width scalars and homogeneous vectors of scalars.
//!
//! The textual grammar is `<u|i|f><bits>[*<n>]` — `u8`, `i16`, `f32`,
//! `u8*3`, … — exactly what the dataset header stores. The grammar is
//! frozen; unknown spellings are a parse error, never a guess.

use std::fmt;

/// Scalar kind of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl ScalarKind {
    pub fn size(self) -> usize {
        match self {
            ScalarKind::U8 | ScalarKind::I8 => 1,
            ScalarKind::U16 | ScalarKind::I16 => 2,
            ScalarKind::U32 | ScalarKind::I32 | ScalarKind::F32 => 4,
            ScalarKind::U64 | ScalarKind::I64 | ScalarKind::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarKind::F32 | ScalarKind::F64)
    }

    /// Read one component at byte offset `off` as f64.
    pub fn get_f64(self, buf: &[u8], off: usize) -> f64 {
        match self {
            ScalarKind::U8 => buf[off] as f64,
            ScalarKind::I8 => buf[off] as i8 as f64,
            ScalarKind::U16 => u16::from_le_bytes(buf[off..off + 2].try_into().unwrap()) as f64,
            ScalarKind::I16 => i16::from_le_bytes(buf[off..off + 2].try_into().unwrap()) as f64,
            ScalarKind::U32 => u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as f64,
            ScalarKind::I32 => i32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as f64,
            ScalarKind::U64 => u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()) as f64,
            ScalarKind::I64 => i64::from_le_bytes(buf[off..off + 8].try_into().unwrap()) as f64,
            ScalarKind::F32 => f32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as f64,
            ScalarKind::F64 => f64::from_le_bytes(buf[off..off + 8].try_into().unwrap()),
        }
    }

    /// Store `v` at byte offset `off`, saturating integer kinds.
    pub fn put_f64(self, buf: &mut [u8], off: usize, v: f64) {
        match self {
            ScalarKind::U8 => buf[off] = v.clamp(0.0, u8::MAX as f64) as u8,
            ScalarKind::I8 => buf[off] = v.clamp(i8::MIN as f64, i8::MAX as f64) as i8 as u8,
            ScalarKind::U16 => buf[off..off + 2]
                .copy_from_slice(&(v.clamp(0.0, u16::MAX as f64) as u16).to_le_bytes()),
            ScalarKind::I16 => buf[off..off + 2].copy_from_slice(
                &(v.clamp(i16::MIN as f64, i16::MAX as f64) as i16).to_le_bytes(),
            ),
            ScalarKind::U32 => buf[off..off + 4]
                .copy_from_slice(&(v.clamp(0.0, u32::MAX as f64) as u32).to_le_bytes()),
            ScalarKind::I32 => buf[off..off + 4].copy_from_slice(
                &(v.clamp(i32::MIN as f64, i32::MAX as f64) as i32).to_le_bytes(),
            ),
            ScalarKind::U64 => buf[off..off + 8]
                .copy_from_slice(&(v.clamp(0.0, u64::MAX as f64) as u64).to_le_bytes()),
            ScalarKind::I64 => buf[off..off + 8].copy_from_slice(
                &(v.clamp(i64::MIN as f64, i64::MAX as f64) as i64).to_le_bytes(),
            ),
            ScalarKind::F32 => buf[off..off + 4].copy_from_slice(&(v as f32).to_le_bytes()),
            ScalarKind::F64 => buf[off..off + 8].copy_from_slice(&v.to_le_bytes()),
        }
    }
}

/// A fixed-width scalar or a homogeneous vector of scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DType {
    pub kind:        ScalarKind,
    pub ncomponents: usize,
}

impl DType {
    pub fn scalar(kind: ScalarKind) -> Self {
        Self { kind, ncomponents: 1 }
    }

    /// Bytes per sample (all components).
    pub fn size(&self) -> usize {
        self.kind.size() * self.ncomponents
    }

    pub fn is_float(&self) -> bool {
        self.kind.is_float()
    }

    /// Parse `<u|i|f><bits>[*<n>]`.
    pub fn parse(s: &str) -> Option<DType> {
        let s = s.trim();
        let (base, ncomponents) = match s.split_once('*') {
            Some((base, n)) => {
                let n: usize = n.parse().ok()?;
                if n == 0 || n > 255 {
                    return None;
                }
                (base, n)
            }
            None => (s, 1),
        };
        let kind = match base {
            "u8" => ScalarKind::U8,
            "u16" => ScalarKind::U16,
            "u32" => ScalarKind::U32,
            "u64" => ScalarKind::U64,
            "i8" => ScalarKind::I8,
            "i16" => ScalarKind::I16,
            "i32" => ScalarKind::I32,
            "i64" => ScalarKind::I64,
            "f32" => ScalarKind::F32,
            "f64" => ScalarKind::F64,
            _ => return None,
        };
        Some(DType { kind, ncomponents })
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.kind {
            ScalarKind::U8 => "u8",
            ScalarKind::U16 => "u16",
            ScalarKind::U32 => "u32",
            ScalarKind::U64 => "u64",
            ScalarKind::I8 => "i8",
            ScalarKind::I16 => "i16",
            ScalarKind::I32 => "i32",
            ScalarKind::I64 => "i64",
            ScalarKind::F32 => "f32",
            ScalarKind::F64 => "f64",
        };
        if self.ncomponents == 1 {
            write!(f, "{base}")
        } else {
            write!(f, "{base}*{}", self.ncomponents)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        for s in ["u8", "i16", "u32", "f32", "f64", "u8*3", "f32*2", "u64*4"] {
            let dt = DType::parse(s).unwrap();
            assert_eq!(dt.to_string(), s);
        }
        assert_eq!(DType::parse("u8*3").unwrap().size(), 3);
        assert_eq!(DType::parse("f64*2").unwrap().size(), 16);
        assert!(DType::parse("u7").is_none());
        assert!(DType::parse("f16").is_none());
        assert!(DType::parse("u8*0").is_none());
        assert!(DType::parse("").is_none());
    }

    #[test]
    fn f64_roundtrip_saturates() {
        let mut buf = [0u8; 8];
        ScalarKind::U8.put_f64(&mut buf, 0, 300.0);
        assert_eq!(buf[0], 255);
        ScalarKind::I16.put_f64(&mut buf, 0, -1e9);
        assert_eq!(ScalarKind::I16.get_f64(&buf, 0), i16::MIN as f64);
        ScalarKind::F64.put_f64(&mut buf, 0, 0.125);
        assert_eq!(ScalarKind::F64.get_f64(&buf, 0), 0.125);
    }
}
