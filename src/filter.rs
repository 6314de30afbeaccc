//! Separable lifted filters: forward analysis on write, inverse synthesis
//! on read.
//!
//! A filter is a 1-D lifting kernel applied in place along every axis in
//! windows of `w = 2^k >= 2` samples. The first sample of each window
//! keeps the approximation; the rest become details predicted from their
//! neighbors. Arithmetic runs in f64 and is stored back in the field's
//! dtype, saturating for integer kinds — float fields round-trip exactly,
//! integer fields saturate at the type bounds.
//!
//! Kernels:
//! - `dehaar` — each detail is the difference from its predecessor.
//! - `linear` — each detail is the residue of linear prediction from the
//!   two predecessors.

use crate::dtype::DType;
use crate::space::PointN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    DeHaar,
    Linear,
}

impl FilterKind {
    pub fn name(self) -> &'static str {
        match self {
            FilterKind::DeHaar => "dehaar",
            FilterKind::Linear => "linear",
        }
    }
}

/// A kernel plus its window size, as declared by a field in the dataset
/// header (`filter <kernel>[:<window>]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub kind:   FilterKind,
    pub window: usize,
}

pub const DEFAULT_WINDOW: usize = 2;

impl Filter {
    /// Parse `<kernel>[:<window>]`. Returns `None` for kernels this build
    /// does not implement — readers then skip inversion and raise
    /// `filter_skipped` instead of failing.
    pub fn parse(s: &str) -> Option<Filter> {
        let (name, window) = match s.split_once(':') {
            Some((name, w)) => (name, w.parse::<usize>().ok()?),
            None => (s, DEFAULT_WINDOW),
        };
        if window < 2 || !window.is_power_of_two() {
            return None;
        }
        let kind = match name {
            "dehaar" => FilterKind::DeHaar,
            "linear" => FilterKind::Linear,
            _ => return None,
        };
        Some(Filter { kind, window })
    }

    pub fn to_string_token(&self) -> String {
        if self.window == DEFAULT_WINDOW {
            self.kind.name().to_owned()
        } else {
            format!("{}:{}", self.kind.name(), self.window)
        }
    }

    /// Analysis pass over a row-major buffer of `dims` samples, axis by
    /// axis, in place.
    pub fn forward(&self, buf: &mut [u8], dtype: DType, dims: &PointN) {
        self.apply(buf, dtype, dims, true)
    }

    /// Synthesis pass; the exact inverse of [`forward`](Self::forward) up
    /// to integer saturation.
    pub fn inverse(&self, buf: &mut [u8], dtype: DType, dims: &PointN) {
        self.apply(buf, dtype, dims, false)
    }

    fn apply(&self, buf: &mut [u8], dtype: DType, dims: &PointN, forward: bool) {
        debug_assert_eq!(buf.len(), dtype.size() * dims.product() as usize);
        let total = dims.product() as usize;
        let pdim = dims.pdim();
        let mut strides = [1usize; crate::space::MAX_DIM];
        for ax in 1..pdim {
            strides[ax] = strides[ax - 1] * dims[ax - 1] as usize;
        }
        // Synthesis undoes axes in the reverse of the analysis order.
        let axes: Vec<usize> =
            if forward { (0..pdim).collect() } else { (0..pdim).rev().collect() };
        for ax in axes {
            let n = dims[ax] as usize;
            if n <= 1 {
                continue;
            }
            let stride = strides[ax];
            let span = n * stride;
            for base in (0..total).step_by(span) {
                for inner in 0..stride {
                    self.apply_line(buf, dtype, base + inner, stride, n, forward);
                }
            }
        }
    }

    fn apply_line(
        &self,
        buf: &mut [u8],
        dtype: DType,
        start: usize,
        stride: usize,
        n: usize,
        forward: bool,
    ) {
        let comp_size = dtype.kind.size();
        let sample_size = dtype.size();
        for c in 0..dtype.ncomponents {
            let at = |i: usize| (start + i * stride) * sample_size + c * comp_size;
            let mut s = 0usize;
            while s < n {
                let w = self.window.min(n - s);
                match (self.kind, forward) {
                    (FilterKind::DeHaar, true) => {
                        for j in (1..w).rev() {
                            let v = dtype.kind.get_f64(buf, at(s + j))
                                - dtype.kind.get_f64(buf, at(s + j - 1));
                            dtype.kind.put_f64(buf, at(s + j), v);
                        }
                    }
                    (FilterKind::DeHaar, false) => {
                        for j in 1..w {
                            let v = dtype.kind.get_f64(buf, at(s + j))
                                + dtype.kind.get_f64(buf, at(s + j - 1));
                            dtype.kind.put_f64(buf, at(s + j), v);
                        }
                    }
                    (FilterKind::Linear, true) => {
                        for j in (2..w).rev() {
                            let pred = 2.0 * dtype.kind.get_f64(buf, at(s + j - 1))
                                - dtype.kind.get_f64(buf, at(s + j - 2));
                            let v = dtype.kind.get_f64(buf, at(s + j)) - pred;
                            dtype.kind.put_f64(buf, at(s + j), v);
                        }
                        if w > 1 {
                            let v = dtype.kind.get_f64(buf, at(s + 1))
                                - dtype.kind.get_f64(buf, at(s));
                            dtype.kind.put_f64(buf, at(s + 1), v);
                        }
                    }
                    (FilterKind::Linear, false) => {
                        if w > 1 {
                            let v = dtype.kind.get_f64(buf, at(s + 1))
                                + dtype.kind.get_f64(buf, at(s));
                            dtype.kind.put_f64(buf, at(s + 1), v);
                        }
                        for j in 2..w {
                            let pred = 2.0 * dtype.kind.get_f64(buf, at(s + j - 1))
                                - dtype.kind.get_f64(buf, at(s + j - 2));
                            let v = dtype.kind.get_f64(buf, at(s + j)) + pred;
                            dtype.kind.put_f64(buf, at(s + j), v);
                        }
                    }
                }
                s += w;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn f64_buf(vals: &[f64]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn f64_vals(buf: &[u8]) -> Vec<f64> {
        buf.chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn parse_tokens() {
        assert_eq!(
            Filter::parse("dehaar"),
            Some(Filter { kind: FilterKind::DeHaar, window: 2 })
        );
        assert_eq!(
            Filter::parse("linear:4"),
            Some(Filter { kind: FilterKind::Linear, window: 4 })
        );
        assert_eq!(Filter::parse("cubic"), None);
        assert_eq!(Filter::parse("dehaar:3"), None);
        assert_eq!(Filter::parse("dehaar:1"), None);
    }

    #[test]
    fn roundtrip_exact_for_floats() {
        let dtype = DType::parse("f64").unwrap();
        let dims = PointN::from_slice(&[8, 4]);
        let vals: Vec<f64> = (0..32).map(|i| (i * i % 97) as f64).collect();
        for filter in [
            Filter { kind: FilterKind::DeHaar, window: 2 },
            Filter { kind: FilterKind::DeHaar, window: 4 },
            Filter { kind: FilterKind::Linear, window: 4 },
        ] {
            let mut buf = f64_buf(&vals);
            filter.forward(&mut buf, dtype, &dims);
            assert_ne!(f64_vals(&buf), vals, "{filter:?} must transform");
            filter.inverse(&mut buf, dtype, &dims);
            assert_eq!(f64_vals(&buf), vals, "{filter:?} must invert");
        }
    }

    #[test]
    fn roundtrip_vector_components_independent() {
        let dtype = DType::parse("f32*2").unwrap();
        let dims = PointN::from_slice(&[4, 4]);
        let vals: Vec<u8> = (0..dims.product() as usize * dtype.size())
            .map(|i| (i % 17) as u8)
            .collect();
        let filter = Filter { kind: FilterKind::DeHaar, window: 2 };
        let mut buf = vals.clone();
        filter.forward(&mut buf, dtype, &dims);
        filter.inverse(&mut buf, dtype, &dims);
        let orig: Vec<f32> = vals
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let round: Vec<f32> = buf
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(orig, round);
    }

    #[test]
    fn integer_details_saturate() {
        let dtype = DType::parse("u8").unwrap();
        let dims = PointN::from_slice(&[2]);
        // Decreasing pair: the detail would be negative, so it clamps to 0.
        let mut buf = vec![200u8, 100u8];
        let filter = Filter { kind: FilterKind::DeHaar, window: 2 };
        filter.forward(&mut buf, dtype, &dims);
        assert_eq!(buf, vec![200u8, 0u8]);
    }

    #[test]
    fn odd_tail_windows_are_handled() {
        let dtype = DType::parse("f64").unwrap();
        let dims = PointN::from_slice(&[7]);
        let vals: Vec<f64> = (0..7).map(|i| i as f64 * 1.5).collect();
        let filter = Filter { kind: FilterKind::Linear, window: 4 };
        let mut buf = f64_buf(&vals);
        filter.forward(&mut buf, dtype, &dims);
        filter.inverse(&mut buf, dtype, &dims);
        assert_eq!(f64_vals(&buf), vals);
    }
}
