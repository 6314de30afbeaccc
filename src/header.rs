//! Textual dataset descriptor — the format anchor every open starts from.
//!
//! # Grammar (UTF-8, line oriented)
//!
//! ```text
//! version <int>
//! logic_box <x1 x2 y1 y2 ...>
//! bitmask <string starting with V>
//! bitsperblock <int >= 0>
//! blocksperfile <int >= 1, power of two>
//! filename_template <path with %block %time %field>
//! time_template <string with %time>            (optional)
//! physic_box <lo hi lo hi ...>                 (optional)
//! fields
//!   <name> <dtype> [compressed <codec>] [default_layout <s>] [filter <kernel>]
//!   ...
//! timesteps <* | from A to B step S | explicit list>
//! ```
//!
//! Integers accept an optional sign; dtypes follow `<u|i|f><bits>[*<n>]`.
//! Unknown top-level keys are preserved verbatim, in order, and written
//! back by [`DatasetHeader::to_text`] — forward compatibility without
//! dynamic typing. Unknown field attributes are preserved the same way.
//!
//! A parsed header is validated once and immutable afterwards; every
//! invariant the engine relies on (`max_h >= bitsperblock`, logic box
//! inside the power-of-two lattice, at least one field) is checked here,
//! not at query time.

use std::fmt::Write as _;

use crate::bitmask::Bitmask;
use crate::codec::CodecTag;
use crate::dtype::DType;
use crate::error::Error;
use crate::filter::Filter;
use crate::space::{BoxN, PointN};

pub const CURRENT_VERSION: u32 = 6;

// ── Field ────────────────────────────────────────────────────────────────────

/// A named scalar or vector sample type defined on the lattice.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name:           String,
    pub dtype:          DType,
    /// Default codec for blocks of this field; `raw` when absent.
    pub default_codec:  Option<CodecTag>,
    pub default_layout: Option<String>,
    /// Raw filter token. An unknown kernel is kept (and served) verbatim;
    /// readers that cannot parse it set `filter_skipped` instead of
    /// failing.
    pub filter:         Option<String>,
    /// Attributes this build does not interpret, preserved in order.
    pub extra:          Vec<(String, String)>,
}

impl Field {
    pub fn new(name: &str, dtype: DType) -> Self {
        Self {
            name: name.to_owned(),
            dtype,
            default_codec: None,
            default_layout: None,
            filter: None,
            extra: Vec::new(),
        }
    }

    pub fn codec(&self) -> CodecTag {
        self.default_codec.unwrap_or(CodecTag::Raw)
    }

    /// The declared filter, if this build implements its kernel.
    pub fn parsed_filter(&self) -> Option<Filter> {
        self.filter.as_deref().and_then(Filter::parse)
    }

    /// True when a filter is declared but its kernel is unknown here.
    pub fn filter_unavailable(&self) -> bool {
        self.filter.is_some() && self.parsed_filter().is_none()
    }

    fn parse_line(line: &str) -> Result<Field, Error> {
        let mut tokens = line.split_whitespace();
        let name = tokens
            .next()
            .ok_or_else(|| Error::MalformedHeader("empty field line".into()))?;
        let dtype_s = tokens
            .next()
            .ok_or_else(|| Error::MalformedHeader(format!("field {name} has no dtype")))?;
        let dtype = DType::parse(dtype_s)
            .ok_or_else(|| Error::MalformedHeader(format!("bad dtype {dtype_s:?}")))?;

        let mut field = Field::new(name, dtype);
        while let Some(key) = tokens.next() {
            let value = tokens.next().ok_or_else(|| {
                Error::MalformedHeader(format!("field {name}: attribute {key} has no value"))
            })?;
            match key {
                "compressed" => {
                    field.default_codec = Some(CodecTag::from_name(value).ok_or_else(
                        || Error::MalformedHeader(format!("unknown codec {value:?}")),
                    )?);
                }
                "default_layout" => field.default_layout = Some(value.to_owned()),
                "filter" => field.filter = Some(value.to_owned()),
                _ => field.extra.push((key.to_owned(), value.to_owned())),
            }
        }
        Ok(field)
    }

    fn to_line(&self) -> String {
        let mut s = format!("  {} {}", self.name, self.dtype);
        if let Some(codec) = self.default_codec {
            let _ = write!(s, " compressed {}", codec.name());
        }
        if let Some(layout) = &self.default_layout {
            let _ = write!(s, " default_layout {layout}");
        }
        if let Some(filter) = &self.filter {
            let _ = write!(s, " filter {filter}");
        }
        for (k, v) in &self.extra {
            let _ = write!(s, " {k} {v}");
        }
        s
    }
}

// ── Timesteps ────────────────────────────────────────────────────────────────

/// The time step schedule: any, an arithmetic progression, or an explicit
/// list of real values.
#[derive(Debug, Clone, PartialEq)]
pub enum Timesteps {
    Any,
    Range { from: f64, to: f64, step: f64 },
    List(Vec<f64>),
}

impl Timesteps {
    pub fn parse(rest: &str) -> Result<Timesteps, Error> {
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        match tokens.as_slice() {
            ["*"] => Ok(Timesteps::Any),
            ["from", a, "to", b, "step", s] => {
                let from = parse_f64(a)?;
                let to = parse_f64(b)?;
                let step = parse_f64(s)?;
                if step <= 0.0 || to < from {
                    return Err(Error::MalformedHeader(format!(
                        "bad timestep range {rest:?}"
                    )));
                }
                Ok(Timesteps::Range { from, to, step })
            }
            [] => Err(Error::MalformedHeader("timesteps has no values".into())),
            list => {
                let values = list
                    .iter()
                    .map(|t| parse_f64(t))
                    .collect::<Result<Vec<f64>, Error>>()?;
                Ok(Timesteps::List(values))
            }
        }
    }

    pub fn contains(&self, t: f64) -> bool {
        match self {
            Timesteps::Any => true,
            Timesteps::Range { from, to, step } => {
                if t < *from || t > *to {
                    return false;
                }
                let k = (t - from) / step;
                (k - k.round()).abs() < 1e-9
            }
            Timesteps::List(values) => values.iter().any(|v| v == &t),
        }
    }

    pub fn default(&self) -> f64 {
        match self {
            Timesteps::Any => 0.0,
            Timesteps::Range { from, .. } => *from,
            Timesteps::List(values) => values.first().copied().unwrap_or(0.0),
        }
    }

    fn to_text(&self) -> String {
        match self {
            Timesteps::Any => "*".to_owned(),
            Timesteps::Range { from, to, step } => {
                format!("from {} to {} step {}", fmt_f64(*from), fmt_f64(*to), fmt_f64(*step))
            }
            Timesteps::List(values) => values
                .iter()
                .map(|v| fmt_f64(*v))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

// ── Affine logic↔physical transform ──────────────────────────────────────────

/// Per-axis scale + translate mapping logic coordinates onto the physical
/// bounds declared by `physic_box`. Consumed by collaborators (viewers),
/// never by the engine itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Affine {
    pub scale:     Vec<f64>,
    pub translate: Vec<f64>,
}

impl Affine {
    pub fn identity(pdim: usize) -> Self {
        Self { scale: vec![1.0; pdim], translate: vec![0.0; pdim] }
    }

    pub fn apply(&self, p: &[f64]) -> Vec<f64> {
        p.iter()
            .enumerate()
            .map(|(i, v)| v * self.scale[i] + self.translate[i])
            .collect()
    }

    pub fn inverse(&self) -> Affine {
        let scale: Vec<f64> = self.scale.iter().map(|s| 1.0 / s).collect();
        let translate = self
            .translate
            .iter()
            .zip(&scale)
            .map(|(t, s)| -t * s)
            .collect();
        Affine { scale, translate }
    }
}

// ── DatasetHeader ────────────────────────────────────────────────────────────

/// Parsed, validated, immutable dataset metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetHeader {
    pub version:           u32,
    pub logic_box:         BoxN,
    pub bitmask:           Bitmask,
    pub bitsperblock:      u32,
    /// Blocks per file: a count, `>= 1`, power of two.
    pub blocksperfile:     u32,
    pub filename_template: String,
    pub time_template:     Option<String>,
    /// Per-axis physical bounds `(lo, hi)`.
    pub physic_box:        Option<Vec<(f64, f64)>>,
    pub fields:            Vec<Field>,
    pub timesteps:         Timesteps,
    /// Keys this build does not interpret, preserved in order.
    pub unknown:           Vec<(String, String)>,
}

impl DatasetHeader {
    // ── Parse ────────────────────────────────────────────────────────────────

    pub fn parse(text: &str) -> Result<DatasetHeader, Error> {
        let mut version: Option<u32> = None;
        let mut logic_box_raw: Option<Vec<i64>> = None;
        let mut bitmask: Option<Bitmask> = None;
        let mut bitsperblock: Option<u32> = None;
        let mut blocksperfile: Option<u32> = None;
        let mut filename_template: Option<String> = None;
        let mut time_template: Option<String> = None;
        let mut physic_box: Option<Vec<(f64, f64)>> = None;
        let mut fields: Vec<Field> = Vec::new();
        let mut timesteps: Option<Timesteps> = None;
        let mut unknown: Vec<(String, String)> = Vec::new();

        let mut in_fields = false;
        for line in text.lines() {
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            let indented = line.starts_with(' ') || line.starts_with('\t');
            if in_fields && indented {
                fields.push(Field::parse_line(line)?);
                continue;
            }
            in_fields = false;

            let trimmed = line.trim();
            if trimmed == "fields" {
                in_fields = true;
                continue;
            }
            let (key, rest) = trimmed
                .split_once(char::is_whitespace)
                .ok_or_else(|| Error::MalformedHeader(format!("key {trimmed:?} has no value")))?;
            let rest = rest.trim();
            match key {
                "version" => version = Some(parse_u32(rest)?),
                "logic_box" => {
                    logic_box_raw = Some(
                        rest.split_whitespace()
                            .map(parse_i64)
                            .collect::<Result<Vec<i64>, Error>>()?,
                    )
                }
                "bitmask" => bitmask = Some(Bitmask::parse(rest)?),
                "bitsperblock" => bitsperblock = Some(parse_u32(rest)?),
                "blocksperfile" => blocksperfile = Some(parse_u32(rest)?),
                "filename_template" => filename_template = Some(rest.to_owned()),
                "time_template" => time_template = Some(rest.to_owned()),
                "physic_box" => {
                    let values = rest
                        .split_whitespace()
                        .map(parse_f64)
                        .collect::<Result<Vec<f64>, Error>>()?;
                    if values.len() % 2 != 0 {
                        return Err(Error::MalformedHeader(
                            "physic_box needs lo/hi pairs".into(),
                        ));
                    }
                    physic_box =
                        Some(values.chunks_exact(2).map(|c| (c[0], c[1])).collect());
                }
                "timesteps" => timesteps = Some(Timesteps::parse(rest)?),
                _ => unknown.push((key.to_owned(), rest.to_owned())),
            }
        }

        let bitmask =
            bitmask.ok_or_else(|| Error::MalformedHeader("missing bitmask".into()))?;
        let pdim = bitmask.pdim();

        let raw = logic_box_raw
            .ok_or_else(|| Error::MalformedHeader("missing logic_box".into()))?;
        if raw.len() != 2 * pdim {
            return Err(Error::MalformedHeader(format!(
                "logic_box has {} values, expected {}",
                raw.len(),
                2 * pdim
            )));
        }
        let mut p1 = PointN::zero(pdim);
        let mut p2 = PointN::zero(pdim);
        for i in 0..pdim {
            p1[i] = raw[2 * i];
            p2[i] = raw[2 * i + 1];
        }
        let logic_box = BoxN::new(p1, p2);

        let header = DatasetHeader {
            version: version.unwrap_or(CURRENT_VERSION),
            logic_box,
            bitmask,
            bitsperblock: bitsperblock
                .ok_or_else(|| Error::MalformedHeader("missing bitsperblock".into()))?,
            blocksperfile: blocksperfile
                .ok_or_else(|| Error::MalformedHeader("missing blocksperfile".into()))?,
            filename_template: filename_template
                .ok_or_else(|| Error::MalformedHeader("missing filename_template".into()))?,
            time_template,
            physic_box,
            fields,
            timesteps: timesteps.unwrap_or(Timesteps::Any),
            unknown,
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.bitsperblock > self.bitmask.max_h() {
            return Err(Error::MalformedHeader(format!(
                "bitsperblock {} exceeds max_h {}",
                self.bitsperblock,
                self.bitmask.max_h()
            )));
        }
        if self.blocksperfile == 0 || !self.blocksperfile.is_power_of_two() {
            return Err(Error::MalformedHeader(format!(
                "blocksperfile {} must be a positive power of two",
                self.blocksperfile
            )));
        }
        if self.logic_box.is_empty() {
            return Err(Error::MalformedHeader("logic_box is empty".into()));
        }
        if !self.bitmask.pow2_box().contains_box(&self.logic_box) {
            return Err(Error::MalformedHeader(format!(
                "logic_box {:?} exceeds the bitmask lattice {:?}",
                self.logic_box,
                self.bitmask.pow2_box()
            )));
        }
        if self.fields.is_empty() {
            return Err(Error::MalformedHeader("dataset declares no fields".into()));
        }
        if let Some(pb) = &self.physic_box {
            if pb.len() != self.bitmask.pdim() {
                return Err(Error::MalformedHeader(
                    "physic_box dimension does not match the bitmask".into(),
                ));
            }
        }
        if !self.filename_template.contains("%block") {
            return Err(Error::MalformedHeader(
                "filename_template must contain %block".into(),
            ));
        }
        Ok(())
    }

    // ── Serialize ────────────────────────────────────────────────────────────

    /// Canonical textual form; parse → to_text → parse is the identity.
    pub fn to_text(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "version {}", self.version);
        let mut lb = String::new();
        for i in 0..self.logic_box.pdim() {
            let _ = write!(lb, "{} {} ", self.logic_box.p1[i], self.logic_box.p2[i]);
        }
        let _ = writeln!(s, "logic_box {}", lb.trim_end());
        let _ = writeln!(s, "bitmask {}", self.bitmask.as_str());
        let _ = writeln!(s, "bitsperblock {}", self.bitsperblock);
        let _ = writeln!(s, "blocksperfile {}", self.blocksperfile);
        let _ = writeln!(s, "filename_template {}", self.filename_template);
        if let Some(tt) = &self.time_template {
            let _ = writeln!(s, "time_template {tt}");
        }
        if let Some(pb) = &self.physic_box {
            let mut pbs = String::new();
            for (lo, hi) in pb {
                let _ = write!(pbs, "{} {} ", fmt_f64(*lo), fmt_f64(*hi));
            }
            let _ = writeln!(s, "physic_box {}", pbs.trim_end());
        }
        let _ = writeln!(s, "fields");
        for field in &self.fields {
            let _ = writeln!(s, "{}", field.to_line());
        }
        let _ = writeln!(s, "timesteps {}", self.timesteps.to_text());
        for (k, v) in &self.unknown {
            let _ = writeln!(s, "{k} {v}");
        }
        s
    }

    // ── Lookups ──────────────────────────────────────────────────────────────

    pub fn field_by_name(&self, name: &str) -> Result<&Field, Error> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::UnknownField(name.to_owned()))
    }

    pub fn default_field(&self) -> &Field {
        &self.fields[0]
    }

    pub fn default_time(&self) -> f64 {
        self.timesteps.default()
    }

    pub fn check_time(&self, t: f64) -> Result<(), Error> {
        if self.timesteps.contains(t) {
            Ok(())
        } else {
            Err(Error::UnknownTime(t))
        }
    }

    // ── Block arithmetic ─────────────────────────────────────────────────────

    #[inline]
    pub fn max_h(&self) -> u32 {
        self.bitmask.max_h()
    }

    /// Samples per block.
    #[inline]
    pub fn block_size(&self) -> u64 {
        1u64 << self.bitsperblock
    }

    pub fn total_blocks(&self) -> u64 {
        1u64 << (self.max_h() - self.bitsperblock)
    }

    #[inline]
    pub fn file_group_of(&self, block: u64) -> u64 {
        block / self.blocksperfile as u64
    }

    #[inline]
    pub fn block_in_file(&self, block: u64) -> u32 {
        (block % self.blocksperfile as u64) as u32
    }

    // ── Templates ────────────────────────────────────────────────────────────

    /// Apply `time_template` (or a plain numeric rendering) to `t`.
    pub fn format_time(&self, t: f64) -> String {
        let rendered = fmt_f64(t);
        match &self.time_template {
            Some(tt) => tt.replace("%time", &rendered),
            None => rendered,
        }
    }

    /// Block file path for `(group, time, field)`.
    pub fn block_file_name(&self, group: u64, t: f64, field: &Field) -> String {
        self.filename_template
            .replace("%block", &format!("{group:016}"))
            .replace("%time", &self.format_time(t))
            .replace("%field", &field.name)
    }

    // ── Physical transform ───────────────────────────────────────────────────

    /// Affine mapping logic coordinates onto `physic_box` (identity when
    /// the header declares none).
    pub fn logic_to_physic(&self) -> Affine {
        let pdim = self.bitmask.pdim();
        match &self.physic_box {
            None => Affine::identity(pdim),
            Some(pb) => {
                let mut scale = Vec::with_capacity(pdim);
                let mut translate = Vec::with_capacity(pdim);
                for i in 0..pdim {
                    let (lo, hi) = pb[i];
                    let extent = (self.logic_box.p2[i] - self.logic_box.p1[i]) as f64;
                    let s = (hi - lo) / extent;
                    scale.push(s);
                    translate.push(lo - self.logic_box.p1[i] as f64 * s);
                }
                Affine { scale, translate }
            }
        }
    }
}

// ── number helpers ───────────────────────────────────────────────────────────

fn parse_u32(s: &str) -> Result<u32, Error> {
    let s = s.strip_prefix('+').unwrap_or(s);
    s.parse::<u32>()
        .map_err(|_| Error::MalformedHeader(format!("bad integer {s:?}")))
}

fn parse_i64(s: &str) -> Result<i64, Error> {
    s.parse::<i64>()
        .map_err(|_| Error::MalformedHeader(format!("bad integer {s:?}")))
}

fn parse_f64(s: &str) -> Result<f64, Error> {
    s.parse::<f64>()
        .map_err(|_| Error::MalformedHeader(format!("bad number {s:?}")))
}

/// Render without a trailing `.0` for integral values.
pub fn fmt_f64(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}
