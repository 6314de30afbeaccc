use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};

use hzidx::access::ram::DEFAULT_RAM_BUDGET;
use hzidx::access::remote::DEFAULT_TIMEOUT;
use hzidx::access::{MultiplexAccess, RamAccess, WritePolicy};
use hzidx::blockfile::{self, BlockHealth};
use hzidx::boxquery::BoxQuery;
use hzidx::dataset::Dataset;
use hzidx::dtype::DType;
use hzidx::header::{DatasetHeader, Field, Timesteps, CURRENT_VERSION};
use hzidx::server::{NetService, ServeConfig};
use hzidx::space::{BoxN, PointN};
use hzidx::{Bitmask, CodecTag, DiskAccess, IoContext, RemoteDataset};

#[derive(Parser)]
#[command(name = "hzidx", version, about = "Hierarchical multi-resolution N-D block storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty dataset descriptor
    Create {
        /// Path of the .idx descriptor to write
        output: PathBuf,
        /// Bitmask, e.g. V01010101
        #[arg(short, long)]
        bitmask: String,
        #[arg(long, default_value = "16")]
        bitsperblock: u32,
        #[arg(long, default_value = "4")]
        blocksperfile: u32,
        /// Field declarations, e.g. -f "data u8" -f "speed f32*3"
        #[arg(short, long, required = true)]
        field: Vec<String>,
        /// Default codec for every field
        #[arg(short, long, default_value = "zip")]
        codec: String,
    },
    /// Show dataset metadata
    Info {
        input: PathBuf,
    },
    /// Fill a dataset with a synthetic test pattern
    Fill {
        input: PathBuf,
        #[arg(short, long)]
        field: Option<String>,
        #[arg(short, long)]
        time: Option<f64>,
    },
    /// Execute a box query and dump the raw result
    Read {
        /// Local .idx path or an http:// service root
        dataset: String,
        /// Remote dataset name (http only)
        #[arg(long)]
        name: Option<String>,
        /// Box as "x1 x2 y1 y2 ...", defaults to the whole logic box
        #[arg(short, long)]
        r#box: Option<String>,
        #[arg(short, long)]
        res: Option<u32>,
        #[arg(short, long)]
        field: Option<String>,
        #[arg(short, long)]
        time: Option<f64>,
        #[arg(short, long, default_value = "dump.raw")]
        out: PathBuf,
    },
    /// Scan block files and report per-block health
    Verify {
        input: PathBuf,
        /// Print every block, not just the summary
        #[arg(long)]
        verbose: bool,
    },
    /// Serve datasets over HTTP
    Serve {
        /// Datasets as name=path pairs
        #[arg(short, long)]
        dataset: Vec<String>,
        /// JSON catalog file, {"datasets": {name: path, ...}, "writable": bool}
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(short, long, default_value = "127.0.0.1:10000")]
        addr: String,
        /// Allow writeblock
        #[arg(long)]
        writable: bool,
    },
}

/// On-disk catalog for `serve --catalog`.
#[derive(serde::Deserialize)]
struct CatalogFile {
    datasets: HashMap<String, String>,
    #[serde(default)]
    writable: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        // ── Create ───────────────────────────────────────────────────────────
        Commands::Create { output, bitmask, bitsperblock, blocksperfile, field, codec } => {
            let bitmask = Bitmask::parse(&bitmask)?;
            let codec = CodecTag::from_name(&codec)
                .ok_or_else(|| anyhow!("unknown codec {codec:?}"))?;
            let mut fields = Vec::new();
            for spec in &field {
                let (name, dtype_s) = spec
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| anyhow!("field spec {spec:?} must be \"<name> <dtype>\""))?;
                let dtype = DType::parse(dtype_s.trim())
                    .ok_or_else(|| anyhow!("bad dtype in {spec:?}"))?;
                let mut f = Field::new(name, dtype);
                f.default_codec = Some(codec);
                fields.push(f);
            }
            let stem = output
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "data".into());
            let header = DatasetHeader {
                version: CURRENT_VERSION,
                logic_box: bitmask.pow2_box(),
                bitmask,
                bitsperblock,
                blocksperfile,
                filename_template: format!("{stem}/%field/t%time/%block.blk"),
                time_template: None,
                physic_box: None,
                fields,
                timesteps: Timesteps::Any,
                unknown: Vec::new(),
            };
            let dataset = Dataset::open(header, output.parent().map(|p| p.to_owned()));
            dataset.save(&output)?;
            println!("Created: {}", output.display());
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let dataset = Dataset::load(&input)?;
            let h = dataset.header();
            println!("── hzidx dataset ────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Version        {}", h.version);
            println!("  Bitmask        {}", h.bitmask.as_str());
            println!("  Max resolution {}", h.max_h());
            println!("  Logic box      {:?}", h.logic_box);
            println!("  Block size     {} samples (bitsperblock {})", h.block_size(), h.bitsperblock);
            println!("  Blocks/file    {}", h.blocksperfile);
            println!("  Total blocks   {}", h.total_blocks());
            println!("  Timesteps      {:?}", h.timesteps);
            println!("  Fields ({}):", h.fields.len());
            for f in &h.fields {
                let filter = f.filter.as_deref().unwrap_or("-");
                println!(
                    "    {:<16} {:<8} codec {:<5} filter {}",
                    f.name,
                    f.dtype.to_string(),
                    f.codec().name(),
                    filter
                );
            }
        }

        // ── Fill ─────────────────────────────────────────────────────────────
        Commands::Fill { input, field, time } => {
            let ctx = IoContext::new();
            let dataset = Dataset::load(&input)?;
            let header = dataset.header();
            let f = match &field {
                Some(name) => header.field_by_name(name)?.clone(),
                None => header.default_field().clone(),
            };
            let t = time.unwrap_or_else(|| header.default_time());

            let ls = dataset
                .level_box(header.max_h())
                .ok_or_else(|| anyhow!("dataset logic box is empty"))?;
            let ds = f.dtype.size();
            let mut buffer = vec![0u8; ls.total() * ds];
            for i in 0..ls.total() {
                for c in 0..f.dtype.ncomponents {
                    let off = i * ds + c * f.dtype.kind.size();
                    f.dtype.kind.put_f64(&mut buffer, off, ((i + c) % 251) as f64);
                }
            }

            let access = DiskAccess::create(&ctx, &dataset);
            let mut q = BoxQuery::new(f, t, header.logic_box);
            q.set_resolution_range(0, header.max_h());
            q.set_buffer(buffer);
            dataset.begin_box_query(&mut q)?;
            access.begin_write()?;
            dataset.execute_box_query_write(&access, &mut q)?;
            access.end_write()?;
            println!(
                "Filled {} samples ({} failed blocks)",
                ls.total(),
                q.failed_blocks.len()
            );
        }

        // ── Read ─────────────────────────────────────────────────────────────
        Commands::Read { dataset, name, r#box, res, field, time, out } => {
            let ctx = IoContext::new();
            let (ds, access) = if dataset.starts_with("http://") || dataset.starts_with("https://")
            {
                let name = name.context("--name is required for remote datasets")?;
                let remote = RemoteDataset::open(
                    &ctx,
                    &dataset,
                    &name,
                    CodecTag::Zip,
                    DEFAULT_TIMEOUT,
                )?;
                (remote.dataset, remote.access)
            } else {
                let ds = Dataset::load(&PathBuf::from(&dataset))?;
                // RAM tier in front of disk so progressive stages re-read
                // shared coarse blocks from memory.
                let ram = RamAccess::create(&ctx, DEFAULT_RAM_BUDGET);
                let disk = DiskAccess::create(&ctx, &ds);
                let access =
                    MultiplexAccess::create(&ctx, vec![ram, disk], WritePolicy::First);
                (ds, access)
            };

            let header = ds.header();
            let f = match &field {
                Some(n) => header.field_by_name(n)?.clone(),
                None => header.default_field().clone(),
            };
            let t = time.unwrap_or_else(|| header.default_time());
            let logic_box = match &r#box {
                Some(s) => parse_box(s, header.bitmask.pdim())?,
                None => header.logic_box,
            };
            let end_res = res.unwrap_or_else(|| header.max_h());

            let mut q = BoxQuery::new(f, t, logic_box);
            q.set_resolution_range(0, end_res);
            ds.begin_box_query(&mut q)?;
            access.begin_read()?;
            ds.execute_box_query(&access, &mut q)?;
            access.end_read()?;
            ds.next_box_query(&mut q);

            let ls = q.logic_samples().copied().context("query produced no samples")?;
            std::fs::write(&out, q.buffer())?;
            let (rok, rfail, _, _) = access.stats().snapshot();
            println!(
                "Wrote {} ({} samples, dims {}, {} block reads ok, {} failed)",
                out.display(),
                ls.total(),
                ls.nsamples,
                rok,
                rfail
            );
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input, verbose } => {
            let dataset = Dataset::load(&input)?;
            let header = dataset.header();
            let t = header.default_time();
            let groups = header.total_blocks().div_ceil(header.blocksperfile as u64);

            let mut healthy = 0u64;
            let mut absent = 0u64;
            let mut corrupt = 0u64;
            let mut missing_files = 0u64;
            for f in &header.fields {
                for group in 0..groups {
                    let path = dataset
                        .resolve_block_path(&header.block_file_name(group, t, f));
                    if !path.exists() {
                        missing_files += 1;
                        continue;
                    }
                    let health = blockfile::verify_file(&path)?;
                    for (i, h) in health.iter().enumerate() {
                        match h {
                            BlockHealth::Healthy => healthy += 1,
                            BlockHealth::Absent => absent += 1,
                            _ => {
                                corrupt += 1;
                                if verbose {
                                    println!(
                                        "  [{}] block {} in {}: {:?}",
                                        f.name,
                                        group * header.blocksperfile as u64 + i as u64,
                                        path.display(),
                                        h
                                    );
                                }
                            }
                        }
                    }
                }
            }
            println!("── Block health ─────────────────────────────────────────");
            println!("  Healthy blocks:   {healthy}");
            println!("  Absent (holes):   {absent}");
            println!("  Corrupt blocks:   {corrupt}");
            println!("  Missing files:    {missing_files}");
            if corrupt > 0 {
                bail!("{corrupt} corrupt block(s) found");
            }
        }

        // ── Serve ────────────────────────────────────────────────────────────
        Commands::Serve { dataset, catalog, addr, mut writable } => {
            let ctx = IoContext::new();
            let mut entries: HashMap<String, PathBuf> = HashMap::new();
            if let Some(catalog) = catalog {
                let text = std::fs::read_to_string(&catalog)?;
                let parsed: CatalogFile =
                    serde_json::from_str(&text).context("parsing the catalog JSON")?;
                writable |= parsed.writable;
                for (name, path) in parsed.datasets {
                    entries.insert(name, PathBuf::from(path));
                }
            }
            for pair in &dataset {
                let (name, path) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("dataset spec {pair:?} must be name=path"))?;
                entries.insert(name.to_owned(), PathBuf::from(path));
            }
            if entries.is_empty() {
                bail!("no datasets: pass --dataset name=path or --catalog file.json");
            }

            let mut service = NetService::new(
                &ctx,
                ServeConfig { addr, writable, ..ServeConfig::default() },
            );
            for (name, path) in &entries {
                let ds = Dataset::load(path)
                    .with_context(|| format!("opening dataset {name:?} from {}", path.display()))?;
                println!("  serving  {:<20} {}", name, path.display());
                service.add_dataset(name, ds);
            }
            let handle = service.serve()?;
            println!("Listening on {}", handle.addr());
            // Serve until interrupted.
            loop {
                std::thread::park();
            }
        }
    }

    Ok(())
}

fn parse_box(s: &str, pdim: usize) -> anyhow::Result<BoxN> {
    let coords: Vec<i64> = s
        .split_whitespace()
        .map(|t| t.parse::<i64>())
        .collect::<std::result::Result<_, _>>()
        .context("box coordinates must be integers")?;
    if coords.len() != 2 * pdim {
        bail!("box needs {} coordinates, got {}", 2 * pdim, coords.len());
    }
    let mut p1 = PointN::zero(pdim);
    let mut p2 = PointN::zero(pdim);
    for i in 0..pdim {
        p1[i] = coords[2 * i];
        p2[i] = coords[2 * i + 1];
    }
    Ok(BoxN::new(p1, p2))
}
