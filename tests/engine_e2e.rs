//! End-to-end engine scenarios over a real on-disk dataset.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use hzidx::boxquery::BoxQuery;
use hzidx::dataset::Dataset;
use hzidx::header::DatasetHeader;
use hzidx::query::{MergeMode, QueryStatus};
use hzidx::space::{BoxN, PointN};
use hzidx::{Access, DiskAccess, Error, IoContext, MultiplexAccess, RamAccess, WritePolicy};

/// The S1 dataset: 16×16, u8, one block per file.
const HEADER_2D: &str = "\
version 6
logic_box 0 16 0 16
bitmask V01010101
bitsperblock 4
blocksperfile 1
filename_template blocks/%field/t%time/%block.blk
fields
  data u8 compressed zip
timesteps *
";

fn open_2d(dir: &Path) -> Arc<Dataset> {
    let header = DatasetHeader::parse(HEADER_2D).unwrap();
    Dataset::open(header, Some(dir.to_owned()))
}

/// `p = (x, y) → (x + 16·y) mod 256`, row-major with x fastest.
fn pattern_2d() -> Vec<u8> {
    (0..256u32).map(|i| i as u8).collect()
}

fn write_full(ctx: &Arc<IoContext>, dataset: &Arc<Dataset>, data: Vec<u8>) {
    let header = dataset.header();
    let access = DiskAccess::create(ctx, dataset);
    let mut q = BoxQuery::new(header.default_field().clone(), 0.0, header.logic_box);
    q.set_resolution_range(0, header.max_h());
    q.set_buffer(data);
    dataset.begin_box_query(&mut q).unwrap();
    access.begin_write().unwrap();
    dataset.execute_box_query_write(&access, &mut q).unwrap();
    access.end_write().unwrap();
    assert!(q.failed_blocks.is_empty());
}

fn read_full(dataset: &Arc<Dataset>, access: &Arc<Access>, end_res: u32) -> BoxQuery {
    let header = dataset.header();
    let mut q = BoxQuery::new(header.default_field().clone(), 0.0, header.logic_box);
    q.set_resolution_range(0, end_res);
    dataset.begin_box_query(&mut q).unwrap();
    access.begin_read().unwrap();
    dataset.execute_box_query(access, &mut q).unwrap();
    access.end_read().unwrap();
    dataset.next_box_query(&mut q);
    q
}

// ── S1: write then read the whole box at max resolution ─────────────────────

#[test]
fn s1_small_box_roundtrip() {
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = open_2d(dir.path());
    write_full(&ctx, &dataset, pattern_2d());

    let access = DiskAccess::create(&ctx, &dataset);
    let q = read_full(&dataset, &access, 8);
    assert_eq!(q.status(), QueryStatus::Ok);
    assert_eq!(q.current_resolution(), Some(8));
    assert_eq!(q.buffer(), pattern_2d().as_slice());
    assert!(q.failed_blocks.is_empty());
}

#[test]
fn s1_sub_box_reads_the_right_window() {
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = open_2d(dir.path());
    write_full(&ctx, &dataset, pattern_2d());

    let access = DiskAccess::create(&ctx, &dataset);
    let header = dataset.header();
    let sub = BoxN::new(PointN::from_slice(&[4, 2]), PointN::from_slice(&[12, 10]));
    let mut q = BoxQuery::new(header.default_field().clone(), 0.0, sub);
    q.set_resolution_range(0, 8);
    dataset.begin_box_query(&mut q).unwrap();
    access.begin_read().unwrap();
    dataset.execute_box_query(&access, &mut q).unwrap();
    access.end_read().unwrap();

    let ls = q.logic_samples().unwrap();
    assert_eq!(ls.nsamples, PointN::from_slice(&[8, 8]));
    for y in 0..8i64 {
        for x in 0..8i64 {
            let expected = ((x + 4) + 16 * (y + 2)) as u8;
            assert_eq!(q.buffer()[(x + 8 * y) as usize], expected, "at ({x},{y})");
        }
    }
}

// ── S2: progressive refinement ───────────────────────────────────────────────

#[test]
fn s2_progressive_refinement() {
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = open_2d(dir.path());
    write_full(&ctx, &dataset, pattern_2d());

    let header = dataset.header();
    let access = DiskAccess::create(&ctx, &dataset);
    let mut q = BoxQuery::new(header.default_field().clone(), 0.0, header.logic_box);
    q.end_resolutions = vec![4, 6, 8];
    dataset.begin_box_query(&mut q).unwrap();
    access.begin_read().unwrap();

    let expected_shapes = [(16usize, 4i64), (64, 2), (256, 1)];
    let mut stage = 0;
    loop {
        dataset.execute_box_query(&access, &mut q).unwrap();
        let ls = q.logic_samples().unwrap();
        let (n, stride) = expected_shapes[stage];
        assert_eq!(ls.total(), n, "stage {stage}");
        assert_eq!(ls.delta, PointN::from_slice(&[stride, stride]), "stage {stage}");

        // Every delivered sample equals the written pattern.
        for idx in 0..ls.total() {
            let p = ls.point_of(idx);
            let expected = (p[0] + 16 * p[1]) as u8;
            assert_eq!(q.buffer()[idx], expected, "stage {stage}, {p:?}");
        }

        // Progressive invariant: the stage buffer is byte-equal to a
        // fresh non-progressive query at the same resolution.
        let fresh_access = DiskAccess::create(&ctx, &dataset);
        let fresh = read_full(&dataset, &fresh_access, q.end_resolutions[stage]);
        assert_eq!(q.buffer(), fresh.buffer(), "stage {stage} != fresh query");

        if !dataset.next_box_query(&mut q) {
            break;
        }
        stage += 1;
    }
    access.end_read().unwrap();
    assert_eq!(q.status(), QueryStatus::Ok);
}

// ── S3: cancellation ─────────────────────────────────────────────────────────

#[test]
fn s3_cancellation_preserves_partial_progress() {
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = open_2d(dir.path());
    write_full(&ctx, &dataset, pattern_2d());

    let header = dataset.header();
    let access = DiskAccess::create(&ctx, &dataset);
    let mut q = BoxQuery::new(header.default_field().clone(), 0.0, header.logic_box);
    q.end_resolutions = vec![4, 8];
    dataset.begin_box_query(&mut q).unwrap();
    access.begin_read().unwrap();

    dataset.execute_box_query(&access, &mut q).unwrap();
    let coarse = q.buffer().to_vec();
    assert!(dataset.next_box_query(&mut q));

    // Abort between the stages: the finer stage must not run.
    q.aborted.set();
    let err = dataset.execute_box_query(&access, &mut q).unwrap_err();
    access.end_read().unwrap();

    assert!(matches!(err, Error::Aborted));
    assert_eq!(q.status(), QueryStatus::Aborted);
    assert_eq!(q.current_resolution(), Some(4));
    assert_eq!(q.buffer(), coarse.as_slice(), "partial buffer must survive the abort");
}

#[test]
fn aborted_before_execute_never_touches_io() {
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = open_2d(dir.path());

    let access = DiskAccess::create(&ctx, &dataset);
    let header = dataset.header();
    let mut q = BoxQuery::new(header.default_field().clone(), 0.0, header.logic_box);
    dataset.begin_box_query(&mut q).unwrap();
    q.aborted.set();
    access.begin_read().unwrap();
    let err = dataset.execute_box_query(&access, &mut q).unwrap_err();
    access.end_read().unwrap();
    assert!(matches!(err, Error::Aborted));
    let (rok, rfail, _, _) = access.stats().snapshot();
    assert_eq!((rok, rfail), (0, 0));
}

// ── S4: holes ────────────────────────────────────────────────────────────────

#[test]
fn s4_fresh_dataset_reads_zeros() {
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = open_2d(dir.path());

    let access = DiskAccess::create(&ctx, &dataset);
    let q = read_full(&dataset, &access, 8);
    assert_eq!(q.status(), QueryStatus::Ok);
    assert!(q.buffer().iter().all(|b| *b == 0));
    assert!(q.failed_blocks.is_empty());
    assert!(!q.filter_skipped);
}

#[test]
fn s4_unknown_filter_kernel_sets_filter_skipped() {
    let text = HEADER_2D.replace("data u8 compressed zip", "data u8 filter curvelet");
    let dir = TempDir::new().unwrap();
    let dataset = Dataset::open(DatasetHeader::parse(&text).unwrap(), Some(dir.path().into()));
    let ctx = IoContext::new();
    let access = DiskAccess::create(&ctx, &dataset);
    let q = read_full(&dataset, &access, 8);
    assert_eq!(q.status(), QueryStatus::Ok);
    assert!(q.filter_skipped);
    assert!(q.buffer().iter().all(|b| *b == 0));
}

// ── S5: codec round trip through a 3-D dataset ──────────────────────────────

#[test]
fn s5_zip_roundtrip_3d() {
    const HEADER_3D: &str = "\
version 6
logic_box 0 4 0 4 0 4
bitmask V012012
bitsperblock 3
blocksperfile 2
filename_template blocks/%field/t%time/%block.blk
fields
  volume u16 compressed zip
timesteps *
";
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = Dataset::open(DatasetHeader::parse(HEADER_3D).unwrap(), Some(dir.path().into()));

    let data: Vec<u8> = (0..64u16).flat_map(|i| (i * 321).to_le_bytes()).collect();
    write_full(&ctx, &dataset, data.clone());

    let access = DiskAccess::create(&ctx, &dataset);
    let q = read_full(&dataset, &access, 6);
    assert_eq!(q.buffer(), data.as_slice());
}

// ── Idempotent writes ────────────────────────────────────────────────────────

#[test]
fn writing_twice_is_observationally_once() {
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = open_2d(dir.path());
    write_full(&ctx, &dataset, pattern_2d());
    write_full(&ctx, &dataset, pattern_2d());

    let access = DiskAccess::create(&ctx, &dataset);
    let q = read_full(&dataset, &access, 8);
    assert_eq!(q.buffer(), pattern_2d().as_slice());
}

// ── Session discipline ───────────────────────────────────────────────────────

#[test]
fn block_io_outside_a_session_fails() {
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = open_2d(dir.path());
    let access = DiskAccess::create(&ctx, &dataset);

    let header = dataset.header();
    let mut q = BoxQuery::new(header.default_field().clone(), 0.0, header.logic_box);
    dataset.begin_box_query(&mut q).unwrap();
    // No begin_read: the engine must surface the bracket violation.
    let err = dataset.execute_box_query(&access, &mut q).unwrap_err();
    assert!(matches!(err, Error::BadSession(_)));
    assert_eq!(q.status(), QueryStatus::Failed);

    // Brackets cannot nest or cross either.
    access.begin_read().unwrap();
    assert!(matches!(access.begin_write(), Err(Error::BadSession(_))));
    access.end_read().unwrap();
    assert!(matches!(access.end_read(), Err(Error::BadSession(_))));
}

// ── Merge modes ──────────────────────────────────────────────────────────────

#[test]
fn interpolate_fills_from_coarser_levels() {
    // Shifted pattern so no written sample is zero.
    let data: Vec<u8> = (0..256u32).map(|i| (i % 250 + 1) as u8).collect();
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = open_2d(dir.path());
    let header = dataset.header();

    // Write only the coarse levels (everything inside block 0).
    let coarse_ls = dataset.level_box(4).unwrap();
    let mut coarse = vec![0u8; coarse_ls.total()];
    for idx in 0..coarse_ls.total() {
        let p = coarse_ls.point_of(idx);
        coarse[idx] = data[(p[0] + 16 * p[1]) as usize];
    }
    let access = DiskAccess::create(&ctx, &dataset);
    let mut w = BoxQuery::new(header.default_field().clone(), 0.0, header.logic_box);
    w.set_resolution_range(0, 4);
    w.set_buffer(coarse);
    dataset.begin_box_query(&mut w).unwrap();
    access.begin_write().unwrap();
    dataset.execute_box_query_write(&access, &mut w).unwrap();
    access.end_write().unwrap();

    // InsertSamples leaves the unwritten fine positions at zero.
    let plain = read_full(&dataset, &access, 8);
    assert!(plain.buffer().iter().any(|b| *b == 0));

    // InterpolateSamples fills every position from a coarser sample.
    let mut q = BoxQuery::new(header.default_field().clone(), 0.0, header.logic_box);
    q.merge_mode = MergeMode::InterpolateSamples;
    q.end_resolutions = vec![6];
    dataset.begin_box_query(&mut q).unwrap();
    access.begin_read().unwrap();
    dataset.execute_box_query(&access, &mut q).unwrap();
    access.end_read().unwrap();

    let ls = *q.logic_samples().unwrap();
    assert!(q.buffer().iter().all(|b| *b != 0), "every sample interpolated");
    for idx in 0..ls.total() {
        let p = ls.point_of(idx);
        if p[0] % 4 == 0 && p[1] % 4 == 0 {
            let expected = data[(p[0] + 16 * p[1]) as usize];
            assert_eq!(q.buffer()[idx], expected, "coarse sample at {p:?}");
        }
    }
}

// ── Filters ──────────────────────────────────────────────────────────────────

#[test]
fn filtered_field_roundtrips_exactly_for_floats() {
    const HEADER_F: &str = "\
version 6
logic_box 0 8 0 8
bitmask V010101
bitsperblock 2
blocksperfile 4
filename_template blocks/%field/t%time/%block.blk
fields
  speed f64 filter dehaar
timesteps *
";
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = Dataset::open(DatasetHeader::parse(HEADER_F).unwrap(), Some(dir.path().into()));
    let data: Vec<u8> = (0..64u32).flat_map(|i| ((i * 3 % 41) as f64).to_le_bytes()).collect();
    write_full(&ctx, &dataset, data.clone());

    let access = DiskAccess::create(&ctx, &dataset);
    let q = read_full(&dataset, &access, 6);
    assert_eq!(q.status(), QueryStatus::Ok);
    assert!(!q.filter_skipped);
    assert_eq!(q.buffer(), data.as_slice());

    // A coarse filtered read synthesizes the right shape.
    let access = DiskAccess::create(&ctx, &dataset);
    let coarse = read_full(&dataset, &access, 4);
    assert_eq!(coarse.logic_samples().unwrap().total(), 16);
}

#[test]
fn filtered_writes_require_max_resolution() {
    const HEADER_F: &str = "\
version 6
logic_box 0 8 0 8
bitmask V010101
bitsperblock 2
blocksperfile 4
filename_template blocks/%field/t%time/%block.blk
fields
  speed f64 filter dehaar
timesteps *
";
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = Dataset::open(DatasetHeader::parse(HEADER_F).unwrap(), Some(dir.path().into()));
    let header = dataset.header();
    let access = DiskAccess::create(&ctx, &dataset);
    let mut q = BoxQuery::new(header.default_field().clone(), 0.0, header.logic_box);
    q.set_resolution_range(0, 4);
    q.set_buffer(vec![0u8; 16 * 8]);
    dataset.begin_box_query(&mut q).unwrap();
    access.begin_write().unwrap();
    let err = dataset.execute_box_query_write(&access, &mut q).unwrap_err();
    access.end_write().unwrap();
    assert!(matches!(err, Error::OutOfRange(_)));
}

// ── Multiplex and RAM tiers ──────────────────────────────────────────────────

#[test]
fn multiplex_backfills_the_ram_tier() {
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = open_2d(dir.path());
    write_full(&ctx, &dataset, pattern_2d());

    let ram = RamAccess::create(&ctx, 1024 * 1024);
    let disk = DiskAccess::create(&ctx, &dataset);
    let disk_stats = Arc::clone(&disk);
    let multiplexed =
        MultiplexAccess::create(&ctx, vec![ram, disk], WritePolicy::First);

    let first = read_full(&dataset, &multiplexed, 8);
    assert_eq!(first.buffer(), pattern_2d().as_slice());
    let (disk_reads_after_first, _, _, _) = disk_stats.stats().snapshot();

    // Second read is served entirely from the RAM tier.
    let second = read_full(&dataset, &multiplexed, 8);
    assert_eq!(second.buffer(), pattern_2d().as_slice());
    let (disk_reads_after_second, _, _, _) = disk_stats.stats().snapshot();
    assert_eq!(disk_reads_after_first, disk_reads_after_second);
}

#[test]
fn ram_only_dataset_reads_holes() {
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = open_2d(dir.path());
    ctx.registry.register(&dataset);

    let ram = RamAccess::create(&ctx, 1024 * 1024);
    let q = read_full(&dataset, &ram, 8);
    assert_eq!(q.status(), QueryStatus::Ok);
    assert!(q.buffer().iter().all(|b| *b == 0));
}

// ── Mosaic tiling ────────────────────────────────────────────────────────────

#[test]
fn mosaic_rebases_block_ids_across_tiles() {
    use hzidx::{MosaicAccess, MosaicPiece};

    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let logical = open_2d(dir.path().join("logical").as_path());
    let tile_a = open_2d(dir.path().join("a").as_path());
    let tile_b = open_2d(dir.path().join("b").as_path());

    // Blocks 0..8 live in tile a, blocks 8..16 in tile b.
    let mosaic = MosaicAccess::create(
        &ctx,
        vec![
            MosaicPiece { access: DiskAccess::create(&ctx, &tile_a), first_block: 0, nblocks: 8 },
            MosaicPiece { access: DiskAccess::create(&ctx, &tile_b), first_block: 8, nblocks: 8 },
        ],
        4,
    );

    let header = logical.header();
    let mut w = BoxQuery::new(header.default_field().clone(), 0.0, header.logic_box);
    w.set_resolution_range(0, 8);
    w.set_buffer(pattern_2d());
    logical.begin_box_query(&mut w).unwrap();
    mosaic.begin_write().unwrap();
    logical.execute_box_query_write(&mosaic, &mut w).unwrap();
    mosaic.end_write().unwrap();
    assert!(w.failed_blocks.is_empty());

    // Both tile directories received files.
    assert!(dir.path().join("a/blocks").exists());
    assert!(dir.path().join("b/blocks").exists());

    let q = read_full(&logical, &mosaic, 8);
    assert_eq!(q.buffer(), pattern_2d().as_slice());
}

// ── Progression helper ───────────────────────────────────────────────────────

#[test]
fn guessed_progression_is_strictly_ascending() {
    let dir = TempDir::new().unwrap();
    let dataset = open_2d(dir.path());
    let stages = dataset.guess_end_resolutions(0, 8);
    assert_eq!(stages, vec![0, 2, 4, 6, 8]);
    assert!(stages.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(dataset.guess_end_resolutions(3, 8), vec![4, 6, 8]);
}

// ── Statistics ───────────────────────────────────────────────────────────────

#[test]
fn statistics_and_counters_track_io() {
    let dir = TempDir::new().unwrap();
    let ctx = IoContext::new();
    let dataset = open_2d(dir.path());
    write_full(&ctx, &dataset, pattern_2d());

    let access = DiskAccess::create(&ctx, &dataset);
    let _ = read_full(&dataset, &access, 8);
    let (rok, rfail, wok, wfail) = access.stats().snapshot();
    assert_eq!(rok, 16);
    assert_eq!((rfail, wok, wfail), (0, 0, 0));

    let (nopen, rbytes, wbytes) = ctx.counters.snapshot();
    assert!(nopen >= 16);
    assert!(rbytes > 0);
    assert!(wbytes > 0);
}
