//! End-to-end coverage of the pipeline: files on disk in, plots out.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use aptflow::filter::spectrum::{KEY_BIN_WIDTH, KEY_COLOUR, KEY_LOG_Y};
use aptflow::filter::{DataLoadFilter, Filter, RangingFilter, SpectrumFilter};
use aptflow::filter::ranging::KEY_DROP_UNRANGED;
use aptflow::filter::PropertyValue;
use aptflow::progress::run_unwatched;
use aptflow::range::{RangeFile, RangeFormat};
use aptflow::state::{load_state, save_state};
use aptflow::stream::StreamKind;
use aptflow::{load_pos, write_pos, Colour, FilterTree, IonHit, Point3};

const RANGE_CONTENT: &str = "2 2\n\
    Carbon\nC 1.0 0.0 0.0\n\
    Hydrogen\nH 0.0 1.0 0.0\n\
    ------------- C H\n\
    . 10.0 20.0 1 0\n\
    . 30.0 40.0 0 1\n";

fn counting_ions(n: usize) -> Vec<IonHit> {
    (0..n)
        .map(|i| {
            let v = i as f32;
            IonHit::new(Point3::new(v, v, v), v)
        })
        .collect()
}

#[test]
fn pos_round_trip_is_bit_exact() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("counting.pos");
    let ions = counting_ions(133);
    write_pos(&path, &ions).unwrap();

    let loaded = load_pos(&path, 4, [0, 1, 2, 3], None).unwrap();
    assert_eq!(loaded, ions);

    // Writing the loaded data again reproduces the bytes exactly
    let copy = dir.path().join("copy.pos");
    write_pos(&copy, &loaded).unwrap();
    assert_eq!(fs::read(&path).unwrap(), fs::read(&copy).unwrap());
}

#[test]
fn misnamed_range_file_opens_via_fallback() {
    let dir = TempDir::new().unwrap();
    // ORNL content behind an .rrng extension: the guessed parser fails and
    // the brute-force pass finds the right one
    let path = dir.path().join("mislabelled.rrng");
    fs::write(&path, RANGE_CONTENT).unwrap();
    let parsed = RangeFile::open(&path, None).unwrap();
    assert_eq!(parsed.format(), RangeFormat::Ornl);
    assert_eq!(parsed.table.num_ranges(), 2);
}

#[test]
fn full_pipeline_from_disk() {
    let dir = TempDir::new().unwrap();
    let pos_path = dir.path().join("ions.pos");
    let rng_path = dir.path().join("species.rng");
    // Masses 0..99: 11 carbon (10..=20), 11 hydrogen (30..=40), 78 unranged
    write_pos(&pos_path, &counting_ions(100)).unwrap();
    fs::write(&rng_path, RANGE_CONTENT).unwrap();

    let mut tree = FilterTree::new();
    let load = tree
        .add_filter(Filter::DataLoad(DataLoadFilter::for_file(&pos_path)), None)
        .unwrap();
    let ranges = RangeFile::open(&rng_path, None).unwrap();
    let ranging = tree
        .add_filter(
            Filter::Ranging(RangingFilter::from_range_file(ranges)),
            Some(load),
        )
        .unwrap();

    // With drop_unranged off, bucket sizes must sum to the input count
    tree.set_filter_property(ranging, KEY_DROP_UNRANGED, &PropertyValue::Bool(false));
    let deliveries = run_unwatched(|ctx| tree.refresh(ctx)).unwrap();
    assert_eq!(deliveries.len(), 1);
    let streams = &deliveries[0].1;
    let ion_total: usize = streams
        .iter()
        .filter_map(|s| s.expect_ions())
        .map(|s| s.data.len())
        .sum();
    assert_eq!(ion_total, 100);

    // With drop_unranged on, only the classified ions survive
    tree.set_filter_property(ranging, KEY_DROP_UNRANGED, &PropertyValue::Bool(true));
    let deliveries = run_unwatched(|ctx| tree.refresh(ctx)).unwrap();
    let streams = &deliveries[0].1;
    let ion_total: usize = streams
        .iter()
        .filter_map(|s| s.expect_ions())
        .map(|s| s.data.len())
        .sum();
    assert_eq!(ion_total, 22);
}

#[test]
fn spectrum_of_unit_spaced_masses() {
    let dir = TempDir::new().unwrap();
    let pos_path = dir.path().join("ions.pos");
    write_pos(&pos_path, &counting_ions(100)).unwrap();

    let mut tree = FilterTree::new();
    let load = tree
        .add_filter(Filter::DataLoad(DataLoadFilter::for_file(&pos_path)), None)
        .unwrap();
    let spectrum = tree
        .add_filter(Filter::Spectrum(SpectrumFilter::new()), Some(load))
        .unwrap();
    let red = Colour::rgb(1.0, 0.0, 0.0);
    tree.set_filter_property(spectrum, KEY_BIN_WIDTH, &PropertyValue::Real(1.0));
    tree.set_filter_property(spectrum, KEY_LOG_Y, &PropertyValue::Bool(false));
    tree.set_filter_property(spectrum, KEY_COLOUR, &PropertyValue::Colour(red));

    let deliveries = run_unwatched(|ctx| tree.refresh(ctx)).unwrap();
    assert_eq!(deliveries.len(), 1);
    let streams = &deliveries[0].1;
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].kind(), StreamKind::Plot);
    let plot = streams[0].expect_plot().unwrap();
    assert_eq!(plot.colour, red);
    assert!(!plot.log_y);
    // One count per unit-wide bin, none lost
    let occupied = plot.xy.iter().filter(|&&(_, y)| y > 0.0).count();
    assert_eq!(occupied, 100);
    assert!(plot.xy.iter().all(|&(_, y)| y <= 1.0));
}

#[test]
fn state_round_trip_preserves_tree() {
    let dir = TempDir::new().unwrap();
    let pos_path = dir.path().join("ions.pos");
    write_pos(&pos_path, &counting_ions(10)).unwrap();

    let mut tree = FilterTree::new();
    let load = tree
        .add_filter(Filter::DataLoad(DataLoadFilter::for_file(&pos_path)), None)
        .unwrap();
    let spectrum_id = tree
        .add_filter(Filter::Spectrum(SpectrumFilter::new()), Some(load))
        .unwrap();
    tree.set_filter_property(spectrum_id, KEY_BIN_WIDTH, &PropertyValue::Real(0.125));

    let state_path = dir.path().join("session.xml");
    save_state(&tree, &state_path).unwrap();
    let mut restored = load_state(&state_path).unwrap();

    assert_eq!(restored.len(), 2);
    for (a, b) in tree.ids().iter().zip(restored.ids()) {
        let fa = tree.filter(*a).unwrap();
        let fb = restored.filter(b).unwrap();
        assert_eq!(fa.kind(), fb.kind());
        assert_eq!(fa.properties(), fb.properties());
    }

    // The restored tree refreshes to the same plot
    let original = run_unwatched(|ctx| tree.refresh(ctx)).unwrap();
    let reloaded = run_unwatched(|ctx| restored.refresh(ctx)).unwrap();
    assert_eq!(
        original[0].1[0].expect_plot().unwrap().xy,
        reloaded[0].1[0].expect_plot().unwrap().xy
    );
}

#[test]
fn env_and_rrng_writers_round_trip_through_open() {
    let dir = TempDir::new().unwrap();
    let parsed = RangeFile::parse(RANGE_CONTENT, RangeFormat::Ornl).unwrap();

    for format in [RangeFormat::Ornl, RangeFormat::Rrng, RangeFormat::Env] {
        let path = dir.path().join(match format {
            RangeFormat::Ornl => "out.rng",
            RangeFormat::Rrng => "out.rrng",
            RangeFormat::Env => "out.env",
        });
        parsed.write(&path, format).unwrap();
        let reloaded = RangeFile::open(&path, Some(format)).unwrap();
        assert_eq!(reloaded.table.num_ranges(), parsed.table.num_ranges());
        assert!(reloaded.table.is_self_consistent());
        for range_id in 0..parsed.table.num_ranges() {
            assert_eq!(
                reloaded.table.range(range_id),
                parsed.table.range(range_id)
            );
        }
    }
}

#[test]
fn relative_state_paths_resolve() {
    let dir = TempDir::new().unwrap();
    let pos_path = dir.path().join("local.pos");
    write_pos(&pos_path, &counting_ions(5)).unwrap();

    let xml = "<aptflow version=\"0\"><filtertree>\
        <filter type=\"dataload\" label=\"d\">\
        <file value=\"./local.pos\"/>\
        </filter></filtertree></aptflow>";
    let state_path = dir.path().join("rel.xml");
    fs::write(&state_path, xml).unwrap();

    let mut tree = load_state(&state_path).unwrap();
    let deliveries = run_unwatched(|ctx| tree.refresh(ctx)).unwrap();
    let ions = deliveries[0].1[0].expect_ions().unwrap();
    assert_eq!(ions.data.len(), 5);
}

#[test]
fn guessing_rejects_garbage_with_first_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("noise.rng");
    fs::write(&path, "this is not a range file at all\n").unwrap();
    assert!(RangeFile::open(&path, None).is_err());
    assert!(Path::new(&path).exists());
}
