use std::fs;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use taxus::{BuildParams, Metric, SearchParams, TaxusError, TaxusIndex};

fn build_random(metric: Metric, dimension: usize, items: usize, seed: u64) -> TaxusIndex {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut index = TaxusIndex::new(dimension, metric).unwrap();
    for id in 0..items {
        let v: Vec<f32> = (0..dimension)
            .map(|_| rng.random_range(-1.0f32..1.0))
            .collect();
        index.add_item(id as i64, &v).unwrap();
    }
    index.build(BuildParams::new(8).seed(seed)).unwrap();
    index
}

#[test]
fn test_save_load_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.taxus");

    let original = build_random(Metric::Euclidean, 10, 500, 42);
    original.save(&path).unwrap();

    let loaded = TaxusIndex::load(&path, false).unwrap();
    assert_eq!(loaded.n_items(), original.n_items());
    assert_eq!(loaded.n_trees(), original.n_trees());
    assert_eq!(loaded.dimension(), 10);
    assert_eq!(loaded.metric(), Metric::Euclidean);

    for id in 0..500i64 {
        assert_eq!(
            loaded.item_vector(id).unwrap(),
            original.item_vector(id).unwrap()
        );
    }

    // The mapped blob is byte-identical to the built one, so queries
    // agree for any fixed search_k.
    let params = SearchParams {
        search_k: Some(500),
        ..SearchParams::default()
    };
    for id in [0i64, 123, 499] {
        assert_eq!(
            loaded.nns_by_item(id, 10, &params).unwrap(),
            original.nns_by_item(id, 10, &params).unwrap()
        );
    }
}

#[test]
fn test_load_with_prefault() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.taxus");
    let original = build_random(Metric::Angular, 6, 100, 7);
    original.save(&path).unwrap();

    let loaded = TaxusIndex::load(&path, true).unwrap();
    let params = SearchParams {
        search_k: Some(100),
        ..SearchParams::default()
    };
    assert_eq!(
        loaded.nns_by_item(3, 5, &params).unwrap(),
        original.nns_by_item(3, 5, &params).unwrap()
    );
}

#[test]
fn test_sparse_ids_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sparse.taxus");

    let mut index = TaxusIndex::new(2, Metric::Euclidean).unwrap();
    for id in [3i64, 900, 17, 250_000] {
        let x = id as f32;
        index.add_item(id, &[x, -x]).unwrap();
    }
    index.build(BuildParams::new(2).seed(5)).unwrap();
    index.save(&path).unwrap();

    let loaded = TaxusIndex::load(&path, false).unwrap();
    assert_eq!(loaded.n_items(), 4);
    assert_eq!(loaded.item_vector(250_000).unwrap(), vec![250_000.0, -250_000.0]);
    assert!(matches!(
        loaded.item_vector(4),
        Err(TaxusError::NotFound(4))
    ));
    let neighbors = loaded
        .nns_by_item(900, 2, &SearchParams::default())
        .unwrap();
    assert_eq!(neighbors[0].id, 900);
}

#[test]
fn test_hamming_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bits.taxus");

    let mut index = TaxusIndex::new(3, Metric::Hamming).unwrap();
    index.add_item(0, &[1.0, 0.0, 1.0]).unwrap();
    index.add_item(1, &[1.0, 1.0, 0.0]).unwrap();
    index.build(BuildParams::new(2).seed(3)).unwrap();
    index.save(&path).unwrap();

    let loaded = TaxusIndex::load(&path, false).unwrap();
    assert_eq!(loaded.metric(), Metric::Hamming);
    assert_eq!(loaded.distance(0, 1).unwrap(), 2.0);
}

#[test]
fn test_missing_file_is_io_error() {
    assert!(matches!(
        TaxusIndex::load("/nonexistent/directory/index.taxus", false),
        Err(TaxusError::Io(_))
    ));
}

#[test]
fn test_corrupt_magic_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.taxus");
    build_random(Metric::Euclidean, 4, 50, 9).save(&path).unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes[0] = b'Z';
    fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        TaxusIndex::load(&path, false),
        Err(TaxusError::CorruptFile(_))
    ));
}

#[test]
fn test_truncated_file_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.taxus");
    build_random(Metric::Euclidean, 4, 50, 9).save(&path).unwrap();

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
    assert!(matches!(
        TaxusIndex::load(&path, false),
        Err(TaxusError::CorruptFile(_))
    ));
}

#[test]
fn test_header_field_corruption_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.taxus");
    build_random(Metric::Euclidean, 4, 50, 9).save(&path).unwrap();

    let mut bytes = fs::read(&path).unwrap();
    // Flip a bit in the stored item count; the header checksum catches it.
    bytes[16] ^= 0x01;
    fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        TaxusIndex::load(&path, false),
        Err(TaxusError::CorruptFile(_))
    ));
}

#[test]
fn test_unload_releases_the_mapping() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.taxus");
    build_random(Metric::Euclidean, 4, 50, 2).save(&path).unwrap();

    let mut loaded = TaxusIndex::load(&path, false).unwrap();
    assert!(loaded.is_built());
    loaded.unload();
    assert!(!loaded.is_built());
    assert!(matches!(
        loaded.nns_by_item(0, 1, &SearchParams::default()),
        Err(TaxusError::Unloaded)
    ));

    // The file itself is untouched and can be loaded again.
    let reloaded = TaxusIndex::load(&path, false).unwrap();
    assert_eq!(reloaded.n_items(), 50);
}

#[test]
fn test_save_keeps_index_queryable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.taxus");
    let index = build_random(Metric::Euclidean, 4, 50, 2);
    index.save(&path).unwrap();
    let neighbors = index.nns_by_item(0, 3, &SearchParams::default()).unwrap();
    assert_eq!(neighbors[0].id, 0);
}
