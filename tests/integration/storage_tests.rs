//! Storage backend tests: tiled pyramid files and strip files through the
//! resolution accessor.

use raster_pyramid::metadata::{TextMetadata, TAG_DESCRIPTION, TAG_SOFTWARE};
use raster_pyramid::{
    AccessMode, BlockGeometry, CodecKind, CodecRegistry, Pyramid, ResolutionAccessor,
    StorageError, StripFile, TiledFile,
};
use tempfile::tempdir;

use super::test_utils::{bilevel_rows, noise, two_level_pyramid};

const ALL_CODECS: [CodecKind; 4] = [
    CodecKind::Identity,
    CodecKind::RunLength,
    CodecKind::Deflate,
    CodecKind::FaxGroup4,
];

// =============================================================================
// Tiled Files
// =============================================================================

#[test]
fn test_two_level_pyramid_write_and_read() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pyramid.rpyr");
    let registry = CodecRegistry::with_builtin();

    let file = TiledFile::create(&path, &two_level_pyramid(), CodecKind::Identity).unwrap();
    let mut level0 = file.accessor(0, AccessMode::ReadWrite, &registry).unwrap();
    for (i, (x, y)) in [(0, 0), (2, 0), (0, 2), (2, 2)].into_iter().enumerate() {
        let base = i as u8 * 4;
        level0
            .write_block(x, y, &[base, base + 1, base + 2, base + 3])
            .unwrap();
    }
    assert_eq!(level0.read_block(0, 0).unwrap(), vec![0, 1, 2, 3]);
    level0.close().unwrap();

    let mut level1 = file.accessor(1, AccessMode::WriteOnly, &registry).unwrap();
    level1.write_block(0, 0, &[9, 9, 9, 9]).unwrap();
    level1.close().unwrap();
    drop(file);

    let reopened = TiledFile::open(&path).unwrap();
    assert_eq!(reopened.level_count(), 2);
    let summaries = reopened.summaries();
    assert_eq!(summaries[0].present, 4);
    assert_eq!(summaries[1].present, 1);

    let mut level0 = reopened.accessor(0, AccessMode::ReadOnly, &registry).unwrap();
    assert_eq!(level0.read_block(2, 2).unwrap(), vec![12, 13, 14, 15]);
    assert_eq!(level0.read_block(2, 0).unwrap(), vec![4, 5, 6, 7]);
    let mut level1 = reopened.accessor(1, AccessMode::ReadOnly, &registry).unwrap();
    assert_eq!(level1.read_block(0, 0).unwrap(), vec![9, 9, 9, 9]);
}

#[test]
fn test_every_codec_round_trips_through_file() {
    let dir = tempdir().unwrap();
    let registry = CodecRegistry::with_builtin();

    for codec in ALL_CODECS {
        let path = dir.path().join(format!("{codec}.rpyr"));
        let bpp = if codec == CodecKind::FaxGroup4 { 1 } else { 8 };
        // 100x70 with 64x64 tiles leaves partial edge tiles in both directions
        let pyramid = Pyramid::new(vec![BlockGeometry::tiles(100, 70, 64, 64, bpp).unwrap()]).unwrap();
        let geometry = *pyramid.level(0).unwrap();

        let file = TiledFile::create(&path, &pyramid, codec).unwrap();
        let mut accessor = file.accessor(0, AccessMode::ReadWrite, &registry).unwrap();
        let mut expected = Vec::new();
        for y in [0, 64] {
            for x in [0, 64] {
                let rows = geometry.block_rows(y);
                let data = if bpp == 1 {
                    bilevel_rows(64, rows, x + y)
                } else {
                    noise(geometry.raw_block_len(y), x * 7 + y)
                };
                assert_eq!(data.len(), geometry.raw_block_len(y), "{codec}");
                accessor.write_block(x, y, &data).unwrap();
                expected.push(((x, y), data));
            }
        }
        accessor.close().unwrap();
        drop(file);

        let file = TiledFile::open(&path).unwrap();
        let mut accessor = file.accessor(0, AccessMode::ReadOnly, &registry).unwrap();
        // Read back in reverse order
        for ((x, y), data) in expected.iter().rev() {
            assert_eq!(&accessor.read_block(*x, *y).unwrap(), data, "{codec} ({x}, {y})");
        }
    }
}

#[test]
fn test_missing_block_and_bad_coordinates() {
    let dir = tempdir().unwrap();
    let registry = CodecRegistry::with_builtin();
    let file = TiledFile::create(
        dir.path().join("sparse.rpyr"),
        &two_level_pyramid(),
        CodecKind::Deflate,
    )
    .unwrap();
    let mut accessor = file.accessor(0, AccessMode::ReadWrite, &registry).unwrap();

    assert!(matches!(
        accessor.read_block(2, 2),
        Err(StorageError::NotFound { x: 2, y: 2 })
    ));
    assert!(matches!(
        accessor.read_block(1, 0),
        Err(StorageError::InvalidCoordinates { .. })
    ));
    assert!(matches!(
        accessor.read_block(4, 0),
        Err(StorageError::InvalidCoordinates { .. })
    ));
}

#[test]
fn test_read_only_file_rejects_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro.rpyr");
    let registry = CodecRegistry::with_builtin();
    {
        let file = TiledFile::create(&path, &two_level_pyramid(), CodecKind::RunLength).unwrap();
        let mut accessor = file.accessor(0, AccessMode::WriteOnly, &registry).unwrap();
        accessor.write_block(0, 0, &[1, 1, 1, 1]).unwrap();
        assert!(matches!(
            accessor.read_block(0, 0),
            Err(StorageError::AccessDenied(_))
        ));
    }

    let file = TiledFile::open(&path).unwrap();
    assert!(!file.is_writable());
    assert!(matches!(
        file.accessor(0, AccessMode::ReadWrite, &registry),
        Err(StorageError::AccessDenied(_))
    ));
    assert!(file
        .update_metadata(|m| m.set(TextMetadata::new(TAG_SOFTWARE, "x")))
        .is_err());

    let mut accessor = file.accessor(0, AccessMode::ReadOnly, &registry).unwrap();
    assert_eq!(accessor.read_block(0, 0).unwrap(), vec![1, 1, 1, 1]);
}

#[test]
fn test_closed_accessor_rejects_operations() {
    let dir = tempdir().unwrap();
    let registry = CodecRegistry::with_builtin();
    let file = TiledFile::create(
        dir.path().join("closed.rpyr"),
        &two_level_pyramid(),
        CodecKind::Identity,
    )
    .unwrap();
    let mut accessor = file.accessor(0, AccessMode::ReadWrite, &registry).unwrap();
    accessor.close().unwrap();
    accessor.close().unwrap();

    assert!(matches!(
        accessor.read_block(0, 0),
        Err(StorageError::InvalidState(_))
    ));
    assert!(matches!(
        accessor.write_block(0, 0, &[0; 4]),
        Err(StorageError::InvalidState(_))
    ));
}

#[test]
fn test_overwrite_after_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rewrite.rpyr");
    let registry = CodecRegistry::with_builtin();
    let pyramid = Pyramid::new(vec![BlockGeometry::tiles(64, 64, 32, 32, 8).unwrap()]).unwrap();

    {
        let file = TiledFile::create(&path, &pyramid, CodecKind::Deflate).unwrap();
        let mut accessor = file.accessor(0, AccessMode::WriteOnly, &registry).unwrap();
        // Highly compressible first, then noise that cannot fit the old slot
        accessor.write_block(0, 0, &[0u8; 32 * 32]).unwrap();
        accessor.write_block(32, 0, &[7u8; 32 * 32]).unwrap();
    }

    let replacement = noise(32 * 32, 99);
    {
        let file = TiledFile::open_writable(&path).unwrap();
        let mut accessor = file.accessor(0, AccessMode::ReadWrite, &registry).unwrap();
        accessor.write_block(0, 0, &replacement).unwrap();
        accessor.write_block(0, 32, &[3u8; 32 * 32]).unwrap();
    }

    let file = TiledFile::open(&path).unwrap();
    let mut accessor = file.accessor(0, AccessMode::ReadOnly, &registry).unwrap();
    assert_eq!(accessor.read_block(0, 0).unwrap(), replacement);
    assert_eq!(accessor.read_block(32, 0).unwrap(), vec![7u8; 32 * 32]);
    assert_eq!(accessor.read_block(0, 32).unwrap(), vec![3u8; 32 * 32]);
    assert_eq!(file.summaries()[0].present, 3);
}

#[test]
fn test_metadata_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("meta.rpyr");
    {
        let file = TiledFile::create(&path, &two_level_pyramid(), CodecKind::Identity).unwrap();
        file.update_metadata(|m| {
            m.set(TextMetadata::new(TAG_DESCRIPTION, "survey sheet 12"));
            m.set(TextMetadata::new(TAG_SOFTWARE, "raster-pyramid"));
        })
        .unwrap();
        file.flush().unwrap();
    }

    let file = TiledFile::open_writable(&path).unwrap();
    let metadata = file.metadata();
    assert_eq!(metadata.tags(), vec![TAG_DESCRIPTION, TAG_SOFTWARE]);
    assert!(!metadata.is_dirty());

    // Replacing a record keeps its position
    file.update_metadata(|m| m.set(TextMetadata::new(TAG_DESCRIPTION, "sheet 13")))
        .unwrap();
    file.flush().unwrap();
    drop(file);

    let metadata = TiledFile::open(&path).unwrap().metadata();
    assert_eq!(metadata.tags(), vec![TAG_DESCRIPTION, TAG_SOFTWARE]);
    assert_eq!(metadata.get(TAG_DESCRIPTION).unwrap().payload(), b"sheet 13");
}

#[test]
fn test_garbage_file_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("garbage.rpyr");
    std::fs::write(&path, b"definitely not a pyramid file").unwrap();
    assert!(TiledFile::open(&path).is_err());

    let empty = dir.path().join("empty.rpyr");
    std::fs::write(&empty, b"").unwrap();
    assert!(TiledFile::open(&empty).is_err());
}

// =============================================================================
// Strip Files
// =============================================================================

#[test]
fn test_strip_file_sequential_fax_strips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scan.rstr");
    let registry = CodecRegistry::with_builtin();
    // 3 full strips and one 2-row strip
    let geometry = BlockGeometry::strips(200, 50, 16, 1).unwrap();

    let mut strips = Vec::new();
    {
        let file = StripFile::create(&path, geometry, CodecKind::FaxGroup4).unwrap();
        let mut accessor =
            ResolutionAccessor::new(file, &registry, 0, 0, AccessMode::WriteOnly)
                .unwrap();
        for y in (0..50).step_by(16) {
            let data = bilevel_rows(200, geometry.block_rows(y), y);
            accessor.write_block(0, y, &data).unwrap();
            strips.push((y, data));
        }
        assert!(accessor.store().is_complete());
    }

    let file = StripFile::open(&path).unwrap();
    assert_eq!(file.strip_count(), 4);
    let mut accessor =
        ResolutionAccessor::new(file, &registry, 0, 0, AccessMode::ReadOnly).unwrap();
    // Random access after the fact is fine
    for (y, data) in strips.iter().rev() {
        assert_eq!(&accessor.read_block(0, *y).unwrap(), data, "strip at row {y}");
    }
}

#[test]
fn test_strip_file_rejects_out_of_order_writes() {
    let dir = tempdir().unwrap();
    let registry = CodecRegistry::with_builtin();
    let geometry = BlockGeometry::strips(8, 8, 2, 8).unwrap();
    let file = StripFile::create(dir.path().join("order.rstr"), geometry, CodecKind::Identity).unwrap();
    let mut accessor =
        ResolutionAccessor::new(file, &registry, 0, 0, AccessMode::WriteOnly).unwrap();

    assert!(matches!(
        accessor.write_block(0, 2, &[0; 16]),
        Err(StorageError::InvalidState(_))
    ));
    accessor.write_block(0, 0, &[1; 16]).unwrap();
    accessor.write_block(0, 2, &[2; 16]).unwrap();
    assert!(matches!(
        accessor.write_block(0, 0, &[3; 16]),
        Err(StorageError::InvalidState(_))
    ));
}

#[test]
fn test_strip_file_needs_strip_layout() {
    let dir = tempdir().unwrap();
    let tiles = BlockGeometry::tiles(8, 8, 4, 4, 8).unwrap();
    assert!(matches!(
        StripFile::create(dir.path().join("tiles.rstr"), tiles, CodecKind::Identity),
        Err(StorageError::InvalidGeometry(_))
    ));
}

#[test]
fn test_strip_file_resumes_appending() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("resume.rstr");
    let registry = CodecRegistry::with_builtin();
    let geometry = BlockGeometry::strips(4, 6, 2, 8).unwrap();
    {
        let file = StripFile::create(&path, geometry, CodecKind::RunLength).unwrap();
        let mut accessor =
            ResolutionAccessor::new(file, &registry, 0, 0, AccessMode::WriteOnly)
                .unwrap();
        accessor.write_block(0, 0, &[5; 8]).unwrap();
    }

    let file = StripFile::open_writable(&path).unwrap();
    assert_eq!(file.strip_count(), 1);
    assert!(!file.is_complete());
    let mut accessor =
        ResolutionAccessor::new(file, &registry, 0, 0, AccessMode::ReadWrite)
            .unwrap();
    accessor.write_block(0, 2, &[6; 8]).unwrap();
    accessor.write_block(0, 4, &[7; 8]).unwrap();
    assert_eq!(accessor.read_block(0, 0).unwrap(), vec![5; 8]);
    assert_eq!(accessor.read_block(0, 4).unwrap(), vec![7; 8]);
    assert!(accessor.store().is_complete());
}
