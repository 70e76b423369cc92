mod common;

use common::{all_chunks, hex, snippet, source};
use rac::{ChunkReader, ChunkWriter, Codec, Error, IndexLocation, WriterConfig};

fn at(index_location: IndexLocation) -> WriterConfig {
    WriterConfig {
        index_location,
        ..WriterConfig::default()
    }
}

fn primary(i: usize) -> Vec<u8> {
    let lead = if i > 255 { 'q' } else { 'p' };
    format!("{lead}{:02x}", i & 0xFF).into_bytes()
}

#[test]
fn two_level_tree_with_shared_resources() {
    let mut writer = ChunkWriter::new(Vec::new(), &at(IndexLocation::AtStart)).expect("writer");
    let mut xx = None;
    let mut yy = None;
    let mut zz = None;
    let mut want_primaries = Vec::new();
    for i in 0..260 {
        let (secondary, tertiary) = match i {
            3 => {
                xx = Some(writer.add_resource(b"XX").expect("resource"));
                yy = Some(writer.add_resource(b"YY").expect("resource"));
                (xx, yy)
            }
            4 => {
                zz = Some(writer.add_resource(b"ZZ").expect("resource"));
                (yy, zz)
            }
            259 => (yy, None),
            _ => (None, None),
        };
        let primary = primary(i);
        want_primaries.extend_from_slice(&primary);
        writer
            .add_chunk(0x10000, Codec::ZLIB, &primary, secondary, tertiary)
            .expect("chunk");
    }
    let got = writer.finish().expect("finish");

    assert_eq!(got.len(), 0x13E2);
    let root = hex(
        "72 c3 63 02 ec 35 00 fe 00 00 fc 00 00 00 00 fe
         00 00 04 01 00 00 00 01 30 00 00 00 00 00 04 ff
         30 10 00 00 00 00 01 ff e2 13 00 00 00 00 01 02",
    );
    assert_eq!(&got[..0x30], &root[..]);
    assert_eq!(&got[0x30..0x38], &hex("72 c3 63 ff 81 14 00 ff")[..]);
    assert_eq!(&got[0x1030..0x1038], &hex("72 c3 63 09 53 ad 00 ff")[..]);

    let chunks = all_chunks(source(got.clone()));
    assert_eq!(chunks.len(), 260);
    let got_primaries: Vec<u8> = chunks
        .iter()
        .flat_map(|c| snippet(&got, c.c_primary, 3))
        .collect();
    assert_eq!(got_primaries, want_primaries);

    assert_eq!(snippet(&got, chunks[3].c_secondary, 2), b"XX");
    assert_eq!(snippet(&got, chunks[3].c_tertiary, 2), b"YY");
    assert_eq!(snippet(&got, chunks[4].c_secondary, 2), b"YY");
    assert_eq!(snippet(&got, chunks[4].c_tertiary, 2), b"ZZ");
    assert_eq!(snippet(&got, chunks[259].c_secondary, 2), b"YY");
    assert!(chunks[258].c_secondary.is_empty());

    // Seeking lands in the second branch.
    let mut reader = ChunkReader::new(source(got.clone())).expect("open");
    reader
        .seek_to_chunk_containing(257 * 0x10000 + 5)
        .expect("seek");
    let chunk = reader.next_chunk().expect("next").expect("chunk");
    assert_eq!(snippet(&got, chunk.c_primary, 3), b"q01");
}

fn thousand_chunks(index_location: IndexLocation, with_resource: bool) -> Vec<u8> {
    let mut writer = ChunkWriter::new(Vec::new(), &at(index_location)).expect("writer");
    let resource = if with_resource {
        Some(writer.add_resource(&[0x7F]).expect("resource"))
    } else {
        None
    };
    for i in 0..1000 {
        let secondary = if i == 2 * 255 { resource } else { None };
        writer
            .add_chunk(1, Codec::ZLIB, &[(i % 251) as u8], secondary, None)
            .expect("chunk");
    }
    writer.finish().expect("finish")
}

#[test]
fn thousand_chunks_iterate_in_order() {
    for location in [IndexLocation::AtEnd, IndexLocation::AtStart] {
        for with_resource in [false, true] {
            let got = thousand_chunks(location, with_resource);
            let chunks = all_chunks(source(got.clone()));
            assert_eq!(chunks.len(), 1000, "{location:?} resource={with_resource}");
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.d_range, rac::Range::new(i as u64, i as u64 + 1));
                assert_eq!(snippet(&got, chunk.c_primary, 1), vec![(i % 251) as u8]);
            }
            if with_resource {
                assert_eq!(snippet(&got, chunks[510].c_secondary, 1), vec![0x7F]);
            }
        }
    }
}

#[test]
fn every_offset_seeks_to_its_chunk() {
    let got = thousand_chunks(IndexLocation::AtEnd, true);
    let mut reader = ChunkReader::new(source(got)).expect("open");
    for offset in [0u64, 1, 254, 255, 509, 510, 511, 998, 999] {
        reader.seek_to_chunk_containing(offset).expect("seek");
        let chunk = reader.next_chunk().expect("next").expect("chunk");
        assert_eq!(chunk.d_range.lo, offset);
    }
    reader.seek_to_chunk_containing(1000).expect("seek");
    assert_eq!(reader.next_chunk().expect("next"), None);
}

#[test]
fn iteration_ends_at_a_corrupt_branch() {
    let mut got = thousand_chunks(IndexLocation::AtStart, false);
    // Root (arity 4, 80 bytes) then the first full branch (4096 bytes); break
    // the second branch's checksum.
    got[80 + 4096 + 20] ^= 0x01;
    let results: Vec<_> = ChunkReader::new(source(got))
        .expect("open")
        .take(300)
        .collect();
    assert_eq!(results.len(), 256);
    assert!(results[..255].iter().all(Result::is_ok));
    assert!(matches!(results[255], Err(Error::InvalidIndexNode)));
}
