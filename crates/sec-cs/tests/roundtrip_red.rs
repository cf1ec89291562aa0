// Acceptance tests for the content store façade: exact roundtrips, the
// canonical empty content, handle validation, and ranged reads.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sec_cs::{Config, ConvergentAes, DirBackend, Error, MemoryBackend, SecureContentStore};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const KEY: [u8; 32] = [0x5C; 32];

fn memory_store() -> SecureContentStore<MemoryBackend, ConvergentAes> {
    SecureContentStore::new(Config::with_chunk_size(256), MemoryBackend::new(), ConvergentAes::new(KEY))
}

fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut v = vec![0u8; len];
    rng.fill(&mut v[..]);
    v
}

#[test]
fn empty_content_roundtrip() -> Result<()> {
    let store = memory_store();
    let handle = store.put_content(b"")?;
    assert!(handle.is_empty());
    assert_eq!(store.get_content(&handle)?, b"");
    assert_eq!(store.backend().len(), 1);

    store.delete_content(&handle)?;
    assert!(store.backend().is_empty());

    match store.get_content(&handle) {
        Err(Error::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
    Ok(())
}

#[test]
fn small_content_roundtrip() -> Result<()> {
    let store = memory_store();
    let data = b"This is a test content.".to_vec();
    let handle = store.put_content(&data)?;
    assert_eq!(handle.len(), data.len() as u64);
    assert_eq!(store.get_content(&handle)?, data);

    store.delete_content(&handle)?;
    assert!(store.backend().is_empty());
    Ok(())
}

#[test]
fn large_content_roundtrip() -> Result<()> {
    let store = memory_store();
    let data = random_bytes(21, 1024 * 1024);
    let handle = store.put_content(&data)?;
    assert_eq!(store.get_content(&handle)?, data);

    store.delete_content(&handle)?;
    assert!(store.backend().is_empty());
    Ok(())
}

#[test]
fn delete_is_not_idempotent() -> Result<()> {
    let store = memory_store();
    let handle = store.put_content(b"delete me once")?;
    store.delete_content(&handle)?;
    match store.delete_content(&handle) {
        Err(Error::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
    Ok(())
}

#[test]
fn ranged_reads_match_slices() -> Result<()> {
    let store = memory_store();
    let data = random_bytes(33, 1024 * 1024);
    let handle = store.put_content(&data)?;

    for (start, end) in [
        (0u64, 1u64),
        (0, 4096),
        (524_280, 524_300),
        (1024 * 1024 - 17, 1024 * 1024),
        (700_001, 700_001),
    ] {
        let got = store.read_range(&handle, start..end)?;
        assert_eq!(got, &data[start as usize..end as usize]);
    }
    Ok(())
}

#[test]
fn roundtrip_over_directory_backend() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = SecureContentStore::new(
        Config::with_chunk_size(256),
        DirBackend::new(dir.path().to_path_buf())?,
        ConvergentAes::new(KEY),
    );
    let data = random_bytes(5, 200_000);
    let handle = store.put_content(&data)?;
    assert_eq!(store.get_content(&handle)?, data);
    store.delete_content(&handle)?;
    match store.get_content(&handle) {
        Err(Error::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_content_roundtrips(seed in 0u64..512, len in 0usize..16_384) {
        let store = memory_store();
        let data = random_bytes(seed, len);

        let h1 = store.put_content(&data).unwrap();
        let h2 = store.put_content(&data).unwrap();
        prop_assert_eq!(h1, h2);
        prop_assert_eq!(store.get_content(&h1).unwrap(), data);

        store.delete_content(&h1).unwrap();
        prop_assert_eq!(store.get_content(&h2).unwrap(), random_bytes(seed, len));
        store.delete_content(&h2).unwrap();
        prop_assert!(store.backend().is_empty());
    }
}
