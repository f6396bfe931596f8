//! Interrupted writes never disturb finalized files
//!
//! A crash between writing a temp file and renaming it is simulated by
//! abandoning the writer, or by leaving a half-written temp file behind.

use anyhow::Result;
use cairn_core::config::{BloomConfig, MidxConfig};
use cairn_core::store::ObjectSink;
use cairn_core::RepoConfig;
use cairn_pack::bloom::{bloom_dir, BLOOM_FILE_NAME};
use cairn_pack::{midx_dir, PackFile, PackIdxList, PackWriter, ShaBloom};
use std::path::Path;

fn names(dir: &Path) -> Result<Vec<String>> {
    let mut v: Vec<String> = std::fs::read_dir(dir)?
        .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<Result<_, _>>()?;
    v.sort();
    Ok(v)
}

fn write_pack(dir: &Path, tag: &str, count: usize) -> Result<String> {
    let mut w = PackWriter::new(dir, RepoConfig::default());
    for i in 0..count {
        w.new_blob(format!("{tag} {i}").as_bytes())?;
    }
    Ok(w.close(false)?.expect("pack written"))
}

#[test]
fn abandoned_pack_leaves_previous_generation() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let first = write_pack(dir.path(), "first", 20)?;
    let before = names(dir.path())?;

    {
        let mut w = PackWriter::new(dir.path(), RepoConfig::default());
        for i in 0..20 {
            w.new_blob(format!("second {i}").as_bytes())?;
        }
        // dropped mid-session
    }
    assert_eq!(names(dir.path())?, before);
    PackFile::open(dir.path().join(format!("{first}.idx")))?.verify()?;

    let mut list = PackIdxList::open(dir.path())?;
    assert_eq!(list.len(), 20);
    assert!(!list.exists(&cairn_core::object::hash_object(
        cairn_core::ObjectKind::Blob,
        b"second 0"
    )));
    Ok(())
}

#[test]
fn stray_temp_files_are_ignored() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for tag in ["a", "b", "c"] {
        write_pack(dir.path(), tag, 10)?;
    }
    // partial outputs of a crashed writer
    std::fs::write(dir.path().join("tmp-pack-x1.pack"), b"PACK\0\0\0\x02")?;
    std::fs::write(dir.path().join(".tmpAbCd"), b"MIDX\0\0")?;
    std::fs::write(dir.path().join("tmp-bloom-y2"), b"BLOM")?;

    let mut list = PackIdxList::open(dir.path())?;
    assert_eq!(list.packs().len(), 3);
    assert_eq!(list.len(), 30);
    assert!(list.exists(&cairn_core::object::hash_object(cairn_core::ObjectKind::Blob, b"b 3")));

    let written = midx_dir(dir.path(), &MidxConfig::default(), true)?;
    assert_eq!(written.len(), 1);
    assert!(bloom_dir(dir.path(), &BloomConfig::default(), false)?.is_some());
    Ok(())
}

#[test]
fn bloom_update_replaces_file_whole() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_pack(dir.path(), "one", 50)?;
    bloom_dir(dir.path(), &BloomConfig::default(), false)?;
    let old = ShaBloom::open(dir.path().join(BLOOM_FILE_NAME))?.expect("bloom");
    assert_eq!(old.entries(), 50);

    write_pack(dir.path(), "two", 50)?;
    bloom_dir(dir.path(), &BloomConfig::default(), false)?;

    // the handle opened before the update still sees the old generation
    assert_eq!(old.entries(), 50);
    assert_eq!(old.idxnames().len(), 1);
    let new = ShaBloom::open(dir.path().join(BLOOM_FILE_NAME))?.expect("bloom");
    assert_eq!(new.entries(), 100);
    assert_eq!(new.idxnames().len(), 2);
    assert!(!names(dir.path())?.iter().any(|n| n.starts_with("tmp-bloom-")));
    Ok(())
}

#[test]
fn failed_midx_merge_keeps_inputs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for tag in ["a", "b"] {
        write_pack(dir.path(), tag, 10)?;
    }
    let first = midx_dir(dir.path(), &MidxConfig::default(), true)?;
    assert_eq!(first.len(), 1);

    // a later merge that never got renamed into place
    write_pack(dir.path(), "c", 10)?;
    std::fs::write(dir.path().join(".tmpZz9"), b"MIDX\0\0\0\x04")?;

    let mut list = PackIdxList::open(dir.path())?;
    assert!(first[0].exists());
    assert_eq!(list.len(), 30);
    assert!(list.exists(&cairn_core::object::hash_object(cairn_core::ObjectKind::Blob, b"a 1")));
    assert!(list.exists(&cairn_core::object::hash_object(cairn_core::ObjectKind::Blob, b"c 1")));
    Ok(())
}
