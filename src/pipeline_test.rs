use super::*;
use std::io::Write;
use tempfile::tempdir;

#[test]
fn stage_names_are_stable() {
    assert_eq!(Stage::Validating.to_string(), "validation");
    assert_eq!(Stage::PreparingQueryDb.to_string(), "query database preparation");
    assert_eq!(Stage::PreparingTargetDb.to_string(), "target database preparation");
    assert_eq!(Stage::Indexing.to_string(), "index construction");
    assert_eq!(Stage::Aligning.to_string(), "alignment");
}

#[test]
fn db_path_strips_fasta_extensions() {
    assert_eq!(
        db_path_for(Path::new("/tmp/genome.fasta")),
        PathBuf::from("/tmp/genome.gdb")
    );
    assert_eq!(
        db_path_for(Path::new("/tmp/genome.fa.gz")),
        PathBuf::from("/tmp/genome.gdb")
    );
    assert_eq!(
        db_path_for(Path::new("/tmp/genome.fna")),
        PathBuf::from("/tmp/genome.gdb")
    );
}

#[test]
fn validates_plain_fasta() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ok.fasta");
    std::fs::write(&path, ">chr1\nACGTACGT\n").unwrap();
    validate_fasta(&path).unwrap();
}

#[test]
fn validates_gzipped_fasta() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ok.fasta.gz");
    let file = std::fs::File::create(&path).unwrap();
    let mut gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    gz.write_all(b">chr1\nACGT\n").unwrap();
    gz.finish().unwrap();
    validate_fasta(&path).unwrap();
}

#[test]
fn rejects_missing_file() {
    match validate_fasta(Path::new("/nonexistent/genome.fasta")) {
        Err(Error::Io { .. }) => {}
        other => panic!("expected io error, got {other:?}"),
    }
}

#[test]
fn rejects_empty_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.fasta");
    std::fs::write(&path, "").unwrap();
    match validate_fasta(&path) {
        Err(Error::Validation(msg)) => assert!(msg.contains("empty")),
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn rejects_non_fasta_content() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "just some text\n").unwrap();
    match validate_fasta(&path) {
        Err(Error::Validation(msg)) => assert!(msg.contains("FASTA")),
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn finds_binary_via_bin_dir_env() {
    let dir = tempdir().unwrap();
    let fake = dir.path().join("FakeAligner");
    std::fs::write(&fake, "#!/bin/sh\n").unwrap();

    std::env::set_var(crate::defaults::BIN_DIR_ENV, dir.path());
    let found = find_binary("FakeAligner").unwrap();
    std::env::remove_var(crate::defaults::BIN_DIR_ENV);

    assert_eq!(found, fake);
}

#[test]
fn missing_binary_is_a_validation_error() {
    match find_binary("NoSuchAlignerBinary") {
        Err(Error::Validation(msg)) => assert!(msg.contains("NoSuchAlignerBinary")),
        other => panic!("expected validation error, got {other:?}"),
    }
}
