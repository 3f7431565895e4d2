#![no_main]

use libfuzzer_sys::fuzz_target;
use pakcache_rs::{ArchiveCache, CacheOptions, HEADER_SIZE};
use std::io::Write;
use tempfile::NamedTempFile;

fuzz_target!(|data: &[u8]| {
    if data.len() < HEADER_SIZE {
        return;
    }

    let mut temp_file = match NamedTempFile::new() {
        Ok(f) => f,
        Err(_) => return,
    };
    if temp_file.write_all(data).is_err() || temp_file.flush().is_err() {
        return;
    }

    // Opening arbitrary bytes may fail, but must never panic
    let mut cache = match ArchiveCache::open(temp_file.path(), CacheOptions::default().read_only()) {
        Ok(c) => c,
        Err(_) => return,
    };

    for file in cache.list_files() {
        let _ = cache.read_file_to_vec(&file);
    }

    let _ = cache.entry_count();
    let _ = cache.contains_dir("");
    let _ = cache.find_file("test.txt", true);
    let _ = cache.find_file("../../../etc/passwd", false);
});
