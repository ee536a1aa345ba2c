#![no_main]
use libfuzzer_sys::fuzz_target;
use squashmount::{classify, Error, ImageKind};
use std::fs;

fuzz_target!(|data: &[u8]| {
    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let path = dir.path().join("candidate");
    if fs::write(&path, data).is_err() {
        return;
    }

    match classify(&path) {
        Ok(ImageKind::Image) => assert!(data.starts_with(b"hsqs")),
        Ok(ImageKind::Other) => assert!(data.len() >= 4 && !data.starts_with(b"hsqs")),
        Ok(ImageKind::Directory) => panic!("regular file classified as directory"),
        Err(Error::Read { .. }) => assert!(data.len() < 4),
        Err(e) => panic!("unexpected error: {}", e),
    }
});
