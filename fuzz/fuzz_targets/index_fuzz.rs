#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use squashmount::modules::image::{EntryKind, ImageEntry, Index};
use std::path::PathBuf;

#[derive(Arbitrary, Debug)]
struct Node {
    path: String,
    dir: bool,
}

fuzz_target!(|nodes: Vec<Node>| {
    let entries = nodes
        .into_iter()
        .enumerate()
        .map(|(node, n)| ImageEntry {
            path: PathBuf::from(n.path),
            kind: if n.dir {
                EntryKind::Directory
            } else {
                EntryKind::File { size: 0 }
            },
            perm: 0o755,
            uid: 0,
            gid: 0,
            mtime: 0,
            node,
        })
        .collect();

    let index = Index::build(entries);
    let root = index.get(1).expect("root inode");
    assert!(root.is_dir());
    for ino in 1..=index.len() as u64 {
        let inode = index.get(ino).expect("dense inode numbers");
        assert!(index.get(inode.parent).map_or(false, |p| p.is_dir()));
    }
});
