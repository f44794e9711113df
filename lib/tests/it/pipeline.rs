//! End-to-end scenarios over an on-disk exported tree: trace text in, layer
//! member list and image tar out. No container runtime involved.

use std::{fs, io::Cursor, os::unix::fs::symlink, path::PathBuf};

use color_eyre::Result;
use futures_lite::StreamExt;
use tokio_tar::Archive;
use whittle_lib::{
    closure::{self, AccessSet},
    image::{ImageWriter, LayerId},
    oracle::Oracle,
    reduce,
    trace::{self, ExecutionRecord},
};

/// A minimal exported root: a static binary that mentions `PATH`, a shell,
/// a shebang script, one dynamic linker, and a python-style symlink chain.
fn export_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("create tempdir");
    let root = dir.path();

    fs::create_dir_all(root.join("usr/bin")).expect("mkdir usr/bin");
    fs::create_dir_all(root.join("usr/lib/python3.9/bin")).expect("mkdir usr/lib/python3.9/bin");
    fs::create_dir_all(root.join("opt/py/bin")).expect("mkdir opt/py/bin");
    fs::create_dir_all(root.join("bin")).expect("mkdir bin");
    fs::create_dir_all(root.join("app")).expect("mkdir app");
    fs::create_dir_all(root.join("lib64")).expect("mkdir lib64");

    fs::write(root.join("usr/bin/true"), b"\x7fELF..getenv..PATH..").expect("write true");
    fs::write(root.join("bin/sh"), b"\x7fELF shell").expect("write sh");
    fs::write(root.join("app/run.sh"), b"#!/bin/sh\nexec /usr/bin/true\n").expect("write run.sh");
    fs::write(root.join("lib64/ld-linux-x86-64.so.2"), b"\x7fELF linker").expect("write linker");
    fs::write(root.join("opt/py/bin/python3"), b"\x7fELF python").expect("write python3");

    symlink("../lib/python3.9/bin/python3", root.join("usr/bin/python3"))
        .expect("link usr/bin/python3");
    symlink("/opt/py/bin/python3", root.join("usr/lib/python3.9/bin/python3"))
        .expect("link usr/lib python3");

    dir
}

fn records_from(trace_text: &str, cwd: &str) -> Vec<ExecutionRecord> {
    trace::parse(Cursor::new(trace_text.to_string()), 1, cwd, false)
        .expect("parse trace")
        .remove(&1)
        .expect("records for root pid")
}

fn members_for(oracle: &Oracle, records: &[ExecutionRecord]) -> Vec<PathBuf> {
    let access = AccessSet::merge_all(oracle, records).expect("merge records");
    let kept = closure::existing_subset(oracle, access.touched());
    closure::closure(oracle, kept.iter().cloned())
}

#[test_log::test]
fn static_binary_keeps_binary_ancestors_and_linker() {
    let tree = export_tree();
    let oracle = Oracle::new(tree.path());
    let records = records_from(
        "execve(\"/usr/bin/true\", [\"true\"], [\"PATH=/usr/bin\"]) = 0\nexit_group(0) = ?\n",
        "/",
    );
    let members = members_for(&oracle, &records);

    for expected in [
        "usr",
        "usr/bin",
        "usr/bin/true",
        "lib64",
        "lib64/ld-linux-x86-64.so.2",
    ] {
        assert!(
            members.contains(&PathBuf::from(expected)),
            "missing {expected} in {members:?}"
        );
    }
    // Linkers the export does not carry stay out.
    assert!(!members.contains(&PathBuf::from("lib/ld-musl-x86_64.so.1")));
}

#[test_log::test]
fn static_binary_env_retained_when_name_occurs_in_binary() {
    let tree = export_tree();
    let oracle = Oracle::new(tree.path());
    let records = records_from(
        "execve(\"/usr/bin/true\", [\"true\"], [\"PATH=/usr/bin\", \"UNUSED_VAR=1\"]) = 0\nexit_group(0) = ?\n",
        "/",
    );
    let access = AccessSet::merge_all(&oracle, &records).expect("merge records");
    let kept = closure::existing_subset(&oracle, access.touched());
    let members = closure::closure(&oracle, kept.iter().cloned());

    let regular = members
        .iter()
        .filter(|member| oracle.is_regular(member))
        .map(|member| oracle.host_path(oracle.rooted_realpath(member)))
        .collect::<Vec<_>>();
    let envkeys = reduce::reduce_environ(regular, &access.env_keys).expect("reduce environ");
    assert!(envkeys.contains("PATH"), "PATH occurs in the binary bytes");
    assert!(!envkeys.contains("UNUSED_VAR"), "UNUSED_VAR occurs nowhere");
}

#[test_log::test]
fn shebang_script_pulls_in_its_interpreter() {
    let tree = export_tree();
    let oracle = Oracle::new(tree.path());
    let records = records_from(
        "execve(\"/app/run.sh\", [\"run.sh\"], [\"HOME=/root\"]) = 0\nexit_group(0) = ?\n",
        "/",
    );
    let members = members_for(&oracle, &records);

    for expected in ["app", "app/run.sh", "bin", "bin/sh"] {
        assert!(
            members.contains(&PathBuf::from(expected)),
            "missing {expected} in {members:?}"
        );
    }
}

#[test_log::test]
fn symlink_chain_keeps_both_names_and_all_ancestors() {
    let tree = export_tree();
    let oracle = Oracle::new(tree.path());
    let records = records_from(
        "execve(\"/usr/bin/python3\", [\"python3\"], []) = 0\nstat(\"/usr/bin/python3\", {st_mode=S_IFREG|0755}) = 0\nexit_group(0) = ?\n",
        "/",
    );
    let members = members_for(&oracle, &records);

    for expected in [
        "usr",
        "usr/bin",
        "usr/bin/python3",
        "usr/lib",
        "usr/lib/python3.9",
        "usr/lib/python3.9/bin",
        "usr/lib/python3.9/bin/python3",
        "opt",
        "opt/py",
        "opt/py/bin",
        "opt/py/bin/python3",
    ] {
        assert!(
            members.contains(&PathBuf::from(expected)),
            "missing {expected} in {members:?}"
        );
    }
}

#[test_log::test(tokio::test)]
async fn closure_to_image_tar_round_trip() -> Result<()> {
    let tree = export_tree();
    let oracle = Oracle::new(tree.path());
    let records = records_from(
        "execve(\"/app/run.sh\", [\"run.sh\"], []) = 0\nexit_group(0) = ?\n",
        "/",
    );
    let members = members_for(&oracle, &records);

    let output = tempfile::tempdir().expect("create output dir");
    let writer = ImageWriter::builder()
        .name("slim_app")
        .tree(tree.path())
        .output(output.path())
        .members(members.clone())
        .layer_id(LayerId::from_bytes([3; 32]))
        .build();
    writer.write().await?;

    let layer = output
        .path()
        .join("slim_app")
        .join(writer.layer_id.as_str())
        .join("layer.tar");
    let file = tokio::fs::File::open(&layer).await?;
    let mut archive = Archive::new(file);
    let mut entries = archive.entries()?;
    let mut listed = Vec::new();
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        listed.push(entry.path()?.to_path_buf());
    }

    // Every member the tree carries landed in the archive, in sorted order,
    // so each parent directory precedes its children.
    assert_eq!(listed, members);
    Ok(())
}
