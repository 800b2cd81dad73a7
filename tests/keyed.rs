use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::Path;

use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::RowAccessor;
use serde_json::json;
use shardpack::keyed::{GroupEntry, MemberEntry};
use shardpack::{
    DirStore, GroupIndex, ShardId, ShardRange, ShardWriter, WriterOpts, ZipStore, pack_groups,
};
use zip::write::SimpleFileOptions;

fn member(path: &str, label: &str) -> MemberEntry {
    MemberEntry {
        path: path.to_owned(),
        original_split: "training".to_owned(),
        original_metadata: json!({ "filename": path, "label": label }),
    }
}

/// Two classes; `playing+guitar` has one member missing from the store.
fn fixture(root: &Path) -> anyhow::Result<GroupIndex> {
    fs::create_dir_all(root.join("training/bowling"))?;
    fs::create_dir_all(root.join("training/playing+guitar"))?;
    fs::write(root.join("training/bowling/a.mp4"), b"bowl-a")?;
    fs::write(root.join("training/bowling/b.mp4"), b"bowl-b")?;
    fs::write(root.join("training/playing+guitar/c.mp4"), b"guitar-c")?;
    fs::write(root.join("training/playing+guitar/e.mp4"), b"guitar-e")?;

    Ok(GroupIndex {
        original_dataset: "moments_in_time".to_owned(),
        groups: vec![
            GroupEntry {
                id: 0,
                label: "bowling".to_owned(),
                caption: None,
                members: vec![
                    member("training/bowling/a.mp4", "bowling"),
                    member("training/bowling/b.mp4", "bowling"),
                ],
            },
            GroupEntry {
                id: 1,
                label: "playing+guitar".to_owned(),
                caption: None,
                members: vec![
                    member("training/playing+guitar/c.mp4", "playing+guitar"),
                    member("training/playing+guitar/d.mp4", "playing+guitar"),
                    member("training/playing+guitar/e.mp4", "playing+guitar"),
                ],
            },
        ],
    })
}

fn members(path: &Path) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(File::open(path)?);
    let mut out = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        out.push((name, buf));
    }
    Ok(out)
}

#[test]
fn one_shard_and_table_per_group_with_missing_members_skipped() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    let index = fixture(root.path())?;

    let mut writer = ShardWriter::new(out.path(), WriterOpts::default())?;
    let mut store = DirStore::new(root.path());
    let report = pack_groups(&index, &mut store, &mut writer, ShardRange::new(0, None)?)?;

    assert_eq!(report.groups.len(), 2);
    assert_eq!(report.extracted(), 4);
    assert_eq!(report.failures(), 1);

    let guitar = &report.groups[1];
    assert_eq!(guitar.id, ShardId(1));
    assert_eq!((guitar.expected, guitar.extracted, guitar.failures), (3, 2, 1));

    for group in &report.groups {
        let table = out.path().join(group.id.table_name());
        assert_eq!(group.table.as_deref(), Some(table.as_path()));
        let reader = SerializedFileReader::new(File::open(&table)?)?;
        assert_eq!(
            reader.metadata().file_metadata().num_rows() as u64,
            group.expected - group.failures
        );
    }

    // Member indexes are positions in the whole index, so the missing `d` leaves a gap.
    let names: Vec<String> = members(&out.path().join("0000000001.tar"))?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(
        names,
        vec![
            "0000000000000002.json",
            "0000000000000002.mp4",
            "0000000000000002.txt",
            "0000000000000004.json",
            "0000000000000004.mp4",
            "0000000000000004.txt",
        ]
    );

    let entries = members(&out.path().join("0000000001.tar"))?;
    assert_eq!(entries[1].1, b"guitar-c");
    assert_eq!(entries[2].1, b"playing guitar");

    let meta: serde_json::Value = serde_json::from_slice(&entries[0].1)?;
    assert_eq!(meta["key"], "0000000000000002");
    assert_eq!(meta["status"], "success");
    assert!(meta["error_message"].is_null());
    assert_eq!(meta["caption"], "playing+guitar");
    assert_eq!(meta["original_dataset"], "moments_in_time");
    assert_eq!(meta["original_metadata"]["filename"], "training/playing+guitar/c.mp4");
    Ok(())
}

#[test]
fn table_keys_match_archived_members() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    let index = fixture(root.path())?;

    let mut writer = ShardWriter::new(out.path(), WriterOpts::default())?;
    pack_groups(&index, &mut DirStore::new(root.path()), &mut writer, ShardRange::new(0, None)?)?;

    let reader = SerializedFileReader::new(File::open(out.path().join("0000000000.parquet"))?)?;
    let mut keys = Vec::new();
    for row in reader.get_row_iter(None)? {
        keys.push(row?.get_string(0)?.clone());
    }
    assert_eq!(keys, vec!["0000000000000000", "0000000000000001"]);
    Ok(())
}

#[test]
fn range_limits_which_groups_are_packed() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    let index = fixture(root.path())?;

    let mut writer = ShardWriter::new(out.path(), WriterOpts::default())?;
    let report = pack_groups(
        &index,
        &mut DirStore::new(root.path()),
        &mut writer,
        ShardRange::new(1, Some(2))?,
    )?;

    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].label, "playing+guitar");
    assert!(!out.path().join("0000000000.tar").exists());
    assert!(out.path().join("0000000001.tar").exists());
    assert!(out.path().join("0000000001.parquet").exists());
    Ok(())
}

#[test]
fn group_index_loads_from_json() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("index.json");
    fs::write(
        &path,
        r#"{
            "original_dataset": "moments_in_time",
            "groups": [
                {"id": 0, "label": "bowling", "members": [
                    {"path": "training/bowling/a.mp4", "original_split": "training"}
                ]}
            ]
        }"#,
    )?;

    let index = GroupIndex::load(&path)?;
    assert_eq!(index.member_count(), 1);
    assert_eq!(index.groups[0].caption(), "bowling");
    assert!(index.groups[0].members[0].original_metadata.is_null());

    fs::write(&path, "{ not json")?;
    assert!(GroupIndex::load(&path).is_err());
    Ok(())
}

#[test]
fn members_are_read_from_a_zip_and_sidecars_copied() -> anyhow::Result<()> {
    // Same layout as the directory fixture, with `d.mp4` absent from the archive.
    let scratch = tempfile::tempdir()?;
    let index = fixture(scratch.path())?;

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file("trainingSet.csv", SimpleFileOptions::default())?;
    zip.write_all(b"a.mp4,bowling\n")?;
    for path in [
        "training/bowling/a.mp4",
        "training/bowling/b.mp4",
        "training/playing+guitar/c.mp4",
        "training/playing+guitar/e.mp4",
    ] {
        zip.start_file(path, SimpleFileOptions::default())?;
        zip.write_all(&fs::read(scratch.path().join(path))?)?;
    }
    let bytes = zip.finish()?.into_inner();

    let out = tempfile::tempdir()?;
    let mut store = ZipStore::new(Cursor::new(bytes))?;
    let sidecars = store.copy_sidecars(out.path())?;
    assert_eq!(sidecars, vec![out.path().join("trainingSet.csv")]);

    let mut writer = ShardWriter::new(out.path(), WriterOpts::default())?;
    let report = pack_groups(&index, &mut store, &mut writer, ShardRange::new(0, None)?)?;
    assert_eq!(report.extracted(), 4);
    assert_eq!(report.failures(), 1);

    for group in &report.groups {
        let reader = SerializedFileReader::new(File::open(out.path().join(group.id.table_name()))?)?;
        assert_eq!(
            reader.metadata().file_metadata().num_rows() as u64,
            group.expected - group.failures
        );
    }

    let entries = members(&out.path().join("0000000001.tar"))?;
    assert_eq!(entries.len(), 6);
    assert_eq!(entries[1].1, b"guitar-c");
    assert_eq!(entries[4].1, b"guitar-e");
    Ok(())
}
