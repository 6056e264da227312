use crate::error::CaptionResult;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use zip::write::SimpleFileOptions;

/// Extract every entry of `archive_path` below `target_dir`.
///
/// Entries whose names would land outside `target_dir` are skipped.
pub fn unpack_archive(
    archive_path: impl AsRef<Path>,
    target_dir: impl AsRef<Path>,
) -> CaptionResult<()> {
    let target_dir = target_dir.as_ref();
    let file = fs::File::open(archive_path.as_ref())?;
    let mut archive = zip::ZipArchive::new(file)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let output_path = match file.enclosed_name() {
            Some(output_path) => target_dir.join(output_path),
            None => {
                tracing::warn!("skip archive entry outside target dir: {}", file.name());
                continue;
            }
        };

        if file.is_dir() {
            fs::create_dir_all(output_path)?;
        } else {
            if let Some(p) = output_path.parent() {
                if !p.exists() {
                    fs::create_dir_all(p)?;
                }
            }
            let mut output_file = fs::File::create(&output_path)?;
            std::io::copy(&mut file, &mut output_file)?;
        }
    }

    Ok(())
}

/// Regular files directly inside `dir`, sorted by name. Subdirectories are ignored.
pub fn list_files(dir: impl AsRef<Path>) -> CaptionResult<Vec<PathBuf>> {
    let mut files = vec![];
    for entry in fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Write `files` into a new zip at `output_path`, flat and deflated,
/// each entry named after its file name.
pub fn pack_archive(files: &[PathBuf], output_path: impl AsRef<Path>) -> CaptionResult<()> {
    let output_path = output_path.as_ref();
    if let Some(p) = output_path.parent() {
        if !p.as_os_str().is_empty() && !p.exists() {
            fs::create_dir_all(p)?;
        }
    }

    let archive_file = fs::File::create(output_path)?;
    let mut zip = zip::ZipWriter::new(archive_file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for file_path in files {
        let Some(file_name) = file_path.file_name() else {
            continue;
        };
        zip.start_file(file_name.to_string_lossy().to_string(), options)?;
        let buffer = fs::read(file_path)?;
        zip.write_all(&buffer)?;
    }

    zip.finish()?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::{list_files, pack_archive, unpack_archive};
    use std::{fs, io::Write};
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &std::path::Path, entries: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
        for (name, content) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_unpack_and_list_top_level_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("input.zip");
        write_zip(
            &archive,
            &[("b.jpg", b"b"), ("a.png", b"a"), ("nested/c.png", b"c")],
        );

        let target = dir.path().join("unpacked");
        unpack_archive(&archive, &target).unwrap();

        let files = list_files(&target).unwrap();
        assert_eq!(files, vec![target.join("a.png"), target.join("b.jpg")]);
        assert!(target.join("nested/c.png").exists());
    }

    #[test]
    fn test_unpack_skips_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("input.zip");
        write_zip(&archive, &[("../evil.png", b"evil"), ("ok.png", b"ok")]);

        let target = dir.path().join("unpacked");
        unpack_archive(&archive, &target).unwrap();

        assert!(!dir.path().join("evil.png").exists());
        assert_eq!(list_files(&target).unwrap(), vec![target.join("ok.png")]);
    }

    #[test]
    fn test_unpack_rejects_non_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("input.zip");
        fs::write(&archive, "<html>quota exceeded</html>").unwrap();

        let result = unpack_archive(&archive, dir.path().join("unpacked"));
        assert!(matches!(result, Err(crate::CaptionError::Archive(_))));
    }

    #[test]
    fn test_pack_is_flat() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("results");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("a.png.txt"), "caption a").unwrap();

        let output = dir.path().join("out").join("result.zip");
        pack_archive(&[nested.join("a.png.txt")], &output).unwrap();

        let mut archive = zip::ZipArchive::new(fs::File::open(&output).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
        let mut entry = archive.by_name("a.png.txt").unwrap();
        let mut content = String::new();
        std::io::Read::read_to_string(&mut entry, &mut content).unwrap();
        assert_eq!(content, "caption a");
    }
}
