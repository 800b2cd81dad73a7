//! Resolve payload URIs into [`BlobData`].
//!
//! Local paths are streamed straight into the archive later, so we only check that they
//! exist. Remote URLs (feature `http`) are downloaded into the staging directory first:
//! - download to `<name>.part`
//! - fsync + rename to `<name>`
//!
//! The resulting staged file is owned by the sample and removed once archived.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::sample::BlobData;
use crate::{Error, Result};

/// Turns manifest payload URIs into blob data.
#[derive(Debug)]
pub struct Fetcher {
    staging_dir: PathBuf,
    base_dir: Option<PathBuf>,

    #[cfg(feature = "http")]
    client: reqwest::blocking::Client,
}

impl Fetcher {
    /// Create a fetcher that stages remote downloads under `staging_dir` (created if missing).
    pub fn new(staging_dir: impl Into<PathBuf>) -> Result<Self> {
        let staging_dir = staging_dir.into();
        fs::create_dir_all(&staging_dir).map_err(Error::write_io(&staging_dir))?;

        Ok(Self {
            staging_dir,
            base_dir: None,
            #[cfg(feature = "http")]
            client: reqwest::blocking::Client::builder()
                .user_agent("shardpack")
                .build()
                .map_err(|err| Error::msg(format!("failed to build HTTP client: {err}")))?,
        })
    }

    /// Resolve relative local paths against `dir` instead of the working directory.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Resolve `uri` into blob data. `stage_name` names the staging file for remote payloads
    /// and must be unique among samples that are alive at the same time.
    pub fn fetch(&self, uri: &str, stage_name: &str) -> Result<BlobData> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return self.fetch_remote(uri, &self.staging_dir.join(stage_name));
        }

        let raw = uri.strip_prefix("file://").unwrap_or(uri);
        let path = match &self.base_dir {
            Some(base) if Path::new(raw).is_relative() => base.join(raw),
            _ => PathBuf::from(raw),
        };

        if !path.is_file() {
            return Err(Error::SourceIo {
                context: format!("payload not found: {}", path.display()),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        Ok(BlobData::File(path))
    }

    #[cfg(feature = "http")]
    fn fetch_remote(&self, url: &str, dest: &Path) -> Result<BlobData> {
        let resp = self
            .client
            .get(url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(|err| Error::SourceIo {
                context: format!("request failed: {url}"),
                source: io::Error::other(err),
            })?;

        download_to_path_with_reader(resp, dest)?;
        Ok(BlobData::Staged(dest.to_path_buf()))
    }

    #[cfg(not(feature = "http"))]
    fn fetch_remote(&self, url: &str, _dest: &Path) -> Result<BlobData> {
        Err(Error::config(format!(
            "cannot fetch {url}: shardpack was built without the `http` feature"
        )))
    }
}

/// Copy `reader` into `dest_path` via a `.part` file, cleaning up on failure.
///
/// Read failures are source errors; create/write/rename failures are local write errors.
#[cfg_attr(not(feature = "http"), allow(dead_code))]
pub(crate) fn download_to_path_with_reader<R: Read>(mut reader: R, dest_path: &Path) -> Result<()> {
    let tmp_path = PathBuf::from(format!("{}.part", dest_path.display()));

    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp_path).map_err(Error::write_io(&tmp_path))?;

        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(Error::source_io(format!("reading payload for {}", dest_path.display())))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).map_err(Error::write_io(&tmp_path))?;
        }

        file.sync_all().map_err(Error::write_io(&tmp_path))?;
        fs::rename(&tmp_path, dest_path).map_err(Error::write_io(dest_path))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }

    result
}
