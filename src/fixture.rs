//! Fixture keys and the on-disk fixture store.
//!
//! A fixture is the raw wire bytes of one HTTP response, stored under a key
//! derived from the request path so that the same logical request always
//! lands on the same file.

use std::{
    borrow::Cow,
    fmt, fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;

/// Characters replaced by [`FILLER`] when deriving a key.
pub const RESERVED_CHARS: [char; 9] = ['&', '#', '/', '?', '=', ':', ',', '(', ')'];
pub const FILLER: char = '_';
pub const FIXTURE_EXTENSION: &str = "http_data";
/// Literal that stands in for the synthetic prefix inside every key.
pub const KEY_PREFIX_LITERAL: &str = "request";

fn precision_regex() -> &'static Regex {
    static PRECISION_RE: OnceLock<Regex> = OnceLock::new();
    PRECISION_RE.get_or_init(|| Regex::new(r"(\d+\.\d{4})\d+").expect("precision regex is valid"))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixtureKey(String);

impl FixtureKey {
    /// Derives the key for a request path (query string included).
    ///
    /// Digits beyond the fourth decimal place are dropped, not rounded, so
    /// upstream coordinate noise does not churn recorded fixtures.
    pub fn derive(request_path: &str, synthetic_prefix: &str) -> Self {
        let sanitized = replace_reserved(request_path);
        let truncated = precision_regex().replace_all(&sanitized, "${1}");
        let marker = replace_reserved(synthetic_prefix);
        Self(truncated.replace(marker.as_str(), KEY_PREFIX_LITERAL))
    }

    /// Wraps a key read back from a fixture file name.
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let key = file_name.strip_suffix(FIXTURE_EXTENSION)?.strip_suffix('.')?;
        (!key.is_empty()).then(|| Self(key.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> String {
        format!("{}.{FIXTURE_EXTENSION}", self.0)
    }
}

impl fmt::Display for FixtureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn replace_reserved(value: &str) -> String {
    value
        .chars()
        .map(|ch| if RESERVED_CHARS.contains(&ch) { FILLER } else { ch })
        .collect()
}

/// Whether a request path targets recorded traffic.
pub fn is_synthetic(request_path: &str, synthetic_prefix: &str) -> bool {
    request_path.contains(synthetic_prefix)
}

/// Removes the first occurrence of the synthetic prefix, yielding the path the
/// upstream service knows about.
pub fn strip_synthetic_prefix<'a>(request_path: &'a str, synthetic_prefix: &str) -> Cow<'a, str> {
    if is_synthetic(request_path, synthetic_prefix) {
        Cow::Owned(request_path.replacen(synthetic_prefix, "", 1))
    } else {
        Cow::Borrowed(request_path)
    }
}

#[derive(Debug)]
pub enum FixtureError {
    Read { path: PathBuf, source: io::Error },
    Write { path: PathBuf, source: io::Error },
}

impl fmt::Display for FixtureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => {
                write!(f, "read fixture {}: {source}", path.display())
            }
            Self::Write { path, source } => {
                write!(f, "write fixture {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for FixtureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } | Self::Write { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixtureStore {
    dir: PathBuf,
}

impl FixtureStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &FixtureKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    pub fn contains(&self, key: &FixtureKey) -> bool {
        self.path_for(key).is_file()
    }

    pub fn read(&self, key: &FixtureKey) -> Result<Vec<u8>, FixtureError> {
        let path = self.path_for(key);
        fs::read(&path).map_err(|source| FixtureError::Read { path, source })
    }

    /// Persists a fixture atomically: the bytes go to a temporary file in the
    /// store directory which then replaces the target.
    pub fn write(&self, key: &FixtureKey, bytes: &[u8]) -> Result<(), FixtureError> {
        let path = self.path_for(key);
        let write_err = |source| FixtureError::Write {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(write_err)?;
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir).map_err(write_err)?;
        staged.write_all(bytes).map_err(write_err)?;
        staged.as_file().sync_all().map_err(write_err)?;
        staged
            .persist(&path)
            .map_err(|err| write_err(err.error))?;
        Ok(())
    }

    pub async fn read_async(&self, key: &FixtureKey) -> Result<Vec<u8>, FixtureError> {
        let path = self.path_for(key);
        tokio::fs::read(&path)
            .await
            .map_err(|source| FixtureError::Read { path, source })
    }

    pub async fn write_async(&self, key: &FixtureKey, bytes: Vec<u8>) -> Result<(), FixtureError> {
        let path = self.path_for(key);
        let store = self.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || store.write(&key, &bytes))
            .await
            .unwrap_or_else(|err| {
                Err(FixtureError::Write {
                    path,
                    source: io::Error::other(err),
                })
            })
    }

    /// Every stored key, sorted. A missing directory is an empty store.
    pub fn list(&self) -> Result<Vec<FixtureKey>, FixtureError> {
        let read_err = |source| FixtureError::Read {
            path: self.dir.clone(),
            source,
        };
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(read_err(err)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(read_err)?;
            if !entry.file_type().map_err(read_err)?.is_file() {
                continue;
            }
            if let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(FixtureKey::from_file_name)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
