use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::detection::domain::identity_verifier::ReferenceImage;
use crate::shared::constants::IMAGE_EXTENSIONS;
use crate::shared::frame::Frame;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry directory does not exist: {0}")]
    MissingDirectory(PathBuf),
    #[error("invalid username: {0:?}")]
    InvalidUsername(String),
    #[error("no reference image for {0}")]
    NotFound(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Directory of enrolled users, one reference image per user.
///
/// `<dir>/<username>.<ext>`; images are decoded on first use and cached.
pub struct UserRegistry {
    dir: PathBuf,
    allow: Option<HashSet<String>>,
    deny: HashSet<String>,
    cache: Mutex<HashMap<String, Arc<Frame>>>,
}

impl UserRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(RegistryError::MissingDirectory(dir));
        }
        Ok(Self {
            dir,
            allow: None,
            deny: HashSet::new(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Restricts admission to the given usernames.
    pub fn with_allow_list<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow = Some(users.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_deny_list<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deny = users.into_iter().map(Into::into).collect();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether a reference image exists for `username`.
    pub fn is_known(&self, username: &str) -> bool {
        self.image_path(username).is_ok()
    }

    /// `false` only when an allow list is set and `username` is missing from it.
    pub fn is_allowed(&self, username: &str) -> bool {
        self.allow.as_ref().map_or(true, |a| a.contains(username))
    }

    pub fn is_denied(&self, username: &str) -> bool {
        self.deny.contains(username)
    }

    /// Enrolled usernames, sorted.
    pub fn usernames(&self) -> Result<Vec<String>, RegistryError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| RegistryError::Read {
            path: self.dir.clone(),
            source: e,
        })?;
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && extension_rank(path).is_some())
            .filter_map(|path| path.file_stem()?.to_str().map(str::to_string))
            .filter(|name| valid_username(name))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Loads (or returns the cached) reference image for `username`.
    ///
    /// Blocking: decodes the image file on a cache miss.
    pub fn reference(&self, username: &str) -> Result<ReferenceImage, RegistryError> {
        if let Some(frame) = self.lock_cache().get(username) {
            return Ok(ReferenceImage {
                username: username.to_string(),
                frame: Arc::clone(frame),
            });
        }

        let path = self.image_path(username)?;
        let bytes = std::fs::read(&path).map_err(|e| RegistryError::Read {
            path: path.clone(),
            source: e,
        })?;
        let frame = Frame::decode(&bytes, 0)
            .map_err(|e| RegistryError::Decode { path, source: e })?;
        let frame = Arc::new(frame);

        self.lock_cache()
            .insert(username.to_string(), Arc::clone(&frame));
        log::debug!("Loaded reference image for {username}");

        Ok(ReferenceImage {
            username: username.to_string(),
            frame,
        })
    }

    /// Drops the cached image so the next admission re-reads the file.
    pub fn invalidate(&self, username: &str) {
        self.lock_cache().remove(username);
    }

    fn image_path(&self, username: &str) -> Result<PathBuf, RegistryError> {
        if !valid_username(username) {
            return Err(RegistryError::InvalidUsername(username.to_string()));
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|e| RegistryError::Read {
            path: self.dir.clone(),
            source: e,
        })?;
        entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| path.file_stem().and_then(|s| s.to_str()) == Some(username))
            .filter_map(|path| extension_rank(&path).map(|rank| (rank, path)))
            .min()
            .map(|(_, path)| path)
            .ok_or_else(|| RegistryError::NotFound(username.to_string()))
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Frame>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Usernames double as file and directory names, so path syntax is refused.
fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'))
}

/// Position of the path's extension in `IMAGE_EXTENSIONS`, ignoring case.
fn extension_rank(path: &Path) -> Option<usize> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().position(|known| *known == ext)
}
