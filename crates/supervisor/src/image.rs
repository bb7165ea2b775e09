//! Image references and local image presence.
use std::convert::TryFrom;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Maximum total number of characters in a repository name.
const NAME_TOTAL_LENGTH_MAX: usize = 255;
const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Errors parsing an image reference.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    /// Nothing to parse.
    #[error("image reference is empty")]
    Empty,
    /// The repository name is too long.
    #[error("repository name must not be more than {} characters", NAME_TOTAL_LENGTH_MAX)]
    NameTooLong,
    /// The repository name contains uppercase letters.
    #[error("repository name must be lowercase: {0}")]
    NameContainsUppercase(String),
    /// The digest is not `algorithm:hex`.
    #[error("invalid digest format: {0}")]
    DigestInvalidFormat(String),
    /// The tag is empty or malformed.
    #[error("invalid tag format: {0}")]
    TagInvalidFormat(String),
}

/// A registry image reference, `[registry/]repository[:tag][@digest]`.
///
/// A reference without a registry resolves to Docker Hub, a single component
/// repository there to `library/`, and a reference without tag or digest to
/// the `latest` tag.
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Reference {
    /// The registry host.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The repository path.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag, if present.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The digest, if present.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The whole reference.
    pub fn whole(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(t) = self.tag() {
            s.push(':');
            s.push_str(t);
        }
        if let Some(d) = self.digest() {
            s.push('@');
            s.push_str(d);
        }
        s
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl FromStr for Reference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::try_from(s)
    }
}

impl TryFrom<&str> for Reference {
    type Error = ReferenceError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => {
                let valid = digest
                    .split_once(':')
                    .map(|(alg, hex)| {
                        !alg.is_empty() && !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit())
                    })
                    .unwrap_or(false);
                if !valid {
                    return Err(ReferenceError::DigestInvalidFormat(digest.to_string()));
                }
                (rest, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // A colon after the last slash separates the tag; one before it
        // belongs to a registry port.
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].find(':') {
            Some(i) => {
                let tag = &rest[last_slash + i + 1..];
                let valid = !tag.is_empty()
                    && tag.len() <= 128
                    && tag
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
                if !valid {
                    return Err(ReferenceError::TagInvalidFormat(tag.to_string()));
                }
                (&rest[..last_slash + i], Some(tag.to_string()))
            }
            None => (rest, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), remainder.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
        };

        if repository.is_empty() {
            return Err(ReferenceError::Empty);
        }
        if repository.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ReferenceError::NameTooLong);
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ReferenceError::NameContainsUppercase(repository));
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Reference {
            registry,
            repository,
            tag,
            digest,
        })
    }
}

impl TryFrom<String> for Reference {
    type Error = ReferenceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Reference::try_from(s.as_str())
    }
}

/// Local image storage.
#[async_trait::async_trait]
pub trait ImageStore: Send + Sync {
    /// Returns the root filesystem of the image if it is present locally.
    async fn lookup(&self, reference: &Reference) -> anyhow::Result<Option<PathBuf>>;
    /// Fetches the image and returns its root filesystem.
    async fn pull(&self, reference: &Reference) -> anyhow::Result<PathBuf>;
}

/// Makes sure the image is present, pulling it only if it is missing.
#[instrument(level = "info", skip(store, reference), fields(image = %reference))]
pub async fn ensure_image(store: &dyn ImageStore, reference: &Reference) -> anyhow::Result<PathBuf> {
    if let Some(path) = store.lookup(reference).await? {
        debug!(path = %path.display(), "Image already present");
        return Ok(path);
    }
    info!("Pulling image");
    store
        .pull(reference)
        .await
        .with_context(|| format!("failed to pull image {}", reference))
}

/// Stores unpacked images as directories:
/// `<root>/<registry>/<repository>/<tag or digest>/rootfs`.
///
/// Pulling is delegated to an external command. The placeholders
/// `{reference}` and `{dest}` in its arguments are replaced with the image
/// reference and the directory the root filesystem must be unpacked into.
#[derive(Clone, Debug)]
pub struct DirectoryImageStore {
    root: PathBuf,
    pull_command: Vec<String>,
}

impl DirectoryImageStore {
    /// Creates a store under `root`. An empty `pull_command` disables pulling.
    pub fn new<P: Into<PathBuf>>(root: P, pull_command: Vec<String>) -> Self {
        DirectoryImageStore {
            root: root.into(),
            pull_command,
        }
    }

    /// The directory holding the root filesystem of `reference`.
    pub fn rootfs(&self, reference: &Reference) -> PathBuf {
        let version = reference
            .digest()
            .or_else(|| reference.tag())
            .unwrap_or(DEFAULT_TAG)
            .replace(':', "_");
        self.root
            .join(reference.registry().replace(':', "_"))
            .join(reference.repository())
            .join(version)
            .join("rootfs")
    }
}

#[async_trait::async_trait]
impl ImageStore for DirectoryImageStore {
    async fn lookup(&self, reference: &Reference) -> anyhow::Result<Option<PathBuf>> {
        let rootfs = self.rootfs(reference);
        match tokio::fs::metadata(&rootfs).await {
            Ok(metadata) if metadata.is_dir() => Ok(Some(rootfs)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to inspect {}", rootfs.display())),
        }
    }

    async fn pull(&self, reference: &Reference) -> anyhow::Result<PathBuf> {
        let (program, args) = self
            .pull_command
            .split_first()
            .with_context(|| format!("image {} is not present and no pull command is configured", reference))?;

        let rootfs = self.rootfs(reference);
        let partial = rootfs.with_file_name("rootfs.partial");
        remove_dir_if_exists(&partial).await?;
        tokio::fs::create_dir_all(&partial)
            .await
            .with_context(|| format!("failed to create {}", partial.display()))?;

        let whole = reference.whole();
        let dest = partial.to_string_lossy().into_owned();
        let args: Vec<String> = args
            .iter()
            .map(|a| a.replace("{reference}", &whole).replace("{dest}", &dest))
            .collect();
        let output = tokio::process::Command::new(program)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("failed to run pull command {}", program))?;
        if !output.status.success() {
            remove_dir_if_exists(&partial).await?;
            anyhow::bail!(
                "pull command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        remove_dir_if_exists(&rootfs).await?;
        tokio::fs::rename(&partial, &rootfs)
            .await
            .with_context(|| format!("failed to move {} into place", rootfs.display()))?;
        info!(image = %reference, path = %rootfs.display(), "Image pulled");
        Ok(rootfs)
    }
}

async fn remove_dir_if_exists(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}
