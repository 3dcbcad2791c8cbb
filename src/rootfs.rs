//! Root filesystem URI parsing.
//!
//! Two schemes are supported:
//!
//! - `raw://<absolute-path>`: the path is bound as the container root
//!   directly.
//! - `docker[://<index-host>]/<repo>[#<tag>]`: the image is pulled through
//!   the machine runtime and cloned per container. Single-segment
//!   repositories get the `library/` prefix, the tag defaults to `latest`,
//!   and the index defaults to the public Docker index.

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Default index host for `docker://` URIs with no explicit host.
pub const DEFAULT_DOCKER_INDEX: &str = "https://index.docker.io";

/// Default tag when a `docker://` URI carries no fragment.
pub const DEFAULT_DOCKER_TAG: &str = "latest";

/// A parsed rootfs location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootFs {
    /// Bind an existing directory as the container root.
    Raw {
        /// Absolute path of the root directory.
        path: PathBuf,
    },
    /// Pull an image from a Docker index and clone it per container.
    Docker {
        /// Index URL, e.g. `https://index.docker.io`.
        index: String,
        /// Repository, always at least two segments (`library/ubuntu`).
        repo: String,
        /// Image tag.
        tag: String,
    },
}

impl RootFs {
    /// Parse a rootfs URI.
    pub fn parse(uri: &str) -> Result<Self> {
        if uri.is_empty() {
            return Err(Error::invalid_rootfs("no rootfs path specified"));
        }

        if let Some(path) = uri.strip_prefix("raw://") {
            if path.is_empty() {
                return Err(Error::invalid_rootfs(format!("empty raw path: {}", uri)));
            }
            return Ok(RootFs::Raw {
                path: PathBuf::from(path),
            });
        }

        if let Some(rest) = uri.strip_prefix("docker://") {
            return parse_docker(rest, uri);
        }

        Err(Error::invalid_rootfs(format!(
            "unsupported rootfs scheme: {}",
            uri
        )))
    }

    /// Name under which the machine runtime caches the pulled base image.
    ///
    /// Stable across containers so repeated Creates reuse the pull.
    pub fn image_name(&self) -> Option<String> {
        match self {
            RootFs::Raw { .. } => None,
            RootFs::Docker { repo, tag, .. } => {
                Some(format!("{}-{}", repo.replace('/', "-"), tag))
            }
        }
    }
}

fn parse_docker(rest: &str, uri: &str) -> Result<RootFs> {
    let (body, tag) = match rest.split_once('#') {
        Some((body, tag)) if !tag.is_empty() => (body, tag.to_string()),
        Some((body, _)) => (body, DEFAULT_DOCKER_TAG.to_string()),
        None => (rest, DEFAULT_DOCKER_TAG.to_string()),
    };

    // `docker:///repo` has no index host; `docker://host/repo` names one.
    let (index, repo) = if let Some(repo) = body.strip_prefix('/') {
        (DEFAULT_DOCKER_INDEX.to_string(), repo.to_string())
    } else {
        match body.split_once('/') {
            Some((host, repo)) if !repo.is_empty() => {
                (format!("https://{}", host), repo.to_string())
            }
            _ => {
                return Err(Error::invalid_rootfs(format!(
                    "docker uri has no repository: {}",
                    uri
                )))
            }
        }
    };

    if repo.is_empty() {
        return Err(Error::invalid_rootfs(format!(
            "docker uri has no repository: {}",
            uri
        )));
    }

    let repo = if repo.contains('/') {
        repo
    } else {
        format!("library/{}", repo)
    };

    Ok(RootFs::Docker { index, repo, tag })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw() {
        let rootfs = RootFs::parse("raw:///images/base").unwrap();
        assert_eq!(
            rootfs,
            RootFs::Raw {
                path: PathBuf::from("/images/base")
            }
        );
    }

    #[test]
    fn test_parse_empty_uri() {
        let err = RootFs::parse("").unwrap_err();
        assert!(err.to_string().contains("no rootfs path specified"));
    }

    #[test]
    fn test_parse_empty_raw_path() {
        assert!(RootFs::parse("raw://").is_err());
    }

    #[test]
    fn test_parse_unsupported_scheme() {
        let err = RootFs::parse("overlay:///somewhere").unwrap_err();
        assert!(err.to_string().contains("unsupported rootfs scheme"));
    }

    #[test]
    fn test_parse_docker_defaults() {
        let rootfs = RootFs::parse("docker:///ubuntu").unwrap();
        assert_eq!(
            rootfs,
            RootFs::Docker {
                index: DEFAULT_DOCKER_INDEX.to_string(),
                repo: "library/ubuntu".to_string(),
                tag: "latest".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_docker_with_tag() {
        let rootfs = RootFs::parse("docker:///ubuntu#14.04").unwrap();
        let RootFs::Docker { repo, tag, .. } = rootfs else {
            panic!("expected docker rootfs");
        };
        assert_eq!(repo, "library/ubuntu");
        assert_eq!(tag, "14.04");
    }

    #[test]
    fn test_parse_docker_with_index_host() {
        let rootfs = RootFs::parse("docker://registry.example.com/acme/worker#v2").unwrap();
        assert_eq!(
            rootfs,
            RootFs::Docker {
                index: "https://registry.example.com".to_string(),
                repo: "acme/worker".to_string(),
                tag: "v2".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_docker_multi_segment_repo_kept() {
        let rootfs = RootFs::parse("docker:///acme/worker").unwrap();
        let RootFs::Docker { repo, .. } = rootfs else {
            panic!("expected docker rootfs");
        };
        assert_eq!(repo, "acme/worker");
    }

    #[test]
    fn test_parse_docker_missing_repo() {
        assert!(RootFs::parse("docker://").is_err());
        assert!(RootFs::parse("docker:///").is_err());
        assert!(RootFs::parse("docker://host.example/").is_err());
    }

    #[test]
    fn test_image_name() {
        assert_eq!(RootFs::parse("raw:///x").unwrap().image_name(), None);
        assert_eq!(
            RootFs::parse("docker:///ubuntu#14.04").unwrap().image_name(),
            Some("library-ubuntu-14.04".to_string())
        );
    }
}
