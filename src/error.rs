//! Error types shared by the catalog engine, the loaders and the resource cache.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors reported while building catalog entries, loading catalogs or
/// mutating the resource cache.
///
/// "Not found" is never an error: lookups report it with `None`.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Entries must be built against an absolute base URI.
    #[error("base URI '{0}' is not absolute")]
    RelativeBaseUri(String),

    /// `uri` could not be made absolute against `base`.
    #[error("cannot resolve '{uri}' against '{base}'")]
    UnresolvableUri { uri: String, base: String },

    /// A required attribute of a catalog entry is absent.
    #[error("{element} entry lacks '{attribute}'")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    /// The document parsed, but its root is not an XML Catalog.
    #[error("file {0} is not an XML Catalog")]
    NotCatalog(String),

    /// The catalog document is not well-formed.
    #[error("failed to parse catalog {uri}: {source}")]
    Xml {
        uri: String,
        #[source]
        source: quick_xml::Error,
    },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read archive {uri}: {source}")]
    Archive {
        uri: String,
        #[source]
        source: zip::result::ZipError,
    },

    /// The cache directory lock stayed busy for the whole retry budget.
    #[error("failed to lock '{}' after {attempts} attempts", path.display())]
    LockTimeout { path: PathBuf, attempts: u32 },

    /// No local access method exists for the URI.
    #[error("unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    #[error("fetching {uri} failed with status {status}")]
    FetchFailed { uri: String, status: u16 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CatalogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
