//! Access to resources: the fetcher interface used for remote resources, the
//! local fetcher for `file:` and `jar:file:` URIs, and the descriptor handed
//! back to callers.

use std::{
    fmt,
    fs::{self, File},
    io::{BufReader, Cursor, Read},
    path::Path,
};

use chrono::{DateTime, Utc};
use zip::ZipArchive;

use crate::{
    error::{CatalogError, Result},
    uri::{split_jar, uri_to_path},
};

/// The response to a GET of a resource.
#[derive(Debug, Clone, Default)]
pub struct FetchedResource {
    /// The final URI, after redirects.
    pub uri: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    /// The raw `Last-Modified` header.
    pub last_modified: Option<String>,
    /// The raw `Date` header.
    pub date: Option<String>,
    pub body: Vec<u8>,
}

/// The response to a HEAD of a resource.
#[derive(Debug, Clone, Default)]
pub struct ProbeResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub date: Option<String>,
}

/// Retrieves resources. Implementations own redirects and timeouts.
pub trait ResourceFetcher: Send + Sync {
    fn fetch(&self, uri: &str) -> Result<FetchedResource>;
    fn probe(&self, uri: &str) -> Result<ProbeResponse>;
}

/// Serves `file:` URIs and members of ZIP archives named with
/// `jar:file:...!/member`. Everything else is `UnsupportedScheme`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFetcher;

fn modified(path: &Path) -> Option<String> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified).to_rfc2822())
}

impl ResourceFetcher for LocalFetcher {
    fn fetch(&self, uri: &str) -> Result<FetchedResource> {
        let body = read_local(uri)?;
        Ok(FetchedResource {
            uri: uri.to_owned(),
            status: 200,
            content_type: guess_content_type(uri).map(str::to_owned),
            etag: None,
            last_modified: uri_to_path(uri).as_deref().and_then(modified),
            date: Some(Utc::now().to_rfc2822()),
            body,
        })
    }

    fn probe(&self, uri: &str) -> Result<ProbeResponse> {
        let last_modified = match (split_jar(uri), uri_to_path(uri)) {
            (Some(_), _) => None,
            (None, Some(path)) => Some(modified(&path).ok_or_else(|| {
                CatalogError::FetchFailed {
                    uri: uri.to_owned(),
                    status: 404,
                }
            })?),
            (None, None) => return Err(CatalogError::UnsupportedScheme(uri.to_owned())),
        };
        Ok(ProbeResponse {
            status: 200,
            etag: None,
            last_modified,
            date: Some(Utc::now().to_rfc2822()),
        })
    }
}

/// Read the whole resource at a `file:` or `jar:file:` URI.
pub fn read_local(uri: &str) -> Result<Vec<u8>> {
    if let Some((archive_uri, member)) = split_jar(uri) {
        let path = uri_to_path(archive_uri)
            .ok_or_else(|| CatalogError::UnsupportedScheme(uri.to_owned()))?;
        let file = File::open(&path).map_err(|e| CatalogError::io(&path, e))?;
        let archive_error = |source| CatalogError::Archive {
            uri: uri.to_owned(),
            source,
        };
        let mut archive = ZipArchive::new(BufReader::new(file)).map_err(archive_error)?;
        let mut member = archive.by_name(member).map_err(archive_error)?;
        let mut buf = vec![];
        member
            .read_to_end(&mut buf)
            .map_err(|e| CatalogError::io(&path, e))?;
        return Ok(buf);
    }
    let path = uri_to_path(uri).ok_or_else(|| CatalogError::UnsupportedScheme(uri.to_owned()))?;
    fs::read(&path).map_err(|e| CatalogError::io(&path, e))
}

/// Guess the media type of a resource from the extension of its URI.
pub fn guess_content_type(uri: &str) -> Option<&'static str> {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let ext = path.rsplit_once('.')?.1;
    let content_type = match ext.to_ascii_lowercase().as_str() {
        "xml" | "xsd" | "xsl" | "xslt" | "rng" | "sch" | "wsdl" => "application/xml",
        "dtd" | "ent" | "mod" => "application/xml-dtd",
        "rnc" | "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "xhtml" => "application/xhtml+xml",
        "json" => "application/json",
        _ => return None,
    };
    Some(content_type)
}

/// A resolved resource, ready to be read.
pub struct ResolvedResource {
    /// The URI the caller should treat as the resource's location.
    pub resolved_uri: String,
    /// Where the bytes actually come from, when that is a local copy.
    pub local_uri: Option<String>,
    pub content_type: Option<String>,
    pub stream: Box<dyn Read + Send>,
}

impl ResolvedResource {
    /// Open a `file:` or `jar:file:` URI.
    pub fn open_local(resolved_uri: &str) -> Result<Self> {
        let stream: Box<dyn Read + Send> = match (split_jar(resolved_uri), uri_to_path(resolved_uri)) {
            (None, Some(path)) => Box::new(BufReader::new(
                File::open(&path).map_err(|e| CatalogError::io(&path, e))?,
            )),
            _ => Box::new(Cursor::new(read_local(resolved_uri)?)),
        };
        Ok(Self {
            resolved_uri: resolved_uri.to_owned(),
            local_uri: Some(resolved_uri.to_owned()),
            content_type: guess_content_type(resolved_uri).map(str::to_owned),
            stream,
        })
    }

    pub fn from_bytes(
        resolved_uri: impl Into<String>,
        local_uri: Option<String>,
        content_type: Option<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            resolved_uri: resolved_uri.into(),
            local_uri,
            content_type,
            stream: Box::new(Cursor::new(bytes)),
        }
    }

    /// Read the remaining content of the stream.
    pub fn into_bytes(mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![];
        self.stream.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl fmt::Debug for ResolvedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedResource")
            .field("resolved_uri", &self.resolved_uri)
            .field("local_uri", &self.local_uri)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}
