//! Cached resources and the entry files describing them.
//!
//! Each entry file is a one-entry catalog: a `uri`, `system` or `public`
//! element mapping the logical identifier to the cached copy, with the
//! bookkeeping stored as `http://xmlresolver.org/ns/catalog` attributes.

use std::{fs, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use quick_xml::{
    Writer,
    events::{BytesDecl, BytesEnd, BytesStart, Event},
};

use crate::{
    catalog::{Entry, EntryData, EntryKind, XML_CATALOGS_NAMESPACE, XMLRESOLVER_NAMESPACE},
    uri::uri_to_path,
};

pub const PROP_ETAG: &str = "etag";
pub const PROP_CONTENT_TYPE: &str = "contentType";
/// Fetch time, in milliseconds since the epoch.
pub const PROP_TIME: &str = "time";
pub const PROP_FILE_SIZE: &str = "filesize";
/// Modification time of the cached copy, in milliseconds since the epoch.
pub const PROP_FILE_MODIFIED: &str = "filemodified";
/// The URI the resource was actually fetched from, after redirects.
pub const PROP_REDIR: &str = "redir";

/// A resource stored in the cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The catalog entry mapping `logical_uri` to the cached copy.
    pub entry: Arc<Entry>,
    /// The identifier the resource was requested under.
    pub logical_uri: String,
    pub local_path: PathBuf,
    pub entry_file: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub expired: bool,
}

impl CacheEntry {
    /// Interpret the entry read from `entry_file`.
    ///
    /// Returns `None` for entries that do not describe a cached resource.
    pub fn from_entry(entry: Arc<Entry>, entry_file: PathBuf) -> Option<Self> {
        let logical_uri = match entry.data() {
            EntryData::Uri { name, .. } => name,
            EntryData::System { system_id, .. } => system_id,
            EntryData::Public { public_id, .. } => public_id,
            _ => return None,
        }
        .clone();
        let local_path = uri_to_path(entry.target_uri()?)?;
        let timestamp = entry
            .property(PROP_TIME)
            .and_then(|time| time.parse().ok())
            .and_then(DateTime::from_timestamp_millis)
            .or_else(|| {
                let modified = fs::metadata(&entry_file).ok()?.modified().ok()?;
                Some(DateTime::<Utc>::from(modified))
            })?;
        Some(Self {
            entry,
            logical_uri,
            local_path,
            entry_file,
            timestamp,
            expired: false,
        })
    }

    pub fn kind(&self) -> EntryKind {
        self.entry.kind()
    }

    /// The `file:` URI of the cached copy.
    pub fn local_uri(&self) -> &str {
        self.entry.target_uri().unwrap_or_default()
    }

    /// The URI to revalidate against: the redirect target if there was one.
    pub fn source_uri(&self) -> String {
        self.entry
            .property(PROP_REDIR)
            .unwrap_or_else(|| self.logical_uri.clone())
    }

    pub fn etag(&self) -> Option<String> {
        self.entry.property(PROP_ETAG)
    }

    pub fn content_type(&self) -> Option<String> {
        self.entry.property(PROP_CONTENT_TYPE)
    }

    pub fn file_size(&self) -> u64 {
        self.entry
            .property(PROP_FILE_SIZE)
            .and_then(|size| size.parse().ok())
            .or_else(|| fs::metadata(&self.local_path).ok().map(|meta| meta.len()))
            .unwrap_or(0)
    }
}

/// What is recorded about a resource when it is stored.
#[derive(Debug)]
pub(crate) struct EntryRecord<'a> {
    pub kind: EntryKind,
    pub logical_uri: &'a str,
    pub local_uri: &'a str,
    pub etag: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub time: DateTime<Utc>,
    pub file_size: u64,
    pub file_modified: Option<DateTime<Utc>>,
    pub redir: Option<&'a str>,
}

/// Serialize `record` as a one-entry catalog.
pub(crate) fn entry_document(record: &EntryRecord) -> anyhow::Result<Vec<u8>> {
    let key = match record.kind {
        EntryKind::Uri => "name",
        EntryKind::System => "systemId",
        EntryKind::Public => "publicId",
        other => anyhow::bail!("cannot cache {} entries", other.element_name()),
    };

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    let mut root = BytesStart::new("catalog");
    root.push_attribute(("xmlns", XML_CATALOGS_NAMESPACE));
    root.push_attribute(("xmlns:r", XMLRESOLVER_NAMESPACE));
    writer.write_event(Event::Start(root))?;

    let mut elem = BytesStart::new(record.kind.element_name());
    elem.push_attribute((key, record.logical_uri));
    elem.push_attribute(("uri", record.local_uri));
    let time = record.time.timestamp_millis().to_string();
    let file_size = record.file_size.to_string();
    let file_modified = record
        .file_modified
        .map(|modified| modified.timestamp_millis().to_string());
    let properties = [
        (PROP_ETAG, record.etag),
        (PROP_CONTENT_TYPE, record.content_type),
        (PROP_TIME, Some(time.as_str())),
        (PROP_FILE_SIZE, Some(file_size.as_str())),
        (PROP_FILE_MODIFIED, file_modified.as_deref()),
        (PROP_REDIR, record.redir),
    ];
    for (name, value) in properties {
        if let Some(value) = value {
            elem.push_attribute((format!("r:{name}").as_str(), value));
        }
    }
    writer.write_event(Event::Empty(elem))?;
    writer.write_event(Event::End(BytesEnd::new("catalog")))?;
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{catalog::XmlCatalogLoader, config::ResolverConfig};

    #[test]
    fn entry_file_is_a_catalog() {
        let time = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let record = EntryRecord {
            kind: EntryKind::Uri,
            logical_uri: "http://example.org/a.xsd",
            local_uri: "file:///cache/data/0123.xsd",
            etag: Some("\"abc\""),
            content_type: Some("application/xml"),
            time,
            file_size: 42,
            file_modified: None,
            redir: Some("https://example.org/a.xsd"),
        };
        let doc = entry_document(&record).unwrap();
        let catalog = XmlCatalogLoader::new(&ResolverConfig::default())
            .parse("file:///cache/entry/0123.xml", &doc)
            .unwrap();
        let entry = catalog.entries().into_iter().next().unwrap();
        let cached = CacheEntry::from_entry(entry, "/cache/entry/0123.xml".into()).unwrap();

        assert_eq!(cached.logical_uri, "http://example.org/a.xsd");
        assert_eq!(cached.local_path, PathBuf::from("/cache/data/0123.xsd"));
        assert_eq!(cached.timestamp, time);
        assert_eq!(cached.etag().as_deref(), Some("\"abc\""));
        assert_eq!(cached.file_size(), 42);
        assert_eq!(cached.source_uri(), "https://example.org/a.xsd");
        assert!(!cached.expired);
    }

    #[test]
    fn only_resource_entries_are_cached() {
        let record = EntryRecord {
            kind: EntryKind::NextCatalog,
            logical_uri: "x",
            local_uri: "file:///x",
            etag: None,
            content_type: None,
            time: Utc::now(),
            file_size: 0,
            file_modified: None,
            redir: None,
        };
        assert!(entry_document(&record).is_err());
    }
}
