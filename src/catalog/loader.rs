//! The default catalog loader, reading OASIS XML Catalog documents.

use std::{
    collections::HashMap,
    io::{Cursor, Read},
    sync::{
        LazyLock,
        atomic::{AtomicBool, Ordering},
    },
};

use encoding_rs::{Encoding, UTF_8};
use log::warn;
use quick_xml::{
    events::{BytesStart, Event},
    name::{Namespace, ResolveResult},
    reader::NsReader,
};
use regex::Regex;
use zip::{ZipArchive, result::ZipError};

use super::{
    CatalogLoader, EntryCatalog, EntryKind, RDDL_NAMESPACE, TR9401_NAMESPACE,
    XML_CATALOGS_NAMESPACE, XMLRESOLVER_NAMESPACE,
};
use crate::{
    config::{CatalogLoaderKind, ResolverConfig},
    error::{CatalogError, Result},
    resource::read_local,
    uri::resolve,
};

static ENCODING_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^<\?xml[^>]*?encoding\s*=\s*["']([A-Za-z0-9._-]+)["']"#)
        .expect("encoding declaration pattern is valid")
});

/// Archive members searched, in order, when a catalog file is a ZIP archive.
/// A `catalog.xml` one directory below the root is tried between the two.
const ARCHIVED_ROOT_CATALOG: &str = "catalog.xml";
const ARCHIVED_FALLBACK_CATALOG: &str = "org/xmlresolver/catalog.xml";

/// Decode a catalog document to text.
///
/// A byte order mark wins over the encoding declaration; without either the
/// document is read as UTF-8.
fn decode(bytes: &[u8]) -> String {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        return encoding
            .decode_without_bom_handling(&bytes[bom_len..])
            .0
            .into_owned();
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(256)]);
    let encoding = ENCODING_DECL
        .captures(&head)
        .and_then(|caps| Encoding::for_label(caps[1].as_bytes()))
        .unwrap_or(UTF_8);
    encoding.decode_without_bom_handling(bytes).0.into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementNamespace {
    Catalog,
    Tr9401,
    Other,
}

impl From<ResolveResult<'_>> for ElementNamespace {
    fn from(ns: ResolveResult<'_>) -> Self {
        match ns {
            ResolveResult::Bound(Namespace(ns)) if ns == XML_CATALOGS_NAMESPACE.as_bytes() => {
                Self::Catalog
            }
            ResolveResult::Bound(Namespace(ns)) if ns == TR9401_NAMESPACE.as_bytes() => Self::Tr9401,
            _ => Self::Other,
        }
    }
}

/// The scope established by an open element.
struct Frame {
    base: String,
    prefer_public: bool,
    /// Set for elements whose content is ignored.
    skip: bool,
}

/// The attributes of one catalog element, sorted by namespace.
#[derive(Default)]
struct Attributes {
    plain: HashMap<String, String>,
    rddl: HashMap<String, String>,
    properties: Vec<(String, String)>,
    xml_base: Option<String>,
}

impl Attributes {
    fn get(&self, name: &str) -> Option<&str> {
        self.plain.get(name).map(String::as_str)
    }

    /// `nature` and `purpose` may be given with or without the RDDL namespace.
    fn rddl(&self, name: &str) -> Option<&str> {
        self.get(name)
            .or_else(|| self.rddl.get(name).map(String::as_str))
    }
}

/// Loads OASIS XML Catalogs (and the TR9401 extension elements) from
/// `file:` and `jar:file:` URIs.
#[derive(Debug)]
pub struct XmlCatalogLoader {
    prefer_public: AtomicBool,
    archived_catalogs: AtomicBool,
    strict: bool,
}

impl XmlCatalogLoader {
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            prefer_public: AtomicBool::new(config.prefer_public),
            archived_catalogs: AtomicBool::new(config.archived_catalogs),
            strict: config.catalog_loader == CatalogLoaderKind::Strict,
        }
    }

    fn empty(&self, uri: &str) -> EntryCatalog {
        EntryCatalog::new(uri, uri, self.prefer_public())
    }

    /// Parse `bytes` as the catalog document at `uri`.
    ///
    /// Unlike [`CatalogLoader::load_catalog_from`], problems are reported as
    /// errors instead of an empty catalog.
    pub fn parse(&self, uri: &str, bytes: &[u8]) -> Result<EntryCatalog> {
        self.parse_with_base(uri, uri, bytes)
    }

    fn parse_with_base(&self, uri: &str, base: &str, bytes: &[u8]) -> Result<EntryCatalog> {
        let text = decode(bytes);
        let mut reader = NsReader::from_str(&text);
        reader.config_mut().trim_text(true);

        let xml_error = |source: quick_xml::Error| CatalogError::Xml {
            uri: uri.to_owned(),
            source,
        };

        let mut catalog: Option<EntryCatalog> = None;
        let mut frames: Vec<Frame> = vec![];
        loop {
            let (ns, event) = reader.read_resolved_event().map_err(xml_error)?;
            let ns = ElementNamespace::from(ns);
            let (start, empty) = match event {
                Event::Start(start) => (start, false),
                Event::Empty(start) => (start, true),
                Event::End(_) => {
                    frames.pop();
                    continue;
                }
                Event::Eof => break,
                _ => continue,
            };
            let attrs = read_attributes(&reader, &start).map_err(xml_error)?;

            if catalog.is_none() {
                if ns != ElementNamespace::Catalog || start.local_name().as_ref() != b"catalog" {
                    return Err(CatalogError::NotCatalog(uri.to_owned()));
                }
                let frame = self.scope(uri, base, self.prefer_public(), &attrs);
                catalog = Some(EntryCatalog::new(uri, frame.base.as_str(), frame.prefer_public));
                frames.push(frame);
            } else if let (Some(catalog), Some(parent)) = (&catalog, frames.last()) {
                let frame = if parent.skip {
                    Frame {
                        base: parent.base.clone(),
                        prefer_public: parent.prefer_public,
                        skip: true,
                    }
                } else {
                    let frame = self.scope(uri, &parent.base, parent.prefer_public, &attrs);
                    self.add_entry(catalog, ns, &start, &attrs, frame)
                };
                frames.push(frame);
            }
            if empty {
                frames.pop();
            }
        }
        catalog.ok_or_else(|| CatalogError::NotCatalog(uri.to_owned()))
    }

    /// Compute the base URI and `prefer` setting of an element.
    fn scope(&self, uri: &str, parent_base: &str, parent_prefer: bool, attrs: &Attributes) -> Frame {
        let base = match attrs.xml_base.as_deref() {
            Some(xml_base) => resolve(parent_base, xml_base).unwrap_or_else(|| {
                warn!("{uri}: cannot resolve xml:base '{xml_base}' against '{parent_base}'");
                parent_base.to_owned()
            }),
            None => parent_base.to_owned(),
        };
        let prefer_public = match attrs.get("prefer") {
            Some("public") => true,
            Some("system") => false,
            Some(other) => {
                warn!("{uri}: invalid prefer value '{other}'");
                parent_prefer
            }
            None => parent_prefer,
        };
        Frame {
            base,
            prefer_public,
            skip: false,
        }
    }

    /// Add the entry for one element below the root. Returns the scope its
    /// children are read in.
    fn add_entry(
        &self,
        catalog: &EntryCatalog,
        ns: ElementNamespace,
        start: &BytesStart,
        attrs: &Attributes,
        mut frame: Frame,
    ) -> Frame {
        let local_name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let kind = match (ns, EntryKind::from_element_name(&local_name)) {
            (ElementNamespace::Catalog, Some(kind)) if !kind.is_tr9401() => kind,
            (ElementNamespace::Tr9401, Some(kind)) if kind.is_tr9401() => kind,
            (ElementNamespace::Other, _) => {
                frame.skip = true;
                return frame;
            }
            _ => {
                if self.strict {
                    warn!("{}: unexpected element '{local_name}'", catalog.uri());
                } else {
                    catalog_debug!(1, "{}: skipping element '{local_name}'", catalog.uri());
                }
                frame.skip = true;
                return frame;
            }
        };

        let base = frame.base.as_str();
        let id = attrs.get("id");
        let prefer = frame.prefer_public;
        let entry = match kind {
            EntryKind::Group => catalog.add_group(base, id, prefer),
            EntryKind::Public => catalog.add_public(base, id, attrs.get("publicId"), attrs.get("uri"), prefer),
            EntryKind::System => catalog.add_system(base, id, attrs.get("systemId"), attrs.get("uri")),
            EntryKind::RewriteSystem => catalog.add_rewrite_system(
                base,
                id,
                attrs.get("systemIdStartString"),
                attrs.get("rewritePrefix"),
            ),
            EntryKind::SystemSuffix => {
                catalog.add_system_suffix(base, id, attrs.get("systemIdSuffix"), attrs.get("uri"))
            }
            EntryKind::DelegatePublic => catalog.add_delegate_public(
                base,
                id,
                attrs.get("publicIdStartString"),
                attrs.get("catalog"),
                prefer,
            ),
            EntryKind::DelegateSystem => catalog.add_delegate_system(
                base,
                id,
                attrs.get("systemIdStartString"),
                attrs.get("catalog"),
            ),
            EntryKind::Uri => catalog.add_uri(
                base,
                id,
                attrs.get("name"),
                attrs.get("uri"),
                attrs.rddl("nature"),
                attrs.rddl("purpose"),
            ),
            EntryKind::RewriteUri => catalog.add_rewrite_uri(
                base,
                id,
                attrs.get("uriStartString"),
                attrs.get("rewritePrefix"),
            ),
            EntryKind::UriSuffix => {
                catalog.add_uri_suffix(base, id, attrs.get("uriSuffix"), attrs.get("uri"))
            }
            EntryKind::DelegateUri => catalog.add_delegate_uri(
                base,
                id,
                attrs.get("uriStartString"),
                attrs.get("catalog"),
            ),
            EntryKind::NextCatalog => catalog.add_next_catalog(base, id, attrs.get("catalog")),
            EntryKind::Doctype => catalog.add_doctype(base, id, attrs.get("name"), attrs.get("uri")),
            EntryKind::Document => catalog.add_document(base, id, attrs.get("uri")),
            EntryKind::DtdDecl => catalog.add_dtd_decl(base, id, attrs.get("publicId"), attrs.get("uri")),
            EntryKind::Entity => catalog.add_entity(base, id, attrs.get("name"), attrs.get("uri")),
            EntryKind::Linktype => catalog.add_linktype(base, id, attrs.get("name"), attrs.get("uri")),
            EntryKind::Notation => catalog.add_notation(base, id, attrs.get("name"), attrs.get("uri")),
            EntryKind::SgmlDecl => catalog.add_sgml_decl(base, id, attrs.get("uri")),
            EntryKind::Null => None,
        };

        if let Some(entry) = entry {
            for (name, value) in &attrs.properties {
                entry.set_property(name, value);
            }
        }
        // Only groups have catalog entries as children.
        frame.skip = kind != EntryKind::Group;
        frame
    }

    /// Search a ZIP archive for its catalog. Entries resolve against the
    /// `jar:` URI of the archive member.
    fn load_archived(&self, uri: &str, bytes: &[u8]) -> Result<EntryCatalog> {
        let archive_error = |source: ZipError| CatalogError::Archive {
            uri: uri.to_owned(),
            source,
        };
        let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(archive_error)?;

        let mut one_deep = archive
            .file_names()
            .filter(|name| {
                name.split_once('/')
                    .is_some_and(|(dir, rest)| !dir.is_empty() && rest == ARCHIVED_ROOT_CATALOG)
            })
            .map(str::to_owned)
            .collect::<Vec<_>>();
        one_deep.sort();
        let member = std::iter::once(ARCHIVED_ROOT_CATALOG.to_owned())
            .chain(one_deep)
            .chain(std::iter::once(ARCHIVED_FALLBACK_CATALOG.to_owned()))
            .find(|name| archive.index_for_name(name).is_some())
            .ok_or_else(|| CatalogError::NotCatalog(uri.to_owned()))?;

        let mut content = vec![];
        archive
            .by_name(&member)
            .map_err(archive_error)?
            .read_to_end(&mut content)
            .map_err(|e| archive_error(ZipError::Io(e)))?;
        catalog_debug!(1, "Using {member} from archive {uri}");
        self.parse_with_base(uri, &format!("jar:{uri}!/{member}"), &content)
    }
}

fn read_attributes(reader: &NsReader<&[u8]>, start: &BytesStart) -> quick_xml::Result<Attributes> {
    let mut attrs = Attributes::default();
    for attr in start.attributes() {
        let attr = attr?;
        let key = attr.key.as_ref();
        if key == b"xmlns" || key.starts_with(b"xmlns:") {
            continue;
        }
        let value = attr.unescape_value()?.into_owned();
        if key == b"xml:base" {
            attrs.xml_base = Some(value);
            continue;
        }
        let (ns, local) = reader.resolve_attribute(attr.key);
        let local = String::from_utf8_lossy(local.as_ref()).into_owned();
        match ns {
            ResolveResult::Unbound => {
                attrs.plain.insert(local, value);
            }
            ResolveResult::Bound(Namespace(ns)) if ns == XMLRESOLVER_NAMESPACE.as_bytes() => {
                attrs.properties.push((local, value));
            }
            ResolveResult::Bound(Namespace(ns)) if ns == RDDL_NAMESPACE.as_bytes() => {
                attrs.rddl.insert(local, value);
            }
            _ => {}
        }
    }
    Ok(attrs)
}

impl CatalogLoader for XmlCatalogLoader {
    fn load_catalog(&self, uri: &str) -> EntryCatalog {
        match read_local(uri) {
            Ok(bytes) => self.load_catalog_from(uri, &bytes),
            Err(e) => {
                warn!("Failed to read catalog {uri}: {e}");
                self.empty(uri)
            }
        }
    }

    fn load_catalog_from(&self, uri: &str, bytes: &[u8]) -> EntryCatalog {
        let result = if bytes.starts_with(b"PK\x03\x04") {
            if !self.archived_catalogs() {
                warn!("{uri} is an archive, and archived catalogs are disabled");
                return self.empty(uri);
            }
            self.load_archived(uri, bytes)
        } else {
            self.parse(uri, bytes)
        };
        result.unwrap_or_else(|e| {
            warn!("{e}");
            self.empty(uri)
        })
    }

    fn prefer_public(&self) -> bool {
        self.prefer_public.load(Ordering::Relaxed)
    }

    fn set_prefer_public(&self, prefer_public: bool) {
        self.prefer_public.store(prefer_public, Ordering::Relaxed);
    }

    fn archived_catalogs(&self) -> bool {
        self.archived_catalogs.load(Ordering::Relaxed)
    }

    fn set_archived_catalogs(&self, archived: bool) {
        self.archived_catalogs.store(archived, Ordering::Relaxed);
    }
}
