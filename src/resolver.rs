//! Resolution entry points used by XML parsers.
//!
//! A [`Resolver`] combines the catalog lookups of a [`CatalogManager`] with a
//! [`ResourceFetcher`] for remote resources and, with the `cache` feature, a
//! [`ResourceCache`] of what was fetched.

use std::{fmt, sync::Arc};

#[cfg(feature = "cache")]
use crate::{cache::ResourceCache, catalog::Query};
use crate::{
    catalog::{CatalogManager, EntryKind},
    config::ResolverConfig,
    error::Result,
    resource::{FetchedResource, LocalFetcher, ResolvedResource, ResourceFetcher},
    uri::{is_absolute, resolve, split_jar},
};

/// Check if `uri` can be opened without a fetcher.
fn is_local(uri: &str) -> bool {
    uri.starts_with("file:") || split_jar(uri).is_some()
}

/// Make `href` absolute against `base`, if possible.
fn absolutize(href: &str, base: Option<&str>) -> Option<String> {
    if is_absolute(href) {
        return Some(href.to_owned());
    }
    resolve(base?, href)
}

pub struct Resolver {
    manager: CatalogManager,
    fetcher: Arc<dyn ResourceFetcher>,
    #[cfg(feature = "cache")]
    cache: ResourceCache,
}

impl Resolver {
    /// Build a resolver reading local resources only, with the cache
    /// configured in `config`.
    pub fn new(config: ResolverConfig) -> Self {
        Self::from_manager(CatalogManager::new(config))
    }

    /// Build a resolver around an existing manager.
    pub fn from_manager(manager: CatalogManager) -> Self {
        Self {
            #[cfg(feature = "cache")]
            cache: ResourceCache::new(manager.config()),
            manager,
            fetcher: Arc::new(LocalFetcher),
        }
    }

    /// Use `fetcher` for resources that are not local.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    #[cfg(feature = "cache")]
    pub fn with_cache(mut self, cache: ResourceCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn manager(&self) -> &CatalogManager {
        &self.manager
    }

    #[cfg(feature = "cache")]
    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Resolve a URI reference, such as the `href` of an `xsl:import` or
    /// `xi:include`.
    ///
    /// Returns `Ok(None)` if the resource is neither cataloged nor remote, or
    /// if it cannot be retrieved.
    pub fn resolve_uri(&self, href: &str, base: Option<&str>) -> Result<Option<ResolvedResource>> {
        let absolute = absolutize(href, base);
        let found = absolute
            .as_deref()
            .and_then(|uri| self.manager.lookup_uri(uri))
            .or_else(|| {
                (absolute.as_deref() != Some(href))
                    .then(|| self.manager.lookup_uri(href))
                    .flatten()
            });
        self.retrieve(EntryKind::Uri, found, absolute)
    }

    /// Resolve an external entity, or the external subset when `name` is
    /// `None` or `[dtd]`.
    pub fn resolve_entity(
        &self,
        name: Option<&str>,
        public_id: Option<&str>,
        system_id: Option<&str>,
        base: Option<&str>,
    ) -> Result<Option<ResolvedResource>> {
        let lookup = |system_id: Option<&str>| match (name, public_id) {
            (Some(name), _) => self.manager.lookup_entity(name, system_id, public_id),
            (None, Some(public_id)) => self.manager.lookup_public(system_id, public_id),
            (None, None) => self.manager.lookup_system(system_id?),
        };

        let absolute = system_id.and_then(|system_id| absolutize(system_id, base));
        let found = match system_id {
            Some(system_id) => lookup(Some(system_id)).or_else(|| {
                absolute
                    .as_deref()
                    .filter(|&uri| uri != system_id)
                    .and_then(|uri| lookup(Some(uri)))
            }),
            None => lookup(None),
        };
        self.retrieve(EntryKind::System, found, absolute)
    }

    /// Resolve a namespace name to a related resource, optionally of a given
    /// RDDL nature and purpose.
    pub fn resolve_namespace(
        &self,
        href: &str,
        base: Option<&str>,
        nature: Option<&str>,
        purpose: Option<&str>,
    ) -> Result<Option<ResolvedResource>> {
        let absolute = absolutize(href, base);
        let uri = absolute.as_deref().unwrap_or(href);
        let found = self.manager.lookup_namespace_uri(uri, nature, purpose);
        self.retrieve(EntryKind::Uri, found, absolute)
    }

    /// Open the catalog match `found`, or retrieve the uncataloged `absolute`
    /// if it is remote.
    fn retrieve(
        &self,
        kind: EntryKind,
        found: Option<String>,
        absolute: Option<String>,
    ) -> Result<Option<ResolvedResource>> {
        match (found, absolute) {
            (Some(uri), _) if is_local(&uri) => match ResolvedResource::open_local(&uri) {
                Ok(resource) => Ok(Some(resource)),
                Err(e) => {
                    catalog_debug!(1, "Cannot open {uri}: {e}");
                    Ok(None)
                }
            },
            (Some(uri), _) => self.remote(kind, &uri),
            (None, Some(uri)) if !is_local(&uri) => self.remote(kind, &uri),
            _ => Ok(None),
        }
    }

    fn remote(&self, kind: EntryKind, uri: &str) -> Result<Option<ResolvedResource>> {
        #[cfg(feature = "cache")]
        if self.cache.cache_uri(uri) {
            return self.through_cache(kind, uri);
        }
        #[cfg(not(feature = "cache"))]
        let _ = kind;
        Ok(self.fetch(uri).map(|fetched| {
            let resolved = if fetched.uri.is_empty() { uri } else { fetched.uri.as_str() };
            ResolvedResource::from_bytes(resolved, None, fetched.content_type, fetched.body)
        }))
    }

    fn fetch(&self, uri: &str) -> Option<FetchedResource> {
        match self.fetcher.fetch(uri) {
            Ok(fetched) if fetched.status == 200 => Some(fetched),
            Ok(fetched) => {
                catalog_debug!(1, "Fetching {uri} returned status {}", fetched.status);
                None
            }
            Err(e) => {
                catalog_debug!(1, "Fetching {uri} failed: {e}");
                None
            }
        }
    }

    /// Serve `uri` from the cache if the copy is fresh, otherwise fetch and
    /// store it.
    #[cfg(feature = "cache")]
    fn through_cache(&self, kind: EntryKind, uri: &str) -> Result<Option<ResolvedResource>> {
        let query = match kind {
            EntryKind::Uri => Query::Uri {
                uri: uri.to_owned(),
                nature: None,
                purpose: None,
            },
            _ => Query::System {
                system_id: uri.to_owned(),
            },
        };
        if let Some(local) = self.cache.lookup(&self.manager, &query) {
            if !self.cache.expired(&local, self.fetcher.as_ref())? {
                let content_type = self.cache.find(&local).and_then(|entry| entry.content_type());
                match ResolvedResource::open_local(&local) {
                    Ok(mut resource) => {
                        catalog_debug!(1, "Serving {uri} from {local}");
                        resource.resolved_uri = uri.to_owned();
                        resource.content_type = content_type.or(resource.content_type);
                        return Ok(Some(resource));
                    }
                    Err(e) => catalog_debug!(1, "Cached copy of {uri} is unreadable: {e}"),
                }
            }
        }

        let Some(fetched) = self.fetch(uri) else {
            return Ok(None);
        };
        let local = match kind {
            EntryKind::Uri => self.cache.add_uri(uri, &fetched)?,
            _ => self.cache.add_system(uri, &fetched)?,
        };
        let resolved = if fetched.uri.is_empty() { uri } else { fetched.uri.as_str() };
        Ok(Some(ResolvedResource::from_bytes(
            resolved,
            local,
            fetched.content_type,
            fetched.body,
        )))
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("catalogs", &self.manager.catalogs())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Mutex};

    use super::*;
    use crate::{
        error::CatalogError,
        resource::ProbeResponse,
        uri::{directory_to_uri, path_to_uri},
    };

    /// Answers every request with a fixed body and records the requests.
    #[derive(Default)]
    struct EchoFetcher {
        fetched: Mutex<Vec<String>>,
    }

    impl ResourceFetcher for EchoFetcher {
        fn fetch(&self, uri: &str) -> Result<FetchedResource> {
            self.fetched.lock().unwrap().push(uri.to_owned());
            if uri.contains("missing") {
                return Err(CatalogError::FetchFailed {
                    uri: uri.to_owned(),
                    status: 404,
                });
            }
            Ok(FetchedResource {
                uri: uri.to_owned(),
                status: 200,
                content_type: Some("text/plain".to_owned()),
                body: format!("body of {uri}").into_bytes(),
                ..Default::default()
            })
        }

        fn probe(&self, _uri: &str) -> Result<ProbeResponse> {
            Ok(ProbeResponse {
                status: 304,
                ..Default::default()
            })
        }
    }

    fn resolver_with(catalog: &str) -> (tempfile::TempDir, Resolver, Arc<EchoFetcher>) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("local.dtd"), "<!ELEMENT doc EMPTY>").unwrap();
        let catalog_path = dir.path().join("catalog.xml");
        fs::write(&catalog_path, catalog).unwrap();
        let config = ResolverConfig {
            catalog_files: vec![path_to_uri(&catalog_path).unwrap()],
            ..Default::default()
        };
        let fetcher = Arc::new(EchoFetcher::default());
        let resolver = Resolver::new(config).with_fetcher(fetcher.clone());
        (dir, resolver, fetcher)
    }

    const CATALOG: &str = r#"<catalog xmlns="urn:oasis:names:tc:entity:xmlns:xml:catalog"
         xmlns:tr="urn:oasis:names:tc:entity:xmlns:tr9401:catalog">
  <system systemId="http://example.org/doc.dtd" uri="local.dtd"/>
  <public publicId="-//Example//DTD Doc//EN" uri="local.dtd"/>
  <uri name="http://example.org/style.xsl" uri="http://mirror.example.org/style.xsl"/>
  <tr:entity name="chapter" uri="local.dtd"/>
</catalog>"#;

    #[test]
    fn cataloged_local_resources_are_opened() {
        let (dir, resolver, fetcher) = resolver_with(CATALOG);
        let expected = path_to_uri(&dir.path().join("local.dtd")).unwrap();

        let resource = resolver
            .resolve_entity(None, None, Some("http://example.org/doc.dtd"), None)
            .unwrap()
            .unwrap();
        assert_eq!(resource.resolved_uri, expected);
        assert_eq!(resource.local_uri.as_deref(), Some(expected.as_str()));
        assert_eq!(resource.into_bytes().unwrap(), b"<!ELEMENT doc EMPTY>");

        let resource = resolver
            .resolve_entity(None, Some("-//Example//DTD Doc//EN"), None, None)
            .unwrap()
            .unwrap();
        assert_eq!(resource.resolved_uri, expected);

        let resource = resolver
            .resolve_entity(Some("chapter"), None, None, None)
            .unwrap()
            .unwrap();
        assert_eq!(resource.resolved_uri, expected);
        assert!(fetcher.fetched.lock().unwrap().is_empty());
    }

    #[test]
    fn relative_system_identifiers_use_the_base() {
        let (_dir, resolver, _) = resolver_with(CATALOG);
        let resource = resolver
            .resolve_entity(None, None, Some("doc.dtd"), Some("http://example.org/index.xml"))
            .unwrap();
        assert!(resource.is_some_and(|resource| resource.resolved_uri.starts_with("file:")));
    }

    #[test]
    fn remote_resources_go_through_the_fetcher() {
        let (_dir, resolver, fetcher) = resolver_with(CATALOG);

        let resource = resolver
            .resolve_uri("style.xsl", Some("http://example.org/"))
            .unwrap()
            .unwrap();
        assert_eq!(resource.resolved_uri, "http://mirror.example.org/style.xsl");
        assert_eq!(resource.local_uri, None);
        assert_eq!(resource.content_type.as_deref(), Some("text/plain"));

        let resource = resolver
            .resolve_uri("http://example.org/other.xsl", None)
            .unwrap()
            .unwrap();
        assert_eq!(
            resource.into_bytes().unwrap(),
            b"body of http://example.org/other.xsl"
        );

        assert!(
            resolver
                .resolve_uri("http://example.org/missing.xsl", None)
                .unwrap()
                .is_none()
        );
        assert_eq!(fetcher.fetched.lock().unwrap().len(), 3);
    }

    #[test]
    fn uncataloged_local_resources_are_not_found() {
        let (dir, resolver, fetcher) = resolver_with(CATALOG);
        let base = directory_to_uri(dir.path()).unwrap();
        assert!(resolver.resolve_uri("local.dtd", Some(&base)).unwrap().is_none());
        assert!(resolver.resolve_uri("relative.xml", None).unwrap().is_none());
        assert!(
            resolver
                .resolve_namespace("http://example.org/ns", None, Some("n"), None)
                .unwrap()
                .is_some()
        );
        assert_eq!(fetcher.fetched.lock().unwrap().len(), 1);
    }
}
