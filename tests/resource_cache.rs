//! The on-disk resource cache, driven directly and through a [`Resolver`].

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use xmlresolver::{
    CatalogError, Resolver, ResolverConfig, ResourceFetcher,
    cache::{CacheInfo, DirectoryLock, EXPIRED_DIR, ResourceCache},
    resource::{FetchedResource, ProbeResponse},
};

/// A fake web server: every resource exists, with the current ETag.
#[derive(Default)]
struct FakeServer {
    etag: Mutex<Option<String>>,
    fetches: Mutex<Vec<String>>,
    probes: Mutex<Vec<String>>,
}

impl FakeServer {
    fn with_etag(etag: &str) -> Self {
        let server = Self::default();
        server.set_etag(etag);
        server
    }

    fn set_etag(&self, etag: &str) {
        *self.etag.lock().unwrap() = Some(etag.to_owned());
    }

    fn fetches(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }
}

impl ResourceFetcher for FakeServer {
    fn fetch(&self, uri: &str) -> xmlresolver::Result<FetchedResource> {
        self.fetches.lock().unwrap().push(uri.to_owned());
        if uri.contains("gone") {
            return Ok(FetchedResource {
                uri: uri.to_owned(),
                status: 404,
                ..Default::default()
            });
        }
        Ok(FetchedResource {
            uri: uri.to_owned(),
            status: 200,
            content_type: Some("application/xml".to_owned()),
            etag: self.etag.lock().unwrap().clone(),
            body: format!("<doc src='{uri}'/>").into_bytes(),
            ..Default::default()
        })
    }

    fn probe(&self, uri: &str) -> xmlresolver::Result<ProbeResponse> {
        self.probes.lock().unwrap().push(uri.to_owned());
        Ok(ProbeResponse {
            status: 200,
            etag: self.etag.lock().unwrap().clone(),
            ..Default::default()
        })
    }
}

fn store(cache: &ResourceCache, server: &FakeServer, uri: &str) -> String {
    let fetched = server.fetch(uri).unwrap();
    cache.add_uri(uri, &fetched).unwrap().unwrap()
}

fn file_count(dir: &Path) -> usize {
    fs::read_dir(dir).unwrap().count()
}

#[test]
fn etag_decides_freshness() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ResourceCache::open(dir.path()).unwrap();
    let server = FakeServer::with_etag("\"abc\"");

    let local = store(&cache, &server, "http://example.org/a.xml");
    assert!(local.starts_with("file:"));
    assert!(local.ends_with(".xml"));
    assert!(!cache.expired(&local, &server).unwrap());

    server.set_etag("\"def\"");
    assert!(cache.expired(&local, &server).unwrap());

    let offline = ResourceCache::open(dir.path()).unwrap().with_offline(true);
    assert!(!offline.expired(&local, &server).unwrap());
    assert!(cache.expired("file:///not/in/the/cache.xml", &server).unwrap());
}

#[test]
fn eviction_keeps_the_oldest_matching_entries() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ResourceCache::open(dir.path()).unwrap();
    let server = FakeServer::default();

    let uris = (0..5)
        .map(|i| format!("http://x.org/r{i}.xml"))
        .collect::<Vec<_>>();
    for uri in &uris {
        store(&cache, &server, uri);
        thread::sleep(Duration::from_millis(5));
    }
    let other = store(&cache, &server, "http://y.org/other.xml");

    let mut info = CacheInfo::rule(r"^http://x\.org/", true).unwrap();
    info.cache_size = 2;
    cache.flush_cache(&info).unwrap();

    let live = cache
        .entries()
        .into_iter()
        .filter(|entry| !entry.expired)
        .map(|entry| entry.logical_uri)
        .collect::<Vec<_>>();
    assert_eq!(live, [uris[0].as_str(), uris[1].as_str(), "http://y.org/other.xml"]);
    assert!(cache.find(&other).is_some());
    assert_eq!(cache.entries().len(), 3);
    assert_eq!(file_count(&dir.path().join(EXPIRED_DIR)), 6);

    let reopened = ResourceCache::open(dir.path()).unwrap();
    assert_eq!(reopened.entries().len(), 3);
}

#[test]
fn cache_rules_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ResourceCache::open(dir.path()).unwrap();
    assert!(cache.cache_uri("http://example.org/a.xml"));
    assert!(!cache.cache_uri("file:///etc/xml/catalog"));

    let server = FakeServer::default();
    let local = store(&cache, &server, "http://private.example.org/a.xml");
    let sibling = store(&cache, &server, "http://private.example.org/z.xml");
    let public = store(&cache, &server, "http://public.example.org/a.xml");

    cache
        .add_cache_info(CacheInfo::rule(r"^http://private\.", false).unwrap())
        .unwrap();
    assert!(!cache.cache_uri("http://private.example.org/b.xml"));
    assert!(cache.expired(&local, &server).unwrap());
    assert!(cache.find(&local).is_none());
    // Every entry under the rule goes, not only the one asked about.
    assert!(cache.find(&sibling).is_none());
    assert!(cache.find(&public).is_some());
    assert_eq!(cache.entries().len(), 1);
    assert_eq!(server.probes.lock().unwrap().len(), 0);

    let fetched = server.fetch("http://private.example.org/b.xml").unwrap();
    assert_eq!(
        cache
            .add_uri("http://private.example.org/b.xml", &fetched)
            .unwrap(),
        None
    );

    let reopened = ResourceCache::open(dir.path()).unwrap();
    assert!(!reopened.cache_uri("http://private.example.org/c.xml"));
    assert!(reopened.cache_uri("http://public.example.org/c.xml"));
}

#[test]
fn entries_added_elsewhere_appear_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let first = ResourceCache::open(dir.path()).unwrap();
    let second = ResourceCache::open(dir.path()).unwrap();
    let server = FakeServer::default();

    let local = store(&first, &server, "http://example.org/shared.xml");
    assert!(second.find(&local).is_none());
    second.reload().unwrap();
    let entry = second.find("http://example.org/shared.xml").unwrap();
    assert_eq!(entry.local_uri(), local);
    assert_eq!(entry.content_type().as_deref(), Some("application/xml"));
}

#[test]
fn a_held_lock_fails_cache_updates() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ResourceCache::open(dir.path()).unwrap();
    let server = FakeServer::default();
    let fetched = server.fetch("http://example.org/a.xml").unwrap();

    let lock = DirectoryLock::acquire(dir.path()).unwrap();
    let err = cache
        .add_uri("http://example.org/a.xml", &fetched)
        .unwrap_err();
    assert!(matches!(err, CatalogError::LockTimeout { .. }), "{err}");

    drop(lock);
    assert!(
        cache
            .add_uri("http://example.org/a.xml", &fetched)
            .unwrap()
            .is_some()
    );
}

#[test]
fn resolver_serves_fresh_copies_from_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = ResolverConfig {
        catalog_files: vec![],
        cache_directory: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let server = Arc::new(FakeServer::with_etag("\"v1\""));
    let resolver = Resolver::new(config).with_fetcher(server.clone());
    assert!(resolver.cache().is_enabled());

    let uri = "http://example.org/schema.xsd";
    let first = resolver.resolve_uri(uri, None).unwrap().unwrap();
    let local = first.local_uri.clone().unwrap();
    assert_eq!(first.resolved_uri, uri);
    assert_eq!(first.into_bytes().unwrap(), format!("<doc src='{uri}'/>").as_bytes());

    let second = resolver.resolve_uri(uri, None).unwrap().unwrap();
    assert_eq!(second.resolved_uri, uri);
    assert_eq!(second.local_uri.as_deref(), Some(local.as_str()));
    assert_eq!(second.content_type.as_deref(), Some("application/xml"));
    assert_eq!(server.fetches(), 1);

    server.set_etag("\"v2\"");
    resolver.resolve_uri(uri, None).unwrap().unwrap();
    assert_eq!(server.fetches(), 2);

    assert!(
        resolver
            .resolve_uri("http://example.org/gone.xsd", None)
            .unwrap()
            .is_none()
    );
}
