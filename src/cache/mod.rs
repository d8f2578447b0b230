//! Provide an on-disk cache of fetched resources.
//!
//! Layout of a cache directory:
//!
//! ```text
//! <cache>/control.xml        caching policies
//! <cache>/entry/<sha>.xml    one-entry catalogs describing cached resources
//! <cache>/data/<sha><ext>    the cached bytes
//! <cache>/expired/           evicted files, deleted after the delete-wait
//! <cache>/.lock              held while the directory is modified
//! ```
//!
//! `<sha>` is the lowercase hexadecimal SHA-256 of the logical URI. Several
//! processes may share one directory; every modification happens under the
//! [`DirectoryLock`].

pub mod control;
pub mod entry;
pub mod lock;

use std::{
    fs::{self, File},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use log::warn;
use sha2::{Digest, Sha256};

pub use control::{CacheControl, CacheInfo, CONTROL_FILE};
pub use entry::CacheEntry;
pub use lock::DirectoryLock;

use self::entry::{EntryRecord, entry_document};
use crate::{
    catalog::{CatalogManager, EntryCatalog, EntryKind, Query, XmlCatalogLoader},
    config::ResolverConfig,
    error::{CatalogError, Result},
    resource::{FetchedResource, ProbeResponse, ResourceFetcher},
    uri::{directory_to_uri, path_to_uri},
};

pub const ENTRY_DIR: &str = "entry";
pub const DATA_DIR: &str = "data";
pub const EXPIRED_DIR: &str = "expired";

/// The cache file name of `uri`, without extension.
pub fn cache_key(uri: &str) -> String {
    Sha256::digest(uri.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// The extension of the cached copy: taken from the last path segment of
/// `uri` when it is short, otherwise derived from the content type.
pub fn cache_extension(uri: &str, content_type: Option<&str>) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let segment = path.rsplit('/').next().unwrap_or(path);
    if let Some(pos) = segment.rfind('.') {
        let ext = &segment[pos..];
        if (2..=5).contains(&ext.len()) && ext[1..].bytes().all(|c| c.is_ascii_alphanumeric()) {
            return ext.to_owned();
        }
    }
    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    let ext = if content_type.contains("dtd") {
        ".dtd"
    } else if content_type.contains("html") {
        ".html"
    } else if content_type.contains("xml") {
        ".xml"
    } else if content_type.starts_with("text/") {
        ".txt"
    } else {
        ".bin"
    };
    ext.to_owned()
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// Write `bytes` to `path` through a temporary file, so that readers never
/// see a partial file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("{:08x}.tmp", rand::random::<u32>()));
    fs::write(&tmp, bytes).map_err(|e| CatalogError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        CatalogError::io(path, e)
    })
}

/// Check the cached copy against a probe of its source.
///
/// A different ETag or a newer modification time make the copy stale. With
/// neither signal, the copy is stale once older than `max_age`.
fn is_stale(entry: &CacheEntry, probe: &ProbeResponse, info: &CacheInfo) -> bool {
    if let (Some(remote), Some(cached)) = (probe.etag.as_deref(), entry.etag()) {
        if remote != cached {
            return true;
        }
    }
    let modified = probe.last_modified.as_deref().and_then(parse_http_date);
    if modified.is_some_and(|modified| modified > entry.timestamp) {
        return true;
    }
    if probe.etag.is_none() && modified.is_none() {
        let now = probe
            .date
            .as_deref()
            .and_then(parse_http_date)
            .unwrap_or_else(Utc::now);
        return (now - entry.timestamp)
            .to_std()
            .is_ok_and(|age| age > info.max_age);
    }
    false
}

#[derive(Debug)]
struct CacheData {
    control: CacheControl,
    /// Sorted by timestamp, oldest first.
    entries: Vec<CacheEntry>,
}

#[derive(Debug)]
struct CacheState {
    dir: PathBuf,
    loader: XmlCatalogLoader,
    data: Mutex<CacheData>,
}

/// A cache of fetched resources.
///
/// A cache whose directory cannot be used is disabled: it stores nothing and
/// reports every resource as expired.
#[derive(Debug)]
pub struct ResourceCache {
    state: Option<CacheState>,
    offline: bool,
}

impl ResourceCache {
    /// Open the cache configured by `config`, or a disabled cache if there is
    /// none or it cannot be opened.
    pub fn new(config: &ResolverConfig) -> Self {
        let cache = match config.effective_cache_directory() {
            Some(dir) => Self::open(&dir).unwrap_or_else(|e| {
                warn!("Resource cache at {} is unavailable: {e}", dir.display());
                Self::disabled()
            }),
            None => Self::disabled(),
        };
        cache.with_offline(config.offline)
    }

    pub fn disabled() -> Self {
        Self {
            state: None,
            offline: false,
        }
    }

    /// Open (and create, if needed) the cache in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        for sub in [ENTRY_DIR, DATA_DIR, EXPIRED_DIR] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|e| CatalogError::io(path, e))?;
        }

        let control_path = dir.join(CONTROL_FILE);
        let control = if control_path.exists() {
            read_control(&control_path)
        } else {
            let control = CacheControl::default();
            let _lock = DirectoryLock::acquire(&dir)?;
            write_atomic(&control_path, &control.to_xml()?)?;
            control
        };

        let state = CacheState {
            dir,
            loader: XmlCatalogLoader::new(&ResolverConfig::default()),
            data: Mutex::new(CacheData {
                control,
                entries: vec![],
            }),
        };
        state.purge_expired();
        let entries = state.read_entries()?;
        state.data().entries = entries;
        Ok(Self {
            state: Some(state),
            offline: false,
        })
    }

    /// With `offline`, cached resources never expire.
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    pub fn directory(&self) -> Option<&Path> {
        self.state.as_ref().map(|state| state.dir.as_path())
    }

    /// The policy applying to `uri`.
    pub fn cache_info(&self, uri: &str) -> Option<CacheInfo> {
        let state = self.state.as_ref()?;
        Some(state.data().control.info_for(uri).clone())
    }

    /// Check if `uri` may be stored in this cache.
    pub fn cache_uri(&self, uri: &str) -> bool {
        self.cache_info(uri).is_some_and(|info| info.cache)
    }

    /// Add or replace a policy, and rewrite the control file.
    pub fn add_cache_info(&self, info: CacheInfo) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        let _lock = DirectoryLock::acquire(&state.dir)?;
        let xml = {
            let mut data = state.data();
            data.control.add(info);
            data.control.to_xml()?
        };
        write_atomic(&state.dir.join(CONTROL_FILE), &xml)
    }

    /// Re-read the control file and the entries, picking up changes made by
    /// other processes.
    pub fn reload(&self) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        let control = read_control(&state.dir.join(CONTROL_FILE));
        let entries = state.read_entries()?;
        let mut data = state.data();
        data.control = control;
        data.entries = entries;
        Ok(())
    }

    /// A snapshot of the entries, oldest first.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.state
            .as_ref()
            .map(|state| state.data().entries.clone())
            .unwrap_or_default()
    }

    /// The live entries as a catalog mapping logical identifiers to cached
    /// copies.
    pub fn catalog(&self) -> Option<EntryCatalog> {
        let state = self.state.as_ref()?;
        let uri = directory_to_uri(&state.dir).unwrap_or_else(|| "file:///".to_owned());
        let catalog = EntryCatalog::new(uri.as_str(), uri.as_str(), true);
        for entry in state.data().entries.iter().filter(|entry| !entry.expired) {
            catalog.push(entry.entry.clone());
        }
        Some(catalog)
    }

    /// Run `query` against the cached entries. Returns the `file:` URI of the
    /// cached copy.
    pub fn lookup(&self, manager: &CatalogManager, query: &Query) -> Option<String> {
        let catalog = self.catalog()?;
        query
            .lookup(manager, &catalog)
            .resolved_uri()
            .map(str::to_owned)
    }

    /// Find the live entry whose cached copy or logical identifier is `uri`.
    pub fn find(&self, uri: &str) -> Option<CacheEntry> {
        let state = self.state.as_ref()?;
        state
            .data()
            .entries
            .iter()
            .find(|entry| !entry.expired && (entry.local_uri() == uri || entry.logical_uri == uri))
            .cloned()
    }

    /// Decide whether the cached copy at `local_uri` must be fetched again.
    ///
    /// Entries whose policy forbids caching are evicted, and the policy's
    /// limits are enforced before the freshness check. Fails only if the cache
    /// directory cannot be locked for these updates.
    pub fn expired(&self, local_uri: &str, fetcher: &dyn ResourceFetcher) -> Result<bool> {
        let Some(state) = &self.state else {
            return Ok(true);
        };
        if self.offline {
            return Ok(false);
        }
        let Some(entry) = self.find(local_uri) else {
            return Ok(true);
        };

        let info = state.data().control.info_for(&entry.logical_uri).clone();
        if !info.cache {
            let lock = DirectoryLock::acquire(&state.dir)?;
            state.expire_matching(&lock, |candidate| info.matches(&candidate.logical_uri))?;
            return Ok(true);
        }
        if state.over_limits(&info) {
            self.flush_cache(&info)?;
            if self.find(local_uri).is_none() {
                return Ok(true);
            }
        }

        let source = entry.source_uri();
        let probe = match fetcher.probe(&source) {
            Ok(probe) => probe,
            Err(e) => {
                catalog_debug!(1, "Cannot revalidate {source}: {e}");
                return Ok(false);
            }
        };
        if probe.status != 200 {
            return Ok(false);
        }
        Ok(is_stale(&entry, &probe, &info))
    }

    /// Store a resource requested as a URI. Returns the URI of the cached
    /// copy, or `None` if the resource was not cached.
    pub fn add_uri(&self, uri: &str, fetched: &FetchedResource) -> Result<Option<String>> {
        self.add(EntryKind::Uri, uri, fetched)
    }

    /// Store a resource requested as a system identifier.
    pub fn add_system(&self, system_id: &str, fetched: &FetchedResource) -> Result<Option<String>> {
        self.add(EntryKind::System, system_id, fetched)
    }

    /// Store a resource requested as a public identifier.
    pub fn add_public(&self, public_id: &str, fetched: &FetchedResource) -> Result<Option<String>> {
        self.add(EntryKind::Public, public_id, fetched)
    }

    fn add(&self, kind: EntryKind, logical_uri: &str, fetched: &FetchedResource) -> Result<Option<String>> {
        let Some(state) = &self.state else {
            return Ok(None);
        };
        let info = state.data().control.info_for(logical_uri).clone();
        if !info.cache {
            return Ok(None);
        }

        let lock = DirectoryLock::acquire(&state.dir)?;
        let key = cache_key(logical_uri);
        let source = if fetched.uri.is_empty() {
            logical_uri
        } else {
            fetched.uri.as_str()
        };
        let data_path = state
            .dir
            .join(DATA_DIR)
            .join(format!("{key}{}", cache_extension(source, fetched.content_type.as_deref())));
        write_atomic(&data_path, &fetched.body)?;
        let local_uri = path_to_uri(&data_path)
            .ok_or_else(|| anyhow!("{} is not an absolute path", data_path.display()))?;

        let file_modified = fs::metadata(&data_path)
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        let record = EntryRecord {
            kind,
            logical_uri,
            local_uri: &local_uri,
            etag: fetched.etag.as_deref(),
            content_type: fetched.content_type.as_deref(),
            time: Utc::now(),
            file_size: fetched.body.len() as u64,
            file_modified,
            redir: (source != logical_uri).then_some(source),
        };
        let entry_path = state.dir.join(ENTRY_DIR).join(format!("{key}.xml"));
        write_atomic(&entry_path, &entry_document(&record)?)?;
        let cached = state
            .read_entry(&entry_path)
            .with_context(|| format!("cache entry {} cannot be read back", entry_path.display()))?;

        {
            let mut data = state.data();
            for old in data.entries.iter().filter(|old| old.entry_file == entry_path) {
                if old.local_path != data_path {
                    let _ = fs::remove_file(&old.local_path);
                }
            }
            data.entries.retain(|old| old.entry_file != entry_path);
            data.entries.push(cached);
        }
        catalog_debug!(1, "Cached {logical_uri} as {local_uri}");

        if state.over_limits(&info) {
            state.flush(&info, &lock)?;
        }
        let kept = state
            .data()
            .entries
            .iter()
            .any(|entry| entry.entry_file == entry_path && !entry.expired);
        Ok(kept.then_some(local_uri))
    }

    /// Enforce the size limits of `info` over the entries it matches.
    ///
    /// Entries are walked oldest first; once the count or total size exceeds
    /// the limit, that entry and every later matching one are moved to the
    /// `expired` directory.
    pub fn flush_cache(&self, info: &CacheInfo) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        let lock = DirectoryLock::acquire(&state.dir)?;
        state.flush(info, &lock)
    }
}

fn read_control(path: &Path) -> CacheControl {
    let control = fs::read_to_string(path)
        .context("cannot read the cache control file")
        .and_then(|text| CacheControl::parse(&text));
    control.unwrap_or_else(|e| {
        warn!("{}: {e:#}", path.display());
        CacheControl::default()
    })
}

impl CacheState {
    fn data(&self) -> MutexGuard<'_, CacheData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_entry(&self, path: &Path) -> Option<CacheEntry> {
        let bytes = fs::read(path).ok()?;
        let uri = path_to_uri(path)?;
        let catalog = self.loader.parse(&uri, &bytes).ok()?;
        let entry = catalog.entries().into_iter().next()?;
        CacheEntry::from_entry(entry, path.to_path_buf()).filter(|entry| entry.local_path.exists())
    }

    fn read_entries(&self) -> Result<Vec<CacheEntry>> {
        let dir = self.dir.join(ENTRY_DIR);
        let pattern = format!("{}/*.xml", glob::Pattern::escape(&dir.to_string_lossy()));
        let paths = glob::glob(&pattern).context("invalid cache entry pattern")?;

        let mut entries = vec![];
        for path in paths.filter_map(|path| path.ok()) {
            match self.read_entry(&path) {
                Some(entry) => entries.push(entry),
                None => warn!("Ignoring unusable cache entry {}", path.display()),
            }
        }
        entries.sort_by_key(|entry| entry.timestamp);
        Ok(entries)
    }

    fn over_limits(&self, info: &CacheInfo) -> bool {
        let data = self.data();
        let (count, space) = data
            .entries
            .iter()
            .filter(|entry| !entry.expired && info.matches(&entry.logical_uri))
            .fold((0, 0), |(count, space), entry| (count + 1, space + entry.file_size()));
        count > info.cache_size || space > info.cache_space
    }

    fn flush(&self, info: &CacheInfo, lock: &DirectoryLock) -> Result<()> {
        let mut count = 0;
        let mut space = 0;
        let mut burning = false;
        self.expire_matching(lock, |entry| {
            if !info.matches(&entry.logical_uri) {
                return false;
            }
            count += 1;
            space += entry.file_size();
            burning |= count > info.cache_size || space > info.cache_space;
            burning
        })
    }

    /// Move the live entries selected by `select`, visited oldest first, to
    /// the `expired` directory and forget them.
    fn expire_matching(
        &self,
        _lock: &DirectoryLock,
        mut select: impl FnMut(&CacheEntry) -> bool,
    ) -> Result<()> {
        let expired_dir = self.dir.join(EXPIRED_DIR);
        let mut data = self.data();
        let mut result = Ok(());
        'entries: for entry in data.entries.iter_mut().filter(|entry| !entry.expired) {
            if !select(entry) {
                continue;
            }
            for (sub, path) in [(DATA_DIR, &entry.local_path), (ENTRY_DIR, &entry.entry_file)] {
                let Some(name) = path.file_name() else {
                    continue;
                };
                // Data and entry files may share a name.
                let target = expired_dir.join(format!("{sub}-{}", name.to_string_lossy()));
                match fs::rename(path, &target) {
                    Ok(()) => {
                        // The delete-wait counts from the eviction.
                        if let Ok(file) = File::options().write(true).open(&target) {
                            let _ = file.set_modified(SystemTime::now());
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        result = Err(CatalogError::io(path.as_path(), e));
                        break 'entries;
                    }
                }
            }
            catalog_debug!(1, "Expired cache entry for {}", entry.logical_uri);
            entry.expired = true;
        }
        data.entries.retain(|entry| !entry.expired);
        result
    }

    /// Delete files that have waited in the `expired` directory long enough.
    fn purge_expired(&self) {
        let delete_wait = self.data().control.default.delete_wait;
        let Ok(_lock) = DirectoryLock::acquire(&self.dir) else {
            warn!("Skipping purge of {}: the cache is locked", self.dir.display());
            return;
        };
        let Ok(files) = fs::read_dir(self.dir.join(EXPIRED_DIR)) else {
            return;
        };
        for file in files.filter_map(|file| file.ok()) {
            let path = file.path();
            let old_enough = file
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > delete_wait);
            if old_enough {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to delete {}: {e}", path.display());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn cache_key_is_sha256_hex() {
        assert_eq!(
            cache_key(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(cache_key("http://example.org/a.dtd").len(), 64);
    }

    #[test]
    fn extension_test() {
        assert_eq!(cache_extension("http://x.org/a/b.dtd", None), ".dtd");
        assert_eq!(cache_extension("http://x.org/a/b.xsd?v=2", None), ".xsd");
        assert_eq!(
            cache_extension("http://x.org/a/b.toolong", Some("application/xml")),
            ".xml"
        );
        assert_eq!(
            cache_extension("http://x.org/a/", Some("application/xml-dtd")),
            ".dtd"
        );
        assert_eq!(cache_extension("http://x.org/a", Some("text/html")), ".html");
        assert_eq!(cache_extension("http://x.org/a", Some("text/plain")), ".txt");
        assert_eq!(cache_extension("http://x.org/a", None), ".bin");
    }

    #[test]
    fn staleness_test() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::open(dir.path()).unwrap();
        let fetched = FetchedResource {
            uri: "http://example.org/a.dtd".to_owned(),
            status: 200,
            etag: Some("\"abc\"".to_owned()),
            body: b"<!ELEMENT a EMPTY>".to_vec(),
            ..Default::default()
        };
        cache.add_uri("http://example.org/a.dtd", &fetched).unwrap();
        let entry = cache.entries().pop().unwrap();
        let info = CacheInfo::default();

        let probe = |etag: Option<&str>, last_modified: Option<String>, date: Option<String>| ProbeResponse {
            status: 200,
            etag: etag.map(str::to_owned),
            last_modified,
            date,
        };
        assert!(!is_stale(&entry, &probe(Some("\"abc\""), None, None), &info));
        assert!(is_stale(&entry, &probe(Some("\"xyz\""), None, None), &info));

        let later = (entry.timestamp + chrono::Duration::hours(1)).to_rfc2822();
        let earlier = (entry.timestamp - chrono::Duration::hours(1)).to_rfc2822();
        assert!(is_stale(&entry, &probe(None, Some(later.clone()), None), &info));
        assert!(!is_stale(&entry, &probe(None, Some(earlier), None), &info));

        let mut short = info.clone();
        short.max_age = Duration::from_secs(60);
        assert!(!is_stale(&entry, &probe(None, None, None), &short));
        assert!(is_stale(&entry, &probe(None, None, Some(later)), &short));
    }

    #[test]
    fn disabled_cache_is_pass_through() {
        let cache = ResourceCache::new(&ResolverConfig::default());
        assert!(!cache.is_enabled());
        assert!(!cache.cache_uri("http://example.org/a.dtd"));
        assert!(cache.catalog().is_none());
        let fetched = FetchedResource::default();
        assert_eq!(cache.add_uri("http://example.org/a.dtd", &fetched).unwrap(), None);
        assert!(cache.expired("file:///nowhere", &crate::resource::LocalFetcher).unwrap());
    }
}
