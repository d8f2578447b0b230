//! The cache control file: caching policies selected by URI pattern.

use std::time::Duration;

use anyhow::{Context, bail};
use log::warn;
use quick_xml::{
    Reader, Writer,
    events::{BytesDecl, BytesEnd, BytesStart, Event},
};
use regex::Regex;

pub const CONTROL_FILE: &str = "control.xml";
pub const CONTROL_VERSION: &str = "1";

pub const DEFAULT_DELETE_WAIT: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_CACHE_SIZE: u64 = 1000;
pub const DEFAULT_CACHE_SPACE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// URIs that are never copied into the cache.
const DEFAULT_NO_CACHE: &[&str] = &["^file:", "^jar:file:", "^classpath:"];

/// The caching policy for a set of URIs.
#[derive(Debug, Clone)]
pub struct CacheInfo {
    /// `None` for the default policy, which applies to every URI.
    pub pattern: Option<Regex>,
    /// Whether matching URIs are cached at all.
    pub cache: bool,
    /// How long evicted files are kept in the `expired` directory.
    pub delete_wait: Duration,
    /// Maximum number of cached entries.
    pub cache_size: u64,
    /// Maximum total size of cached entries, in bytes.
    pub cache_space: u64,
    /// Age after which an entry without validators is refetched.
    pub max_age: Duration,
}

impl Default for CacheInfo {
    fn default() -> Self {
        Self {
            pattern: None,
            cache: true,
            delete_wait: DEFAULT_DELETE_WAIT,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_space: DEFAULT_CACHE_SPACE,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

impl CacheInfo {
    /// A policy for URIs matching `pattern`, with default limits.
    pub fn rule(pattern: &str, cache: bool) -> anyhow::Result<Self> {
        let pattern = Regex::new(pattern).with_context(|| format!("invalid URI pattern '{pattern}'"))?;
        Ok(Self {
            pattern: Some(pattern),
            cache,
            ..Default::default()
        })
    }

    pub fn pattern_str(&self) -> Option<&str> {
        self.pattern.as_ref().map(Regex::as_str)
    }

    pub fn matches(&self, uri: &str) -> bool {
        self.pattern.as_ref().is_none_or(|pattern| pattern.is_match(uri))
    }
}

/// Parse a duration: a number optionally followed by `s`, `m`, `h`, `d` or `w`.
/// Bare numbers are seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (number, unit) = match value.char_indices().last()? {
        (pos, c) if c.is_ascii_alphabetic() => (&value[..pos], c.to_ascii_lowercase()),
        _ => (value, 's'),
    };
    let scale = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        'w' => 7 * 24 * 60 * 60,
        _ => return None,
    };
    let number: u64 = number.trim().parse().ok()?;
    Some(Duration::from_secs(number.checked_mul(scale)?))
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    for (unit, scale) in [('w', 604800), ('d', 86400), ('h', 3600), ('m', 60)] {
        if secs > 0 && secs % scale == 0 {
            return format!("{}{unit}", secs / scale);
        }
    }
    format!("{secs}s")
}

/// Parse a size: a number optionally followed by `k`, `m` or `g`. Bare numbers
/// are bytes.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let (number, scale) = match value.char_indices().last()? {
        (pos, 'k' | 'K') => (&value[..pos], 1 << 10),
        (pos, 'm' | 'M') => (&value[..pos], 1 << 20),
        (pos, 'g' | 'G') => (&value[..pos], 1 << 30),
        _ => (value, 1),
    };
    number.trim().parse::<u64>().ok()?.checked_mul(scale)
}

pub fn format_size(size: u64) -> String {
    for (unit, scale) in [('g', 1u64 << 30), ('m', 1 << 20), ('k', 1 << 10)] {
        if size > 0 && size % scale == 0 {
            return format!("{}{unit}", size / scale);
        }
    }
    size.to_string()
}

/// The policies of one cache directory.
#[derive(Debug, Clone)]
pub struct CacheControl {
    pub default: CacheInfo,
    /// Checked in order; the first match wins.
    pub rules: Vec<CacheInfo>,
}

impl Default for CacheControl {
    fn default() -> Self {
        let rules = DEFAULT_NO_CACHE
            .iter()
            .filter_map(|pattern| CacheInfo::rule(pattern, false).ok())
            .collect();
        Self {
            default: CacheInfo::default(),
            rules,
        }
    }
}

impl CacheControl {
    /// The policy applying to `uri`.
    pub fn info_for(&self, uri: &str) -> &CacheInfo {
        self.rules
            .iter()
            .find(|info| info.matches(uri))
            .unwrap_or(&self.default)
    }

    /// Add `info`, replacing a rule with the same pattern. A policy without
    /// pattern replaces the default.
    pub fn add(&mut self, info: CacheInfo) {
        let Some(pattern) = info.pattern_str() else {
            self.default = info;
            return;
        };
        match self
            .rules
            .iter_mut()
            .find(|rule| rule.pattern_str() == Some(pattern))
        {
            Some(rule) => *rule = info,
            None => self.rules.push(info),
        }
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut control: Option<Self> = None;
        loop {
            let start = match reader.read_event().context("malformed cache control file")? {
                Event::Start(start) | Event::Empty(start) => start,
                Event::Eof => break,
                _ => continue,
            };
            match control {
                None => {
                    if start.local_name().as_ref() != b"cache-control" {
                        bail!("root element is not cache-control");
                    }
                    let mut default = CacheInfo::default();
                    let attrs = apply_attributes(&start, &mut default)?;
                    if let Some(version) = attrs.version.filter(|v| v != CONTROL_VERSION) {
                        warn!("Unexpected cache control version {version}");
                    }
                    control = Some(Self {
                        default,
                        rules: vec![],
                    });
                }
                Some(ref mut control) => {
                    let cache = match start.local_name().as_ref() {
                        b"cache" => true,
                        b"no-cache" => false,
                        _ => continue,
                    };
                    let mut info = control.default.clone();
                    info.cache = cache;
                    let attrs = apply_attributes(&start, &mut info)?;
                    let Some(pattern) = attrs.uri else {
                        warn!("Ignoring cache rule without uri pattern");
                        continue;
                    };
                    info.pattern = Some(
                        Regex::new(&pattern)
                            .with_context(|| format!("invalid URI pattern '{pattern}'"))?,
                    );
                    control.rules.push(info);
                }
            }
        }
        control.context("empty cache control file")
    }

    pub fn to_xml(&self) -> anyhow::Result<Vec<u8>> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut root = BytesStart::new("cache-control");
        root.push_attribute(("version", CONTROL_VERSION));
        push_limits(&mut root, &self.default);
        if self.rules.is_empty() {
            writer.write_event(Event::Empty(root))?;
        } else {
            writer.write_event(Event::Start(root))?;
            for rule in &self.rules {
                let mut elem = BytesStart::new(if rule.cache { "cache" } else { "no-cache" });
                elem.push_attribute(("uri", rule.pattern_str().unwrap_or(".*")));
                push_limits(&mut elem, rule);
                writer.write_event(Event::Empty(elem))?;
            }
            writer.write_event(Event::End(BytesEnd::new("cache-control")))?;
        }
        Ok(writer.into_inner())
    }
}

fn push_limits(elem: &mut BytesStart, info: &CacheInfo) {
    elem.push_attribute(("delete-wait", format_duration(info.delete_wait).as_str()));
    elem.push_attribute(("size", info.cache_size.to_string().as_str()));
    elem.push_attribute(("space", format_size(info.cache_space).as_str()));
    elem.push_attribute(("max-age", format_duration(info.max_age).as_str()));
}

#[derive(Default)]
struct ControlAttributes {
    version: Option<String>,
    uri: Option<String>,
}

/// Read the limit attributes of `start` into `info`. Invalid values are
/// reported and leave the inherited value in place.
fn apply_attributes(start: &BytesStart, info: &mut CacheInfo) -> anyhow::Result<ControlAttributes> {
    let mut rest = ControlAttributes::default();
    for attr in start.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?.into_owned();
        match attr.key.local_name().as_ref() {
            b"version" => rest.version = Some(value),
            b"uri" => rest.uri = Some(value),
            b"delete-wait" => match parse_duration(&value) {
                Some(wait) => info.delete_wait = wait,
                None => warn!("Invalid delete-wait '{value}'"),
            },
            b"size" => match value.trim().parse() {
                Ok(size) => info.cache_size = size,
                Err(_) => warn!("Invalid size '{value}'"),
            },
            b"space" => match parse_size(&value) {
                Some(space) => info.cache_space = space,
                None => warn!("Invalid space '{value}'"),
            },
            b"max-age" => match parse_duration(&value) {
                Some(age) => info.max_age = age,
                None => warn!("Invalid max-age '{value}'"),
            },
            _ => {}
        }
    }
    Ok(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_and_sizes() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1w"), Some(DEFAULT_DELETE_WAIT));
        assert_eq!(parse_duration("3y"), None);
        assert_eq!(format_duration(DEFAULT_MAX_AGE), "1w");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");

        assert_eq!(parse_size("10m"), Some(DEFAULT_CACHE_SPACE));
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("k"), None);
        assert_eq!(format_size(DEFAULT_CACHE_SPACE), "10m");
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut control = CacheControl::default();
        control.add(CacheInfo::rule("^https://example\\.org/", false).unwrap());
        control.add(CacheInfo::rule("^https://", true).unwrap());

        assert!(!control.info_for("file:///etc/xml/catalog").cache);
        assert!(!control.info_for("https://example.org/a.dtd").cache);
        assert!(control.info_for("https://www.w3.org/a.dtd").cache);
        assert!(control.info_for("http://www.w3.org/a.dtd").pattern.is_none());
    }

    #[test]
    fn control_file_is_read_back() {
        let mut control = CacheControl::default();
        let mut rule = CacheInfo::rule("^https://www\\.w3\\.org/", true).unwrap();
        rule.cache_size = 5;
        rule.max_age = Duration::from_secs(3600);
        control.add(rule);

        let xml = String::from_utf8(control.to_xml().unwrap()).unwrap();
        let parsed = CacheControl::parse(&xml).unwrap();
        assert_eq!(parsed.rules.len(), 4);
        let w3c = parsed.info_for("https://www.w3.org/2001/xml.xsd");
        assert_eq!(w3c.cache_size, 5);
        assert_eq!(w3c.max_age, Duration::from_secs(3600));
        assert_eq!(w3c.cache_space, DEFAULT_CACHE_SPACE);
        assert!(!parsed.info_for("classpath:a.xsd").cache);
    }

    #[test]
    fn rules_inherit_the_defaults() {
        let xml = r#"<cache-control version="1" size="10" max-age="1d">
  <cache uri="^https://" space="1k"/>
  <no-cache/>
</cache-control>"#;
        let control = CacheControl::parse(xml).unwrap();
        assert_eq!(control.rules.len(), 1);
        let info = control.info_for("https://x.org/");
        assert_eq!(info.cache_size, 10);
        assert_eq!(info.cache_space, 1024);
        assert_eq!(info.max_age, Duration::from_secs(86400));

        assert!(CacheControl::parse("<catalog/>").is_err());
    }
}
