//! Cache keys for remotely hosted images
//!
//! Maps an image URL to a `(key, variant)` pair. The key names the image
//! family (site plus canonical file name) and is shared by every rendered
//! size of that image; the variant is the pixel width embedded in thumbnail
//! URLs, `0` for the original upload.
//!
//! URLs that don't follow the upload layout still get a key: the whole URL,
//! normalized. Such URLs never share a key across sizes.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;
use url::Url;

/// Rendered size of an image; `0` is the original, unscaled upload
pub type Variant = u32;

/// Joins the parts of keys and identifiers
pub const SEPARATOR: &str = "||";

static SIZE_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[^/]*-)?(\d+)px-").unwrap());

/// Canonical (NFC) key for an image family
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Normalize `raw` to composed Unicode form and wrap it
    pub fn new(raw: &str) -> Self {
        Self(normalize(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identity of one cached blob: an image family at one size
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageCacheKey {
    pub key: CacheKey,
    pub variant: Variant,
}

impl ImageCacheKey {
    pub fn new(key: CacheKey, variant: Variant) -> Self {
        Self { key, variant }
    }

    /// Derive key and variant from an image URL
    pub fn from_url(url: &str) -> Self {
        Self {
            key: derive_key(url),
            variant: derive_variant(url),
        }
    }

    /// Identifier used for request coalescing and blob naming
    pub fn identifier(&self) -> String {
        identifier(&self.key, self.variant)
    }
}

impl fmt::Display for ImageCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

/// Site and canonical file name of an uploaded image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLocation {
    pub site: String,
    pub name: String,
}

impl ImageLocation {
    /// Parse upload URLs of the forms
    /// `//host/<site...>/<h>/<hh>/<name>` and
    /// `//host/<site...>/thumb/<h>/<hh>/<name>/<size>px-<name>`.
    pub fn parse(url: &str) -> Option<Self> {
        let parsed = parse_url(url)?;
        let host = parsed.host_str()?.to_ascii_lowercase();
        let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();

        let (site_segments, name) = match segments.iter().position(|s| *s == "thumb") {
            Some(thumb) => {
                let hash = segments.get(thumb + 1)?;
                let subhash = segments.get(thumb + 2)?;
                if !is_hash_dirs(hash, subhash) {
                    return None;
                }
                (&segments[..thumb], *segments.get(thumb + 3)?)
            }
            None => {
                let n = segments.len();
                if n < 3 || !is_hash_dirs(segments[n - 3], segments[n - 2]) {
                    return None;
                }
                (&segments[..n - 3], segments[n - 1])
            }
        };

        let name = urlencoding::decode(name).ok()?.replace(' ', "_");
        if name.is_empty() {
            return None;
        }

        let mut site = host;
        for segment in site_segments {
            site.push('/');
            site.push_str(segment);
        }

        Some(Self { site, name })
    }
}

/// Key shared by every size of the image at `url`
pub fn derive_key(url: &str) -> CacheKey {
    match ImageLocation::parse(url) {
        Some(location) => CacheKey::new(&format!(
            "{}{}{}",
            location.site, SEPARATOR, location.name
        )),
        None => CacheKey::new(url),
    }
}

/// Pixel width from a `<size>px-` file name prefix, `0` when absent
pub fn derive_variant(url: &str) -> Variant {
    let path = match parse_url(url) {
        Some(parsed) => parsed.path().to_string(),
        None => url.to_string(),
    };
    let file_name = path.rsplit('/').next().unwrap_or_default();

    SIZE_PREFIX_RE
        .captures(file_name)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0)
}

/// `key||variant`, normalized
pub fn identifier(key: &CacheKey, variant: Variant) -> String {
    normalize(&format!("{}{}{}", key, SEPARATOR, variant))
}

fn normalize(value: &str) -> String {
    value.nfc().collect()
}

fn parse_url(url: &str) -> Option<Url> {
    // Protocol-relative URLs are common in page markup
    if let Some(rest) = url.strip_prefix("//") {
        return Url::parse(&format!("https://{rest}")).ok();
    }
    Url::parse(url).ok()
}

fn is_hash_dirs(hash: &str, subhash: &str) -> bool {
    let is_hex = |s: &str| s.chars().all(|c| c.is_ascii_hexdigit());
    hash.len() == 1 && subhash.len() == 2 && is_hex(hash) && is_hex(subhash) && subhash.starts_with(hash)
}
