//! Bundle collaborator contract and an in-memory implementation.
//!
//! A bundle is the set of files making up one unpacked EPUB. The font
//! pipeline never touches the filesystem itself: every read, write, delete
//! and reference rewrite goes through [`Bundle`].

use std::collections::BTreeMap;

use crate::error::{ErrorPhase, SubfontError};

/// Stable handle of a resource inside one bundle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub u32);

/// Broad resource classification used for iteration and rewrites.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// XHTML/HTML content documents.
    Markup,
    /// CSS stylesheets.
    Stylesheet,
    /// Font files (sfnt, collections, WOFF).
    Font,
    /// Raster and vector images.
    Image,
    /// Anything else (OPF, NCX, scripts, audio).
    Other,
}

impl ResourceKind {
    /// Classify by file extension of `path`.
    pub fn from_path(path: &str) -> Self {
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "xhtml" | "html" | "htm" => Self::Markup,
            "css" => Self::Stylesheet,
            "ttf" | "otf" | "ttc" | "otc" | "woff" | "woff2" => Self::Font,
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "svg" | "bmp" => Self::Image,
            _ => Self::Other,
        }
    }

    /// Classify by manifest media type, falling back to the path extension.
    pub fn from_media_type(media_type: &str, path: &str) -> Self {
        let mt = media_type.trim().to_ascii_lowercase();
        if mt == "application/xhtml+xml" || mt == "text/html" {
            Self::Markup
        } else if mt == "text/css" {
            Self::Stylesheet
        } else if mt.starts_with("font/")
            || mt.starts_with("application/font")
            || mt.starts_with("application/x-font")
            || mt == "application/vnd.ms-opentype"
        {
            Self::Font
        } else if mt.starts_with("image/") {
            Self::Image
        } else {
            Self::from_path(path)
        }
    }

    /// Media type used when registering a new resource in a manifest.
    pub fn media_type_for(path: &str) -> &'static str {
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "xhtml" | "html" | "htm" => "application/xhtml+xml",
            "css" => "text/css",
            "ttf" => "font/ttf",
            "otf" => "font/otf",
            "ttc" | "otc" => "font/collection",
            "woff" => "font/woff",
            "woff2" => "font/woff2",
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" => "image/gif",
            "svg" => "image/svg+xml",
            _ => "application/octet-stream",
        }
    }
}

/// One file in a bundle.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Resource {
    /// Stable handle.
    pub id: ResourceId,
    /// Bundle-relative path using `/` separators.
    pub href: String,
    /// Resource classification.
    pub kind: ResourceKind,
}

impl Resource {
    /// File name component of the resource path.
    pub fn basename(&self) -> &str {
        basename(&self.href)
    }
}

/// Bundle collaborator consumed by the font pipeline.
pub trait Bundle {
    /// Find a resource by file name, case-insensitively.
    fn lookup_by_basename(&self, name: &str) -> Option<Resource>;

    /// All live resources whose kind is in `kinds`, in bundle order.
    fn iter_by_kind(&self, kinds: &[ResourceKind]) -> Vec<Resource>;

    /// Read a resource as UTF-8 text.
    fn read_text(&self, resource: &Resource) -> Result<String, SubfontError>;

    /// Read a resource as raw bytes.
    fn read_binary(&self, resource: &Resource) -> Result<Vec<u8>, SubfontError>;

    /// Replace the text content of a resource.
    fn write_text(&mut self, resource: &Resource, content: &str) -> Result<(), SubfontError>;

    /// Replace the byte content of a resource.
    fn write_binary(&mut self, resource: &Resource, content: &[u8]) -> Result<(), SubfontError>;

    /// Remove a resource and its manifest entry.
    fn delete_resource(&mut self, resource: &Resource) -> Result<(), SubfontError>;

    /// Add a new resource named `basename`, optionally registering it in the
    /// manifest. Fails if the name is already taken.
    fn add_resource(
        &mut self,
        basename: &str,
        content: &[u8],
        register_in_manifest: bool,
    ) -> Result<Resource, SubfontError>;

    /// Replace references to old basenames with new ones in every resource
    /// of the given kinds.
    fn rewrite_references(
        &mut self,
        kinds: &[ResourceKind],
        basename_map: &BTreeMap<String, String>,
    ) -> Result<(), SubfontError> {
        if basename_map.is_empty() {
            return Ok(());
        }
        for resource in self.iter_by_kind(kinds) {
            let text = self.read_text(&resource)?;
            let mut current = text;
            let mut changed = false;
            for (old, new) in basename_map {
                if let Some(rewritten) = replace_basename(&current, old, new) {
                    current = rewritten;
                    changed = true;
                }
                let encoded = percent_encode(old);
                if encoded != *old {
                    if let Some(rewritten) =
                        replace_basename(&current, &encoded, &percent_encode(new))
                    {
                        current = rewritten;
                        changed = true;
                    }
                }
            }
            if changed {
                log::debug!("rewrote font references in {}", resource.href);
                self.write_text(&resource, &current)?;
            }
        }
        Ok(())
    }
}

/// File name component of a `/`-separated path, without fragment or query.
pub fn basename(path: &str) -> &str {
    let path = resource_path_without_fragment(path);
    path.rsplit('/').next().unwrap_or(path)
}

/// Normalized lookup key for a basename: percent-decoded and lowercased.
pub fn basename_key(name: &str) -> String {
    percent_decode(basename(name).trim()).to_lowercase()
}

/// Decode `%XX` escapes in an href. Malformed escapes are kept literally.
pub fn percent_decode(href: &str) -> String {
    if !href.contains('%') {
        return href.to_string();
    }
    let bytes = href.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = bytes
                .get(idx + 1..idx + 3)
                .and_then(|pair| core::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok());
            if let Some(byte) = hex {
                out.push(byte);
                idx += 3;
                continue;
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Escape every byte outside the URL unreserved set, keeping `/`.
pub fn percent_encode(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for &byte in path.as_bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~' | b'/') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

pub(crate) fn resource_path_without_fragment(path: &str) -> &str {
    let path = path.split('#').next().unwrap_or(path);
    path.split('?').next().unwrap_or(path)
}

/// Resolve `rel` against the directory of `base_path`.
pub fn resolve_relative(base_path: &str, rel: &str) -> String {
    if rel.contains("://") {
        return rel.to_string();
    }
    if rel.starts_with('/') {
        return normalize_path(rel.trim_start_matches('/'));
    }
    let base_dir = base_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
    if base_dir.is_empty() {
        normalize_path(rel)
    } else {
        normalize_path(&format!("{}/{}", base_dir, rel))
    }
}

pub(crate) fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(8);
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }
    parts.join("/")
}

fn is_name_char(ch: char) -> bool {
    ch.is_alphanumeric() || matches!(ch, '-' | '_' | '.' | '%' | '+')
}

/// Replace whole-basename occurrences of `old` with `new`, ignoring ASCII
/// case.
///
/// An occurrence only counts when it is not glued to other file-name
/// characters, so `a.ttf` never matches inside `aa.ttf`. Returns `None`
/// when nothing was replaced.
pub fn replace_basename(text: &str, old: &str, new: &str) -> Option<String> {
    if old.is_empty() {
        return None;
    }
    // ASCII lowercasing keeps byte offsets identical to `text`.
    let haystack = text.to_ascii_lowercase();
    let needle = old.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0usize;
    let mut from = 0usize;
    let mut replaced = false;
    while let Some(found) = haystack[from..].find(&needle) {
        let idx = from + found;
        let end = idx + needle.len();
        let prev_ok = text[..idx]
            .chars()
            .next_back()
            .is_none_or(|ch| !is_name_char(ch));
        let next_ok = text[end..].chars().next().is_none_or(|ch| !is_name_char(ch));
        if prev_ok && next_ok {
            out.push_str(&text[copied..idx]);
            out.push_str(new);
            copied = end;
            replaced = true;
        }
        from = end;
    }
    if !replaced {
        return None;
    }
    out.push_str(&text[copied..]);
    Some(out)
}

#[derive(Clone, Debug)]
struct MemoryEntry {
    resource: Resource,
    bytes: Vec<u8>,
    in_manifest: bool,
}

/// Bundle held entirely in memory.
///
/// Useful for tests and for callers that already unpacked an archive.
#[derive(Clone, Debug, Default)]
pub struct MemoryBundle {
    entries: Vec<Option<MemoryEntry>>,
}

impl MemoryBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file at `href`, classified by extension. Returns its handle.
    pub fn insert(&mut self, href: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Resource {
        let href = href.into();
        let resource = Resource {
            id: ResourceId(self.entries.len() as u32),
            kind: ResourceKind::from_path(&href),
            href,
        };
        self.entries.push(Some(MemoryEntry {
            resource: resource.clone(),
            bytes: bytes.into(),
            in_manifest: true,
        }));
        resource
    }

    /// Builder-style [`MemoryBundle::insert`].
    pub fn with_file(mut self, href: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(href, bytes);
        self
    }

    /// Current bytes at `href`, if present.
    pub fn get(&self, href: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .flatten()
            .find(|entry| entry.resource.href == href)
            .map(|entry| entry.bytes.as_slice())
    }

    /// Current text at `href`, if present and UTF-8.
    pub fn get_text(&self, href: &str) -> Option<&str> {
        self.get(href).and_then(|bytes| core::str::from_utf8(bytes).ok())
    }

    /// Whether `href` is registered in the manifest.
    pub fn is_registered(&self, href: &str) -> bool {
        self.entries
            .iter()
            .flatten()
            .any(|entry| entry.resource.href == href && entry.in_manifest)
    }

    /// Paths of all live resources.
    pub fn hrefs(&self) -> Vec<&str> {
        self.entries
            .iter()
            .flatten()
            .map(|entry| entry.resource.href.as_str())
            .collect()
    }

    fn entry(&self, resource: &Resource) -> Result<&MemoryEntry, SubfontError> {
        self.entries
            .get(resource.id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| missing_resource(resource))
    }

    fn entry_mut(&mut self, resource: &Resource) -> Result<&mut MemoryEntry, SubfontError> {
        self.entries
            .get_mut(resource.id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| missing_resource(resource))
    }
}

fn missing_resource(resource: &Resource) -> SubfontError {
    SubfontError::new(
        ErrorPhase::Bundle,
        "BUNDLE_MISSING_RESOURCE",
        "resource is not part of the bundle",
    )
    .with_path(resource.href.clone())
}

impl Bundle for MemoryBundle {
    fn lookup_by_basename(&self, name: &str) -> Option<Resource> {
        let key = basename_key(name);
        self.entries
            .iter()
            .flatten()
            .find(|entry| basename_key(&entry.resource.href) == key)
            .map(|entry| entry.resource.clone())
    }

    fn iter_by_kind(&self, kinds: &[ResourceKind]) -> Vec<Resource> {
        self.entries
            .iter()
            .flatten()
            .filter(|entry| kinds.contains(&entry.resource.kind))
            .map(|entry| entry.resource.clone())
            .collect()
    }

    fn read_text(&self, resource: &Resource) -> Result<String, SubfontError> {
        let entry = self.entry(resource)?;
        String::from_utf8(entry.bytes.clone()).map_err(|err| {
            SubfontError::new(ErrorPhase::Bundle, "BUNDLE_NOT_UTF8", err.to_string())
                .with_path(resource.href.clone())
        })
    }

    fn read_binary(&self, resource: &Resource) -> Result<Vec<u8>, SubfontError> {
        Ok(self.entry(resource)?.bytes.clone())
    }

    fn write_text(&mut self, resource: &Resource, content: &str) -> Result<(), SubfontError> {
        self.write_binary(resource, content.as_bytes())
    }

    fn write_binary(&mut self, resource: &Resource, content: &[u8]) -> Result<(), SubfontError> {
        self.entry_mut(resource)?.bytes = content.to_vec();
        Ok(())
    }

    fn delete_resource(&mut self, resource: &Resource) -> Result<(), SubfontError> {
        self.entry(resource)?;
        self.entries[resource.id.0 as usize] = None;
        Ok(())
    }

    fn add_resource(
        &mut self,
        name: &str,
        content: &[u8],
        register_in_manifest: bool,
    ) -> Result<Resource, SubfontError> {
        if self.lookup_by_basename(name).is_some() {
            return Err(SubfontError::new(
                ErrorPhase::Bundle,
                "BUNDLE_DUPLICATE_NAME",
                format!("a resource named {} already exists", name),
            ));
        }
        let kind = ResourceKind::from_path(name);
        let dir = self
            .entries
            .iter()
            .flatten()
            .find(|entry| entry.resource.kind == kind)
            .and_then(|entry| entry.resource.href.rsplit_once('/'))
            .map(|(dir, _)| dir.to_string());
        let href = match dir {
            Some(dir) => format!("{}/{}", dir, name),
            None => name.to_string(),
        };
        let resource = Resource {
            id: ResourceId(self.entries.len() as u32),
            href,
            kind,
        };
        self.entries.push(Some(MemoryEntry {
            resource: resource.clone(),
            bytes: content.to_vec(),
            in_manifest: register_in_manifest,
        }));
        Ok(resource)
    }
}
