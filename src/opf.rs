//! Bundle over an unpacked EPUB directory with OPF manifest bookkeeping.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::bundle::{
    basename, basename_key, normalize_path, percent_decode, percent_encode, resolve_relative,
    Bundle, Resource, ResourceId, ResourceKind,
};
use crate::error::{ErrorPhase, SubfontError};

const CONTAINER_PATH: &str = "META-INF/container.xml";

/// One `<item>` of the OPF manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestItem {
    /// Manifest id.
    pub id: String,
    /// `href` as written, relative to the OPF.
    pub href: String,
    /// Declared media type.
    pub media_type: String,
    /// Byte span of the element in the OPF text.
    pub span: Range<usize>,
}

/// Manifest and spine references extracted from OPF text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Items in document order.
    pub items: Vec<ManifestItem>,
    /// `(idref, span)` of every `<itemref>`.
    pub itemrefs: Vec<(String, Range<usize>)>,
    /// Byte offset of the `</manifest>` end tag.
    pub manifest_end: Option<usize>,
}

/// Parse the manifest and spine of an OPF package document.
pub fn parse_manifest(opf: &str) -> Result<Manifest, SubfontError> {
    let mut reader = Reader::from_reader(opf.as_bytes());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::with_capacity(256);
    let mut out = Manifest::default();
    let mut open_item: Option<usize> = None;
    loop {
        let start = reader.buffer_position() as usize;
        let event = reader.read_event_into(&mut buf).map_err(|err| {
            SubfontError::new(
                ErrorPhase::Bundle,
                "BUNDLE_BAD_OPF",
                format!("OPF parse error: {}", err),
            )
        })?;
        let end = reader.buffer_position() as usize;
        let is_start = matches!(event, Event::Start(_));
        match event {
            Event::Start(e) | Event::Empty(e) => match local_name(&reader, &e).as_str() {
                "item" => {
                    let id = attr_value(&reader, &e, "id");
                    let href = attr_value(&reader, &e, "href");
                    if let (Some(id), Some(href)) = (id, href) {
                        if is_start {
                            open_item = Some(out.items.len());
                        }
                        out.items.push(ManifestItem {
                            id,
                            href,
                            media_type: attr_value(&reader, &e, "media-type").unwrap_or_default(),
                            span: start..end,
                        });
                    }
                }
                "itemref" => {
                    if let Some(idref) = attr_value(&reader, &e, "idref") {
                        out.itemrefs.push((idref, start..end));
                    }
                }
                _ => {}
            },
            Event::End(e) => {
                let qname = e.name();
                let name = reader.decoder().decode(qname.as_ref()).unwrap_or_default();
                match name.rsplit(':').next() {
                    Some("manifest") => out.manifest_end = Some(start),
                    Some("item") => {
                        if let Some(item) = open_item.take().and_then(|idx| out.items.get_mut(idx)) {
                            item.span.end = end;
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Path of the OPF package named by `META-INF/container.xml`.
pub fn find_rootfile(container_xml: &str) -> Option<String> {
    let mut reader = Reader::from_reader(container_xml.as_bytes());
    let mut buf = Vec::with_capacity(128);
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if local_name(&reader, &e) == "rootfile" {
                    if let Some(path) = attr_value(&reader, &e, "full-path") {
                        return Some(path);
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

fn local_name(reader: &Reader<&[u8]>, start: &BytesStart<'_>) -> String {
    let raw = reader
        .decoder()
        .decode(start.name().as_ref())
        .unwrap_or_default()
        .into_owned();
    match raw.rsplit_once(':') {
        Some((_, local)) => local.to_string(),
        None => raw,
    }
}

fn attr_value(reader: &Reader<&[u8]>, start: &BytesStart<'_>, name: &str) -> Option<String> {
    start
        .attributes()
        .with_checks(false)
        .flatten()
        .find(|attr| attr.key.as_ref() == name.as_bytes())
        .and_then(|attr| {
            let raw = reader.decoder().decode(&attr.value).ok()?;
            crate::markup::unescape(&raw).map(|value| value.into_owned())
        })
}

#[derive(Clone, Debug)]
struct DirEntry {
    resource: Resource,
    manifest_id: Option<String>,
}

/// Bundle backed by an unpacked EPUB on disk.
///
/// Resources are the OPF manifest items. Deleting a resource removes the
/// file, its manifest item and any spine reference; added resources are
/// registered in the manifest on request.
#[derive(Debug)]
pub struct DirBundle {
    root: PathBuf,
    opf_path: String,
    entries: Vec<Option<DirEntry>>,
}

impl DirBundle {
    /// Open the unpacked EPUB rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, SubfontError> {
        let root = root.as_ref().to_path_buf();
        let container_path = root.join(CONTAINER_PATH);
        let opf_path = match fs::read_to_string(&container_path) {
            Ok(text) => find_rootfile(&text),
            Err(_) => None,
        }
        .or_else(|| find_opf_fallback(&root))
        .ok_or_else(|| {
            SubfontError::new(ErrorPhase::Bundle, "BUNDLE_NO_OPF", "no OPF package document")
                .with_path(root.display().to_string())
        })?;
        let opf_path = normalize_path(&opf_path);

        let opf_text = fs::read_to_string(root.join(&opf_path))
            .map_err(|err| SubfontError::io(opf_path.clone(), &err))?;
        let manifest = parse_manifest(&opf_text).map_err(|err| err.with_path(opf_path.clone()))?;

        let entries = manifest
            .items
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                let href = resolve_relative(&opf_path, &percent_decode(&item.href));
                Some(DirEntry {
                    resource: Resource {
                        id: ResourceId(idx as u32),
                        kind: ResourceKind::from_media_type(&item.media_type, &href),
                        href,
                    },
                    manifest_id: Some(item.id.clone()),
                })
            })
            .collect::<Vec<_>>();
        log::debug!("opened {} with {} manifest items", opf_path, entries.len());
        Ok(Self {
            root,
            opf_path,
            entries,
        })
    }

    /// Bundle-relative path of the OPF package document.
    pub fn opf_path(&self) -> &str {
        &self.opf_path
    }

    /// Filesystem path of a bundle-relative href.
    pub fn file_path(&self, href: &str) -> PathBuf {
        self.root.join(href)
    }

    fn entry(&self, resource: &Resource) -> Result<&DirEntry, SubfontError> {
        self.entries
            .get(resource.id.0 as usize)
            .and_then(Option::as_ref)
            .filter(|entry| entry.resource.href == resource.href)
            .ok_or_else(|| {
                SubfontError::new(ErrorPhase::Bundle, "BUNDLE_UNKNOWN_RESOURCE", "resource not in bundle")
                    .with_path(resource.href.clone())
            })
    }

    fn read_opf(&self) -> Result<String, SubfontError> {
        fs::read_to_string(self.file_path(&self.opf_path))
            .map_err(|err| SubfontError::io(self.opf_path.clone(), &err))
    }

    fn write_opf(&self, text: &str) -> Result<(), SubfontError> {
        fs::write(self.file_path(&self.opf_path), text)
            .map_err(|err| SubfontError::io(self.opf_path.clone(), &err))
    }

    fn unregister(&self, manifest_id: &str) -> Result<(), SubfontError> {
        let opf = self.read_opf()?;
        let manifest = parse_manifest(&opf)?;
        let mut spans: Vec<Range<usize>> = manifest
            .items
            .iter()
            .filter(|item| item.id == manifest_id)
            .map(|item| item.span.clone())
            .chain(
                manifest
                    .itemrefs
                    .iter()
                    .filter(|(idref, _)| idref == manifest_id)
                    .map(|(_, span)| span.clone()),
            )
            .collect();
        if spans.is_empty() {
            return Ok(());
        }
        spans.sort_by_key(|span| span.start);
        let mut out = String::with_capacity(opf.len());
        let mut cursor = 0;
        for span in spans {
            out.push_str(&opf[cursor..span.start]);
            cursor = skip_line_break(&opf, span.end);
        }
        out.push_str(&opf[cursor..]);
        self.write_opf(&out)
    }

    fn register(&self, href: &str, media_type: &str, basename: &str) -> Result<String, SubfontError> {
        let opf = self.read_opf()?;
        let manifest = parse_manifest(&opf)?;
        let Some(insert_at) = manifest.manifest_end else {
            return Err(SubfontError::new(
                ErrorPhase::Bundle,
                "BUNDLE_BAD_OPF",
                "OPF has no </manifest> end tag",
            )
            .with_path(self.opf_path.clone()));
        };
        let mut id = manifest_id_for(basename);
        while manifest.items.iter().any(|item| item.id == id) {
            id.push('_');
        }
        let rel_href = percent_encode(&relative_to_opf(&self.opf_path, href));
        let item = format!(
            "<item id=\"{}\" href=\"{}\" media-type=\"{}\"/>\n",
            escape(id.as_str()),
            escape(rel_href.as_str()),
            escape(media_type)
        );
        let mut out = String::with_capacity(opf.len() + item.len());
        out.push_str(&opf[..insert_at]);
        out.push_str(&item);
        out.push_str(&opf[insert_at..]);
        self.write_opf(&out)?;
        Ok(id)
    }
}

impl Bundle for DirBundle {
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
        fs::read_to_string(self.file_path(&entry.resource.href))
            .map_err(|err| SubfontError::io(entry.resource.href.clone(), &err))
    }

    fn read_binary(&self, resource: &Resource) -> Result<Vec<u8>, SubfontError> {
        let entry = self.entry(resource)?;
        fs::read(self.file_path(&entry.resource.href))
            .map_err(|err| SubfontError::io(entry.resource.href.clone(), &err))
    }

    fn write_text(&mut self, resource: &Resource, content: &str) -> Result<(), SubfontError> {
        self.write_binary(resource, content.as_bytes())
    }

    fn write_binary(&mut self, resource: &Resource, content: &[u8]) -> Result<(), SubfontError> {
        let entry = self.entry(resource)?;
        fs::write(self.file_path(&entry.resource.href), content)
            .map_err(|err| SubfontError::io(entry.resource.href.clone(), &err))
    }

    fn delete_resource(&mut self, resource: &Resource) -> Result<(), SubfontError> {
        let entry = self.entry(resource)?.clone();
        let path = self.file_path(&entry.resource.href);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("{} already missing on disk", entry.resource.href);
            }
            Err(err) => return Err(SubfontError::io(entry.resource.href.clone(), &err)),
        }
        if let Some(id) = entry.manifest_id.as_deref() {
            self.unregister(id)?;
        }
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
            .map(|entry| entry.resource.href.as_str())
            .or(Some(self.opf_path.as_str()))
            .and_then(|href| href.rsplit_once('/'))
            .map(|(dir, _)| dir.to_string());
        let href = match dir {
            Some(dir) => format!("{}/{}", dir, name),
            None => name.to_string(),
        };

        let path = self.file_path(&href);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| SubfontError::io(href.clone(), &err))?;
        }
        fs::write(&path, content).map_err(|err| SubfontError::io(href.clone(), &err))?;

        let manifest_id = if register_in_manifest {
            Some(self.register(&href, ResourceKind::media_type_for(&href), basename(&href))?)
        } else {
            None
        };
        let resource = Resource {
            id: ResourceId(self.entries.len() as u32),
            href,
            kind,
        };
        self.entries.push(Some(DirEntry {
            resource: resource.clone(),
            manifest_id,
        }));
        Ok(resource)
    }
}

fn find_opf_fallback(root: &Path) -> Option<String> {
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let Ok(dir) = fs::read_dir(root.join(&rel)) else {
            continue;
        };
        let mut names: Vec<_> = dir.flatten().collect();
        names.sort_by_key(|entry| entry.file_name());
        for entry in names {
            let child = rel.join(entry.file_name());
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                stack.push(child);
            } else if child
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("opf"))
            {
                return Some(child.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    None
}

fn skip_line_break(text: &str, mut pos: usize) -> usize {
    let bytes = text.as_bytes();
    if bytes.get(pos) == Some(&b'\r') {
        pos += 1;
    }
    if bytes.get(pos) == Some(&b'\n') {
        pos += 1;
    }
    pos
}

fn manifest_id_for(basename: &str) -> String {
    let mut id: String = basename
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if !id.starts_with(|ch: char| ch.is_alphabetic() || ch == '_') {
        id.insert(0, '_');
    }
    id
}

fn relative_to_opf(opf_path: &str, href: &str) -> String {
    let opf_dir: Vec<&str> = opf_path
        .rsplit_once('/')
        .map(|(dir, _)| dir.split('/').collect())
        .unwrap_or_default();
    let target: Vec<&str> = href.split('/').collect();
    let common = opf_dir
        .iter()
        .zip(&target)
        .take_while(|(a, b)| a == b)
        .count();
    let mut parts: Vec<&str> = Vec::with_capacity(opf_dir.len() + target.len());
    parts.extend(std::iter::repeat("..").take(opf_dir.len() - common));
    parts.extend(&target[common..]);
    parts.join("/")
}
