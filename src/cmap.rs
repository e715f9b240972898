//! Font container sniffing, cmap extraction and sfnt rebuilding.
//!
//! Coverage is read through `ttf-parser`. The byte-level helpers here only
//! deal with containers: splitting a face out of a collection and inflating
//! WOFF 1.0 tables back into a plain sfnt.

use std::collections::BTreeSet;

use crate::bundle::Resource;
use crate::error::{ErrorPhase, SubfontError};
use crate::subfont::FontLimits;

const TAG_HEAD: [u8; 4] = *b"head";
const SFNT_HEADER_LEN: usize = 12;
const SFNT_RECORD_LEN: usize = 16;
const WOFF_HEADER_LEN: usize = 44;
const WOFF_RECORD_LEN: usize = 20;
const CHECKSUM_MAGIC: u32 = 0xB1B0_AFBA;

/// On-disk font format, by signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FontFormat {
    /// Bare TrueType or CFF sfnt.
    Sfnt,
    /// TrueType/OpenType collection (`ttcf`).
    Collection,
    /// WOFF 1.0.
    Woff,
    /// WOFF 2.0 (recognized, not decoded).
    Woff2,
}

/// Detect the format from the leading signature.
pub fn detect_format(data: &[u8]) -> Option<FontFormat> {
    match data.get(..4)? {
        b"\x00\x01\x00\x00" | b"OTTO" | b"true" | b"typ1" => Some(FontFormat::Sfnt),
        b"ttcf" => Some(FontFormat::Collection),
        b"wOFF" => Some(FontFormat::Woff),
        b"wOF2" => Some(FontFormat::Woff2),
        _ => None,
    }
}

/// Face layout of a loaded resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FontContainer {
    /// One face.
    Single,
    /// Several faces sharing one file; coverage uses face 0.
    Collection {
        /// Number of faces.
        faces: u32,
    },
}

/// Font resource with the code points it can render.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FontResource {
    /// Bundle resource.
    pub resource: Resource,
    /// Detected format; `None` when the signature is unknown.
    pub format: Option<FontFormat>,
    /// Face layout.
    pub container: FontContainer,
    /// Unicode code points mapped to a non-zero glyph.
    pub cmap: BTreeSet<u32>,
    /// Why the font could not be read, if it could not.
    pub unreadable: Option<Box<str>>,
}

impl FontResource {
    /// Whether the cmap was read successfully.
    pub fn is_readable(&self) -> bool {
        self.unreadable.is_none()
    }

    /// Whether subsetting produces a different container than the source,
    /// so the resource has to be renamed.
    pub fn changes_container(&self) -> bool {
        !matches!(self.format, Some(FontFormat::Sfnt))
            || matches!(self.container, FontContainer::Collection { .. })
    }

    fn unreadable(resource: Resource, format: Option<FontFormat>, err: &SubfontError) -> Self {
        log::warn!("font {} unreadable: {}", resource.href, err);
        Self {
            resource,
            format,
            container: FontContainer::Single,
            cmap: BTreeSet::new(),
            unreadable: Some(err.message.clone()),
        }
    }
}

/// Load `data` as the font behind `resource`. Never fails: unreadable
/// fonts come back with an empty cmap and a reason.
pub fn load_font(resource: Resource, data: &[u8], limits: &FontLimits) -> FontResource {
    let format = detect_format(data);
    if data.len() > limits.max_bytes_per_font {
        let err = SubfontError::new(ErrorPhase::Font, "FONT_TOO_LARGE", "font exceeds size limit")
            .with_path(resource.href.clone())
            .with_limit("max_bytes_per_font", data.len(), limits.max_bytes_per_font);
        return FontResource::unreadable(resource, format, &err);
    }
    match read_coverage(data, format, limits) {
        Ok((container, cmap)) => {
            log::debug!(
                "font {}: {:?} {:?}, {} mapped code points",
                resource.href,
                format,
                container,
                cmap.len()
            );
            FontResource {
                resource,
                format,
                container,
                cmap,
                unreadable: None,
            }
        }
        Err(err) => {
            let err = err.with_path(resource.href.clone());
            FontResource::unreadable(resource, format, &err)
        }
    }
}

fn read_coverage(
    data: &[u8],
    format: Option<FontFormat>,
    limits: &FontLimits,
) -> Result<(FontContainer, BTreeSet<u32>), SubfontError> {
    match format {
        Some(FontFormat::Sfnt) => Ok((FontContainer::Single, cmap_codepoints(data, 0)?)),
        Some(FontFormat::Collection) => {
            let faces = ttf_parser::fonts_in_collection(data).ok_or_else(|| {
                SubfontError::new(ErrorPhase::Font, "FONT_PARSE", "malformed collection header")
            })?;
            if faces == 0 {
                return Err(SubfontError::new(
                    ErrorPhase::Font,
                    "FONT_PARSE",
                    "collection has no faces",
                ));
            }
            if faces as usize > limits.max_faces {
                return Err(SubfontError::new(
                    ErrorPhase::Font,
                    "FONT_TOO_MANY_FACES",
                    "collection exceeds face limit",
                )
                .with_limit("max_faces", faces as usize, limits.max_faces));
            }
            Ok((FontContainer::Collection { faces }, cmap_codepoints(data, 0)?))
        }
        Some(FontFormat::Woff) => {
            let sfnt = unwrap_woff(data)?;
            Ok((FontContainer::Single, cmap_codepoints(&sfnt, 0)?))
        }
        Some(FontFormat::Woff2) => Err(SubfontError::new(
            ErrorPhase::Font,
            "FONT_UNSUPPORTED",
            "WOFF2 fonts cannot be decoded",
        )),
        None => Err(SubfontError::new(
            ErrorPhase::Font,
            "FONT_PARSE",
            "unknown font signature",
        )),
    }
}

/// Unicode code points that face `index` maps to a non-zero glyph.
pub fn cmap_codepoints(data: &[u8], index: u32) -> Result<BTreeSet<u32>, SubfontError> {
    let face = ttf_parser::Face::parse(data, index).map_err(|err| {
        SubfontError::new(ErrorPhase::Font, "FONT_PARSE", format!("face {}: {}", index, err))
    })?;
    let mut out = BTreeSet::new();
    let Some(cmap) = face.tables().cmap else {
        return Ok(out);
    };
    for subtable in cmap.subtables {
        if !subtable.is_unicode() {
            continue;
        }
        subtable.codepoints(|cp| {
            if subtable.glyph_index(cp).is_some_and(|gid| gid.0 != 0) {
                out.insert(cp);
            }
        });
    }
    Ok(out)
}

/// Sfnt bytes ready for a subsetting job: WOFF is inflated, everything
/// else is returned as-is (collections keep all faces).
pub fn sfnt_source(data: &[u8]) -> Result<Vec<u8>, SubfontError> {
    match detect_format(data) {
        Some(FontFormat::Woff) => unwrap_woff(data),
        Some(FontFormat::Sfnt | FontFormat::Collection) => Ok(data.to_vec()),
        Some(FontFormat::Woff2) | None => Err(SubfontError::new(
            ErrorPhase::Font,
            "FONT_UNSUPPORTED",
            "font container cannot be converted to sfnt",
        )),
    }
}

/// Copy face `index` of a collection into a standalone sfnt.
///
/// Jobs hand collections to subsetters whole; in-process
/// [`FontSubsetter`](crate::coordinator::FontSubsetter) implementations use
/// this to pull out `SubsetJob::face_index` themselves.
pub fn extract_face(data: &[u8], index: u32) -> Result<Vec<u8>, SubfontError> {
    let parse_err = |msg: &str| SubfontError::new(ErrorPhase::Font, "FONT_PARSE", msg.to_string());
    if data.get(..4) != Some(&b"ttcf"[..]) {
        return Err(parse_err("not a font collection"));
    }
    let num_fonts = be_u32(data, 8).ok_or_else(|| parse_err("truncated collection header"))?;
    if index >= num_fonts {
        return Err(parse_err("face index out of range"));
    }
    let face_offset = be_u32(data, 12 + index as usize * 4)
        .ok_or_else(|| parse_err("truncated collection offsets"))? as usize;
    let flavor = be_u32(data, face_offset).ok_or_else(|| parse_err("truncated face header"))?;
    let num_tables =
        be_u16(data, face_offset + 4).ok_or_else(|| parse_err("truncated face header"))? as usize;

    let mut tables = Vec::with_capacity(num_tables);
    for idx in 0..num_tables {
        let record = face_offset + SFNT_HEADER_LEN + idx * SFNT_RECORD_LEN;
        let tag = data
            .get(record..record + 4)
            .ok_or_else(|| parse_err("truncated table record"))?;
        let offset = be_u32(data, record + 8).ok_or_else(|| parse_err("truncated table record"))?;
        let length = be_u32(data, record + 12).ok_or_else(|| parse_err("truncated table record"))?;
        let start = offset as usize;
        let end = start
            .checked_add(length as usize)
            .ok_or_else(|| parse_err("table length overflow"))?;
        let body = data
            .get(start..end)
            .ok_or_else(|| parse_err("table outside collection bounds"))?;
        tables.push(([tag[0], tag[1], tag[2], tag[3]], body.to_vec()));
    }
    Ok(build_sfnt(flavor, tables))
}

/// Inflate a WOFF 1.0 file into the sfnt it wraps.
pub fn unwrap_woff(data: &[u8]) -> Result<Vec<u8>, SubfontError> {
    let parse_err = |msg: &str| SubfontError::new(ErrorPhase::Font, "FONT_PARSE", msg.to_string());
    if data.get(..4) != Some(&b"wOFF"[..]) || data.len() < WOFF_HEADER_LEN {
        return Err(parse_err("not a WOFF file"));
    }
    let flavor = be_u32(data, 4).ok_or_else(|| parse_err("truncated WOFF header"))?;
    let num_tables = be_u16(data, 12).ok_or_else(|| parse_err("truncated WOFF header"))? as usize;

    let mut tables = Vec::with_capacity(num_tables);
    for idx in 0..num_tables {
        let record = WOFF_HEADER_LEN + idx * WOFF_RECORD_LEN;
        let tag = data
            .get(record..record + 4)
            .ok_or_else(|| parse_err("truncated WOFF directory"))?;
        let offset = be_u32(data, record + 4).ok_or_else(|| parse_err("truncated WOFF directory"))?;
        let comp_len =
            be_u32(data, record + 8).ok_or_else(|| parse_err("truncated WOFF directory"))?;
        let orig_len =
            be_u32(data, record + 12).ok_or_else(|| parse_err("truncated WOFF directory"))?;
        let start = offset as usize;
        let end = start
            .checked_add(comp_len as usize)
            .ok_or_else(|| parse_err("table length overflow"))?;
        let stored = data
            .get(start..end)
            .ok_or_else(|| parse_err("WOFF table outside file bounds"))?;
        let body = if comp_len < orig_len {
            miniz_oxide::inflate::decompress_to_vec_zlib(stored).map_err(|err| {
                SubfontError::new(
                    ErrorPhase::Font,
                    "FONT_PARSE",
                    format!("WOFF table inflate failed: {:?}", err.status),
                )
            })?
        } else {
            stored.to_vec()
        };
        if body.len() != orig_len as usize {
            return Err(parse_err("WOFF table length mismatch"));
        }
        tables.push(([tag[0], tag[1], tag[2], tag[3]], body));
    }
    Ok(build_sfnt(flavor, tables))
}

/// Serialize tables into an sfnt with a sorted, 4-byte aligned table
/// directory and a recomputed `head.checkSumAdjustment`.
pub fn build_sfnt(flavor: u32, mut tables: Vec<([u8; 4], Vec<u8>)>) -> Vec<u8> {
    tables.sort_by(|a, b| a.0.cmp(&b.0));
    if let Some((_, head)) = tables.iter_mut().find(|(tag, _)| *tag == TAG_HEAD) {
        if let Some(adjustment) = head.get_mut(8..12) {
            adjustment.fill(0);
        }
    }

    let num_tables = tables.len() as u16;
    let entry_selector = if num_tables > 0 {
        15 - num_tables.leading_zeros() as u16
    } else {
        0
    };
    let search_range = (1u16 << entry_selector) * 16;
    let range_shift = (num_tables * 16).saturating_sub(search_range);

    let mut out = Vec::with_capacity(
        SFNT_HEADER_LEN
            + tables.len() * SFNT_RECORD_LEN
            + tables.iter().map(|(_, body)| padded_len(body.len())).sum::<usize>(),
    );
    out.extend_from_slice(&flavor.to_be_bytes());
    out.extend_from_slice(&num_tables.to_be_bytes());
    out.extend_from_slice(&search_range.to_be_bytes());
    out.extend_from_slice(&entry_selector.to_be_bytes());
    out.extend_from_slice(&range_shift.to_be_bytes());

    let mut offset = SFNT_HEADER_LEN + tables.len() * SFNT_RECORD_LEN;
    let mut head_offset = None;
    for (tag, body) in &tables {
        if *tag == TAG_HEAD {
            head_offset = Some(offset);
        }
        out.extend_from_slice(tag);
        out.extend_from_slice(&table_checksum(body).to_be_bytes());
        out.extend_from_slice(&(offset as u32).to_be_bytes());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        offset += padded_len(body.len());
    }
    for (_, body) in &tables {
        out.extend_from_slice(body);
        out.resize(padded_len(out.len()), 0);
    }

    if let Some(head) = head_offset {
        let adjustment = CHECKSUM_MAGIC.wrapping_sub(table_checksum(&out));
        if let Some(slot) = out.get_mut(head + 8..head + 12) {
            slot.copy_from_slice(&adjustment.to_be_bytes());
        }
    }
    out
}

/// Whether the sfnt carries CFF outlines.
pub fn is_cff(data: &[u8]) -> bool {
    data.get(..4) == Some(&b"OTTO"[..])
}

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

fn table_checksum(data: &[u8]) -> u32 {
    data.chunks(4).fold(0u32, |sum, chunk| {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        sum.wrapping_add(u32::from_be_bytes(word))
    })
}

/// Locate a table in a bare sfnt.
pub fn find_sfnt_table(data: &[u8], tag: [u8; 4]) -> Option<&[u8]> {
    let num_tables = be_u16(data, 4)? as usize;
    let directory_len = SFNT_HEADER_LEN.checked_add(num_tables.checked_mul(SFNT_RECORD_LEN)?)?;
    if directory_len > data.len() {
        return None;
    }

    for idx in 0..num_tables {
        let record_offset = SFNT_HEADER_LEN + idx * SFNT_RECORD_LEN;
        let record_tag = data.get(record_offset..record_offset + 4)?;
        if record_tag != tag {
            continue;
        }
        let table_offset = be_u32(data, record_offset + 8)? as usize;
        let table_length = be_u32(data, record_offset + 12)? as usize;
        let table_end = table_offset.checked_add(table_length)?;
        return data.get(table_offset..table_end);
    }
    None
}

fn be_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn be_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{ResourceId, ResourceKind};

    fn resource(href: &str) -> Resource {
        Resource {
            id: ResourceId(0),
            href: href.to_string(),
            kind: ResourceKind::Font,
        }
    }

    #[test]
    fn detects_signatures() {
        assert_eq!(detect_format(&[0, 1, 0, 0, 9]), Some(FontFormat::Sfnt));
        assert_eq!(detect_format(b"OTTO...."), Some(FontFormat::Sfnt));
        assert_eq!(detect_format(b"ttcf...."), Some(FontFormat::Collection));
        assert_eq!(detect_format(b"wOFF...."), Some(FontFormat::Woff));
        assert_eq!(detect_format(b"wOF2...."), Some(FontFormat::Woff2));
        assert_eq!(detect_format(b"PK\x03\x04"), None);
        assert_eq!(detect_format(b"ab"), None);
    }

    #[test]
    fn build_sfnt_aligns_tables_and_fixes_head_checksum() {
        let head = vec![0x11u8; 54];
        let out = build_sfnt(
            0x0001_0000,
            vec![(*b"zzzz", vec![1, 2, 3]), (TAG_HEAD, head.clone())],
        );
        assert_eq!(be_u16(&out, 4), Some(2));
        // Directory is sorted by tag.
        assert_eq!(&out[12..16], b"head");
        assert_eq!(&out[28..32], b"zzzz");
        assert_eq!(out.len() % 4, 0);
        let stored_head = find_sfnt_table(&out, TAG_HEAD).expect("head table");
        assert_eq!(stored_head.len(), 54);
        assert_eq!(&stored_head[..8], &head[..8]);
        assert_eq!(table_checksum(&out), CHECKSUM_MAGIC);
        assert_eq!(find_sfnt_table(&out, *b"zzzz"), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn garbage_is_unreadable_not_fatal() {
        let font = load_font(resource("a.ttf"), b"not a font at all", &FontLimits::default());
        assert!(!font.is_readable());
        assert!(font.cmap.is_empty());

        let font = load_font(resource("b.woff2"), b"wOF2\0\0\0\0", &FontLimits::default());
        assert_eq!(font.format, Some(FontFormat::Woff2));
        assert!(!font.is_readable());
    }

    #[test]
    fn oversized_font_is_unreadable() {
        let limits = FontLimits {
            max_bytes_per_font: 4,
            ..FontLimits::default()
        };
        let font = load_font(resource("a.ttf"), &[0, 1, 0, 0, 0, 0], &limits);
        assert!(font.unreadable.is_some());
    }

    #[test]
    fn extract_face_rejects_non_collections() {
        assert!(extract_face(&[0, 1, 0, 0], 0).is_err());
        let mut ttc = b"ttcf".to_vec();
        ttc.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        ttc.extend_from_slice(&1u32.to_be_bytes());
        ttc.extend_from_slice(&16u32.to_be_bytes());
        assert!(extract_face(&ttc, 3).is_err());
    }
}
