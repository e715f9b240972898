use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use epub_subfont::cmap::build_sfnt;
use epub_subfont::MemoryBundle;

const TRUETYPE: u32 = 0x0001_0000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn points(text: &str) -> BTreeSet<u32> {
    text.chars().map(u32::from).collect()
}

/// Minimal TrueType font whose cmap maps every char of `chars`.
pub fn sfnt_font(chars: &str) -> Vec<u8> {
    build_sfnt(TRUETYPE, font_tables(&points(chars)))
}

/// Same tables as [`sfnt_font`] with a CFF flavor tag.
pub fn cff_font(chars: &str) -> Vec<u8> {
    build_sfnt(u32::from_be_bytes(*b"OTTO"), font_tables(&points(chars)))
}

fn font_tables(codepoints: &BTreeSet<u32>) -> Vec<([u8; 4], Vec<u8>)> {
    let num_glyphs = codepoints.len() as u16 + 1;
    vec![
        (*b"cmap", cmap_format12(codepoints)),
        (*b"head", head_table()),
        (*b"hhea", hhea_table()),
        (*b"maxp", maxp_table(num_glyphs)),
    ]
}

fn cmap_format12(codepoints: &BTreeSet<u32>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&3u16.to_be_bytes());
    out.extend_from_slice(&10u16.to_be_bytes());
    out.extend_from_slice(&12u32.to_be_bytes());

    let groups = codepoints.len() as u32;
    out.extend_from_slice(&12u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&(16 + groups * 12).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&groups.to_be_bytes());
    for (glyph, cp) in codepoints.iter().enumerate() {
        out.extend_from_slice(&cp.to_be_bytes());
        out.extend_from_slice(&cp.to_be_bytes());
        out.extend_from_slice(&(glyph as u32 + 1).to_be_bytes());
    }
    out
}

fn head_table() -> Vec<u8> {
    let mut head = vec![0u8; 54];
    head[0..4].copy_from_slice(&TRUETYPE.to_be_bytes());
    head[4..8].copy_from_slice(&TRUETYPE.to_be_bytes());
    head[12..16].copy_from_slice(&0x5F0F_3CF5u32.to_be_bytes());
    head[18..20].copy_from_slice(&1000u16.to_be_bytes());
    head
}

fn hhea_table() -> Vec<u8> {
    let mut hhea = vec![0u8; 36];
    hhea[0..4].copy_from_slice(&TRUETYPE.to_be_bytes());
    hhea[4..6].copy_from_slice(&800i16.to_be_bytes());
    hhea[6..8].copy_from_slice(&(-200i16).to_be_bytes());
    hhea[34..36].copy_from_slice(&1u16.to_be_bytes());
    hhea
}

fn maxp_table(num_glyphs: u16) -> Vec<u8> {
    let mut maxp = 0x0000_5000u32.to_be_bytes().to_vec();
    maxp.extend_from_slice(&num_glyphs.to_be_bytes());
    maxp
}

/// Pack standalone sfnt faces into one `ttcf` collection.
pub fn collection(faces: &[Vec<u8>]) -> Vec<u8> {
    let header_len = 12 + faces.len() * 4;
    let mut out = b"ttcf".to_vec();
    out.extend_from_slice(&TRUETYPE.to_be_bytes());
    out.extend_from_slice(&(faces.len() as u32).to_be_bytes());

    let mut base = header_len;
    let mut bodies = Vec::with_capacity(faces.len());
    for face in faces {
        out.extend_from_slice(&(base as u32).to_be_bytes());
        let mut face = face.clone();
        let num_tables = u16::from_be_bytes([face[4], face[5]]) as usize;
        for idx in 0..num_tables {
            let at = 12 + idx * 16 + 8;
            let offset = u32::from_be_bytes([face[at], face[at + 1], face[at + 2], face[at + 3]]);
            face[at..at + 4].copy_from_slice(&(offset + base as u32).to_be_bytes());
        }
        base += face.len();
        bodies.push(face);
    }
    for body in bodies {
        out.extend_from_slice(&body);
    }
    out
}

/// Wrap an sfnt in a WOFF 1.0 container, compressing tables that shrink.
pub fn woff(sfnt: &[u8]) -> Vec<u8> {
    let num_tables = u16::from_be_bytes([sfnt[4], sfnt[5]]) as usize;
    let mut tables = Vec::with_capacity(num_tables);
    for idx in 0..num_tables {
        let record = &sfnt[12 + idx * 16..12 + idx * 16 + 16];
        let checksum = u32::from_be_bytes([record[4], record[5], record[6], record[7]]);
        let offset = u32::from_be_bytes([record[8], record[9], record[10], record[11]]) as usize;
        let length = u32::from_be_bytes([record[12], record[13], record[14], record[15]]) as usize;
        let body = &sfnt[offset..offset + length];
        let packed = miniz_oxide::deflate::compress_to_vec_zlib(body, 6);
        let stored = if packed.len() < body.len() {
            packed
        } else {
            body.to_vec()
        };
        tables.push(([record[0], record[1], record[2], record[3]], checksum, length, stored));
    }

    let mut offset = 44 + num_tables * 20;
    let mut directory = Vec::new();
    let mut data = Vec::new();
    for (tag, checksum, length, stored) in &tables {
        directory.extend_from_slice(tag);
        directory.extend_from_slice(&(offset as u32).to_be_bytes());
        directory.extend_from_slice(&(stored.len() as u32).to_be_bytes());
        directory.extend_from_slice(&(*length as u32).to_be_bytes());
        directory.extend_from_slice(&checksum.to_be_bytes());
        data.extend_from_slice(stored);
        while data.len() % 4 != 0 {
            data.push(0);
        }
        offset = 44 + num_tables * 20 + data.len();
    }

    let total = 44 + directory.len() + data.len();
    let mut out = b"wOFF".to_vec();
    out.extend_from_slice(&sfnt[0..4]);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&(num_tables as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&(sfnt.len() as u32).to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&[0u8; 20]);
    out.extend_from_slice(&directory);
    out.extend_from_slice(&data);
    out
}

pub fn xhtml(head: &str, body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>t</title>{}</head><body>{}</body></html>",
        head, body
    )
}

pub fn stylesheet_link(href: &str) -> String {
    format!("<link rel=\"stylesheet\" type=\"text/css\" href=\"{}\"/>", href)
}

pub fn font_face(family: &str, src: &str) -> String {
    format!("@font-face {{ font-family: \"{}\"; src: url({}); }}\n", family, src)
}

/// Bundle with one stylesheet at `OEBPS/Styles/main.css` linked from one
/// chapter at `OEBPS/Text/c1.xhtml`, plus `fonts` under `OEBPS/Fonts/`.
pub fn book(css: &str, body: &str, fonts: &[(&str, Vec<u8>)]) -> MemoryBundle {
    let mut bundle = MemoryBundle::new();
    for (name, bytes) in fonts {
        bundle.insert(format!("OEBPS/Fonts/{}", name), bytes.clone());
    }
    bundle.insert("OEBPS/Styles/main.css", css);
    bundle.insert(
        "OEBPS/Text/c1.xhtml",
        xhtml(&stylesheet_link("../Styles/main.css"), body),
    );
    bundle
}

/// Unpacked EPUB directories dropped under `tests/fixtures/corpus`.
pub fn discover_optional_corpus() -> Vec<PathBuf> {
    let root = Path::new("tests/fixtures/corpus");
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.join("META-INF").join("container.xml").is_file())
        .collect();
    out.sort();
    out
}
