use std::alloc::{GlobalAlloc, Layout, System};
use std::collections::BTreeSet;
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use epub_subfont::cmap::build_sfnt;
use epub_subfont::{
    allocate, load_font, resolve_document, subset_fonts, Bundle, Document, FontCatalog,
    FontLimits, GlyphDemand, MarkupLimits, MemoryBundle, ResourceKind, StylesheetIndex,
    SubfontError, SubfontOptions, SubsetJob, SubsetOutput,
};

/// (name, chapters, paragraphs per chapter)
const BOOKS: &[(&str, usize, usize)] = &[
    ("novella", 4, 200),
    ("novel", 24, 400),
    ("omnibus", 60, 800),
];

const CSS: &str = "
@font-face { font-family: Song; src: url(../Fonts/song.ttf); }
@font-face { font-family: Kai; src: url(../Fonts/kai.ttf); }
@font-face { font-family: Hei; src: url(../Fonts/hei.ttf); }
body { font-family: Song, serif; }
h1, h2 { font-family: Hei, Song; }
p.verse { font-family: Kai, inherit; }
div.note > p { font-family: Hei !important; }
em { font-family: unset; }
code { font-family: Courier, monospace; }
";

struct TrackingAllocator;

static LIVE_BYTES: AtomicUsize = AtomicUsize::new(0);
static PEAK_BYTES: AtomicUsize = AtomicUsize::new(0);

#[global_allocator]
static GLOBAL_ALLOCATOR: TrackingAllocator = TrackingAllocator;

fn live_bytes() -> usize {
    LIVE_BYTES.load(Ordering::Relaxed)
}

fn reset_peak() -> usize {
    let live = live_bytes();
    PEAK_BYTES.store(live, Ordering::Relaxed);
    live
}

fn grow(bytes: usize) {
    let live = LIVE_BYTES.fetch_add(bytes, Ordering::Relaxed) + bytes;
    PEAK_BYTES.fetch_max(live, Ordering::Relaxed);
}

fn shrink(bytes: usize) {
    let _ = LIVE_BYTES.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |live| {
        Some(live.saturating_sub(bytes))
    });
}

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            grow(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
        shrink(layout.size());
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            grow(layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            shrink(layout.size());
            grow(new_size);
        }
        new_ptr
    }
}

struct CaseResult {
    book: &'static str,
    case: &'static str,
    iterations: usize,
    min_ns: u128,
    median_ns: u128,
    max_ns: u128,
    median_peak_heap_bytes: usize,
    max_peak_heap_bytes: usize,
}

fn percentile<T: Copy>(sorted: &[T], percentile: f64) -> T {
    let idx = ((sorted.len().saturating_sub(1) as f64) * percentile).round() as usize;
    sorted[idx]
}

fn run_case<F>(
    book: &'static str,
    case: &'static str,
    warmup_iters: usize,
    measure_iters: usize,
    mut op: F,
) -> CaseResult
where
    F: FnMut() -> usize,
{
    for _ in 0..warmup_iters {
        black_box(op());
    }

    let mut time_samples = Vec::with_capacity(measure_iters);
    let mut mem_samples = Vec::with_capacity(measure_iters);
    for _ in 0..measure_iters {
        let baseline = reset_peak();
        let start = Instant::now();
        black_box(op());
        time_samples.push(start.elapsed().as_nanos());
        mem_samples.push(PEAK_BYTES.load(Ordering::Relaxed).saturating_sub(baseline));
    }
    time_samples.sort_unstable();
    mem_samples.sort_unstable();

    CaseResult {
        book,
        case,
        iterations: measure_iters,
        min_ns: time_samples[0],
        median_ns: percentile(&time_samples, 0.5),
        max_ns: time_samples[time_samples.len() - 1],
        median_peak_heap_bytes: percentile(&mem_samples, 0.5),
        max_peak_heap_bytes: mem_samples[mem_samples.len() - 1],
    }
}

fn chapter(idx: usize, paragraphs: usize) -> String {
    let mut body = format!("<h1>第{}章 Chapter {}</h1>", idx + 1, idx + 1);
    for p in 0..paragraphs {
        match p % 5 {
            0 => body.push_str(&format!("<p class=\"verse\">春眠不觉晓 处处闻啼鸟 {}</p>", p)),
            1 => body.push_str("<div class=\"note\"><p>注释 note <em>强调</em></p></div>"),
            2 => body.push_str("<p>The quick brown fox <code>fn main()</code> jumps.</p>"),
            _ => body.push_str(&format!(
                "<p>夜来风雨声，花落知多少。Paragraph {} of chapter {}.</p>",
                p, idx
            )),
        }
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?><html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>c</title><link rel=\"stylesheet\" href=\"../Styles/main.css\"/></head><body>{}</body></html>",
        body
    )
}

/// TrueType font with a format 12 cmap and nothing else a parser needs.
fn font(chars: &BTreeSet<u32>) -> Vec<u8> {
    let mut cmap = Vec::new();
    for value in [0u16, 1, 3, 10] {
        cmap.extend_from_slice(&value.to_be_bytes());
    }
    cmap.extend_from_slice(&12u32.to_be_bytes());
    cmap.extend_from_slice(&12u16.to_be_bytes());
    cmap.extend_from_slice(&0u16.to_be_bytes());
    cmap.extend_from_slice(&(16 + chars.len() as u32 * 12).to_be_bytes());
    cmap.extend_from_slice(&0u32.to_be_bytes());
    cmap.extend_from_slice(&(chars.len() as u32).to_be_bytes());
    for (glyph, cp) in chars.iter().enumerate() {
        cmap.extend_from_slice(&cp.to_be_bytes());
        cmap.extend_from_slice(&cp.to_be_bytes());
        cmap.extend_from_slice(&(glyph as u32 + 1).to_be_bytes());
    }

    let mut head = vec![0u8; 54];
    head[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    head[12..16].copy_from_slice(&0x5F0F_3CF5u32.to_be_bytes());
    head[18..20].copy_from_slice(&1000u16.to_be_bytes());
    let mut hhea = vec![0u8; 36];
    hhea[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    hhea[34..36].copy_from_slice(&1u16.to_be_bytes());
    let mut maxp = 0x0000_5000u32.to_be_bytes().to_vec();
    maxp.extend_from_slice(&(chars.len() as u16 + 1).to_be_bytes());

    build_sfnt(
        0x0001_0000,
        vec![(*b"cmap", cmap), (*b"head", head), (*b"hhea", hhea), (*b"maxp", maxp)],
    )
}

fn synthetic_book(chapters: usize, paragraphs: usize) -> (MemoryBundle, Vec<String>) {
    let texts: Vec<String> = (0..chapters).map(|idx| chapter(idx, paragraphs)).collect();
    let mut han: BTreeSet<u32> = (0x4E00u32..0x4E00 + 3000).collect();
    han.extend(texts.iter().flat_map(|t| t.chars().map(u32::from)));
    let latin: BTreeSet<u32> = (0x20u32..0x7F).collect();

    let mut bundle = MemoryBundle::new()
        .with_file("OEBPS/Fonts/song.ttf", font(&han))
        .with_file("OEBPS/Fonts/kai.ttf", font(&han))
        .with_file("OEBPS/Fonts/hei.ttf", font(&latin))
        .with_file("OEBPS/Styles/main.css", CSS);
    for (idx, text) in texts.iter().enumerate() {
        bundle.insert(format!("OEBPS/Text/c{:03}.xhtml", idx), text.as_str());
    }
    (bundle, texts)
}

fn no_subsetting(_: &SubsetJob) -> Result<SubsetOutput, SubfontError> {
    unreachable!("benchmarks only dry-run")
}

fn main() {
    let quick = std::env::args().any(|arg| arg == "--quick");
    let warmup_iters = if quick { 1 } else { 2 };
    let measure_iters = if quick { 3 } else { 10 };

    println!("# epub-subfont benchmark");
    println!(
        "# mode={} warmup_iters={} measure_iters={}",
        if quick { "quick" } else { "full" },
        warmup_iters,
        measure_iters
    );
    println!("book,case,iterations,min_ns,median_ns,max_ns,median_peak_heap_bytes,max_peak_heap_bytes");

    let sheet = Arc::new(StylesheetIndex::parse(CSS, |_| None, |_| None));
    let mut results = Vec::new();
    for &(name, chapters, paragraphs) in BOOKS {
        let (bundle, texts) = synthetic_book(chapters, paragraphs);

        results.push(run_case(name, "parse_markup", warmup_iters, measure_iters, || {
            texts
                .iter()
                .map(|text| Document::parse("c.xhtml", text, MarkupLimits::default()).len())
                .sum()
        }));

        let docs: Vec<Document> = texts
            .iter()
            .map(|text| Document::parse("c.xhtml", text, MarkupLimits::default()))
            .collect();
        results.push(run_case(name, "resolve_cascade", warmup_iters, measure_iters, || {
            docs.iter()
                .map(|doc| resolve_document(doc, std::slice::from_ref(&sheet)).chains().len())
                .sum()
        }));

        let mut demand = GlyphDemand::new();
        for doc in &docs {
            let resolved = resolve_document(doc, std::slice::from_ref(&sheet));
            demand.merge(GlyphDemand::from_document(doc, &resolved));
        }
        let fonts = bundle
            .iter_by_kind(&[ResourceKind::Font])
            .into_iter()
            .map(|resource| {
                let bytes = bundle.get(&resource.href).unwrap_or_default().to_vec();
                load_font(resource, &bytes, &FontLimits::default())
            })
            .collect::<Vec<_>>();
        let mut catalog = FontCatalog::new(fonts);
        let indexed = StylesheetIndex::parse(CSS, |_| None, |url| bundle.lookup_by_basename(url));
        for face in &indexed.font_faces {
            catalog.declare(face);
        }
        results.push(run_case(name, "allocate", warmup_iters, measure_iters, || {
            allocate(&catalog, &demand).per_font.len()
        }));

        results.push(run_case(name, "full_dry_run", warmup_iters, measure_iters, || {
            let mut copy = bundle.clone();
            let options = SubfontOptions {
                dry_run: true,
                ..SubfontOptions::default()
            };
            subset_fonts(&mut copy, &no_subsetting, &options)
                .unwrap_or_else(|e| panic!("dry run failed: {}", e))
                .len()
        }));
    }

    for result in &results {
        println!(
            "{},{},{},{},{},{},{},{}",
            result.book,
            result.case,
            result.iterations,
            result.min_ns,
            result.median_ns,
            result.max_ns,
            result.median_peak_heap_bytes,
            result.max_peak_heap_bytes
        );
    }
}
