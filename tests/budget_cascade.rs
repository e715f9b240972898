mod common;

use std::sync::Arc;

use common::peak_alloc::PeakAlloc;
use epub_subfont::{resolve_document, Document, GlyphDemand, MarkupLimits, StylesheetIndex};

// A 4000-paragraph chapter resolves in a few MiB; keep the guardrail
// loose enough for allocator differences across platforms.
const CASCADE_BUDGET_BYTES: usize = 48 * 1024 * 1024;

#[global_allocator]
static ALLOC: PeakAlloc = PeakAlloc::new();

fn long_chapter(paragraphs: usize) -> String {
    let mut body = String::with_capacity(paragraphs * 96);
    for idx in 0..paragraphs {
        let class = match idx % 4 {
            0 => "verse",
            1 => "note",
            2 => "quote",
            _ => "plain",
        };
        body.push_str(&format!(
            "<div class=\"sec\"><p class=\"{}\" id=\"p{}\">第{}段 text <em>emphasis</em> <span lang=\"en\">tail</span></p></div>",
            class, idx, idx
        ));
    }
    format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>long</title></head><body>{}</body></html>",
        body
    )
}

const CSS: &str = "
body { font-family: Song, serif; }
.verse { font-family: Kai; }
div.sec > p.note { font-family: Hei, inherit; }
#p7 { font-family: Mono !important; }
em { font-family: initial; }
span[lang] { font-family: unset; }
";

#[test]
fn cascade_of_long_chapter_under_budget() {
    let text = long_chapter(4000);
    let sheet = Arc::new(StylesheetIndex::parse(CSS, |_| None, |_| None));

    let baseline = ALLOC.start_window();
    let doc = Document::parse("OEBPS/Text/long.xhtml", &text, MarkupLimits::default());
    let resolved = resolve_document(&doc, &[sheet]);
    let demand = GlyphDemand::from_document(&doc, &resolved);
    assert!(demand.len() >= 4, "expected several chains, got {}", demand.len());

    let peak = ALLOC.peak_bytes().saturating_sub(baseline);
    assert!(
        peak <= CASCADE_BUDGET_BYTES,
        "cascade peak over budget: {} bytes ({:.1}MiB), budget: {}MiB",
        peak,
        peak as f64 / (1024.0 * 1024.0),
        CASCADE_BUDGET_BYTES / (1024 * 1024)
    );
    println!(
        "cascade elements={} chains={} peak_kib={:.1} allocs={}",
        doc.len(),
        resolved.chains().len(),
        peak as f64 / 1024.0,
        ALLOC.allocations()
    );
}
