use std::path::PathBuf;
use std::process::ExitCode;

use epub_subfont::{subset_fonts, CommandSubsetter, DirBundle, FontAction, SubfontOptions};

fn usage() {
    eprintln!("Usage: epub-subfont [OPTIONS] <UNPACKED_EPUB_DIR>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --dry-run            Report decisions without modifying the book");
    eprintln!("  --jobs <N>           Worker threads (default: one per CPU)");
    eprintln!("  --subsetter <CMD>    pyftsubset-compatible command (default: pyftsubset)");
    eprintln!("  --safety <U+XXXX>    Code point kept in every subset (default: U+7684)");
    eprintln!();
    eprintln!("Set RUST_LOG=info (or debug) for progress output.");
}

fn parse_codepoint(text: &str) -> Option<u32> {
    let hex = text
        .strip_prefix("U+")
        .or_else(|| text.strip_prefix("u+"))
        .unwrap_or(text);
    u32::from_str_radix(hex, 16).ok()
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i) {
        Some(value) => value,
        None => {
            eprintln!("{} needs a value", flag);
            usage();
            std::process::exit(2);
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut options = SubfontOptions::default();
    let mut program = String::from("pyftsubset");
    let mut dir: Option<PathBuf> = None;
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--dry-run" => {
                options.dry_run = true;
            }
            "--jobs" => {
                i += 1;
                let raw = value_of(&args, i, "--jobs");
                options.max_workers = raw.parse().unwrap_or_else(|_| {
                    eprintln!("Invalid job count: {}", raw);
                    usage();
                    std::process::exit(2);
                });
            }
            "--subsetter" => {
                i += 1;
                program = value_of(&args, i, "--subsetter").to_string();
            }
            "--safety" => {
                i += 1;
                let raw = value_of(&args, i, "--safety");
                options.safety_codepoint = parse_codepoint(raw).unwrap_or_else(|| {
                    eprintln!("Invalid code point: {}", raw);
                    usage();
                    std::process::exit(2);
                });
            }
            "--help" | "-h" => {
                usage();
                return ExitCode::SUCCESS;
            }
            other if other.starts_with("--") => {
                eprintln!("Unknown option: {}", other);
                usage();
                return ExitCode::from(2);
            }
            other => {
                dir = Some(PathBuf::from(other));
            }
        }
        i += 1;
    }

    let Some(dir) = dir else {
        usage();
        return ExitCode::from(2);
    };

    let mut bundle = match DirBundle::open(&dir) {
        Ok(bundle) => bundle,
        Err(err) => {
            eprintln!("epub-subfont: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let subsetter = CommandSubsetter::new(program);
    let diagnostics = match subset_fonts(&mut bundle, &subsetter, &options) {
        Ok(diagnostics) => diagnostics,
        Err(err) => {
            eprintln!("epub-subfont: {}", err);
            return ExitCode::FAILURE;
        }
    };

    for diagnostic in &diagnostics {
        println!("{}", diagnostic);
    }
    let failed = diagnostics
        .iter()
        .filter(|d| d.action == FontAction::SubsetFailed)
        .count();
    if failed > 0 {
        eprintln!("epub-subfont: {} font(s) could not be subset", failed);
    }
    ExitCode::SUCCESS
}
