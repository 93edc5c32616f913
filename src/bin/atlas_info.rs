//! Print the TOCs, stub statistics and config records of a container.
//!
//! Usage: cargo run --bin atlas_info -- <container.atlas> [--alias NAME=kind]... [--config pager.json]

use std::process::ExitCode;

use quadatlas::core::{PagerConfig, logging};
use quadatlas::streaming::{Container, TocKind, TocRegistry};

fn parse_kind(name: &str) -> Option<TocKind> {
    match name.to_ascii_lowercase().as_str() {
        "geometry" | "geom" => Some(TocKind::Geometry),
        "texture" | "tex" => Some(TocKind::Texture),
        "config" => Some(TocKind::Config),
        _ => None,
    }
}

fn main() -> ExitCode {
    logging::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut path = None;
    let mut registry = TocRegistry::with_defaults();
    let mut config = PagerConfig::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--alias" => {
                let Some((name, kind)) = args.get(i + 1).and_then(|a| a.split_once('=')) else {
                    eprintln!("--alias expects NAME=kind");
                    return ExitCode::FAILURE;
                };
                let Some(kind) = parse_kind(kind) else {
                    eprintln!("unknown TOC kind '{}'", kind);
                    return ExitCode::FAILURE;
                };
                registry.register(name, kind);
                i += 2;
            }
            "--config" => {
                let Some(file) = args.get(i + 1) else {
                    eprintln!("--config expects a path");
                    return ExitCode::FAILURE;
                };
                config = match PagerConfig::load(file) {
                    Ok(c) => c,
                    Err(e) => {
                        eprintln!("{}", e);
                        return ExitCode::FAILURE;
                    }
                };
                i += 2;
            }
            other => {
                path = Some(other.to_string());
                i += 1;
            }
        }
    }

    let Some(path) = path else {
        eprintln!("Usage: atlas_info <container.atlas> [--alias NAME=kind]... [--config pager.json]");
        return ExitCode::FAILURE;
    };

    let mut container = Container::with_config(config);
    if let Err(e) = container.open(&path, &registry) {
        log::error!("{}", e);
        return ExitCode::FAILURE;
    }

    println!("{}: {} TOCs", path, container.tocs().len());
    let ids: Vec<_> = (0..container.tocs().len()).map(quadatlas::core::TocId).collect();
    for id in ids {
        let Ok(toc) = container.toc(id) else { continue };
        let stats = toc.stats();
        println!(
            "  [{}] {} ({}): depth {}, {} stubs, {} written, format v{}",
            id.index(),
            toc.type_name(),
            toc.kind(),
            toc.tree_depth(),
            stats.stubs,
            stats.written,
            toc.format_version()
        );
        if let Some(bounds) = toc.bounds() {
            println!("      bounds {:?} .. {:?}", bounds.min, bounds.max);
        }
        if toc.kind() == TocKind::Geometry {
            println!("      goal batch size {}", toc.goal_batch_size());
        }

        if toc.kind() != TocKind::Config {
            continue;
        }
        let names: Vec<String> = toc
            .stubs()
            .iter()
            .filter_map(|s| s.name())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        for name in names {
            match container.config(id, &name) {
                Ok(Some(chunk)) => {
                    println!("      {}:", name);
                    for (key, value) in chunk.entries() {
                        println!("        {} = {}", key, value);
                    }
                }
                Ok(None) => {}
                Err(e) => log::error!("config '{}': {}", name, e),
            }
        }
    }

    if let Err(e) = container.close() {
        log::error!("{}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
