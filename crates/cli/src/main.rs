//! CLI tool for vetting PowerPoint files before they are imported.

use anyhow::{Context, Result};
use clap::Parser;
use ppt_core::{ArchiveHandle, PPTX_MIME_TYPE};
use ppt_pipeline::{DirStore, MemoryStore, MultiTierCache, Orchestrator, PipelineConfig, ProcessOptions, ProcessResult};
use ppt_pptx::PptxExtractor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Validate, sanitize and extract text from PowerPoint files.
#[derive(Parser, Debug)]
#[command(name = "ppt-guard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input PowerPoint file(s) (.pptx)
    #[arg(required = true)]
    input: Vec<PathBuf>,

    /// Pipeline configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory persisting the durable cache tier between runs
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Empty the persisted cache before processing
    #[arg(long, requires = "cache_dir")]
    clear_cache: bool,

    /// Bypass the result cache
    #[arg(long)]
    no_cache: bool,

    /// Continue past structural validation errors
    #[arg(long)]
    lenient: bool,

    /// Do not rewrite the archive
    #[arg(long)]
    skip_sanitize: bool,

    /// Output directory for sanitized archives (default: next to the input)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print result records as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let failed = runtime.block_on(run(&args, config))?;
    if failed > 0 {
        anyhow::bail!("{} of {} files failed", failed, args.input.len());
    }
    Ok(())
}

/// Process every input. Returns the number of failed files.
async fn run(args: &Args, config: PipelineConfig) -> Result<usize> {
    let pipeline = build_pipeline(args, config).await?;
    let options = ProcessOptions::default()
        .with_cache(!args.no_cache)
        .with_strict_validation(!args.lenient)
        .with_skip_sanitization(args.skip_sanitize);

    let mut records = Vec::new();
    let mut failed = 0;
    for input_path in &args.input {
        if args.verbose {
            eprintln!("Processing: {}", input_path.display());
        }

        let archive = match read_archive(input_path).await {
            Ok(archive) => archive,
            Err(e) => {
                eprintln!("Error processing {}: {:#}", input_path.display(), e);
                failed += 1;
                continue;
            }
        };

        let result = pipeline.process_file(archive, &options).await;
        if !result.success {
            failed += 1;
        }

        if let Some(sanitized) = &result.sanitization_result {
            if result.success {
                let output_path = get_output_path(input_path, args.output.as_ref())?;
                write_output(&output_path, sanitized.archive.bytes()).await?;
                if args.verbose {
                    eprintln!("Written to: {}", output_path.display());
                }
            }
        }

        if args.json {
            records.push(result);
        } else {
            print_summary(input_path, &result);
        }
    }

    if args.json {
        let json = serde_json::to_string_pretty(&records).context("Failed to encode results")?;
        println!("{}", json);
    }
    Ok(failed)
}

async fn build_pipeline(args: &Args, config: PipelineConfig) -> Result<Orchestrator> {
    let cache_config = config.cache.clone();
    let pipeline = Orchestrator::new(config, Arc::new(PptxExtractor::new()))
        .context("Invalid pipeline configuration")?;

    let Some(dir) = &args.cache_dir else {
        return Ok(pipeline);
    };
    log::debug!("durable cache tier at {}", dir.display());
    let store = DirStore::open(dir).with_context(|| format!("Failed to open cache directory {}", dir.display()))?;
    let cache = MultiTierCache::open(cache_config, Arc::new(MemoryStore::new()), Arc::new(store))
        .await
        .with_context(|| format!("Failed to load cache from {}", dir.display()))?
        .with_buffers(pipeline.memory().buffers().clone());
    if args.clear_cache {
        cache.clear().await.context("Failed to clear cache")?;
    }
    log::debug!("cache holds {} entries", cache.stats().entry_count());
    Ok(pipeline.with_cache(Arc::new(cache)))
}

async fn read_archive(path: &Path) -> Result<ArchiveHandle> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("unknown");

    let archive = ArchiveHandle::new(name, bytes);
    let is_pptx = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pptx"));
    Ok(if is_pptx {
        archive.with_mime_type(PPTX_MIME_TYPE)
    } else {
        archive
    })
}

fn print_summary(input_path: &Path, result: &ProcessResult) {
    let status = if result.success { "ok" } else { "FAILED" };
    println!(
        "{}: {} ({} ms{})",
        input_path.display(),
        status,
        result.metrics.duration_ms,
        if result.metrics.cache_hit { ", cached" } else { "" }
    );

    if let Some(validation) = &result.validation_result {
        println!(
            "  risk: {:?}, {} errors, {} warnings",
            validation.risk_level,
            validation.errors.len(),
            validation.warnings.len()
        );
        for issue in validation.errors.iter().chain(&validation.warnings) {
            match &issue.location {
                Some(location) => println!("    {} {} ({})", issue.code.as_str(), issue.message, location),
                None => println!("    {} {}", issue.code.as_str(), issue.message),
            }
        }
    }
    if let Some(sanitized) = &result.sanitization_result {
        println!(
            "  sanitized: {} changes, {} entries dropped, {} -> {} bytes",
            sanitized.counters.total(),
            sanitized.dropped_entries.len(),
            sanitized.original_size,
            sanitized.sanitized_size
        );
    }
    if let Some(presentation) = &result.data {
        println!(
            "  extracted: {} slides, {} lines",
            presentation.slides.len(),
            presentation.all_lines().len()
        );
    }
    if let Some(error) = &result.error {
        println!("  error: [{}] {}", error.code, error.message);
    }
}

/// Determine the output path for a sanitized archive.
fn get_output_path(input_path: &Path, output_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let stem = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");

    let output_filename = format!("{}.sanitized.pptx", stem);

    let output_path = match output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
            dir.join(output_filename)
        }
        None => match input_path.parent() {
            Some(parent) => parent.join(output_filename),
            None => PathBuf::from(output_filename),
        },
    };

    Ok(output_path)
}

async fn write_output(path: &Path, content: &[u8]) -> Result<()> {
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ppt_core::Presentation;
    use ppt_pipeline::{CachedOutcome, SetOptions};

    #[test]
    fn test_output_path_defaults_next_to_input() {
        let path = get_output_path(Path::new("/decks/q3.pptx"), None).unwrap();
        assert_eq!(path, PathBuf::from("/decks/q3.sanitized.pptx"));
    }

    #[test]
    fn test_output_path_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("clean");
        let path = get_output_path(Path::new("q3.pptx"), Some(&out)).unwrap();
        assert_eq!(path, out.join("q3.sanitized.pptx"));
        assert!(out.is_dir());
    }

    #[test]
    fn test_flags_map_to_options() {
        let args = Args::parse_from(["ppt-guard", "--lenient", "--no-cache", "--json", "a.pptx", "b.pptx"]);
        assert!(args.lenient && args.no_cache && args.json);
        assert!(!args.skip_sanitize);
        assert_eq!(args.input.len(), 2);
    }

    #[test]
    fn test_clear_cache_needs_a_cache_dir() {
        assert!(Args::try_parse_from(["ppt-guard", "--clear-cache", "a.pptx"]).is_err());
        let args = Args::try_parse_from(["ppt-guard", "--clear-cache", "--cache-dir", "/tmp/c", "a.pptx"]).unwrap();
        assert!(args.clear_cache);
    }

    #[tokio::test]
    async fn test_cache_dir_persists_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let deck = dir.path().join("deck.pptx");
        let argv = |clear: bool| {
            let mut argv = vec!["ppt-guard".to_string(), "--cache-dir".into(), cache_dir.display().to_string()];
            if clear {
                argv.push("--clear-cache".into());
            }
            argv.push(deck.display().to_string());
            Args::parse_from(argv)
        };

        let outcome = CachedOutcome {
            presentation: Presentation::new("deck.pptx"),
            validation_result: None,
        };
        let first = build_pipeline(&argv(false), PipelineConfig::default()).await.unwrap();
        first.cache().set("deck", outcome, SetOptions::new()).await.unwrap();
        drop(first);

        let second = build_pipeline(&argv(false), PipelineConfig::default()).await.unwrap();
        assert!(second.cache().contains("deck"));
        drop(second);

        let third = build_pipeline(&argv(true), PipelineConfig::default()).await.unwrap();
        assert!(!third.cache().contains("deck"));
    }
}
