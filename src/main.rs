//! zfsrecomp CLI
//!
//! Wires the scanner, dataset registry, worker pool and rewriter
//! together: gather candidates single-threaded, hand the eligible ones
//! to the pool, and sweep every touched dataset back to its original
//! codec once the workers have joined.

use clap::Parser;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use zfsrecomp::config::{CliArgs, RewriteConfig};
use zfsrecomp::core::{is_rewritable, FileRewriter, JobStats, RewriteOutcome, WorkItem, WorkerPool};
use zfsrecomp::dataset::{DatasetAdmin, DatasetRegistry, EchoAdmin, ZfsCliAdmin};
use zfsrecomp::error::ZfsRecompError;
use zfsrecomp::fs::{FileEntry, FsInfo, ScanConfig, Scanner, StatSnapshot};
use zfsrecomp::{report, signals};

fn main() {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            // --help and --version land here too and are not errors
            std::process::exit(if e.use_stderr() { libc::EINVAL } else { 0 });
        }
    };
    init_logging(args.verbose);

    let config = match RewriteConfig::from_cli(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{}", ZfsRecompError::config(message));
            std::process::exit(libc::EINVAL);
        }
    };

    std::process::exit(run(&args, &config));
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: &CliArgs, config: &RewriteConfig) -> i32 {
    signals::install();

    let admin: Arc<dyn DatasetAdmin> = if config.target.is_test() {
        Arc::new(EchoAdmin::new(Arc::new(ZfsCliAdmin::new())))
    } else {
        Arc::new(ZfsCliAdmin::new())
    };
    let registry = DatasetRegistry::new(admin, config.quick_reset);
    let stats = JobStats::default();

    let entries = collect_entries(args, config, &stats);

    let mut pool = WorkerPool::new(config.workers, config.reverse_workers);
    for entry in entries {
        if signals::quit_requested() {
            break;
        }
        if config.apply && is_candidate(&registry, config, &entry) {
            pool.enqueue(WorkItem {
                path: entry.path,
                snapshot: entry.snapshot,
            });
        } else {
            if config.verbose > 1 {
                report::print_file_info(&entry.path, &entry.snapshot);
            }
            stats.record_file(&entry.snapshot);
        }
    }

    if !config.apply {
        report::print_job_summary(&stats, config);
        return 0;
    }

    if pool.is_empty() {
        tracing::info!("no rewritable files found");
    } else {
        if config.sort_by_size {
            pool.sort_by_size();
        }
        pool.clamp_workers();
        tracing::info!(
            "starting {} worker thread(s) to rewrite {} file(s) with compression '{}'",
            pool.workers(),
            pool.len(),
            config.target
        );

        let io_lock = if config.exclusive_io {
            Some(Mutex::new(()))
        } else {
            None
        };
        let processed = pool.run(|worker_id, item| {
            process_item(worker_id, item, config, &registry, &stats, io_lock.as_ref());
        });
        tracing::info!(
            "processed {} entries, applying new compression '{}'",
            processed,
            config.target
        );
    }

    registry.clear();
    report::print_job_summary(&stats, config);
    stats.exit_code()
}

/// Stat the argument paths and expand directories into candidate
/// files. Runs single-threaded before the pool starts.
fn collect_entries(args: &CliArgs, config: &RewriteConfig, stats: &JobStats) -> Vec<FileEntry> {
    let mut scanner = Scanner::new(ScanConfig {
        follow_symlinks: config.follow_symlinks,
        detect_hard_links: config.detect_hard_links,
    });
    let mut entries = Vec::new();

    for path in &args.paths {
        if signals::quit_requested() {
            break;
        }
        let snapshot = match StatSnapshot::capture(path, config.follow_symlinks) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("{}", e);
                continue;
            }
        };
        if snapshot.is_dir() {
            scanner.scan_into(path, &mut entries);
        } else {
            if config.verbose > 0 {
                report::print_file_info(path, &snapshot);
            }
            entries.push(FileEntry {
                path: path.clone(),
                snapshot,
            });
        }
    }

    stats
        .hard_link_files
        .store(scanner.hard_link_files, Ordering::Relaxed);
    entries
}

/// Enqueue-time filter: resolve the dataset and ask the eligibility
/// rules. Anything that fails to resolve is simply not a candidate.
fn is_candidate(registry: &DatasetRegistry, config: &RewriteConfig, entry: &FileEntry) -> bool {
    let fsinfo = match FsInfo::query(&entry.path) {
        Ok(fsinfo) => fsinfo,
        Err(e) => {
            tracing::debug!("{}", e);
            return false;
        }
    };
    let dataset = match registry.dataset_for(&entry.path, &entry.snapshot, &fsinfo, config.follow_symlinks)
    {
        Ok(Some(dataset)) => dataset,
        Ok(None) => return false,
        Err(e) => {
            tracing::warn!("{}", e);
            return false;
        }
    };
    is_rewritable(&entry.path, &entry.snapshot, config, &dataset, &fsinfo)
}

/// Worker body: re-evaluate eligibility (the dataset may have gone
/// read-only since enqueue), rewrite, and account the outcome.
fn process_item(
    worker_id: usize,
    item: &mut WorkItem,
    config: &RewriteConfig,
    registry: &DatasetRegistry,
    stats: &JobStats,
    io_lock: Option<&Mutex<()>>,
) {
    let fsinfo = match FsInfo::query(&item.path) {
        Ok(fsinfo) => fsinfo,
        Err(e) => {
            tracing::warn!("{}", e);
            stats.record_file(&item.snapshot);
            return;
        }
    };
    let dataset = match registry.dataset_for(&item.path, &item.snapshot, &fsinfo, config.follow_symlinks)
    {
        Ok(Some(dataset)) => dataset,
        Ok(None) => {
            stats.record_file(&item.snapshot);
            return;
        }
        Err(e) => {
            tracing::warn!("{}", e);
            stats.record_file(&item.snapshot);
            return;
        }
    };
    if !is_rewritable(&item.path, &item.snapshot, config, &dataset, &fsinfo) {
        stats.record_file(&item.snapshot);
        return;
    }

    let rewriter = FileRewriter::new(config, io_lock, worker_id);
    match rewriter.rewrite(&item.path, &mut item.snapshot, &dataset) {
        Ok(RewriteOutcome::Rewritten) => stats.record_rewritten(&item.snapshot),
        Ok(RewriteOutcome::Skipped) => stats.record_file(&item.snapshot),
        Err(e) => {
            stats.record_failure(e.errno());
            stats.record_file(&item.snapshot);
            if config.list_failures {
                println!("{}", item.path.display());
            }
            tracing::warn!("{}", e);
        }
    }
}
