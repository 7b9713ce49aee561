//! User-facing summary output
//!
//! Everything here writes to stdout for the operator; diagnostics go
//! through `tracing` elsewhere.

use crate::config::RewriteConfig;
use crate::core::JobStats;
use crate::fs::StatSnapshot;
use humansize::{format_size, BINARY};
use std::path::Path;
use std::sync::atomic::Ordering;

fn savings_percent(on_disk: u64, real: u64) -> f64 {
    if real == 0 {
        0.0
    } else {
        (1.0 - on_disk as f64 / real as f64) * 100.0
    }
}

/// Print size and savings details for a single file.
pub fn print_file_info(path: &Path, snapshot: &StatSnapshot) {
    println!("{}:", path.display());
    println!(
        "File size (real): {} bytes / {}",
        snapshot.size,
        format_size(snapshot.size, BINARY)
    );
    println!(
        "File size (on disk): {}",
        format_size(snapshot.on_disk_size(), BINARY)
    );
    println!(
        "Compression savings: {:.1}%",
        savings_percent(snapshot.on_disk_size(), snapshot.size)
    );
}

/// Print the aggregate run summary.
pub fn print_job_summary(stats: &JobStats, config: &RewriteConfig) {
    let num_files = stats.num_files.load(Ordering::Relaxed);
    let hard_links = stats.hard_link_files.load(Ordering::Relaxed);
    let real = stats.uncompressed_bytes.load(Ordering::Relaxed);
    let on_disk = stats.compressed_bytes.load(Ordering::Relaxed);

    println!("Total number of files: {}", num_files);
    if hard_links > 0 {
        println!("Total number of file hard links: {}", hard_links);
    }
    println!(
        "Total size (real): {} bytes / {}",
        real,
        format_size(real, BINARY)
    );
    println!("Total size (on disk): {}", format_size(on_disk, BINARY));
    if real > 0 {
        println!(
            "Compression savings: {:.1}%",
            savings_percent(on_disk, real)
        );
    }

    if config.apply {
        let rewritten = stats.rewritten.load(Ordering::Relaxed);
        let failures = stats.failures.load(Ordering::Relaxed);
        println!(
            "Number of files rewritten with '{}': {}",
            config.target, rewritten
        );
        if failures > 0 {
            println!("Failed rewrites: {}", failures);
        }
    }
}
