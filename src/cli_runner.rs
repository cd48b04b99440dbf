//! Command execution for the `packforge` binary: builds the engine from the
//! global options and runs one pass per subcommand.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use tracing::{info, warn};

use crate::cli::{self, Args, Commands, GlobalOpts};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::entry::{Encryption, Entry, Modification};
use crate::error::EngineError;
use crate::pack;
use crate::pipeline::EntryFailure;
use crate::progress::ProgressState;
use crate::source::{FileSource, MemorySource, Source};
use crate::workers::repack::RepackOptions;

/// Public entry for running a parsed command line.
pub fn run_cli_app(args: Args) -> Result<(), EngineError> {
    let Args { global, command } = args;
    match command {
        Commands::Create { inputs, output, method, encrypt } => {
            let mut entries = pack::stage_inputs(&inputs)?;
            if let Some(mode) = encrypt {
                let target = Encryption::from(mode);
                entries.iter_mut().filter(|e| e.is_added()).for_each(|e| e.target_encryption = Some(target));
            }
            let engine = build_engine(MemorySource::new(Vec::<u8>::new()), &global, "create")?;
            let len = entries.len();
            let pass = engine.compress_added_range(&mut entries, 0..len, method)?;
            report_recovered(&pass.recovered);
            let bytes = pack::write_pack(&output, &mut entries, pass)?;
            println!("Created {} ({} entries, {} bytes)", output.display(), entries.len(), bytes);
        }
        Commands::List { archive } => {
            let entries = pack::open_index(&archive)?;
            let mut out = io::stdout().lock();
            writeln!(out, "{:>12} {:>12}  {:<8} {:<16} path", "size", "stored", "method", "encryption")?;
            for entry in &entries {
                writeln!(
                    out,
                    "{:>12} {:>12}  {:<8} {:<16} {}{}",
                    entry.size_decompressed,
                    entry.size_compressed,
                    format!("{:?}", entry.compression).to_lowercase(),
                    describe_encryption(entry.encryption),
                    entry.path,
                    if entry.directory { "/" } else { "" }
                )?;
            }
            writeln!(out, "{} entries", entries.len())?;
        }
        Commands::Extract { archive, files, output } => {
            let all = pack::open_index(&archive)?;
            let mut entries = select(all, &files);
            let out_dir = output.unwrap_or_else(|| ".".into());
            let engine = build_engine(FileSource::new(&archive), &global, "extract")?;
            let len = entries.len();
            let summary = engine.extract_range(&mut entries, 0..len, &out_dir)?;
            report_recovered(&summary.recovered);
            println!("Extracted {} of {} entries to {}", summary.value, len, out_dir.display());
        }
        Commands::Repack { archive, output, recompress, encrypt, defragment, add, remove } => {
            let mut entries = pack::open_index(&archive)?;
            mark_removed(&mut entries, &remove);
            if let Some(mode) = encrypt {
                let target = Encryption::from(mode);
                for entry in entries.iter_mut().filter(|e| !e.is_removed() && !e.directory) {
                    entry.target_encryption = Some(target);
                    if entry.encryption != target {
                        entry.modification = Modification::Reencrypt;
                    }
                }
            }
            let mut staged = pack::stage_inputs(&add)?;
            if let Some(mode) = encrypt {
                staged.iter_mut().for_each(|e| e.target_encryption = Some(Encryption::from(mode)));
            }
            merge_staged(&mut entries, staged);

            let engine = build_engine(FileSource::new(&archive), &global, "repack")?;
            let len = entries.len();
            let pass = engine.repack_range(&mut entries, 0..len, RepackOptions { recompress, defragment })?;
            report_recovered(&pass.recovered);
            let target = output.unwrap_or_else(|| archive.clone());
            let bytes = pack::write_pack(&target, &mut entries, pass)?;
            println!("Repacked {} ({} entries, {} bytes)", target.display(), entries.len(), bytes);
        }
        Commands::Hash { archive, algo } => {
            let mut entries = pack::open_index(&archive)?;
            let engine = build_engine(FileSource::new(&archive), &global, "hash")?;
            let len = entries.len();
            let summary = engine.scan_range(&mut entries, 0..len, algo.hasher())?;
            report_recovered(&summary.recovered);
            let mut out = io::stdout().lock();
            for (path, digest) in &summary.value {
                writeln!(out, "{}  {}", to_hex(digest), path)?;
            }
        }
        Commands::Classify { archive } => {
            let mut entries = pack::open_index(&archive)?;
            let engine = build_engine(FileSource::new(&archive), &global, "classify")?;
            let len = entries.len();
            let counts = engine.classify_encryption_range(&mut entries, 0..len)?;
            let mut out = io::stdout().lock();
            for entry in &entries {
                if let Some(class) = entry.classification {
                    writeln!(out, "{:<16} {}", format!("{:?}", class).to_lowercase(), entry.path)?;
                }
            }
            writeln!(
                out,
                "normal: {}, lzma: {}, legacy-encrypted: {}, skipped: {}",
                counts.normal, counts.lzma, counts.legacy_encrypted, counts.skipped
            )?;
        }
    }
    Ok(())
}

fn build_engine<S: Source>(source: S, global: &GlobalOpts, operation: &str) -> Result<Engine<S>, EngineError> {
    let mut config = match &global.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    }
    .with_env_overrides();
    if global.no_monitor {
        config.monitor_cpu = false;
    }
    if let Some(key) = cli::key_from_opt_or_env(global.key.clone()) {
        config.secondary_key = Some(key);
    }
    info!(operation, source = %source.describe(), threads = ?global.threads, monitor = config.monitor_cpu, "starting");

    let engine = Engine::new(source, config)?.with_threads(global.threads);
    Ok(if global.progress { engine.with_progress(create_cli_progress_callback(operation)) } else { engine })
}

/// Keeps entries whose path equals one of `files` or lies under it.
fn select(entries: Vec<Entry>, files: &[String]) -> Vec<Entry> {
    if files.is_empty() {
        return entries;
    }
    let wanted: Vec<String> = files.iter().map(|f| crate::entry::normalize_path(f).to_lowercase()).collect();
    entries
        .into_iter()
        .filter(|e| {
            let key = e.key();
            wanted.iter().any(|w| key == *w || key.strip_prefix(w.as_str()).is_some_and(|rest| rest.starts_with('/')))
        })
        .collect()
}

fn mark_removed(entries: &mut [Entry], paths: &[String]) {
    for path in paths {
        let key = crate::entry::normalize_path(path).to_lowercase();
        match entries.iter_mut().find(|e| e.key() == key) {
            Some(entry) => entry.modification = Modification::Removed,
            None => warn!(path = %path, "no such entry to remove"),
        }
    }
}

/// Staged files replace existing entries with the same path; others are appended.
fn merge_staged(entries: &mut Vec<Entry>, staged: Vec<Entry>) {
    for new in staged {
        match entries.iter_mut().find(|e| e.key() == new.key()) {
            Some(existing) if new.directory => {
                if !existing.directory {
                    warn!(path = %new.path, "directory shadows a file entry; keeping the file");
                }
            }
            Some(existing) => *existing = new,
            None => entries.push(new),
        }
    }
}

fn report_recovered(failures: &[EntryFailure]) {
    for failure in failures {
        eprintln!("warning: {}", failure);
    }
    if !failures.is_empty() {
        eprintln!("warning: {} entries could not be processed", failures.len());
    }
}

fn describe_encryption(encryption: Encryption) -> String {
    match (encryption.des, encryption.secondary) {
        (None, false) => "-".to_string(),
        (Some(mode), false) => format!("des-{:?}", mode).to_lowercase(),
        (None, true) => "secondary".to_string(),
        (Some(mode), true) => format!("des-{:?}+secondary", mode).to_lowercase(),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// --- utils for CLI progress -------------------------------------------------

fn create_cli_progress_callback(operation: &str) -> impl Fn(ProgressState) + Send + Sync + 'static {
    let operation = operation.to_uppercase();
    let last_update = Mutex::new(Instant::now());
    let prev_len = Mutex::new(0usize);
    let done = AtomicBool::new(false);

    move |state: ProgressState| {
        if done.load(Ordering::Relaxed) {
            return;
        }
        // Redraw at most every 100ms, but always show completion
        let should_update = state.progress_percent >= 100.0 || {
            let mut last = last_update.lock().unwrap_or_else(PoisonError::into_inner);
            if last.elapsed().as_millis() >= 100 {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if !should_update {
            return;
        }

        let term_width = term_size::dimensions().map(|(w, _)| w).unwrap_or(80);
        let eta = state.estimated_time_remaining().as_secs_f32();
        let eta_str = if state.processed_entries == 0 {
            "--".to_string()
        } else if eta > 60.0 {
            format!("{:.1}m", eta / 60.0)
        } else {
            format!("{:.1}s", eta)
        };

        let build_line = |bar_width: usize| {
            let filled = ((state.progress_percent / 100.0) * bar_width as f32) as usize;
            let filled = filled.min(bar_width);
            format!(
                "[{}] [{}{}] {:.1}% | {}/{} entries | {} running, {} paused | ETA: {}",
                operation,
                "█".repeat(filled),
                "░".repeat(bar_width - filled),
                state.progress_percent,
                state.processed_entries,
                state.total_entries,
                state.running_workers,
                state.paused_workers,
                eta_str
            )
        };
        let mut bar_width = 40;
        let mut line = build_line(bar_width);
        while line.chars().count() > term_width && bar_width > 10 {
            bar_width -= 4;
            line = build_line(bar_width);
        }

        {
            let mut prev = prev_len.lock().unwrap_or_else(PoisonError::into_inner);
            let width = line.chars().count();
            if *prev > width {
                line.push_str(&" ".repeat(*prev - width));
            }
            *prev = width;
        }
        eprint!("\r\x1B[2K{}", line);
        io::stderr().flush().ok();

        if state.progress_percent >= 100.0 {
            eprintln!();
            done.store(true, Ordering::Relaxed);
        }
    }
}
