//! skysync CLI - sync files between storage backends
//!
//! Subcommand surface over the reconciliation engine, mirroring the
//! library's copy/sync/move/check operations plus listing, hashing and
//! directory management helpers.

use std::sync::{Arc, Mutex};

use clap::Parser;
use humansize::{format_size, BINARY};
use skysync::backend::{new_backend, start_listing, ListEntry, Object};
use skysync::config::{parse_age, parse_size, CliArgs, Commands, ConfigFile, SyncOptions};
use skysync::error::{Result, SyncError};
use skysync::filter::Filter;
use skysync::hash::HashKind;
use skysync::progress::{Reporter, Stats};
use skysync::sync::{delete_files, purge, SyncRun};
use tracing_subscriber::EnvFilter;

fn main() {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Initialize logging
    if let Err(e) = init_logging(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle result
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(args: &CliArgs) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if args.quiet {
        EnvFilter::new("error")
    } else {
        match args.verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match &args.log_file {
        Some(path) => {
            let file = std::fs::File::create(path).map_err(|e| SyncError::io(path, e))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn run(args: CliArgs) -> Result<()> {
    let opts = SyncOptions::from_cli(&args).map_err(SyncError::ConfigError)?;
    let filter = build_filter(&args)?;

    if args.dump_filters {
        print!("{}", filter.dump());
        return Ok(());
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(ConfigFile::default_path);
    let config = ConfigFile::load(&config_path)?;

    match &args.command {
        Commands::Copy {
            source,
            destination,
        } => cmd_transfer(source, destination, &config, opts, filter, Operation::Copy),
        Commands::Sync {
            source,
            destination,
        } => cmd_transfer(source, destination, &config, opts, filter, Operation::Sync),
        Commands::Move {
            source,
            destination,
        } => cmd_transfer(source, destination, &config, opts, filter, Operation::Move),
        Commands::Check {
            source,
            destination,
        } => cmd_transfer(source, destination, &config, opts, filter, Operation::Check),
        Commands::Ls { remote } => cmd_ls(remote, &config, &filter),
        Commands::Lsd { remote } => cmd_lsd(remote, &config),
        Commands::Lsl { remote } => cmd_lsl(remote, &config, &filter),
        Commands::Md5sum { remote } => cmd_hashsum(remote, &config, &filter, HashKind::Md5),
        Commands::Sha1sum { remote } => cmd_hashsum(remote, &config, &filter, HashKind::Sha1),
        Commands::Size { remote } => cmd_size(remote, &config, &filter),
        Commands::Mkdir { remote } => new_backend(remote, &config)?.mkdir(),
        Commands::Rmdir { remote } => new_backend(remote, &config)?.rmdir(),
        Commands::Purge { remote } => {
            let backend = new_backend(remote, &config)?;
            purge(backend, &opts, Arc::new(Stats::new()))
        }
        Commands::Delete { remote } => {
            let backend = new_backend(remote, &config)?;
            delete_files(backend, &filter, &opts, Arc::new(Stats::new()))
        }
        Commands::Config => cmd_config(&config, &config_path),
        Commands::Version => {
            println!("skysync v{}", skysync::VERSION);
            Ok(())
        }
    }
}

fn build_filter(args: &CliArgs) -> Result<Filter> {
    let mut filter = Filter::new();

    for path in &args.filter_from {
        filter.add_rules_from_file(path)?;
    }
    for rule in &args.filter {
        filter.add_rule(rule)?;
    }
    for pattern in &args.include {
        filter.add_include(pattern)?;
    }
    for path in &args.include_from {
        filter.add_includes_from_file(path)?;
    }
    for pattern in &args.exclude {
        filter.add_exclude(pattern)?;
    }
    for path in &args.exclude_from {
        filter.add_excludes_from_file(path)?;
    }
    for path in &args.files_from {
        filter.add_files_from(path)?;
    }

    filter.min_size = args
        .min_size
        .as_deref()
        .map(parse_size)
        .transpose()
        .map_err(|e| SyncError::config(format!("invalid --min-size: {}", e)))?;
    filter.max_size = args
        .max_size
        .as_deref()
        .map(parse_size)
        .transpose()
        .map_err(|e| SyncError::config(format!("invalid --max-size: {}", e)))?;
    filter.min_age = args
        .min_age
        .as_deref()
        .map(parse_age)
        .transpose()
        .map_err(|e| SyncError::config(format!("invalid --min-age: {}", e)))?;
    filter.max_age = args
        .max_age
        .as_deref()
        .map(parse_age)
        .transpose()
        .map_err(|e| SyncError::config(format!("invalid --max-age: {}", e)))?;

    Ok(filter)
}

enum Operation {
    Copy,
    Sync,
    Move,
    Check,
}

fn cmd_transfer(
    source: &str,
    destination: &str,
    config: &ConfigFile,
    opts: SyncOptions,
    filter: Filter,
    operation: Operation,
) -> Result<()> {
    let src = new_backend(source, config)?;
    let dst = new_backend(destination, config)?;

    let stats = Arc::new(Stats::new());
    let reporter = opts
        .stats_interval
        .map(|interval| Reporter::start(Arc::clone(&stats), interval));
    let quiet = opts.quiet;

    let sync_run = SyncRun::new(src, dst, opts, Arc::new(filter), Arc::clone(&stats));
    let result = match operation {
        Operation::Copy => sync_run.copy(),
        Operation::Sync => sync_run.sync(),
        Operation::Move => sync_run.move_to(),
        Operation::Check => sync_run.check(),
    };

    if let Some(reporter) = reporter {
        reporter.stop();
    }
    if !quiet {
        eprintln!("{}", stats.snapshot());
    }
    result
}

fn for_each_object(
    remote: &str,
    config: &ConfigFile,
    filter: &Filter,
    mut visit: impl FnMut(&dyn Object),
) -> Result<()> {
    let backend = new_backend(remote, config)?;
    let listing = start_listing(backend);
    while let Some(entry) = listing.next_entry()? {
        if let ListEntry::Object(object) = entry {
            if filter.include(object.remote(), object.size(), object.mod_time()) {
                visit(object.as_ref());
            }
        }
    }
    Ok(())
}

fn cmd_ls(remote: &str, config: &ConfigFile, filter: &Filter) -> Result<()> {
    for_each_object(remote, config, filter, |object| {
        println!("{:>9} {}", object.size(), object.remote());
    })
}

fn cmd_lsl(remote: &str, config: &ConfigFile, filter: &Filter) -> Result<()> {
    for_each_object(remote, config, filter, |object| {
        let when: chrono::DateTime<chrono::Utc> = object.mod_time().into();
        println!(
            "{:>9} {} {}",
            object.size(),
            when.format("%Y-%m-%d %H:%M:%S%.9f"),
            object.remote()
        );
    })
}

fn cmd_lsd(remote: &str, config: &ConfigFile) -> Result<()> {
    let backend = new_backend(remote, config)?;
    let listing = start_listing(backend);
    while let Some(entry) = listing.next_entry()? {
        if let ListEntry::Dir(dir) = entry {
            println!("{:>12} {}", dir.bytes, dir.name);
        }
    }
    Ok(())
}

fn cmd_hashsum(
    remote: &str,
    config: &ConfigFile,
    filter: &Filter,
    kind: HashKind,
) -> Result<()> {
    let mut failures = 0u64;
    for_each_object(remote, config, filter, |object| {
        match object.hash(kind) {
            Ok(Some(digest)) => println!("{}  {}", digest, object.remote()),
            Ok(None) => println!("{:width$}  {}", "UNSUPPORTED", object.remote(), width = kind.hex_width()),
            Err(err) => {
                tracing::error!("{}: failed to hash: {}", object.remote(), err);
                failures += 1;
            }
        }
    })?;
    if failures > 0 {
        return Err(SyncError::RunFailed(failures));
    }
    Ok(())
}

fn cmd_size(remote: &str, config: &ConfigFile, filter: &Filter) -> Result<()> {
    let mut count = 0u64;
    let mut total = 0u64;
    for_each_object(remote, config, filter, |object| {
        count += 1;
        if object.size() > 0 {
            total += object.size() as u64;
        }
    })?;
    println!("Total objects: {}", count);
    println!(
        "Total size: {} ({} bytes)",
        format_size(total, BINARY),
        total
    );
    Ok(())
}

fn cmd_config(config: &ConfigFile, path: &std::path::Path) -> Result<()> {
    println!("Config file: {}", path.display());
    let mut any = false;
    for name in config.remote_names() {
        let backend_type = config
            .section(name)
            .and_then(|s| s.backend_type())
            .unwrap_or("?");
        println!("{:24} {}", name, backend_type);
        any = true;
    }
    if !any {
        println!("(no remotes configured)");
    }
    Ok(())
}
