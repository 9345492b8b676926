use crate::api::CatalogClient;
use crate::cache::{ChunkedCache, FileKvStore};
use crate::cli::{Cli, Commands};
use crate::config_file::{CatalogOptions, Credentials, Profile, CREDENTIALS_FILE, PROFILE_TEMPLATE};
use crate::data::feed;
use crate::data::history::ImportHistory;
use crate::data::import::BatchReport;
use crate::data::{
    HttpImageProbe, ImportPolicy, ImportSettings, Orchestrator, RowScript, RowValidator, RunStore,
};
use crate::fetch::{RemoteFetcher, SftpTarget};
use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

mod api;
mod cache;
mod catalog;
mod cli;
mod config_file;
mod data;
mod fetch;

/// Everything a command downloading and importing the feed needs
pub struct SyncContext {
    pub orchestrator: Orchestrator,
    pub fetcher: RemoteFetcher,
    pub target: SftpTarget,
}

fn main() -> anyhow::Result<()> {
    let start_instant = Instant::now();
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Auth {
            domain,
            id,
            secret,
            sftp_password,
        } => {
            auth(domain, id, secret, sftp_password)?;
            println!("Successfully authenticated. You can continue with other commands now.")
        }
        Commands::Init { force } => {
            if cli.profile.exists() && !force {
                anyhow::bail!(
                    "{} already exists, use --force to overwrite it",
                    cli.profile.display()
                );
            }
            std::fs::write(&cli.profile, PROFILE_TEMPLATE)
                .with_context(|| format!("Failed to write {}", cli.profile.display()))?;
            println!("Wrote default profile to {}", cli.profile.display());
        }
        Commands::TestConnection => {
            let profile = read_profile(&cli.profile)?;
            let target = profile.source.sftp_target(&read_credentials()?)?;
            let fetcher = RemoteFetcher::detect();

            let bytes = fetcher.fetch(&target)?;
            let parsed = feed::parse(
                &bytes,
                profile.source.format,
                profile.source.delimiter_byte()?,
            )?;

            let result = serde_json::json!({
                "format": profile.source.format,
                "totalRows": parsed.rows.len(),
                "header": parsed.header,
                "fileSizeBytes": bytes.len(),
                "transports": fetcher.transport_names(),
            });
            print_result(cli.json, &result, || {
                format!(
                    "Connection works, found {} rows in the {} file ({} bytes)",
                    parsed.rows.len(),
                    profile.source.format,
                    bytes.len()
                )
            })?;
        }
        Commands::Fetch => {
            let context = create_context(&cli.profile)?;
            let summary = context
                .orchestrator
                .start_fetch(&context.fetcher, &context.target)?;
            print_result(cli.json, &summary, || {
                format!(
                    "Cached {} rows under cache key {}",
                    summary.total_rows, summary.cache_key
                )
            })?;
        }
        Commands::FetchFile { file } => {
            let orchestrator = create_orchestrator(&read_profile(&cli.profile)?)?;
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let summary = orchestrator.start_from_bytes(bytes)?;
            print_result(cli.json, &summary, || {
                format!(
                    "Cached {} rows under cache key {}",
                    summary.total_rows, summary.cache_key
                )
            })?;
        }
        Commands::Process { cache_key, offset } => {
            let orchestrator = create_orchestrator(&read_profile(&cli.profile)?)?;
            let report = orchestrator.process_batch(&cache_key, offset)?;
            print_report(cli.json, &report)?;
        }
        Commands::Run { fresh } => {
            let context = create_context(&cli.profile)?;
            run(&context, fresh, cli.json)?;
            println!("You might want to run the indexers of the catalog now.");
        }
        Commands::Status => {
            let runs = open_runs(&read_profile(&cli.profile)?)?;
            let state = runs.run_state()?;
            let resumable = match &state {
                Some(state) => runs.is_cached(&state.cache_key)?,
                None => false,
            };

            if cli.json {
                let result = serde_json::json!({ "state": state, "resumable": resumable });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                match state {
                    None => println!("No import in progress"),
                    Some(state) => {
                        println!(
                            "Run {} at row {} of {} ({:.2}%), saved {}",
                            state.cache_key,
                            state.offset,
                            state.total_rows,
                            state.progress(),
                            state.saved_at
                        );
                        println!(
                            "Imported: {}, Updated: {}, Skipped: {}",
                            state.counters.imported,
                            state.counters.updated,
                            state.counters.skipped()
                        );
                        if !resumable {
                            println!("The cached feed expired, the run can not be resumed");
                        }
                        for line in &state.log {
                            println!("  {line}");
                        }
                    }
                }
            }
        }
        Commands::Discard { keep_cache } => {
            let runs = open_runs(&read_profile(&cli.profile)?)?;
            let discarded = if keep_cache {
                runs.clear_run_state()?
            } else {
                runs.discard()?
            };
            match discarded {
                Some(cache_key) => println!("Discarded run {cache_key}"),
                None => println!("No import in progress"),
            }
        }
        Commands::History { limit } => {
            let profile = read_profile(&cli.profile)?;
            let store = FileKvStore::open(&profile.cache.dir)?;
            let entries = ImportHistory::in_dir(store.dir()).latest(limit)?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No imports yet");
            } else {
                for entry in entries {
                    println!(
                        "{} [{:?}] {}: {}",
                        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.status,
                        entry.file_type,
                        entry.message
                    );
                }
            }
        }
    }

    if !cli.json {
        println!(
            "This whole command executed in {:.3}s",
            start_instant.elapsed().as_secs_f32()
        );
    }

    Ok(())
}

/// Defaults to `info` if `RUST_LOG` is unset, `FEED_SYNC_LOG_FORMAT=json` switches to JSON lines.
/// Logs go to stderr, stdout is reserved for command results.
fn init_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let builder = tracing_subscriber::registry().with(filter);

    match std::env::var("FEED_SYNC_LOG_FORMAT").as_deref() {
        Ok("json") => {
            let _ = builder.with(fmt_layer.json().flatten_event(true)).try_init();
        }
        _ => {
            let _ = builder.with(fmt_layer.compact()).try_init();
        }
    }
}

fn auth(
    domain: String,
    id: String,
    secret: String,
    sftp_password: Option<String>,
) -> anyhow::Result<()> {
    let credentials = Credentials {
        base_url: domain.trim_end_matches('/').to_string(),
        access_key_id: id,
        access_key_secret: secret,
        sftp_password,
    };

    // check if credentials work
    let _ = CatalogClient::new(credentials.clone(), &CatalogOptions::default().entity)?;

    // write them to file
    let serialized = toml::to_string(&credentials)?;
    std::fs::write(CREDENTIALS_FILE, serialized)?;

    Ok(())
}

fn read_profile(path: &Path) -> anyhow::Result<Profile> {
    let serialized_profile = std::fs::read_to_string(path)
        .with_context(|| format!("Profile {} not found. Call command init first.", path.display()))?;
    let profile: Profile = serde_yaml::from_str(&serialized_profile)
        .with_context(|| format!("Invalid profile {}", path.display()))?;
    Ok(profile)
}

fn read_credentials() -> anyhow::Result<Credentials> {
    let serialized_credentials = std::fs::read_to_string(CREDENTIALS_FILE)
        .context("No .credentials.toml found. Call command auth first.")?;
    let credentials: Credentials = toml::from_str(&serialized_credentials)?;
    Ok(credentials)
}

fn open_store(profile: &Profile) -> anyhow::Result<Arc<FileKvStore>> {
    let store = FileKvStore::open(&profile.cache.dir)
        .with_context(|| format!("Cache dir {} not usable", profile.cache.dir.display()))?;
    Ok(Arc::new(store))
}

fn chunked_cache(profile: &Profile, store: Arc<FileKvStore>) -> ChunkedCache {
    ChunkedCache::with_limits(
        store,
        profile.cache.ttl(),
        profile.cache.chunk_threshold_bytes,
        profile.cache.chunk_rows.max(1),
    )
}

/// Run bookkeeping only, works without credentials
fn open_runs(profile: &Profile) -> anyhow::Result<RunStore> {
    let store = open_store(profile)?;
    let cache = chunked_cache(profile, store.clone());
    Ok(RunStore::new(store, cache))
}

/// Importing needs the catalog but not the SFTP source
fn create_orchestrator(profile: &Profile) -> anyhow::Result<Orchestrator> {
    let credentials = read_credentials()?;
    let delimiter = profile.source.delimiter_byte()?;
    let store = open_store(profile)?;
    let catalog = CatalogClient::new(credentials, &profile.catalog.entity)?;

    let policy = ImportPolicy::new(
        &profile.import.hidden_categories,
        &profile.import.category_column,
        profile.import.validate_images,
    );
    let validator = RowValidator::new(
        policy,
        Arc::new(HttpImageProbe::new()?),
        store.clone(),
        profile.import.probe_threads,
    )?;
    let script = RowScript::compile(&profile.import.row_script)?;

    let settings = ImportSettings {
        batch_size: profile.import.batch_size.max(1),
        cache_ttl: profile.cache.ttl(),
        format: profile.source.format,
        delimiter,
        chunk_threshold_bytes: profile.cache.chunk_threshold_bytes,
        chunk_rows: profile.cache.chunk_rows.max(1),
    };
    let orchestrator = Orchestrator::new(store.clone(), Arc::new(catalog), validator, settings)
        .with_script(script)
        .with_history(ImportHistory::in_dir(store.dir()));
    Ok(orchestrator)
}

fn create_context(profile_path: &Path) -> anyhow::Result<SyncContext> {
    let profile = read_profile(profile_path)?;
    // fail on an incomplete SFTP block before anything touches the network
    let target = profile.source.sftp_target(&read_credentials()?)?;
    let orchestrator = create_orchestrator(&profile)?;

    Ok(SyncContext {
        orchestrator,
        fetcher: RemoteFetcher::detect(),
        target,
    })
}

/// Both phases in one process, picking up an unfinished run if its feed is still cached
fn run(context: &SyncContext, fresh: bool, json: bool) -> anyhow::Result<()> {
    let orchestrator = &context.orchestrator;

    let resumed = if fresh {
        if let Some(cache_key) = orchestrator.runs().discard()? {
            println!("Discarded unfinished run {cache_key}");
        }
        None
    } else {
        orchestrator.runs().resumable_run()?
    };

    let (cache_key, mut offset) = match resumed {
        Some(state) => {
            println!(
                "Resuming run {} at row {} of {}",
                state.cache_key, state.offset, state.total_rows
            );
            (state.cache_key, state.offset)
        }
        None => {
            // a run still holding the lock makes this fail with RunLocked
            let summary = orchestrator
                .start_fetch(&context.fetcher, &context.target)
                .context("Fetching the feed failed")?;
            println!(
                "Fetched {} rows (cache key {})",
                summary.total_rows, summary.cache_key
            );
            (summary.cache_key, 0)
        }
    };

    loop {
        let report = orchestrator
            .process_batch(&cache_key, offset)
            .with_context(|| format!("Batch at offset {offset} failed, rerun to resume"))?;
        print_report(json, &report)?;

        if report.done {
            break;
        }
        offset = report.next_offset;
    }

    Ok(())
}

fn print_report(json: bool, report: &BatchReport) -> anyhow::Result<()> {
    print_result(json, report, || {
        let mut text = report.log.join("\n");
        if !report.done {
            text.push_str(&format!(
                "\nProgress: {:.2}%, next offset {}",
                report.progress, report.next_offset
            ));
        }
        text
    })
}

fn print_result<T, F>(json: bool, value: &T, text: F) -> anyhow::Result<()>
where
    T: Serialize,
    F: FnOnce() -> String,
{
    if json {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}
