// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use mirrorkeep::{
    config::{Config, ConfigFile},
    mirror::score::NodeScorer,
    path::default_config_file,
    repo::{
        acquire::{sweep_stale_clones, Acquirer, AcquisitionResult},
        deliver::dir_size,
        head_commit, Gallery, RepositoryDescriptor,
    },
    store::JsonStore,
    sync::{
        ban::{find_item, BanService},
        content::{ImageDataFile, MetadataSource},
        SyncReport, Synchronizer,
    },
};

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use std::{path::PathBuf, process::exit, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "mirrorkeep [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Use configuration file at path instead of the default one.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let file = match self.config {
            Some(path) => ConfigFile::new(path),
            None => ConfigFile::new(default_config_file()?),
        };

        match self.command {
            Command::Download => run_download(file).await,
            Command::Update(opts) => run_update(file, opts).await,
            Command::Sync(opts) => run_sync(file, opts),
            Command::Ban(opts) => run_ban(file, opts),
            Command::Settings(opts) => run_settings(file, opts),
            Command::Status => run_status(file),
            Command::Clean => run_clean(file).await,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Clone every configured repository that is not downloaded yet.
    Download,

    /// Update every downloaded repository.
    #[command(override_usage = "mirrorkeep update [options]")]
    Update(UpdateOptions),

    /// Project allowed content into target directories.
    #[command(override_usage = "mirrorkeep sync [options]")]
    Sync(SyncOptions),

    /// Manage manual content bans.
    #[command(subcommand)]
    Ban(BanCommand),

    /// Change synchronization settings.
    #[command(override_usage = "mirrorkeep settings [options]")]
    Settings(SettingsOptions),

    /// Show state of every configured repository.
    Status,

    /// Remove scratch clones left behind by interrupted runs.
    Clean,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct UpdateOptions {
    /// Synchronize even when nothing changed upstream.
    #[arg(short, long)]
    pub force_sync: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SyncOptions {
    /// Treat pass as the first one after download.
    #[arg(short, long)]
    pub initial: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum BanCommand {
    /// Ban content item by relative path or owner and number, e.g. `Furina3`.
    Add {
        #[arg(value_name = "item")]
        identifier: String,
    },

    /// Lift ban of content item.
    Remove {
        #[arg(value_name = "item")]
        identifier: String,
    },

    /// List banned and rule-excluded content.
    List,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SettingsOptions {
    /// Turn synchronization on.
    #[arg(long, group = "switch")]
    pub enable: bool,

    /// Turn synchronization off, retracting everything on next pass.
    #[arg(long, group = "switch")]
    pub disable: bool,

    /// Purification level in 0..=2.
    #[arg(short, long, value_name = "level")]
    pub level: Option<u8>,

    /// Map target group to directory.
    #[arg(short, long, value_name = "group=path", value_parser = parse_target)]
    pub target: Vec<(String, PathBuf)>,

    /// Remove target group mapping.
    #[arg(short, long, value_name = "group")]
    pub unset_target: Vec<String>,
}

fn parse_target(arg: &str) -> Result<(String, PathBuf)> {
    let (group, path) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("expected <group>=<path>, got {arg:?}"))?;
    Ok((group.to_string(), PathBuf::from(path)))
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

/// Everything a command needs, loaded once.
struct Context {
    file: ConfigFile,
    config: Config,
    gallery: Gallery,
    store: Arc<JsonStore>,
}

impl Context {
    fn load(file: ConfigFile) -> Result<Self> {
        let config = file.load()?;
        let gallery = Gallery::from_config(&config)?;
        let store = Arc::new(JsonStore::open(config.paths.state_dir()?)?);

        Ok(Self {
            file,
            config,
            gallery,
            store,
        })
    }

    fn acquirer(&self) -> Result<Acquirer> {
        let scorer = NodeScorer::new(self.store.clone());
        let acquirer = Acquirer::new(self.config.git.clone(), self.config.paths.temp_dir()?, scorer)?
            .with_optional_content(self.config.optional_content.clone());
        Ok(acquirer)
    }

    fn metadata(&self) -> Result<ImageDataFile> {
        let core = self
            .gallery
            .core()
            .ok_or_else(|| anyhow!("no core repository configured"))?;
        if !core.is_downloaded() {
            bail!("core repository {} is not downloaded", core.description());
        }

        Ok(ImageDataFile::in_repository(core.local_path()))
    }

    fn synchronize(&self, is_initial: bool) -> Result<SyncReport> {
        let synchronizer = Synchronizer::new(
            self.metadata()?,
            self.file.clone(),
            self.gallery.repos_root(),
            self.store.clone(),
        );
        let report = synchronizer.synchronize(is_initial)?;
        if !report.missing.is_empty() {
            warn!("{} allowed files are missing upstream", report.missing.len());
        }

        Ok(report)
    }
}

async fn run_download(file: ConfigFile) -> Result<()> {
    let ctx = Context::load(file)?;
    let pending = ctx
        .gallery
        .all()
        .into_iter()
        .filter(|repo| !repo.is_downloaded())
        .collect::<Vec<_>>();
    if pending.is_empty() {
        info!("every repository is already downloaded");
        return Ok(());
    }

    let acquirer = ctx.acquirer()?;
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<30}  [{wide_bar:.yellow/blue}] {pos:>3}%",
    )?
    .progress_chars("-Cco.");

    let results = join_all(pending.iter().map(|repo| {
        let bar = multi.add(ProgressBar::new(100));
        bar.set_style(style.clone());
        bar.set_message(repo.description().to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        let acquirer = &acquirer;

        async move {
            let mut on_progress = |percent: u8| bar.set_position(u64::from(percent));
            let result = acquirer.clone_repository(repo, Some(&mut on_progress)).await;
            bar.finish_and_clear();
            (repo, result)
        }
    }))
    .await;

    let succeeded = report_results(&results, "download");
    if succeeded == 0 {
        bail!("failed to download any repository");
    }

    if ctx.gallery.core().is_some_and(|core| core.is_downloaded()) {
        ctx.synchronize(true)?;
    } else {
        warn!("core repository missing, skipping synchronization");
    }

    Ok(())
}

async fn run_update(file: ConfigFile, opts: UpdateOptions) -> Result<()> {
    let ctx = Context::load(file)?;
    let downloaded = ctx.gallery.downloaded();
    if downloaded.is_empty() {
        bail!("nothing downloaded yet, run `mirrorkeep download` first");
    }

    let acquirer = ctx.acquirer()?;
    let results = join_all(downloaded.iter().map(|repo| {
        let acquirer = &acquirer;
        async move { (repo, acquirer.update_repository(repo).await) }
    }))
    .await;

    let succeeded = report_results(&results, "update");
    if succeeded == 0 {
        bail!("failed to update any repository");
    }

    let changed = results
        .iter()
        .any(|(_, result)| result.has_changes || result.was_force_reset);
    if changed || opts.force_sync {
        ctx.synchronize(false)?;
    } else {
        info!("nothing changed upstream, skipping synchronization");
    }

    Ok(())
}

/// Log outcome of every acquisition and return number of successes.
fn report_results(results: &[(&RepositoryDescriptor, AcquisitionResult)], action: &str) -> usize {
    let mut succeeded = 0;
    for (repo, result) in results {
        match &result.error {
            None => {
                succeeded += 1;
                if result.was_force_reset {
                    warn!(
                        "{} diverged from upstream, reset onto it through {}",
                        repo.description(),
                        result.node_name
                    );
                } else if result.has_changes {
                    info!("{}: {action} through {} done", repo.description(), result.node_name);
                } else {
                    info!("{}: already up to date", repo.description());
                }
            }
            Some(err) => {
                error!("{}: {action} failed ({}): {err}", repo.description(), result.node_name);
                let mut source = std::error::Error::source(err);
                while let Some(cause) = source {
                    error!("  caused by: {cause}");
                    source = cause.source();
                }
            }
        }
    }

    if succeeded > 0 && succeeded < results.len() {
        warn!("{action} finished for {succeeded} of {} repositories", results.len());
    }

    succeeded
}

fn run_sync(file: ConfigFile, opts: SyncOptions) -> Result<()> {
    Context::load(file)?.synchronize(opts.initial)?;
    Ok(())
}

fn run_ban(file: ConfigFile, opts: BanCommand) -> Result<()> {
    let ctx = Context::load(file)?;
    let items = ctx.metadata()?.content_items()?;
    let bans = BanService::new(ctx.store.clone());
    let level = ctx.config.sync.purification_level;

    match opts {
        BanCommand::Add { identifier } => {
            let item = find_item(&items, &identifier)
                .ok_or_else(|| anyhow!("no content item matches {identifier:?}"))?;
            bans.add(item, level)?;
            ctx.synchronize(false)?;
        }
        BanCommand::Remove { identifier } => {
            let item = find_item(&items, &identifier)
                .ok_or_else(|| anyhow!("no content item matches {identifier:?}"))?;
            bans.remove(item, level)?;
            ctx.synchronize(false)?;
        }
        BanCommand::List => {
            let categories = bans.categorize(&items, &ctx.config.sync.settings())?;
            info!("{} manually banned", categories.user_banned.len());
            for item in &categories.user_banned {
                info!("  {} ({})", item.relative_path, item.owner);
            }

            info!("{} banned upstream", categories.upstream_banned.len());
            for item in &categories.upstream_banned {
                info!("  {} ({})", item.relative_path, item.owner);
            }

            info!("{} excluded by rules", categories.rule_excluded.len());
            for (item, reasons) in &categories.rule_excluded {
                let reasons = reasons
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                info!("  {} ({}): {reasons}", item.relative_path, item.owner);
            }
        }
    }

    Ok(())
}

fn run_settings(file: ConfigFile, opts: SettingsOptions) -> Result<()> {
    if opts.enable || opts.disable {
        file.set_sync_enabled(opts.enable)?;
    }

    if let Some(level) = opts.level {
        file.set_purification_level(level)?;
    }

    for (group, path) in opts.target {
        file.set_sync_target(&group, Some(path))?;
    }

    for group in opts.unset_target {
        file.set_sync_target(&group, None)?;
    }

    let sync = file.load()?.sync;
    info!("enabled: {}", sync.enabled);
    info!("purification level: {}", sync.purification_level);
    info!(
        "filter: ai = {}, easter egg = {}, layout = {}",
        sync.filter.ai, sync.filter.easter_egg, sync.filter.layout
    );
    for (group, path) in &sync.targets {
        info!("target {group}: {:?}", path.display());
    }

    Ok(())
}

fn run_status(file: ConfigFile) -> Result<()> {
    let ctx = Context::load(file)?;
    for repo in ctx.gallery.all() {
        let marker = if repo.is_core() { " (core)" } else { "" };
        if !repo.is_downloaded() {
            info!("{}{marker}: not downloaded", repo.description());
            continue;
        }

        let size = HumanBytes(dir_size(repo.local_path()));
        match head_commit(repo.local_path()) {
            Ok(head) => info!(
                "{}{marker}: {} {:?} at {}, {size}",
                repo.description(),
                head.short_id,
                head.summary,
                head.time.format("%Y-%m-%d %H:%M")
            ),
            Err(err) => warn!("{}{marker}: cannot read HEAD: {err}", repo.description()),
        }
    }

    Ok(())
}

async fn run_clean(file: ConfigFile) -> Result<()> {
    let config = file.load()?;
    let removed = sweep_stale_clones(&config.paths.temp_dir()?).await?;
    info!("removed {removed} stale clones");

    Ok(())
}
