// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use console::Emoji;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ytsync::{
    ChannelUpdate, ConfigHandle, EventKind, GlobalConfig, JobState, ProgressEvent,
    ProgressSubscription, SchedulerOptions, Source, SourceKind, SourceRegistry, SyncJob,
    SyncJobScheduler, YtDlpFetcher, YtDlpOptions, default_config_dir,
};

// Emoji with fallback for terminals without Unicode support
static CLAPPER: Emoji<'_, '_> = Emoji("🎬 ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static TRASH: Emoji<'_, '_> = Emoji("🗑️  ", "[-] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static STOP: Emoji<'_, '_> = Emoji("⏹️  ", "[x] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");

/// Mirror YouTube channels and playlists to local storage
#[derive(Parser, Debug)]
#[command(name = "ytsync")]
#[command(about = "Mirror YouTube channels and playlists to local storage")]
#[command(version)]
struct Args {
    /// Directory holding settings.json and sources.json
    #[arg(long, env = "YTSYNC_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// yt-dlp executable
    #[arg(long, env = "YTSYNC_YT_DLP", default_value = "yt-dlp")]
    yt_dlp: PathBuf,

    /// Cookies file handed to yt-dlp
    #[arg(long)]
    cookies: Option<PathBuf>,

    /// yt-dlp format selector
    #[arg(long)]
    format: Option<String>,

    /// Seconds allowed for listing a source's videos
    #[arg(long, default_value = "300")]
    manifest_timeout: u64,

    /// Seconds allowed for downloading one video
    #[arg(long, default_value = "7200")]
    video_timeout: u64,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run periodic syncs until interrupted
    Serve,

    /// Sync one source now and follow its progress
    Sync {
        /// Channel handle or playlist id
        id: String,

        /// Print progress as plain lines
        #[arg(long)]
        plain: bool,
    },

    /// List configured sources
    List,

    /// Add a channel
    AddChannel {
        /// Channel handle, e.g. @example
        handle: String,

        /// Display name (defaults to the handle)
        #[arg(long)]
        name: Option<String>,

        /// Keep at most this many videos
        #[arg(long)]
        max_videos: Option<usize>,

        /// Keep only videos published within this many days
        #[arg(long)]
        max_age_days: Option<u32>,
    },

    /// Add a playlist
    AddPlaylist {
        /// Playlist id, e.g. PL...
        playlist_id: String,

        /// Display name (defaults to the playlist id)
        #[arg(long)]
        name: Option<String>,
    },

    /// Change a channel's name or limits; omitted options keep their value
    UpdateChannel {
        handle: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        max_videos: Option<usize>,

        /// Remove the video count limit
        #[arg(long, conflicts_with = "max_videos")]
        no_max_videos: bool,

        #[arg(long)]
        max_age_days: Option<u32>,

        /// Remove the age limit
        #[arg(long, conflicts_with = "max_age_days")]
        no_max_age: bool,
    },

    /// Rename a playlist
    UpdatePlaylist {
        playlist_id: String,

        #[arg(long)]
        name: String,
    },

    /// Remove a source and its downloaded videos
    Remove { id: String },

    /// Delete a source's downloaded videos, keeping the source
    Reset { id: String },

    /// Pause or resume background syncs
    TogglePause,

    /// Turn manifest cache maintenance on or off
    ToggleCache,

    /// Change a global setting
    #[command(subcommand)]
    Set(Setting),
}

#[derive(Subcommand, Debug)]
enum Setting {
    /// Minutes between periodic syncs
    Interval { minutes: u64 },

    /// Address the web front-end listens on
    ServerAddress { address: String },

    /// Directory videos are stored under
    MediaRoot { path: PathBuf },
}

fn init_tracing(command: &Command, verbose: u8) {
    let default_level = match (verbose, command) {
        (0, Command::Serve) => "info",
        (0, _) => "warn",
        (1, _) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ytsync={}", default_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Renders a job's progress events on the terminal
struct EventRenderer {
    bar: ProgressBar,
}

impl EventRenderer {
    fn new() -> Result<Self> {
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} {wide_msg}")
            .context("Invalid progress template")?;
        let bar = ProgressBar::new_spinner();
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(100));
        Ok(Self { bar })
    }

    fn render(&self, event: &ProgressEvent) {
        let text = event.text.as_str();
        match event.kind {
            Some(EventKind::Info) | None => {
                if text.starts_with('[') {
                    self.bar.set_message(format!("{DOWNLOAD}{}", text.cyan()));
                } else {
                    self.bar.set_message(format!("{SEARCH}{}", text));
                }
            }
            Some(EventKind::Downloaded) => {
                self.bar.println(format!("  {SUCCESS}{}", text.green()));
            }
            Some(EventKind::Deleted) => {
                self.bar.println(format!("  {TRASH}{}", text.yellow()));
            }
            Some(EventKind::Error) => {
                self.bar.println(format!("  {FAILURE}{}", text.red()));
            }
            Some(EventKind::Complete) => {
                self.bar.finish_and_clear();
                println!("\n{SUCCESS}{}", text.bold().green());
            }
            Some(EventKind::Cancelled) => {
                self.bar.finish_and_clear();
                println!("\n{STOP}{}", text.bold().yellow());
            }
        }
    }

    fn finish(&self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}

async fn follow(subscription: ProgressSubscription, plain: bool) -> Result<()> {
    if plain {
        let mut lines = subscription.into_lines();
        let mut stdout = std::io::stdout();
        while let Some(line) = lines.next().await {
            stdout
                .write_all(line.as_bytes())
                .and_then(|()| stdout.flush())
                .context("Failed to write progress")?;
        }
        return Ok(());
    }

    let renderer = EventRenderer::new()?;
    let mut subscription = subscription;
    while let Some(event) = subscription.next_event().await {
        renderer.render(&event);
    }
    renderer.finish();
    Ok(())
}

fn print_job_result(job: &SyncJob) {
    match job.state {
        JobState::Succeeded => println!(
            "{} {} downloaded, {} deleted, {} failed",
            "Done:".bold(),
            job.downloaded.to_string().green().bold(),
            job.deleted.to_string().yellow(),
            if job.failed > 0 {
                job.failed.to_string().red().bold()
            } else {
                job.failed.to_string().green()
            }
        ),
        JobState::Failed => println!(
            "{FAILURE}{} {}",
            "Sync failed:".red().bold(),
            job.error.as_deref().unwrap_or("unknown error")
        ),
        JobState::Cancelled => println!("{STOP}{}", "Sync cancelled".yellow()),
        JobState::Pending | JobState::Running => {}
    }
}

fn print_sources(registry: &SourceRegistry) {
    let sources = registry.list();
    if sources.is_empty() {
        println!("{}", "No sources configured".dimmed());
        return;
    }

    for source in sources {
        let limits = match &source.kind {
            SourceKind::Channel {
                max_videos,
                max_age_days,
                ..
            } => {
                let count = max_videos.map_or("all".to_string(), |n| format!("max {}", n));
                let age = max_age_days.map_or(String::new(), |d| format!(", {} days", d));
                format!("{}{}", count, age)
            }
            SourceKind::Playlist { .. } => "all".to_string(),
        };
        let checked = source
            .last_checked
            .map_or("never".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());

        println!(
            "{} {} {} ({})\n    {} videos, {}, last checked {}",
            source.kind_name().dimmed(),
            source.id.cyan().bold(),
            source.name,
            limits.dimmed(),
            registry.video_count(&source.id).to_string().green(),
            registry.media_dir(&source).display(),
            checked.dimmed()
        );
    }
}

fn print_settings(config: &GlobalConfig) {
    println!(
        "Background tasks: {}",
        if config.background_tasks_paused {
            "paused".yellow()
        } else {
            "running".green()
        }
    );
    println!(
        "Manifest cache:   {}",
        if config.maintain_manifest_cache {
            "maintained".green()
        } else {
            "bypassed".yellow()
        }
    );
    println!("Check interval:   {} minutes", config.check_interval_minutes);
    println!("Server address:   {}", config.server_address);
    println!(
        "{FOLDER}Media root: {}",
        config.media_root_path.display().to_string().cyan()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.command, args.verbose);

    let config_dir = args.config_dir.clone().unwrap_or_else(default_config_dir);
    let config = ConfigHandle::load(&config_dir)
        .with_context(|| format!("Failed to load settings from {}", config_dir.display()))?;
    let registry = Arc::new(
        SourceRegistry::load(&config_dir, config.clone())
            .with_context(|| format!("Failed to load sources from {}", config_dir.display()))?,
    );

    let fetcher = Arc::new(YtDlpFetcher::new(YtDlpOptions {
        program: args.yt_dlp.clone(),
        cookies: args.cookies.clone(),
        format: args.format.clone(),
    }));
    let scheduler = SyncJobScheduler::new(
        config.clone(),
        registry.clone(),
        fetcher,
        SchedulerOptions {
            manifest_timeout: Duration::from_secs(args.manifest_timeout),
            video_timeout: Duration::from_secs(args.video_timeout),
            manifest_ttl: None,
            ..SchedulerOptions::default()
        },
    );

    match args.command {
        Command::Serve => {
            println!(
                "\n{}{} {}\n",
                CLAPPER,
                "ytsync".bold().magenta(),
                "- YouTube mirror".dimmed()
            );
            print_settings(&config.snapshot());

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, shutting down");
                }
                signal.cancel();
            });

            scheduler.run(shutdown).await;
        }

        Command::Sync { id, plain } => {
            let job_id = scheduler
                .trigger(&id)
                .with_context(|| format!("Cannot sync '{}'", id))?;
            let subscription = scheduler
                .subscribe(job_id)
                .context("Progress log disappeared")?;

            tokio::select! {
                result = follow(subscription, plain) => result?,
                _ = tokio::signal::ctrl_c() => {
                    scheduler.cancel_all().await;
                }
            }

            let job = scheduler
                .wait(job_id)
                .await
                .context("Job state disappeared")?;
            if !plain {
                print_job_result(&job);
            }
            if job.state == JobState::Failed {
                std::process::exit(1);
            }
        }

        Command::List => print_sources(&registry),

        Command::AddChannel {
            handle,
            name,
            max_videos,
            max_age_days,
        } => {
            let name = name.unwrap_or_else(|| handle.clone());
            let source = registry
                .create(Source::channel(handle, name, max_videos, max_age_days))
                .context("Failed to add channel")?;
            println!("{SUCCESS}Added channel {}", source.id.cyan());
        }

        Command::AddPlaylist { playlist_id, name } => {
            let name = name.unwrap_or_else(|| playlist_id.clone());
            let source = registry
                .create(Source::playlist(playlist_id, name))
                .context("Failed to add playlist")?;
            println!("{SUCCESS}Added playlist {}", source.id.cyan());
        }

        Command::UpdateChannel {
            handle,
            name,
            max_videos,
            no_max_videos,
            max_age_days,
            no_max_age,
        } => {
            let Some(existing) = registry.get(&handle) else {
                bail!("Unknown source '{}'", handle);
            };
            if !matches!(existing.kind, SourceKind::Channel { .. }) {
                bail!("'{}' is not a channel", handle);
            }
            let update = ChannelUpdate {
                name,
                max_videos: ChannelUpdate::limit(max_videos, no_max_videos),
                max_age_days: ChannelUpdate::limit(max_age_days, no_max_age),
            };
            registry
                .update(&handle, existing.with_update(&update))
                .context("Failed to update channel")?;
            println!("{SUCCESS}Updated channel {}", handle.cyan());
        }

        Command::UpdatePlaylist { playlist_id, name } => {
            registry
                .update(&playlist_id, Source::playlist(playlist_id.clone(), name))
                .context("Failed to update playlist")?;
            println!("{SUCCESS}Updated playlist {}", playlist_id.cyan());
        }

        Command::Remove { id } => {
            scheduler
                .delete_source(&id)
                .await
                .with_context(|| format!("Failed to remove '{}'", id))?;
            println!("{TRASH}Removed {}", id.cyan());
        }

        Command::Reset { id } => {
            scheduler
                .reset(&id)
                .await
                .with_context(|| format!("Failed to reset '{}'", id))?;
            println!("{TRASH}Deleted all videos of {}", id.cyan());
        }

        Command::TogglePause => {
            let config = scheduler
                .toggle_background_tasks()
                .context("Failed to toggle background tasks")?;
            print_settings(&config);
        }

        Command::ToggleCache => {
            let config = scheduler
                .toggle_manifest_maintenance()
                .context("Failed to toggle manifest cache")?;
            print_settings(&config);
        }

        Command::Set(setting) => {
            let config = match setting {
                Setting::Interval { minutes } => config.set_check_interval(minutes),
                Setting::ServerAddress { address } => config.set_server_address(&address),
                Setting::MediaRoot { path } => config.set_media_root(&path),
            }
            .context("Failed to update settings")?;
            print_settings(&config);
        }
    }

    Ok(())
}
