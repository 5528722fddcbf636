use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

use versionfs::backend::localfs::LocalFsBackend;
use versionfs::config::{Config, Overrides, load_config};
use versionfs::control::server::{self, send_request};
use versionfs::control::{Opcode, RawRequest};
use versionfs::fuse::VersionFs;
use versionfs::fuse::mount::{mount_privileged, mount_unprivileged};
use versionfs::overlay::VersionedOverlay;
use versionfs::version::MAX_VIEW_SIZE;

#[derive(Parser)]
#[command(name = "versionfs", version, about = "Versioning FUSE overlay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the overlay and serve control requests until interrupted
    Mount(MountArgs),
    /// List retained versions (-1 newest, -2 or 1 oldest, 0 all)
    List {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        flag: i32,
    },
    /// Print the start of a retained version (newest by default)
    View {
        #[command(flatten)]
        target: Target,
        #[arg(long, allow_negative_numbers = true)]
        flag: Option<i32>,
        #[arg(long, default_value_t = MAX_VIEW_SIZE as u32)]
        size: u32,
    },
    /// Overwrite the file with a retained version
    Restore {
        #[command(flatten)]
        target: Target,
        #[arg(long, allow_negative_numbers = true)]
        flag: i32,
    },
    /// Delete retained versions (-1 newest, -2 oldest, 0 all, N one index)
    Delete {
        #[command(flatten)]
        target: Target,
        #[arg(long, allow_negative_numbers = true)]
        flag: i32,
    },
}

#[derive(Args)]
struct MountArgs {
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    backing: Option<PathBuf>,
    #[arg(long)]
    mountpoint: Option<PathBuf>,
    #[arg(long)]
    socket: Option<PathBuf>,
    #[arg(long)]
    fs_name: Option<String>,
    #[arg(long)]
    ttl_secs: Option<u64>,
    /// Mount without fusermount3 (needs CAP_SYS_ADMIN)
    #[arg(long)]
    privileged: bool,
    #[arg(long)]
    allow_other: bool,
}

#[derive(Args)]
struct Target {
    /// Path of the tracked file relative to the overlay root
    path: String,
    /// Control socket of a running mount
    #[arg(long, conflicts_with = "backing")]
    socket: Option<PathBuf>,
    /// Operate on a backing directory directly when no mount is running
    #[arg(long)]
    backing: Option<PathBuf>,
}

impl MountArgs {
    fn into_config(self) -> anyhow::Result<Config> {
        let overrides = Overrides {
            backing_dir: self.backing,
            mountpoint: self.mountpoint,
            control_socket: self.socket,
            fs_name: self.fs_name,
            privileged: self.privileged,
            allow_other: self.allow_other,
            ttl_secs: self.ttl_secs,
        };
        match self.config {
            Some(path) => {
                let mut cfg = load_config(&path)?;
                cfg.apply(overrides);
                Ok(cfg)
            }
            None => Config::from_overrides(overrides),
        }
    }
}

async fn run_mount(cfg: Config) -> anyhow::Result<()> {
    cfg.validate()?;
    let backend = Arc::new(LocalFsBackend::new(&cfg.backing_dir));
    let overlay = Arc::new(VersionedOverlay::new(backend));

    if let Some(socket) = cfg.control_socket.clone() {
        let dispatcher = overlay.dispatcher();
        tokio::spawn(async move {
            if let Err(e) = server::serve(&socket, dispatcher).await {
                error!("control server stopped: {e:?}");
            }
        });
    }

    let fs = VersionFs::new(overlay, cfg.ttl());
    let settings = cfg.mount_settings();
    let mut mount_handle = if cfg.unprivileged {
        info!("mounting {} (unprivileged)", cfg.mountpoint.display());
        mount_unprivileged(fs, &cfg.mountpoint, &settings)
            .await
            .context("unprivileged mount failed")?
    } else {
        info!("mounting {} (privileged)", cfg.mountpoint.display());
        mount_privileged(fs, &cfg.mountpoint, &settings)
            .await
            .context("privileged mount failed")?
    };

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.context("fuse session ended with an error")?,
        _ = signal::ctrl_c() => {
            mount_handle.unmount().await.context("unmount failed")?;
        }
    }
    if let Some(socket) = &cfg.control_socket {
        let _ = std::fs::remove_file(socket);
    }
    Ok(())
}

async fn run_admin(target: Target, request: RawRequest) -> anyhow::Result<Vec<u8>> {
    let result = match (&target.socket, &target.backing) {
        (Some(socket), _) => send_request(socket, &target.path, request).await,
        (None, Some(backing)) => {
            let overlay = VersionedOverlay::new(Arc::new(LocalFsBackend::new(backing)));
            overlay.control(&target.path, &request).await
        }
        (None, None) => bail!("one of --socket or --backing is required"),
    };
    result.with_context(|| format!("{} failed", target.path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let (target, request, newline) = match cli.command {
        Commands::Mount(args) => return run_mount(args.into_config()?).await,
        Commands::List { target, flag } => (target, RawRequest::new(Opcode::List, Some(flag), 0), true),
        Commands::View { target, flag, size } => {
            (target, RawRequest::new(Opcode::View, flag, size), false)
        }
        Commands::Restore { target, flag } => {
            (target, RawRequest::new(Opcode::Restore, Some(flag), 0), false)
        }
        Commands::Delete { target, flag } => {
            (target, RawRequest::new(Opcode::Delete, Some(flag), 0), false)
        }
    };

    let payload = run_admin(target, request).await?;
    let mut out = std::io::stdout().lock();
    out.write_all(&payload)?;
    if newline {
        writeln!(out)?;
    }
    Ok(())
}
