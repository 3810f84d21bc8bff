use anyhow::{anyhow, Context as _};
use clap::Parser;
use orchard_fuse::{
    cache::ContentCache,
    config::Config,
    fs,
    remote::{OfflineDrive, RemoteDrive},
    store::Store,
    sync::SyncEngine,
    vfs::Vfs,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Mount an iCloud drive as a write-back cached FUSE filesystem.
#[derive(Debug, Parser)]
#[clap(about, version)]
struct Opt {
    /// Apple ID owning the drive (overrides the config file).
    #[clap(long)]
    apple_id: Option<String>,
    /// Where to mount the drive (overrides the config file).
    #[clap(long)]
    mount_point: Option<PathBuf>,
    /// Location of the metadata store.
    #[clap(long)]
    db_path: Option<PathBuf>,
    /// Session credential directory of the auth subsystem.
    #[clap(long)]
    cookie_dir: Option<PathBuf>,
    /// Alternative config file.
    #[clap(long)]
    config: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        log::error!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let config_path = opt.config.unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;
    if let Some(apple_id) = opt.apple_id {
        config.apple_id = Some(apple_id);
    }
    if let Some(mount_point) = opt.mount_point {
        config.mount_point = mount_point;
    }
    if let Some(db_path) = opt.db_path {
        config.db_path = db_path;
    }
    if let Some(cookie_dir) = opt.cookie_dir {
        config.cookie_dir = cookie_dir;
    }
    let apple_id = config
        .apple_id
        .clone()
        .ok_or_else(|| anyhow!("no Apple ID configured; pass --apple-id or edit the config"))?;

    log::info!(
        "Starting orchard-fuse for {} at {}",
        apple_id,
        config.mount_point.display()
    );
    std::fs::create_dir_all(&config.cookie_dir)
        .with_context(|| format!("cannot create {}", config.cookie_dir.display()))?;

    let store = Arc::new(Store::open(&config.db_path).context("cannot open the store")?);
    let cache =
        ContentCache::new(&config.cache_dir, &config.cache).context("cannot open the cache")?;

    // The authenticated session comes from the external auth subsystem via
    // the RemoteDrive seam; until one is wired in the engine idles offline,
    // retrying each tick while every captured intent stays queued durably.
    let remote: Box<dyn RemoteDrive> = Box::new(OfflineDrive::default());

    let running = Arc::new(AtomicBool::new(true));
    let engine_running = Arc::clone(&running);
    let engine_store = store.reopen().context("cannot open the engine store")?;
    let engine_cache = cache.clone();
    let sync_config = config.sync.clone();
    let engine = std::thread::Builder::new()
        .name("sync-engine".to_owned())
        .spawn(move || {
            SyncEngine::new(engine_store, engine_cache, remote, sync_config).run(&engine_running);
        })
        .context("cannot start the sync engine")?;

    let vfs = Vfs::new(store, cache, config.adapter.clone());
    let mounted = fs::mount(vfs, &config.mount_point)
        .with_context(|| format!("cannot mount at {}", config.mount_point.display()));

    running.store(false, Ordering::SeqCst);
    let _ = engine.join();
    mounted
}
