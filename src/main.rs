use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};

use volstore::needle_map::open_needle_map;
use volstore::scan::{scan_data_file, RebuildIndexScanner, VolumeFileScanner};
use volstore::superblock::SuperBlock;
use volstore::types::random_cookie;
use volstore::volume::volume_base_name;
use volstore::{
    FileId, Needle, NeedleMapKind, ReplicaPlacement, Result, Store, StoreOptions, Ttl,
};

#[derive(Parser)]
#[command(name = "vols", version, about = "Needle/volume storage engine CLI")]
struct Cli {
    /// Data directory holding the volume files
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,
    /// Collection name ("" for the default collection)
    #[arg(short, long, default_value = "")]
    collection: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump every record of a volume: id, cookie, offset, size, append time
    SeeDat {
        volume_id: u32,
    },
    /// Regenerate a volume's .idx by scanning its .dat
    RebuildIndex {
        volume_id: u32,
        /// Needle map kind: compact, btree, or sled
        #[arg(short, long, default_value = "compact")]
        kind: String,
    },
    /// Compact a volume, dropping deleted and overwritten records
    Compact {
        volume_id: u32,
    },
    /// Print the status of every volume in the directory as JSON
    Status {
        volume_ids: Vec<u32>,
    },
    /// Serve follow streams for the given volumes
    Serve {
        #[arg(short, long, default_value = "127.0.0.1:9333")]
        listen: String,
        volume_ids: Vec<u32>,
    },
    /// Incrementally replicate a volume from a leader
    Follow {
        volume_id: u32,
        leader: String,
    },
    /// Store a file's bytes under a key (creates the volume if absent)
    Put {
        volume_id: u32,
        key: u64,
        file: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        mime: Option<String>,
        /// Per-needle TTL, e.g. 5m, 3h, 7d
        #[arg(long)]
        ttl: Option<String>,
    },
    /// Read a needle's bytes to stdout or a file
    Get {
        volume_id: u32,
        key: u64,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a needle
    Del {
        volume_id: u32,
        key: u64,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::SeeDat { volume_id } => {
            let base = volume_base_name(&cli.dir, &cli.collection, volume_id);
            let file = std::fs::File::open(base.with_extension("dat"))?;
            let mut scanner = SeeDatScanner { volume_id, records: 0 };
            scan_data_file(&file, &mut scanner)?;
            eprintln!("{} records", scanner.records);
        }

        Commands::RebuildIndex { volume_id, kind } => {
            let kind = NeedleMapKind::from_name(&kind).unwrap_or_default();
            let base = volume_base_name(&cli.dir, &cli.collection, volume_id);
            let idx = base.with_extension("idx");
            if idx.exists() {
                std::fs::remove_file(&idx)?;
            }
            let file = std::fs::File::open(base.with_extension("dat"))?;
            let mut nm = open_needle_map(kind, &base)?;
            let mut scanner = RebuildIndexScanner::new(nm.as_mut());
            scan_data_file(&file, &mut scanner)?;
            nm.close()?;
            println!(
                "rebuilt {}: {} live needles, max key {}",
                idx.display(),
                nm.file_count(),
                nm.max_file_key()
            );
        }

        Commands::Compact { volume_id } => {
            let store = open_store(&cli.dir)?;
            store.mount_volume(volume_id, &cli.collection)?;
            let before = store.volume(volume_id).map(|v| v.size()).unwrap_or(0);
            store.compact_volume(volume_id)?;
            let after = store.volume(volume_id).map(|v| v.size()).unwrap_or(0);
            store.unmount_volume(volume_id)?;
            println!("compacted volume {volume_id}: {before} -> {after} bytes");
        }

        Commands::Status { volume_ids } => {
            let store = open_store(&cli.dir)?;
            let ids = if volume_ids.is_empty() {
                discover_volume_ids(&cli.dir, &cli.collection)?
            } else {
                volume_ids
            };
            for id in ids {
                store.mount_volume(id, &cli.collection)?;
            }
            println!("{}", serde_json::to_string_pretty(&store.status())?);
        }

        Commands::Serve { listen, volume_ids } => {
            let store = Arc::new(open_store(&cli.dir)?);
            for id in volume_ids {
                store.mount_volume(id, &cli.collection)?;
            }
            let listener = TcpListener::bind(&listen)?;
            println!("serving follows on {listen}");
            store.serve_follow(listener)?;
        }

        Commands::Follow { volume_id, leader } => {
            let store = open_store(&cli.dir)?;
            store.mount_volume(volume_id, &cli.collection)?;
            store.follow(volume_id, &leader)?;
            let size = store.volume(volume_id).map(|v| v.size()).unwrap_or(0);
            store.unmount_volume(volume_id)?;
            println!("volume {volume_id} caught up, {size} bytes");
        }

        Commands::Put { volume_id, key, file, name, mime, ttl } => {
            let store = open_store(&cli.dir)?;
            if store.mount_volume(volume_id, &cli.collection).is_err() {
                store.allocate_volume(
                    volume_id,
                    &cli.collection,
                    ReplicaPlacement::default(),
                    Ttl::NONE,
                    0,
                )?;
            }
            let data = std::fs::read(&file)?;
            let mut needle = Needle::new(key, random_cookie(), data);
            if let Some(name) = name {
                needle.set_name(name.as_bytes());
            }
            if let Some(mime) = mime {
                needle.set_mime(mime.as_bytes());
            }
            if let Some(ttl) = ttl.as_deref().and_then(Ttl::parse) {
                needle.set_ttl(ttl);
            }
            let size = store.write(volume_id, &mut needle)?;
            store.unmount_volume(volume_id)?;
            println!(
                "stored {} ({size} B) as {}",
                file.display(),
                FileId::new(volume_id, key, needle.cookie)
            );
        }

        Commands::Get { volume_id, key, output } => {
            let store = open_store(&cli.dir)?;
            store.mount_volume(volume_id, &cli.collection)?;
            let needle = store.read(volume_id, key)?;
            store.unmount_volume(volume_id)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &needle.data)?;
                    eprintln!("{} B -> {}", needle.data.len(), path.display());
                }
                None => std::io::Write::write_all(&mut std::io::stdout(), &needle.data)?,
            }
        }

        Commands::Del { volume_id, key } => {
            let store = open_store(&cli.dir)?;
            store.mount_volume(volume_id, &cli.collection)?;
            let freed = store.delete(volume_id, key)?;
            store.unmount_volume(volume_id)?;
            println!("deleted {key}: {freed} bytes reclaimable");
        }
    }
    Ok(())
}

/// Volume ids in `dir` whose file names match the collection
/// (`<collection>_<id>.dat`, or `<id>.dat` for the default collection).
fn discover_volume_ids(dir: &std::path::Path, collection: &str) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("dat") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let id_part = match stem.rsplit_once('_') {
            Some((coll, id)) if coll == collection => id,
            None if collection.is_empty() => stem,
            _ => continue,
        };
        if let Ok(id) = id_part.parse::<u32>() {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn open_store(dir: &std::path::Path) -> Result<Store> {
    Store::new(StoreOptions {
        dir: dir.to_owned(),
        needle_map_kind: None,
        volume_size_limit: 0,
    })
}

struct SeeDatScanner {
    volume_id: u32,
    records: u64,
}

impl VolumeFileScanner for SeeDatScanner {
    fn visit_super_block(&mut self, super_block: &SuperBlock) -> Result<()> {
        eprintln!(
            "volume {}: version {}, replication {}, ttl \"{}\", revision {}",
            self.volume_id,
            super_block.version.byte(),
            super_block.replica_placement,
            super_block.ttl,
            super_block.compact_revision
        );
        Ok(())
    }

    fn read_needle_body(&self) -> bool {
        true
    }

    fn visit_needle(&mut self, needle: &Needle, offset: u64) -> Result<()> {
        self.records += 1;
        let appended = Utc
            .timestamp_opt(
                (needle.append_at_ns / 1_000_000_000) as i64,
                (needle.append_at_ns % 1_000_000_000) as u32,
            )
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| needle.append_at_ns.to_string());
        println!(
            "{} offset {} size {} data {}B appended {}",
            FileId::new(self.volume_id, needle.id, needle.cookie),
            offset,
            needle.size,
            needle.data.len(),
            appended
        );
        Ok(())
    }
}
