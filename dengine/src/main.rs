use clap::Parser;
use dengine::adapters::filesystem::NativeFileSystem;
use dengine::adapters::hasher::Sha1Hasher;
use dengine::adapters::socket::NativeSocketFactory;
use dengine::config::cfg::Cfg;
use dengine::engine::events::EngineEvent;
use dengine::engine::hub::{AddTorrentOptions, Engine};
use dengine::session::store::FileSessionStore;
use dengine::torrent::source::TorrentSource;
use std::path::Path;
use std::sync::Arc;

#[derive(Parser, Debug)]
struct Args {
    /// Path to a .torrent file to add.
    #[arg(short, long)]
    file: Option<String>,
    /// Magnet URI to add.
    #[arg(short, long)]
    magnet: Option<String>,
    #[arg(short, long)]
    config: String,
}

fn main() {
    tracing_subscriber::fmt().init();

    let args = Args::parse();
    let config = Cfg::new(args.config.trim()).expect("Config file not found or incomplete");

    let store = FileSessionStore::new(Path::new(&config.session_directory))
        .expect("session directory could not be created");
    let dht_enabled = config.dht_enabled;
    let engine = Engine::new(
        config,
        Arc::new(NativeFileSystem),
        Arc::new(Sha1Hasher),
        Arc::new(store),
        Arc::new(NativeSocketFactory),
        None,
    );
    let events = engine.take_event_receiver().expect("event receiver taken");

    engine.restore_torrents();
    if dht_enabled {
        engine.set_dht_enabled(true).expect("DHT socket could not be bound");
    }
    engine.run_server().expect("server socket could not be bound");

    let source = match (&args.file, &args.magnet) {
        (Some(path), _) => {
            let bytes = std::fs::read(path.trim()).expect("torrent file could not be read");
            Some(TorrentSource::TorrentFile(bytes))
        }
        (None, Some(uri)) => {
            Some(TorrentSource::from_magnet_uri(uri.trim()).expect("invalid magnet URI"))
        }
        (None, None) => None,
    };
    if let Some(source) = source {
        engine
            .add_torrent(source, AddTorrentOptions::default())
            .expect("torrent could not be added");
    }

    println!("Engine running ...");
    for event in events {
        match event {
            EngineEvent::TorrentAdded(hash) => println!("added {}", hash),
            EngineEvent::TorrentReady(hash) => println!("ready {}", hash),
            EngineEvent::PieceCompleted { info_hash, piece } => {
                println!("piece {} of {}", piece, info_hash)
            }
            EngineEvent::MetadataResolved { info_hash, .. } => {
                println!("metadata resolved for {}", info_hash)
            }
            EngineEvent::TorrentComplete(hash) => println!("complete {}", hash),
            EngineEvent::TorrentRemoved(hash) => println!("removed {}", hash),
            EngineEvent::TorrentError { info_hash, message } => {
                eprintln!("error on {}: {}", info_hash, message)
            }
            EngineEvent::InvariantViolation {
                info_hash,
                description,
            } => eprintln!("invariant violation on {}: {}", info_hash, description),
        }
    }
}
