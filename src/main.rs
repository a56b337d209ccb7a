use std::{env, process};

use pieceswarm::{conf::Conf, engine, PeerId};

#[tokio::main]
async fn main() {
    env_logger::init();

    let peer_id: PeerId = match env::args().nth(1).map(|arg| arg.parse()) {
        Some(Ok(id)) if id > 0 => id,
        _ => {
            eprintln!("Usage: pieceswarm <peer-id>");
            process::exit(1);
        }
    };

    let conf = match Conf::load(".") {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("Peer {}: {}", peer_id, e);
            process::exit(1);
        }
    };

    if let Err(e) = engine::run(peer_id, conf, ".").await {
        eprintln!("Peer {} failed: {}", peer_id, e);
        process::exit(1);
    }
}
