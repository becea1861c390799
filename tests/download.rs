//! End-to-end exchange between two in-process peers: a seed with the full
//! payload and a leech starting from nothing, over loopback TCP.

use std::{sync::Arc, time::Duration};

use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

use streamtorrent::{
    conf::Conf,
    coordinator::{Coordinator, Params},
    listener::Listener,
    pool::ConnectionPool,
    storage::{MemoryStorage, Storage, StorageInfo},
};

const PIECE_LEN: u32 = 0x4000;
const PIECE_COUNT: usize = 4;

fn payload() -> Vec<u8> {
    (0..PIECE_COUNT * PIECE_LEN as usize)
        .map(|i| (i * 31 % 251) as u8)
        .collect()
}

fn piece_hashes(data: &[u8]) -> Vec<[u8; 20]> {
    data.chunks(PIECE_LEN as usize)
        .map(|piece| {
            let mut hasher = Sha1::new();
            hasher.update(piece);
            hasher.finalize().into()
        })
        .collect()
}

struct Completion(mpsc::UnboundedSender<()>);

impl Listener for Completion {
    fn download_complete(&self) {
        self.0.send(()).ok();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn leech_downloads_from_seed() {
    let data = payload();
    let info = StorageInfo::new(PIECE_LEN, data.len() as u64);
    let hashes = piece_hashes(&data);
    let info_hash = [0x21; 20];

    let seed = Coordinator::new(Params {
        conf: Conf::new(*b"-st0100-seed00000001"),
        info,
        info_hash,
        piece_hashes: hashes.clone(),
        storage: Arc::new(MemoryStorage::seeded(info, data.clone())),
        source: None,
        listeners: vec![],
    });
    let seed_pool = ConnectionPool::spawn(Arc::clone(&seed));
    let addr = seed_pool
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    seed.set_tracker();

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let leech_storage = Arc::new(MemoryStorage::new(info));
    let leech = Coordinator::new(Params {
        conf: Conf::new(*b"-st0100-leech0000001"),
        info,
        info_hash,
        piece_hashes: hashes,
        storage: Arc::clone(&leech_storage) as Arc<dyn Storage>,
        source: None,
        listeners: vec![Arc::new(Completion(done_tx))],
    });
    leech.set_tracker();
    let leech_pool = ConnectionPool::spawn(Arc::clone(&leech));
    leech_pool.connect(addr);

    tokio::time::timeout(Duration::from_secs(30), done_rx.recv())
        .await
        .expect("download did not complete in time")
        .expect("completion listener dropped");

    assert!(leech.is_complete());
    assert_eq!(leech.missing_piece_count(), 0);
    assert_eq!(leech_storage.data(), data);

    leech.halt();
    seed.halt();
}
