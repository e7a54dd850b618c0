use serde_json::{Value, json};
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use swarm_node::{
    api::{self, ApiState},
    config::Config,
    engine::{FetchPolicy, HttpBlockFetcher, Registry, RegistryConfig, TaskState},
};
use tokio::sync::oneshot;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    let id = NEXT.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("{prefix}_{}_{}", std::process::id(), id))
}

fn reserve_loopback_port() -> u16 {
    let listener =
        std::net::TcpListener::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)).unwrap();
    listener.local_addr().unwrap().port()
}

fn manifest_json(name: &str, data: &[u8], block_size: usize) -> (String, Vec<u8>) {
    let file_md5 = format!("{:x}", md5::compute(data));
    let parts: Vec<String> = data
        .chunks(block_size)
        .map(|c| format!("{:x}", md5::compute(c)))
        .collect();
    let doc = json!({
        "version": "1.0",
        "contenttype": "singlefile",
        "file_name": name,
        "file_size": data.len(),
        "file_md5": file_md5,
        "block_size": block_size,
        "part_count": parts.len(),
        "file_parts": parts,
    });
    (file_md5, serde_json::to_vec(&doc).unwrap())
}

fn registry_config(root: &Path) -> RegistryConfig {
    RegistryConfig {
        root: root.to_path_buf(),
        max_file_num: 4,
        max_workers_per_file: 3,
        policy: FetchPolicy {
            schedule_every: Duration::from_millis(10),
            jobs_per_tick: 4,
            ..FetchPolicy::default()
        },
    }
}

async fn wait_until_ready(client: &reqwest::Client, url: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(resp) = client
            .get(url)
            .timeout(Duration::from_millis(200))
            .send()
            .await
            && resp.status().is_success()
        {
            return;
        }
        assert!(Instant::now() < deadline, "{url} did not become ready in time");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn downloader_fetches_every_block_from_sharing_peer() {
    let seeder_root = unique_temp_dir("swarm_node_seeder");
    let leecher_root = unique_temp_dir("swarm_node_leecher");
    let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    let (hash, manifest) = manifest_json("payload.bin", &data, 64 * 1024);

    std::fs::create_dir_all(seeder_root.join("share")).unwrap();
    std::fs::write(seeder_root.join("share/payload.bin"), &data).unwrap();
    let idle_fetcher = HttpBlockFetcher::new(
        None,
        Vec::new(),
        Duration::from_secs(30),
        Duration::from_secs(5),
    )
    .unwrap();
    let seeder = Arc::new(
        Registry::create(registry_config(&seeder_root), Arc::new(idle_fetcher))
            .await
            .unwrap(),
    );
    seeder.create_share_task(&manifest).await.unwrap();

    let port = reserve_loopback_port();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(api::serve(
        "bt",
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port),
        api::bt_router(ApiState::new(Arc::clone(&seeder), None)),
        async move {
            let _ = stop_rx.await;
        },
    ));
    let client = reqwest::Client::new();
    wait_until_ready(&client, &format!("http://127.0.0.1:{port}/hello")).await;

    let fetcher = HttpBlockFetcher::new(
        None,
        vec![format!("127.0.0.1:{port}")],
        Duration::from_secs(30),
        Duration::from_secs(5),
    )
    .unwrap();
    let leecher = Registry::create(registry_config(&leecher_root), Arc::new(fetcher))
        .await
        .unwrap();
    leecher
        .create_download_task(&hash, "incoming", &manifest)
        .await
        .unwrap();

    let task = leecher.task(&hash).await.unwrap();
    let mut rx = task.subscribe();
    tokio::time::timeout(Duration::from_secs(20), async {
        while rx.borrow_and_update().state != TaskState::Share {
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("download finished in time");

    let fetched = std::fs::read(leecher_root.join("downloads/incoming/payload.bin")).unwrap();
    assert_eq!(fetched, data);
    assert_eq!(task.status().downloaded_bytes, data.len() as u64);

    leecher.shutdown().await;
    seeder.shutdown().await;
    let _ = stop_tx.send(());
    server.await.unwrap().unwrap();
    let _ = std::fs::remove_dir_all(seeder_root);
    let _ = std::fs::remove_dir_all(leecher_root);
}

#[tokio::test]
async fn node_serves_admin_api_and_stops_on_shutdown() {
    let root = unique_temp_dir("swarm_node_app");
    let mut cfg = Config::default();
    cfg.general.root_path = root.display().to_string();
    cfg.tracker.enabled = false;
    cfg.api.host = "127.0.0.1".to_string();
    cfg.api.port = reserve_loopback_port();
    cfg.bt.host = "127.0.0.1".to_string();
    cfg.bt.port = reserve_loopback_port();
    let admin_port = cfg.api.port;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let node = tokio::spawn(swarm_node::app::run_until(cfg, async move {
        let _ = stop_rx.await;
    }));

    let client = reqwest::Client::new();
    wait_until_ready(&client, &format!("http://127.0.0.1:{admin_port}/hello")).await;
    let stats: Value = client
        .get(format!("http://127.0.0.1:{admin_port}/api/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["status"], 0);
    assert_eq!(stats["result"]["current_file_num"], 0);
    assert_eq!(stats["result"]["max_file_num"], 128);

    let peer_id = std::fs::read_to_string(root.join(".catalog-root/peer_id")).unwrap();
    assert_eq!(peer_id.trim().len(), 20);

    let _ = stop_tx.send(());
    tokio::time::timeout(Duration::from_secs(10), node)
        .await
        .expect("node stopped in time")
        .unwrap()
        .unwrap();
    let _ = std::fs::remove_dir_all(root);
}
