use lanfetch::{
    Announcement, Config, DownloadError, DownloadRequest, Identifier, IpVersion, LanService,
    ServiceEvent, StaticProbe, PROTOCOL_VERSION,
};
use std::{
    net::{IpAddr, Ipv4Addr},
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tempfile::TempDir;
use tokio::{net::UdpSocket, sync::mpsc, time};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_log() {
    let _ = pretty_env_logger::try_init();
}

/// Localhost only, no multicast, ports chosen by the OS.
fn local_config(machine_id: &str) -> Config {
    Config {
        machine_id: machine_id.to_owned(),
        tcp_port: 0,
        tcp_bind_ip: Ipv4Addr::LOCALHOST.into(),
        ip_versions: vec![IpVersion::V4],
        discovery_enabled: false,
        rpc_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

async fn wait_for_contacts(service: &LanService, count: usize) {
    time::timeout(TIMEOUT, async {
        while service.known_contacts().len() < count {
            time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap()
}

async fn next_discovered(events: &mut mpsc::UnboundedReceiver<ServiceEvent>) -> Identifier {
    time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Some(ServiceEvent::ContactDiscovered(contact)) => return contact.id,
                Some(_) => continue,
                None => panic!("service stopped"),
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_and_bootstrap() {
    init_log();

    let (a, mut a_events) = LanService::builder()
        .set_config(local_config("machine-a"))
        .start()
        .await
        .unwrap();

    let (b, mut b_events) = LanService::builder()
        .set_config(local_config("machine-b"))
        .add_node(a.local_addr())
        .start()
        .await
        .unwrap();

    // Both sides learn about each other from the single handshake.
    assert_eq!(next_discovered(&mut b_events).await, a.local_id());
    assert_eq!(next_discovered(&mut a_events).await, b.local_id());

    assert!(a.bootstrapped(Some(TIMEOUT)).await);
    assert!(b.bootstrapped(Some(TIMEOUT)).await);

    let known: Vec<_> = b.known_contacts().into_iter().map(|c| c.id).collect();
    assert_eq!(known, vec![a.local_id()]);

    let state = a.state().await.unwrap();
    assert!(state.is_running);
    assert!(state.bootstrapped);
    assert_eq!(state.good_contact_count, 1);
    assert_eq!(state.bucket_count, 1);

    b.stop();
    a.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_walks_to_peers_of_peers() {
    init_log();

    let (hub, _) = LanService::builder()
        .set_config(local_config("hub"))
        .start()
        .await
        .unwrap();

    let mut spokes = Vec::new();
    for n in 0..3 {
        let (spoke, _) = LanService::builder()
            .set_config(local_config(&format!("spoke-{}", n)))
            .add_node(hub.local_addr())
            .start()
            .await
            .unwrap();
        assert!(spoke.bootstrapped(Some(TIMEOUT)).await);
        spokes.push(spoke);
    }

    // The last one only talked to the hub, but the lookup towards its own id reached the others.
    let last = spokes.last().unwrap();
    wait_for_contacts(last, 3).await;

    for service in spokes.iter().chain([&hub]) {
        service.stop();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_announcement_handshakes_once() {
    init_log();

    let (listener, mut events) = LanService::builder()
        .set_config(Config {
            discovery_enabled: true,
            discovery_port: 0,
            ..local_config("listener")
        })
        .set_interface_probe(Box::new(StaticProbe(
            [IpAddr::from(Ipv4Addr::LOCALHOST)].into_iter().collect(),
        )))
        .start()
        .await
        .unwrap();

    let (announcer, _) = LanService::builder()
        .set_config(local_config("announcer"))
        .start()
        .await
        .unwrap();

    let state = listener.state().await.unwrap();
    let port = state.discovery_listeners[0].port();

    let datagram = Announcement {
        correlation_id: 7,
        protocol_version: PROTOCOL_VERSION,
        tcp_port: announcer.local_addr().port(),
        machine_id: "announcer".to_owned(),
    }
    .encode();

    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    for _ in 0..2 {
        socket
            .send_to(&datagram, (Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();
    }

    assert_eq!(next_discovered(&mut events).await, announcer.local_id());

    // Give the second copy time to be (not) acted upon.
    time::sleep(Duration::from_millis(300)).await;

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, ServiceEvent::ContactDiscovered(_)),
            "unexpected {:?}",
            event
        );
    }

    let stats = listener.state().await.unwrap().discovery;
    assert_eq!(stats.announcements_received, 1);
    assert_eq!(stats.duplicates_suppressed, 1);
    assert_eq!(stats.acknowledge_exchanges, 1);

    announcer.stop();
    listener.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn store_and_find_value() {
    init_log();

    let (a, _) = LanService::builder()
        .set_config(local_config("a"))
        .start()
        .await
        .unwrap();
    let (b, _) = LanService::builder()
        .set_config(local_config("b"))
        .add_node(a.local_addr())
        .start()
        .await
        .unwrap();
    let (c, _) = LanService::builder()
        .set_config(local_config("c"))
        .add_node(a.local_addr())
        .start()
        .await
        .unwrap();

    assert!(b.bootstrapped(Some(TIMEOUT)).await);
    assert!(c.bootstrapped(Some(TIMEOUT)).await);

    let key = Identifier::sha1(b"shared-settings");
    assert!(b.store(key, b"dark-mode".to_vec()).await > 0);
    assert_eq!(c.find_value(key).await, Some(b"dark-mode".to_vec()));
    assert_eq!(c.find_value(Identifier::sha1(b"missing")).await, None);

    for service in [a, b, c] {
        service.stop();
    }
}

/// Write `data` under `root/prefix/name` with the given modification time.
fn share(root: &Path, prefix: &str, name: &str, data: &[u8], modified: SystemTime) {
    let folder = root.join(prefix);
    std::fs::create_dir_all(&folder).unwrap();

    let path = folder.join(name);
    std::fs::write(&path, data).unwrap();
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(modified)
        .unwrap();
}

fn version_of(path: &Path) -> String {
    let modified = std::fs::metadata(path).unwrap().modified().unwrap();
    modified
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos()
        .to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn download_from_several_peers() {
    init_log();

    let data: Vec<u8> = (0..3 * 1024 * 1024 + 17).map(|n| (n % 241) as u8).collect();
    let modified = UNIX_EPOCH + Duration::from_secs(1_700_000_000);

    let mut seeders = Vec::new();
    let mut shared = Vec::new();

    for n in 0..3 {
        let dir = TempDir::new().unwrap();
        share(dir.path(), "albums/2023", "cover.png", &data, modified);

        let (seeder, _) = LanService::builder()
            .set_config(local_config(&format!("seeder-{}", n)))
            .add_bucket("pictures", dir.path())
            .start()
            .await
            .unwrap();

        seeders.push(seeder);
        shared.push(dir);
    }

    let version = version_of(&shared[0].path().join("albums/2023/cover.png"));

    let mut builder = LanService::builder().set_config(Config {
        max_chunk_size: 256 * 1024,
        ..local_config("leecher")
    });
    for seeder in &seeders {
        builder = builder.add_node(seeder.local_addr());
    }
    let (leecher, _) = builder.start().await.unwrap();

    wait_for_contacts(&leecher, seeders.len()).await;

    let target = TempDir::new().unwrap();
    let request = DownloadRequest {
        folder: target.path().to_path_buf(),
        bucket: "pictures".to_owned(),
        prefix: "albums/2023".to_owned(),
        name: "cover.png".to_owned(),
        size: data.len() as u64,
        version: version.clone(),
    };

    let path = leecher
        .download_file(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), data);
    assert_eq!(std::fs::read_dir(target.path()).unwrap().count(), 1);

    // Asking again for the same file is refused locally.
    assert!(matches!(
        leecher
            .download_file(&request, &CancellationToken::new())
            .await,
        Err(DownloadError::AlreadyExists(_))
    ));

    // Nobody has this version.
    let other = TempDir::new().unwrap();
    let stale = DownloadRequest {
        folder: other.path().to_path_buf(),
        version: "1".to_owned(),
        ..request
    };
    assert!(matches!(
        leecher
            .download_file(&stale, &CancellationToken::new())
            .await,
        Err(DownloadError::NotFound)
    ));
    assert_eq!(std::fs::read_dir(other.path()).unwrap().count(), 0);

    leecher.stop();
    for seeder in seeders {
        seeder.stop();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_service_reports_nothing() {
    init_log();

    let (service, _) = LanService::builder()
        .set_config(local_config("short-lived"))
        .start()
        .await
        .unwrap();

    assert_eq!(service.query_all_services().await, None);

    service.stop();
    time::sleep(Duration::from_millis(50)).await;

    assert!(service.state().await.is_none());
    assert!(!service.bootstrapped(Some(Duration::from_millis(100))).await);
}
