mod common;

use std::sync::{Arc, Mutex};

use common::{FakeTransport, exit, ok, server};
use litesentry::core::discovery::DiscoveryError;
use litesentry::core::{CommandResult, DiscoveredDbFile, Discovery, DiscoveryOptions};
use tokio_util::sync::CancellationToken;

const STAT_A: &str = "100|2024-01-01 00:00:00 +0000|root|-rw-r--r--";
const STAT_B: &str = "2048|2024-02-01 12:00:00.5 +0000|www-data|-rw-rw----";

fn discovery(transport: Arc<FakeTransport>, batch_size: usize) -> Discovery {
    let options = DiscoveryOptions {
        batch_size,
        ..DiscoveryOptions::default()
    };
    Discovery::new(transport, options)
}

#[tokio::test]
async fn one_batch_enriches_every_file() {
    let fake = Arc::new(FakeTransport::new());
    fake.on("find ", ok("/srv/a.db\n/srv/b.sqlite\n/srv/notes.txt\n"))
        .on("stat -c", ok(&format!("{}\n{}\n", STAT_A, STAT_B)));

    let files = discovery(fake.clone(), 50)
        .discover(&server("web"), None, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(files.len(), 2);
    assert_eq!(files[0].path, "/srv/a.db");
    assert_eq!(files[0].size, Some(100));
    assert_eq!(files[1].owner.as_deref(), Some("www-data"));
    assert_eq!(fake.commands_matching("stat -c"), 1);
}

#[tokio::test]
async fn candidates_are_split_into_batches() {
    let fake = Arc::new(FakeTransport::new());
    fake.on("find ", ok("/d/1.db\n/d/2.db\n/d/3.db\n/d/4.db\n/d/5.db\n"))
        .on("'/d/1.db'", ok(&format!("{}\n{}\n", STAT_A, STAT_A)))
        .on("'/d/3.db'", ok(&format!("{}\n{}\n", STAT_B, STAT_B)))
        .on("'/d/5.db'", ok(&format!("{}\n", STAT_A)));

    let files = discovery(fake.clone(), 2)
        .discover(&server("web"), None, &CancellationToken::new(), None)
        .await
        .unwrap();

    let sizes: Vec<Option<u64>> = files.iter().map(|f| f.size).collect();
    assert_eq!(
        sizes,
        vec![Some(100), Some(100), Some(2048), Some(2048), Some(100)]
    );
    assert_eq!(fake.commands_matching("stat -c"), 3);
}

#[tokio::test]
async fn misaligned_batch_falls_back_to_single_stats() {
    let fake = Arc::new(FakeTransport::new());
    fake.on("find ", ok("/srv/a.db\n/srv/b.db\n"))
        // Only the batch command chains stat calls with `;`
        .on("; stat", ok(&format!("{}\n", STAT_A)))
        .on("'/srv/a.db'", ok(&format!("{}\n", STAT_A)))
        .on("'/srv/b.db'", exit(1, ""));

    let files = discovery(fake.clone(), 50)
        .discover(&server("web"), None, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(files.len(), 2);
    assert_eq!(files[0].size, Some(100));
    assert_eq!(files[1], DiscoveredDbFile::unknown("/srv/b.db"));
    assert_eq!(fake.commands_matching("stat -c"), 3);
}

#[tokio::test]
async fn failed_batch_still_reports_every_file() {
    let fake = Arc::new(FakeTransport::new());
    fake.on("find ", ok("/srv/a.db\n/srv/b.db\n"))
        .on("; stat", CommandResult::failure("channel closed", 3))
        .on("'/srv/a.db'", CommandResult::failure("channel closed", 3))
        .on("'/srv/b.db'", ok(&format!("{}\n", STAT_B)));

    let files = discovery(fake, 50)
        .discover(&server("web"), None, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(files[0], DiscoveredDbFile::unknown("/srv/a.db"));
    assert_eq!(files[1].size, Some(2048));
}

#[tokio::test]
async fn files_outside_allowed_roots_are_never_stated() {
    let fake = Arc::new(FakeTransport::new());
    fake.on("find ", ok("/srv/app/x.db\n/etc/y.db\n"))
        .on("stat -c", ok(&format!("{}\n", STAT_A)));

    let mut web = server("web");
    web.allowed_roots = vec!["/srv/app".into()];
    let files = discovery(fake.clone(), 50)
        .discover(&web, None, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, "/srv/app/x.db");
    assert_eq!(fake.commands_matching("'/etc/y.db'"), 0);
}

#[tokio::test]
async fn global_roots_apply_to_servers_without_their_own() {
    let fake = Arc::new(FakeTransport::new());
    fake.on("find ", ok("/srv/app/x.db\n/etc/y.db\n"))
        .on("stat -c", ok(&format!("{}\n", STAT_A)));

    let options = DiscoveryOptions {
        global_allowed_roots: vec!["/etc".into()],
        ..DiscoveryOptions::default()
    };
    let files = Discovery::new(fake, options)
        .discover(&server("web"), None, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, "/etc/y.db");
}

#[tokio::test]
async fn scan_failure_aborts_discovery() {
    let fake = Arc::new(FakeTransport::new());
    fake.on("find ", CommandResult::failure("connection refused", 12));

    let err = discovery(fake.clone(), 50)
        .discover(&server("web"), None, &CancellationToken::new(), None)
        .await
        .unwrap_err();

    match err {
        DiscoveryError::Scan { server, reason } => {
            assert_eq!(server, "web");
            assert_eq!(reason, "connection refused");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(fake.commands_matching("stat -c"), 0);
}

#[tokio::test]
async fn empty_scan_completes_with_no_files() {
    let fake = Arc::new(FakeTransport::new());
    fake.on("find ", ok(""));

    let files = discovery(fake.clone(), 50)
        .discover(&server("web"), None, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert!(files.is_empty());
    assert_eq!(fake.commands().len(), 1);
}

#[tokio::test]
async fn cancelled_discovery_reports_cancellation() {
    let fake = Arc::new(FakeTransport::new());
    fake.on("find ", ok("/srv/a.db\n"));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = discovery(fake, 50)
        .discover(&server("web"), None, &cancel, None)
        .await
        .unwrap_err();

    assert!(matches!(err, DiscoveryError::Cancelled));
}

#[tokio::test]
async fn search_root_and_sudo_shape_the_scan() {
    let fake = Arc::new(FakeTransport::new());
    fake.on("find ", ok(""));

    let mut web = server("web");
    web.sudo_for_discovery = true;
    discovery(fake.clone(), 50)
        .discover(&web, Some("/var/lib"), &CancellationToken::new(), None)
        .await
        .unwrap();

    let (name, command) = &fake.commands()[0];
    assert_eq!(name, "web");
    assert!(command.starts_with("sudo -n sh -c "));
    assert!(command.contains("/var/lib"));
}

#[tokio::test]
async fn progress_rises_to_complete() {
    let fake = Arc::new(FakeTransport::new());
    fake.on("find ", ok("/d/1.db\n/d/2.db\n/d/3.db\n"))
        .on("stat -c", ok(&format!("{}\n", STAT_A)));

    let seen = Mutex::new(Vec::new());
    let progress = |percent: u8, phase: &str| {
        seen.lock().unwrap().push((percent, phase.to_string()));
    };
    discovery(fake, 1)
        .discover(&server("web"), None, &CancellationToken::new(), Some(&progress))
        .await
        .unwrap();

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.first(), Some(&(0, "scanning".to_string())));
    assert_eq!(seen.last(), Some(&(100, "complete".to_string())));
    assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
}

#[tokio::test]
async fn missing_search_root_aborts_discovery() {
    let fake = Arc::new(FakeTransport::new());
    fake.on("[ -d '/nope' ]", exit(2, "no such directory: /nope\n"));

    let err = discovery(fake.clone(), 50)
        .discover(&server("web"), Some("/nope"), &CancellationToken::new(), None)
        .await
        .unwrap_err();

    match err {
        DiscoveryError::Scan { server, reason } => {
            assert_eq!(server, "web");
            assert_eq!(reason, "exit status 2: no such directory: /nope");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(fake.commands_matching("stat -c"), 0);
}
