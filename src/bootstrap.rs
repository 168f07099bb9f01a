//! Bootstrap and recovery decision procedure.
//!
//! [`bootstrap`] turns a validated [`Config`] into the [`InitialState`] the
//! consensus engine starts from, plus the durable handles (log, snapshotter,
//! store) the node server takes ownership of.  The single branch point is
//! whether a log already exists in the data directory:
//!
//! * fresh: optionally run discovery, create the log, start from nothing.
//! * recovery: load the newest snapshot, replay the log tail after it,
//!   restart from that.  Discovery is never consulted.

use std::sync::Arc;

use tracing::info;

use crate::cluster::{Cluster, Member};
use crate::config::{Config, ConfigError};
use crate::consensus::InitialState;
use crate::discovery::{Discovery, DiscoveryError, Registration};
use crate::errors::{RecoveryError, StartupError};
use crate::storage::layout::{self, BootstrapMode, DataDir};
use crate::storage::snap::Snapshotter;
use crate::storage::wal::Wal;
use crate::store::Store;

/// Everything produced by a successful bootstrap.
#[derive(Debug)]
pub struct Bootstrapped {
    pub mode: BootstrapMode,
    pub self_id: u64,
    /// Final membership: discovered on a fresh start with discovery,
    /// otherwise the locally configured one.
    pub cluster: Cluster,
    pub data_dir: DataDir,
    pub wal: Wal,
    pub snapshotter: Snapshotter,
    pub store: Arc<Store>,
    pub initial: InitialState,
}

/// Resolve this node's identity, classify the data directory, and
/// reconcile persisted state.  Nothing touches disk or network until the
/// configuration and identity have been checked.
pub async fn bootstrap(
    config: &Config,
    discovery: &dyn Discovery,
) -> Result<Bootstrapped, StartupError> {
    config.validate()?;
    let local = config.cluster()?;
    let me = resolve_self(&local, &config.name)?;

    let root = match &config.data_dir {
        Some(dir) => dir.clone(),
        None => {
            let dir = layout::default_data_dir(me.id);
            info!(data_dir = %dir.display(), "No data-dir given, using default");
            dir
        }
    };
    let (data_dir, mode) = layout::prepare(&root)?;
    let snapshotter = Snapshotter::new(&data_dir.snap_dir);
    let store = Arc::new(Store::new());

    let (cluster, self_id, wal, initial) = match mode {
        BootstrapMode::Fresh => {
            let (cluster, self_id) = match &config.discovery {
                Some(url) => discover(config, url, discovery).await?,
                None => (local.clone(), me.id),
            };
            let wal = Wal::create(&data_dir.wal_dir).map_err(StartupError::LogCreate)?;
            let initial = InitialState::Start {
                id: self_id,
                peers: cluster.ids(),
            };
            (cluster, self_id, wal, initial)
        }
        BootstrapMode::Recovery => {
            let (wal, initial) = recover(me.id, &local, &data_dir, &snapshotter, &store)?;
            (local.clone(), me.id, wal, initial)
        }
    };

    Ok(Bootstrapped {
        mode,
        self_id,
        cluster,
        data_dir,
        wal,
        snapshotter,
        store,
        initial,
    })
}

/// The returned member never has the NONE id: [`Cluster::parse`] refuses
/// such members, which surfaces as [`ConfigError::Cluster`].
fn resolve_self<'a>(cluster: &'a Cluster, name: &str) -> Result<&'a Member, ConfigError> {
    cluster
        .find_name(name)
        .ok_or_else(|| ConfigError::UnknownMember(name.to_string()))
}

/// Register with the discovery service and adopt the membership it returns.
async fn discover(
    config: &Config,
    url: &str,
    discovery: &dyn Discovery,
) -> Result<(Cluster, u64), StartupError> {
    if config.advertised_peer_urls.is_empty() {
        return Err(ConfigError::DiscoveryWithoutAdvertisedUrls.into());
    }
    let announced = Member::new(config.name.clone(), config.advertised_peer_urls.clone());
    let registration = Registration {
        url: url.to_string(),
        id: announced.id,
        config: announced.config_string(),
    };
    let cluster = discovery.discover(&registration).await?;
    let self_id = cluster
        .find_name(&config.name)
        .ok_or_else(|| DiscoveryError::MissingSelf(config.name.clone()))?
        .id;
    info!(cluster = %cluster, "Discovered cluster");
    Ok((cluster, self_id))
}

fn recover(
    self_id: u64,
    local: &Cluster,
    data_dir: &DataDir,
    snapshotter: &Snapshotter,
    store: &Store,
) -> Result<(Wal, InitialState), RecoveryError> {
    let snapshot = snapshotter.load()?;
    let mut index = 0;
    if let Some(snap) = &snapshot {
        info!(index = snap.index, "Restarting from snapshot");
        store.recovery(&snap.data)?;
        index = snap.index;
    }

    let mut wal = Wal::open_at_index(&data_dir.wal_dir, index)?;
    let (wal_id, hard_state, entries) = wal.read_all()?;
    // Node ids are not persisted yet; anything else means the log was
    // written by something we do not understand.
    if wal_id != 0 {
        return Err(RecoveryError::UnexpectedNodeId(wal_id));
    }

    let initial = InitialState::Restart {
        id: self_id,
        peers: local.ids(),
        snapshot,
        hard_state,
        entries,
    };
    Ok((wal, initial))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::snap::Snapshot;
    use crate::store::Op;
    use raft::eraftpb::{Entry, HardState};
    use std::future::Future;
    use std::io::Write;
    use std::path::Path;
    use std::pin::Pin;
    use std::sync::Mutex;

    /// Records every call and whether a log existed at the time.
    struct FakeDiscovery {
        result: Result<String, ()>,
        wal_dir: Mutex<Option<std::path::PathBuf>>,
        calls: Mutex<Vec<(Registration, bool)>>,
    }

    impl FakeDiscovery {
        fn returning(cluster: &str) -> Self {
            Self {
                result: Ok(cluster.to_string()),
                wal_dir: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                result: Err(()),
                wal_dir: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn watch(self, data_dir: &Path) -> Self {
            *self.wal_dir.lock().unwrap() = Some(data_dir.join("wal"));
            self
        }

        fn calls(&self) -> Vec<(Registration, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Discovery for FakeDiscovery {
        fn discover<'a>(
            &'a self,
            registration: &'a Registration,
        ) -> Pin<Box<dyn Future<Output = Result<Cluster, DiscoveryError>> + Send + 'a>> {
            Box::pin(async move {
                let log_existed = self
                    .wal_dir
                    .lock()
                    .unwrap()
                    .as_deref()
                    .map(Wal::exist)
                    .unwrap_or(false);
                self.calls
                    .lock()
                    .unwrap()
                    .push((registration.clone(), log_existed));
                match &self.result {
                    Ok(text) => Ok(Cluster::parse(text)?),
                    Err(()) => Err(DiscoveryError::FullCluster),
                }
            })
        }
    }

    fn config(data_dir: &Path) -> Config {
        Config {
            name: "n1".into(),
            bootstrap_config: "n1=http://127.0.0.1:7001,n2=http://127.0.0.1:7002".into(),
            data_dir: Some(data_dir.to_path_buf()),
            ..Config::default()
        }
    }

    fn discovery_config(data_dir: &Path) -> Config {
        Config {
            discovery: Some("http://disco.example/token".into()),
            advertised_peer_urls: vec!["http://10.0.0.1:7001".into()],
            ..config(data_dir)
        }
    }

    fn entry(index: u64, term: u64, op: &Op) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        let req = crate::store::Request {
            id: index,
            op: op.clone(),
        };
        e.data = serde_json::to_vec(&req).unwrap().into();
        e
    }

    fn hard_state(term: u64, commit: u64) -> HardState {
        let mut hs = HardState::default();
        hs.term = term;
        hs.commit = commit;
        hs
    }

    fn put(key: &str) -> Op {
        Op::Put {
            key: key.into(),
            value: "v".into(),
        }
    }

    #[tokio::test]
    async fn test_unknown_name_fails_before_any_io() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("data");
        let cfg = Config {
            name: "nobody".into(),
            ..config(&root)
        };
        let disco = FakeDiscovery::returning("");
        let err = bootstrap(&cfg, &disco).await.unwrap_err();
        assert!(matches!(
            err,
            StartupError::Config(ConfigError::UnknownMember(ref n)) if n == "nobody"
        ));
        assert_eq!(err.category(), "config");
        assert!(!root.exists());
    }

    #[test]
    fn test_none_member_id_is_config_error() {
        let err = StartupError::from(ConfigError::from(crate::cluster::ClusterError::NoneId));
        assert_eq!(err.category(), "config");
        assert_eq!(
            err.to_string(),
            "invalid bootstrap-config: cannot use none(0) as member id"
        );
    }

    #[tokio::test]
    async fn test_invalid_snapshot_count_fails_before_any_io() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("data");
        let cfg = Config {
            snapshot_count: 0,
            ..config(&root)
        };
        let err = bootstrap(&cfg, &FakeDiscovery::returning(""))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "config");
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_fresh_without_discovery() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path());
        let disco = FakeDiscovery::returning("");
        let boot = bootstrap(&cfg, &disco).await.unwrap();

        assert_eq!(boot.mode, BootstrapMode::Fresh);
        assert!(disco.calls().is_empty());
        assert!(Wal::exist(&boot.data_dir.wal_dir));
        let local = cfg.cluster().unwrap();
        assert_eq!(boot.self_id, local.find_name("n1").unwrap().id);
        match boot.initial {
            InitialState::Start { id, peers } => {
                assert_eq!(id, boot.self_id);
                assert_eq!(peers, local.ids());
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fresh_with_discovery_uses_discovered_cluster() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = discovery_config(tmp.path());
        let discovered = "n1=http://10.0.0.1:7001,n2=http://10.0.0.2:7001,n3=http://10.0.0.3:7001";
        let disco = FakeDiscovery::returning(discovered).watch(tmp.path());
        let boot = bootstrap(&cfg, &disco).await.unwrap();

        let calls = disco.calls();
        assert_eq!(calls.len(), 1);
        let (registration, log_existed) = &calls[0];
        assert!(!log_existed, "discovery must run before the log is created");
        assert_eq!(registration.config, "n1=http://10.0.0.1:7001");
        assert_eq!(registration.url, "http://disco.example/token");

        let expected = Cluster::parse(discovered).unwrap();
        assert_eq!(boot.cluster, expected);
        assert_eq!(boot.self_id, registration.id);
        match boot.initial {
            InitialState::Start { peers, .. } => assert_eq!(peers, expected.ids()),
            other => panic!("expected start, got {other:?}"),
        }
        assert!(Wal::exist(&boot.data_dir.wal_dir));
    }

    #[tokio::test]
    async fn test_discovery_requires_advertised_urls() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config {
            advertised_peer_urls: Vec::new(),
            ..discovery_config(tmp.path())
        };
        let disco = FakeDiscovery::returning("n1=http://10.0.0.1:7001");
        let err = bootstrap(&cfg, &disco).await.unwrap_err();
        assert!(matches!(
            err,
            StartupError::Config(ConfigError::DiscoveryWithoutAdvertisedUrls)
        ));
        assert!(disco.calls().is_empty());
        assert!(!Wal::exist(&tmp.path().join("wal")));
    }

    #[tokio::test]
    async fn test_discovery_failure_is_fatal_and_creates_no_log() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = discovery_config(tmp.path());
        let disco = FakeDiscovery::failing();
        let err = bootstrap(&cfg, &disco).await.unwrap_err();
        assert_eq!(err.category(), "discovery");
        assert!(!Wal::exist(&tmp.path().join("wal")));
    }

    #[tokio::test]
    async fn test_recovery_never_discovers() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path());
        let first = bootstrap(&cfg, &FakeDiscovery::returning("")).await.unwrap();
        drop(first);

        let cfg = discovery_config(tmp.path());
        let disco = FakeDiscovery::returning("n9=http://10.9.9.9:7001");
        let boot = bootstrap(&cfg, &disco).await.unwrap();
        assert_eq!(boot.mode, BootstrapMode::Recovery);
        assert!(disco.calls().is_empty());
        assert_eq!(boot.cluster, cfg.cluster().unwrap());
        match boot.initial {
            InitialState::Restart {
                snapshot,
                entries,
                peers,
                ..
            } => {
                assert!(snapshot.is_none());
                assert!(entries.is_empty());
                assert_eq!(peers, cfg.cluster().unwrap().ids());
            }
            other => panic!("expected restart, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restart_from_snapshot_and_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path());
        let mut first = bootstrap(&cfg, &FakeDiscovery::returning("")).await.unwrap();

        // Entries 1..=8 in the log, state through 5 captured in a snapshot.
        let ents: Vec<Entry> = (1..=8).map(|i| entry(i, 1, &put(&format!("k{i}")))).collect();
        first.wal.save(&hard_state(1, 8), &ents).unwrap();
        let snap_store = Store::new();
        for e in &ents[..5] {
            let req: crate::store::Request = serde_json::from_slice(&e.data).unwrap();
            snap_store.apply(e.index, &req.op).unwrap();
        }
        first
            .snapshotter
            .save(&Snapshot {
                index: 5,
                term: 1,
                nodes: first.cluster.ids(),
                data: snap_store.save().unwrap(),
            })
            .unwrap();
        drop(first);

        let disco = FakeDiscovery::returning("");
        let boot = bootstrap(&cfg, &disco).await.unwrap();
        assert_eq!(boot.mode, BootstrapMode::Recovery);
        assert!(disco.calls().is_empty());
        assert_eq!(boot.store.len(), 5);
        assert_eq!(boot.store.index(), 5);
        match boot.initial {
            InitialState::Restart {
                snapshot,
                hard_state,
                entries,
                ..
            } => {
                assert_eq!(snapshot.unwrap().index, 5);
                let indexes: Vec<u64> = entries.iter().map(|e| e.index).collect();
                assert_eq!(indexes, vec![6, 7, 8]);
                assert_eq!(hard_state.commit, 8);
            }
            other => panic!("expected restart, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restart_without_snapshot_starts_at_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path());
        let mut first = bootstrap(&cfg, &FakeDiscovery::returning("")).await.unwrap();
        first
            .wal
            .save(&hard_state(1, 2), &[entry(1, 1, &put("a")), entry(2, 1, &put("b"))])
            .unwrap();
        drop(first);

        let boot = bootstrap(&cfg, &FakeDiscovery::returning("")).await.unwrap();
        assert!(boot.store.is_empty());
        assert_eq!(boot.initial.applied(), 0);
        match boot.initial {
            InitialState::Restart {
                snapshot, entries, ..
            } => {
                assert!(snapshot.is_none());
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].index, 1);
            }
            other => panic!("expected restart, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_persisted_node_id_aborts() {
        use base64::Engine;
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path());
        let first = bootstrap(&cfg, &FakeDiscovery::returning("")).await.unwrap();
        let wal_dir = first.data_dir.wal_dir.clone();
        drop(first);

        let segment = std::fs::read_dir(&wal_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let data = base64::engine::general_purpose::STANDARD.encode(7u64.to_be_bytes());
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(segment)
            .unwrap();
        writeln!(f, r#"{{"type":"info","data":"{data}"}}"#).unwrap();

        let err = bootstrap(&cfg, &FakeDiscovery::returning(""))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StartupError::Recovery(RecoveryError::UnexpectedNodeId(7))
        ));
        assert_eq!(err.category(), "recovery");
    }

    #[tokio::test]
    async fn test_unreadable_log_is_recovery_error() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path());
        let first = bootstrap(&cfg, &FakeDiscovery::returning("")).await.unwrap();
        let wal_dir = first.data_dir.wal_dir.clone();
        drop(first);
        let segment = std::fs::read_dir(&wal_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        std::fs::write(segment, "garbage\n").unwrap();

        let err = bootstrap(&cfg, &FakeDiscovery::returning(""))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StartupError::Recovery(RecoveryError::Wal(_))
        ));
    }
}
