//! Running work inside another network namespace.
//!
//! Namespace membership is a property of the OS thread, so every switch
//! happens on a blocking-pool thread and is undone by a guard before the
//! thread is handed back to the pool. Nothing here ever holds a switched
//! thread across an `.await`.

use nix::sched::{setns, CloneFlags};
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::process::Command;
use tracing::error;

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

#[derive(Debug, thiserror::Error)]
pub enum NetnsError {
    #[error("failed to open network namespace {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to enter network namespace {path}: {source}")]
    Enter {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("namespaced task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A network namespace identified by a bind-mount or `/proc` path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NetNs {
    path: PathBuf,
}

/// Restores the thread's original namespace when dropped.
struct Guard {
    original: File,
}

// === impl NetNs ===

impl NetNs {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` on a blocking thread switched into this namespace.
    pub async fn run<F, T>(&self, f: F) -> Result<T, NetnsError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let ns = self.clone();
        tokio::task::spawn_blocking(move || ns.run_blocking(f)).await?
    }

    /// Runs `f` on the calling thread switched into this namespace.
    ///
    /// The original namespace is restored on every exit path, including
    /// when `f` panics.
    pub fn run_blocking<F, T>(&self, f: F) -> Result<T, NetnsError>
    where
        F: FnOnce() -> T,
    {
        let target = File::open(&self.path).map_err(|source| NetnsError::Open {
            path: self.path.clone(),
            source,
        })?;
        let _guard = Guard::enter(&target, &self.path)?;
        Ok(f())
    }

    /// Starts `program` inside the namespace as the leader of a new process
    /// group, so it outlives this process and does not receive its signals.
    ///
    /// The child is not waited on; the runtime reaps it when it exits.
    pub async fn spawn_detached(
        &self,
        program: &Path,
        args: Vec<String>,
    ) -> Result<Option<u32>, NetnsError> {
        let program = program.to_path_buf();
        self.run(move || {
            let child = Command::new(&program)
                .args(&args)
                .process_group(0)
                .stdin(Stdio::null())
                .kill_on_drop(false)
                .spawn()
                .map_err(|source| NetnsError::Spawn {
                    program: program.clone(),
                    source,
                })?;
            Ok(child.id())
        })
        .await?
    }
}

// === impl Guard ===

impl Guard {
    fn enter(target: &File, path: &Path) -> Result<Self, NetnsError> {
        let original = File::open(THREAD_NETNS).map_err(|source| NetnsError::Open {
            path: PathBuf::from(THREAD_NETNS),
            source,
        })?;
        setns(target, CloneFlags::CLONE_NEWNET).map_err(|source| NetnsError::Enter {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { original })
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Err(error) = setns(&self.original, CloneFlags::CLONE_NEWNET) {
            // Pooled threads must never stay in a foreign namespace.
            error!(%error, "Failed to restore network namespace");
            std::process::abort();
        }
    }
}

/// Scratch namespaces for tests that need real namespace switching. These
/// need root; without it the test returns early.
#[cfg(test)]
pub(crate) mod testing {
    use super::NetNs;
    use std::{
        net::SocketAddr,
        process::Command,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::oneshot;

    /// Creates a scratch namespace, or returns from the calling test when
    /// namespaces cannot be created here.
    macro_rules! setup_netns_test {
        () => {
            match crate::netns::testing::ScratchNetns::create(module_path!()) {
                Some(scratch) => scratch,
                None => return,
            }
        };
    }
    pub(crate) use setup_netns_test;

    /// A namespace added with `ip netns add`, with loopback up. Deleted on
    /// drop.
    pub(crate) struct ScratchNetns {
        name: String,
        netns: NetNs,
    }

    /// Stops the health server when dropped.
    pub(crate) struct HealthServer {
        _close: oneshot::Sender<()>,
    }

    impl ScratchNetns {
        pub(crate) fn create(test: &str) -> Option<Self> {
            if !nix::unistd::Uid::effective().is_root() {
                eprintln!("skipping {test}: creating network namespaces requires root");
                return None;
            }
            static NEXT: AtomicUsize = AtomicUsize::new(0);
            let name = format!(
                "wafie-test-{}-{}",
                std::process::id(),
                NEXT.fetch_add(1, Ordering::Relaxed)
            );
            if !ip(&["netns", "add", &name]) {
                eprintln!("skipping {test}: `ip netns add` failed");
                return None;
            }
            let scratch = Self {
                netns: NetNs::new(format!("/run/netns/{name}")),
                name,
            };
            assert!(
                ip(&["-n", &scratch.name, "link", "set", "lo", "up"]),
                "failed to bring up loopback"
            );
            Some(scratch)
        }

        pub(crate) fn netns(&self) -> &NetNs {
            &self.netns
        }

        /// Serves the gRPC health service on `addr` inside the namespace,
        /// reporting `status` for `service`.
        pub(crate) async fn serve_health(
            &self,
            addr: SocketAddr,
            service: &'static str,
            status: tonic_health::ServingStatus,
        ) -> HealthServer {
            let (close, closed) = oneshot::channel::<()>();
            let (ready_tx, ready) = oneshot::channel();
            let netns = self.netns.clone();
            // A dedicated thread stays in the namespace for the server's
            // lifetime, so its listener is created there.
            std::thread::spawn(move || {
                netns
                    .run_blocking(move || {
                        let rt = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .expect("runtime");
                        rt.block_on(async move {
                            let (reporter, health) = tonic_health::server::health_reporter();
                            reporter.set_service_status(service, status).await;
                            let srv = tonic::transport::Server::builder()
                                .add_service(health)
                                .serve_with_shutdown(addr, async move {
                                    let _ = closed.await;
                                });
                            let _ = ready_tx.send(());
                            let _ = srv.await;
                        })
                    })
                    .expect("enter namespace")
            });
            ready.await.expect("health server thread");
            for _ in 0..100 {
                if crate::transport::dial(&self.netns, addr).await.is_ok() {
                    return HealthServer { _close: close };
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("health server did not start in {}", self.name);
        }
    }

    impl Drop for ScratchNetns {
        fn drop(&mut self) {
            ip(&["netns", "del", &self.name]);
        }
    }

    fn ip(args: &[&str]) -> bool {
        Command::new("ip")
            .args(args)
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}
