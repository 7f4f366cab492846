//! An identity provider that reads PEM files from a directory kept up to
//! date by a SPIFFE helper or agent sidecar.
//!
//! # Command line flags
//!
//! | Flag                   | Default            | Meaning                 |
//! |------------------------|--------------------|-------------------------|
//! | `--svid-dir`           | `/run/spiffe/svid` | Directory holding the SVID and bundles. Also `$SPIFFE_SVID_DIR` |
//! | `--svid-poll-interval` | `1s`               | How often to look for rotated files |
//!
//! # Directory layout
//!
//! | File                       | Contents |
//! |----------------------------|----------|
//! | `svid.pem`                 | SVID certificate chain, leaf first |
//! | `svid_key.pem`             | PKCS#8 private key for the leaf |
//! | `svid_bundle.pem`          | Roots for the SVID's own trust domain |
//! | `federated/<domain>.pem`   | Optional roots for other trust domains |
use async_stream::stream;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::bundle::{X509Bundle, X509BundleSet};
use crate::id::TrustDomain;
use crate::provider::{IdentityProvider, ProviderError, X509Context};
use crate::svid::X509Svid;

/// Where the SVID directory lives unless configured otherwise.
pub const DEFAULT_SVID_DIR: &str = "/run/spiffe/svid";

const SVID_FILE: &str = "svid.pem";
const KEY_FILE: &str = "svid_key.pem";
const BUNDLE_FILE: &str = "svid_bundle.pem";
const FEDERATED_DIR: &str = "federated";

/// Command line arguments for [`DirectoryProvider`].
#[derive(clap::Args, Debug)]
#[group(id = "spiffe_demo_svid_dir_args")]
pub struct Args {
    /// Directory to read.
    #[arg(
        long,
        env = "SPIFFE_SVID_DIR",
        default_value = DEFAULT_SVID_DIR,
        help = "Directory holding svid.pem, svid_key.pem and svid_bundle.pem."
    )]
    pub svid_dir: PathBuf,

    /// Polling interval.
    #[arg(
        long,
        default_value = "1s",
        value_parser = humantime::parse_duration,
        help = "How often to check the SVID directory for rotated files."
    )]
    pub svid_poll_interval: Duration,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            svid_dir: PathBuf::from(DEFAULT_SVID_DIR),
            svid_poll_interval: Duration::from_secs(1),
        }
    }
}

type Sentinel = Option<(u64, SystemTime)>;

fn reload_sentinel(md: std::io::Result<std::fs::Metadata>) -> Sentinel {
    md.ok().and_then(|m| Some((m.len(), m.modified().ok()?)))
}

fn sentinel_mismatch(old: &Sentinel, path: &Path) -> bool {
    *old != reload_sentinel(path.metadata())
}

fn with_path(path: &Path, e: std::io::Error) -> std::io::Error {
    std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e))
}

fn read_with_sentinel(path: &Path) -> std::io::Result<(Vec<u8>, Sentinel)> {
    let mut file = File::open(path).map_err(|e| with_path(path, e))?;
    let sentinel = reload_sentinel(file.metadata());
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .map_err(|e| with_path(path, e))?;
    Ok((contents, sentinel))
}

struct Loader {
    dir: PathBuf,
    // Recorded at the last successful load only.
    sentinels: Option<Vec<(PathBuf, Sentinel)>>,
}

impl Loader {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            sentinels: None,
        }
    }

    fn load_federated(
        &self,
        bundles: &mut X509BundleSet,
        sentinels: &mut Vec<(PathBuf, Sentinel)>,
    ) -> Result<(), ProviderError> {
        let fed_dir = self.dir.join(FEDERATED_DIR);
        sentinels.push((fed_dir.clone(), reload_sentinel(fed_dir.metadata())));
        let entries = match std::fs::read_dir(&fed_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(with_path(&fed_dir, e).into()),
        };
        let mut paths = entries
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| with_path(&fed_dir, e))?;
        paths.sort();
        for path in paths {
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            let Some(td) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| TrustDomain::new(s).ok())
            else {
                log::warn!("Ignoring {}: not named after a trust domain", path.display());
                continue;
            };
            if bundles.get(&td).is_some() {
                log::warn!("Ignoring {}: {} already has a bundle", path.display(), td);
                continue;
            }
            let (pem, sentinel) = read_with_sentinel(&path)?;
            bundles.insert(X509Bundle::from_pem(td, &pem)?);
            sentinels.push((path, sentinel));
        }
        Ok(())
    }

    fn load_files(&mut self) -> Result<X509Context, ProviderError> {
        let mut sentinels = Vec::new();
        let cert_path = self.dir.join(SVID_FILE);
        let (cert_pem, cert_sentinel) = read_with_sentinel(&cert_path)?;
        sentinels.push((cert_path, cert_sentinel));
        let key_path = self.dir.join(KEY_FILE);
        let (key_pem, key_sentinel) = read_with_sentinel(&key_path)?;
        sentinels.push((key_path, key_sentinel));
        let bundle_path = self.dir.join(BUNDLE_FILE);
        let (bundle_pem, bundle_sentinel) = read_with_sentinel(&bundle_path)?;
        sentinels.push((bundle_path, bundle_sentinel));

        let svid = X509Svid::from_pem(&cert_pem, &key_pem)?;
        let mut bundles = X509BundleSet::new();
        bundles.insert(X509Bundle::from_pem(
            svid.spiffe_id().trust_domain().clone(),
            &bundle_pem,
        )?);
        self.load_federated(&mut bundles, &mut sentinels)?;

        self.sentinels = Some(sentinels);
        Ok(X509Context {
            svid: Arc::new(svid),
            bundles: Arc::new(bundles),
        })
    }

    fn needs_reload(&self) -> bool {
        match self.sentinels {
            None => true,
            Some(ref sentinels) => sentinels
                .iter()
                .any(|(path, old)| sentinel_mismatch(old, path)),
        }
    }

    fn reload_loop(
        mut self,
        interval: Duration,
    ) -> BoxStream<'static, Result<X509Context, ProviderError>> {
        stream! {
            yield self.load_files();
            loop {
                tokio::time::sleep(interval).await;
                if self.needs_reload() {
                    yield self.load_files();
                }
            }
        }
        .boxed()
    }
}

/// Identity provider backed by a directory of PEM files.
#[derive(Clone, Debug)]
pub struct DirectoryProvider {
    dir: PathBuf,
    poll_interval: Duration,
}

impl DirectoryProvider {
    /// Read from `dir`, checking for rotation every `poll_interval`.
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
        }
    }

    /// Construct from command line arguments.
    pub fn from_args(args: &Args) -> Self {
        Self::new(args.svid_dir.clone(), args.svid_poll_interval)
    }

    /// The directory being read.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl IdentityProvider for DirectoryProvider {
    fn fetch(&self) -> BoxFuture<'_, Result<X509Context, ProviderError>> {
        async move { Loader::new(self.dir.clone()).load_files() }.boxed()
    }

    fn watch(&self) -> BoxStream<'static, Result<X509Context, ProviderError>> {
        Loader::new(self.dir.clone()).reload_loop(self.poll_interval)
    }
}
