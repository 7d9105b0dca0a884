//! Session handle.
//!
//! A session pairs a document store backend with configuration and the
//! one-time-populated server build descriptor. The descriptor is the only
//! process-wide shared mutable state in this layer: `connect` populates it
//! under a write lock, readers (version feature-gating) take a read lock.

use std::sync::Arc;

use bson::doc;
use bson::Document;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

use crate::config::SessionConfig;
use crate::database::Database;
use crate::collection::Collection;
use crate::error::Result;
use crate::store::DocumentStore;

/// Server build descriptor, decoded from the `buildInfo` command reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildInfo {
    #[serde(default)]
    pub version: String,
    /// Assembled from `version` when the server does not report it.
    #[serde(default, rename = "versionArray")]
    pub version_array: Vec<i32>,
    #[serde(default, rename = "gitVersion")]
    pub git_version: String,
    #[serde(default, rename = "OpenSSLVersion")]
    pub openssl_version: String,
    #[serde(default)]
    pub bits: i32,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, rename = "maxBsonObjectSize")]
    pub max_object_size: i32,
}

impl BuildInfo {
    fn normalize(&mut self) {
        if self.version_array.is_empty() {
            for part in self.version.split('.') {
                match part.parse() {
                    Ok(n) => self.version_array.push(n),
                    Err(_) => break,
                }
            }
        }
        while self.version_array.len() < 4 {
            self.version_array.push(0);
        }
        // Strip the " modules: enterprise" style suffix.
        if let Some(i) = self.git_version.find(' ') {
            self.git_version.truncate(i);
        }
    }
}

/// Numeric server version, used for feature gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    /// Parses the leading `major.minor.patch` core of a version string,
    /// ignoring any pre-release or build suffix.
    pub fn parse(version: &str) -> Option<Self> {
        let core = version.split(['-', '+']).next()?;
        let mut parts = core.split('.');
        let major = parts.next()?.trim().parse().ok()?;
        let minor = parts
            .next()
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(0);
        let patch = parts
            .next()
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(0);
        Some(ServerVersion {
            major,
            minor,
            patch,
        })
    }

    /// `allowDiskUse` is honored on servers >= 3.2, <= 4.4 only; outside
    /// the range the setting is a silent no-op.
    pub(crate) fn supports_allow_disk_use(self) -> bool {
        (self.major, self.minor) >= (3, 2) && (self.major, self.minor) <= (4, 4)
    }
}

/// Entry point for the compatibility layer: owns the store handle, the
/// configuration, and the cached build descriptor.
pub struct Session {
    store: Arc<dyn DocumentStore>,
    config: SessionConfig,
    build_info: RwLock<Option<BuildInfo>>,
}

impl Session {
    /// Creates a session without contacting the store. The build
    /// descriptor stays unpopulated until [`Session::connect`] or
    /// [`Session::refresh_build_info`] runs.
    pub fn new(store: Arc<dyn DocumentStore>, config: SessionConfig) -> Self {
        Session {
            store,
            config,
            build_info: RwLock::new(None),
        }
    }

    /// Creates a session and populates the build descriptor.
    pub fn connect(store: Arc<dyn DocumentStore>, config: SessionConfig) -> Result<Self> {
        let session = Session::new(store, config);
        session.refresh_build_info()?;
        Ok(session)
    }

    /// Runs `buildInfo` against the admin database and caches the reply.
    pub fn refresh_build_info(&self) -> Result<BuildInfo> {
        let reply = self.store.run_command("admin", &doc! {"buildInfo": 1})?;
        let mut info: BuildInfo = bson::from_document(reply)?;
        info.normalize();
        debug!(version = %info.version, "cached server build info");
        *self.build_info.write() = Some(info.clone());
        Ok(info)
    }

    /// Returns the cached build descriptor, fetching it on first use.
    pub fn build_info(&self) -> Result<BuildInfo> {
        if let Some(info) = self.build_info.read().clone() {
            return Ok(info);
        }
        self.refresh_build_info()
    }

    /// Parsed server version from the cached build descriptor, if any.
    pub fn version(&self) -> Option<ServerVersion> {
        self.build_info
            .read()
            .as_ref()
            .and_then(|info| ServerVersion::parse(&info.version))
    }

    /// Verifies the store answers commands.
    pub fn ping(&self) -> Result<()> {
        self.store.run_command("admin", &doc! {"ping": 1})?;
        Ok(())
    }

    /// Returns a handle on the named database.
    pub fn db(&self, name: &str) -> Database {
        Database::new(
            Arc::clone(&self.store),
            name,
            self.version(),
            self.config.max_batch_size,
        )
    }

    /// Returns a collection in the session's default database.
    pub fn c(&self, collection: &str) -> Collection {
        self.db(&self.config.database).c(collection)
    }

    /// Runs a command against the admin database.
    pub fn run(&self, cmd: Document) -> Result<Document> {
        self.db("admin").run(cmd)
    }

    /// Names of all databases known to the store.
    pub fn database_names(&self) -> Result<Vec<String>> {
        let reply = self
            .store
            .run_command("admin", &doc! {"listDatabases": 1, "nameOnly": true})?;
        let mut names = Vec::new();
        if let Ok(databases) = reply.get_array("databases") {
            for entry in databases {
                if let Some(name) = entry.as_document().and_then(|d| d.get_str("name").ok()) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing_tolerates_suffixes() {
        assert_eq!(
            ServerVersion::parse("4.2.14"),
            Some(ServerVersion {
                major: 4,
                minor: 2,
                patch: 14
            })
        );
        assert_eq!(
            ServerVersion::parse("6.0.0-lumadb").map(|v| v.major),
            Some(6)
        );
        assert!(ServerVersion::parse("devbuild").is_none());
    }

    #[test]
    fn allow_disk_use_window() {
        let v = |s| ServerVersion::parse(s).unwrap();
        assert!(!v("3.0.0").supports_allow_disk_use());
        assert!(v("3.2.0").supports_allow_disk_use());
        assert!(v("4.4.9").supports_allow_disk_use());
        assert!(!v("5.0.0").supports_allow_disk_use());
    }

    #[test]
    fn build_info_normalization() {
        let mut info = BuildInfo {
            version: "4.2.14".to_string(),
            git_version: "abcdef modules: enterprise".to_string(),
            ..BuildInfo::default()
        };
        info.normalize();
        assert_eq!(info.version_array, vec![4, 2, 14, 0]);
        assert_eq!(info.git_version, "abcdef");
    }
}
