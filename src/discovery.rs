//! Finding plugin binaries and turning them into component factories.
//!
//! Two binary layouts are recognised:
//!
//! - single-component: `buildplug-builder-<name>`, `buildplug-provisioner-<name>`,
//!   `buildplug-post-processor-<name>`; launched with no arguments
//! - multi-component: `buildplug-plugin-<name>`; asked to `describe` itself,
//!   then launched as `start <kind> <component>` per component
//!
//! Directories are searched in order (executable's directory, known plugin
//! folders, current directory, [`PLUGIN_PATH_KEY`] entries). A plugin found
//! later replaces one with the same name found earlier.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::client::{PluginClient, PluginClientConfig, ShutdownCoordinator};
use crate::component::{Builder, Datasource, PostProcessor, Provisioner};
use crate::error::{PluginError, Result};
use crate::handshake::{is_plugin_process, ApiVersion, DEFAULT_MAX_PORT, DEFAULT_MIN_PORT};
use crate::server::{ComponentKind, SetDescription, DEFAULT_COMPONENT};

/// Extra plugin directories, separated like `PATH`.
pub const PLUGIN_PATH_KEY: &str = "BUILDPLUG_PLUGIN_PATH";

/// File-name prefix of multi-component plugin binaries.
pub const MULTI_PLUGIN_PREFIX: &str = "buildplug-plugin-";

/// Creates a fresh component instance, launching its plugin if needed.
pub type Factory<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<T>>> + Send + Sync>;

/// Named component factories, one map per kind.
#[derive(Default)]
pub struct ComponentRegistry {
    builders: BTreeMap<String, Factory<dyn Builder>>,
    provisioners: BTreeMap<String, Factory<dyn Provisioner>>,
    post_processors: BTreeMap<String, Factory<dyn PostProcessor>>,
    datasources: BTreeMap<String, Factory<dyn Datasource>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_builder(&mut self, name: impl Into<String>, factory: Factory<dyn Builder>) {
        self.builders.insert(name.into(), factory);
    }

    pub fn set_provisioner(&mut self, name: impl Into<String>, factory: Factory<dyn Provisioner>) {
        self.provisioners.insert(name.into(), factory);
    }

    pub fn set_post_processor(
        &mut self,
        name: impl Into<String>,
        factory: Factory<dyn PostProcessor>,
    ) {
        self.post_processors.insert(name.into(), factory);
    }

    pub fn set_datasource(&mut self, name: impl Into<String>, factory: Factory<dyn Datasource>) {
        self.datasources.insert(name.into(), factory);
    }

    /// Sorted names registered for `kind`.
    pub fn names(&self, kind: ComponentKind) -> Vec<String> {
        match kind {
            ComponentKind::Builder => self.builders.keys().cloned().collect(),
            ComponentKind::Provisioner => self.provisioners.keys().cloned().collect(),
            ComponentKind::PostProcessor => self.post_processors.keys().cloned().collect(),
            ComponentKind::Datasource => self.datasources.keys().cloned().collect(),
        }
    }

    pub fn contains(&self, kind: ComponentKind, name: &str) -> bool {
        match kind {
            ComponentKind::Builder => self.builders.contains_key(name),
            ComponentKind::Provisioner => self.provisioners.contains_key(name),
            ComponentKind::PostProcessor => self.post_processors.contains_key(name),
            ComponentKind::Datasource => self.datasources.contains_key(name),
        }
    }

    pub async fn builder(&self, name: &str) -> Result<Arc<dyn Builder>> {
        let factory = lookup(&self.builders, ComponentKind::Builder, name)?;
        factory().await
    }

    pub async fn provisioner(&self, name: &str) -> Result<Arc<dyn Provisioner>> {
        let factory = lookup(&self.provisioners, ComponentKind::Provisioner, name)?;
        factory().await
    }

    pub async fn post_processor(&self, name: &str) -> Result<Arc<dyn PostProcessor>> {
        let factory = lookup(&self.post_processors, ComponentKind::PostProcessor, name)?;
        factory().await
    }

    pub async fn datasource(&self, name: &str) -> Result<Arc<dyn Datasource>> {
        let factory = lookup(&self.datasources, ComponentKind::Datasource, name)?;
        factory().await
    }

    /// Register a factory launching `launch` and serving `kind`.
    fn register_plugin(&mut self, kind: ComponentKind, name: String, launch: Launch) {
        debug!(kind = %kind, name = %name, path = %launch.path.display(), "registering plugin component");
        match kind {
            ComponentKind::Builder => self.set_builder(
                name,
                Arc::new(move || {
                    let client = launch.client();
                    async move { client.builder().await }.boxed()
                }),
            ),
            ComponentKind::Provisioner => self.set_provisioner(
                name,
                Arc::new(move || {
                    let client = launch.client();
                    async move { client.provisioner().await }.boxed()
                }),
            ),
            ComponentKind::PostProcessor => self.set_post_processor(
                name,
                Arc::new(move || {
                    let client = launch.client();
                    async move { client.post_processor().await }.boxed()
                }),
            ),
            ComponentKind::Datasource => self.set_datasource(
                name,
                Arc::new(move || {
                    let client = launch.client();
                    async move { client.datasource().await }.boxed()
                }),
            ),
        }
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("builders", &self.builders.keys().collect::<Vec<_>>())
            .field("provisioners", &self.provisioners.keys().collect::<Vec<_>>())
            .field("post_processors", &self.post_processors.keys().collect::<Vec<_>>())
            .field("datasources", &self.datasources.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn lookup<'a, T: ?Sized>(
    factories: &'a BTreeMap<String, Factory<T>>,
    kind: ComponentKind,
    name: &str,
) -> Result<&'a Factory<T>> {
    factories
        .get(name)
        .ok_or_else(|| PluginError::UnknownComponent {
            kind: kind.to_string(),
            name: name.to_string(),
        })
}

/// How to launch one discovered component.
#[derive(Clone)]
struct Launch {
    path: PathBuf,
    args: Vec<String>,
    min_port: u16,
    max_port: u16,
    coordinator: Arc<ShutdownCoordinator>,
}

impl Launch {
    fn client(&self) -> Arc<PluginClient> {
        let config = PluginClientConfig::new(&self.path)
            .args(self.args.iter().cloned())
            .managed(true)
            .port_range(self.min_port, self.max_port);
        PluginClient::new(config, self.coordinator.clone())
    }
}

/// Where and how to look for plugins.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub known_plugin_folders: Vec<PathBuf>,
    pub min_port: u16,
    pub max_port: u16,
    coordinator: Arc<ShutdownCoordinator>,
}

impl Discovery {
    /// Discovery with `~/.buildplug.d/plugins` as the known plugin folder.
    pub fn new(coordinator: Arc<ShutdownCoordinator>) -> Self {
        let known_plugin_folders = home_dir()
            .map(|home| vec![home.join(".buildplug.d").join("plugins")])
            .unwrap_or_default();
        Self {
            known_plugin_folders,
            min_port: DEFAULT_MIN_PORT,
            max_port: DEFAULT_MAX_PORT,
            coordinator,
        }
    }

    pub fn known_plugin_folders(mut self, folders: Vec<PathBuf>) -> Self {
        self.known_plugin_folders = folders;
        self
    }

    pub fn port_range(mut self, min: u16, max: u16) -> Self {
        self.min_port = min;
        self.max_port = max;
        self
    }

    /// Search every plugin location and register what is found.
    ///
    /// Does nothing inside a plugin process.
    pub async fn discover(&self, registry: &mut ComponentRegistry) -> Result<()> {
        if is_plugin_process() {
            debug!("running as a plugin, skipping discovery");
            return Ok(());
        }

        let mut dirs = Vec::new();
        match std::env::current_exe() {
            Ok(exe) => dirs.extend(exe.parent().map(Path::to_path_buf)),
            Err(e) => warn!(error = %e, "cannot locate current executable"),
        }
        dirs.extend(self.known_plugin_folders.iter().cloned());
        dirs.push(std::env::current_dir()?);
        if let Some(paths) = std::env::var_os(PLUGIN_PATH_KEY) {
            dirs.extend(std::env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()));
        }

        for dir in dirs {
            self.discover_dir(&dir, registry).await?;
        }
        Ok(())
    }

    /// Register every plugin binary in `dir`.
    pub async fn discover_dir(&self, dir: &Path, registry: &mut ComponentRegistry) -> Result<()> {
        let dir = std::path::absolute(dir)?;

        let singles = [
            (ComponentKind::Builder, "buildplug-builder-"),
            (ComponentKind::Provisioner, "buildplug-provisioner-"),
            (ComponentKind::PostProcessor, "buildplug-post-processor-"),
        ];
        for (kind, prefix) in singles {
            let found = find_binaries(&dir, prefix)?;
            if !found.is_empty() {
                info!(kind = %kind, names = ?found.keys().collect::<Vec<_>>(), "using external plugins");
            }
            for (name, path) in found {
                registry.register_plugin(kind, name, self.launch(path, Vec::new()));
            }
        }

        for (name, path) in find_binaries(&dir, MULTI_PLUGIN_PREFIX)? {
            self.discover_multi_plugin(&name, &path, registry).await?;
        }
        Ok(())
    }

    /// Ask a multi-component binary to describe itself and register each
    /// component as `<plugin>-<component>`, or `<plugin>` for the default one.
    pub async fn discover_multi_plugin(
        &self,
        plugin_name: &str,
        path: &Path,
        registry: &mut ComponentRegistry,
    ) -> Result<()> {
        let description = describe(path).await?;
        let version: ApiVersion = description.api_version.parse()?;
        version.check().map_err(|e| {
            PluginError::Discovery(format!("{}: {e}", path.display()))
        })?;

        for kind in ComponentKind::ALL {
            let names = description.names(kind);
            if !names.is_empty() {
                info!(plugin = plugin_name, kind = %kind, ?names, "found external components");
            }
            for component in names {
                let key = if component == DEFAULT_COMPONENT {
                    plugin_name.to_string()
                } else {
                    format!("{plugin_name}-{component}")
                };
                let args = vec!["start".to_string(), kind.to_string(), component.clone()];
                registry.register_plugin(kind, key, self.launch(path.to_path_buf(), args));
            }
        }
        Ok(())
    }

    fn launch(&self, path: PathBuf, args: Vec<String>) -> Launch {
        Launch {
            path,
            args,
            min_port: self.min_port,
            max_port: self.max_port,
            coordinator: self.coordinator.clone(),
        }
    }
}

/// Run `<path> describe` and parse its output.
pub async fn describe(path: &Path) -> Result<SetDescription> {
    let output = Command::new(path)
        .arg("describe")
        .output()
        .await
        .map_err(|source| PluginError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(PluginError::Discovery(format!(
            "{} describe failed ({}): {}",
            path.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    serde_json::from_slice(&output.stdout).map_err(|e| {
        PluginError::Discovery(format!("{}: invalid describe output: {e}", path.display()))
    })
}

/// Files in `dir` named `<prefix><name>`, keyed by name.
fn find_binaries(dir: &Path, prefix: &str) -> Result<BTreeMap<String, PathBuf>> {
    let pattern = format!(
        "{}{}{prefix}*",
        glob::Pattern::escape(&dir.to_string_lossy()),
        std::path::MAIN_SEPARATOR
    );
    let matches = glob::glob(&pattern).map_err(|e| PluginError::Discovery(e.to_string()))?;

    let mut found = BTreeMap::new();
    for path in matches.flatten() {
        if path.is_dir() {
            continue;
        }
        let Some(file) = path.file_name().map(|f| f.to_string_lossy().into_owned()) else {
            continue;
        };
        if cfg!(windows) && !file.to_ascii_lowercase().ends_with(".exe") {
            debug!(path = %path.display(), "ignoring plugin match without exe extension");
            continue;
        }
        let stem = file.strip_suffix(".exe").unwrap_or(&file);
        let Some(name) = stem.strip_prefix(prefix).filter(|n| !n.is_empty()) else {
            continue;
        };
        debug!(name, path = %path.display(), "discovered plugin");
        found.insert(name.to_string(), path);
    }
    Ok(found)
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}
