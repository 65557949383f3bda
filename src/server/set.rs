//! Multi-component plugin binaries.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Component, ComponentKind, PluginServer};
use crate::component::{Builder, Datasource, PostProcessor, Provisioner};
use crate::error::{PluginError, Result};
use crate::handshake::{write_stdout_json, ApiVersion};

/// Component name that maps to the bare plugin name during discovery.
pub const DEFAULT_COMPONENT: &str = "default";

const USAGE: &str = "describe | start <builder|provisioner|post-processor|datasource> <name>";

/// What `<binary> describe` prints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDescription {
    pub version: String,
    pub sdk_version: String,
    /// `x<major>.<minor>`.
    pub api_version: String,
    #[serde(default)]
    pub builders: Vec<String>,
    #[serde(default)]
    pub post_processors: Vec<String>,
    #[serde(default)]
    pub provisioners: Vec<String>,
    #[serde(default)]
    pub datasources: Vec<String>,
}

impl SetDescription {
    pub fn names(&self, kind: ComponentKind) -> &[String] {
        match kind {
            ComponentKind::Builder => &self.builders,
            ComponentKind::Provisioner => &self.provisioners,
            ComponentKind::PostProcessor => &self.post_processors,
            ComponentKind::Datasource => &self.datasources,
        }
    }
}

/// Named components served by one plugin binary.
///
/// # Example
///
/// ```ignore
/// let mut set = PluginSet::new("1.2.0");
/// set.register_builder(DEFAULT_COMPONENT, Arc::new(MyBuilder::default()));
/// set.register_provisioner("shell", Arc::new(Shell::default()));
/// let args: Vec<String> = std::env::args().skip(1).collect();
/// set.run(&args).await?;
/// ```
#[derive(Default)]
pub struct PluginSet {
    version: String,
    builders: BTreeMap<String, Arc<dyn Builder>>,
    provisioners: BTreeMap<String, Arc<dyn Provisioner>>,
    post_processors: BTreeMap<String, Arc<dyn PostProcessor>>,
    datasources: BTreeMap<String, Arc<dyn Datasource>>,
}

impl PluginSet {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Self::default()
        }
    }

    pub fn register_builder(&mut self, name: &str, builder: Arc<dyn Builder>) -> &mut Self {
        self.builders.insert(name.to_string(), builder);
        self
    }

    pub fn register_provisioner(&mut self, name: &str, provisioner: Arc<dyn Provisioner>) -> &mut Self {
        self.provisioners.insert(name.to_string(), provisioner);
        self
    }

    pub fn register_post_processor(
        &mut self,
        name: &str,
        post_processor: Arc<dyn PostProcessor>,
    ) -> &mut Self {
        self.post_processors.insert(name.to_string(), post_processor);
        self
    }

    pub fn register_datasource(&mut self, name: &str, datasource: Arc<dyn Datasource>) -> &mut Self {
        self.datasources.insert(name.to_string(), datasource);
        self
    }

    pub fn description(&self) -> SetDescription {
        SetDescription {
            version: self.version.clone(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            api_version: ApiVersion::CURRENT.to_string(),
            builders: self.builders.keys().cloned().collect(),
            post_processors: self.post_processors.keys().cloned().collect(),
            provisioners: self.provisioners.keys().cloned().collect(),
            datasources: self.datasources.keys().cloned().collect(),
        }
    }

    /// Look up a registered component.
    pub fn component(&self, kind: ComponentKind, name: &str) -> Result<Component> {
        let found = match kind {
            ComponentKind::Builder => self.builders.get(name).cloned().map(Component::Builder),
            ComponentKind::Provisioner => self
                .provisioners
                .get(name)
                .cloned()
                .map(Component::Provisioner),
            ComponentKind::PostProcessor => self
                .post_processors
                .get(name)
                .cloned()
                .map(Component::PostProcessor),
            ComponentKind::Datasource => self
                .datasources
                .get(name)
                .cloned()
                .map(Component::Datasource),
        };
        found.ok_or_else(|| PluginError::UnknownComponent {
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }

    /// Handle the plugin command line (arguments after the program name).
    ///
    /// - `describe` prints the [`SetDescription`] as JSON
    /// - `start <kind> <name>` serves that component until the orchestrator
    ///   disconnects
    pub async fn run(&self, args: &[String]) -> Result<()> {
        match args {
            [cmd] if cmd == "describe" => write_stdout_json(&self.description()),
            [cmd, kind, name] if cmd == "start" => {
                let component = self.component(kind.parse()?, name)?;
                PluginServer::from_env()?.serve(component).await
            }
            _ => Err(PluginError::Usage(USAGE.to_string())),
        }
    }
}
