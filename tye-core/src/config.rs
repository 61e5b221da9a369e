use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ingress::{IngressDescription, IngressRoutes, IngressRule};
use crate::model::{Binding, ConfigEntry, RunInfo, ServiceDescription};
use crate::service::Application;

const CONFIG_NAMES: [&str; 2] = ["tye.yaml", "tye.yml"];
const MAX_NAME_LEN: usize = 63;

/// Either `args: "--a --b"` or `args: ["--a", "--b"]`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Args {
    Line(String),
    List(Vec<String>),
}

impl Default for Args {
    fn default() -> Self {
        Args::List(Vec::new())
    }
}

impl Args {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Args::Line(s) => s.split_whitespace().map(String::from).collect(),
            Args::List(v) => v.clone(),
        }
    }
}

/// Service definition in the config file
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,

    /// Executable to spawn directly
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Working directory for `executable`
    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Path to a cargo project (directory or Cargo.toml)
    #[serde(default)]
    pub project: Option<PathBuf>,

    /// Build the project before each launch
    #[serde(default = "default_true")]
    pub build: bool,

    /// Container image
    #[serde(default)]
    pub image: Option<String>,

    /// Not launched; bindings only feed discovery
    #[serde(default)]
    pub external: bool,

    #[serde(default)]
    pub args: Args,

    #[serde(default = "default_replicas")]
    pub replicas: usize,

    #[serde(default)]
    pub bindings: Vec<Binding>,

    #[serde(default)]
    pub env: Vec<ConfigEntry>,
}

fn default_true() -> bool {
    true
}

fn default_replicas() -> usize {
    1
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IngressConfig {
    pub name: String,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub rules: Vec<IngressRule>,
}

/// Root configuration file structure
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TyeConfig {
    /// Application name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default)]
    pub ingress: Vec<IngressConfig>,
}

/// A service name must be lowercase alphanumeric or `-`, at most 63 chars.
pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

impl TyeConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a string (useful for testing)
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: TyeConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// `TYE_CONFIG` first, then `tye.yaml`/`tye.yml` in `start` and its parents.
    pub fn discover(start: &Path) -> Result<(PathBuf, Self), ConfigError> {
        let mut searched = Vec::new();

        if let Ok(env_path) = std::env::var("TYE_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok((path.clone(), Self::load(&path)?));
            }
            searched.push(path);
        }

        if start.is_file() {
            return Ok((start.to_path_buf(), Self::load(start)?));
        }

        let mut dir = Some(start);
        while let Some(current) = dir {
            for name in &CONFIG_NAMES {
                let path = current.join(name);
                if path.exists() {
                    return Ok((path.clone(), Self::load(&path)?));
                }
                searched.push(path);
            }
            dir = current.parent();
        }

        Err(ConfigError::NotFound { searched })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = BTreeSet::new();
        let mut ports: BTreeMap<u16, String> = BTreeMap::new();

        for svc in &self.services {
            if !is_valid_service_name(&svc.name) {
                return Err(ConfigError::InvalidServiceName {
                    name: svc.name.clone(),
                });
            }
            if !names.insert(svc.name.as_str()) {
                return Err(ConfigError::DuplicateService {
                    name: svc.name.clone(),
                });
            }

            let kinds = [
                svc.executable.is_some(),
                svc.project.is_some(),
                svc.image.is_some(),
                svc.external,
            ];
            if kinds.iter().filter(|k| **k).count() != 1 {
                return Err(ConfigError::MissingRunInfo {
                    service: svc.name.clone(),
                });
            }
            if svc.replicas == 0 {
                return Err(ConfigError::NoReplicas {
                    service: svc.name.clone(),
                });
            }

            check_bindings(&svc.name, &svc.bindings, &mut ports)?;
        }

        for ingress in &self.ingress {
            check_bindings(&ingress.name, &ingress.bindings, &mut ports)?;
            for rule in &ingress.rules {
                if !names.contains(rule.service.as_str()) {
                    return Err(ConfigError::UnknownIngressService {
                        ingress: ingress.name.clone(),
                        service: rule.service.clone(),
                    });
                }
            }
            IngressRoutes::compile(&IngressDescription {
                name: ingress.name.clone(),
                bindings: ingress.bindings.clone(),
                rules: ingress.rules.clone(),
            })?;
        }

        Ok(())
    }

    /// Build the runtime graph. Relative paths resolve against `context_dir`,
    /// which is made absolute first so replicas can change directory freely.
    pub fn to_application(&self, context_dir: &Path) -> Application {
        let context_dir = std::path::absolute(context_dir).unwrap_or_else(|_| context_dir.to_path_buf());
        let context_dir = context_dir.as_path();
        let services = self
            .services
            .iter()
            .map(|svc| {
                let run_info = if let Some(exe) = &svc.executable {
                    RunInfo::Process {
                        executable: resolve_executable(context_dir, exe),
                        working_dir: svc
                            .working_directory
                            .as_ref()
                            .map(|d| context_dir.join(d)),
                        args: svc.args.to_vec(),
                    }
                } else if let Some(project) = &svc.project {
                    RunInfo::Project {
                        project_path: context_dir.join(project),
                        args: svc.args.to_vec(),
                        build: svc.build,
                    }
                } else if let Some(image) = &svc.image {
                    RunInfo::Container {
                        image: image.clone(),
                        args: svc.args.to_vec(),
                    }
                } else {
                    RunInfo::External
                };

                ServiceDescription {
                    name: svc.name.clone(),
                    run_info,
                    replicas: svc.replicas,
                    bindings: svc.bindings.clone(),
                    configuration: svc.env.clone(),
                }
            })
            .collect();

        let ingress = self
            .ingress
            .iter()
            .map(|i| IngressDescription {
                name: i.name.clone(),
                bindings: i.bindings.clone(),
                rules: i.rules.clone(),
            })
            .collect();

        let name = self.name.clone().unwrap_or_else(|| {
            context_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "app".into())
        });

        Application::new(name, context_dir, services, ingress)
    }
}

fn check_bindings(
    owner: &str,
    bindings: &[Binding],
    ports: &mut BTreeMap<u16, String>,
) -> Result<(), ConfigError> {
    let mut binding_names = BTreeSet::new();
    for binding in bindings {
        let key = binding.name.clone().unwrap_or_default();
        if !binding_names.insert(key.clone()) {
            return Err(ConfigError::DuplicateBindingName {
                service: owner.to_string(),
                binding: if key.is_empty() { "<default>".into() } else { key },
            });
        }
        if let Some(port) = binding.port {
            if let Some(first) = ports.insert(port, owner.to_string()) {
                return Err(ConfigError::DuplicatePort {
                    port,
                    first,
                    second: owner.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Bare names (`node`) are left for `PATH` lookup; anything with a
/// separator resolves against the config directory.
fn resolve_executable(context_dir: &Path, exe: &Path) -> PathBuf {
    if exe.is_absolute() || exe.components().count() == 1 {
        exe.to_path_buf()
    } else {
        context_dir.join(exe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServiceType;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
name: shop
services:
  - name: api
    executable: ./bin/api
    args: --verbose --fast
    replicas: 3
    bindings:
      - port: 8000
  - name: web
    project: web/Cargo.toml
    build: false
  - name: redis
    image: redis:7
    bindings:
      - port: 6379
        containerPort: 6379
        protocol: tcp
  - name: db
    external: true
    bindings:
      - connectionString: Server=localhost
ingress:
  - name: ingress
    bindings:
      - port: 8080
    rules:
      - path: /api
        service: api
      - host: "*.example.com"
        service: web
        preservePath: true
"#;
        let config = TyeConfig::from_str(yaml).unwrap();
        assert_eq!(config.services.len(), 4);

        let app = config.to_application(Path::new("/work"));
        assert_eq!(app.name(), "shop");
        let api = app.service("api").unwrap().description();
        assert_eq!(api.replicas, 3);
        match &api.run_info {
            RunInfo::Process { executable, args, .. } => {
                assert_eq!(executable, &PathBuf::from("/work/./bin/api"));
                assert_eq!(args, &vec!["--verbose".to_string(), "--fast".to_string()]);
            }
            other => panic!("unexpected run info {:?}", other),
        }
        assert_eq!(
            app.service("web").unwrap().service_type(),
            ServiceType::Project
        );
        assert_eq!(
            app.service("redis").unwrap().description().bindings[0].container_port,
            Some(6379)
        );
        assert_eq!(app.ingress()[0].rules.len(), 2);
        assert!(app.ingress()[0].rules[1].preserve_path);
    }

    #[test]
    fn test_invalid_service_name() {
        let yaml = r#"
services:
  - name: My_Api
    executable: api
"#;
        assert!(matches!(
            TyeConfig::from_str(yaml),
            Err(ConfigError::InvalidServiceName { .. })
        ));
        assert!(!is_valid_service_name(&"a".repeat(64)));
        assert!(is_valid_service_name("order-api-2"));
    }

    #[test]
    fn test_duplicate_ports_across_services() {
        let yaml = r#"
services:
  - name: a
    executable: a
    bindings:
      - port: 8000
  - name: b
    executable: b
    bindings:
      - port: 8000
"#;
        let err = TyeConfig::from_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePort { port: 8000, .. }));
        assert_eq!(err.to_string(), "port 8000 is bound by both 'a' and 'b'");
    }

    #[test]
    fn test_duplicate_binding_names() {
        let yaml = r#"
services:
  - name: a
    executable: a
    bindings:
      - port: 8000
      - port: 8001
"#;
        assert!(matches!(
            TyeConfig::from_str(yaml),
            Err(ConfigError::DuplicateBindingName { .. })
        ));
    }

    #[test]
    fn test_ingress_unknown_service() {
        let yaml = r#"
services:
  - name: a
    executable: a
ingress:
  - name: ingress
    bindings:
      - port: 8080
    rules:
      - path: /b
        service: b
"#;
        assert!(matches!(
            TyeConfig::from_str(yaml),
            Err(ConfigError::UnknownIngressService { .. })
        ));
    }

    #[test]
    fn test_ingress_bad_host_pattern() {
        let yaml = r#"
services:
  - name: a
    executable: a
ingress:
  - name: ingress
    rules:
      - host: "a.*.com"
        service: a
"#;
        assert!(matches!(
            TyeConfig::from_str(yaml),
            Err(ConfigError::InvalidHostPattern { .. })
        ));
    }

    #[test]
    fn test_missing_or_ambiguous_run_info() {
        let yaml = r#"
services:
  - name: a
"#;
        assert!(matches!(
            TyeConfig::from_str(yaml),
            Err(ConfigError::MissingRunInfo { .. })
        ));

        let yaml = r#"
services:
  - name: a
    executable: a
    image: nginx
"#;
        assert!(matches!(
            TyeConfig::from_str(yaml),
            Err(ConfigError::MissingRunInfo { .. })
        ));
    }

    #[test]
    fn test_discover_walks_parents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("tye.yaml"),
            "services:\n  - name: a\n    executable: a\n",
        )
        .unwrap();
        let nested = dir.path().join("src/bin");
        std::fs::create_dir_all(&nested).unwrap();

        let (path, config) = TyeConfig::discover(&nested).unwrap();
        assert_eq!(path, dir.path().join("tye.yaml"));
        assert_eq!(config.services[0].name, "a");
    }

    #[test]
    fn test_relative_context_dir_resolves_to_absolute_paths() {
        let yaml = r#"
services:
  - name: server
    executable: ./bin/server
  - name: node
    executable: node
  - name: api
    project: api/Cargo.toml
"#;
        let app = TyeConfig::from_str(yaml).unwrap().to_application(Path::new("sub"));
        assert!(app.context_dir().is_absolute());
        assert!(app.context_dir().ends_with("sub"));
        assert_eq!(app.name(), "sub");

        match &app.service("server").unwrap().description().run_info {
            RunInfo::Process { executable, .. } => {
                assert!(executable.is_absolute());
                assert!(executable.ends_with("sub/bin/server"));
            }
            other => panic!("unexpected run info {:?}", other),
        }
        match &app.service("node").unwrap().description().run_info {
            RunInfo::Process { executable, .. } => assert_eq!(executable, Path::new("node")),
            other => panic!("unexpected run info {:?}", other),
        }
        match &app.service("api").unwrap().description().run_info {
            RunInfo::Project { project_path, .. } => {
                assert!(project_path.is_absolute());
                assert!(project_path.ends_with("sub/api/Cargo.toml"));
            }
            other => panic!("unexpected run info {:?}", other),
        }
    }
}
